//! Provider registry with a one-way lock.
//!
//! Providers are contributed by independently loaded plugins while the host
//! starts up. Once startup is over the registry is locked and every further
//! registration fails, so no backend can be swapped under a running backup.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use cloudsave_common::{Error, ProviderName, Result};

use crate::provider::StorageProvider;

/// A registered provider together with its origin.
#[derive(Clone)]
pub struct ProviderRegistration {
    name: ProviderName,
    provider: Arc<dyn StorageProvider>,
    source_id: String,
}

impl ProviderRegistration {
    /// Normalized provider name.
    pub fn name(&self) -> &ProviderName {
        &self.name
    }

    /// The provider instance.
    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    /// Identifier of the plugin that registered the provider.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

impl fmt::Debug for ProviderRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistration")
            .field("name", &self.name)
            .field("provider", &self.provider.provider_name())
            .field("source_id", &self.source_id)
            .finish()
    }
}

/// Registry of storage provider instances.
///
/// Names are case- and whitespace-insensitive (see [`ProviderName`]).
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    /// Lookup key -> registration.
    providers: BTreeMap<String, ProviderRegistration>,
    locked: bool,
}

impl ProviderRegistry {
    /// Create a new empty, unlocked registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider instance.
    ///
    /// # Preconditions
    /// - Registry is not locked
    /// - `name` is not blank and not already registered
    ///
    /// # Postconditions
    /// - Provider can be looked up by any spelling of `name`
    /// - `source_id` is recorded for diagnostics
    ///
    /// # Errors
    /// - `RegistryLocked` if [`lock`](Self::lock) was called
    /// - `EmptyProviderName` if `name` is blank or only underscores
    /// - `DuplicateProvider` naming the first registrant's source
    pub fn register(
        &mut self,
        name: &str,
        provider: Arc<dyn StorageProvider>,
        source_id: impl Into<String>,
    ) -> Result<&mut Self> {
        if self.locked {
            return Err(Error::RegistryLocked);
        }

        let name = ProviderName::new(name)?;
        let key = name.lookup_key();

        if let Some(existing) = self.providers.get(&key) {
            return Err(Error::DuplicateProvider {
                name: name.to_string(),
                source_id: existing.source_id.clone(),
            });
        }

        let source_id = source_id.into();
        info!("'{}' has registered storage provider '{}'", source_id, name);

        self.providers.insert(
            key,
            ProviderRegistration {
                name,
                provider,
                source_id,
            },
        );

        Ok(self)
    }

    /// Lock the registry, rejecting all further registrations.
    ///
    /// Calling this more than once is a no-op.
    pub fn lock(&mut self) {
        if self.locked {
            return;
        }
        self.locked = true;

        let count = self.providers.len();
        info!(
            "Provider registry locked with {} registered {}",
            count,
            if count == 1 { "provider" } else { "providers" }
        );
        for registration in self.providers.values() {
            info!(
                "- {} ({}, from '{}')",
                registration.name,
                registration.provider.provider_name(),
                registration.source_id
            );
        }
    }

    /// Whether the registry has been locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn registration_for(&self, name: &str) -> Option<&ProviderRegistration> {
        let name = ProviderName::normalize(name)?;
        self.providers.get(&name.lookup_key())
    }

    /// Get the registration for `name`, if any.
    pub fn registration(&self, name: &str) -> Option<&ProviderRegistration> {
        self.registration_for(name)
    }

    /// Look up a provider by name. Blank names yield `None`.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn StorageProvider>> {
        self.registration_for(name).map(|r| r.provider.clone())
    }

    /// Check if a provider is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.registration_for(name).is_some()
    }

    /// Identifier of the plugin that registered `name`.
    pub fn source_of(&self, name: &str) -> Option<&str> {
        self.registration_for(name).map(|r| r.source_id.as_str())
    }

    /// All registered (normalized) names.
    pub fn all_names(&self) -> BTreeSet<String> {
        self.providers.values().map(|r| r.name.to_string()).collect()
    }

    /// All providers keyed by normalized name.
    pub fn all_providers(&self) -> BTreeMap<String, Arc<dyn StorageProvider>> {
        self.providers
            .values()
            .map(|r| (r.name.to_string(), r.provider.clone()))
            .collect()
    }

    /// Iterate over registrations in name order.
    pub fn registrations(&self) -> impl Iterator<Item = &ProviderRegistration> {
        self.providers.values()
    }

    /// Number of registered providers.
    pub fn count(&self) -> usize {
        self.providers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    fn memory() -> Arc<dyn StorageProvider> {
        Arc::new(MemoryProvider::new())
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ProviderRegistry::new();
        let provider = memory();

        registry.register("Drop Box", provider.clone(), "modA").unwrap();

        let found = registry.lookup("drop box").unwrap();
        assert!(Arc::ptr_eq(&found, &provider));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_name_insensitivity() {
        let mut registry = ProviderRegistry::new();
        registry.register("Drop Box", memory(), "modA").unwrap();

        assert!(registry.is_registered("dropbox"));
        assert!(registry.is_registered("  Drop_Box "));
        assert!(registry.is_registered("DROP BOX"));
        assert_eq!(
            registry.all_names().into_iter().collect::<Vec<_>>(),
            vec!["drop_box".to_string()]
        );
    }

    #[test]
    fn test_chained_registration() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("a", memory(), "plugin")
            .unwrap()
            .register("b", memory(), "plugin")
            .unwrap();

        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProviderRegistry::new();
        registry.register("Drop Box", memory(), "modA").unwrap();

        let err = registry.register("drop_box", memory(), "modB").unwrap_err();
        assert!(err.to_string().contains("modA"));
        assert!(matches!(
            err,
            Error::DuplicateProvider { ref name, ref source_id } if name == "drop_box" && source_id == "modA"
        ));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.source_of("drop box"), Some("modA"));
    }

    #[test]
    fn test_empty_name_fails() {
        let mut registry = ProviderRegistry::new();

        assert!(matches!(
            registry.register("   ", memory(), "modA"),
            Err(Error::EmptyProviderName)
        ));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_underscore_only_names_fail() {
        let mut registry = ProviderRegistry::new();

        for name in ["___", "_", " _ "] {
            assert!(matches!(
                registry.register(name, memory(), "modA"),
                Err(Error::EmptyProviderName)
            ));
        }
        assert_eq!(registry.count(), 0);
        assert!(registry.lookup("_").is_none());
    }

    #[test]
    fn test_register_after_lock_fails() {
        let mut registry = ProviderRegistry::new();
        registry.register("alpha", memory(), "core").unwrap();
        registry.lock();

        let result = registry.register("beta", memory(), "late-plugin");
        assert!(matches!(result, Err(Error::RegistryLocked)));
        assert_eq!(registry.count(), 1);
        assert!(!registry.is_registered("beta"));
    }

    #[test]
    fn test_lock_is_idempotent() {
        let mut registry = ProviderRegistry::new();
        registry.lock();
        registry.lock();
        assert!(registry.is_locked());
    }

    #[test]
    fn test_lookup_blank_returns_none() {
        let mut registry = ProviderRegistry::new();
        registry.register("alpha", memory(), "core").unwrap();

        assert!(registry.lookup("").is_none());
        assert!(registry.lookup("  ").is_none());
        assert!(registry.source_of("").is_none());
        assert!(registry.lookup("unknown").is_none());
    }

    #[test]
    fn test_all_providers() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("Beta", memory(), "core")
            .unwrap()
            .register("alpha", memory(), "core")
            .unwrap();

        let providers = registry.all_providers();
        let names: Vec<_> = providers.keys().cloned().collect();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    }
}
