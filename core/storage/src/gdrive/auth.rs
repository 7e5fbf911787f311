//! OAuth2 authentication and token management for Google Drive.

use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};
use url::Url;

use cloudsave_common::{Error, Result};

/// OAuth2 client ID for Google Drive API.
const GOOGLE_CLIENT_ID: &str = "YOUR_CLIENT_ID";
/// OAuth2 client secret (note: in production, this should be securely managed).
const GOOGLE_CLIENT_SECRET: &str = "YOUR_CLIENT_SECRET";
/// OAuth2 authorization endpoint.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
/// OAuth2 token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Redirect URL for OAuth2 flow (localhost for desktop apps).
const REDIRECT_URL: &str = "http://localhost:8080/callback";

/// Google Drive OAuth2 scopes.
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Subdirectory of the tokens directory owned by this backend.
const TOKEN_SUBDIR: &str = "google";
const TOKEN_FILE: &str = "tokens.json";

type GoogleClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// OAuth2 tokens with expiration tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    /// Access token for API requests.
    pub access_token: String,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: String,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at < Utc::now() + Duration::minutes(5)
    }
}

/// Configuration for OAuth2 authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Client ID (can be overridden from default).
    pub client_id: String,
    /// Client secret (can be overridden from default).
    pub client_secret: String,
    /// Redirect URL for OAuth2 callback.
    pub redirect_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: GOOGLE_CLIENT_ID.to_string(),
            client_secret: GOOGLE_CLIENT_SECRET.to_string(),
            redirect_url: REDIRECT_URL.to_string(),
        }
    }
}

/// OAuth2 authentication manager for Google Drive.
pub struct AuthManager {
    client: GoogleClient,
    http: oauth2::reqwest::Client,
    config: AuthConfig,
}

impl AuthManager {
    /// Create a new authentication manager.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(GOOGLE_AUTH_URL.to_string())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );

        let http = oauth2::reqwest::Client::builder()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            config,
        })
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(AuthConfig::default())
    }

    /// Generate the authorization URL for the user to visit.
    ///
    /// Returns the URL and a CSRF token that should be verified on callback.
    pub fn authorization_url(&self) -> (String, String) {
        let (auth_url, csrf_token) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(DRIVE_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();

        (auth_url.to_string(), csrf_token.secret().clone())
    }

    /// Extract the authorization code from the URL the browser was
    /// redirected to.
    ///
    /// # Errors
    /// - `InvalidInput` if the URL cannot be parsed or carries no code
    /// - `Authentication` if the provider reported an error or the state
    ///   does not match `expected_state`
    pub fn code_from_redirect(redirect: &str, expected_state: &str) -> Result<String> {
        let url = Url::parse(redirect.trim())
            .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?;

        let mut code = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => {
                    return Err(Error::Authentication(format!(
                        "Authorization was denied: {}",
                        value
                    )))
                }
                _ => {}
            }
        }

        if state.as_deref() != Some(expected_state) {
            return Err(Error::Authentication(
                "Authorization state mismatch".to_string(),
            ));
        }

        code.ok_or_else(|| Error::InvalidInput("Redirect URL has no authorization code".to_string()))
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Preconditions
    /// - `code` is a valid authorization code from the OAuth2 callback
    ///
    /// # Postconditions
    /// - Returns access and refresh tokens
    ///
    /// # Errors
    /// - Invalid authorization code
    /// - Network errors
    pub async fn exchange_code(&self, code: &str) -> Result<Tokens> {
        let token_result = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token exchange failed: {}", e)))?;

        let access_token = token_result.access_token().secret().clone();
        let refresh_token = token_result
            .refresh_token()
            .ok_or_else(|| {
                Error::Authentication("No refresh token received. Ensure 'offline' access and 'consent' prompt were requested.".to_string())
            })?
            .secret()
            .clone();

        Ok(Tokens {
            access_token,
            refresh_token,
            expires_at: expiry(token_result.expires_in()),
        })
    }

    /// Refresh an access token using the refresh token.
    ///
    /// # Errors
    /// - Invalid or revoked refresh token
    /// - Network errors
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Tokens> {
        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token refresh failed: {}", e)))?;

        let access_token = token_result.access_token().secret().clone();

        // Refresh tokens may or may not be returned in refresh response
        let new_refresh_token = token_result
            .refresh_token()
            .map(|t| t.secret().clone())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(Tokens {
            access_token,
            refresh_token: new_refresh_token,
            expires_at: expiry(token_result.expires_in()),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

fn expiry(expires_in: Option<std::time::Duration>) -> DateTime<Utc> {
    let expires_in = expires_in.unwrap_or_else(|| std::time::Duration::from_secs(3600));
    Utc::now() + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1))
}

/// Persisted OAuth tokens under `<tokens_dir>/google/tokens.json`.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    /// Create a store below the shared tokens directory.
    pub fn new(tokens_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: tokens_dir.as_ref().join(TOKEN_SUBDIR),
        }
    }

    /// Directory owned by this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the tokens file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(TOKEN_FILE)
    }

    /// Load stored tokens. A missing file yields `None`.
    pub async fn load(&self) -> Result<Option<Tokens>> {
        let data = match fs::read(self.path()).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Persist tokens, replacing any previous ones.
    pub async fn save(&self, tokens: &Tokens) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec_pretty(tokens)?;
        let staging = self.dir.join(format!("{}.tmp", TOKEN_FILE));
        fs::write(&staging, json).await?;
        fs::rename(&staging, self.path()).await?;

        Ok(())
    }

    /// Delete the store directory. A missing directory is not an error.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Token manager that automatically refreshes expired tokens.
pub struct TokenManager {
    auth_manager: std::sync::Arc<AuthManager>,
    tokens: tokio::sync::RwLock<Tokens>,
    store: Option<TokenStore>,
}

impl TokenManager {
    /// Create a new token manager with initial tokens.
    pub fn new(auth_manager: std::sync::Arc<AuthManager>, tokens: Tokens) -> Self {
        Self {
            auth_manager,
            tokens: tokio::sync::RwLock::new(tokens),
            store: None,
        }
    }

    /// Persist refreshed tokens to `store`.
    pub fn with_store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Postconditions
    /// - Returns a valid (non-expired) access token
    ///
    /// # Errors
    /// - Token refresh failed
    pub async fn get_access_token(&self) -> Result<String> {
        let tokens = self.tokens.read().await;

        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }

        drop(tokens);

        let mut tokens = self.tokens.write().await;

        // Double-check after acquiring write lock
        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }

        info!("Refreshing expired access token");

        let new_tokens = self
            .auth_manager
            .refresh_token(&tokens.refresh_token)
            .await?;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&new_tokens).await {
                warn!("Failed to persist refreshed tokens: {}", e);
            }
        }

        *tokens = new_tokens;

        Ok(tokens.access_token.clone())
    }

    /// Get the current tokens.
    pub async fn get_tokens(&self) -> Tokens {
        self.tokens.read().await.clone()
    }
}
