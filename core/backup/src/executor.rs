//! Serialized execution context.
//!
//! Every read or write of the backed-up directory happens on one worker task
//! that runs jobs strictly one after another. The scheduler never touches
//! the directory itself; it only enqueues jobs here.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use cloudsave_common::{Error, Result};

/// Unit of work run on the execution context.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub(crate) enum Message {
    Job {
        job: Job,
        /// Completion signal; `true` unless the job panicked.
        done: Option<oneshot::Sender<bool>>,
    },
    Close,
}

/// Cloneable handle for enqueuing jobs onto the serialized worker.
#[derive(Clone)]
pub struct ExecutionContext {
    tx: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ExecutionContext {
    /// A context whose messages land in the returned receiver instead of a
    /// worker.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (context, rx)
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ExecutorClosed);
        }
        self.tx.send(message).map_err(|_| Error::ExecutorClosed)
    }

    /// Enqueue `job` and return immediately.
    ///
    /// # Errors
    /// - `ExecutorClosed` if the context was shut down or its worker is gone
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.send(Message::Job {
            job: Box::pin(job),
            done: None,
        })
    }

    /// Enqueue `job` and wait until it has run.
    ///
    /// # Errors
    /// - `ExecutorClosed` if the context was shut down or its worker is gone
    /// - `JobPanicked` if the job panicked
    pub async fn run<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Message::Job {
            job: Box::pin(job),
            done: Some(done_tx),
        })?;

        match done_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::JobPanicked),
            Err(_) => Err(Error::ExecutorClosed),
        }
    }

    /// Stop accepting jobs. Jobs queued before the call still run, then the
    /// worker exits.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close);
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Spawns the serialized worker.
pub struct SerialExecutor;

impl SerialExecutor {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// The worker exits after [`ExecutionContext::shutdown`] or once every
    /// context handle has been dropped.
    pub fn spawn() -> (ExecutionContext, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = ExecutionContext {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        let worker = tokio::spawn(work(rx));
        (context, worker)
    }
}

async fn work(mut rx: mpsc::UnboundedReceiver<Message>) {
    debug!("Execution context started");

    while let Some(message) = rx.recv().await {
        match message {
            Message::Job { job, done } => {
                let completed = AssertUnwindSafe(job).catch_unwind().await.is_ok();
                if !completed {
                    error!("A job panicked on the execution context");
                }
                if let Some(done) = done {
                    let _ = done.send(completed);
                }
            }
            Message::Close => break,
        }
    }

    debug!("Execution context stopped");
}
