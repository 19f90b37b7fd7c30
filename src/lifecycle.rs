//! Process lifecycle: signal handling and ordered shutdown.
//!
//! Resources register in acquisition order and close in reverse. Every
//! closer runs even when an earlier one fails; the first error is the one
//! returned. Background loops share a [`CancellationToken`] and are joined
//! through a [`TaskTracker`], so shutdown is quiet only once every task has
//! actually stopped.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Handles graceful shutdown on SIGTERM and SIGINT.
pub struct SigDown {
    _task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl SigDown {
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let inner = CancellationToken::new();
        let outer = inner.clone();
        let task_tracker = TaskTracker::new();
        task_tracker.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => inner.cancel(),
                _ = sigint.recv() => inner.cancel(),
            }
        });
        task_tracker.close();
        Ok(Self {
            _task_tracker: task_tracker,
            cancellation_token: outer,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}

/// A resource that needs orderly teardown.
#[async_trait]
pub trait Closeable: Send + Sync {
    fn name(&self) -> &str;
    async fn close(&self) -> Result<(), String>;
}

/// Registry of closeable resources plus the shared background-task plumbing.
pub struct Lifecycle {
    resources: Mutex<Vec<Arc<dyn Closeable>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            resources: Mutex::new(Vec::new()),
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Registers a resource; close order is the reverse of registration.
    pub fn register(&self, resource: Arc<dyn Closeable>) {
        self.resources
            .lock()
            .expect("lifecycle lock poisoned")
            .push(resource);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns a background loop tracked for shutdown joining.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future);
    }

    /// Stops background loops, joins them, then closes resources in
    /// reverse order. Every closer is invoked; the first error wins.
    pub async fn shutdown(&self) -> Result<(), String> {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let resources: Vec<Arc<dyn Closeable>> = {
            let mut guard = self.resources.lock().expect("lifecycle lock poisoned");
            guard.drain(..).collect()
        };
        let mut first_error: Option<String> = None;
        for resource in resources.into_iter().rev() {
            if let Err(error) = resource.close().await {
                tracing::error!(resource = resource.name(), %error, "close failed");
                first_error.get_or_insert(error);
            } else {
                tracing::debug!(resource = resource.name(), "closed");
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}
