//! Background work and the serial callback context.
//!
//! Blocking and long-running work runs on the tokio runtime; completions,
//! errors and listener notifications are marshalled onto a single
//! [`CallbackContext`] so callback code never runs concurrently with itself.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("background work panicked: {0}")]
    Panicked(String),

    #[error("background work was cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Serial executor for callbacks. Cheap to clone.
#[derive(Clone)]
pub struct CallbackContext {
    tx: mpsc::UnboundedSender<Callback>,
}

impl CallbackContext {
    /// Spawns the draining task. Must be called from within a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback>();
        tokio::spawn(async move {
            while let Some(cb) = rx.recv().await {
                if let Err(p) = std::panic::catch_unwind(AssertUnwindSafe(cb)) {
                    warn!(panic = %panic_message(p.as_ref()), "callback panicked");
                }
            }
        });
        Self { tx }
    }

    /// Queues `f`. Returns false once the context has stopped.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(f)).is_ok()
    }

    /// Resolves after every callback queued before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.post(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }
}

#[derive(Clone)]
pub struct BackgroundRunner {
    callbacks: CallbackContext,
    shutdown: CancellationToken,
}

impl BackgroundRunner {
    pub fn new(callbacks: CallbackContext) -> Self {
        Self { callbacks, shutdown: CancellationToken::new() }
    }

    pub fn callbacks(&self) -> &CallbackContext {
        &self.callbacks
    }

    /// Runs `work` off the caller's thread. Its outcome, including a panic,
    /// is delivered to `on_success` or `on_error` on the callback context.
    pub fn execute<T, F, S, E>(&self, work: F, on_success: S, on_error: E)
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(RunnerError) + Send + 'static,
    {
        let callbacks = self.callbacks.clone();
        let handle = tokio::spawn(work);
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(RunnerError::Failed(e)),
                Err(e) => Err(join_error(e)),
            };
            callbacks.post(move || match outcome {
                Ok(v) => on_success(v),
                Err(e) => on_error(e),
            });
        });
    }

    /// Runs blocking `work` on the blocking pool and awaits it. Panics become errors.
    pub async fn run_blocking<T, F>(&self, work: F) -> Result<T, RunnerError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        match tokio::task::spawn_blocking(work).await {
            Ok(r) => r.map_err(RunnerError::Failed),
            Err(e) => Err(join_error(e)),
        }
    }

    /// Runs `f` on the callback context after `delay`, unless shut down first.
    pub fn schedule<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let callbacks = self.callbacks.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    callbacks.post(f);
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn join_error(e: JoinError) -> RunnerError {
    if e.is_panic() {
        RunnerError::Panicked(panic_message(e.into_panic().as_ref()))
    } else {
        RunnerError::Cancelled
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
