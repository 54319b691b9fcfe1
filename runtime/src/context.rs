//! Cancellation and deadlines for blocking operations.
//!
//! A [`Context`] is handed down from the caller to every network or disk
//! operation. When it is cancelled or its deadline passes, the in-flight
//! future is dropped, which in turn drops any reserved cache entry and
//! removes its temporary file.

use std::future::Future;
use std::time::{Duration, Instant};

use apptainer_core::error::{ApptainerError, Result};
use tokio_util::sync::CancellationToken;

/// Caller-supplied cancellation scope.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child context that expires after `timeout`.
    ///
    /// The earlier of the parent deadline and the new one wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child context that is cancelled with this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ApptainerError::TimeoutError(
                "operation cancelled".to_string(),
            ));
        }
        Ok(())
    }

    /// Run `fut` until it completes, the context is cancelled, or the deadline passes.
    pub async fn run<F, T>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let remaining = self
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()));

        tokio::select! {
            _ = self.token.cancelled() => {
                tracing::debug!(operation = what, "Operation cancelled");
                Err(ApptainerError::TimeoutError(format!("{}: cancelled", what)))
            }
            res = async {
                match remaining {
                    Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| {
                        ApptainerError::TimeoutError(format!("{}: deadline exceeded", what))
                    })?,
                    None => fut.await,
                }
            } => res,
        }
    }

    /// Run the blocking closure `f` on the blocking pool.
    ///
    /// The context is checked before `f` starts and after it returns; a
    /// cancellation in between stops the wait but not `f` itself.
    pub async fn blocking<F, T>(&self, what: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let value = self
            .run(what, async {
                tokio::task::spawn_blocking(f)
                    .await
                    .map_err(|e| ApptainerError::Other(format!("{}: task failed: {}", what, e)))?
            })
            .await?;
        self.check()?;
        Ok(value)
    }
}
