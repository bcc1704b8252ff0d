//! Job execution context: deadline and cancellation propagation.
//!
//! The worker owns the lifetime of a job and hands each backend call a
//! [`JobContext`]. Long-running operations race their result channels
//! against [`JobContext::done`] and check [`JobContext::check`] at loop
//! boundaries so background pollers exit promptly after the caller gives
//! up.

use std::future::pending;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;

/// Reason a context stopped accepting work.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum CtxError {
    /// The deadline attached to the job elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The job was cancelled by the worker.
    #[error("job cancelled")]
    Cancelled,
}

/// Deadline-bearing cancellation scope for a single job.
#[derive(Clone, Debug)]
pub struct JobContext {
    deadline: Option<Instant>,
    cancelled: Option<watch::Receiver<bool>>,
}

/// Cancels the paired [`JobContext`] when triggered.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancels every clone of the paired context.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl JobContext {
    /// Context without a deadline that is never cancelled.
    #[must_use]
    pub const fn background() -> Self {
        Self {
            deadline: None,
            cancelled: None,
        }
    }

    /// Context that expires `timeout` from now.
    #[must_use]
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: None,
        }
    }

    /// Context cancellable through the returned handle, with an optional
    /// deadline.
    #[must_use]
    pub fn cancellable(timeout: Option<Duration>) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancelled: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// Non-blocking check, suitable for loop boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`CtxError::DeadlineExceeded`] once the deadline has passed,
    /// or [`CtxError::Cancelled`] once the handle fired.
    pub fn check(&self) -> Result<(), CtxError> {
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(CtxError::DeadlineExceeded);
        }
        if let Some(rx) = &self.cancelled
            && *rx.borrow()
        {
            return Err(CtxError::Cancelled);
        }
        Ok(())
    }

    /// Resolves when the context stops accepting work.
    ///
    /// For a [`JobContext::background`] context this future never resolves;
    /// callers race it against their result channel with `tokio::select!`.
    pub async fn done(&self) -> CtxError {
        if let Err(err) = self.check() {
            return err;
        }

        let deadline_elapsed = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => pending().await,
            }
        };
        let cancel_fired = async {
            match self.cancelled.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow() {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        // Handle dropped without cancelling: never fires.
                        pending::<()>().await;
                    }
                },
                None => pending().await,
            }
        };

        tokio::select! {
            () = deadline_elapsed => CtxError::DeadlineExceeded,
            () = cancel_fired => CtxError::Cancelled,
        }
    }
}
