//! Cancellation and deadline propagation.
//!
//! Every blocking operation in the pipeline takes a [`Context`]. Cancellation
//! is cooperative: loops check [`Context::err`] between steps and `select!`
//! on [`Context::done`] while waiting.

use crate::NotifyError;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Cancellation token with an optional deadline.
///
/// Cheap to clone; all clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Handle that cancels every clone of the associated [`Context`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A cancellable context and its cancel handle.
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel: Some(rx), deadline: None }, CancelHandle { tx })
    }

    /// Derive a context that also expires at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a context that expires after `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return true;
            }
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// `Err` when the context is cancelled or past its deadline.
    pub fn err(&self) -> Result<(), NotifyError> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Err(NotifyError::Cancelled);
            }
        }
        if let Some(d) = self.deadline {
            if Instant::now() >= d {
                return Err(NotifyError::SystemTimeout("context deadline exceeded".into()));
            }
        }
        Ok(())
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Pends forever for a background context.
    pub async fn done(&self) -> NotifyError {
        let deadline_wait = async {
            match self.deadline {
                Some(d) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await;
                    NotifyError::SystemTimeout("context deadline exceeded".into())
                }
                None => std::future::pending().await,
            }
        };
        let cancel_wait = async {
            match self.cancel.clone() {
                Some(mut rx) => {
                    if *rx.borrow() {
                        return NotifyError::Cancelled;
                    }
                    // A dropped handle means the context can no longer be
                    // cancelled; fall through to pending.
                    loop {
                        if rx.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                        if *rx.borrow() {
                            return NotifyError::Cancelled;
                        }
                    }
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            err = deadline_wait => err,
            err = cancel_wait => err,
        }
    }
}
