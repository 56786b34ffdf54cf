//! Abort signaling
//!
//! One signal per run, passed explicitly from the destination scheduler
//! down to every transfer. All blocking waits race against it.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::transfer::SchedulerError;

/// Abort signal for run termination
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request abort. Idempotent.
    pub fn request_abort(&self) {
        self.tx.send_replace(true);
    }

    /// Check if abort was requested
    pub fn is_abort_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// `Err(Aborted)` once abort was requested
    #[inline]
    pub fn check(&self) -> Result<(), SchedulerError> {
        if self.is_abort_requested() {
            Err(SchedulerError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolves when abort is requested.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        let signalled = rx.wait_for(|aborted| *aborted).await.is_ok();
        if !signalled {
            // Sender lives as long as `self`; never reached.
            std::future::pending::<()>().await;
        }
    }

    /// Drive `fut` to completion unless abort is requested first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, SchedulerError> {
        tokio::select! {
            out = fut => Ok(out),
            _ = self.aborted() => Err(SchedulerError::Aborted),
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}
