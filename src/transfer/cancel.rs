//! Cooperative cancellation for in-flight transfers.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared cancellation flag carrying the first reason given.
///
/// Transfers check it before each chunk and race it against the chunk
/// round trip, so an abort takes effect within one chunk.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `false` if the flag was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(move |current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves with the reason once cancelled.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as self
                std::future::pending::<()>().await;
            }
        }
    }
}
