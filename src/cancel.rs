//! Cooperative cancellation. Engines check the token at every suspension
//! point; in-flight operations abort at the next await and partial results
//! already collected are returned to the caller.

use tokio::sync::watch;

use crate::error::Error;

/// Clonable cancellation token shared between a caller and running engines
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation to every clone of this token
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is canceled; pending forever otherwise
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run a future, aborting with [`Error::Canceled`] if the token fires first
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, Error>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            _ = self.canceled() => Err(Error::Canceled),
            out = fut => Ok(out),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
