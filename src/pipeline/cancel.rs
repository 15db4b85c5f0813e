//! Cooperative cancellation for in-flight chunk jobs.
//!
//! A [`CancelToken`] is a cloneable flag backed by a `tokio::sync::watch`
//! channel. The retry executor races every attempt and every retry delay
//! against [`CancelToken::cancelled`], so cancelling stops the run at the
//! next await point instead of after the current chunk's retries finish.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Flag the token. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is cancelled; pending forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|flag| *flag).await.is_err() {
            // The sender lives as long as any clone of the token, so this
            // branch is unreachable while `self` exists.
            std::future::pending::<()>().await;
        }
    }

    /// Cancel the token after `after` elapses.
    ///
    /// The returned guard aborts the timer when dropped, so a run that
    /// finishes early leaves nothing behind.
    pub fn arm_deadline(&self, after: Duration) -> TaskGuard {
        let token = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            info!("Deadline of {:?} reached; cancelling remaining chunks", after);
            token.cancel();
        });
        TaskGuard { handle }
    }

    /// A new token that is cancelled whenever `self` is, and can also be
    /// cancelled on its own without touching `self`.
    ///
    /// Forwarding stops when the returned guard is dropped.
    pub fn child(&self) -> (CancelToken, TaskGuard) {
        let parent = self.clone();
        let child = CancelToken::new();
        let forward = child.clone();
        let handle = tokio::spawn(async move {
            parent.cancelled().await;
            forward.cancel();
        });
        (child, TaskGuard { handle })
    }
}

/// Aborts a background task (deadline timer or parent link) on drop.
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
