use tokio::sync::watch;

/// Why a [`CancelToken`] fired — distinguishes a silent exit (lock lost to a
/// reclaim) from a finalized failure (client cancel, deadline).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    LockLost,
    ClientRequested,
    DeadlineExceeded,
}

/// Cooperative cancellation signal threaded through every phase function. Fires on
/// lock loss (detected by the heartbeat), explicit client cancellation, or deadline
/// expiry — the three triggers enumerated in the concurrency model.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

/// The write side, held by the executor loop and its heartbeat task.
pub struct CancelSource {
    tx: watch::Sender<Option<CancelReason>>,
}

pub fn channel() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(None);
    (CancelSource { tx }, CancelToken { rx })
}

impl CancelSource {
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Resolves once cancellation fires. Phase functions select! on this alongside
    /// their own I/O to propagate the cancel upward promptly.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.borrow().is_some() {
            return;
        }
        let _ = rx.changed().await;
    }
}
