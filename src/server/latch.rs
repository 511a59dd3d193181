//! One-shot completion signals
//!
//! A [`Latch`] is the handle returned for "diagnosis of this batch has
//! finished": open it once, observe or await it from any number of holders.
//! Opening is idempotent; waiting after it opened returns immediately.

use tokio::sync::watch;

/// Cloneable, idempotent one-shot signal.
#[derive(Debug, Clone)]
pub struct Latch {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Open the latch, waking all waiters. Subsequent opens are no-ops.
    pub fn open(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_open(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the latch opens. Returns immediately if already open.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
