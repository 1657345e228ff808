// 9.1: single-slot mailboxes between the pollers and the engine.
//
// Notice is a counter in a watch channel. raising it while the receiver has not looked yet
// just bumps the counter, so any number of raises collapse into one wake-up, and a raise
// after the last receive is always seen by the next wait.
//
// Latch is one-shot. once closed it stays closed and every waiter, present or future, sees it.
// the engine uses one for shutdown and the checker one for "fully stopped".

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Notice {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for Notice {
    fn default() -> Self {
        Self::new()
    }
}

impl Notice {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self) {
        self.tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// A receiver that only sees raises from now on.
    pub fn subscribe(&self) -> NoticeReceiver {
        NoticeReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn raised_count(&self) -> u64 {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct NoticeReceiver {
    rx: watch::Receiver<u64>,
}

impl NoticeReceiver {
    /// Wait for the next raise. returns false once the Notice is gone.
    pub async fn notified(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Consume a pending raise without waiting.
    pub fn try_take(&mut self) -> bool {
        match self.rx.has_changed() {
            Ok(true) => {
                self.rx.borrow_and_update();
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Latch {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Close the latch. closing twice is a no-op. returns true for the call that closed it.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // the sender lives in self, so this only ends once closed
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Sleep for `duration` unless closed first. returns false when closed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_closed(),
            _ = self.wait() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raises_coalesce() {
        let notice = Notice::new();
        let mut rx = notice.subscribe();
        notice.raise();
        notice.raise();
        notice.raise();
        assert!(rx.try_take());
        assert!(!rx.try_take());
        assert_eq!(notice.raised_count(), 3);
    }

    #[tokio::test]
    async fn raise_after_receive_is_delivered() {
        let notice = Notice::new();
        let mut rx = notice.subscribe();
        notice.raise();
        assert!(rx.notified().await);
        notice.raise();
        assert!(rx.notified().await);
    }

    #[tokio::test]
    async fn shutdown_latches_once() {
        let shutdown = Latch::new();
        assert!(shutdown.close());
        assert!(!shutdown.close());
        assert!(shutdown.is_closed());
        shutdown.wait().await;
        assert!(!shutdown.sleep(Duration::from_secs(60)).await);
    }
}
