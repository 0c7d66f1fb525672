use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Uncancelled,
    Cancelled,
    ShutDown,
}

/// Shared cancellation capability. Cloning yields a handle to the same
/// flag; once the state leaves `Uncancelled` it never goes back.
#[derive(Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<CancelState>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CancelState::Uncancelled);
        CancelFlag { tx: Arc::new(tx) }
    }

    pub fn set(&self, state: CancelState) {
        if state == CancelState::Uncancelled {
            return;
        }
        let _ = self.tx.send(state);
    }

    pub fn state(&self) -> CancelState {
        *self.tx.borrow()
    }

    pub fn is_canceled(&self) -> bool {
        self.state() != CancelState::Uncancelled
    }

    /// Blocks until the state leaves `Uncancelled`.
    pub async fn wait(&self) -> CancelState {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != CancelState::Uncancelled {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_set_wakes_waiters() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.set(CancelState::Cancelled);
        assert_eq!(waiter.await.unwrap(), CancelState::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_cancelled() {
        let flag = CancelFlag::new();
        flag.set(CancelState::ShutDown);
        assert_eq!(flag.wait().await, CancelState::ShutDown);
        assert!(flag.is_canceled());
    }

    #[test]
    fn test_cannot_uncancel() {
        let flag = CancelFlag::new();
        flag.set(CancelState::Cancelled);
        flag.set(CancelState::Uncancelled);
        assert_eq!(flag.state(), CancelState::Cancelled);
    }
}
