//! Counting wait group for in-flight tasks.
//!
//! The accept loop and every connection task hold a [`WaitGuard`] for as
//! long as they run. `Server::stop` waits on the group until every guard has
//! been dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Tracks the number of outstanding [`WaitGuard`]s.
#[derive(Debug, Default)]
pub struct WaitGroup {
    inflight: AtomicUsize,
    drained: Notify,
}

impl WaitGroup {
    /// Create an empty wait group.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one in-flight task. The task is released when the guard drops.
    pub fn add(self: &Arc<Self>) -> WaitGuard {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        WaitGuard {
            group: Arc::clone(self),
        }
    }

    /// Number of guards currently alive.
    pub fn len(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Check if no guards are alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every guard has been dropped.
    ///
    /// Returns immediately if the group is already empty.
    pub async fn wait(&self) {
        loop {
            // Created before the check so a release between the check and the
            // await is still observed.
            let drained = self.drained.notified();
            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

/// Membership in a [`WaitGroup`]; releases it exactly once on drop.
#[derive(Debug)]
pub struct WaitGuard {
    group: Arc<WaitGroup>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.group.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.group.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_on_empty_group() {
        let group = WaitGroup::new();
        assert!(group.is_empty());
        group.wait().await;
    }

    #[test]
    fn test_guard_accounting() {
        let group = WaitGroup::new();
        let a = group.add();
        let b = group.add();
        assert_eq!(group.len(), 2);

        drop(a);
        assert_eq!(group.len(), 1);
        drop(b);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_released() {
        let group = WaitGroup::new();
        let guards: Vec<_> = (0..3).map(|_| group.add()).collect();

        let waiter = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        for guard in guards {
            tokio::task::spawn_blocking(move || drop(guard))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish once all guards are dropped")
            .unwrap();
    }
}
