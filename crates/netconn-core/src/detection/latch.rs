// Countdown latch over a watch channel. Waiters always get released:
// either the count hits zero or their timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CountDownLatch {
    count: Arc<watch::Sender<usize>>,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        let (tx, _rx) = watch::channel(count);
        Self {
            count: Arc::new(tx),
        }
    }

    pub fn count_down(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    /// Drop the count to zero, releasing every waiter.
    pub fn release(&self) {
        self.count.send_replace(0);
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait for zero. Returns false if `timeout` elapsed first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|c| *c == 0)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn releases_at_zero() {
        let latch = CountDownLatch::new(2);
        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        assert!(latch.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait(Duration::from_secs(3)).await);
        assert_eq!(latch.count(), 1);
    }

    #[tokio::test]
    async fn release_drains_and_count_saturates() {
        let latch = CountDownLatch::new(4);
        latch.release();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        assert!(latch.wait(Duration::from_millis(1)).await);
    }
}
