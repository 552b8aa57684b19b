//! Process-local queue-change notifier backing the long-poll endpoint.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Broadcast on every successful queue write; long-poll handlers wait on
/// it with a bounded timeout.
#[derive(Clone, Debug)]
pub struct QueueNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for QueueNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueNotifier {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Signal that the queue changed.
    pub fn notify_change(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// Wait up to `timeout` for a change. Returns `true` when a change
    /// arrived, `false` on timeout.
    pub async fn wait_for_change(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        // Mark the current generation seen so only future changes wake us.
        rx.borrow_and_update();
        matches!(
            tokio::time::timeout(timeout, rx.changed()).await,
            Ok(Ok(()))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wakes_on_change() {
        let notifier = QueueNotifier::new();
        let waiter = notifier.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_for_change(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        notifier.notify_change();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn times_out_without_change() {
        let notifier = QueueNotifier::new();
        assert!(!notifier.wait_for_change(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn change_before_wait_is_not_seen() {
        let notifier = QueueNotifier::new();
        notifier.notify_change();
        // only changes after the wait starts count
        assert!(!notifier.wait_for_change(Duration::from_millis(30)).await);
    }
}
