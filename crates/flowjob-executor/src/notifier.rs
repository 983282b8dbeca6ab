//! Wake-up signal from committed transactions to the acquisition loop.

use std::sync::Arc;

use tokio::sync::Notify;

use flowjob_store::JobAddedListener;

/// Coalescing wake-up handle.
///
/// Holds at most one pending permit: any number of signals raised while
/// the acquisition loop is busy collapse into a single wake-up.
#[derive(Clone, Default)]
pub struct JobNotifier {
    notify: Arc<Notify>,
}

impl JobNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal without blocking.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wait for the next signal, consuming a pending one immediately.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl JobAddedListener for JobNotifier {
    fn job_was_added(&self) {
        self.notify();
    }
}

impl std::fmt::Debug for JobNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobNotifier").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pending_signal_is_consumed() {
        let notifier = JobNotifier::new();
        notifier.notify();
        tokio::time::timeout(Duration::from_millis(50), notifier.notified())
            .await
            .expect("pending signal should wake immediately");
    }

    #[tokio::test]
    async fn test_signals_coalesce() {
        let notifier = JobNotifier::new();
        for _ in 0..5 {
            notifier.job_was_added();
        }

        notifier.notified().await;
        let second = tokio::time::timeout(Duration::from_millis(50), notifier.notified()).await;
        assert!(second.is_err(), "five signals must collapse into one wake-up");
    }

    #[tokio::test]
    async fn test_wakes_waiting_task() {
        let notifier = JobNotifier::new();
        let waiter = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.notified().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.notify();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
