use std::time::Duration;
use tokio::time::Instant;

/// Coalesces bursts of change notifications into one delayed trigger.
///
/// Holds at most one pending deadline. Every `notify` replaces it with
/// `now + quiet`, so a burst fires once, `quiet` after its last notification.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            deadline: None,
        }
    }

    /// Record a change; supersedes any pending deadline.
    pub fn notify(&mut self) {
        self.deadline = Some(Instant::now() + self.quiet);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    #[cfg(test)]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Complete when the pending deadline passes, clearing it.
    ///
    /// Never completes while nothing is pending. Cancel safe: dropping the
    /// future leaves the deadline in place.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const QUIET: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn test_single_change_fires_after_quiet_period() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(QUIET);
        debouncer.notify();
        assert!(debouncer.is_pending());

        debouncer.expired().await;
        assert_eq!(start.elapsed(), QUIET);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_fires_once_from_last_change() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(QUIET);

        debouncer.notify();
        advance(Duration::from_millis(200)).await;
        debouncer.notify();
        advance(Duration::from_millis(700)).await;
        debouncer.notify();

        debouncer.expired().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1900));
        assert!(!debouncer.is_pending());

        // Nothing else is due: a second wait never completes.
        let second = tokio::time::timeout(Duration::from_secs(10), debouncer.expired()).await;
        assert!(second.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_change_supersedes_pending_deadline() {
        let mut debouncer = Debouncer::new(QUIET);
        debouncer.notify();
        let first = debouncer.deadline().unwrap();
        advance(Duration::from_millis(500)).await;
        debouncer.notify();
        let second = debouncer.deadline().unwrap();
        assert_eq!(second - first, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_deadline() {
        let mut debouncer = Debouncer::new(QUIET);
        debouncer.notify();
        debouncer.cancel();
        assert!(!debouncer.is_pending());
        let waited = tokio::time::timeout(Duration::from_secs(5), debouncer.expired()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_wait_keeps_deadline() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(QUIET);
        debouncer.notify();

        let early = tokio::time::timeout(Duration::from_millis(300), debouncer.expired()).await;
        assert!(early.is_err());
        assert!(debouncer.is_pending());

        debouncer.expired().await;
        assert_eq!(start.elapsed(), QUIET);
    }
}
