//! Diagnostic detection of handles held longer than expected

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::metrics::MetricsTracker;
use crate::scheduler::{ScheduledTask, Scheduler};

/// Where and when a checkout happened.
struct Checkout {
    pool: String,
    entry: String,
    thread: String,
    origin: Backtrace,
    reported: AtomicBool,
}

/// Per-checkout leak timer. Cancelling it is the normal outcome.
pub(crate) struct LeakTask {
    checkout: Arc<Checkout>,
    task: ScheduledTask,
}

impl LeakTask {
    pub fn cancel(self) {
        self.task.cancel();
        if self.checkout.reported.load(Ordering::Acquire) {
            tracing::info!(pool = %self.checkout.pool, entry = %self.checkout.entry,
                "previously reported leaked resource was returned to the pool (unleaked)");
        }
    }
}

/// Schedules a leak report for every checkout while a threshold is set.
pub(crate) struct LeakDetector {
    pool: String,
    threshold_ms: AtomicU64,
}

impl LeakDetector {
    pub fn new(pool: String, threshold: Duration) -> Self {
        let detector = Self { pool, threshold_ms: AtomicU64::new(0) };
        detector.update_threshold(threshold);
        detector
    }

    pub fn update_threshold(&self, threshold: Duration) {
        let millis = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        self.threshold_ms.store(millis, Ordering::Relaxed);
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms.load(Ordering::Relaxed))
    }

    /// Start the timer for one checkout; `None` while detection is off.
    pub fn schedule(
        &self,
        scheduler: &Scheduler,
        metrics: &Arc<MetricsTracker>,
        entry: &dyn std::fmt::Display,
    ) -> Option<LeakTask> {
        let threshold = self.threshold();
        if threshold.is_zero() {
            return None;
        }

        let checkout = Arc::new(Checkout {
            pool: self.pool.clone(),
            entry: entry.to_string(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            origin: Backtrace::force_capture(),
            reported: AtomicBool::new(false),
        });

        let fired = Arc::downgrade(&checkout);
        let metrics = Arc::clone(metrics);
        let task = scheduler.schedule_once(threshold, move || {
            let Some(checkout) = fired.upgrade() else {
                return;
            };
            checkout.reported.store(true, Ordering::Release);
            metrics.record_leak();
            tracing::warn!(
                pool = %checkout.pool,
                entry = %checkout.entry,
                thread = %checkout.thread,
                threshold_ms = threshold.as_millis() as u64,
                "resource leak detection triggered, checkout origin follows:\n{}",
                checkout.origin
            );
        });

        Some(LeakTask { checkout, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_detector_schedules_nothing() {
        let scheduler = Scheduler::start("test-leak".to_string()).unwrap();
        let metrics = Arc::new(MetricsTracker::new());
        let detector = LeakDetector::new("test".to_string(), Duration::ZERO);
        assert!(detector.schedule(&scheduler, &metrics, &"entry#1").is_none());
    }

    #[test]
    fn fires_when_not_cancelled() {
        let scheduler = Scheduler::start("test-leak".to_string()).unwrap();
        let metrics = Arc::new(MetricsTracker::new());
        let detector = LeakDetector::new("test".to_string(), Duration::from_millis(20));

        let task = detector.schedule(&scheduler, &metrics, &"entry#1").unwrap();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(metrics.leaks(), 1);
        task.cancel();
    }

    #[test]
    fn cancelled_task_stays_quiet() {
        let scheduler = Scheduler::start("test-leak".to_string()).unwrap();
        let metrics = Arc::new(MetricsTracker::new());
        let detector = LeakDetector::new("test".to_string(), Duration::from_millis(30));

        detector.schedule(&scheduler, &metrics, &"entry#1").unwrap().cancel();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(metrics.leaks(), 0);
    }

    #[test]
    fn threshold_can_be_updated() {
        let detector = LeakDetector::new("test".to_string(), Duration::ZERO);
        detector.update_threshold(Duration::from_secs(2));
        assert_eq!(detector.threshold(), Duration::from_secs(2));
    }
}
