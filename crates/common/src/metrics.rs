//! In-process queue metrics.
//!
//! Counters are advisory: they live in memory, reset on restart and are
//! distinct from the durable per-job state kept by the broker.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-lane process counters, injected into the worker that owns the lane.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Jobs currently executing in this process.
    active: AtomicU64,
    /// Jobs picked up since start.
    total: AtomicU64,
    /// Jobs completed since start.
    completed: AtomicU64,
    /// Failed attempts since start.
    failed: AtomicU64,
}

/// Point-in-time copy of [`QueueMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub active_count: u64,
    pub total_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
}

impl QueueMetrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: AtomicU64::new(0),
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Record a job transitioning to active.
    pub fn record_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed job.
    pub fn record_completed(&self) {
        self.release_active();
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed attempt.
    pub fn record_failed(&self) {
        self.release_active();
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement `active`, clamped at zero.
    fn release_active(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Get a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> ProcessMetrics {
        ProcessMetrics {
            active_count: self.active.load(Ordering::Relaxed),
            total_count: self.total.load(Ordering::Relaxed),
            completed_count: self.completed.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Export counters in Prometheus text format, labelled with the queue name.
    #[must_use]
    pub fn to_prometheus(&self, queue: &str) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP eventmail_jobs_active Jobs currently executing\n");
        output.push_str("# TYPE eventmail_jobs_active gauge\n");
        output.push_str(&format!(
            "eventmail_jobs_active{{queue=\"{queue}\"}} {}\n",
            snapshot.active_count
        ));

        output.push_str("# HELP eventmail_jobs_total Jobs picked up\n");
        output.push_str("# TYPE eventmail_jobs_total counter\n");
        output.push_str(&format!(
            "eventmail_jobs_total{{queue=\"{queue}\"}} {}\n",
            snapshot.total_count
        ));

        output.push_str("# HELP eventmail_jobs_completed Jobs completed\n");
        output.push_str("# TYPE eventmail_jobs_completed counter\n");
        output.push_str(&format!(
            "eventmail_jobs_completed{{queue=\"{queue}\"}} {}\n",
            snapshot.completed_count
        ));

        output.push_str("# HELP eventmail_jobs_failed Failed job attempts\n");
        output.push_str("# TYPE eventmail_jobs_failed counter\n");
        output.push_str(&format!(
            "eventmail_jobs_failed{{queue=\"{queue}\"}} {}\n",
            snapshot.failed_count
        ));

        output
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_lifecycle_counts() {
        let metrics = QueueMetrics::new();
        metrics.record_started();
        metrics.record_started();
        metrics.record_completed();
        metrics.record_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_count, 0);
        assert_eq!(snapshot.total_count, 2);
        assert_eq!(snapshot.completed_count, 1);
        assert_eq!(snapshot.failed_count, 1);
    }

    #[test]
    fn test_active_never_negative() {
        let metrics = QueueMetrics::new();
        metrics.record_completed();
        metrics.record_failed();
        metrics.record_failed();
        assert_eq!(metrics.snapshot().active_count, 0);

        metrics.record_started();
        metrics.record_completed();
        metrics.record_completed();
        assert_eq!(metrics.snapshot().active_count, 0);
        assert_eq!(metrics.snapshot().completed_count, 3);
    }

    #[test]
    fn test_active_never_negative_across_threads() {
        let metrics = Arc::new(QueueMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        if i % 2 == 0 {
                            metrics.record_started();
                        }
                        metrics.record_failed();
                        metrics.record_completed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_count, 0);
        assert_eq!(snapshot.total_count, 2000);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = QueueMetrics::new();
        metrics.record_started();
        let text = metrics.to_prometheus("email");
        assert!(text.contains("eventmail_jobs_active{queue=\"email\"} 1"));
        assert!(text.contains("eventmail_jobs_total{queue=\"email\"} 1"));
    }
}
