//! Lock-free run statistics using atomic operations
//!
//! Tracks rotations and view outcomes without mutex contention, plus an
//! in-flight gauge with a high-water mark so the admission bound is
//! observable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Statistics aggregated across all views of a run
#[derive(Debug, Default)]
pub struct RunStats {
    pub rotations_requested: AtomicU64,
    pub rotations_failed: AtomicU64,
    pub views_succeeded: AtomicU64,
    pub views_failed: AtomicU64,
    pub active_views: AtomicU64,
    pub peak_views: AtomicU64,
    pub start_time: AtomicU64,
}

impl RunStats {
    /// Create new run stats
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            start_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    /// Record a rotation request
    pub fn record_rotation_request(&self) {
        self.rotations_requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed rotation
    pub fn record_rotation_failure(&self) {
        self.rotations_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful view
    pub fn record_view_success(&self) {
        self.views_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed view
    pub fn record_view_failure(&self) {
        self.views_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A view entered the running state
    pub fn view_started(&self) {
        let now = self.active_views.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_views.fetch_max(now, Ordering::SeqCst);
    }

    /// A view left the running state
    pub fn view_finished(&self) {
        self.active_views.fetch_sub(1, Ordering::SeqCst);
    }

    /// Views currently running
    pub fn active_views(&self) -> u64 {
        self.active_views.load(Ordering::SeqCst)
    }

    /// Most views ever running at once
    pub fn peak_views(&self) -> u64 {
        self.peak_views.load(Ordering::SeqCst)
    }

    /// Get snapshot for serialization
    pub fn snapshot(&self) -> RunStatsSnapshot {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        RunStatsSnapshot {
            rotations_requested: self.rotations_requested.load(Ordering::Relaxed),
            rotations_failed: self.rotations_failed.load(Ordering::Relaxed),
            views_succeeded: self.views_succeeded.load(Ordering::Relaxed),
            views_failed: self.views_failed.load(Ordering::Relaxed),
            peak_views: self.peak_views.load(Ordering::SeqCst),
            elapsed_secs: now.saturating_sub(self.start_time.load(Ordering::Relaxed)),
        }
    }
}

/// Serializable snapshot of run stats
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatsSnapshot {
    pub rotations_requested: u64,
    pub rotations_failed: u64,
    pub views_succeeded: u64,
    pub views_failed: u64,
    pub peak_views: u64,
    pub elapsed_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_the_high_water_mark() {
        let stats = RunStats::new();
        stats.view_started();
        stats.view_started();
        stats.view_finished();
        stats.view_started();

        assert_eq!(stats.active_views(), 2);
        assert_eq!(stats.peak_views(), 2);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = RunStats::new();
        stats.record_rotation_request();
        stats.record_rotation_request();
        stats.record_rotation_failure();
        stats.record_view_success();
        stats.record_view_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rotations_requested, 2);
        assert_eq!(snapshot.rotations_failed, 1);
        assert_eq!(snapshot.views_succeeded, 1);
        assert_eq!(snapshot.views_failed, 1);
    }
}
