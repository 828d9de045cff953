//! Sync statistics
//!
//! Cumulative counters over every completed cycle. A cycle that is retried
//! and eventually succeeds counts once as a success; one that exhausts its
//! retries counts once as a failure.

use std::time::Duration;

use serde::Serialize;

use crate::reconcile::SyncResult;

/// Aggregated statistics for a coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatistics {
    /// Rows in the mirror after the last successful cycle
    pub total_entities: usize,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    /// Wall time of the last completed cycle
    pub last_cycle_duration: Option<Duration>,
    pub total_inserted: u64,
    pub total_updated: u64,
    pub total_deleted: u64,
    /// Duplicate or out-of-scope records dropped before diffing
    pub records_discarded: u64,
    pub last_result: Option<SyncResult>,
}

impl SyncStatistics {
    /// Record a committed cycle
    pub fn record_success(&mut self, result: SyncResult, total_entities: usize, duration: Duration) {
        self.successful_cycles += 1;
        self.total_entities = total_entities;
        self.last_cycle_duration = Some(duration);
        self.total_inserted += result.inserted as u64;
        self.total_updated += result.updated as u64;
        self.total_deleted += result.deleted as u64;
        self.records_discarded += result.discarded as u64;
        self.last_result = Some(result);
    }

    /// Record a cycle that failed for good
    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_cycles += 1;
        self.last_cycle_duration = Some(duration);
    }

    /// Completed cycles, successful or not
    pub fn completed_cycles(&self) -> u64 {
        self.successful_cycles + self.failed_cycles
    }

    /// Share of completed cycles that succeeded, `None` before the first
    pub fn success_rate(&self) -> Option<f64> {
        match self.completed_cycles() {
            0 => None,
            total => Some(self.successful_cycles as f64 / total as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let stats = SyncStatistics::default();
        assert_eq!(stats.success_rate(), None);
        assert_eq!(stats.completed_cycles(), 0);
    }

    #[test]
    fn test_record_success_accumulates() {
        let mut stats = SyncStatistics::default();
        stats.record_success(
            SyncResult { inserted: 3, updated: 0, deleted: 0, discarded: 1 },
            3,
            Duration::from_millis(12),
        );
        stats.record_success(
            SyncResult { inserted: 1, updated: 2, deleted: 1, discarded: 0 },
            3,
            Duration::from_millis(8),
        );

        assert_eq!(stats.successful_cycles, 2);
        assert_eq!(stats.total_inserted, 4);
        assert_eq!(stats.total_updated, 2);
        assert_eq!(stats.total_deleted, 1);
        assert_eq!(stats.records_discarded, 1);
        assert_eq!(stats.total_entities, 3);
        assert_eq!(stats.last_cycle_duration, Some(Duration::from_millis(8)));
        assert_eq!(stats.success_rate(), Some(1.0));
    }

    #[test]
    fn test_success_rate_with_failures() {
        let mut stats = SyncStatistics::default();
        stats.record_success(SyncResult::default(), 0, Duration::ZERO);
        stats.record_failure(Duration::ZERO);
        stats.record_failure(Duration::ZERO);
        stats.record_success(SyncResult::default(), 0, Duration::ZERO);

        assert_eq!(stats.failed_cycles, 2);
        assert_eq!(stats.success_rate(), Some(0.5));
    }

    #[test]
    fn test_failure_keeps_entity_count() {
        let mut stats = SyncStatistics::default();
        stats.record_success(SyncResult { inserted: 5, ..Default::default() }, 5, Duration::ZERO);
        stats.record_failure(Duration::from_secs(1));
        assert_eq!(stats.total_entities, 5);
        assert_eq!(stats.last_result.map(|r| r.inserted), Some(5));
    }
}
