//! Usage statistics behind the retention score.

use serde::{Deserialize, Serialize};

/// Per-snapshot usage statistics.
///
/// The retention score is `last_used_clock + freq * cold_start_ms / size_mib`:
/// recently used, frequently used, expensive-to-rebuild, and small
/// snapshots are kept longest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub revision: String,
    /// Times the snapshot was acquired
    pub freq: i64,
    /// Cold start time saved by restoring instead of booting
    pub cold_start_ms: i64,
    /// Disk space charged to the snapshot
    pub size_mib: i64,
    /// Eviction clock value at the last acquire
    pub last_used_clock: i64,
    pub score: i64,
    /// Active consumers
    pub num_using: u32,
    /// Committed and available for acquire
    pub usable: bool,
}

impl SnapshotStats {
    pub fn new(revision: &str, cold_start_ms: i64, size_mib: i64, clock: i64) -> Self {
        let mut stats = Self {
            revision: revision.to_string(),
            freq: 0,
            cold_start_ms,
            size_mib,
            last_used_clock: clock,
            score: 0,
            num_using: 0,
            usable: false,
        };
        stats.update_score();
        stats
    }

    pub fn update_score(&mut self) {
        self.score = self.last_used_clock + self.freq * self.cold_start_ms / self.size_mib.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_score_is_clock() {
        let stats = SnapshotStats::new("rev-1", 500, 100, 7);
        assert_eq!(stats.score, 7);
        assert!(!stats.usable);
    }

    #[test]
    fn test_score_formula() {
        let mut stats = SnapshotStats::new("rev-1", 500, 100, 10);
        stats.freq = 4;
        stats.update_score();
        assert_eq!(stats.score, 10 + 4 * 500 / 100);
    }

    #[test]
    fn test_zero_size_does_not_divide_by_zero() {
        let mut stats = SnapshotStats::new("rev-1", 500, 0, 0);
        stats.freq = 1;
        stats.update_score();
        assert_eq!(stats.score, 500);
    }
}
