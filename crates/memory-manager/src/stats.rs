// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Pool statistics for profiling and capacity tuning.

/// Cumulative counters describing how a [`crate::MemoryPool`] is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions served from a free entry.
    pub hits: u64,
    /// Acquisitions that needed a new allocation.
    pub misses: u64,
    /// Buffers returned to their slot.
    pub releases: u64,
    /// Releases rejected (double release, stale slot, wrong shape).
    pub rejected_releases: u64,
    /// Acquisitions that failed because the manager could not allocate.
    pub allocation_failures: u64,
    /// Entries preallocated through `reserve`.
    pub reserved_entries: u64,
    /// Entries destroyed by purges.
    pub purged_entries: u64,
    /// Blocking acquisitions that had to wait.
    pub waits: u64,
    /// Highest number of entries in use at once.
    pub peak_in_use: usize,
}

impl PoolStats {
    /// Fraction of acquisitions served without allocating, in `[0.0, 1.0]`.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }

    pub(crate) fn record_hit(&mut self) {
        self.acquisitions += 1;
        self.hits += 1;
    }

    pub(crate) fn record_miss(&mut self) {
        self.acquisitions += 1;
        self.misses += 1;
    }

    pub(crate) fn update_peak(&mut self, in_use: usize) {
        self.peak_in_use = self.peak_in_use.max(in_use);
    }

    /// Returns a one-line summary.
    pub fn summary(&self) -> String {
        format!(
            "Pool: {} acquisitions ({} hits, {} misses, {:.0}% hit rate), {} releases, \
             {} rejected, {} allocation failures, {} purged, peak {} in use",
            self.acquisitions,
            self.hits,
            self.misses,
            self.hit_ratio() * 100.0,
            self.releases,
            self.rejected_releases,
            self.allocation_failures,
            self.purged_entries,
            self.peak_in_use,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let mut s = PoolStats::default();
        assert_eq!(s.hit_ratio(), 0.0);
        s.record_miss();
        s.record_hit();
        s.record_hit();
        assert!((s.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.acquisitions, 3);
    }

    #[test]
    fn test_peak_never_decreases() {
        let mut s = PoolStats::default();
        s.update_peak(3);
        s.update_peak(1);
        assert_eq!(s.peak_in_use, 3);
    }

    #[test]
    fn test_summary() {
        let mut s = PoolStats::default();
        s.record_miss();
        s.record_hit();
        let text = s.summary();
        assert!(text.contains("2 acquisitions"));
        assert!(text.contains("50% hit rate"));
    }
}
