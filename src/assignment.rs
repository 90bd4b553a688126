//! Assignment of contiguous key ranges to ranks.

use std::ops::Range;

use itertools::Itertools;
use log::{debug, warn};

use crate::{
    constants::MAX_KEY,
    error::DomainError,
    octree::num_leaves,
    tools::{exclusive_scan, sort_to_bins},
};

/// Key ranges owned by each rank.
///
/// Rank `r` owns `[boundaries[r], boundaries[r + 1])`. The ranges are leaf aligned in the
/// global tree they were computed from, ordered by key and cover the key space once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SfcAssignment {
    boundaries: Vec<u64>,
    counts: Vec<u64>,
    leaf_boundaries: Vec<usize>,
}

impl SfcAssignment {
    /// Number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.counts.len()
    }

    /// First key of `rank`.
    pub fn start_key(&self, rank: usize) -> u64 {
        self.boundaries[rank]
    }

    /// One past the last key of `rank`.
    pub fn end_key(&self, rank: usize) -> u64 {
        self.boundaries[rank + 1]
    }

    /// Key range of `rank`.
    pub fn key_range(&self, rank: usize) -> Range<u64> {
        self.start_key(rank)..self.end_key(rank)
    }

    /// Range of global leaf indices owned by `rank`.
    pub fn leaf_range(&self, rank: usize) -> Range<usize> {
        self.leaf_boundaries[rank]..self.leaf_boundaries[rank + 1]
    }

    /// Number of particles assigned to `rank`.
    pub fn count(&self, rank: usize) -> u64 {
        self.counts[rank]
    }

    /// Particle counts of all ranks.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// All `num_ranks + 1` boundary keys.
    pub fn boundaries(&self) -> &[u64] {
        &self.boundaries
    }

    /// Total number of particles.
    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// The rank owning `key`.
    pub fn find_rank(&self, key: u64) -> usize {
        debug_assert!(key < MAX_KEY);
        // Empty ranges share their boundary with the next rank, so take the last match.
        self.boundaries.partition_point(|&boundary| boundary <= key) - 1
    }

    /// Largest relative deviation of a rank count from the mean.
    pub fn imbalance(&self) -> f64 {
        let total = self.total_count();
        if total == 0 {
            return 0.0;
        }
        let mean = total as f64 / self.num_ranks() as f64;
        self.counts
            .iter()
            .map(|&count| (count as f64 - mean).abs() / mean)
            .fold(0.0, f64::max)
    }

    /// Index ranges of sorted local keys per destination rank.
    pub fn send_ranges(&self, sorted_keys: &[u64]) -> Vec<Range<usize>> {
        let counts = sort_to_bins(sorted_keys, &self.boundaries[..self.num_ranks()]);
        let offsets = exclusive_scan(&counts);
        offsets
            .iter()
            .tuple_windows()
            .map(|(&start, &end)| start..end)
            .collect()
    }
}

/// Compute the assignment of leaves of the global tree to `num_ranks` ranks.
///
/// The leaves are walked in key order while accumulating their counts. Rank `r` ends at
/// the first leaf boundary where the running total reaches `(r + 1) * total / num_ranks`.
/// A leaf crossing that target stays with rank `r` as a whole, so every rank deviates
/// from the mean by less than the count of one leaf.
pub fn make_sfc_assignment(
    num_ranks: usize,
    tree: &[u64],
    counts: &[u64],
) -> Result<SfcAssignment, DomainError> {
    if num_ranks == 0 {
        return Err(DomainError::InvalidRankCount);
    }
    assert_eq!(num_leaves(tree), counts.len());

    let scan = exclusive_scan(counts);
    let total = *scan.last().unwrap();

    let mut leaf_boundaries = Vec::with_capacity(num_ranks + 1);
    leaf_boundaries.push(0);

    for rank in 0..num_ranks - 1 {
        let target = (total as u128 * (rank as u128 + 1) / num_ranks as u128) as u64;
        let previous = *leaf_boundaries.last().unwrap();
        // First boundary whose running total reaches the target.
        let cut = previous + scan[previous..].partition_point(|&running| running < target);
        leaf_boundaries.push(cut.min(counts.len()));
    }
    leaf_boundaries.push(counts.len());

    let boundaries = leaf_boundaries.iter().map(|&leaf| tree[leaf]).collect_vec();
    let rank_counts = leaf_boundaries
        .iter()
        .tuple_windows()
        .map(|(&start, &end)| scan[end] - scan[start])
        .collect_vec();

    let assignment = SfcAssignment {
        boundaries,
        counts: rank_counts,
        leaf_boundaries,
    };

    debug!(
        "assigned {} particles to {} ranks: {:?}",
        total,
        num_ranks,
        assignment.counts()
    );

    Ok(assignment)
}

/// Report an assignment whose imbalance exceeds `tolerance`.
///
/// Imbalance is a property of the particle distribution, never an error.
pub fn check_balance(assignment: &SfcAssignment, tolerance: f64) {
    let imbalance = assignment.imbalance();
    if imbalance > tolerance {
        warn!(
            "load imbalance {:.3} exceeds tolerance {:.3}; rank counts {:?}",
            imbalance,
            tolerance,
            assignment.counts()
        );
    }
}
