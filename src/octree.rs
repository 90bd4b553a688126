//! Cornerstone octree construction.
//!
//! A cornerstone tree is stored as the sorted array of its leaf boundaries:
//! `nleaves + 1` keys starting at `0` and ending at [MAX_KEY]. Leaf `i` covers the key
//! range `[tree[i], tree[i + 1])`, which is always the range of a single octree node.
//! The leaves partition the key space without gaps or overlaps.

use itertools::Itertools;
use log::{debug, warn};

use crate::{
    backend::Backend,
    comm::Communicator,
    constants::{MAX_KEY, MAX_LEVEL, NSIBLINGS},
    error::DomainError,
    sfc::{is_node_range, node_range, octal_digit, tree_level},
    tools::exclusive_scan,
};

/// What to do with a leaf in the next rebalancing pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeOp {
    /// Keep the leaf.
    Keep,
    /// Replace the leaf by its eight children.
    Split,
    /// Replace the leaf and its seven following siblings by their parent.
    Fuse,
    /// The leaf disappears into the parent created by a preceding [NodeOp::Fuse].
    Remove,
}

impl NodeOp {
    /// Number of leaf boundaries this op produces.
    fn output_len(self) -> u64 {
        match self {
            NodeOp::Keep => 1,
            NodeOp::Split => NSIBLINGS as u64,
            NodeOp::Fuse => 1,
            NodeOp::Remove => 0,
        }
    }
}

/// The tree consisting of the root only.
pub fn root_tree() -> Vec<u64> {
    vec![0, MAX_KEY]
}

/// Number of leaves of a cornerstone tree.
pub fn num_leaves(tree: &[u64]) -> usize {
    tree.len() - 1
}

/// Level of leaf `index`.
pub fn leaf_level(tree: &[u64], index: usize) -> u32 {
    tree_level(tree[index + 1] - tree[index])
}

/// Index of the leaf containing `key`.
pub fn find_leaf(tree: &[u64], key: u64) -> usize {
    debug_assert!(key < MAX_KEY);
    tree.partition_point(|&boundary| boundary <= key) - 1
}

/// Return true if `tree` is a valid cornerstone tree.
pub fn is_complete_tree(tree: &[u64]) -> bool {
    if tree.len() < 2 || tree[0] != 0 || *tree.last().unwrap() != MAX_KEY {
        return false;
    }
    tree.iter()
        .tuple_windows()
        .all(|(&start, &end)| is_node_range(start, end))
}

/// Count the sorted keys falling into each leaf.
pub fn compute_node_counts(tree: &[u64], sorted_keys: &[u64]) -> Vec<u64> {
    debug_assert!(sorted_keys.windows(2).all(|pair| pair[0] <= pair[1]));

    let positions = tree
        .iter()
        .map(|&boundary| sorted_keys.partition_point(|&key| key < boundary) as u64)
        .collect_vec();

    positions
        .iter()
        .tuple_windows()
        .map(|(start, end)| end - start)
        .collect()
}

/// Decide the rebalancing op of leaf `index`.
///
/// A leaf is split if it holds more than `bucket_size` keys and is not on the deepest
/// level. Eight sibling leaves are fused if their combined count is below
/// `bucket_size / 8`; the gap between the two thresholds prevents oscillation.
pub fn calculate_node_op(tree: &[u64], index: usize, counts: &[u64], bucket_size: u64) -> NodeOp {
    let start = tree[index];
    let level = leaf_level(tree, index);

    let digit = if level > 0 { octal_digit(start, level) } else { 0 };

    if level > 0 && digit <= index {
        let first = index - digit;
        let range = node_range(level);
        let parent_start = start - digit as u64 * range;

        // All eight siblings must be leaves of this tree for a fuse.
        let siblings_are_leaves = first + NSIBLINGS < tree.len()
            && tree[first] == parent_start
            && (0..NSIBLINGS).all(|sibling| {
                tree[first + sibling + 1] - tree[first + sibling] == range
            });

        if siblings_are_leaves {
            let combined: u64 = counts[first..first + NSIBLINGS].iter().sum();
            if combined < bucket_size / NSIBLINGS as u64 {
                return if digit == 0 { NodeOp::Fuse } else { NodeOp::Remove };
            }
        }
    }

    if counts[index] > bucket_size && level < MAX_LEVEL {
        NodeOp::Split
    } else {
        NodeOp::Keep
    }
}

/// Apply rebalancing ops to a tree.
///
/// Returns the new tree and whether it is unchanged.
pub fn rebalance_tree(tree: &[u64], ops: &[NodeOp]) -> (Vec<u64>, bool) {
    debug_assert_eq!(ops.len(), num_leaves(tree));

    let converged = ops.iter().all(|&op| op == NodeOp::Keep);
    if converged {
        return (tree.to_vec(), true);
    }

    let offsets = exclusive_scan(&ops.iter().map(|op| op.output_len()).collect_vec());
    let mut new_tree = vec![0u64; *offsets.last().unwrap() as usize + 1];

    for (index, &op) in ops.iter().enumerate() {
        let offset = offsets[index] as usize;
        let start = tree[index];
        match op {
            NodeOp::Keep => new_tree[offset] = start,
            NodeOp::Fuse => new_tree[offset] = start,
            NodeOp::Remove => {}
            NodeOp::Split => {
                let child_range = (tree[index + 1] - start) / NSIBLINGS as u64;
                for child in 0..NSIBLINGS {
                    new_tree[offset + child] = start + child as u64 * child_range;
                }
            }
        }
    }
    *new_tree.last_mut().unwrap() = MAX_KEY;

    debug_assert!(is_complete_tree(&new_tree));
    (new_tree, false)
}

/// One rebalancing pass. Returns true if the tree did not change.
pub fn update_octree(tree: &mut Vec<u64>, counts: &[u64], bucket_size: u64) -> bool {
    let ops = (0..num_leaves(tree))
        .map(|index| calculate_node_op(tree, index, counts, bucket_size))
        .collect_vec();
    let (new_tree, converged) = rebalance_tree(tree, &ops);
    *tree = new_tree;
    converged
}

fn check_bucket_size(bucket_size: u64) -> Result<(), DomainError> {
    if bucket_size == 0 {
        Err(DomainError::InvalidBucketSize)
    } else {
        Ok(())
    }
}

/// Report leaves that exceed the bucket size because they cannot be split any further.
fn warn_overfull_leaves(tree: &[u64], counts: &[u64], bucket_size: u64) {
    let overfull = counts
        .iter()
        .enumerate()
        .filter(|&(_, &count)| count > bucket_size)
        .collect_vec();

    if let Some(&(index, &count)) = overfull.iter().max_by_key(|(_, count)| **count) {
        warn!(
            "{} leaves on level {} exceed the bucket size {}; the largest holds {} particles (key {})",
            overfull.len(),
            MAX_LEVEL,
            bucket_size,
            count,
            tree[index]
        );
    }
}

/// Build a tree over locally available sorted keys.
///
/// Starts from `warm_start` (or the root) and iterates split/fuse passes to a fixed point.
/// Returns the tree and its leaf counts.
pub fn compute_octree(
    sorted_keys: &[u64],
    bucket_size: u64,
    warm_start: Option<&[u64]>,
) -> Result<(Vec<u64>, Vec<u64>), DomainError> {
    check_bucket_size(bucket_size)?;

    let mut tree = warm_start.map_or_else(root_tree, <[u64]>::to_vec);
    debug_assert!(is_complete_tree(&tree));

    let mut passes = 0;
    loop {
        let counts = compute_node_counts(&tree, sorted_keys);
        passes += 1;
        if update_octree(&mut tree, &counts, bucket_size) {
            debug!(
                "local octree converged after {} passes with {} leaves",
                passes,
                num_leaves(&tree)
            );
            warn_overfull_leaves(&tree, &counts, bucket_size);
            return Ok((tree, counts));
        }
    }
}

/// Build the global tree across all ranks.
///
/// In every pass each rank counts its local keys against the shared trial tree and the
/// counts are summed with an integer all-reduce. All ranks therefore see the same counts,
/// take the same split/fuse decisions and end with bit-identical trees.
pub fn update_octree_global<C: Communicator, B: Backend>(
    local_sorted_keys: &[u64],
    bucket_size: u64,
    warm_start: &[u64],
    comm: &C,
    backend: &B,
) -> Result<(Vec<u64>, Vec<u64>), DomainError> {
    check_bucket_size(bucket_size)?;
    debug_assert!(is_complete_tree(warm_start));

    let mut tree = warm_start.to_vec();
    let mut passes = 0;

    loop {
        let local_counts = backend.compute_node_counts(&tree, local_sorted_keys);
        let counts = comm.all_reduce_sum(&local_counts)?;
        passes += 1;
        if update_octree(&mut tree, &counts, bucket_size) {
            debug!(
                "global octree converged after {} passes with {} leaves",
                passes,
                num_leaves(&tree)
            );
            if comm.rank() == 0 {
                warn_overfull_leaves(&tree, &counts, bucket_size);
            }
            return Ok((tree, counts));
        }
    }
}

#[cfg(test)]
mod test {
    use super::{
        calculate_node_op, compute_node_counts, compute_octree, find_leaf, is_complete_tree,
        leaf_level, num_leaves, rebalance_tree, root_tree, update_octree_global, NodeOp,
    };
    use crate::{
        backend::{ParallelBackend, SerialBackend},
        comm::{SingleRank, ThreadComm},
        constants::{MAX_KEY, MAX_LEVEL},
        error::DomainError,
        sfc::node_range,
        tools::{generate_random_keys, seeded_rng},
    };

    fn sorted_random_keys(n: usize, seed: usize) -> Vec<u64> {
        let mut rng = seeded_rng(seed);
        let mut keys = generate_random_keys(n, &mut rng);
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_split_root() {
        let tree = root_tree();
        let (tree, converged) = rebalance_tree(&tree, &[NodeOp::Split]);
        assert!(!converged);
        assert_eq!(num_leaves(&tree), 8);
        assert!(is_complete_tree(&tree));
        assert_eq!(tree[1], node_range(1));
    }

    #[test]
    fn test_fuse_siblings() {
        let (tree, _) = rebalance_tree(&root_tree(), &[NodeOp::Split]);
        let counts = vec![1u64; 8];
        let ops = (0..8)
            .map(|index| calculate_node_op(&tree, index, &counts, 128))
            .collect::<Vec<_>>();
        assert_eq!(ops[0], NodeOp::Fuse);
        assert!(ops[1..].iter().all(|&op| op == NodeOp::Remove));

        let (fused, _) = rebalance_tree(&tree, &ops);
        assert_eq!(fused, root_tree());
    }

    #[test]
    fn test_no_fuse_above_threshold() {
        let (tree, _) = rebalance_tree(&root_tree(), &[NodeOp::Split]);
        // The combined count 16 equals bucket_size / 8 and is not below it.
        let counts = vec![2u64; 8];
        for index in 0..8 {
            assert_eq!(calculate_node_op(&tree, index, &counts, 128), NodeOp::Keep);
        }
    }

    #[test]
    fn test_complete_and_bounded() {
        let keys = sorted_random_keys(10000, 0);
        let (tree, counts) = compute_octree(&keys, 64, None).unwrap();

        assert!(is_complete_tree(&tree));
        assert_eq!(counts.iter().sum::<u64>(), keys.len() as u64);
        assert!(counts.iter().all(|&count| count <= 64));

        // Every key falls into exactly one leaf.
        for &key in keys.iter().step_by(97) {
            let leaf = find_leaf(&tree, key);
            assert!(tree[leaf] <= key && key < tree[leaf + 1]);
        }
    }

    #[test]
    fn test_warm_start_is_fixed_point() {
        let keys = sorted_random_keys(5000, 1);
        let (tree, counts) = compute_octree(&keys, 32, None).unwrap();
        let (again, counts_again) = compute_octree(&keys, 32, Some(&tree)).unwrap();
        assert_eq!(tree, again);
        assert_eq!(counts, counts_again);
    }

    #[test]
    fn test_identical_keys_terminate() {
        let keys = vec![12345u64; 10000];
        let (tree, counts) = compute_octree(&keys, 100, None).unwrap();

        assert!(is_complete_tree(&tree));
        let leaf = find_leaf(&tree, 12345);
        assert_eq!(counts[leaf], 10000);
        assert_eq!(leaf_level(&tree, leaf), MAX_LEVEL);
    }

    #[test]
    fn test_empty_keys() {
        let (tree, counts) = compute_octree(&[], 16, None).unwrap();
        assert_eq!(tree, vec![0, MAX_KEY]);
        assert_eq!(counts, vec![0]);
    }

    #[test]
    fn test_invalid_bucket_size() {
        assert_eq!(
            compute_octree(&[1, 2], 0, None),
            Err(DomainError::InvalidBucketSize)
        );
    }

    #[test]
    fn test_node_counts() {
        let tree = vec![0, 8, 16, 24, 32, 40, 48, 56, 64, MAX_KEY];
        let counts = compute_node_counts(&tree, &[0, 7, 8, 63, 64, 1000]);
        assert_eq!(counts, vec![2, 1, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_global_tree_matches_serial() {
        let keys = sorted_random_keys(4000, 2);
        let (serial_tree, serial_counts) = compute_octree(&keys, 50, None).unwrap();

        let (single_tree, _) =
            update_octree_global(&keys, 50, &root_tree(), &SingleRank, &SerialBackend).unwrap();
        assert_eq!(single_tree, serial_tree);

        let results = ThreadComm::run(4, |comm| {
            use crate::comm::Communicator;
            let chunk = keys.len() / comm.size();
            let local = &keys[comm.rank() * chunk..(comm.rank() + 1) * chunk];
            update_octree_global(local, 50, &root_tree(), &comm, &ParallelBackend).unwrap()
        });

        for (tree, counts) in results {
            assert_eq!(tree, serial_tree);
            assert_eq!(counts, serial_counts);
        }
    }
}
