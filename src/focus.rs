//! Locally focused octree.
//!
//! The focus tree of a rank follows the global tree down to its leaves wherever a node
//! intersects the rank's key range or overlaps its focus region (the local particles
//! expanded by their interaction radii). Elsewhere nodes are aggregated as long as an
//! [AcceptanceCriterion] accepts them as seen from the focus region.

use std::ops::Range;

use itertools::Itertools;

use crate::{
    constants::{MAX_KEY, NSIBLINGS},
    geometry::{boxes_overlap, min_distance_sq, Aabb, BoundingBox, Point},
    octree::{find_leaf, is_complete_tree, num_leaves},
    sfc::{decode_node, node_box, node_range, tree_level},
    tools::exclusive_scan,
};

/// Decides whether a distant node may stand in for all particles it contains.
///
/// The threshold is owned by the long-range consumer, not by the decomposition.
pub trait AcceptanceCriterion {
    /// Return true if `node` can be treated as a single source seen from `target`.
    fn accept(&self, node: &Aabb, target: &Aabb, bbox: &BoundingBox) -> bool;
}

/// Accept every node outside the focus region. Gives the coarsest possible focus tree.
#[derive(Copy, Clone, Debug, Default)]
pub struct NearFieldOnly;

impl AcceptanceCriterion for NearFieldOnly {
    fn accept(&self, _node: &Aabb, _target: &Aabb, _bbox: &BoundingBox) -> bool {
        true
    }
}

/// Barnes-Hut opening angle: accept if `edge / distance < theta`.
#[derive(Copy, Clone, Debug)]
pub struct OpeningAngle {
    /// Opening angle threshold.
    pub theta: f64,
}

impl AcceptanceCriterion for OpeningAngle {
    fn accept(&self, node: &Aabb, target: &Aabb, bbox: &BoundingBox) -> bool {
        let distance = min_distance_sq(node, target, bbox).sqrt();
        node.max_extent() < self.theta * distance
    }
}

/// Acceptance policy selected by configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum Acceptance {
    /// See [NearFieldOnly].
    #[default]
    NearFieldOnly,
    /// See [OpeningAngle].
    OpeningAngle(f64),
}

impl AcceptanceCriterion for Acceptance {
    fn accept(&self, node: &Aabb, target: &Aabb, bbox: &BoundingBox) -> bool {
        match *self {
            Acceptance::NearFieldOnly => NearFieldOnly.accept(node, target, bbox),
            Acceptance::OpeningAngle(theta) => OpeningAngle { theta }.accept(node, target, bbox),
        }
    }
}

/// A node of the focus tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OctreeNode {
    /// First key of the node.
    pub start: u64,
    /// Level of the node.
    pub level: u32,
    /// Number of particles in the node, summed over all ranks.
    pub count: u64,
    /// Index of the parent node. `None` for the root.
    pub parent: Option<usize>,
    /// Index of the first of eight consecutive children. `None` for leaves.
    pub first_child: Option<usize>,
    /// Position among the focus leaves. `None` for internal nodes.
    pub leaf: Option<usize>,
}

impl OctreeNode {
    /// One past the last key of the node.
    pub fn end(&self) -> u64 {
        self.start + node_range(self.level)
    }

    /// Return true if the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.first_child.is_none()
    }
}

/// The focus tree of one rank for one iteration.
#[derive(Clone, Debug)]
pub struct FocusTree {
    leaves: Vec<u64>,
    counts: Vec<u64>,
    nodes: Vec<OctreeNode>,
    bbox: BoundingBox,
}

struct Builder<'a, A: AcceptanceCriterion> {
    global_tree: &'a [u64],
    global_scan: Vec<u64>,
    key_range: Range<u64>,
    region: Option<Aabb>,
    bbox: &'a BoundingBox,
    criterion: &'a A,
    nodes: Vec<OctreeNode>,
    leaves: Vec<u64>,
    counts: Vec<u64>,
}

impl<A: AcceptanceCriterion> Builder<'_, A> {
    fn global_index(&self, key: u64) -> usize {
        self.global_tree.partition_point(|&boundary| boundary < key)
    }

    fn is_global_leaf(&self, start: u64, end: u64) -> bool {
        let index = self.global_index(start);
        self.global_tree[index + 1] == end
    }

    fn count(&self, start: u64, end: u64) -> u64 {
        self.global_scan[self.global_index(end)] - self.global_scan[self.global_index(start)]
    }

    fn is_near(&self, start: u64, end: u64, aabb: &Aabb) -> bool {
        let in_key_range =
            !self.key_range.is_empty() && start < self.key_range.end && self.key_range.start < end;
        in_key_range
            || self
                .region
                .as_ref()
                .is_some_and(|region| boxes_overlap(aabb, region, self.bbox))
    }

    fn is_aggregate(&self, aabb: &Aabb) -> bool {
        match &self.region {
            Some(region) => self.criterion.accept(aabb, region, self.bbox),
            None => true,
        }
    }

    fn push_node(&mut self, start: u64, level: u32, parent: Option<usize>) -> usize {
        let count = self.count(start, start + node_range(level));
        self.nodes.push(OctreeNode {
            start,
            level,
            count,
            parent,
            first_child: None,
            leaf: None,
        });
        self.nodes.len() - 1
    }

    fn build(&mut self, index: usize) {
        let node = self.nodes[index];
        let end = node.end();
        let aabb = self.bbox.cell_aabb(&node_box(node.start, node.level));

        let is_leaf = self.is_global_leaf(node.start, end)
            || (!self.is_near(node.start, end, &aabb) && self.is_aggregate(&aabb));

        if is_leaf {
            self.nodes[index].leaf = Some(self.leaves.len());
            self.leaves.push(node.start);
            self.counts.push(node.count);
            return;
        }

        let first_child = self.nodes.len();
        let child_range = node_range(node.level + 1);
        for child in 0..NSIBLINGS {
            self.push_node(
                node.start + child as u64 * child_range,
                node.level + 1,
                Some(index),
            );
        }
        self.nodes[index].first_child = Some(first_child);

        for child in 0..NSIBLINGS {
            self.build(first_child + child);
        }
    }
}

impl FocusTree {
    /// Build the focus tree of a rank.
    ///
    /// - `global_tree`, `global_counts`: the global cornerstone tree and its leaf counts.
    /// - `key_range`: the key range assigned to the rank.
    /// - `region`: the local particles expanded by their interaction radii, `None` if the
    ///   rank holds no particles.
    pub fn build<A: AcceptanceCriterion>(
        global_tree: &[u64],
        global_counts: &[u64],
        key_range: Range<u64>,
        region: Option<Aabb>,
        bbox: &BoundingBox,
        criterion: &A,
    ) -> FocusTree {
        debug_assert!(is_complete_tree(global_tree));
        assert_eq!(num_leaves(global_tree), global_counts.len());

        let mut builder = Builder {
            global_tree,
            global_scan: exclusive_scan(global_counts),
            key_range,
            region,
            bbox,
            criterion,
            nodes: Vec::new(),
            leaves: Vec::new(),
            counts: Vec::new(),
        };

        builder.push_node(0, 0, None);
        builder.build(0);

        let mut leaves = builder.leaves;
        leaves.push(MAX_KEY);
        debug_assert!(is_complete_tree(&leaves));

        FocusTree {
            leaves,
            counts: builder.counts,
            nodes: builder.nodes,
            bbox: *bbox,
        }
    }

    /// Leaf boundaries in cornerstone format.
    pub fn leaves(&self) -> &[u64] {
        &self.leaves
    }

    /// Particle counts of the leaves.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Number of leaves.
    pub fn num_leaves(&self) -> usize {
        self.counts.len()
    }

    /// All nodes. The root is at index 0 and the children of a node are stored
    /// contiguously in key order.
    pub fn nodes(&self) -> &[OctreeNode] {
        &self.nodes
    }

    /// Deepest leaf level.
    pub fn depth(&self) -> u32 {
        self.leaves
            .iter()
            .tuple_windows()
            .map(|(&start, &end)| tree_level(end - start))
            .max()
            .unwrap_or(0)
    }

    /// Index of the leaf containing `key`.
    pub fn find_leaf(&self, key: u64) -> usize {
        find_leaf(&self.leaves, key)
    }

    /// Physical centre and half edge lengths of leaf `index`.
    pub fn leaf_geometry(&self, index: usize) -> (Point, Point) {
        let start = self.leaves[index];
        let level = tree_level(self.leaves[index + 1] - start);
        decode_node(start, level, &self.bbox)
    }

    /// Physical extent of node `index`.
    pub fn node_aabb(&self, index: usize) -> Aabb {
        let node = &self.nodes[index];
        self.bbox.cell_aabb(&node_box(node.start, node.level))
    }

    /// Ask `criterion` whether node `index` can act as a single source for `target`.
    pub fn accepts<A: AcceptanceCriterion>(
        &self,
        index: usize,
        criterion: &A,
        target: &Aabb,
    ) -> bool {
        criterion.accept(&self.node_aabb(index), target, &self.bbox)
    }
}
