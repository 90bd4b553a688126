//! Halo discovery.
//!
//! Every rank describes the space its particles interact with by an expanded region,
//! the bounding box of all spheres `[p - h, p + h]` around its particles. The regions
//! are gathered on all ranks. A rank then receives every non-empty leaf of a peer whose
//! cell overlaps its own region and sends every non-empty leaf of its own whose cell
//! overlaps a peer's region. Both sides evaluate the same overlap test on replicated
//! data (global tree, counts and regions), so the send set of one rank is exactly the
//! receive set of the other without a second round of communication.

use itertools::izip;
use log::debug;

use crate::{
    assignment::SfcAssignment,
    comm::Communicator,
    error::CommError,
    geometry::{boxes_overlap, Aabb, BoundingBox},
    octree::{leaf_level, num_leaves},
    sfc::node_box,
    tools::gather_to_all,
};

/// Relative padding of the expanded regions.
///
/// Leaf cells are decoded in floating point and may miss the particles they contain by
/// a rounding error.
const REGION_PADDING: f64 = 1e-12;

/// Leaves exchanged with one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCells {
    /// The peer rank.
    pub rank: usize,
    /// Indices of global leaves, ascending.
    pub leaves: Vec<usize>,
    /// Number of particles in the leaves.
    pub count: u64,
}

/// The halo send and receive sets of a rank.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HaloPlan {
    send: Vec<PeerCells>,
    recv: Vec<PeerCells>,
}

impl HaloPlan {
    /// Leaves to send, one entry per peer with a non-empty set, ordered by rank.
    pub fn send(&self) -> &[PeerCells] {
        &self.send
    }

    /// Leaves to receive, one entry per peer with a non-empty set, ordered by rank.
    pub fn recv(&self) -> &[PeerCells] {
        &self.recv
    }

    /// Number of halo particles this rank receives.
    pub fn halo_count(&self) -> u64 {
        self.recv.iter().map(|peer| peer.count).sum()
    }

    /// Number of particles this rank sends.
    pub fn send_count(&self) -> u64 {
        self.send.iter().map(|peer| peer.count).sum()
    }

    /// Ranks this rank receives from.
    pub fn recv_ranks(&self) -> Vec<usize> {
        self.recv.iter().map(|peer| peer.rank).collect()
    }
}

/// Bounding box of the interaction spheres of the local particles.
///
/// Coordinates on periodic axes are wrapped into the box first. Returns `None` if there
/// are no local particles.
pub fn expanded_region(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    h: &[f64],
    bbox: &BoundingBox,
) -> Option<Aabb> {
    let mut region: Option<Aabb> = None;

    for (&xi, &yi, &zi, &hi) in izip!(x, y, z, h) {
        let point = bbox.wrap([xi, yi, zi]);
        let lower = [point[0] - hi, point[1] - hi, point[2] - hi];
        let upper = [point[0] + hi, point[1] + hi, point[2] + hi];
        match region.as_mut() {
            Some(aabb) => {
                aabb.expand_to(lower);
                aabb.expand_to(upper);
            }
            None => {
                region = Some(Aabb {
                    min: lower,
                    max: upper,
                })
            }
        }
    }

    let padding = REGION_PADDING * bbox.lengths().into_iter().fold(0.0, f64::max);
    region.map(|aabb| aabb.inflate(padding))
}

fn encode_region(region: Option<Aabb>) -> [f64; 7] {
    match region {
        Some(Aabb { min, max }) => [1.0, min[0], min[1], min[2], max[0], max[1], max[2]],
        None => [0.0; 7],
    }
}

fn decode_region(values: &[f64]) -> Option<Aabb> {
    (values[0] != 0.0).then(|| Aabb {
        min: [values[1], values[2], values[3]],
        max: [values[4], values[5], values[6]],
    })
}

/// Gather the expanded regions of all ranks, ordered by rank.
pub fn gather_regions<C: Communicator>(
    region: Option<Aabb>,
    comm: &C,
) -> Result<Vec<Option<Aabb>>, CommError> {
    let gathered = gather_to_all(&encode_region(region), comm)?;
    if gathered.len() != 7 * comm.size() {
        return Err(CommError::Malformed {
            peer: comm.rank(),
            reason: "gathered regions do not hold seven values per rank",
        });
    }
    Ok(gathered.chunks_exact(7).map(decode_region).collect())
}

/// Physical extent of global leaf `index`.
pub fn leaf_aabb(tree: &[u64], index: usize, bbox: &BoundingBox) -> Aabb {
    bbox.cell_aabb(&node_box(tree[index], leaf_level(tree, index)))
}

fn overlapping_leaves(
    tree: &[u64],
    counts: &[u64],
    leaves: std::ops::Range<usize>,
    region: &Aabb,
    bbox: &BoundingBox,
) -> PeerCells {
    let leaves = leaves
        .filter(|&leaf| {
            counts[leaf] > 0 && boxes_overlap(&leaf_aabb(tree, leaf, bbox), region, bbox)
        })
        .collect::<Vec<_>>();
    let count = leaves.iter().map(|&leaf| counts[leaf]).sum();
    PeerCells {
        rank: 0,
        leaves,
        count,
    }
}

/// Compute the halo plan of `rank`.
///
/// `regions` holds the expanded region of every rank as returned by [gather_regions].
pub fn discover_halos(
    tree: &[u64],
    counts: &[u64],
    assignment: &SfcAssignment,
    regions: &[Option<Aabb>],
    rank: usize,
    bbox: &BoundingBox,
) -> HaloPlan {
    assert_eq!(num_leaves(tree), counts.len());
    assert_eq!(regions.len(), assignment.num_ranks());

    let mut plan = HaloPlan::default();

    for peer in (0..assignment.num_ranks()).filter(|&peer| peer != rank) {
        if let Some(own_region) = &regions[rank] {
            let leaves = assignment.leaf_range(peer);
            let cells = overlapping_leaves(tree, counts, leaves, own_region, bbox);
            if !cells.leaves.is_empty() {
                plan.recv.push(PeerCells { rank: peer, ..cells });
            }
        }

        if let Some(peer_region) = &regions[peer] {
            let leaves = assignment.leaf_range(rank);
            let cells = overlapping_leaves(tree, counts, leaves, peer_region, bbox);
            if !cells.leaves.is_empty() {
                plan.send.push(PeerCells { rank: peer, ..cells });
            }
        }
    }

    debug!(
        "rank {} receives {} halos from {} peers, sends {} particles to {} peers",
        rank,
        plan.halo_count(),
        plan.recv.len(),
        plan.send_count(),
        plan.send.len()
    );

    plan
}
