//! The decomposition driver.
//!
//! [Domain::sync] runs one decomposition step: fit the box, encode and sort the local
//! particles, build the global tree, assign key ranges to ranks, migrate particles to
//! their owners, build the focus tree and finally discover and exchange halos.
//!
//! After a step the particle arrays hold the owned particles in `[0, local_count)`,
//! sorted by key, followed by `halo_count` read-only halo particles.

use std::ops::Range;

use log::{debug, info};

use crate::{
    assignment::{check_balance, make_sfc_assignment, SfcAssignment},
    backend::{Backend, BackendKind, SerialBackend},
    comm::Communicator,
    config::DomainConfig,
    error::DomainError,
    exchange::{exchange_halos, migrate, ParticleData},
    focus::FocusTree,
    geometry::{compute_global_bounding_box, BoundingBox},
    halos::{discover_halos, expanded_region, gather_regions, HaloPlan},
    octree::{num_leaves, root_tree, update_octree_global},
    tools::{global_size, reorder},
};

/// Result of a decomposition step on one rank.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncSummary {
    /// Number of owned particles.
    pub local_count: usize,
    /// Number of halo particles appended after the owned ones.
    pub halo_count: usize,
    /// The box used for this step.
    pub bounding_box: BoundingBox,
    /// Number of particles this rank sent to other owners.
    pub migrated: usize,
    /// Number of leaves of the global tree.
    pub global_leaves: usize,
    /// Number of leaves of the focus tree.
    pub focus_leaves: usize,
    /// Deepest level of the focus tree.
    pub focus_depth: u32,
}

/// Domain decomposition state of one rank, carried from step to step.
pub struct Domain<C: Communicator, B: Backend = SerialBackend> {
    comm: C,
    backend: B,
    config: DomainConfig,
    bbox: BoundingBox,
    tree: Vec<u64>,
    counts: Vec<u64>,
    assignment: Option<SfcAssignment>,
    focus: Option<FocusTree>,
    halo_plan: HaloPlan,
    keys: Vec<u64>,
    local_count: usize,
    halo_count: usize,
    iteration: usize,
}

impl<C: Communicator> Domain<C, SerialBackend> {
    /// Create a domain running on the calling thread.
    pub fn new(comm: C, config: DomainConfig) -> Result<Self, DomainError> {
        Self::with_backend(comm, SerialBackend, config)
    }
}

impl<C: Communicator, B: Backend> Domain<C, B> {
    /// Create a domain with a specific backend.
    pub fn with_backend(comm: C, backend: B, config: DomainConfig) -> Result<Self, DomainError> {
        config.validate()?;
        if comm.size() == 0 {
            return Err(DomainError::InvalidRankCount);
        }

        Ok(Self {
            comm,
            backend,
            bbox: config.bounding_box,
            config,
            tree: root_tree(),
            counts: vec![0],
            assignment: None,
            focus: None,
            halo_plan: HaloPlan::default(),
            keys: Vec::new(),
            local_count: 0,
            halo_count: 0,
            iteration: 0,
        })
    }

    /// Run one decomposition step.
    ///
    /// `data` holds the local particles. Halos appended to it by the previous step are
    /// dropped first; every other particle is treated as owned.
    pub fn sync(&mut self, data: &mut ParticleData) -> Result<SyncSummary, DomainError> {
        data.drop_halos();
        data.validate()?;

        let rank = self.comm.rank();

        if !self.config.fixed_box {
            self.bbox =
                compute_global_bounding_box(&data.x, &data.y, &data.z, &self.bbox, &self.comm)?;
        }

        let keys = self.backend.encode_keys(&data.x, &data.y, &data.z, &self.bbox)?;
        let permutation = self.backend.sort_permutation(&keys);
        data.reorder(&permutation, &self.backend);
        let mut keys = reorder(&keys, &permutation);

        let (tree, counts) = update_octree_global(
            &keys,
            self.config.bucket_size,
            &self.tree,
            &self.comm,
            &self.backend,
        )?;

        let assignment = make_sfc_assignment(self.comm.size(), &tree, &counts)?;
        check_balance(&assignment, self.config.balance_tolerance);

        let migrated = migrate(data, &mut keys, &assignment, &self.comm, &self.backend)?;
        let local_count = data.len();

        let total = global_size(&keys, &self.comm)? as u64;
        if total != assignment.total_count() {
            return Err(DomainError::ParticleCountMismatch {
                expected: assignment.total_count(),
                actual: total,
            });
        }

        let region = expanded_region(&data.x, &data.y, &data.z, &data.h, &self.bbox);
        let regions = gather_regions(region, &self.comm)?;

        let focus = FocusTree::build(
            &tree,
            &counts,
            assignment.key_range(rank),
            region,
            &self.bbox,
            &self.config.acceptance,
        );

        let halo_plan = discover_halos(&tree, &counts, &assignment, &regions, rank, &self.bbox);
        let halo_count = exchange_halos(data, &keys, &halo_plan, &tree, &self.comm, &self.backend)?;

        let summary = SyncSummary {
            local_count,
            halo_count,
            bounding_box: self.bbox,
            migrated,
            global_leaves: num_leaves(&tree),
            focus_leaves: focus.num_leaves(),
            focus_depth: focus.depth(),
        };

        debug!(
            "rank {}: {} particles, {} halos, {} migrated, focus tree {} leaves at depth {}",
            rank, local_count, halo_count, migrated, summary.focus_leaves, summary.focus_depth
        );
        if rank == 0 {
            info!(
                "step {}: {} particles, global tree {} leaves, {} halos, \
                 focus tree {} leaves at depth {}, box {}",
                self.iteration,
                total,
                summary.global_leaves,
                halo_count,
                summary.focus_leaves,
                summary.focus_depth,
                self.bbox
            );
        }

        self.tree = tree;
        self.counts = counts;
        self.assignment = Some(assignment);
        self.focus = Some(focus);
        self.halo_plan = halo_plan;
        self.keys = keys;
        self.local_count = local_count;
        self.halo_count = halo_count;
        self.iteration += 1;

        Ok(summary)
    }

    /// The communicator.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// The backend capability.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// The configuration.
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// The box of the last step.
    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bbox
    }

    /// Leaf boundaries of the global tree.
    pub fn global_tree(&self) -> &[u64] {
        &self.tree
    }

    /// Particle counts of the global leaves.
    pub fn global_counts(&self) -> &[u64] {
        &self.counts
    }

    /// The assignment of the last step. `None` before the first step.
    pub fn assignment(&self) -> Option<&SfcAssignment> {
        self.assignment.as_ref()
    }

    /// The focus tree of the last step. `None` before the first step.
    pub fn focus_tree(&self) -> Option<&FocusTree> {
        self.focus.as_ref()
    }

    /// The halo plan of the last step.
    pub fn halo_plan(&self) -> &HaloPlan {
        &self.halo_plan
    }

    /// Sorted keys of the owned particles.
    pub fn local_keys(&self) -> &[u64] {
        &self.keys
    }

    /// Number of owned particles.
    pub fn local_count(&self) -> usize {
        self.local_count
    }

    /// Number of halo particles.
    pub fn halo_count(&self) -> usize {
        self.halo_count
    }

    /// First index of the owned particles.
    pub fn start_index(&self) -> usize {
        0
    }

    /// One past the last index of the owned particles.
    pub fn end_index(&self) -> usize {
        self.local_count
    }

    /// Index range of the owned particles.
    pub fn local_range(&self) -> Range<usize> {
        self.start_index()..self.end_index()
    }

    /// Number of completed steps.
    pub fn iteration(&self) -> usize {
        self.iteration
    }
}

#[cfg(test)]
mod test {
    use rand_distr::{Distribution, Normal};

    use super::Domain;
    use crate::{
        backend::{BackendKind, ParallelBackend},
        comm::SingleRank,
        config::DomainConfig,
        error::DomainError,
        exchange::ParticleData,
        geometry::{Boundary, BoundingBox},
        octree::is_complete_tree,
        tools::{generate_random_points, seeded_rng},
    };

    #[test]
    fn test_single_rank_sync() {
        let bbox = BoundingBox::unit(Boundary::Periodic);
        let (x, y, z) = generate_random_points(1000, &bbox, &mut seeded_rng(1));
        let mut data = ParticleData::new(x, y, z, vec![0.05; 1000]);

        let config = DomainConfig::default()
            .with_bounding_box(bbox)
            .with_bucket_size(32);
        let mut domain = Domain::new(SingleRank, config).unwrap();

        let summary = domain.sync(&mut data).unwrap();
        assert_eq!(summary.local_count, 1000);
        assert_eq!(summary.halo_count, 0);
        assert_eq!(summary.migrated, 0);
        assert_eq!(summary.bounding_box, bbox);
        assert_eq!(summary.focus_leaves, summary.global_leaves);
        assert!(is_complete_tree(domain.global_tree()));
        assert!(domain.local_keys().windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(domain.local_range(), 0..1000);

        let tree = domain.global_tree().to_vec();
        let again = domain.sync(&mut data).unwrap();
        assert_eq!(again, summary);
        assert_eq!(domain.global_tree(), tree.as_slice());
        assert_eq!(domain.iteration(), 2);
    }

    #[test]
    fn test_open_box_refit() {
        let bbox = BoundingBox::open([-1.0, -1.0, -1.0, 1.0, 1.0, 1.0]).unwrap();
        let (x, y, z) = generate_random_points(200, &bbox, &mut seeded_rng(2));
        let mut data = ParticleData::new(x, y, z, vec![0.1; 200]);

        let mut domain =
            Domain::with_backend(SingleRank, ParallelBackend, DomainConfig::default()).unwrap();
        assert_eq!(domain.backend_kind(), BackendKind::Parallel);

        let summary = domain.sync(&mut data).unwrap();
        let fitted = summary.bounding_box;
        for axis in 0..3 {
            assert!(fitted.min()[axis] < -0.9 && fitted.min()[axis] >= -1.0 - 1e-6);
            assert!(fitted.max()[axis] > 0.9 && fitted.max()[axis] <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn test_clustered_particles() {
        let normal = Normal::new(0.0, 0.1).unwrap();
        let mut rng = seeded_rng(3);
        let mut sample = || (0..500).map(|_| normal.sample(&mut rng)).collect::<Vec<_>>();
        let (x, y, z) = (sample(), sample(), sample());
        let mut data = ParticleData::new(x, y, z, vec![0.01; 500]);

        let config = DomainConfig::default().with_bucket_size(10);
        let mut domain = Domain::new(SingleRank, config).unwrap();
        let summary = domain.sync(&mut data).unwrap();

        assert_eq!(summary.local_count, 500);
        assert!(domain.global_counts().iter().all(|&count| count <= 10));
        assert!(summary.focus_depth > 2);
    }

    #[test]
    fn test_fixed_box_rejects_outside_points() {
        let config = DomainConfig::default().with_fixed_box(true);
        let mut domain = Domain::new(SingleRank, config).unwrap();
        let mut data = ParticleData::new(vec![0.5, 2.0], vec![0.5; 2], vec![0.5; 2], vec![0.1; 2]);
        assert!(matches!(
            domain.sync(&mut data),
            Err(DomainError::PointOutsideBox { axis: 0, .. })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let mut domain = Domain::new(SingleRank, DomainConfig::default()).unwrap();
        let mut data = ParticleData::new(vec![0.5; 2], vec![0.5; 2], vec![0.5], vec![0.1; 2]);
        assert!(matches!(
            domain.sync(&mut data),
            Err(DomainError::LengthMismatch { name: "z", .. })
        ));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Domain::new(SingleRank, DomainConfig::default().with_bucket_size(0)),
            Err(DomainError::InvalidBucketSize)
        ));
    }
}
