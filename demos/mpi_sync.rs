//! Run a few decomposition steps of drifting particles across MPI ranks.

use cornerstone_domain::{
    comm::{Communicator, MpiComm},
    config::DomainConfig,
    domain::Domain,
    exchange::ParticleData,
    geometry::{Boundary, BoundingBox},
    tools::{generate_random_points, seeded_rng},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let world = universe.world();
    let comm = MpiComm::new(&world);
    let rank = comm.rank();

    // Create `npoints` per rank in a periodic unit cube.
    let npoints = 10000;
    let bbox = BoundingBox::unit(Boundary::Periodic);
    let (x, y, z) = generate_random_points(npoints, &bbox, &mut seeded_rng(rank));
    let mut data = ParticleData::new(x, y, z, vec![0.02; npoints]);

    let config = DomainConfig::default()
        .with_bounding_box(bbox)
        .with_bucket_size(64);
    let mut domain = Domain::new(comm, config).unwrap();

    for step in 0..5 {
        let summary = domain.sync(&mut data).unwrap();

        println!(
            "Rank {}, step {}: {} local particles, {} halos, {} migrated.",
            rank, step, summary.local_count, summary.halo_count, summary.migrated
        );

        // Drift the owned particles. Halos are read-only and dropped by the next step.
        for index in domain.local_range() {
            data.x[index] += 0.01;
            data.y[index] -= 0.005;
        }
    }
}
