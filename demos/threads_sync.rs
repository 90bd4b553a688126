//! Run decomposition steps of a particle cloud on ranks living in threads of one process.

use std::time::Instant;

use cornerstone_domain::{
    comm::{Communicator, ThreadComm},
    config::DomainConfig,
    domain::Domain,
    exchange::ParticleData,
    focus::Acceptance,
    geometry::{Boundary, BoundingBox},
    tools::{generate_random_points, seeded_rng},
};

pub fn main() {
    let nranks = 4;
    let npoints = 20000;

    ThreadComm::run(nranks, |comm| {
        let rank = comm.rank();
        let bbox = BoundingBox::unit(Boundary::Periodic);
        let (x, y, z) = generate_random_points(npoints, &bbox, &mut seeded_rng(rank));
        let mut data = ParticleData::new(x, y, z, vec![0.01; npoints])
            .with_field(vec![1.0f64; npoints]);

        let config = DomainConfig::default()
            .with_bounding_box(bbox)
            .with_bucket_size(32)
            .with_acceptance(Acceptance::OpeningAngle(0.5));
        let mut domain = Domain::new(comm, config).unwrap();

        for step in 0..3 {
            let start = Instant::now();
            let summary = domain.sync(&mut data).unwrap();
            let duration = start.elapsed();

            println!(
                "Rank {} step {}: {} local, {} halos, focus tree {} leaves (depth {}), {} ms",
                rank,
                step,
                summary.local_count,
                summary.halo_count,
                summary.focus_leaves,
                summary.focus_depth,
                duration.as_millis()
            );

            for index in domain.local_range() {
                data.z[index] += 0.003;
            }
        }
    });
}
