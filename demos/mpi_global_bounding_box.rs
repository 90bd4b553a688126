//! Test the computation of a global bounding box across MPI ranks.

use cornerstone_domain::{
    comm::{Communicator, MpiComm},
    geometry::{compute_global_bounding_box, BoundingBox},
    tools::{gather_to_all, generate_random_points, seeded_rng},
};

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let world = universe.world();
    let comm = MpiComm::new(&world);

    // Create `npoints` per rank inside a box that differs between ranks.
    let npoints = 10;
    let offset = comm.rank() as f64;
    let bbox = BoundingBox::open([offset, 0.0, 0.0, offset + 1.0, 1.0, 1.0]).unwrap();
    let (x, y, z) = generate_random_points(npoints, &bbox, &mut seeded_rng(comm.rank()));

    // Compute the distributed bounding box.
    let global = compute_global_bounding_box(&x, &y, &z, &bbox, &comm).unwrap();

    // Every rank sees all points and must find them inside the global box.
    let all_x = gather_to_all(&x, &comm).unwrap();
    let all_y = gather_to_all(&y, &comm).unwrap();
    let all_z = gather_to_all(&z, &comm).unwrap();

    let (min, max) = (global.min(), global.max());
    for (axis, values) in [all_x, all_y, all_z].iter().enumerate() {
        assert!(values
            .iter()
            .all(|&value| min[axis] <= value && value <= max[axis]));
    }

    if comm.rank() == 0 {
        println!("Global bounding box: {}", global);
    }
}
