use cornerstone_domain::{
    comm::{Communicator, ThreadComm},
    config::DomainConfig,
    domain::{Domain, SyncSummary},
    exchange::{Field, ParticleData},
    focus::Acceptance,
    geometry::{distance_sq, Boundary, BoundingBox},
    sfc::sfc_key,
    tools::{generate_random_points, seeded_rng},
};
use itertools::{izip, Itertools};
use rand::Rng;
use rand_distr::{Distribution, Normal};

struct Global {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    h: Vec<f64>,
}

impl Global {
    fn len(&self) -> usize {
        self.x.len()
    }

    // Initial distribution: particle `id` starts on rank `id % size`.
    fn initial(&self, rank: usize, size: usize) -> ParticleData {
        let ids = (0..self.len()).filter(|id| id % size == rank).collect_vec();
        let pick = |values: &[f64]| ids.iter().map(|&id| values[id]).collect_vec();
        ParticleData::new(pick(&self.x), pick(&self.y), pick(&self.z), pick(&self.h))
            .with_field(ids.iter().map(|&id| id as u64).collect_vec())
    }
}

fn ids(data: &ParticleData) -> &[u64] {
    match &data.fields[0] {
        Field::U64(ids) => ids,
        _ => panic!("expected particle ids"),
    }
}

struct RankResult {
    first: SyncSummary,
    second: SyncSummary,
    boundaries: Vec<u64>,
    second_boundaries: Vec<u64>,
    data: ParticleData,
}

fn run(global: &Global, size: usize, config: DomainConfig) -> Vec<RankResult> {
    ThreadComm::run(size, |comm| {
        let mut data = global.initial(comm.rank(), comm.size());
        let mut domain = Domain::new(comm, config).unwrap();

        let first = domain.sync(&mut data).unwrap();
        let boundaries = domain.assignment().unwrap().boundaries().to_vec();
        let second = domain.sync(&mut data).unwrap();
        let second_boundaries = domain.assignment().unwrap().boundaries().to_vec();

        RankResult {
            first,
            second,
            boundaries,
            second_boundaries,
            data,
        }
    })
}

fn uniform(n: usize, h: f64, bbox: &BoundingBox, seed: usize) -> Global {
    let (x, y, z) = generate_random_points(n, bbox, &mut seeded_rng(seed));
    Global { x, y, z, h: vec![h; n] }
}

#[test]
fn test_periodic_unit_cube_four_ranks() {
    let bbox = BoundingBox::unit(Boundary::Periodic);
    let global = uniform(1000, 0.02, &bbox, 0);
    let config = DomainConfig::default()
        .with_bounding_box(bbox)
        .with_bucket_size(64);

    let results = run(&global, 4, config);

    let boundaries = &results[0].boundaries;
    assert_eq!(boundaries.len(), 5);
    assert!(boundaries.windows(2).all(|pair| pair[0] <= pair[1]));

    let counts = results.iter().map(|result| result.first.local_count).collect_vec();
    assert_eq!(counts.iter().sum::<usize>(), 1000);
    let (min, max) = counts.iter().minmax().into_option().unwrap();
    assert!(max - min <= 64);

    for result in &results {
        assert_eq!(&result.boundaries, boundaries);
        assert_eq!(result.first.bounding_box, bbox);
        assert_eq!(result.data.len(), result.second.local_count + result.second.halo_count);
    }
}

#[test]
fn test_unchanged_particles_are_idempotent() {
    let bbox = BoundingBox::open([0.0, 0.0, 0.0, 2.0, 1.0, 1.0]).unwrap();
    let global = uniform(800, 0.05, &bbox, 1);
    let config = DomainConfig::default().with_bucket_size(16);

    let results = run(&global, 3, config);

    assert!(results.iter().map(|result| result.first.migrated).sum::<usize>() > 0);
    for result in &results {
        assert_eq!(result.second.migrated, 0);
        assert_eq!(result.second_boundaries, result.boundaries);
        assert_eq!(result.second.local_count, result.first.local_count);
        assert_eq!(result.second.halo_count, result.first.halo_count);
        assert_eq!(result.second.bounding_box, result.first.bounding_box);
        assert_eq!(result.second.global_leaves, result.first.global_leaves);
    }
}

#[test]
fn test_halos_are_complete() {
    let bbox = BoundingBox::unit(Boundary::Periodic);
    let mut global = uniform(400, 0.0, &bbox, 2);
    let mut rng = seeded_rng(3);
    global.h = (0..global.len()).map(|_| rng.gen_range(0.03..0.08)).collect();

    let config = DomainConfig::default()
        .with_bounding_box(bbox)
        .with_bucket_size(8)
        .with_acceptance(Acceptance::OpeningAngle(0.5));

    let results = run(&global, 4, config);

    let mut owners = vec![usize::MAX; global.len()];
    for (rank, result) in results.iter().enumerate() {
        for &id in &ids(&result.data)[..result.second.local_count] {
            assert_eq!(owners[id as usize], usize::MAX);
            owners[id as usize] = rank;
        }
    }
    assert!(owners.iter().all(|&owner| owner != usize::MAX));

    for (rank, result) in results.iter().enumerate() {
        let local_count = result.second.local_count;
        let all_ids = ids(&result.data);
        let halo_ids = &all_ids[local_count..];

        // Halos are owned elsewhere and ordered by source rank, then by key.
        assert!(halo_ids.iter().all(|&id| owners[id as usize] != rank));
        let order = halo_ids
            .iter()
            .map(|&id| {
                let id = id as usize;
                let key = sfc_key([global.x[id], global.y[id], global.z[id]], &bbox).unwrap();
                (owners[id], key)
            })
            .collect_vec();
        assert!(order.windows(2).all(|pair| pair[0] <= pair[1]));

        let mut present = vec![false; global.len()];
        for &id in all_ids {
            present[id as usize] = true;
        }

        for &i in &all_ids[..local_count] {
            let i = i as usize;
            let p = [global.x[i], global.y[i], global.z[i]];
            for (j, (&x, &y, &z)) in izip!(&global.x, &global.y, &global.z).enumerate() {
                if distance_sq(p, [x, y, z], &bbox) < global.h[i] * global.h[i] {
                    assert!(present[j], "rank {rank} misses neighbour {j} of particle {i}");
                }
            }
        }

        // Halo coordinates are copies of the owners' particles.
        for (index, &id) in all_ids.iter().enumerate().skip(local_count) {
            assert_eq!(result.data.x[index], global.x[id as usize]);
            assert_eq!(result.data.h[index], global.h[id as usize]);
        }
    }
}

#[test]
fn test_clustered_particles_with_large_radius() {
    let bbox = BoundingBox::unit(Boundary::Open);
    let normal = Normal::new(0.0, 0.05).unwrap();
    let mut rng = seeded_rng(4);
    let mut sample = |center: f64| -> f64 { (center + normal.sample(&mut rng)).clamp(0.0, 0.5) };

    let n = 300;
    let x = (0..n).map(|_| sample(0.25)).collect_vec();
    let y = (0..n).map(|_| sample(0.25)).collect_vec();
    let z = (0..n).map(|_| sample(0.25)).collect_vec();
    let global = Global { x, y, z, h: vec![0.6; n] };

    let config = DomainConfig::default()
        .with_bounding_box(bbox)
        .with_fixed_box(true)
        .with_bucket_size(16);
    let results = run(&global, 2, config);

    // Every region covers the whole cluster, so each rank sees all other particles.
    for result in &results {
        assert!(result.second.local_count > 0);
        assert_eq!(result.second.local_count + result.second.halo_count, n);
    }
}

#[test]
fn test_empty_rank_and_empty_halos() {
    let bbox = BoundingBox::unit(Boundary::Open);
    let n = 50;
    let global = Global {
        x: vec![0.1; n],
        y: vec![0.1; n],
        z: vec![0.1; n],
        h: vec![0.6; n],
    };
    let config = DomainConfig::default()
        .with_bounding_box(bbox)
        .with_fixed_box(true)
        .with_bucket_size(100);

    let results = run(&global, 2, config);
    assert_eq!(results[0].second.local_count, n);
    assert_eq!(results[1].second.local_count, 0);
    for result in &results {
        assert_eq!(result.second.halo_count, 0);
        assert_eq!(result.second.global_leaves, 1);
    }
}

#[test]
fn test_identical_points_exceed_bucket() {
    let bbox = BoundingBox::unit(Boundary::Periodic);
    let n = 10000;
    let global = Global {
        x: vec![0.3; n],
        y: vec![0.6; n],
        z: vec![0.9; n],
        h: vec![0.01; n],
    };
    let config = DomainConfig::default()
        .with_bounding_box(bbox)
        .with_bucket_size(100);

    let results = ThreadComm::run(2, |comm| {
        let mut data = global.initial(comm.rank(), comm.size());
        let mut domain = Domain::new(comm, config).unwrap();
        let summary = domain.sync(&mut data).unwrap();
        let largest = domain.global_counts().iter().copied().max().unwrap_or(0);
        (summary, largest)
    });

    for (summary, largest) in &results {
        assert_eq!(*largest, n as u64);
        assert_eq!(summary.halo_count, 0);
    }
    assert_eq!(results.iter().map(|(summary, _)| summary.local_count).sum::<usize>(), n);
}

// Drift of particle `id` per step. Some particles cross the periodic faces.
fn velocity(id: usize) -> [f64; 3] {
    let spread = ((id % 7) as f64 - 3.0) / 3.0;
    [0.02 + 0.01 * spread, -0.015, 0.01 * spread]
}

#[test]
fn test_drifting_particles_migrate() {
    let bbox = BoundingBox::unit(Boundary::Periodic);
    let global = uniform(800, 0.05, &bbox, 5);
    let config = DomainConfig::default()
        .with_bounding_box(bbox)
        .with_bucket_size(16);
    let nsteps = 4;

    let results = ThreadComm::run(4, |comm| {
        let mut data = global.initial(comm.rank(), comm.size());
        let mut domain = Domain::new(comm, config).unwrap();

        let mut steps = Vec::new();
        for _ in 0..nsteps {
            let summary = domain.sync(&mut data).unwrap();
            assert_eq!(data.local_count(), summary.local_count);
            assert_eq!(data.halo_count(), summary.halo_count);
            steps.push((summary, ids(&data).to_vec()));

            for index in domain.local_range() {
                let v = velocity(ids(&data)[index] as usize);
                data.x[index] += v[0];
                data.y[index] += v[1];
                data.z[index] += v[2];
            }
        }
        steps
    });

    let mut positions = izip!(&global.x, &global.y, &global.z)
        .map(|(&x, &y, &z)| [x, y, z])
        .collect_vec();

    for step in 0..nsteps {
        let wrapped = positions.iter().map(|&p| bbox.wrap(p)).collect_vec();

        let mut owners = vec![usize::MAX; global.len()];
        for (rank, steps) in results.iter().enumerate() {
            let (summary, all_ids) = &steps[step];
            for &id in &all_ids[..summary.local_count] {
                assert_eq!(owners[id as usize], usize::MAX);
                owners[id as usize] = rank;
            }
        }
        assert!(owners.iter().all(|&owner| owner != usize::MAX));

        for (rank, steps) in results.iter().enumerate() {
            let (summary, all_ids) = &steps[step];
            let mut present = vec![false; global.len()];
            for &id in all_ids {
                present[id as usize] = true;
            }
            for &i in &all_ids[..summary.local_count] {
                let i = i as usize;
                for (j, &q) in wrapped.iter().enumerate() {
                    if distance_sq(wrapped[i], q, &bbox) < global.h[i] * global.h[i] {
                        assert!(present[j], "rank {rank} misses {j} of {i} in step {step}");
                    }
                }
            }
        }

        for (id, position) in positions.iter_mut().enumerate() {
            let v = velocity(id);
            for axis in 0..3 {
                position[axis] += v[axis];
            }
        }
    }

    let moved = results
        .iter()
        .flat_map(|steps| steps[1..].iter().map(|(summary, _)| summary.migrated))
        .sum::<usize>();
    assert!(moved > 0);
}

#[test]
fn test_fresh_data_of_previous_length_is_owned() {
    let bbox = BoundingBox::unit(Boundary::Periodic);
    let global = uniform(400, 0.05, &bbox, 6);
    let config = DomainConfig::default()
        .with_bounding_box(bbox)
        .with_bucket_size(16);

    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let mut data = global.initial(rank, comm.size());
        let mut domain = Domain::new(comm, config).unwrap();

        let first = domain.sync(&mut data).unwrap();
        let supplied = data.len();

        let (x, y, z) = generate_random_points(supplied, &bbox, &mut seeded_rng(10 + rank));
        let mut fresh = ParticleData::new(x, y, z, vec![0.05; supplied]);
        let second = domain.sync(&mut fresh).unwrap();

        (first, supplied, second)
    });

    let supplied = results.iter().map(|(_, supplied, _)| supplied).sum::<usize>();
    let owned = results
        .iter()
        .map(|(_, _, second)| second.local_count)
        .sum::<usize>();
    for (first, _, _) in &results {
        assert!(first.halo_count > 0);
    }
    assert!(supplied > 400);
    assert_eq!(owned, supplied);
}
