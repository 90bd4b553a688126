//! Utility routines.

use bytemuck::Pod;
use itertools::Itertools;
use num::traits::Zero;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    comm::Communicator, constants::MAX_KEY, error::CommError, geometry::BoundingBox,
};

/// View a typed slice as bytes for transport.
pub fn to_bytes<T: Pod>(arr: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(arr).to_vec()
}

/// Decode a received byte buffer into typed values.
///
/// The buffer need not be aligned for `T`.
pub fn from_bytes<T: Pod>(bytes: &[u8], peer: usize) -> Result<Vec<T>, CommError> {
    if bytes.len() % std::mem::size_of::<T>() != 0 {
        return Err(CommError::Malformed {
            peer,
            reason: "payload length is not a multiple of the element size",
        });
    }
    Ok(bytemuck::allocation::pod_collect_to_vec(bytes))
}

/// Gather array to all processes
///
/// The local arrays are concatenated in rank order.
pub fn gather_to_all<T: Pod, C: Communicator>(arr: &[T], comm: &C) -> Result<Vec<T>, CommError> {
    let mut result = Vec::<T>::new();
    for (peer, bytes) in comm.all_gather(bytemuck::cast_slice(arr))?.iter().enumerate() {
        result.extend(from_bytes::<T>(bytes, peer)?);
    }
    Ok(result)
}

/// Get the global size of a distributed array.
pub fn global_size<T, C: Communicator>(arr: &[T], comm: &C) -> Result<usize, CommError> {
    let local_size = arr.len() as u64;
    Ok(comm.all_reduce_sum(&[local_size])?[0] as usize)
}

/// Compute an exclusive prefix sum with one trailing element holding the total.
///
/// For the array `[1, 3, 5, 7]` the output will be `[0, 1, 4, 9, 16]`.
pub fn exclusive_scan<T: Zero + Copy>(arr: &[T]) -> Vec<T> {
    let mut scan = Vec::<T>::with_capacity(arr.len() + 1);
    scan.push(T::zero());
    scan.extend(arr.iter().scan(T::zero(), |state, &x| {
        *state = *state + x;
        Some(*state)
    }));
    scan
}

/// Distribute a sorted sequence into bins.
///
/// For an array with n elements to be distributed into p bins,
/// the array `bins` has p elements. The bins are defined by half-open intervals
/// of the form [b_j, b_{j+1})). The final bin is the half-open interval [b_{p-1}, \infty).
/// It is assumed that the bins and the elements are both sorted sequences and that
/// every element has an associated bin.
/// The function returns a p element array with the counts of how many elements go to each bin.
/// Since the sequence is sorted this fully defines what element goes into which bin.
pub fn sort_to_bins<T: Ord>(sorted_keys: &[T], bins: &[T]) -> Vec<usize> {
    if sorted_keys.is_empty() {
        return vec![0; bins.len()];
    }

    // Make sure that the smallest element of the sorted keys fits into the bins.
    assert!(bins.first().unwrap() <= sorted_keys.first().unwrap());

    let starts = bins
        .iter()
        .map(|bin| sorted_keys.partition_point(|key| key < bin))
        .chain(std::iter::once(sorted_keys.len()))
        .collect_vec();

    starts
        .iter()
        .tuple_windows()
        .map(|(start, end)| end - start)
        .collect()
}

/// Compute displacements from a vector of counts.
///
/// This is useful for global MPI varcount operations. Let
/// count [ 3, 4, 5]. Then the corresponding displacements are
/// [0, 3, 7]. Note that the last element `5` is ignored.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Convert a buffer length to an MPI element count.
pub fn message_count(len: usize) -> Result<i32, CommError> {
    i32::try_from(len).map_err(|_| CommError::MessageTooLarge { len })
}

/// Indices that sort `arr`. Equal elements keep their relative order.
pub fn argsort<T: Ord + Copy>(arr: &[T]) -> Vec<usize> {
    let mut sort_indices = (0..arr.len()).collect_vec();
    sort_indices.sort_by_key(|&index| arr[index]);
    sort_indices
}

/// Apply a permutation obtained from [argsort].
pub fn reorder<T: Copy>(arr: &[T], permutation: &[usize]) -> Vec<T> {
    permutation.iter().map(|&index| arr[index]).collect()
}

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Generate random keys for testing.
pub fn generate_random_keys<R: Rng>(nkeys: usize, rng: &mut R) -> Vec<u64> {
    (0..nkeys).map(|_| rng.gen_range(0..MAX_KEY)).collect()
}

/// Generate uniformly distributed random points inside a box for testing.
///
/// Returns the coordinate arrays `(x, y, z)`.
pub fn generate_random_points<R: Rng>(
    npoints: usize,
    bbox: &BoundingBox,
    rng: &mut R,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut x = Vec::with_capacity(npoints);
    let mut y = Vec::with_capacity(npoints);
    let mut z = Vec::with_capacity(npoints);

    for _ in 0..npoints {
        let point = bbox.reference_to_physical([rng.gen(), rng.gen(), rng.gen()]);
        x.push(point[0]);
        y.push(point[1]);
        z.push(point[2]);
    }

    (x, y, z)
}
