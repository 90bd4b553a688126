//! Execution backends for the data parallel parts of a decomposition step.
//!
//! The decomposition is written against [Backend]. Every implementation must return
//! results identical to [SerialBackend] for the same input, independent of scheduling.

use std::ops::Range;

use itertools::izip;
use rayon::prelude::*;

use crate::{
    error::DomainError,
    geometry::BoundingBox,
    octree::compute_node_counts,
    sfc::sfc_key,
    tools::argsort,
};

/// Capability tag of a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Runs on the calling thread.
    Serial,
    /// Runs on the rayon thread pool.
    Parallel,
}

/// The local operations of a decomposition step.
pub trait Backend: Sync {
    /// The capability of this backend.
    fn kind(&self) -> BackendKind;

    /// Compute the key of every point.
    fn encode_keys(
        &self,
        x: &[f64],
        y: &[f64],
        z: &[f64],
        bbox: &BoundingBox,
    ) -> Result<Vec<u64>, DomainError>;

    /// Count the sorted keys falling into each leaf of `tree`.
    fn compute_node_counts(&self, tree: &[u64], sorted_keys: &[u64]) -> Vec<u64>;

    /// Stable permutation that sorts `keys`.
    fn sort_permutation(&self, keys: &[u64]) -> Vec<usize>;

    /// Reorder a buffer of `elem_size` byte elements so that element `i` of the output
    /// is element `permutation[i]` of `src`.
    fn gather_bytes(&self, src: &[u8], elem_size: usize, permutation: &[usize]) -> Vec<u8>;

    /// Append the elements in `ranges` of a buffer of `elem_size` byte elements to `out`.
    fn pack_bytes(&self, src: &[u8], elem_size: usize, ranges: &[Range<usize>], out: &mut Vec<u8>) {
        for range in ranges {
            out.extend_from_slice(&src[range.start * elem_size..range.end * elem_size]);
        }
    }
}

/// Single threaded backend.
#[derive(Copy, Clone, Debug, Default)]
pub struct SerialBackend;

impl Backend for SerialBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    fn encode_keys(
        &self,
        x: &[f64],
        y: &[f64],
        z: &[f64],
        bbox: &BoundingBox,
    ) -> Result<Vec<u64>, DomainError> {
        izip!(x, y, z)
            .map(|(&x, &y, &z)| sfc_key([x, y, z], bbox))
            .collect()
    }

    fn compute_node_counts(&self, tree: &[u64], sorted_keys: &[u64]) -> Vec<u64> {
        compute_node_counts(tree, sorted_keys)
    }

    fn sort_permutation(&self, keys: &[u64]) -> Vec<usize> {
        argsort(keys)
    }

    fn gather_bytes(&self, src: &[u8], elem_size: usize, permutation: &[usize]) -> Vec<u8> {
        let mut out = Vec::with_capacity(permutation.len() * elem_size);
        for &index in permutation {
            out.extend_from_slice(&src[index * elem_size..(index + 1) * elem_size]);
        }
        out
    }
}

/// Backend running on the rayon thread pool.
#[derive(Copy, Clone, Debug, Default)]
pub struct ParallelBackend;

impl Backend for ParallelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallel
    }

    fn encode_keys(
        &self,
        x: &[f64],
        y: &[f64],
        z: &[f64],
        bbox: &BoundingBox,
    ) -> Result<Vec<u64>, DomainError> {
        assert!(x.len() == y.len() && x.len() == z.len());
        (0..x.len())
            .into_par_iter()
            .map(|index| sfc_key([x[index], y[index], z[index]], bbox))
            .collect()
    }

    fn compute_node_counts(&self, tree: &[u64], sorted_keys: &[u64]) -> Vec<u64> {
        let positions = tree
            .par_iter()
            .map(|&boundary| sorted_keys.partition_point(|&key| key < boundary) as u64)
            .collect::<Vec<_>>();

        positions.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    fn sort_permutation(&self, keys: &[u64]) -> Vec<usize> {
        let mut permutation = (0..keys.len()).collect::<Vec<_>>();
        permutation.par_sort_by_key(|&index| keys[index]);
        permutation
    }

    fn gather_bytes(&self, src: &[u8], elem_size: usize, permutation: &[usize]) -> Vec<u8> {
        let mut out = vec![0u8; permutation.len() * elem_size];
        if elem_size == 0 {
            return out;
        }
        out.par_chunks_mut(elem_size)
            .zip(permutation.par_iter())
            .for_each(|(chunk, &index)| {
                chunk.copy_from_slice(&src[index * elem_size..(index + 1) * elem_size]);
            });
        out
    }
}
