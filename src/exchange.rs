//! Particle migration and halo exchange.
//!
//! Particle fields are handled as opaque buffers of plain old data. The decomposition
//! reorders, packs and appends them identically without looking at what they hold.

use std::ops::Range;

use bytemuck::Pod;
use log::debug;

use crate::{
    assignment::SfcAssignment,
    backend::Backend,
    comm::Communicator,
    error::{CommError, DomainError},
    halos::HaloPlan,
    tools::{from_bytes, reorder, to_bytes},
};

/// A buffer holding one value per particle.
pub trait FieldBuffer {
    /// Number of particles.
    fn len(&self) -> usize;

    /// Return true if the buffer holds no particles.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of one value in bytes.
    fn elem_size(&self) -> usize;

    /// The raw contents.
    fn as_bytes(&self) -> &[u8];

    /// Keep the first `len` values.
    fn truncate(&mut self, len: usize);

    /// Replace the contents by values encoded in `bytes`.
    fn assign_bytes(&mut self, bytes: &[u8]);

    /// Append values received from `peer`.
    fn extend_from_bytes(&mut self, bytes: &[u8], peer: usize) -> Result<(), CommError>;
}

impl<T: Pod> FieldBuffer for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn elem_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self)
    }

    fn truncate(&mut self, len: usize) {
        Vec::truncate(self, len)
    }

    fn assign_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len() % std::mem::size_of::<T>(), 0);
        *self = bytemuck::allocation::pod_collect_to_vec(bytes);
    }

    fn extend_from_bytes(&mut self, bytes: &[u8], peer: usize) -> Result<(), CommError> {
        self.extend(from_bytes::<T>(bytes, peer)?);
        Ok(())
    }
}

/// An extra per-particle field moved along with the coordinates.
#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    /// Double precision values.
    F64(Vec<f64>),
    /// Single precision values.
    F32(Vec<f32>),
    /// Unsigned 64 bit integers, e.g. particle ids.
    U64(Vec<u64>),
    /// Signed 64 bit integers.
    I64(Vec<i64>),
    /// Unsigned 32 bit integers.
    U32(Vec<u32>),
}

macro_rules! dispatch {
    ($field:expr, $values:ident => $body:expr) => {
        match $field {
            Field::F64($values) => $body,
            Field::F32($values) => $body,
            Field::U64($values) => $body,
            Field::I64($values) => $body,
            Field::U32($values) => $body,
        }
    };
}

impl FieldBuffer for Field {
    fn len(&self) -> usize {
        dispatch!(self, values => values.len())
    }

    fn elem_size(&self) -> usize {
        dispatch!(self, values => values.elem_size())
    }

    fn as_bytes(&self) -> &[u8] {
        dispatch!(self, values => values.as_bytes())
    }

    fn truncate(&mut self, len: usize) {
        dispatch!(self, values => values.truncate(len))
    }

    fn assign_bytes(&mut self, bytes: &[u8]) {
        dispatch!(self, values => values.assign_bytes(bytes))
    }

    fn extend_from_bytes(&mut self, bytes: &[u8], peer: usize) -> Result<(), CommError> {
        dispatch!(self, values => values.extend_from_bytes(bytes, peer))
    }
}

impl From<Vec<f64>> for Field {
    fn from(values: Vec<f64>) -> Self {
        Field::F64(values)
    }
}

impl From<Vec<f32>> for Field {
    fn from(values: Vec<f32>) -> Self {
        Field::F32(values)
    }
}

impl From<Vec<u64>> for Field {
    fn from(values: Vec<u64>) -> Self {
        Field::U64(values)
    }
}

impl From<Vec<i64>> for Field {
    fn from(values: Vec<i64>) -> Self {
        Field::I64(values)
    }
}

impl From<Vec<u32>> for Field {
    fn from(values: Vec<u32>) -> Self {
        Field::U32(values)
    }
}

/// The particle arrays of one rank.
///
/// After a decomposition step the first [ParticleData::local_count] entries are owned by
/// the rank and the trailing [ParticleData::halo_count] entries are read-only halo copies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleData {
    /// x coordinates.
    pub x: Vec<f64>,
    /// y coordinates.
    pub y: Vec<f64>,
    /// z coordinates.
    pub z: Vec<f64>,
    /// Interaction radii.
    pub h: Vec<f64>,
    /// Additional fields, all of the same length as the coordinates.
    pub fields: Vec<Field>,
    halo_count: usize,
}

impl ParticleData {
    /// Create particle data from coordinates and interaction radii.
    pub fn new(x: Vec<f64>, y: Vec<f64>, z: Vec<f64>, h: Vec<f64>) -> Self {
        Self {
            x,
            y,
            z,
            h,
            fields: Vec::new(),
            halo_count: 0,
        }
    }

    /// Attach an additional field.
    pub fn with_field(mut self, field: impl Into<Field>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Return true if there are no particles.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Number of halo copies appended by the last halo exchange.
    pub fn halo_count(&self) -> usize {
        self.halo_count
    }

    /// Number of owned particles in front of the halos.
    pub fn local_count(&self) -> usize {
        self.len().saturating_sub(self.halo_count)
    }

    /// Remove the halo copies appended by the last halo exchange.
    pub fn drop_halos(&mut self) {
        self.truncate(self.local_count());
    }

    /// Check that all arrays have the same length.
    pub fn validate(&self) -> Result<(), DomainError> {
        let expected = self.len();
        let named = [("y", self.y.len()), ("z", self.z.len()), ("h", self.h.len())];
        let fields = self.fields.iter().map(|field| ("field", field.len()));

        for (name, actual) in named.into_iter().chain(fields) {
            if actual != expected {
                return Err(DomainError::LengthMismatch {
                    name,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn buffers(&self) -> Vec<&dyn FieldBuffer> {
        let mut buffers: Vec<&dyn FieldBuffer> = vec![
            &self.x as &dyn FieldBuffer,
            &self.y as &dyn FieldBuffer,
            &self.z as &dyn FieldBuffer,
            &self.h as &dyn FieldBuffer,
        ];
        buffers.extend(self.fields.iter().map(|field| field as &dyn FieldBuffer));
        buffers
    }

    fn buffers_mut(&mut self) -> Vec<&mut dyn FieldBuffer> {
        let mut buffers: Vec<&mut dyn FieldBuffer> = vec![
            &mut self.x as &mut dyn FieldBuffer,
            &mut self.y as &mut dyn FieldBuffer,
            &mut self.z as &mut dyn FieldBuffer,
            &mut self.h as &mut dyn FieldBuffer,
        ];
        buffers.extend(self.fields.iter_mut().map(|field| field as &mut dyn FieldBuffer));
        buffers
    }

    /// Bytes needed to transfer one particle.
    pub fn bytes_per_particle(&self) -> usize {
        self.buffers().iter().map(|buffer| buffer.elem_size()).sum()
    }

    /// Keep the first `len` particles.
    pub fn truncate(&mut self, len: usize) {
        let removed = self.len().saturating_sub(len);
        self.halo_count = self.halo_count.saturating_sub(removed);
        for buffer in self.buffers_mut() {
            buffer.truncate(len);
        }
    }

    /// Apply `permutation` to every array. Particle `i` of the result is particle
    /// `permutation[i]` of the input; the permutation may select a subset.
    /// All particles of the result count as owned.
    pub fn reorder<B: Backend>(&mut self, permutation: &[usize], backend: &B) {
        self.halo_count = 0;
        for buffer in self.buffers_mut() {
            let bytes = backend.gather_bytes(buffer.as_bytes(), buffer.elem_size(), permutation);
            buffer.assign_bytes(&bytes);
        }
    }

    /// Serialise the particles in `ranges`, one array after the other.
    pub fn pack<B: Backend>(&self, ranges: &[Range<usize>], backend: &B, out: &mut Vec<u8>) {
        for buffer in self.buffers() {
            backend.pack_bytes(buffer.as_bytes(), buffer.elem_size(), ranges, out);
        }
    }

    /// Append `count` particles serialised by [ParticleData::pack] on `peer`.
    pub fn unpack_append(
        &mut self,
        bytes: &[u8],
        count: usize,
        peer: usize,
    ) -> Result<(), CommError> {
        let bytes_per_particle = self.bytes_per_particle();
        if bytes.len() != count * bytes_per_particle {
            return Err(CommError::SizeMismatch {
                peer,
                expected: count,
                actual: bytes.len() / bytes_per_particle.max(1),
            });
        }

        let mut offset = 0;
        for buffer in self.buffers_mut() {
            let size = count * buffer.elem_size();
            buffer.extend_from_bytes(&bytes[offset..offset + size], peer)?;
            offset += size;
        }
        Ok(())
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<u64>();

/// Send every local particle outside the key range of this rank to its owner.
///
/// `data` and `keys` must be sorted by key. On return they hold exactly the particles
/// inside the local key range, sorted by key. Returns the number of particles sent away.
pub fn migrate<C: Communicator, B: Backend>(
    data: &mut ParticleData,
    keys: &mut Vec<u64>,
    assignment: &SfcAssignment,
    comm: &C,
    backend: &B,
) -> Result<usize, DomainError> {
    assert_eq!(data.len(), keys.len());
    let rank = comm.rank();
    let ranges = assignment.send_ranges(keys);

    let sends = ranges
        .iter()
        .enumerate()
        .map(|(peer, range)| {
            if peer == rank {
                return Vec::new();
            }
            let mut payload = to_bytes(&[range.len() as u64]);
            payload.extend_from_slice(bytemuck::cast_slice(&keys[range.clone()]));
            data.pack(std::slice::from_ref(range), backend, &mut payload);
            payload
        })
        .collect::<Vec<_>>();

    let own = ranges[rank].clone();
    let migrated = keys.len() - own.len();

    let received = comm.all_to_all(sends)?;

    let kept = own.clone().collect::<Vec<_>>();
    data.reorder(&kept, backend);
    *keys = keys[own].to_vec();

    let mut arrived = 0;
    for (peer, payload) in received.iter().enumerate() {
        if peer == rank {
            continue;
        }
        if payload.len() < HEADER_SIZE {
            return Err(CommError::Malformed {
                peer,
                reason: "migration payload is missing its header",
            }
            .into());
        }
        let count = from_bytes::<u64>(&payload[..HEADER_SIZE], peer)?[0] as usize;
        let keys_end = HEADER_SIZE + count * HEADER_SIZE;
        if payload.len() < keys_end {
            return Err(CommError::Malformed {
                peer,
                reason: "migration payload is shorter than its key list",
            }
            .into());
        }
        keys.extend(from_bytes::<u64>(&payload[HEADER_SIZE..keys_end], peer)?);
        data.unpack_append(&payload[keys_end..], count, peer)?;
        arrived += count;
    }

    if arrived > 0 {
        let permutation = backend.sort_permutation(keys);
        data.reorder(&permutation, backend);
        *keys = reorder(keys, &permutation);
    }

    debug_assert!(keys
        .iter()
        .all(|key| assignment.key_range(rank).contains(key)));
    debug!(
        "rank {} migrated {} particles out and {} in",
        rank, migrated, arrived
    );

    Ok(migrated)
}

/// Index ranges of the sorted local keys falling into the given global leaves.
/// Adjacent ranges are merged.
pub fn leaf_particle_ranges(
    tree: &[u64],
    leaves: &[usize],
    sorted_keys: &[u64],
) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Vec::with_capacity(leaves.len());
    for &leaf in leaves {
        let start = sorted_keys.partition_point(|&key| key < tree[leaf]);
        let end = sorted_keys.partition_point(|&key| key < tree[leaf + 1]);
        match ranges.last_mut() {
            Some(last) if last.end == start => last.end = end,
            _ => ranges.push(start..end),
        }
    }
    ranges
}

/// Append the halo particles of this rank to `data`.
///
/// `data` must hold exactly the local particles, sorted by `local_keys`. Halos are
/// appended ordered by source rank, then by key, and recorded as the halo count of
/// `data`. Returns the number of halo particles.
pub fn exchange_halos<C: Communicator, B: Backend>(
    data: &mut ParticleData,
    local_keys: &[u64],
    plan: &HaloPlan,
    tree: &[u64],
    comm: &C,
    backend: &B,
) -> Result<usize, DomainError> {
    assert_eq!(data.len(), local_keys.len());
    assert_eq!(data.halo_count(), 0);

    let sends = plan
        .send()
        .iter()
        .map(|peer| {
            let ranges = leaf_particle_ranges(tree, &peer.leaves, local_keys);
            debug_assert_eq!(
                ranges.iter().map(|range| range.len() as u64).sum::<u64>(),
                peer.count
            );
            let mut payload = Vec::with_capacity(peer.count as usize * data.bytes_per_particle());
            data.pack(&ranges, backend, &mut payload);
            (peer.rank, payload)
        })
        .collect::<Vec<_>>();

    let received = comm.exchange(sends, &plan.recv_ranks())?;

    for ((peer, payload), planned) in received.iter().zip(plan.recv()) {
        debug_assert_eq!(*peer, planned.rank);
        data.unpack_append(payload, planned.count as usize, *peer)?;
        data.halo_count += planned.count as usize;
    }

    Ok(data.halo_count)
}

#[cfg(test)]
mod test {
    use super::{leaf_particle_ranges, migrate, Field, FieldBuffer, ParticleData};
    use crate::{
        assignment::make_sfc_assignment,
        backend::{Backend, SerialBackend},
        comm::{Communicator, ThreadComm},
        error::{CommError, DomainError},
        geometry::{Boundary, BoundingBox},
        octree::{root_tree, update_octree_global},
        tools::{generate_random_points, reorder, seeded_rng},
    };

    fn sample() -> ParticleData {
        ParticleData::new(
            vec![0.0, 1.0, 2.0],
            vec![10.0, 11.0, 12.0],
            vec![20.0, 21.0, 22.0],
            vec![0.1, 0.2, 0.3],
        )
        .with_field(vec![7u64, 8, 9])
        .with_field(vec![1.5f32, 2.5, 3.5])
    }

    #[test]
    fn test_field_buffer() {
        let mut field = Field::from(vec![1i64, -2, 3]);
        assert_eq!(field.len(), 3);
        assert_eq!(field.elem_size(), 8);
        field.truncate(2);
        field.extend_from_bytes(bytemuck::cast_slice(&[5i64]), 0).unwrap();
        assert_eq!(field, Field::I64(vec![1, -2, 5]));
        assert!(field.extend_from_bytes(&[0u8; 3], 1).is_err());
    }

    #[test]
    fn test_validate() {
        let mut data = sample();
        assert!(data.validate().is_ok());
        data.h.pop();
        assert_eq!(
            data.validate(),
            Err(DomainError::LengthMismatch {
                name: "h",
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_reorder_and_pack() {
        let mut data = sample();
        assert_eq!(data.bytes_per_particle(), 4 * 8 + 8 + 4);

        data.reorder(&[2, 0], &SerialBackend);
        assert_eq!(data.x, vec![2.0, 0.0]);
        assert_eq!(data.fields[0], Field::U64(vec![9, 7]));
        assert_eq!(data.fields[1], Field::F32(vec![3.5, 1.5]));

        let mut payload = Vec::new();
        data.pack(&[1..2], &SerialBackend, &mut payload);

        let mut other = sample();
        other.unpack_append(&payload, 1, 1).unwrap();
        assert_eq!(other.len(), 4);
        assert_eq!(other.y[3], 10.0);
        assert_eq!(other.fields[0], Field::U64(vec![7, 8, 9, 7]));
        assert!(other.validate().is_ok());

        other.truncate(3);
        assert_eq!(other, sample());
    }

    #[test]
    fn test_fresh_data_has_no_halos() {
        let mut data = sample();
        assert_eq!(data.halo_count(), 0);
        assert_eq!(data.local_count(), 3);

        data.drop_halos();
        assert_eq!(data, sample());
    }

    #[test]
    fn test_size_mismatch() {
        let mut data = sample();
        let mut payload = Vec::new();
        sample().pack(&[0..2], &SerialBackend, &mut payload);
        assert_eq!(
            data.unpack_append(&payload, 3, 4),
            Err(CommError::SizeMismatch {
                peer: 4,
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_leaf_particle_ranges() {
        let tree = [0, 8, 16, 24, 32];
        let keys = [1, 2, 9, 17, 18, 30];
        assert_eq!(leaf_particle_ranges(&tree, &[0, 1, 3], &keys), vec![0..3, 5..6]);
        assert_eq!(leaf_particle_ranges(&tree, &[], &keys), vec![]);
    }

    #[test]
    fn test_migrate() {
        let bbox = BoundingBox::unit(Boundary::Open);
        let (x, y, z) = generate_random_points(300, &bbox, &mut seeded_rng(21));

        let results = ThreadComm::run(3, |comm| {
            let backend = SerialBackend;
            let rank = comm.rank();
            let ids = (0..x.len()).filter(|id| id % 3 == rank).collect::<Vec<_>>();
            let pick = |values: &[f64]| ids.iter().map(|&id| values[id]).collect::<Vec<_>>();
            let mut data = ParticleData::new(pick(&x), pick(&y), pick(&z), vec![0.01; ids.len()])
                .with_field(ids.iter().map(|&id| id as u64).collect::<Vec<_>>());

            let keys = backend.encode_keys(&data.x, &data.y, &data.z, &bbox).unwrap();
            let permutation = backend.sort_permutation(&keys);
            data.reorder(&permutation, &backend);
            let mut keys = reorder(&keys, &permutation);

            let (tree, counts) =
                update_octree_global(&keys, 16, &root_tree(), &comm, &backend).unwrap();
            let assignment = make_sfc_assignment(comm.size(), &tree, &counts).unwrap();

            let migrated = migrate(&mut data, &mut keys, &assignment, &comm, &backend).unwrap();
            let again = migrate(&mut data, &mut keys, &assignment, &comm, &backend).unwrap();

            (rank, migrated, again, data, keys, assignment)
        });

        let mut total = 0;
        for (rank, migrated, again, data, keys, assignment) in results {
            assert!(migrated > 0);
            assert_eq!(again, 0);
            assert_eq!(data.len() as u64, assignment.count(rank));
            assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));
            assert!(keys.iter().all(|key| assignment.key_range(rank).contains(key)));

            let Field::U64(ids) = &data.fields[0] else {
                panic!("unexpected field kind")
            };
            for (index, &id) in ids.iter().enumerate() {
                assert_eq!(data.x[index], x[id as usize]);
                assert_eq!(data.z[index], z[id as usize]);
            }
            total += data.len();
        }
        assert_eq!(total, 300);
    }
}
