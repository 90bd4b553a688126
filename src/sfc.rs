//! Routines for working with Morton keys.
//!
//! A key interleaves the 21-bit integer coordinates of a point, x in the most
//! significant bit of every triplet. A node of the octree is the pair
//! `(start_key, level)` and covers the key range `[start_key, start_key + node_range(level))`.

use crate::{
    constants::{
        BYTE_DISPLACEMENT, BYTE_MASK, KEY_BITS, MAX_COORD, MAX_KEY, MAX_LEVEL, NINE_BIT_MASK,
    },
    error::DomainError,
    geometry::{BoundingBox, IBox, Point},
};

const fn build_encode_table(shift: u32) -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut value = 0;
    while value < 256 {
        let mut spread = 0u64;
        let mut bit = 0;
        while bit < 8 {
            if (value >> bit) & 1 == 1 {
                spread |= 1 << (3 * bit + shift);
            }
            bit += 1;
        }
        table[value] = spread;
        value += 1;
    }
    table
}

const fn build_decode_table(shift: u32) -> [u64; 512] {
    let mut table = [0u64; 512];
    let mut chunk = 0;
    while chunk < 512 {
        let mut coord = 0u64;
        let mut bit = 0;
        while bit < 3 {
            if (chunk >> (3 * bit + shift)) & 1 == 1 {
                coord |= 1 << bit;
            }
            bit += 1;
        }
        table[chunk] = coord;
        chunk += 1;
    }
    table
}

const X_LOOKUP_ENCODE: [u64; 256] = build_encode_table(2);
const Y_LOOKUP_ENCODE: [u64; 256] = build_encode_table(1);
const Z_LOOKUP_ENCODE: [u64; 256] = build_encode_table(0);

const X_LOOKUP_DECODE: [u64; 512] = build_decode_table(2);
const Y_LOOKUP_DECODE: [u64; 512] = build_decode_table(1);
const Z_LOOKUP_DECODE: [u64; 512] = build_decode_table(0);

/// Interleave integer coordinates on the deepest level into a key.
pub fn encode_morton(index: [u32; 3]) -> u64 {
    debug_assert!(index.iter().all(|&i| i < MAX_COORD));

    let [x, y, z] = index.map(u64::from);

    let mut key = 0;
    // Three bytes hold the 21 coordinate bits; process the most significant first.
    for byte in (0..3).rev() {
        let shift = byte * BYTE_DISPLACEMENT;
        key = (key << 24)
            | X_LOOKUP_ENCODE[((x >> shift) & BYTE_MASK) as usize]
            | Y_LOOKUP_ENCODE[((y >> shift) & BYTE_MASK) as usize]
            | Z_LOOKUP_ENCODE[((z >> shift) & BYTE_MASK) as usize];
    }

    key
}

/// Recover the integer coordinates of a key.
pub fn decode_morton(key: u64) -> [u32; 3] {
    fn decode_key_helper(key: u64, lookup_table: &[u64; 512]) -> u32 {
        // 63 bits for the keys, processed in chunks of nine.
        const N_LOOPS: u64 = 7;
        let mut coord: u64 = 0;

        for index in 0..N_LOOPS {
            coord |= lookup_table[((key >> (index * 9)) & NINE_BIT_MASK) as usize] << (3 * index);
        }

        coord as u32
    }

    [
        decode_key_helper(key, &X_LOOKUP_DECODE),
        decode_key_helper(key, &Y_LOOKUP_DECODE),
        decode_key_helper(key, &Z_LOOKUP_DECODE),
    ]
}

/// Integer grid coordinate of `value` on an axis spanning `[min, max)`.
fn grid_coordinate(value: f64, min: f64, max: f64) -> u32 {
    let scaled = (value - min) / (max - min) * MAX_COORD as f64;
    // Points on the upper boundary of an open axis land in the last cell.
    (scaled as i64).clamp(0, MAX_COORD as i64 - 1) as u32
}

/// Compute the key of a point inside a bounding box.
///
/// Coordinates on periodic axes are wrapped into the box first. A coordinate outside
/// the box on an open axis is a caller error.
pub fn sfc_key(point: Point, bbox: &BoundingBox) -> Result<u64, DomainError> {
    let point = bbox.wrap(point);
    let [xmin, ymin, zmin, xmax, ymax, zmax] = bbox.coordinates();
    let lower = [xmin, ymin, zmin];
    let upper = [xmax, ymax, zmax];

    let mut index = [0u32; 3];
    for axis in 0..3 {
        let value = point[axis];
        if !(lower[axis] <= value && value <= upper[axis]) {
            return Err(DomainError::PointOutsideBox {
                axis,
                value,
                min: lower[axis],
                max: upper[axis],
            });
        }
        index[axis] = grid_coordinate(value, lower[axis], upper[axis]);
    }

    Ok(encode_morton(index))
}

/// Number of keys covered by a node on `level`.
pub fn node_range(level: u32) -> u64 {
    debug_assert!(level <= MAX_LEVEL);
    1 << (3 * (MAX_LEVEL - level))
}

/// Level of a node covering `range` keys. The range must be a power of eight.
pub fn tree_level(range: u64) -> u32 {
    debug_assert!(range.is_power_of_two() && range.trailing_zeros() % 3 == 0);
    MAX_LEVEL - range.trailing_zeros() / 3
}

/// Return true if `[start, end)` is the key range of a single octree node.
pub fn is_node_range(start: u64, end: u64) -> bool {
    if end <= start || end > MAX_KEY {
        return false;
    }
    let range = end - start;
    range.is_power_of_two() && range.trailing_zeros() % 3 == 0 && start % range == 0
}

/// Octal digit of `key` on `level` (the child index within its parent).
pub fn octal_digit(key: u64, level: u32) -> usize {
    debug_assert!((1..=MAX_LEVEL).contains(&level));
    ((key >> (3 * (MAX_LEVEL - level))) & 7) as usize
}

/// Length of the common key prefix of two keys in bits.
pub fn common_prefix(a: u64, b: u64) -> u32 {
    let diff = a ^ b;
    if diff == 0 {
        KEY_BITS
    } else {
        diff.leading_zeros() - (64 - KEY_BITS)
    }
}

/// Integer cell box of the node `(start, level)`.
pub fn node_box(start: u64, level: u32) -> IBox {
    let min = decode_morton(start);
    let edge = 1u32 << (MAX_LEVEL - level);
    IBox {
        min,
        max: [min[0] + edge, min[1] + edge, min[2] + edge],
    }
}

/// Physical centre and half edge lengths of the node `(start, level)`.
pub fn decode_node(start: u64, level: u32, bbox: &BoundingBox) -> (Point, Point) {
    let aabb = bbox.cell_aabb(&node_box(start, level));
    let center = aabb.center();
    (
        center,
        [
            0.5 * (aabb.max[0] - aabb.min[0]),
            0.5 * (aabb.max[1] - aabb.min[1]),
            0.5 * (aabb.max[2] - aabb.min[2]),
        ],
    )
}

/// Physical centre and half edge lengths of the deepest cell holding `key`.
pub fn decode_key(key: u64, bbox: &BoundingBox) -> (Point, Point) {
    decode_node(key, MAX_LEVEL, bbox)
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::{
        common_prefix, decode_key, decode_morton, encode_morton, is_node_range, node_box,
        node_range, sfc_key, tree_level,
    };
    use crate::{
        constants::{MAX_COORD, MAX_KEY, MAX_LEVEL},
        error::DomainError,
        geometry::{Boundary, BoundingBox},
        tools::seeded_rng,
    };

    #[test]
    fn test_encode_decode() {
        let mut rng = seeded_rng(0);

        for _ in 0..1000 {
            let index = [
                rng.gen_range(0..MAX_COORD),
                rng.gen_range(0..MAX_COORD),
                rng.gen_range(0..MAX_COORD),
            ];
            let key = encode_morton(index);
            assert!(key < MAX_KEY);
            assert_eq!(decode_morton(key), index);
        }
    }

    #[test]
    fn test_bit_order() {
        // x occupies the highest bit of each triplet.
        assert_eq!(encode_morton([1, 0, 0]), 4);
        assert_eq!(encode_morton([0, 1, 0]), 2);
        assert_eq!(encode_morton([0, 0, 1]), 1);
        assert_eq!(encode_morton([MAX_COORD - 1; 3]), MAX_KEY - 1);
    }

    #[test]
    fn test_round_trip_contains_point() {
        let bbox = BoundingBox::open([-2.0, 0.0, 1.0, 2.0, 3.0, 1.5]).unwrap();
        let mut rng = seeded_rng(1);

        for _ in 0..1000 {
            let point = bbox.reference_to_physical([rng.gen(), rng.gen(), rng.gen()]);
            let key = sfc_key(point, &bbox).unwrap();
            let (center, half) = decode_key(key, &bbox);
            for axis in 0..3 {
                assert!((point[axis] - center[axis]).abs() <= half[axis] + 1e-12);
            }
        }
    }

    #[test]
    fn test_periodic_wrap_equivalence() {
        let bbox = BoundingBox::unit(Boundary::Periodic);
        let inside = sfc_key([0.1, 0.2, 0.3], &bbox).unwrap();
        assert_eq!(sfc_key([1.1, 0.2, 0.3], &bbox).unwrap(), inside);
        assert_eq!(sfc_key([0.1, -0.8, 0.3], &bbox).unwrap(), inside);
        assert_eq!(
            sfc_key([1.0, 0.0, 0.0], &bbox).unwrap(),
            sfc_key([0.0, 0.0, 0.0], &bbox).unwrap()
        );
    }

    #[test]
    fn test_outside_open_box() {
        let bbox = BoundingBox::unit(Boundary::Open);
        assert!(matches!(
            sfc_key([1.5, 0.5, 0.5], &bbox),
            Err(DomainError::PointOutsideBox { axis: 0, .. })
        ));
        // The upper boundary itself is still inside.
        assert!(sfc_key([1.0, 1.0, 1.0], &bbox).is_ok());
    }

    #[test]
    fn test_prefix_locality() {
        // Two points in the same level-3 cell share the top nine bits.
        let bbox = BoundingBox::unit(Boundary::Open);
        let a = sfc_key([0.51, 0.26, 0.76], &bbox).unwrap();
        let b = sfc_key([0.62, 0.37, 0.87], &bbox).unwrap();
        assert!(common_prefix(a, b) >= 9);
    }

    #[test]
    fn test_levels() {
        assert_eq!(node_range(0), MAX_KEY);
        assert_eq!(node_range(MAX_LEVEL), 1);
        for level in 0..=MAX_LEVEL {
            assert_eq!(tree_level(node_range(level)), level);
        }
        assert!(is_node_range(0, MAX_KEY));
        assert!(is_node_range(8, 16));
        assert!(!is_node_range(8, 24));
        assert!(!is_node_range(4, 12));

        let cell = node_box(node_range(1), 1);
        assert_eq!(cell.min, [0, 0, MAX_COORD / 2]);
        assert_eq!(cell.edge(), MAX_COORD / 2);
    }
}
