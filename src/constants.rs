//! Global constants.

/// Deepest refinement level of the octree.
pub const MAX_LEVEL: u32 = 21;

/// Number of bits used by a key.
pub const KEY_BITS: u32 = 3 * MAX_LEVEL;

/// Exclusive upper end of the key space.
pub const MAX_KEY: u64 = 1 << KEY_BITS;

/// Number of cells per axis on the deepest level.
pub const MAX_COORD: u32 = 1 << MAX_LEVEL;

/// Number of children of an octree node.
pub const NSIBLINGS: usize = 8;

/// Mask for the lowest byte.
pub const BYTE_MASK: u64 = 0xFF;

/// Number of bits in a byte.
pub const BYTE_DISPLACEMENT: u32 = 8;

/// Mask for the lowest nine bits.
pub const NINE_BIT_MASK: u64 = 0x1FF;
