//! Constants of the octree address space.

/// The deepest level an octant can live on.
///
/// Linear ids on this level need `3 * MAX_LEVEL = 90` bits, which is why
/// they are stored in a [WideIndex](crate::wide_index::WideIndex).
pub const MAX_LEVEL: u8 = 30;

/// Side length of a tree root in units of the finest cells.
pub const ROOT_LEN: u32 = 1 << MAX_LEVEL;

/// Number of children of an octant.
pub const NCHILDREN: usize = 8;

/// Number of bits a linear id grows per level.
pub const BITS_PER_LEVEL: u32 = 3;

/// Coordinate offsets of the 6 face neighbours.
pub const FACE_OFFSETS: [[i32; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

/// Coordinate offsets of the 12 edge neighbours.
pub const EDGE_OFFSETS: [[i32; 3]; 12] = [
    [0, -1, -1],
    [0, 1, -1],
    [0, -1, 1],
    [0, 1, 1],
    [-1, 0, -1],
    [1, 0, -1],
    [-1, 0, 1],
    [1, 0, 1],
    [-1, -1, 0],
    [1, -1, 0],
    [-1, 1, 0],
    [1, 1, 0],
];

/// Coordinate offsets of the 8 corner neighbours.
pub const CORNER_OFFSETS: [[i32; 3]; 8] = [
    [-1, -1, -1],
    [1, -1, -1],
    [-1, 1, -1],
    [1, 1, -1],
    [-1, -1, 1],
    [1, -1, 1],
    [-1, 1, 1],
    [1, 1, 1],
];
