//! Octants, the cells of an octree.

use std::cmp::Ordering;
use std::fmt;

use crate::constants::{MAX_LEVEL, NCHILDREN, ROOT_LEN};

/// A cube in the logical address space of one tree.
///
/// The anchor `coordinates` are measured in units of the finest cells, so an
/// octant on `level` has side length `2^(MAX_LEVEL - level)` and its
/// coordinates are multiples of that length.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct Octant {
    coordinates: [u32; 3],
    level: u8,
}

impl Octant {
    /// Create an octant from anchor coordinates and level.
    pub fn new(coordinates: [u32; 3], level: u8) -> Self {
        let octant = Self { coordinates, level };
        debug_assert!(octant.is_valid(), "invalid octant {}", octant);
        octant
    }

    /// Create an octant, returning `None` if it would not be valid.
    pub fn try_new(coordinates: [u32; 3], level: u8) -> Option<Self> {
        let octant = Self { coordinates, level };
        octant.is_valid().then_some(octant)
    }

    /// Create an octant from its integer index `(i, j, k)` on a level.
    pub fn from_index_and_level(index: [u32; 3], level: u8) -> Self {
        let shift = MAX_LEVEL - level;
        Octant::new(index.map(|i| i << shift), level)
    }

    /// The root octant of a tree.
    pub fn root() -> Self {
        Self {
            coordinates: [0, 0, 0],
            level: 0,
        }
    }

    /// The level of the octant.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// The anchor coordinates of the octant.
    pub fn coordinates(&self) -> [u32; 3] {
        self.coordinates
    }

    /// Side length in units of the finest cells.
    pub fn length(&self) -> u32 {
        level_length(self.level)
    }

    /// An octant is valid if its level is admissible and its anchor is an
    /// aligned position inside the root.
    pub fn is_valid(&self) -> bool {
        if self.level > MAX_LEVEL {
            return false;
        }
        let len = self.length();
        self.coordinates
            .iter()
            .all(|&c| c < ROOT_LEN && c % len == 0)
    }

    /// The parent. The root has no parent.
    pub fn parent(&self) -> Octant {
        assert!(self.level > 0, "the root octant has no parent");
        self.ancestor(self.level - 1)
    }

    /// The ancestor on `level`, which must not be finer than the octant.
    pub fn ancestor(&self, level: u8) -> Octant {
        assert!(level <= self.level);
        let mask = !(level_length(level) - 1);
        Octant {
            coordinates: self.coordinates.map(|c| c & mask),
            level,
        }
    }

    /// Child number `id` in Morton order.
    ///
    /// Bit 0 of `id` selects the x half, bit 1 the y half and bit 2 the z half.
    pub fn child(&self, id: usize) -> Octant {
        assert!(self.level < MAX_LEVEL, "cannot refine beyond MAX_LEVEL");
        assert!(id < NCHILDREN);
        let half = level_length(self.level + 1);
        let [x, y, z] = self.coordinates;
        Octant {
            coordinates: [
                x + if id & 1 != 0 { half } else { 0 },
                y + if id & 2 != 0 { half } else { 0 },
                z + if id & 4 != 0 { half } else { 0 },
            ],
            level: self.level + 1,
        }
    }

    /// All children in Morton order.
    pub fn children(&self) -> [Octant; NCHILDREN] {
        std::array::from_fn(|id| self.child(id))
    }

    /// Position of the octant among its siblings.
    pub fn child_id(&self) -> usize {
        if self.level == 0 {
            return 0;
        }
        let len = self.length();
        let [x, y, z] = self.coordinates;
        (usize::from(x & len != 0))
            | (usize::from(y & len != 0) << 1)
            | (usize::from(z & len != 0) << 2)
    }

    /// The octant together with its siblings in Morton order.
    pub fn siblings(&self) -> [Octant; NCHILDREN] {
        self.parent().children()
    }

    /// Return true if `self` is a strict ancestor of `other`.
    pub fn is_ancestor(&self, other: &Octant) -> bool {
        self.level < other.level && other.ancestor(self.level) == *self
    }

    /// Return true if `other` is `self` or lies inside it.
    pub fn contains(&self, other: &Octant) -> bool {
        self.level <= other.level && other.ancestor(self.level) == *self
    }

    /// Return true if `octants` are the 8 children of one parent in Morton order.
    pub fn is_family(octants: &[Octant]) -> bool {
        if octants.len() != NCHILDREN || octants[0].level == 0 {
            return false;
        }
        let parent = octants[0].parent();
        octants
            .iter()
            .enumerate()
            .all(|(id, octant)| *octant == parent.child(id))
    }

    /// The first descendant on `level`, sharing the anchor.
    pub fn first_descendant(&self, level: u8) -> Octant {
        assert!(level >= self.level && level <= MAX_LEVEL);
        Octant {
            coordinates: self.coordinates,
            level,
        }
    }

    /// The last descendant on `level`, in the opposite corner.
    pub fn last_descendant(&self, level: u8) -> Octant {
        assert!(level >= self.level && level <= MAX_LEVEL);
        let shift = self.length() - level_length(level);
        Octant {
            coordinates: self.coordinates.map(|c| c + shift),
            level,
        }
    }

    /// The finest octant containing both `self` and `other`.
    pub fn finest_common_ancestor(&self, other: &Octant) -> Octant {
        let diff = (0..3)
            .map(|axis| self.coordinates[axis] ^ other.coordinates[axis])
            .fold(0, |acc, d| acc | d);
        // Coordinates use the lowest MAX_LEVEL bits, so the anchors agree on
        // every level above the highest differing bit.
        let agree = (diff.leading_zeros() - (32 - MAX_LEVEL as u32)) as u8;
        let level = agree.min(self.level).min(other.level);
        self.ancestor(level)
    }

    /// Anchor of the same-size octant displaced by `offset` lengths.
    ///
    /// The result may lie outside the root.
    pub fn displaced_anchor(&self, offset: [i32; 3]) -> [i64; 3] {
        let len = self.length() as i64;
        std::array::from_fn(|axis| self.coordinates[axis] as i64 + offset[axis] as i64 * len)
    }
}

/// Side length of an octant on `level`.
pub fn level_length(level: u8) -> u32 {
    1 << (MAX_LEVEL - level)
}

// Return true if the most significant bit of `x` is below the one of `y`.
fn less_msb(x: u32, y: u32) -> bool {
    x < y && x < (x ^ y)
}

impl Ord for Octant {
    /// Morton order of the anchors, ancestors before descendants.
    fn cmp(&self, other: &Self) -> Ordering {
        let [x1, y1, z1] = self.coordinates;
        let [x2, y2, z2] = other.coordinates;

        let (dx, dy, dz) = (x1 ^ x2, y1 ^ y2, z1 ^ z2);

        if dx | dy | dz == 0 {
            return self.level.cmp(&other.level);
        }

        // Axes are ordered z, y, x by significance within a bit plane.
        let mut axis = 2;
        let mut best = dz;
        if less_msb(best, dy) {
            axis = 1;
            best = dy;
        }
        if less_msb(best, dx) {
            axis = 0;
        }

        self.coordinates[axis].cmp(&other.coordinates[axis])
    }
}

impl PartialOrd for Octant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Octant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.coordinates;
        write!(f, "(level: {}, anchor: [{}, {}, {}])", self.level, x, y, z)
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::Octant;
    use crate::constants::{MAX_LEVEL, ROOT_LEN};

    #[test]
    fn test_children_and_parent() {
        let octant = Octant::from_index_and_level([3, 1, 2], 2);
        let children = octant.children();

        for (id, child) in children.iter().enumerate() {
            assert_eq!(child.parent(), octant);
            assert_eq!(child.child_id(), id);
            assert!(octant.is_ancestor(child));
            assert!(!child.is_ancestor(&octant));
        }

        assert!(Octant::is_family(&children));
        assert!(!Octant::is_family(&children[1..]));
        assert_eq!(children[5].siblings(), children);
    }

    #[test]
    fn test_order_is_morton_order() {
        let root = Octant::root();
        let children = root.children();

        // Children sorted by Morton order stay in child order.
        assert!(children.iter().tuple_windows().all(|(a, b)| a < b));

        // Ancestors come before their descendants.
        assert!(root < children[0]);
        assert!(children[0] < children[0].children()[0]);

        // All descendants of a child lie between it and its next sibling.
        let deep = children[3].last_descendant(MAX_LEVEL);
        assert!(children[3] < deep && deep < children[4]);

        // The z bit is the most significant at equal bit plane.
        let x_step = Octant::from_index_and_level([1, 0, 0], 1);
        let z_step = Octant::from_index_and_level([0, 0, 1], 1);
        assert!(x_step < z_step);
    }

    #[test]
    fn test_descendants() {
        let octant = Octant::from_index_and_level([1, 0, 1], 1);
        let first = octant.first_descendant(MAX_LEVEL);
        let last = octant.last_descendant(MAX_LEVEL);

        assert_eq!(first.coordinates(), octant.coordinates());
        assert_eq!(last.coordinates(), [ROOT_LEN - 1, ROOT_LEN / 2 - 1, ROOT_LEN - 1]);
        assert!(octant.contains(&first) && octant.contains(&last));
        assert!(octant.contains(&octant));
        assert!(!octant.is_ancestor(&octant));
    }

    #[test]
    fn test_finest_common_ancestor() {
        let a = Octant::from_index_and_level([0, 0, 0], 4);
        let b = Octant::from_index_and_level([1, 1, 0], 4);
        let c = Octant::from_index_and_level([15, 0, 0], 4);

        assert_eq!(a.finest_common_ancestor(&b), a.ancestor(3));
        assert_eq!(a.finest_common_ancestor(&c), Octant::root());
        assert_eq!(a.finest_common_ancestor(&a), a);
        assert_eq!(a.parent().finest_common_ancestor(&a), a.parent());
    }

    #[test]
    fn test_validity() {
        assert!(Octant::root().is_valid());
        assert!(Octant::from_index_and_level([7, 7, 7], 3).is_valid());
        assert_eq!(Octant::root().displaced_anchor([-1, 0, 1]), [
            -(ROOT_LEN as i64),
            0,
            ROOT_LEN as i64
        ]);
    }
}
