//! Routines for working with Morton (linear) indices of octants.

use num::traits::Zero;

use crate::{
    constants::{BITS_PER_LEVEL, MAX_LEVEL},
    octant::Octant,
    wide_index::WideIndex,
};

impl Octant {
    /// Linear position of the octant on a uniform grid of `level`.
    ///
    /// If the octant is finer than the grid, the position of its ancestor on
    /// `level` is returned. If it is coarser, the grid cell sharing its anchor
    /// is used.
    pub fn linear_id(&self, level: u8) -> WideIndex {
        assert!(level <= MAX_LEVEL);

        let shift = MAX_LEVEL - level;
        let index = self.coordinates().map(|c| c >> shift);

        let mut id = WideIndex::zero();
        for bit in 0..level as u32 {
            for (axis, &coordinate) in index.iter().enumerate() {
                if (coordinate >> bit) & 1 == 1 {
                    id.set_bit(BITS_PER_LEVEL * bit + axis as u32);
                }
            }
        }

        id
    }

    /// The octant on `level` at linear position `id` of the uniform grid.
    ///
    /// This is the inverse of [Octant::linear_id] on that level.
    pub fn from_linear_id(level: u8, id: WideIndex) -> Octant {
        assert!(level <= MAX_LEVEL);
        debug_assert!(
            id < WideIndex::ONE.left_shift(BITS_PER_LEVEL * level as u32),
            "linear id {} out of range on level {}",
            id,
            level
        );

        let mut index = [0u32; 3];
        for bit in 0..level as u32 {
            for (axis, coordinate) in index.iter_mut().enumerate() {
                if id.bit(BITS_PER_LEVEL * bit + axis as u32) {
                    *coordinate |= 1 << bit;
                }
            }
        }

        Octant::from_index_and_level(index, level)
    }

    /// Linear position on the finest grid. Together with the level this
    /// defines the total order of octants.
    pub fn morton_id(&self) -> WideIndex {
        self.linear_id(MAX_LEVEL)
    }
}

/// Number of cells of a uniform grid on `level` inside one tree.
pub fn cells_on_level(level: u8) -> WideIndex {
    WideIndex::ONE.left_shift(BITS_PER_LEVEL * level as u32)
}

/// Cover the cells `first..=last` of the uniform grid on `level` with the
/// coarsest aligned octants that are not coarser than `min_level`.
///
/// The result is sorted and non-overlapping.
pub fn coarsest_cover(level: u8, min_level: u8, first: WideIndex, last: WideIndex) -> Vec<Octant> {
    assert!(min_level <= level && first <= last);

    let mut result = Vec::new();
    let mut current = first;

    loop {
        // Grow the block while it stays aligned and inside the range.
        let mut coarsen_by = 0u8;
        while coarsen_by < level - min_level {
            let exponent = BITS_PER_LEVEL * (coarsen_by as u32 + 1);
            let aligned = (current & WideIndex::low_mask(exponent)).is_zero();
            let block_last = current + WideIndex::low_mask(exponent);
            if !aligned || block_last > last {
                break;
            }
            coarsen_by += 1;
        }

        result.push(Octant::from_linear_id(level, current).ancestor(level - coarsen_by));

        let block_last = current + WideIndex::low_mask(BITS_PER_LEVEL * coarsen_by as u32);
        if block_last >= last {
            break;
        }
        current = block_last + WideIndex::ONE;
    }

    result
}
