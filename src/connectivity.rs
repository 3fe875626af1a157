//! The coarse mesh connecting the trees of a forest.
//!
//! Trees are arranged as an axis-aligned brick of unit cubes. All trees share
//! the same orientation, so crossing a tree boundary is a pure translation of
//! octant coordinates.

use crate::{
    constants::ROOT_LEN,
    octant::Octant,
};

/// Brick-shaped coarse mesh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connectivity {
    dims: [usize; 3],
    periodic: [bool; 3],
}

impl Connectivity {
    /// A single tree covering the unit cube.
    pub fn unit_cube() -> Self {
        Self::brick([1, 1, 1], [false; 3])
    }

    /// A brick of `dims[0] x dims[1] x dims[2]` trees.
    ///
    /// Trees are numbered `x + dims[0] * (y + dims[1] * z)`. A periodic axis
    /// connects the last layer of trees back to the first.
    pub fn brick(dims: [usize; 3], periodic: [bool; 3]) -> Self {
        assert!(dims.iter().all(|&d| d > 0), "a brick needs at least one tree per axis");
        Self { dims, periodic }
    }

    /// The number of trees.
    pub fn num_trees(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of trees along each axis.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Position of a tree inside the brick.
    pub fn tree_position(&self, tree: usize) -> [usize; 3] {
        assert!(tree < self.num_trees());
        let [nx, ny, _] = self.dims;
        [tree % nx, (tree / nx) % ny, tree / (nx * ny)]
    }

    /// The tree displaced by `shift` trees along each axis, if it exists.
    pub fn tree_neighbour(&self, tree: usize, shift: [i32; 3]) -> Option<usize> {
        let position = self.tree_position(tree);
        let mut target = [0usize; 3];

        for axis in 0..3 {
            let n = self.dims[axis] as i64;
            let mut p = position[axis] as i64 + shift[axis] as i64;
            if p < 0 || p >= n {
                if !self.periodic[axis] {
                    return None;
                }
                p = p.rem_euclid(n);
            }
            target[axis] = p as usize;
        }

        let [nx, ny, _] = self.dims;
        Some(target[0] + nx * (target[1] + ny * target[2]))
    }

    /// The same-size neighbour of `octant` in direction `offset`.
    ///
    /// Each component of `offset` is -1, 0 or 1. The neighbour is returned
    /// together with the tree that contains it, or `None` if it lies outside
    /// a non-periodic domain boundary.
    pub fn neighbour(&self, tree: usize, octant: &Octant, offset: [i32; 3]) -> Option<(usize, Octant)> {
        let anchor = octant.displaced_anchor(offset);
        let root = ROOT_LEN as i64;

        let mut shift = [0i32; 3];
        let mut coordinates = [0u32; 3];
        for axis in 0..3 {
            let mut c = anchor[axis];
            if c < 0 {
                shift[axis] = -1;
                c += root;
            } else if c >= root {
                shift[axis] = 1;
                c -= root;
            }
            coordinates[axis] = c as u32;
        }

        let target = if shift == [0, 0, 0] {
            tree
        } else {
            self.tree_neighbour(tree, shift)?
        };

        Some((target, Octant::new(coordinates, octant.level())))
    }
}
