//! The local part of a single tree.

use bytemuck::Pod;
use itertools::Itertools;

use crate::{
    constants::MAX_LEVEL,
    octant::Octant,
    wide_index::WideIndex,
};

/// An octant together with the tree it belongs to.
///
/// Ordered by tree first and then by the octant order, which is the global
/// order of the forest.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TreeOctant {
    /// Index of the tree.
    pub tree: usize,
    /// The octant inside the tree.
    pub octant: Octant,
}

impl TreeOctant {
    /// Create a new tree octant.
    pub fn new(tree: usize, octant: Octant) -> Self {
        Self { tree, octant }
    }

    /// The first finest cell of the octant.
    pub fn position(&self) -> TreeOctant {
        TreeOctant::new(self.tree, self.octant.first_descendant(MAX_LEVEL))
    }

    /// The last finest cell of the octant.
    pub fn last_position(&self) -> TreeOctant {
        TreeOctant::new(self.tree, self.octant.last_descendant(MAX_LEVEL))
    }
}

/// Find the leaf among sorted, non-overlapping `leaves` that contains `target`.
pub fn find_containing(leaves: &[Octant], target: &Octant) -> Option<usize> {
    // Ancestors sort before their descendants, so a containing leaf is the
    // last leaf not greater than the target.
    let index = leaves.partition_point(|leaf| leaf <= target).checked_sub(1)?;
    leaves[index].contains(target).then_some(index)
}

/// Return true if `leaves` are strictly increasing and pairwise disjoint.
pub fn is_linear(leaves: &[Octant]) -> bool {
    leaves
        .iter()
        .tuple_windows()
        .all(|(first, second)| first < second && !first.is_ancestor(second))
}

/// The octants of one tree owned by this process and their user data.
#[derive(Clone, Debug, Default)]
pub struct LocalTree<D> {
    octants: Vec<Octant>,
    data: Vec<D>,
}

impl<D: Pod> LocalTree<D> {
    /// An empty tree.
    pub fn new() -> Self {
        Self {
            octants: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Create a tree from octants and matching data.
    pub fn from_parts(octants: Vec<Octant>, data: Vec<D>) -> Self {
        assert_eq!(octants.len(), data.len());
        Self { octants, data }
    }

    /// The octants in order.
    pub fn octants(&self) -> &[Octant] {
        &self.octants
    }

    /// The user data, one entry per octant.
    pub fn data(&self) -> &[D] {
        &self.data
    }

    /// Mutable access to the user data.
    pub fn data_mut(&mut self) -> &mut [D] {
        &mut self.data
    }

    /// Number of local octants.
    pub fn len(&self) -> usize {
        self.octants.len()
    }

    /// Return true if the tree has no local octants.
    pub fn is_empty(&self) -> bool {
        self.octants.is_empty()
    }

    /// Iterate over octants and their data.
    pub fn iter(&self) -> impl Iterator<Item = (&Octant, &D)> {
        self.octants.iter().zip(self.data.iter())
    }

    /// Index of the local leaf containing `target`.
    pub fn find_containing(&self, target: &Octant) -> Option<usize> {
        find_containing(&self.octants, target)
    }

    /// Index of the leaf equal to `octant`.
    pub fn find(&self, octant: &Octant) -> Option<usize> {
        self.octants.binary_search(octant).ok()
    }

    /// Return true if the local octants are sorted and disjoint.
    pub fn is_linear(&self) -> bool {
        self.octants.len() == self.data.len() && is_linear(&self.octants)
    }

    /// The deepest level of a local octant.
    pub fn max_level(&self) -> Option<u8> {
        self.octants.iter().map(Octant::level).max()
    }

    /// Number of octants per level.
    pub fn level_counts(&self) -> [u64; MAX_LEVEL as usize + 1] {
        let mut counts = [0; MAX_LEVEL as usize + 1];
        for octant in &self.octants {
            counts[octant.level() as usize] += 1;
        }
        counts
    }

    /// The volume covered by the local octants in units of finest cells.
    pub fn volume(&self) -> WideIndex {
        self.octants
            .iter()
            .fold(WideIndex::default(), |acc, octant| {
                acc + WideIndex::from(1u64).left_shift(3 * (MAX_LEVEL - octant.level()) as u32)
            })
    }

    pub(crate) fn push(&mut self, octant: Octant, data: D) {
        self.octants.push(octant);
        self.data.push(data);
    }

    pub(crate) fn replace_all(&mut self, octants: Vec<Octant>, data: Vec<D>) {
        assert_eq!(octants.len(), data.len());
        self.octants = octants;
        self.data = data;
    }

    pub(crate) fn clear(&mut self) {
        self.octants.clear();
        self.data.clear();
    }
}
