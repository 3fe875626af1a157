//! Definition of the distributed forest.
//!
//! A [Forest] stores the octants of all trees of a [Connectivity] that are
//! owned by the calling process. The octants of the whole process group form
//! one sequence in the global order (tree first, then octant order). Each
//! process owns a contiguous piece of it, described by the global first
//! octant index and the global first position of every process. These two
//! arrays are replicated on all processes, so the owner of any octant is known
//! without communication.
//!
//! Operations marked as collective must be called by all processes of the
//! group in the same order.
mod balance;
mod coarsen;
mod discovery;
mod partition;
mod refine;
mod tree;

pub use balance::{BalanceKind, BalanceReport};
pub use coarsen::CoarsenCandidate;
pub use tree::{find_containing, is_linear, LocalTree, TreeOctant};

use bytemuck::{Pod, Zeroable};
use itertools::Itertools;
use tracing::{debug, info};

use crate::{
    codec::OctantRecord,
    communicator::{Communicator, Reduction},
    config::{BalanceConfig, CreateOptions, ForestConfig},
    connectivity::Connectivity,
    constants::MAX_LEVEL,
    error::ForestError,
    morton::{cells_on_level, coarsest_cover},
    octant::Octant,
    tools::{check_collective, gather_to_all, Operation},
    wide_index::WideIndex,
};

/// Callback initializing the data of a new octant.
pub type InitFn<'h, D> = dyn FnMut(usize, &Octant, &mut D) + 'h;

/// Callback observing the replacement of octants.
pub type ReplaceFn<'h, D> = dyn FnMut(usize, Replacement<'_, D>) + 'h;

/// Octants that replace other octants during refinement or coarsening.
///
/// Either one octant is replaced by its eight children or a family of eight
/// octants by their parent. The incoming data has been zero-initialized and
/// passed through the init hook before the replace hook sees it. The outgoing
/// data is dropped afterwards.
pub struct Replacement<'r, D> {
    /// The octants that are removed.
    pub outgoing: &'r [Octant],
    /// The data of the removed octants.
    pub outgoing_data: &'r [D],
    /// The octants that are inserted.
    pub incoming: &'r [Octant],
    /// The data of the inserted octants.
    pub incoming_data: &'r mut [D],
}

/// Optional callbacks invoked when octants are created or replaced.
pub struct Hooks<'h, D> {
    init: Option<Box<InitFn<'h, D>>>,
    replace: Option<Box<ReplaceFn<'h, D>>>,
}

impl<D> Default for Hooks<'_, D> {
    fn default() -> Self {
        Self {
            init: None,
            replace: None,
        }
    }
}

impl<'h, D> Hooks<'h, D> {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the callback that initializes the data of every new octant.
    pub fn with_init(mut self, init: impl FnMut(usize, &Octant, &mut D) + 'h) -> Self {
        self.init = Some(Box::new(init));
        self
    }

    /// Set the callback that observes replacements.
    pub fn with_replace(mut self, replace: impl FnMut(usize, Replacement<'_, D>) + 'h) -> Self {
        self.replace = Some(Box::new(replace));
        self
    }

    pub(crate) fn init(&mut self, tree: usize, octant: &Octant, data: &mut D) {
        if let Some(init) = self.init.as_mut() {
            init(tree, octant, data);
        }
    }

    pub(crate) fn replace(&mut self, tree: usize, replacement: Replacement<'_, D>) {
        if let Some(replace) = self.replace.as_mut() {
            replace(tree, replacement);
        }
    }
}

/// The revision of a forest captured by a structure derived from it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct RevisionStamp {
    revision: u64,
}

impl RevisionStamp {
    /// The captured revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Fail with [ForestError::StaleRevision] if the forest has changed
    /// since the stamp was taken.
    pub fn ensure_current<C: Communicator, D: Pod>(
        &self,
        forest: &Forest<'_, C, D>,
    ) -> Result<(), ForestError> {
        if self.revision == forest.revision() {
            Ok(())
        } else {
            Err(ForestError::StaleRevision {
                built: self.revision,
                current: forest.revision(),
            })
        }
    }
}

// Contribution of one process to the replicated partition arrays.
#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct RangeRecord {
    count: u64,
    tree: u64,
    coordinates: [u32; 3],
    nonempty: u32,
}

// Contribution of one process to the validity check.
#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct ValidityRecord {
    first: OctantRecord,
    last: OctantRecord,
    nonempty: u32,
    ok: u32,
    volume: [u64; 2],
}

/// A forest of octrees distributed over a process group.
pub struct Forest<'a, C: Communicator, D: Pod = ()> {
    comm: &'a C,
    connectivity: &'a Connectivity,
    trees: Vec<LocalTree<D>>,
    global_first_octant: Vec<WideIndex>,
    global_first_position: Vec<TreeOctant>,
    revision: u64,
    balance_config: BalanceConfig,
}

impl<'a, C: Communicator, D: Pod> Forest<'a, C, D> {
    /// Create a new forest. Collective.
    ///
    /// The initial level is the smallest level not below `options.min_level`
    /// that provides at least `options.min_octants` octants per process. The
    /// uniform sequence of cells on that level is split evenly among the
    /// processes. Without `fill_uniform` every process covers its piece with
    /// the coarsest aligned octants that are not coarser than `min_level`.
    ///
    /// The data of every octant is zeroed and then passed to the init hook.
    pub fn new(
        comm: &'a C,
        connectivity: &'a Connectivity,
        options: &CreateOptions,
        hooks: &mut Hooks<'_, D>,
    ) -> Result<Self, ForestError> {
        check_collective(Operation::New, comm)?;

        if options.min_level > MAX_LEVEL {
            return Err(ForestError::LevelOutOfRange(options.min_level as u32));
        }

        let size = comm.size() as u128;
        let rank = comm.rank() as u128;
        let num_trees = connectivity.num_trees();

        let wanted = options.min_octants as u128 * size;
        let mut level = options.min_level;
        while level < MAX_LEVEL && (num_trees as u128) << (3 * level as u32) < wanted {
            level += 1;
        }

        // We now split the uniform sequence of cells evenly.
        let per_tree = u128::from(cells_on_level(level));
        let total = num_trees as u128 * per_tree;
        let split = |r: u128| (total / size) * r + (total % size) * r / size;
        let (first, end) = (split(rank), split(rank + 1));

        let mut trees = (0..num_trees).map(|_| LocalTree::new()).collect_vec();

        if first < end {
            let first_tree = (first / per_tree) as usize;
            let last_tree = ((end - 1) / per_tree) as usize;
            for (tree, local) in trees
                .iter_mut()
                .enumerate()
                .take(last_tree + 1)
                .skip(first_tree)
            {
                let offset = tree as u128 * per_tree;
                let tree_first = first.max(offset) - offset;
                let tree_last = end.min(offset + per_tree) - 1 - offset;

                let octants = if options.fill_uniform {
                    (tree_first..=tree_last)
                        .map(|id| Octant::from_linear_id(level, WideIndex::from(id)))
                        .collect_vec()
                } else {
                    coarsest_cover(
                        level,
                        options.min_level,
                        WideIndex::from(tree_first),
                        WideIndex::from(tree_last),
                    )
                };

                for octant in octants {
                    let mut data = D::zeroed();
                    hooks.init(tree, &octant, &mut data);
                    local.push(octant, data);
                }
            }
        }

        let mut forest = Self {
            comm,
            connectivity,
            trees,
            global_first_octant: Vec::new(),
            global_first_position: Vec::new(),
            revision: 0,
            balance_config: BalanceConfig::default(),
        };

        let global = forest.update_global_ranges()?;

        info!(
            rank = comm.rank(),
            level,
            local = forest.local_num_octants(),
            global,
            "created forest"
        );

        Ok(forest)
    }

    /// Create a forest from a full configuration. Collective.
    pub fn from_config(
        comm: &'a C,
        connectivity: &'a Connectivity,
        config: &ForestConfig,
        hooks: &mut Hooks<'_, D>,
    ) -> Result<Self, ForestError> {
        let mut forest = Self::new(comm, connectivity, &config.create, hooks)?;
        forest.balance_config = config.balance.clone();
        Ok(forest)
    }

    /// Deep copy of the forest sharing communicator and connectivity.
    ///
    /// Without `copy_data` the data of the copy is zeroed. The revision of
    /// the copy starts at zero.
    pub fn copy(&self, copy_data: bool) -> Forest<'a, C, D> {
        let trees = self
            .trees
            .iter()
            .map(|tree| {
                let data = if copy_data {
                    tree.data().to_vec()
                } else {
                    vec![D::zeroed(); tree.len()]
                };
                LocalTree::from_parts(tree.octants().to_vec(), data)
            })
            .collect();

        Forest {
            comm: self.comm,
            connectivity: self.connectivity,
            trees,
            global_first_octant: self.global_first_octant.clone(),
            global_first_position: self.global_first_position.clone(),
            revision: 0,
            balance_config: self.balance_config.clone(),
        }
    }

    /// Return the communicator.
    pub fn comm(&self) -> &'a C {
        self.comm
    }

    /// Return the connectivity.
    pub fn connectivity(&self) -> &'a Connectivity {
        self.connectivity
    }

    /// The local parts of all trees, indexed by tree.
    ///
    /// Trees outside the local range are empty.
    pub fn trees(&self) -> &[LocalTree<D>] {
        &self.trees
    }

    /// The local part of tree `tree`.
    pub fn tree(&self, tree: usize) -> Result<&LocalTree<D>, ForestError> {
        self.trees.get(tree).ok_or(ForestError::TreeOutOfRange {
            tree,
            num_trees: self.trees.len(),
        })
    }

    /// Mutable access to the data of the local part of tree `tree`.
    pub fn tree_data_mut(&mut self, tree: usize) -> Result<&mut [D], ForestError> {
        let num_trees = self.trees.len();
        self.trees
            .get_mut(tree)
            .map(LocalTree::data_mut)
            .ok_or(ForestError::TreeOutOfRange { tree, num_trees })
    }

    /// Iterate over all local octants in global order.
    pub fn local_octants(&self) -> impl Iterator<Item = (TreeOctant, &D)> {
        self.trees.iter().enumerate().flat_map(|(tree, local)| {
            local
                .iter()
                .map(move |(octant, data)| (TreeOctant::new(tree, *octant), data))
        })
    }

    /// Global index of the first octant of every process.
    ///
    /// Has `size + 1` entries, the last one is the global number of octants.
    pub fn global_first_octant(&self) -> &[WideIndex] {
        &self.global_first_octant
    }

    /// First finest cell of every process.
    ///
    /// Has `size + 1` entries. The last one is the first cell of the
    /// non-existing tree `num_trees`. An empty process repeats the position
    /// of its successor.
    pub fn global_first_position(&self) -> &[TreeOctant] {
        &self.global_first_position
    }

    /// The revision counter. Incremented by every collective operation that
    /// changes the forest.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Capture the current revision.
    pub fn stamp(&self) -> RevisionStamp {
        RevisionStamp {
            revision: self.revision,
        }
    }

    /// The balance configuration.
    pub fn balance_config(&self) -> &BalanceConfig {
        &self.balance_config
    }

    /// Replace the balance configuration. All processes must use the same one.
    pub fn set_balance_config(&mut self, config: BalanceConfig) {
        self.balance_config = config;
    }

    /// Number of local octants.
    pub fn local_num_octants(&self) -> usize {
        self.trees.iter().map(LocalTree::len).sum()
    }

    /// Number of octants of the whole forest.
    pub fn global_num_octants(&self) -> u64 {
        self.global_first_octant
            .last()
            .map_or(0, |count| count.low())
    }

    /// The first tree with local octants.
    pub fn first_local_tree(&self) -> Option<usize> {
        self.trees.iter().position(|tree| !tree.is_empty())
    }

    /// The last tree with local octants.
    pub fn last_local_tree(&self) -> Option<usize> {
        self.trees.iter().rposition(|tree| !tree.is_empty())
    }

    /// The rank owning the first cell of `octant` in tree `tree`.
    ///
    /// Computed from the replicated partition arrays without communication.
    pub fn find_owner(&self, tree: usize, octant: &Octant) -> Result<usize, ForestError> {
        if tree >= self.trees.len() {
            return Err(ForestError::TreeOutOfRange {
                tree,
                num_trees: self.trees.len(),
            });
        }
        Ok(self.owner_of_position(&TreeOctant::new(tree, *octant).position()))
    }

    // Empty processes share their position with the successor, so the
    // search lands on the last of them, which is the non-empty one.
    fn owner_of_position(&self, position: &TreeOctant) -> usize {
        self.global_first_position
            .partition_point(|first| first <= position)
            .saturating_sub(1)
            .min(self.comm.size() - 1)
    }

    /// The rank owning all of `region`, if a single rank does.
    fn region_owner(&self, region: &TreeOctant) -> Option<usize> {
        let first = self.owner_of_position(&region.position());
        let last = self.owner_of_position(&region.last_position());
        (first == last).then_some(first)
    }

    /// Recompute the replicated partition arrays from the local trees.
    ///
    /// Collective. Returns the global number of octants.
    fn update_global_ranges(&mut self) -> Result<u64, ForestError> {
        let first = self.local_octants().next().map(|(first, _)| first.position());
        let local = RangeRecord {
            count: self.local_num_octants() as u64,
            tree: first.map_or(0, |first| first.tree as u64),
            coordinates: first.map_or([0; 3], |first| first.octant.coordinates()),
            nonempty: u32::from(first.is_some()),
        };

        let records = gather_to_all(&[local], self.comm)?;

        let mut global_first_octant = Vec::with_capacity(records.len() + 1);
        let mut offset = WideIndex::default();
        for record in &records {
            global_first_octant.push(offset);
            offset += WideIndex::from(record.count);
        }
        global_first_octant.push(offset);

        let num_trees = self.trees.len();
        let mut global_first_position =
            vec![TreeOctant::new(num_trees, Octant::root().first_descendant(MAX_LEVEL)); records.len() + 1];
        for (r, record) in records.iter().enumerate().rev() {
            global_first_position[r] = if record.nonempty != 0 {
                let octant = Octant::try_new(record.coordinates, MAX_LEVEL).ok_or_else(|| {
                    ForestError::Invariant(format!("rank {} reported an invalid position", r))
                })?;
                TreeOctant::new(record.tree as usize, octant)
            } else {
                global_first_position[r + 1]
            };
        }

        self.global_first_octant = global_first_octant;
        self.global_first_position = global_first_position;

        Ok(offset.low())
    }

    /// Refresh the global octant counts after local modifications such as
    /// [Forest::balance_subtree]. Collective.
    ///
    /// Increments the revision if the global number of octants changed.
    pub fn update_counts(&mut self) -> Result<u64, ForestError> {
        let before = self.global_num_octants();
        let after = self.update_global_ranges()?;
        if before != after {
            self.revision += 1;
        }
        Ok(after)
    }

    /// Check the structural invariants of the forest. Collective.
    ///
    /// Verifies that every local tree is sorted and disjoint, that the local
    /// octants match the replicated partition arrays, that consecutive
    /// processes do not overlap and that the octants cover every tree
    /// exactly once.
    pub fn is_valid(&self) -> Result<bool, ForestError> {
        check_collective(Operation::IsValid, self.comm)?;

        let rank = self.comm.rank();
        let size = self.comm.size();

        let mut ok = self.trees.iter().all(LocalTree::is_linear);

        let expected = self.global_first_octant[rank + 1] - self.global_first_octant[rank];
        ok &= expected == WideIndex::from(self.local_num_octants());

        let lower = self.global_first_position[rank];
        let upper = self.global_first_position[rank + 1];
        ok &= self
            .local_octants()
            .all(|(octant, _)| lower <= octant.position() && octant.last_position() < upper);

        let first = self.local_octants().next().map(|(octant, _)| octant);
        let last = self.local_octants().last().map(|(octant, _)| octant);
        if let Some(first) = first {
            ok &= first.position() == lower;
        }

        let volume = self
            .trees
            .iter()
            .fold(WideIndex::default(), |acc, tree| acc + tree.volume());

        let fallback = TreeOctant::new(0, Octant::root());
        let local = ValidityRecord {
            first: OctantRecord::from(&first.unwrap_or(fallback)),
            last: OctantRecord::from(&last.unwrap_or(fallback)),
            nonempty: u32::from(first.is_some()),
            ok: u32::from(ok),
            volume: [volume.high(), volume.low()],
        };

        let records = gather_to_all(&[local], self.comm)?;

        if let Some(r) = records.iter().position(|record| record.ok == 0) {
            debug!(rank, failed = r, "local forest invariants violated");
            return Ok(false);
        }

        let num_trees = self.trees.len();
        let mut previous: Option<TreeOctant> = None;
        let mut total = 0u128;
        for record in &records {
            total += ((record.volume[0] as u128) << 64) | record.volume[1] as u128;
            if record.nonempty == 0 {
                continue;
            }
            let first = record.first.to_tree_octant(num_trees)?;
            if let Some(previous) = previous {
                if previous >= first
                    || (previous.tree == first.tree && previous.octant.is_ancestor(&first.octant))
                {
                    debug!(rank, "octants of consecutive processes overlap");
                    return Ok(false);
                }
            }
            previous = Some(record.last.to_tree_octant(num_trees)?);
        }

        let complete = total == num_trees as u128 * u128::from(cells_on_level(MAX_LEVEL));
        if !complete {
            debug!(rank, "octants do not cover the forest");
        }

        let consistent = self.global_first_octant[0] == WideIndex::default()
            && self.global_first_octant.len() == size + 1
            && self
                .global_first_octant
                .iter()
                .tuple_windows()
                .all(|(a, b)| a <= b);

        Ok(complete && consistent)
    }

    /// The global first octant indices as plain integers.
    fn global_first_indices(&self) -> Vec<u64> {
        self.global_first_octant.iter().map(WideIndex::low).collect()
    }

    /// Sum a local count over all processes.
    fn global_sum(&self, value: u64) -> Result<u64, ForestError> {
        Ok(self.comm.all_reduce(&[value], Reduction::Sum)?[0])
    }
}
