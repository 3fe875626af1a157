//! Coarsening of complete local families.

use bytemuck::Pod;
use tracing::{debug, info};

use super::{Forest, Hooks, Replacement};
use crate::{
    communicator::Communicator,
    constants::NCHILDREN,
    error::ForestError,
    octant::Octant,
    tools::{check_collective, Operation},
};

/// The octants offered to a coarsening predicate.
pub enum CoarsenCandidate<'c, D> {
    /// Eight siblings in Morton order that can be replaced by their parent.
    Family {
        /// The siblings.
        octants: &'c [Octant],
        /// Their data.
        data: &'c [D],
    },
    /// An octant whose siblings are not all local leaves. The return value of
    /// the predicate is ignored for orphans.
    Orphan {
        /// The octant.
        octant: &'c Octant,
        /// Its data.
        data: &'c D,
    },
}

impl<D> CoarsenCandidate<'_, D> {
    /// The first octant of the candidate.
    pub fn first(&self) -> &Octant {
        match self {
            CoarsenCandidate::Family { octants, .. } => &octants[0],
            CoarsenCandidate::Orphan { octant, .. } => *octant,
        }
    }

    /// Return true for a family.
    pub fn is_family(&self) -> bool {
        matches!(self, CoarsenCandidate::Family { .. })
    }
}

// Result of one coarsening pass over a tree.
pub(super) struct CoarsenPass<D> {
    pub(super) octants: Vec<Octant>,
    pub(super) data: Vec<D>,
    // Marks parents created in this pass.
    pub(super) fresh: Vec<bool>,
    pub(super) coarsened: u64,
}

/// One pass over the octants of a tree.
///
/// If `fresh` is given, only families containing a fresh octant are
/// evaluated and only fresh orphans are reported.
pub(super) fn coarsen_pass<D: Pod, F>(
    tree: usize,
    octants: &[Octant],
    data: &[D],
    fresh: Option<&[bool]>,
    callback_orphans: bool,
    coarsen_fn: &mut F,
    hooks: &mut Hooks<'_, D>,
) -> CoarsenPass<D>
where
    F: FnMut(usize, CoarsenCandidate<'_, D>) -> bool,
{
    let mut pass = CoarsenPass {
        octants: Vec::with_capacity(octants.len()),
        data: Vec::with_capacity(data.len()),
        fresh: Vec::with_capacity(octants.len()),
        coarsened: 0,
    };

    let is_fresh = |range: std::ops::Range<usize>| fresh.map_or(true, |fresh| fresh[range].contains(&true));

    let mut index = 0;
    while index < octants.len() {
        let end = index + NCHILDREN;

        if end <= octants.len() && Octant::is_family(&octants[index..end]) {
            let family = &octants[index..end];
            let family_data = &data[index..end];

            let coarsen = is_fresh(index..end)
                && coarsen_fn(
                    tree,
                    CoarsenCandidate::Family {
                        octants: family,
                        data: family_data,
                    },
                );

            if coarsen {
                let parent = family[0].parent();
                let mut parent_data = D::zeroed();
                hooks.init(tree, &parent, &mut parent_data);
                hooks.replace(
                    tree,
                    Replacement {
                        outgoing: family,
                        outgoing_data: family_data,
                        incoming: std::slice::from_ref(&parent),
                        incoming_data: std::slice::from_mut(&mut parent_data),
                    },
                );

                pass.octants.push(parent);
                pass.data.push(parent_data);
                pass.fresh.push(true);
                pass.coarsened += 1;
            } else {
                pass.octants.extend_from_slice(family);
                pass.data.extend_from_slice(family_data);
                pass.fresh.extend([false; NCHILDREN]);
            }

            index = end;
            continue;
        }

        if callback_orphans && is_fresh(index..index + 1) {
            coarsen_fn(
                tree,
                CoarsenCandidate::Orphan {
                    octant: &octants[index],
                    data: &data[index],
                },
            );
        }

        pass.octants.push(octants[index]);
        pass.data.push(data[index]);
        pass.fresh.push(false);
        index += 1;
    }

    pass
}

impl<C: Communicator, D: Pod> Forest<'_, C, D> {
    /// Coarsen complete local families for which `coarsen_fn` returns true.
    /// Collective.
    ///
    /// A family is eight consecutive local octants that are the children of
    /// one parent. A coarsened family is replaced by the parent, whose data is
    /// zeroed, passed to the init hook and then to the replace hook together
    /// with the family. Families split between processes are never
    /// coarsened.
    ///
    /// With `callback_orphans` every octant that is not part of a family is
    /// offered as [CoarsenCandidate::Orphan]. If `recursive` is set, further
    /// passes evaluate the families formed by new parents until none forms.
    ///
    /// The pass ends with one collective update of the global octant counts.
    /// Returns the global number of coarsened families.
    ///
    /// # Panics
    /// As for [Forest::refine], a panicking callback leaves the finished trees
    /// coarsened and the tree in progress untouched, with stale global
    /// counts.
    pub fn coarsen<F>(
        &mut self,
        recursive: bool,
        callback_orphans: bool,
        mut coarsen_fn: F,
        hooks: &mut Hooks<'_, D>,
    ) -> Result<u64, ForestError>
    where
        F: FnMut(usize, CoarsenCandidate<'_, D>) -> bool,
    {
        check_collective(Operation::Coarsen, self.comm)?;

        let mut local_coarsened = 0;
        for (tree_index, tree) in self.trees.iter_mut().enumerate() {
            if tree.is_empty() {
                continue;
            }

            let mut pass = coarsen_pass(
                tree_index,
                tree.octants(),
                tree.data(),
                None,
                callback_orphans,
                &mut coarsen_fn,
                hooks,
            );
            let mut tree_coarsened = pass.coarsened;

            let mut passes = 1;
            while recursive && pass.coarsened > 0 {
                pass = coarsen_pass(
                    tree_index,
                    &pass.octants,
                    &pass.data,
                    Some(&pass.fresh),
                    callback_orphans,
                    &mut coarsen_fn,
                    hooks,
                );
                tree_coarsened += pass.coarsened;
                passes += 1;
            }

            if tree_coarsened > 0 {
                debug!(tree = tree_index, passes, tree_coarsened, "coarsened tree");
                tree.replace_all(pass.octants, pass.data);
                local_coarsened += tree_coarsened;
            }
        }

        let before = self.global_num_octants();
        let after = self.update_counts()?;
        let global_coarsened = (before - after) / (NCHILDREN as u64 - 1);

        info!(
            rank = self.comm.rank(),
            local_coarsened,
            global_coarsened,
            global = after,
            revision = self.revision,
            "coarsened forest"
        );

        Ok(global_coarsened)
    }
}
