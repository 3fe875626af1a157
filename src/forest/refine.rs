//! Refinement of local octants.

use bytemuck::Pod;
use tracing::info;

use super::{Forest, Hooks, Replacement};
use crate::{
    communicator::Communicator,
    constants::{MAX_LEVEL, NCHILDREN},
    error::ForestError,
    octant::Octant,
    tools::{check_collective, Operation},
};

/// Replace `octant` by its children, running the hooks on the new data.
pub(super) fn split<D: Pod>(
    tree: usize,
    octant: &Octant,
    data: &D,
    hooks: &mut Hooks<'_, D>,
) -> ([Octant; NCHILDREN], [D; NCHILDREN]) {
    let children = octant.children();
    let mut child_data = [D::zeroed(); NCHILDREN];
    for (child, data) in children.iter().zip(child_data.iter_mut()) {
        hooks.init(tree, child, data);
    }

    hooks.replace(
        tree,
        Replacement {
            outgoing: std::slice::from_ref(octant),
            outgoing_data: std::slice::from_ref(data),
            incoming: &children,
            incoming_data: &mut child_data,
        },
    );

    (children, child_data)
}

/// Refine the octants of one tree. Returns the new octants and data together
/// with the number of refined octants.
///
/// Nothing of the tree is modified here, so a panicking callback leaves it
/// intact.
pub(super) fn refine_tree<D: Pod, F>(
    tree: usize,
    octants: &[Octant],
    data: &[D],
    recursive: bool,
    max_level: u8,
    refine_fn: &mut F,
    hooks: &mut Hooks<'_, D>,
) -> (Vec<Octant>, Vec<D>, u64)
where
    F: FnMut(usize, &Octant, &D) -> bool,
{
    let mut new_octants = Vec::with_capacity(octants.len());
    let mut new_data = Vec::with_capacity(data.len());
    let mut refined = 0;

    // Octants waiting for their predicate. Children are pushed in reverse so
    // that they leave the stack in Morton order.
    let mut stack = Vec::<(Octant, D)>::new();

    for (octant, octant_data) in octants.iter().zip(data) {
        stack.push((*octant, *octant_data));

        while let Some((octant, octant_data)) = stack.pop() {
            if octant.level() >= max_level || !refine_fn(tree, &octant, &octant_data) {
                new_octants.push(octant);
                new_data.push(octant_data);
                continue;
            }

            let (children, child_data) = split(tree, &octant, &octant_data, hooks);
            refined += 1;

            if recursive {
                stack.extend(children.into_iter().zip(child_data).rev());
            } else {
                new_octants.extend_from_slice(&children);
                new_data.extend_from_slice(&child_data);
            }
        }
    }

    (new_octants, new_data, refined)
}

impl<C: Communicator, D: Pod> Forest<'_, C, D> {
    /// Refine octants for which `refine_fn` returns true. Collective.
    ///
    /// The predicate is evaluated for every local octant whose level is below
    /// `max_level` (or [MAX_LEVEL] if `None`). A refined octant is replaced by
    /// its eight children. The data of each child is zeroed, then passed to
    /// the init hook, and finally the replace hook sees the whole
    /// replacement. If `recursive` is set, the children are evaluated as
    /// well.
    ///
    /// The rewrite is purely local. The pass ends with one collective update
    /// of the global octant counts. Returns the global number of refined
    /// octants.
    ///
    /// # Panics
    /// A panic in `refine_fn` or in a hook unwinds out of this call. Trees
    /// finished before keep their new octants and the tree in progress keeps
    /// its previous state. The count update is skipped, so
    /// [Forest::global_first_octant] is stale and [Forest::is_valid] reports
    /// false until the forest is discarded.
    pub fn refine<F>(
        &mut self,
        recursive: bool,
        max_level: Option<u8>,
        mut refine_fn: F,
        hooks: &mut Hooks<'_, D>,
    ) -> Result<u64, ForestError>
    where
        F: FnMut(usize, &Octant, &D) -> bool,
    {
        check_collective(Operation::Refine, self.comm)?;

        let max_level = max_level.unwrap_or(MAX_LEVEL);
        if max_level > MAX_LEVEL {
            return Err(ForestError::LevelOutOfRange(max_level as u32));
        }

        let mut local_refined = 0;
        for (tree_index, tree) in self.trees.iter_mut().enumerate() {
            let (octants, data, refined) = refine_tree(
                tree_index,
                tree.octants(),
                tree.data(),
                recursive,
                max_level,
                &mut refine_fn,
                hooks,
            );
            if refined > 0 {
                tree.replace_all(octants, data);
                local_refined += refined;
            }
        }

        let before = self.global_num_octants();
        let after = self.update_counts()?;
        let global_refined = (after - before) / (NCHILDREN as u64 - 1);

        info!(
            rank = self.comm.rank(),
            local_refined,
            global_refined,
            global = after,
            revision = self.revision,
            "refined forest"
        );

        Ok(global_refined)
    }
}

#[cfg(test)]
mod test {
    use super::refine_tree;
    use crate::{
        forest::{is_linear, Hooks, Replacement},
        octant::Octant,
    };

    #[test]
    fn test_recursive_refine_keeps_order() {
        let octants = Octant::root().children().to_vec();
        let data = vec![0u8; 8];

        // Refine towards the corner of the first child down to level 3.
        let (octants, data, refined) = refine_tree(
            0,
            &octants,
            &data,
            true,
            3,
            &mut |_, octant: &Octant, _: &u8| octant.coordinates() == [0, 0, 0],
            &mut Hooks::new(),
        );

        assert_eq!(refined, 2);
        assert_eq!(octants.len(), 8 + 7 + 7);
        assert_eq!(data.len(), octants.len());
        assert!(is_linear(&octants));
        assert_eq!(octants[0].level(), 3);
        assert_eq!(octants.last().unwrap().level(), 1);
    }

    #[test]
    fn test_non_recursive_refine_evaluates_once() {
        let octants = vec![Octant::root()];
        let mut calls = 0;

        let (octants, _, refined) = refine_tree(
            0,
            &octants,
            &[()],
            false,
            30,
            &mut |_, _: &Octant, _: &()| {
                calls += 1;
                true
            },
            &mut Hooks::new(),
        );

        assert_eq!(calls, 1);
        assert_eq!(refined, 1);
        assert_eq!(octants, Octant::root().children().to_vec());
    }

    #[test]
    fn test_hook_order() {
        let mut log = Vec::new();
        {
            let log = std::cell::RefCell::new(&mut log);
            let mut hooks = Hooks::new()
                .with_init(|_, octant: &Octant, data: &mut u32| {
                    assert_eq!(*data, 0);
                    *data = octant.child_id() as u32 + 1;
                    log.borrow_mut().push("init");
                })
                .with_replace(|tree, replacement: Replacement<'_, u32>| {
                    assert_eq!(tree, 4);
                    assert_eq!(replacement.outgoing, &[Octant::root()]);
                    assert_eq!(replacement.outgoing_data, &[7]);
                    assert_eq!(replacement.incoming_data, &[1, 2, 3, 4, 5, 6, 7, 8]);
                    replacement.incoming_data[0] = 99;
                    log.borrow_mut().push("replace");
                });

            let (_, data, _) = refine_tree(
                4,
                &[Octant::root()],
                &[7u32],
                false,
                30,
                &mut |_, _: &Octant, _: &u32| true,
                &mut hooks,
            );
            assert_eq!(data[0], 99);
        }

        assert_eq!(log.len(), 9);
        assert!(log[..8].iter().all(|entry| *entry == "init"));
        assert_eq!(log[8], "replace");
    }

    #[test]
    fn test_level_bound_is_respected() {
        let octants = vec![Octant::root()];
        let (octants, _, refined) = refine_tree(
            0,
            &octants,
            &[()],
            true,
            2,
            &mut |_, _: &Octant, _: &()| true,
            &mut Hooks::new(),
        );

        assert_eq!(refined, 9);
        assert_eq!(octants.len(), 64);
        assert!(octants.iter().all(|octant| octant.level() == 2));
    }
}
