//! Refinement and coarsening on process groups of different sizes.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use bempp_forest::{
    CoarsenCandidate, Communicator, Connectivity, CreateOptions, Forest, ForestError, Hooks,
    LocalCluster, Octant, Replacement,
};

fn corner_predicate(_: usize, octant: &Octant, _: &()) -> bool {
    octant.coordinates() == [0, 0, 0]
}

#[test]
fn test_coarsen_level_two_to_level_one() {
    let connectivity = Connectivity::unit_cube();

    for size in [1, 2] {
        let results = LocalCluster::run(size, |comm| {
            let mut forest =
                Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(2), &mut Hooks::new())
                    .unwrap();
            assert_eq!(forest.global_num_octants(), 64);

            let coarsened = forest
                .coarsen(false, false, |_, _| true, &mut Hooks::new())
                .unwrap();

            assert!(forest.is_valid().unwrap());
            (coarsened, forest.global_num_octants(), forest.revision())
        });

        for (coarsened, global, revision) in results {
            assert_eq!(coarsened, 8);
            assert_eq!(global, 8);
            assert_eq!(revision, 1);
        }
    }
}

#[test]
fn test_families_split_between_processes_stay() {
    let connectivity = Connectivity::unit_cube();

    // Three processes own 21, 21 and 22 octants, which splits two families.
    let results = LocalCluster::run(3, |comm| {
        let mut forest =
            Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(2), &mut Hooks::new())
                .unwrap();
        let coarsened = forest
            .coarsen(false, false, |_, _| true, &mut Hooks::new())
            .unwrap();
        assert!(forest.is_valid().unwrap());
        (coarsened, forest.global_num_octants())
    });

    for (coarsened, global) in results {
        assert_eq!(coarsened, 6);
        assert_eq!(global, 64 - 6 * 7);
    }
}

#[test]
fn test_recursive_refine_and_coarsen() {
    let connectivity = Connectivity::unit_cube();

    let results = LocalCluster::run(3, |comm| {
        let mut forest =
            Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(1), &mut Hooks::new())
                .unwrap();

        let refined = forest
            .refine(true, Some(4), corner_predicate, &mut Hooks::new())
            .unwrap();
        assert!(forest.is_valid().unwrap());
        let after_refine = (refined, forest.global_num_octants(), forest.local_num_octants());

        let coarsened = forest
            .coarsen(true, false, |_, _| true, &mut Hooks::new())
            .unwrap();
        assert!(forest.is_valid().unwrap());

        (
            after_refine,
            (coarsened, forest.global_num_octants(), forest.local_num_octants()),
            forest.revision(),
        )
    });

    let local_after_refine = [2 + 21, 3, 3];
    for (rank, (after_refine, after_coarsen, revision)) in results.into_iter().enumerate() {
        assert_eq!(after_refine, (3, 29, local_after_refine[rank]));
        assert_eq!(after_coarsen, (3, 8, [2, 3, 3][rank]));
        assert_eq!(revision, 2);
    }
}

#[test]
fn test_refine_at_level_ceiling_is_ignored() {
    let connectivity = Connectivity::unit_cube();
    let comm = LocalCluster::communicators(1).pop().unwrap();
    let mut forest =
        Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(3), &mut Hooks::new()).unwrap();

    let refined = forest
        .refine(false, Some(3), |_, _, _| true, &mut Hooks::new())
        .unwrap();

    assert_eq!(refined, 0);
    assert_eq!(forest.revision(), 0);
    assert!(matches!(
        forest.refine(false, Some(31), |_, _, _| true, &mut Hooks::new()),
        Err(ForestError::LevelOutOfRange(31))
    ));
}

#[test]
fn test_hooks_see_every_replacement() {
    let connectivity = Connectivity::brick([2, 1, 1], [false; 3]);

    let results = LocalCluster::run(2, |comm| {
        let replaced = Cell::new((0usize, 0usize));
        let mut hooks = Hooks::new()
            .with_init(|tree, octant: &Octant, data: &mut u64| {
                *data = 10 * tree as u64 + octant.level() as u64;
            })
            .with_replace(|_, replacement: Replacement<'_, u64>| {
                let (outgoing, incoming) = replaced.get();
                replaced.set((
                    outgoing + replacement.outgoing.len(),
                    incoming + replacement.incoming.len(),
                ));
                // Parents summarise their children.
                if replacement.incoming.len() == 1 {
                    replacement.incoming_data[0] = replacement.outgoing_data.iter().sum();
                }
            });

        let mut forest =
            Forest::new(&comm, &connectivity, &CreateOptions::uniform(1), &mut hooks).unwrap();
        forest.refine(false, None, |_, _, _| true, &mut hooks).unwrap();
        let refined_data = forest.local_octants().map(|(_, data)| *data).collect::<Vec<_>>();

        forest
            .coarsen(false, false, |_, candidate| candidate.is_family(), &mut hooks)
            .unwrap();
        let coarsened_data = forest.local_octants().map(|(_, data)| *data).collect::<Vec<_>>();
        drop(hooks);

        (comm.rank(), refined_data, coarsened_data, replaced.get())
    });

    for (rank, refined_data, coarsened_data, replaced) in results {
        // Rank r owns tree r.
        let tree = rank as u64;
        assert_eq!(refined_data, vec![10 * tree + 2; 64]);
        assert_eq!(coarsened_data, vec![8 * (10 * tree + 2); 8]);
        assert_eq!(replaced, (8 + 64, 64 + 8));
    }
}

#[test]
fn test_orphans_are_offered_once() {
    let connectivity = Connectivity::unit_cube();

    let results = LocalCluster::run(3, |comm| {
        let mut forest =
            Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(2), &mut Hooks::new())
                .unwrap();
        let mut orphans = 0;
        let mut families = 0;
        forest
            .coarsen(
                false,
                true,
                |_, candidate: CoarsenCandidate<'_, ()>| {
                    match candidate {
                        CoarsenCandidate::Family { .. } => families += 1,
                        CoarsenCandidate::Orphan { .. } => orphans += 1,
                    }
                    false
                },
                &mut Hooks::new(),
            )
            .unwrap();
        (families, orphans)
    });

    // With 21, 21 and 22 octants every process holds two complete families.
    assert_eq!(results, vec![(2, 5), (2, 5), (2, 6)]);
}

#[test]
fn test_revision_stamps() {
    let connectivity = Connectivity::unit_cube();

    LocalCluster::run(2, |comm| {
        let mut forest =
            Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(1), &mut Hooks::new())
                .unwrap();
        let stamp = forest.stamp();
        assert!(stamp.ensure_current(&forest).is_ok());

        // A pass without effect keeps derived structures valid.
        forest
            .refine(false, None, |_, _, _| false, &mut Hooks::new())
            .unwrap();
        assert!(stamp.ensure_current(&forest).is_ok());

        // Only rank 0 refines, yet the revision changes everywhere.
        let rank = comm.rank();
        forest
            .refine(false, None, |_, octant, _| rank == 0 && octant.child_id() == 0, &mut Hooks::new())
            .unwrap();
        assert!(matches!(
            stamp.ensure_current(&forest),
            Err(ForestError::StaleRevision { built: 0, current: 1 })
        ));
        assert_eq!(forest.stamp().revision(), 1);
    });
}

#[test]
fn test_panicking_callback_keeps_finished_trees() {
    let connectivity = Connectivity::brick([2, 1, 1], [false; 3]);

    let results = LocalCluster::run(1, |comm| {
        let mut forest =
            Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(1), &mut Hooks::new())
                .unwrap();

        let refined = catch_unwind(AssertUnwindSafe(|| {
            forest.refine(
                false,
                None,
                |tree, _, _| {
                    assert!(tree == 0, "refusing to refine tree {}", tree);
                    true
                },
                &mut Hooks::new(),
            )
        }));
        assert!(refined.is_err());
        let after_refine = (
            forest.tree(0).unwrap().len(),
            forest.tree(1).unwrap().len(),
            forest.global_num_octants(),
            forest.is_valid().unwrap(),
        );

        let mut forest =
            Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(2), &mut Hooks::new())
                .unwrap();
        let coarsened = catch_unwind(AssertUnwindSafe(|| {
            forest.coarsen(
                false,
                false,
                |tree, _| {
                    assert!(tree == 0, "refusing to coarsen tree {}", tree);
                    true
                },
                &mut Hooks::new(),
            )
        }));
        assert!(coarsened.is_err());
        let after_coarsen = (
            forest.tree(0).unwrap().len(),
            forest.tree(1).unwrap().len(),
            forest.global_num_octants(),
            forest.is_valid().unwrap(),
        );

        (after_refine, after_coarsen)
    });

    // The first tree was rewritten, the second one kept its octants and the
    // global counts still describe the forest before the call.
    assert_eq!(results, vec![((64, 8, 16, false), (8, 64, 128, false))]);
}
