//! 2:1 balance across process boundaries.

use bempp_forest::{
    constants::{MAX_LEVEL, ROOT_LEN},
    BalanceConfig, BalanceKind, Communicator, Connectivity, CreateOptions, Discovery, Forest,
    ForestError, Hooks, LocalCluster, Octant, TreeOctant,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

// Finest cells around which the forest is refined.
fn random_targets(num_trees: usize, count: usize) -> Vec<(usize, Octant)> {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    (0..count)
        .map(|_| {
            let tree = rng.gen_range(0..num_trees);
            let coordinates = [(); 3].map(|_| rng.gen_range(0..ROOT_LEN));
            (tree, Octant::new(coordinates, MAX_LEVEL))
        })
        .collect()
}

// Refine towards the targets, balance and return the leaves of all processes
// in global order.
fn balanced_leaves(
    size: usize,
    connectivity: &Connectivity,
    targets: &[(usize, Octant)],
    kind: BalanceKind,
    config: BalanceConfig,
) -> Vec<TreeOctant> {
    LocalCluster::run(size, |comm| {
        let mut forest =
            Forest::<_>::new(&comm, connectivity, &CreateOptions::uniform(1), &mut Hooks::new())
                .unwrap();
        forest.set_balance_config(config.clone());

        forest
            .refine(
                true,
                Some(6),
                |tree, octant, _| {
                    targets
                        .iter()
                        .any(|(target_tree, cell)| *target_tree == tree && octant.contains(cell))
                },
                &mut Hooks::new(),
            )
            .unwrap();

        forest.balance(kind, &mut Hooks::new()).unwrap();

        assert!(forest.is_valid().unwrap());
        assert!(forest.is_balanced(kind).unwrap());

        forest.local_octants().map(|(octant, _)| octant).collect::<Vec<_>>()
    })
    .concat()
}

#[test]
fn test_face_balance_next_to_a_coarse_octant() {
    let connectivity = Connectivity::unit_cube();
    let target = Octant::root().child(0).last_descendant(5);
    let (_, across) = connectivity.neighbour(0, &target, [1, 0, 0]).unwrap();

    for size in [1, 3] {
        let results = LocalCluster::run(size, |comm| {
            let mut hooks = Hooks::new().with_init(|_, octant: &Octant, data: &mut u8| {
                *data = octant.level();
            });
            let mut forest =
                Forest::new(&comm, &connectivity, &CreateOptions::uniform(1), &mut hooks).unwrap();

            let refined = forest
                .refine(true, Some(5), |_, octant, _| octant.contains(&target), &mut hooks)
                .unwrap();
            assert_eq!(refined, 4);
            assert!(!forest.is_balanced(BalanceKind::Face).unwrap());

            let report = forest.balance(BalanceKind::Face, &mut hooks).unwrap();
            assert!(forest.is_balanced(BalanceKind::Face).unwrap());
            assert!(forest.is_valid().unwrap());
            assert!(forest.local_octants().all(|(octant, data)| *data == octant.octant.level()));

            let tree = forest.tree(0).unwrap();
            let level = tree
                .find_containing(&across)
                .map(|index| tree.octants()[index].level());
            (level, report)
        });

        // Exactly one process holds the leaf across the face of the level 5
        // octant, and it is one level coarser.
        let levels = results
            .iter()
            .filter_map(|(level, _)| *level)
            .collect::<Vec<_>>();
        assert_eq!(levels, vec![4]);

        for (_, report) in &results {
            assert!(report.global_refinements > 0);
            assert!(report.rounds >= 1);
            if size == 1 {
                assert_eq!(report.octants_sent, 0);
                assert_eq!(report.peers, 0);
            }
        }
    }
}

#[test]
fn test_balance_is_idempotent() {
    let connectivity = Connectivity::brick([2, 1, 1], [false; 3]);
    let target = Octant::root().child(1).last_descendant(6);

    let results = LocalCluster::run(2, |comm| {
        let mut forest =
            Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(1), &mut Hooks::new())
                .unwrap();
        forest
            .refine(
                true,
                None,
                |tree, octant, _| tree == 0 && octant.level() < 6 && octant.contains(&target),
                &mut Hooks::new(),
            )
            .unwrap();

        let first = forest.balance(BalanceKind::Full, &mut Hooks::new()).unwrap();
        let revision = forest.revision();
        let octants = forest.global_num_octants();

        let second = forest.balance(BalanceKind::Full, &mut Hooks::new()).unwrap();

        assert_eq!(forest.revision(), revision);
        assert_eq!(forest.global_num_octants(), octants);
        (first, second)
    });

    for (first, second) in results {
        assert!(first.global_refinements > 0);
        assert_eq!(second.global_refinements, 0);
        assert_eq!(second.local_refinements, 0);
        assert_eq!(second.rounds, 1);
    }
}

#[test]
fn test_distributed_balance_matches_serial() {
    let connectivity = Connectivity::brick([2, 1, 1], [true, false, false]);
    let targets = random_targets(connectivity.num_trees(), 6);

    let serial = balanced_leaves(
        1,
        &connectivity,
        &targets,
        BalanceKind::Full,
        BalanceConfig::default(),
    );

    for size in [2, 3, 4] {
        let distributed = balanced_leaves(
            size,
            &connectivity,
            &targets,
            BalanceKind::Full,
            BalanceConfig::default(),
        );
        assert_eq!(distributed, serial, "{} processes", size);
    }
}

#[test]
fn test_discovery_strategies_agree() {
    let connectivity = Connectivity::brick([2, 2, 1], [false; 3]);
    let targets = random_targets(connectivity.num_trees(), 8);

    let by_notify = balanced_leaves(
        4,
        &connectivity,
        &targets,
        BalanceKind::Edge,
        BalanceConfig::default(),
    );

    let by_ranges = balanced_leaves(
        4,
        &connectivity,
        &targets,
        BalanceKind::Edge,
        BalanceConfig {
            discovery: Discovery::Ranges,
            verify: true,
            max_ranges: 1,
        },
    );

    assert_eq!(by_notify, by_ranges);
}

#[test]
fn test_balance_subtree() {
    let connectivity = Connectivity::brick([2, 1, 1], [false; 3]);
    let comm = LocalCluster::communicators(1).pop().unwrap();
    let target = Octant::root().child(1).last_descendant(5);

    let mut forest =
        Forest::<_>::new(&comm, &connectivity, &CreateOptions::default(), &mut Hooks::new()).unwrap();
    forest
        .refine(true, Some(5), |tree, octant, _| tree == 0 && octant.contains(&target), &mut Hooks::new())
        .unwrap();

    let refined = forest
        .balance_subtree(0, BalanceKind::Face, &mut Hooks::new())
        .unwrap();
    assert!(refined > 0);
    assert_eq!(forest.tree(1).unwrap().len(), 1);

    // The local rewrite is not visible in the global counts yet.
    assert_ne!(forest.global_num_octants(), forest.local_num_octants() as u64);
    forest.update_counts().unwrap();
    assert_eq!(forest.global_num_octants(), forest.local_num_octants() as u64);

    // The second tree still has to adapt to the first one.
    assert!(!forest.is_balanced(BalanceKind::Face).unwrap());
    let report = forest.balance(BalanceKind::Face, &mut Hooks::new()).unwrap();
    assert!(report.local_refinements > 0);
    assert!(forest.tree(1).unwrap().len() > 1);
    assert!(forest.is_balanced(BalanceKind::Face).unwrap());

    assert!(matches!(
        forest.balance_subtree(2, BalanceKind::Face, &mut Hooks::new()),
        Err(ForestError::TreeOutOfRange { tree: 2, num_trees: 2 })
    ));
    assert_eq!(comm.rank(), 0);
}
