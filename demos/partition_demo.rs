//! Refine a forest around a few points, balance it and distribute the work.

use bempp_forest::{
    constants::{MAX_LEVEL, ROOT_LEN},
    BalanceKind, Communicator, Connectivity, CreateOptions, Forest, Hooks, LocalCluster, Octant,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

pub fn main() {
    // Number of simulated processes.
    let size = 4;

    // A brick of 2 x 2 x 1 trees.
    let connectivity = Connectivity::brick([2, 2, 1], [false; 3]);

    // Generate random points, the same on every process.
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let points = (0..10)
        .map(|_| {
            let tree = rng.gen_range(0..connectivity.num_trees());
            let coordinates = [(); 3].map(|_| rng.gen_range(0..ROOT_LEN));
            (tree, Octant::new(coordinates, MAX_LEVEL))
        })
        .collect::<Vec<_>>();

    let summaries = LocalCluster::run(size, |comm| {
        let mut hooks = Hooks::new();

        let mut forest =
            Forest::<_>::new(&comm, &connectivity, &CreateOptions::uniform(1), &mut hooks).unwrap();

        // Refine towards the points.
        let refined = forest
            .refine(
                true,
                Some(7),
                |tree, octant, _| {
                    points
                        .iter()
                        .any(|(point_tree, point)| *point_tree == tree && octant.contains(point))
                },
                &mut hooks,
            )
            .unwrap();

        let report = forest.balance(BalanceKind::Full, &mut hooks).unwrap();
        let before = forest.local_num_octants();

        // Make octants close to a point more expensive.
        let moved = forest
            .partition_weighted(false, |_, octant, _| 1 + octant.level() as u64)
            .unwrap();

        assert!(forest.is_valid().unwrap());
        assert!(forest.is_balanced(BalanceKind::Full).unwrap());

        if comm.rank() == 0 {
            println!(
                "Refined {} octants, balance refined {} more in {} rounds.",
                refined, report.global_refinements, report.rounds
            );
            println!(
                "Partition moved {} of {} octants.",
                moved,
                forest.global_num_octants()
            );
        }

        (before, forest.local_num_octants())
    });

    for (rank, (before, after)) in summaries.iter().enumerate() {
        println!("Rank {}: {} octants before partition, {} after.", rank, before, after);
    }
}
