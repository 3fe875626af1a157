//! 2:1 balance of the forest.
//!
//! After balancing, no two neighbouring leaves differ by more than one level.
//! Which leaves count as neighbours is selected by a [BalanceKind].
//!
//! The algorithm only ever refines. A leaf must be refined if it contains the
//! same-size neighbour of an octant that is more than one level finer. Local
//! completion applies this rule to the local leaves until nothing changes.
//! Across processes, every octant is sent to the owner of each of its
//! neighbour regions, which applies the same rule. Octants created in one
//! round are sent in the next one until no process refines anymore.

use std::collections::{BTreeMap, BTreeSet};

use bytemuck::Pod;
use itertools::Itertools;
use tracing::{debug, info};

use super::{
    discovery::discover, refine::split, tree::find_containing, Forest, Hooks, LocalTree, TreeOctant,
};
use crate::{
    codec::{decode, encode, OctantRecord},
    communicator::{Communicator, Reduction, Tag},
    connectivity::Connectivity,
    constants::{CORNER_OFFSETS, EDGE_OFFSETS, FACE_OFFSETS, NCHILDREN},
    error::ForestError,
    octant::Octant,
    tools::{check_collective, gather_to_all, Operation},
};

/// Adjacency classes for 2:1 balance.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BalanceKind {
    /// Octants sharing a face.
    Face,
    /// Octants sharing a face or an edge.
    Edge,
    /// Octants sharing a face, an edge or a corner.
    Full,
}

impl BalanceKind {
    /// The neighbour directions of the adjacency class.
    pub fn offsets(&self) -> Vec<[i32; 3]> {
        let mut offsets = FACE_OFFSETS.to_vec();
        if matches!(self, BalanceKind::Edge | BalanceKind::Full) {
            offsets.extend_from_slice(&EDGE_OFFSETS);
        }
        if matches!(self, BalanceKind::Full) {
            offsets.extend_from_slice(&CORNER_OFFSETS);
        }
        offsets
    }
}

/// Statistics of a balance call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BalanceReport {
    /// Number of exchange rounds.
    pub rounds: usize,
    /// Octants refined on this process.
    pub local_refinements: u64,
    /// Octants refined on all processes.
    pub global_refinements: u64,
    /// Octants sent by this process.
    pub octants_sent: u64,
    /// Octants received by this process.
    pub octants_received: u64,
    /// Number of processes this process exchanged octants with.
    pub peers: usize,
}

/// Leaves that contain a same-size neighbour of `source` and are more than
/// one level coarser, as pairs of tree and leaf index.
///
/// Trees for which `leaves` holds no entry are skipped.
fn too_coarse_neighbours(
    connectivity: &Connectivity,
    offsets: &[[i32; 3]],
    source: &TreeOctant,
    leaves: &[Option<&[Octant]>],
) -> Vec<(usize, usize)> {
    let level = source.octant.level();
    if level < 2 {
        return Vec::new();
    }

    offsets
        .iter()
        .filter_map(|&offset| connectivity.neighbour(source.tree, &source.octant, offset))
        .filter_map(|(tree, neighbour)| {
            let tree_leaves = leaves[tree]?;
            let index = find_containing(tree_leaves, &neighbour)?;
            (tree_leaves[index].level() < level - 1).then_some((tree, index))
        })
        .collect()
}

/// Refine local leaves until no leaf is too coarse for any octant in `work`
/// or any octant created on the way.
///
/// `work` holds octants together with a flag telling whether they are
/// external. External octants impose the rule without being local leaves.
/// With `only_tree` set, all other trees are ignored. Returns the created
/// octants that are leaves at the end and the number of refinements.
fn complete<D: Pod>(
    trees: &mut [LocalTree<D>],
    connectivity: &Connectivity,
    offsets: &[[i32; 3]],
    only_tree: Option<usize>,
    mut work: Vec<(TreeOctant, bool)>,
    hooks: &mut Hooks<'_, D>,
) -> (Vec<TreeOctant>, u64) {
    let mut created = Vec::new();
    let mut refinements = 0;

    loop {
        let leaves = trees
            .iter()
            .enumerate()
            .map(|(tree, local)| only_tree.map_or(true, |only| only == tree).then(|| local.octants()))
            .collect_vec();

        // Sources that marked a leaf are checked again after the refinement,
        // all others stay satisfied since leaves only get finer.
        let mut marks = vec![BTreeSet::<usize>::new(); trees.len()];
        let mut next_work = Vec::new();
        for &(source, external) in &work {
            if !external && leaves[source.tree].map_or(true, |l| l.binary_search(&source.octant).is_err()) {
                continue;
            }
            let violations = too_coarse_neighbours(connectivity, offsets, &source, &leaves);
            if !violations.is_empty() {
                next_work.push((source, external));
            }
            for (tree, index) in violations {
                marks[tree].insert(index);
            }
        }

        if marks.iter().all(BTreeSet::is_empty) {
            break;
        }

        for (tree_index, tree_marks) in marks.into_iter().enumerate() {
            if tree_marks.is_empty() {
                continue;
            }

            let tree = &trees[tree_index];
            let mut octants = Vec::with_capacity(tree.len() + 7 * tree_marks.len());
            let mut data = Vec::with_capacity(octants.capacity());
            for (index, (octant, octant_data)) in tree.iter().enumerate() {
                if !tree_marks.contains(&index) {
                    octants.push(*octant);
                    data.push(*octant_data);
                    continue;
                }

                let (children, child_data) = split(tree_index, octant, octant_data, hooks);
                for child in children {
                    let child = TreeOctant::new(tree_index, child);
                    created.push(child);
                    next_work.push((child, false));
                }
                octants.extend_from_slice(&children);
                data.extend_from_slice(&child_data);
                refinements += 1;
            }

            trees[tree_index].replace_all(octants, data);
        }

        work = next_work;
    }

    created.retain(|octant| trees[octant.tree].find(&octant.octant).is_some());
    (created, refinements)
}

impl<C: Communicator, D: Pod> Forest<'_, C, D> {
    /// Enforce 2:1 balance between `kind` neighbours. Collective.
    ///
    /// New octants are created through the same hooks as in
    /// [Forest::refine]. Peer discovery follows the balance configuration of
    /// the forest. Balancing a balanced forest changes nothing, in
    /// particular the revision stays the same.
    pub fn balance(
        &mut self,
        kind: BalanceKind,
        hooks: &mut Hooks<'_, D>,
    ) -> Result<BalanceReport, ForestError> {
        check_collective(Operation::Balance, self.comm)?;

        let rank = self.comm.rank();
        let num_trees = self.trees.len();
        let offsets = kind.offsets();
        let mut report = BalanceReport::default();
        let mut peers = BTreeSet::new();

        let work = self.local_octants().map(|(octant, _)| (octant, false)).collect_vec();
        let (_, refinements) = complete(&mut self.trees, self.connectivity, &offsets, None, work, hooks);
        report.local_refinements += refinements;

        // The first round ships every local octant, later rounds only the
        // octants created in the previous round.
        let mut outgoing = self.local_octants().map(|(octant, _)| octant).collect_vec();

        loop {
            let mut messages = BTreeMap::<usize, Vec<TreeOctant>>::new();
            for source in &outgoing {
                if source.octant.level() < 2 {
                    continue;
                }
                for &offset in &offsets {
                    let Some((tree, neighbour)) =
                        self.connectivity.neighbour(source.tree, &source.octant, offset)
                    else {
                        continue;
                    };
                    if let Some(owner) = self.region_owner(&TreeOctant::new(tree, neighbour)) {
                        if owner != rank {
                            messages.entry(owner).or_default().push(*source);
                        }
                    }
                }
            }
            for list in messages.values_mut() {
                list.dedup();
            }

            let receivers = messages.keys().copied().collect_vec();
            let routes = discover(&receivers, &self.balance_config, self.comm)?;

            let sends = routes
                .receivers
                .iter()
                .map(|receiver| {
                    let octants = messages.get(receiver).map_or(&[][..], Vec::as_slice);
                    report.octants_sent += octants.len() as u64;
                    (*receiver, encode(octants, &vec![(); octants.len()]))
                })
                .collect_vec();
            peers.extend(receivers.iter().copied());

            let received = self.comm.exchange(Tag::BALANCE, sends, &routes.senders)?;

            let mut incoming = Vec::new();
            for (sender, bytes) in routes.senders.iter().zip(received) {
                let (octants, _) = decode::<()>(&bytes, num_trees)?;
                if !octants.is_empty() {
                    peers.insert(*sender);
                }
                incoming.extend(octants.into_iter().map(|octant| (octant, true)));
            }
            report.octants_received += incoming.len() as u64;

            let (created, refinements) =
                complete(&mut self.trees, self.connectivity, &offsets, None, incoming, hooks);
            report.local_refinements += refinements;
            report.rounds += 1;

            debug!(
                rank,
                round = report.rounds,
                sent = messages.values().map(Vec::len).sum::<usize>(),
                refinements,
                "balance round"
            );

            let did_work = u64::from(refinements > 0);
            if self.comm.all_reduce(&[did_work], Reduction::Max)?[0] == 0 {
                break;
            }
            outgoing = created;
        }

        report.peers = peers.len();

        let before = self.global_num_octants();
        let after = self.update_counts()?;
        report.global_refinements = (after - before) / (NCHILDREN as u64 - 1);

        info!(
            rank,
            ?kind,
            rounds = report.rounds,
            global_refinements = report.global_refinements,
            global = after,
            revision = self.revision,
            "balanced forest"
        );

        Ok(report)
    }

    /// Balance the local part of one tree, ignoring all other trees and
    /// processes.
    ///
    /// Not collective. The global octant counts are not updated; call
    /// [Forest::update_counts] on all processes afterwards. Returns the number
    /// of refined octants.
    pub fn balance_subtree(
        &mut self,
        tree: usize,
        kind: BalanceKind,
        hooks: &mut Hooks<'_, D>,
    ) -> Result<u64, ForestError> {
        let local = self.tree(tree)?;
        let work = local
            .octants()
            .iter()
            .map(|octant| (TreeOctant::new(tree, *octant), false))
            .collect_vec();

        let (_, refinements) = complete(
            &mut self.trees,
            self.connectivity,
            &kind.offsets(),
            Some(tree),
            work,
            hooks,
        );

        debug!(rank = self.comm.rank(), tree, refinements, "balanced subtree");

        Ok(refinements)
    }

    /// Check 2:1 balance of the whole forest. Collective.
    ///
    /// All octants are gathered on every process, so this is meant for
    /// testing.
    pub fn is_balanced(&self, kind: BalanceKind) -> Result<bool, ForestError> {
        check_collective(Operation::IsBalanced, self.comm)?;

        let num_trees = self.trees.len();
        let local = self
            .local_octants()
            .map(|(octant, _)| OctantRecord::from(&octant))
            .collect_vec();

        let mut global = vec![Vec::new(); num_trees];
        for record in gather_to_all(&local, self.comm)? {
            let octant = record.to_tree_octant(num_trees)?;
            global[octant.tree].push(octant.octant);
        }

        let leaves = global.iter().map(|tree| Some(tree.as_slice())).collect_vec();
        let offsets = kind.offsets();

        Ok(global.iter().enumerate().all(|(tree, octants)| {
            octants.iter().all(|octant| {
                too_coarse_neighbours(
                    self.connectivity,
                    &offsets,
                    &TreeOctant::new(tree, *octant),
                    &leaves,
                )
                .is_empty()
            })
        }))
    }
}
