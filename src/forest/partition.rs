//! Repartitioning of the forest by weight.

use std::collections::BTreeMap;
use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use itertools::Itertools;
use tracing::{debug, info};

use super::{Forest, TreeOctant};
use crate::{
    codec::{decode, encode, OctantRecord},
    communicator::{Communicator, Reduction, Tag},
    constants::NCHILDREN,
    error::ForestError,
    octant::Octant,
    tools::{check_collective, gather_to_all, global_exclusive_cumsum, sort_to_bins, Operation},
};

// Octants around a partition boundary are gathered with their global index.
const WINDOW: u64 = NCHILDREN as u64 - 1;

#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(C)]
struct WindowRecord {
    index: u64,
    octant: OctantRecord,
    _pad: u32,
}

// The overlap of two ranges. An empty result still lies inside `first`, so
// it can index a slice that covers `first`.
fn intersect(first: &Range<u64>, second: &Range<u64>) -> Range<u64> {
    let start = first.start.max(second.start).min(first.end);
    start..first.end.min(second.end).max(start)
}

/// Split points of the ideal partition of `total` weight among `size`
/// processes: `ceil(total * p / size)` for every process `p`.
pub(super) fn weight_cuts(total: u64, size: usize) -> Vec<u64> {
    let size = size as u128;
    (0..size)
        .map(|p| ((total as u128 * p).div_ceil(size)) as u64)
        .collect()
}

/// Move every interior boundary that splits a complete family to the nearer
/// end of that family, then restore monotonicity.
///
/// `octants` holds the octants around the boundaries by global index.
pub(super) fn align_to_families(boundaries: &mut [u64], octants: &BTreeMap<u64, TreeOctant>) {
    let size = boundaries.len() - 1;

    for boundary in boundaries.iter_mut().take(size).skip(1) {
        let b = *boundary;
        for start in b.saturating_sub(WINDOW)..b {
            let members = (start..start + NCHILDREN as u64)
                .map_while(|index| octants.get(&index))
                .collect_vec();
            if members.len() != NCHILDREN || members.iter().any(|m| m.tree != members[0].tree) {
                continue;
            }
            let family = members.iter().map(|m| m.octant).collect_vec();
            if Octant::is_family(&family) {
                let end = start + NCHILDREN as u64;
                *boundary = if b - start <= end - b { start } else { end };
                break;
            }
        }
    }

    for p in 1..=size {
        boundaries[p] = boundaries[p].max(boundaries[p - 1]);
    }
}

impl<C: Communicator, D: Pod> Forest<'_, C, D> {
    /// Repartition the forest so that every process holds the same number of
    /// octants. Collective.
    ///
    /// See [Forest::partition_weighted].
    pub fn partition(&mut self, for_coarsening: bool) -> Result<u64, ForestError> {
        self.partition_weighted(for_coarsening, |_, _, _| 1)
    }

    /// Repartition the forest by octant weight. Collective.
    ///
    /// Process `p` receives the octants whose exclusive weight prefix lies in
    /// `[ceil(W * p / P), ceil(W * (p + 1) / P))`, where `W` is the total
    /// weight and `P` the number of processes. With `for_coarsening`, a
    /// boundary that splits a complete family is moved to the nearer end of
    /// the family, so that the family can be coarsened afterwards.
    ///
    /// Only octants that change owner are sent, together with their data.
    /// Returns the global number of octants that changed owner. The revision
    /// is incremented if this number is positive.
    pub fn partition_weighted<W>(&mut self, for_coarsening: bool, mut weight_fn: W) -> Result<u64, ForestError>
    where
        W: FnMut(usize, &Octant, &D) -> u64,
    {
        check_collective(Operation::Partition, self.comm)?;

        let rank = self.comm.rank();
        let size = self.comm.size();

        let weights = self
            .local_octants()
            .map(|(octant, data)| weight_fn(octant.tree, &octant.octant, data))
            .collect_vec();

        let total_weight = self.global_sum(weights.iter().sum())?;
        if total_weight == 0 {
            return Err(ForestError::ZeroWeight);
        }

        // We now find for each local octant the process it should go to.
        let prefix = global_exclusive_cumsum(&weights, self.comm)?;
        let cuts = weight_cuts(total_weight, size);
        let local_counts = sort_to_bins(&prefix, &cuts)
            .into_iter()
            .map(|count| count as u64)
            .collect_vec();
        let counts = self.comm.all_reduce(&local_counts, Reduction::Sum)?;

        let old = self.global_first_indices();
        let total = old[size];

        let mut new = Vec::with_capacity(size + 1);
        new.push(0);
        for count in &counts {
            new.push(new[new.len() - 1] + count);
        }

        if for_coarsening && size > 1 {
            let local = self.local_octants().map(|(octant, _)| octant).collect_vec();
            let owned = old[rank]..old[rank + 1];

            let mut indices = new[1..size]
                .iter()
                .filter(|&&b| 0 < b && b < total)
                .flat_map(|&b| b.saturating_sub(WINDOW)..(b + WINDOW).min(total))
                .filter(|index| owned.contains(index))
                .collect_vec();
            indices.sort_unstable();
            indices.dedup();

            let records = indices
                .iter()
                .map(|&index| WindowRecord {
                    index,
                    octant: OctantRecord::from(&local[(index - owned.start) as usize]),
                    _pad: 0,
                })
                .collect_vec();

            let num_trees = self.trees.len();
            let mut window = BTreeMap::new();
            for record in gather_to_all(&records, self.comm)? {
                window.insert(record.index, record.octant.to_tree_octant(num_trees)?);
            }

            align_to_families(&mut new, &window);
            debug!(rank, boundaries = ?new, "aligned partition boundaries to families");
        }

        let unchanged = (0..size)
            .map(|r| {
                let kept = intersect(&(old[r]..old[r + 1]), &(new[r]..new[r + 1]));
                kept.end - kept.start
            })
            .sum::<u64>();
        let moved = total - unchanged;

        if moved == 0 {
            info!(rank, "partition left the forest unchanged");
            return Ok(0);
        }

        // Ship the octants that change owner.
        let (octants, data): (Vec<TreeOctant>, Vec<D>) =
            self.local_octants().map(|(octant, data)| (octant, *data)).unzip();
        let my_old = old[rank]..old[rank + 1];
        let my_new = new[rank]..new[rank + 1];
        let local_range = |range: &Range<u64>| {
            (range.start - my_old.start) as usize..(range.end - my_old.start) as usize
        };

        let sends = (0..size)
            .filter(|&r| r != rank)
            .filter_map(|r| {
                let outgoing = intersect(&my_old, &(new[r]..new[r + 1]));
                (!outgoing.is_empty()).then(|| {
                    let range = local_range(&outgoing);
                    (r, encode(&octants[range.clone()], &data[range]))
                })
            })
            .collect_vec();

        let sources = (0..size)
            .filter(|&r| r != rank && !intersect(&(old[r]..old[r + 1]), &my_new).is_empty())
            .collect_vec();

        debug!(rank, receivers = sends.len(), senders = sources.len(), "partition exchange");

        let received = self.comm.exchange(Tag::PARTITION, sends, &sources)?;

        let num_trees = self.trees.len();
        let mut pieces = Vec::with_capacity(sources.len() + 1);
        for (source, bytes) in sources.iter().zip(received) {
            let (piece_octants, piece_data) = decode::<D>(&bytes, num_trees)?;
            pieces.push((*source, piece_octants, piece_data));
        }
        let kept = local_range(&intersect(&my_old, &my_new));
        pieces.push((rank, octants[kept.clone()].to_vec(), data[kept].to_vec()));
        pieces.sort_by_key(|(source, _, _)| *source);

        let expected = my_new.end - my_new.start;
        let arrived = pieces.iter().map(|(_, octants, _)| octants.len() as u64).sum::<u64>();
        if arrived != expected {
            return Err(ForestError::Invariant(format!(
                "rank {} expected {} octants after partition but received {}",
                rank, expected, arrived
            )));
        }

        for tree in self.trees.iter_mut() {
            tree.clear();
        }
        for (_, piece_octants, piece_data) in pieces {
            for (octant, octant_data) in piece_octants.into_iter().zip(piece_data) {
                self.trees[octant.tree].push(octant.octant, octant_data);
            }
        }

        self.update_global_ranges()?;
        self.revision += 1;

        info!(
            rank,
            moved,
            local = self.local_num_octants(),
            revision = self.revision,
            "partitioned forest"
        );

        Ok(moved)
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::{align_to_families, intersect, weight_cuts};
    use crate::{forest::TreeOctant, octant::Octant};

    #[test]
    fn test_weight_cuts() {
        assert_eq!(weight_cuts(100, 4), vec![0, 25, 50, 75]);
        assert_eq!(weight_cuts(10, 4), vec![0, 3, 5, 8]);
        assert_eq!(weight_cuts(2, 4), vec![0, 1, 1, 2]);
    }

    #[test]
    fn test_intersect() {
        assert_eq!(intersect(&(0..10), &(5..20)), 5..10);
        assert_eq!(intersect(&(5..20), &(0..10)), 5..10);
        assert_eq!(intersect(&(0..5), &(7..20)), 5..5);
        assert_eq!(intersect(&(7..20), &(0..5)), 7..7);
        assert_eq!(intersect(&(3..3), &(0..10)), 3..3);
    }

    #[test]
    fn test_align_to_families() {
        // Global sequence: one level 1 octant, a family of level 2 octants
        // and the remaining six level 1 octants.
        let root = Octant::root();
        let mut octants = vec![root.child(0)];
        octants.extend(root.child(1).children());
        octants.extend((2..8).map(|id| root.child(id)));
        let window = octants
            .iter()
            .enumerate()
            .map(|(index, octant)| (index as u64, TreeOctant::new(0, *octant)))
            .collect::<BTreeMap<_, _>>();

        // The family occupies the indices 1..9.
        let mut boundaries = vec![0, 3, 6, 15];
        align_to_families(&mut boundaries, &window);
        assert_eq!(boundaries, vec![0, 1, 9, 15]);

        // A tie goes to the start of the family.
        let mut boundaries = vec![0, 5, 15];
        align_to_families(&mut boundaries, &window);
        assert_eq!(boundaries, vec![0, 1, 15]);

        // Boundaries outside of families stay.
        let mut boundaries = vec![0, 1, 10, 15];
        align_to_families(&mut boundaries, &window);
        assert_eq!(boundaries, vec![0, 1, 10, 15]);
    }
}
