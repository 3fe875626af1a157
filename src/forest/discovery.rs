//! Discovery of the processes that send balance messages.
//!
//! Every process knows which processes it sends to, but not which processes
//! send to it. Two strategies recover the senders:
//!
//! - notify: every process advertises its exact receiver list.
//! - ranges: every process advertises at most `max_ranges` rank intervals
//!   covering its receivers and sends a possibly empty message to every rank
//!   in them.
//!
//! Both are collective.

use std::collections::BTreeSet;

use itertools::Itertools;
use tracing::trace;

use crate::{
    communicator::{Communicator, Reduction},
    config::{BalanceConfig, Discovery},
    error::ForestError,
    tools::gather_to_all_by_rank,
};

/// Whom to send to and whom to receive from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Routes {
    pub(super) receivers: Vec<usize>,
    pub(super) senders: Vec<usize>,
}

/// Find the senders from the exact receiver lists of all processes.
pub(super) fn notify<C: Communicator>(receivers: &[usize], comm: &C) -> Result<Routes, ForestError> {
    let rank = comm.rank();
    let local = receivers.iter().map(|&r| r as u64).collect_vec();

    let senders = gather_to_all_by_rank(&local, comm)?
        .iter()
        .enumerate()
        .filter(|(sender, list)| *sender != rank && list.contains(&(rank as u64)))
        .map(|(sender, _)| sender)
        .collect();

    Ok(Routes {
        receivers: receivers.to_vec(),
        senders,
    })
}

/// Cover sorted, distinct `receivers` with at most `max_ranges` inclusive
/// intervals, merging across the smallest gaps first.
pub(super) fn compress_ranges(receivers: &[usize], max_ranges: usize) -> Vec<[usize; 2]> {
    let mut ranges = Vec::<[usize; 2]>::new();
    for &receiver in receivers {
        match ranges.last_mut() {
            Some(last) if last[1] + 1 == receiver => last[1] = receiver,
            _ => ranges.push([receiver, receiver]),
        }
    }

    while ranges.len() > max_ranges.max(1) {
        let Some((index, _)) = ranges
            .iter()
            .tuple_windows()
            .enumerate()
            .min_by_key(|(_, (left, right))| right[0] - left[1])
        else {
            break;
        };
        ranges[index][1] = ranges[index + 1][1];
        ranges.remove(index + 1);
    }

    ranges
}

/// Find the senders from the receiver intervals of all processes.
///
/// The returned receivers include every rank of the own intervals.
pub(super) fn ranges<C: Communicator>(
    receivers: &[usize],
    max_ranges: usize,
    comm: &C,
) -> Result<Routes, ForestError> {
    let rank = comm.rank();
    let local_ranges = compress_ranges(receivers, max_ranges);
    let flat = local_ranges
        .iter()
        .flat_map(|range| range.map(|r| r as u64))
        .collect_vec();

    let senders = gather_to_all_by_rank(&flat, comm)?
        .iter()
        .enumerate()
        .filter(|(sender, bounds)| {
            *sender != rank
                && bounds
                    .chunks_exact(2)
                    .any(|bound| bound[0] <= rank as u64 && rank as u64 <= bound[1])
        })
        .map(|(sender, _)| sender)
        .collect();

    let receivers = local_ranges
        .iter()
        .flat_map(|range| range[0]..=range[1])
        .filter(|&r| r != rank)
        .collect();

    Ok(Routes { receivers, senders })
}

/// Find the routes with the configured strategy.
///
/// With `verify` both strategies run. The call fails on every process if on
/// any process the notify senders are not contained in the ranges senders.
pub(super) fn discover<C: Communicator>(
    receivers: &[usize],
    config: &BalanceConfig,
    comm: &C,
) -> Result<Routes, ForestError> {
    let use_notify = config.verify || config.discovery == Discovery::Notify;
    let use_ranges = config.verify || config.discovery == Discovery::Ranges;

    let by_notify = if use_notify {
        Some(notify(receivers, comm)?)
    } else {
        None
    };
    let by_ranges = if use_ranges {
        Some(ranges(receivers, config.max_ranges, comm)?)
    } else {
        None
    };

    if config.verify {
        if let (Some(by_notify), Some(by_ranges)) = (&by_notify, &by_ranges) {
            let notify_senders = by_notify.senders.iter().collect::<BTreeSet<_>>();
            let ranges_senders = by_ranges.senders.iter().collect::<BTreeSet<_>>();
            let mismatch = u64::from(!notify_senders.is_subset(&ranges_senders));

            if comm.all_reduce(&[mismatch], Reduction::Max)?[0] != 0 {
                return Err(ForestError::DiscoveryMismatch {
                    rank: comm.rank(),
                    notify: by_notify.senders.clone(),
                    ranges: by_ranges.senders.clone(),
                });
            }
        }
    }

    let routes = match config.discovery {
        Discovery::Notify => by_notify,
        Discovery::Ranges => by_ranges,
    }
    .ok_or_else(|| ForestError::Invariant("no discovery strategy ran".to_string()))?;

    trace!(
        rank = comm.rank(),
        receivers = ?routes.receivers,
        senders = ?routes.senders,
        "balance peers"
    );

    Ok(routes)
}

#[cfg(test)]
mod test {
    use super::{compress_ranges, discover, notify, ranges};
    use crate::{
        communicator::{Communicator, LocalCluster},
        config::{BalanceConfig, Discovery},
    };

    #[test]
    fn test_compress_ranges() {
        assert_eq!(compress_ranges(&[], 3), Vec::<[usize; 2]>::new());
        assert_eq!(
            compress_ranges(&[1, 2, 3, 7, 9, 20], 10),
            vec![[1, 3], [7, 7], [9, 9], [20, 20]]
        );
        assert_eq!(
            compress_ranges(&[1, 2, 3, 7, 9, 20], 2),
            vec![[1, 9], [20, 20]]
        );
        assert_eq!(compress_ranges(&[0, 5, 9], 1), vec![[0, 9]]);
    }

    // Every rank sends to the ranks two and three steps ahead.
    fn receivers(rank: usize, size: usize) -> Vec<usize> {
        let mut receivers = vec![(rank + 2) % size, (rank + 3) % size];
        receivers.sort_unstable();
        receivers
    }

    #[test]
    fn test_notify_finds_exact_senders() {
        let results = LocalCluster::run(5, |comm| {
            notify(&receivers(comm.rank(), comm.size()), &comm).unwrap()
        });

        for (rank, routes) in results.into_iter().enumerate() {
            let mut expected = vec![(rank + 3) % 5, (rank + 2) % 5];
            expected.sort_unstable();
            assert_eq!(routes.senders, expected);
        }
    }

    #[test]
    fn test_ranges_cover_notify() {
        let results = LocalCluster::run(5, |comm| {
            let receivers = receivers(comm.rank(), comm.size());
            (
                notify(&receivers, &comm).unwrap(),
                ranges(&receivers, 1, &comm).unwrap(),
            )
        });

        for (rank, (by_notify, by_ranges)) in results.into_iter().enumerate() {
            assert!(by_notify
                .senders
                .iter()
                .all(|sender| by_ranges.senders.contains(sender)));
            assert!(!by_ranges.receivers.contains(&rank));
        }
    }

    #[test]
    fn test_discover_with_verification() {
        let results = LocalCluster::run(4, |comm| {
            let config = BalanceConfig {
                discovery: Discovery::Ranges,
                verify: true,
                max_ranges: 1,
            };
            discover(&receivers(comm.rank(), comm.size()), &config, &comm).unwrap()
        });

        // A single interval from the smallest to the largest receiver.
        assert_eq!(results[0].receivers, vec![2, 3]);
        assert_eq!(results[2].receivers, vec![0, 1]);
        assert_eq!(results[2].senders, vec![0, 1, 3]);
    }
}
