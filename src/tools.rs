//! Utility routines.

use bytemuck::Pod;
use itertools::Itertools;

use crate::{
    communicator::Communicator,
    error::{CommError, ForestError},
};

/// Decode a byte buffer of unknown alignment into a vector of `T`.
///
/// Returns `None` if the length is not a multiple of the size of `T`.
pub fn decode_pod<T: Pod>(bytes: &[u8]) -> Option<Vec<T>> {
    let size = std::mem::size_of::<T>();
    if size == 0 {
        return if bytes.is_empty() { Some(Vec::new()) } else { None };
    }
    if bytes.len() % size != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect(),
    )
}

/// Gather array to all processes, keeping the contribution of each rank separate.
pub fn gather_to_all_by_rank<T: Pod, C: Communicator>(
    arr: &[T],
    comm: &C,
) -> Result<Vec<Vec<T>>, CommError> {
    let rank = comm.rank();
    comm.all_gather(bytemuck::cast_slice(arr))?
        .iter()
        .enumerate()
        .map(|(peer, bytes)| decode_pod(bytes).ok_or(CommError::Malformed { rank, peer }))
        .collect()
}

/// Gather array to all processes
pub fn gather_to_all<T: Pod, C: Communicator>(arr: &[T], comm: &C) -> Result<Vec<T>, CommError> {
    Ok(gather_to_all_by_rank(arr, comm)?.concat())
}

/// Perform a global exclusive cumulative sum operation.
///
/// For the array `[1, 3, 5, 7]` on a single rank the output will be `[0, 1, 4, 9]`.
/// On further ranks the sums continue from the total of all previous ranks.
pub fn global_exclusive_cumsum<C: Communicator>(arr: &[u64], comm: &C) -> Result<Vec<u64>, CommError> {
    let local_total = arr.iter().sum::<u64>();
    let offset = comm.exclusive_scan(local_total)?;

    Ok(arr
        .iter()
        .scan(offset, |state, &x| {
            let current = *state;
            *state += x;
            Some(current)
        })
        .collect_vec())
}

/// Distribute a sorted sequence into bins.
///
/// For an array with n elements to be distributed into p bins,
/// the array `bins` has p elements. The bins are defined by half-open intervals
/// of the form [b_j, b_{j+1})). The final bin is the half-open interval [b_{p-1}, \infty).
/// Elements smaller than `b_0` are counted in the first bin.
/// The function returns a p element array with the counts of how many elements go to each bin.
/// Since the sequence is sorted this fully defines what element goes into which bin.
pub fn sort_to_bins<T: Ord>(sorted_keys: &[T], bins: &[T]) -> Vec<usize> {
    assert!(!bins.is_empty());

    // Number of keys before the start of each bin, found by binary search.
    let mut starts = bins
        .iter()
        .map(|bin| sorted_keys.partition_point(|key| key < bin))
        .collect_vec();
    starts[0] = 0;
    starts.push(sorted_keys.len());

    starts
        .iter()
        .tuple_windows()
        .map(|(start, end)| end.saturating_sub(*start))
        .collect()
}

/// Identifies a collective operation of the forest.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum Operation {
    /// Forest construction.
    New = 1,
    /// Refinement.
    Refine = 2,
    /// Coarsening.
    Coarsen = 3,
    /// 2:1 balance.
    Balance = 4,
    /// Repartition.
    Partition = 5,
    /// Validity check.
    IsValid = 6,
    /// Balance check.
    IsBalanced = 7,
}

impl Operation {
    fn from_code(code: u64) -> Option<Operation> {
        [
            Operation::New,
            Operation::Refine,
            Operation::Coarsen,
            Operation::Balance,
            Operation::Partition,
            Operation::IsValid,
            Operation::IsBalanced,
        ]
        .into_iter()
        .find(|op| *op as u64 == code)
    }
}

/// Check that all ranks entered the same collective operation.
///
/// This costs one all-gather and is only performed in debug builds.
pub fn check_collective<C: Communicator>(operation: Operation, comm: &C) -> Result<(), ForestError> {
    if !cfg!(debug_assertions) {
        return Ok(());
    }

    let codes = gather_to_all(&[operation as u64], comm)?;
    let expected = Operation::from_code(codes[0]).ok_or_else(|| {
        ForestError::Invariant(format!("unknown operation code {}", codes[0]))
    })?;

    if let Some((rank, &code)) = codes.iter().enumerate().find(|(_, &code)| code != codes[0]) {
        let found = Operation::from_code(code)
            .ok_or_else(|| ForestError::Invariant(format!("unknown operation code {}", code)))?;
        return Err(ForestError::CollectiveMismatch {
            rank,
            expected,
            found,
        });
    }

    Ok(())
}
