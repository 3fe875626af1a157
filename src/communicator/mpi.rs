//! MPI transport.

use itertools::Itertools;
use mpi::{
    collective::SystemOperation,
    datatype::PartitionMut,
    request,
    topology::SimpleCommunicator,
    traits::{Communicator as _, CommunicatorCollectives, Destination, Source},
};

use super::{Communicator, Reduction, Tag};
use crate::error::CommError;

/// A [Communicator] backed by an MPI communicator.
pub struct MpiCommunicator {
    comm: SimpleCommunicator,
}

impl MpiCommunicator {
    /// Wrap an MPI communicator.
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }

    /// Return the wrapped MPI communicator.
    pub fn raw(&self) -> &SimpleCommunicator {
        &self.comm
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank < self.size() {
            Ok(())
        } else {
            Err(CommError::InvalidRank(rank))
        }
    }
}

/// Compute displacements from a vector of counts.
///
/// This is useful for global MPI varcount operations. Let
/// count [ 3, 4, 5]. Then the corresponding displacements are
// [0, 3, 7]. Note that the last element `5` is ignored.
fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

impl Communicator for MpiCommunicator {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn exchange(
        &self,
        tag: Tag,
        sends: Vec<(usize, Vec<u8>)>,
        sources: &[usize],
    ) -> Result<Vec<Vec<u8>>, CommError> {
        for &(destination, _) in &sends {
            self.check_rank(destination)?;
        }
        for &source in sources {
            self.check_rank(source)?;
        }

        let tag = tag.0 as i32;

        let received = request::scope(|scope| {
            // Post all sends first so that every process can receive afterwards.
            let requests = sends
                .iter()
                .map(|(destination, payload)| {
                    self.comm
                        .process_at_rank(*destination as i32)
                        .immediate_send_with_tag(scope, &payload[..], tag)
                })
                .collect_vec();

            let received = sources
                .iter()
                .map(|&source| {
                    self.comm
                        .process_at_rank(source as i32)
                        .receive_vec_with_tag::<u8>(tag)
                        .0
                })
                .collect_vec();

            for request in requests {
                request.wait();
            }

            received
        });

        Ok(received)
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        // First we need to broadcast the individual sizes on each process.
        let local_len = local.len() as i32;
        let mut counts = vec![0i32; self.size()];
        self.comm.all_gather_into(&local_len, &mut counts[..]);

        let displs = displacements(&counts);
        let total = counts.iter().sum::<i32>() as usize;
        let mut buffer = vec![0u8; total];

        {
            let mut partition = PartitionMut::new(&mut buffer[..], &counts[..], &displs[..]);
            self.comm.all_gather_varcount_into(local, &mut partition);
        }

        Ok(counts
            .iter()
            .zip(displs.iter())
            .map(|(&count, &displ)| buffer[displ as usize..(displ + count) as usize].to_vec())
            .collect())
    }

    fn all_reduce(&self, values: &[u64], op: Reduction) -> Result<Vec<u64>, CommError> {
        let mut result = vec![0u64; values.len()];
        let operation = match op {
            Reduction::Sum => SystemOperation::sum(),
            Reduction::Max => SystemOperation::max(),
            Reduction::Min => SystemOperation::min(),
        };
        self.comm.all_reduce_into(values, &mut result[..], operation);
        Ok(result)
    }

    fn exclusive_scan(&self, value: u64) -> Result<u64, CommError> {
        let mut result = 0u64;
        self.comm
            .exclusive_scan_into(&value, &mut result, SystemOperation::sum());

        // The receive buffer of the first rank is undefined after an exclusive scan.
        if self.rank() == 0 {
            result = 0;
        }

        Ok(result)
    }
}
