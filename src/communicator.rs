//! Message passing between the processes of a forest.
//!
//! The forest algorithms only need a small set of capabilities: a sparse
//! point-to-point exchange and a few collectives. The collectives have default
//! implementations on top of the exchange, so a transport only has to provide
//! [Communicator::exchange]. Native collectives can be supplied by overriding
//! the provided methods, as the MPI transport does.
//!
//! Every method is collective over the processes taking part in it. All
//! processes of a group must call the collectives in the same order.

mod local;
#[cfg(feature = "mpi")]
mod mpi;

pub use local::{LocalCluster, LocalCommunicator};
#[cfg(feature = "mpi")]
pub use self::mpi::MpiCommunicator;

use itertools::Itertools;

use crate::{error::CommError, tools::decode_pod};

/// Tag distinguishing the messages of different operations.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Tag(pub u16);

impl Tag {
    /// Messages of the generic all-gather.
    pub const GATHER: Tag = Tag(1);
    /// Boundary octants exchanged during balance.
    pub const BALANCE: Tag = Tag(2);
    /// Octants and user data shipped by partition.
    pub const PARTITION: Tag = Tag(3);
}

/// Reduction operations for [Communicator::all_reduce].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Reduction {
    /// Elementwise sum.
    Sum,
    /// Elementwise maximum.
    Max,
    /// Elementwise minimum.
    Min,
}

impl Reduction {
    fn apply(&self, a: u64, b: u64) -> u64 {
        match self {
            Reduction::Sum => a + b,
            Reduction::Max => a.max(b),
            Reduction::Min => a.min(b),
        }
    }
}

/// The message-passing capabilities needed by a forest.
pub trait Communicator {
    /// Rank of the calling process.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Send each payload in `sends` to its destination and receive one
    /// message from each rank in `sources`.
    ///
    /// All sends are posted before any receive, so every process may send
    /// and receive in the same call. Received payloads are returned in the
    /// order of `sources`. Sending to the own rank is allowed.
    fn exchange(
        &self,
        tag: Tag,
        sends: Vec<(usize, Vec<u8>)>,
        sources: &[usize],
    ) -> Result<Vec<Vec<u8>>, CommError>;

    /// Gather a byte buffer from every process, ordered by rank.
    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        let size = self.size();
        let sends = (0..size).map(|rank| (rank, local.to_vec())).collect_vec();
        let sources = (0..size).collect_vec();
        self.exchange(Tag::GATHER, sends, &sources)
    }

    /// Elementwise reduction of `values` over all processes.
    ///
    /// Every process must contribute the same number of values.
    fn all_reduce(&self, values: &[u64], op: Reduction) -> Result<Vec<u64>, CommError> {
        let rank = self.rank();
        let gathered = self.all_gather(bytemuck::cast_slice(values))?;

        let mut result = values.to_vec();
        for (peer, bytes) in gathered.iter().enumerate() {
            if peer == rank {
                continue;
            }
            let contribution: Vec<u64> = decode_pod(bytes)
                .filter(|contribution: &Vec<u64>| contribution.len() == values.len())
                .ok_or(CommError::Malformed { rank, peer })?;
            for (r, c) in result.iter_mut().zip(contribution) {
                *r = op.apply(*r, c);
            }
        }

        Ok(result)
    }

    /// Sum of `value` over all processes with a smaller rank.
    fn exclusive_scan(&self, value: u64) -> Result<u64, CommError> {
        let rank = self.rank();
        let gathered = self.all_gather(bytemuck::bytes_of(&value))?;

        let mut sum = 0;
        for (peer, bytes) in gathered.iter().enumerate().take(rank) {
            let contribution: Vec<u64> = decode_pod(bytes)
                .filter(|contribution: &Vec<u64>| contribution.len() == 1)
                .ok_or(CommError::Malformed { rank, peer })?;
            sum += contribution[0];
        }

        Ok(sum)
    }
}
