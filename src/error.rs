//! Error types.

use thiserror::Error;

use crate::{constants::MAX_LEVEL, tools::Operation};

/// Errors of the message-passing layer.
#[derive(Debug, Error)]
pub enum CommError {
    /// A peer left the process group before the exchange completed.
    #[error("rank {peer} is no longer reachable from rank {rank}")]
    Disconnected {
        /// The rank that observed the failure.
        rank: usize,
        /// The unreachable rank.
        peer: usize,
    },
    /// A message arrived that belongs to a different operation.
    #[error("rank {rank} expected a message with tag {expected} from rank {peer} but received tag {found}")]
    TagMismatch {
        /// The receiving rank.
        rank: usize,
        /// The sending rank.
        peer: usize,
        /// The tag the receiver waited for.
        expected: u16,
        /// The tag that arrived.
        found: u16,
    },
    /// A collective contribution had an unexpected length.
    #[error("rank {rank} received a malformed contribution from rank {peer}")]
    Malformed {
        /// The receiving rank.
        rank: usize,
        /// The sending rank.
        peer: usize,
    },
    /// A destination or source rank outside the group.
    #[error("rank {0} is not part of the process group")]
    InvalidRank(usize),
}

/// Errors of forest operations.
#[derive(Debug, Error)]
pub enum ForestError {
    /// A level beyond [MAX_LEVEL] was requested.
    #[error("level {0} exceeds the maximum level {max}", max = MAX_LEVEL)]
    LevelOutOfRange(u32),
    /// A tree index outside the connectivity.
    #[error("tree {tree} is out of range for a forest with {num_trees} trees")]
    TreeOutOfRange {
        /// The requested tree.
        tree: usize,
        /// Number of trees of the connectivity.
        num_trees: usize,
    },
    /// The forest has no weight to distribute.
    #[error("cannot partition a forest whose total weight is zero")]
    ZeroWeight,
    /// Processes entered different collective operations.
    #[error("rank {rank} entered {found:?} while rank 0 entered {expected:?}")]
    CollectiveMismatch {
        /// First rank that disagrees with rank 0.
        rank: usize,
        /// Operation entered by rank 0.
        expected: Operation,
        /// Operation entered by `rank`.
        found: Operation,
    },
    /// The two balance peer discovery strategies disagree.
    #[error("balance peer discovery disagrees on rank {rank}: notify found {notify:?}, ranges found {ranges:?}")]
    DiscoveryMismatch {
        /// The rank that detected the disagreement.
        rank: usize,
        /// Senders found by the notify strategy.
        notify: Vec<usize>,
        /// Senders found by the ranges strategy.
        ranges: Vec<usize>,
    },
    /// A structural invariant of the forest does not hold.
    #[error("forest invariant violated: {0}")]
    Invariant(String),
    /// A derived structure refers to an older revision of the forest.
    #[error("structure was built for revision {built} but the forest is at revision {current}")]
    StaleRevision {
        /// Revision the structure was built from.
        built: u64,
        /// Current revision of the forest.
        current: u64,
    },
    /// A received message could not be decoded.
    #[error("malformed message: {0}")]
    Codec(String),
    /// Configuration could not be parsed.
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    /// The message-passing layer failed.
    #[error(transparent)]
    Communication(#[from] CommError),
}
