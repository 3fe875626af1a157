//! A distributed forest of adaptive octrees
//!
//! The forest is refined, coarsened, 2:1 balanced and repartitioned by
//! collective operations over a [Communicator]. [LocalCluster] runs a
//! process group inside one program.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod codec;
pub mod communicator;
pub mod config;
pub mod connectivity;
pub mod constants;
pub mod error;
pub mod forest;
pub mod morton;
pub mod octant;
pub mod tools;
pub mod wide_index;

pub use communicator::{Communicator, LocalCluster, LocalCommunicator};
#[cfg(feature = "mpi")]
pub use communicator::MpiCommunicator;
pub use config::{BalanceConfig, CreateOptions, Discovery, ForestConfig};
pub use connectivity::Connectivity;
pub use error::{CommError, ForestError};
pub use forest::{
    BalanceKind, BalanceReport, CoarsenCandidate, Forest, Hooks, LocalTree, Replacement,
    RevisionStamp, TreeOctant,
};
pub use octant::Octant;
pub use wide_index::WideIndex;
