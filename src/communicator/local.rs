//! An in-process process group with one thread per rank.
//!
//! Used to run collective forest operations deterministically inside a single
//! program, in particular in tests.

use crossbeam_channel::{unbounded, Receiver, Sender};
use itertools::Itertools;

use super::{Communicator, Tag};
use crate::error::CommError;

struct Envelope {
    tag: Tag,
    payload: Vec<u8>,
}

/// The communicator of one rank of a [LocalCluster].
pub struct LocalCommunicator {
    rank: usize,
    // Indexed by destination rank.
    outboxes: Vec<Sender<Envelope>>,
    // Indexed by source rank.
    inboxes: Vec<Receiver<Envelope>>,
}

/// Factory for in-process process groups.
pub struct LocalCluster;

impl LocalCluster {
    /// Create the communicators of a group of `size` ranks.
    ///
    /// Each communicator is meant to be moved to its own thread.
    pub fn communicators(size: usize) -> Vec<LocalCommunicator> {
        assert!(size > 0, "a process group needs at least one rank");

        let mut outboxes = (0..size).map(|_| Vec::with_capacity(size)).collect_vec();
        let mut inboxes = (0..size).map(|_| Vec::with_capacity(size)).collect_vec();

        for source in 0..size {
            for destination in 0..size {
                let (sender, receiver) = unbounded();
                outboxes[source].push(sender);
                inboxes[destination].push(receiver);
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| LocalCommunicator {
                rank,
                outboxes,
                inboxes,
            })
            .collect()
    }

    /// Run `f` on `size` threads, one per rank, and return the results
    /// ordered by rank.
    ///
    /// A panic on any rank is propagated after all threads have finished.
    /// Ranks blocked on a message from a panicked rank observe
    /// [CommError::Disconnected].
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalCommunicator) -> T + Sync,
    {
        let communicators = Self::communicators(size);
        let f = &f;

        std::thread::scope(|scope| {
            let handles = communicators
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect_vec();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                })
                .collect()
        })
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outboxes.len()
    }

    fn exchange(
        &self,
        tag: Tag,
        sends: Vec<(usize, Vec<u8>)>,
        sources: &[usize],
    ) -> Result<Vec<Vec<u8>>, CommError> {
        for (destination, payload) in sends {
            let outbox = self
                .outboxes
                .get(destination)
                .ok_or(CommError::InvalidRank(destination))?;
            outbox
                .send(Envelope { tag, payload })
                .map_err(|_| CommError::Disconnected {
                    rank: self.rank,
                    peer: destination,
                })?;
        }

        sources
            .iter()
            .map(|&source| {
                let inbox = self
                    .inboxes
                    .get(source)
                    .ok_or(CommError::InvalidRank(source))?;
                let envelope = inbox.recv().map_err(|_| CommError::Disconnected {
                    rank: self.rank,
                    peer: source,
                })?;
                if envelope.tag != tag {
                    return Err(CommError::TagMismatch {
                        rank: self.rank,
                        peer: source,
                        expected: tag.0,
                        found: envelope.tag.0,
                    });
                }
                Ok(envelope.payload)
            })
            .collect()
    }
}
