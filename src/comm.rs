//! Message passing between ranks.
//!
//! Every method of [Communicator] is collective: all ranks call the same methods in the
//! same order. Payloads are contiguous byte buffers; typed wrappers live in
//! [crate::tools]. Communication failures are returned as [CommError] and are never
//! retried.

use std::{
    cell::{Cell, RefCell},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

use crate::error::CommError;

/// Collective and point-to-point operations needed by the domain decomposition.
pub trait Communicator {
    /// Rank of the calling process.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Element-wise sum over all ranks.
    ///
    /// Only integers are reduced so that every rank obtains bit-identical results.
    fn all_reduce_sum(&self, local: &[u64]) -> Result<Vec<u64>, CommError>;

    /// Gather a buffer from every rank on every rank, ordered by rank.
    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CommError>;

    /// Send `sends[r]` to rank `r` and return the buffers received from every rank.
    fn all_to_all(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError>;

    /// Point-to-point exchange with a known set of peers.
    ///
    /// Every `(peer, buffer)` in `sends` is sent to `peer`; one message is received from
    /// each rank in `recv_from`. Returns the received buffers in the order of `recv_from`.
    /// All transfers are complete when the method returns.
    fn exchange(
        &self,
        sends: Vec<(usize, Vec<u8>)>,
        recv_from: &[usize],
    ) -> Result<Vec<(usize, Vec<u8>)>, CommError>;

    /// Block until every rank has arrived.
    fn barrier(&self) -> Result<(), CommError> {
        self.all_gather(&[]).map(|_| ())
    }
}

/// A communicator of size one.
#[derive(Copy, Clone, Debug, Default)]
pub struct SingleRank;

impl Communicator for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, local: &[u64]) -> Result<Vec<u64>, CommError> {
        Ok(local.to_vec())
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        Ok(vec![local.to_vec()])
    }

    fn all_to_all(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        if sends.len() != 1 {
            return Err(CommError::InvalidPeer {
                peer: sends.len().saturating_sub(1),
                size: 1,
            });
        }
        Ok(sends)
    }

    fn exchange(
        &self,
        sends: Vec<(usize, Vec<u8>)>,
        recv_from: &[usize],
    ) -> Result<Vec<(usize, Vec<u8>)>, CommError> {
        if let Some(&(peer, _)) = sends.iter().find(|(peer, _)| *peer != 0) {
            return Err(CommError::InvalidPeer { peer, size: 1 });
        }
        if let Some(&peer) = recv_from.iter().find(|&&peer| peer != 0) {
            return Err(CommError::InvalidPeer { peer, size: 1 });
        }
        let mut sends = sends.into_iter();
        Ok(recv_from
            .iter()
            .filter_map(|_| sends.next().map(|(_, buf)| (0, buf)))
            .collect())
    }
}

struct Envelope {
    source: usize,
    tag: u64,
    payload: Vec<u8>,
}

/// Ranks living as threads of one process, connected by channels.
///
/// Used to run multi-rank decompositions without an MPI launcher. Messages are matched
/// by source and by a sequence tag that advances with every collective call.
pub struct ThreadComm {
    rank: usize,
    size: usize,
    senders: Vec<Sender<Envelope>>,
    receiver: Receiver<Envelope>,
    pending: RefCell<Vec<Envelope>>,
    sequence: Cell<u64>,
    timeout: Duration,
}

impl ThreadComm {
    /// Default time a rank waits for a single message.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    /// Create `size` connected communicators, one per rank.
    pub fn create(size: usize) -> Vec<ThreadComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ThreadComm {
                rank,
                size,
                senders: senders.clone(),
                receiver,
                pending: RefCell::new(Vec::new()),
                sequence: Cell::new(0),
                timeout: Self::DEFAULT_TIMEOUT,
            })
            .collect()
    }

    /// Run `f` on `size` ranks, each on its own thread, and return the results by rank.
    ///
    /// A panic on any rank is propagated to the caller.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(ThreadComm) -> T + Sync,
    {
        let f = &f;
        std::thread::scope(|scope| {
            let handles = Self::create(size)
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect::<Vec<_>>();

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

    /// Change the time a rank waits for a single message.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn next_tag(&self) -> u64 {
        let tag = self.sequence.get();
        self.sequence.set(tag + 1);
        tag
    }

    fn check_peer(&self, peer: usize) -> Result<(), CommError> {
        if peer >= self.size {
            Err(CommError::InvalidPeer {
                peer,
                size: self.size,
            })
        } else {
            Ok(())
        }
    }

    fn send(&self, peer: usize, tag: u64, payload: Vec<u8>) -> Result<(), CommError> {
        self.check_peer(peer)?;
        self.senders[peer]
            .send(Envelope {
                source: self.rank,
                tag,
                payload,
            })
            .map_err(|_| CommError::Disconnected { peer })
    }

    fn receive(&self, peer: usize, tag: u64) -> Result<Vec<u8>, CommError> {
        self.check_peer(peer)?;

        {
            let mut pending = self.pending.borrow_mut();
            if let Some(index) = pending
                .iter()
                .position(|envelope| envelope.source == peer && envelope.tag == tag)
            {
                return Ok(pending.swap_remove(index).payload);
            }
        }

        loop {
            let envelope = match self.receiver.recv_timeout(self.timeout) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => return Err(CommError::Timeout { peer }),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected { peer })
                }
            };
            if envelope.source == peer && envelope.tag == tag {
                return Ok(envelope.payload);
            }
            self.pending.borrow_mut().push(envelope);
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_reduce_sum(&self, local: &[u64]) -> Result<Vec<u64>, CommError> {
        let gathered = self.all_gather(bytemuck::cast_slice(local))?;

        let mut result = vec![0u64; local.len()];
        for (peer, bytes) in gathered.iter().enumerate() {
            let values: Vec<u64> = crate::tools::from_bytes(bytes, peer)?;
            if values.len() != result.len() {
                return Err(CommError::SizeMismatch {
                    peer,
                    expected: result.len(),
                    actual: values.len(),
                });
            }
            for (acc, value) in result.iter_mut().zip(values) {
                *acc += value;
            }
        }

        Ok(result)
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        let tag = self.next_tag();
        for peer in (0..self.size).filter(|&peer| peer != self.rank) {
            self.send(peer, tag, local.to_vec())?;
        }
        (0..self.size)
            .map(|peer| {
                if peer == self.rank {
                    Ok(local.to_vec())
                } else {
                    self.receive(peer, tag)
                }
            })
            .collect()
    }

    fn all_to_all(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        if sends.len() != self.size {
            return Err(CommError::InvalidPeer {
                peer: sends.len(),
                size: self.size,
            });
        }

        let tag = self.next_tag();
        let mut own = Vec::new();
        for (peer, payload) in sends.into_iter().enumerate() {
            if peer == self.rank {
                own = payload;
            } else {
                self.send(peer, tag, payload)?;
            }
        }

        let mut own = Some(own);
        (0..self.size)
            .map(|peer| {
                if peer == self.rank {
                    Ok(own.take().unwrap_or_default())
                } else {
                    self.receive(peer, tag)
                }
            })
            .collect()
    }

    fn exchange(
        &self,
        sends: Vec<(usize, Vec<u8>)>,
        recv_from: &[usize],
    ) -> Result<Vec<(usize, Vec<u8>)>, CommError> {
        let tag = self.next_tag();
        for (peer, payload) in sends {
            self.send(peer, tag, payload)?;
        }
        recv_from
            .iter()
            .map(|&peer| self.receive(peer, tag).map(|payload| (peer, payload)))
            .collect()
    }
}

#[cfg(feature = "mpi")]
mod mpi_backend {
    use mpi::{
        collective::SystemOperation,
        datatype::{Partition, PartitionMut},
        traits::{Communicator as _, CommunicatorCollectives, Destination, Source},
        Tag,
    };

    use super::Communicator;
    use crate::{
        error::CommError,
        tools::{displacements, message_count},
    };

    const EXCHANGE_TAG: Tag = 4242;

    /// A [Communicator] backed by an MPI communicator.
    pub struct MpiComm<'c, C> {
        comm: &'c C,
    }

    impl<'c, C: CommunicatorCollectives> MpiComm<'c, C> {
        /// Wrap an MPI communicator.
        pub fn new(comm: &'c C) -> Self {
            Self { comm }
        }

        /// Return the wrapped communicator.
        pub fn comm(&self) -> &C {
            self.comm
        }
    }

    fn split_by_counts(buffer: Vec<u8>, counts: &[i32]) -> Vec<Vec<u8>> {
        let mut rest = buffer.as_slice();
        counts
            .iter()
            .map(|&count| {
                let (chunk, remainder) = rest.split_at(count as usize);
                rest = remainder;
                chunk.to_vec()
            })
            .collect()
    }

    impl<C: CommunicatorCollectives> Communicator for MpiComm<'_, C> {
        fn rank(&self) -> usize {
            self.comm.rank() as usize
        }

        fn size(&self) -> usize {
            self.comm.size() as usize
        }

        fn all_reduce_sum(&self, local: &[u64]) -> Result<Vec<u64>, CommError> {
            let mut global = vec![0u64; local.len()];
            self.comm
                .all_reduce_into(local, &mut global[..], SystemOperation::sum());
            Ok(global)
        }

        fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
            let local_len = message_count(local.len())?;
            let mut counts = vec![0i32; self.size()];
            self.comm.all_gather_into(&local_len, &mut counts[..]);

            let displs = displacements(&counts);
            let mut recvbuffer = vec![0u8; counts.iter().sum::<i32>() as usize];
            {
                let mut partition =
                    PartitionMut::new(&mut recvbuffer[..], &counts[..], &displs[..]);
                self.comm.all_gather_varcount_into(local, &mut partition);
            }

            Ok(split_by_counts(recvbuffer, &counts))
        }

        fn all_to_all(&self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
            if sends.len() != self.size() {
                return Err(CommError::InvalidPeer {
                    peer: sends.len(),
                    size: self.size(),
                });
            }

            let counts = sends
                .iter()
                .map(|buf| message_count(buf.len()))
                .collect::<Result<Vec<_>, _>>()?;
            let mut recv_counts = vec![0i32; counts.len()];
            self.comm.all_to_all_into(&counts[..], &mut recv_counts[..]);

            let flat = sends.concat();
            let send_displs = displacements(&counts);
            let recv_displs = displacements(&recv_counts);
            let mut output = vec![0u8; recv_counts.iter().sum::<i32>() as usize];
            {
                let send_partition = Partition::new(&flat[..], &counts[..], &send_displs[..]);
                let mut recv_partition =
                    PartitionMut::new(&mut output[..], &recv_counts[..], &recv_displs[..]);
                self.comm
                    .all_to_all_varcount_into(&send_partition, &mut recv_partition);
            }

            Ok(split_by_counts(output, &recv_counts))
        }

        fn exchange(
            &self,
            sends: Vec<(usize, Vec<u8>)>,
            recv_from: &[usize],
        ) -> Result<Vec<(usize, Vec<u8>)>, CommError> {
            let size = self.size();
            if let Some(&peer) = sends
                .iter()
                .map(|(peer, _)| peer)
                .chain(recv_from.iter())
                .find(|&&peer| peer >= size)
            {
                return Err(CommError::InvalidPeer { peer, size });
            }

            let received = mpi::request::scope(|scope| {
                let requests = sends
                    .iter()
                    .map(|(peer, buf)| {
                        self.comm
                            .process_at_rank(*peer as i32)
                            .immediate_send_with_tag(scope, &buf[..], EXCHANGE_TAG)
                    })
                    .collect::<Vec<_>>();

                let received = recv_from
                    .iter()
                    .map(|&peer| {
                        let (payload, _status) = self
                            .comm
                            .process_at_rank(peer as i32)
                            .receive_vec_with_tag::<u8>(EXCHANGE_TAG);
                        (peer, payload)
                    })
                    .collect::<Vec<_>>();

                for request in requests {
                    request.wait();
                }

                received
            });

            Ok(received)
        }

        fn barrier(&self) -> Result<(), CommError> {
            self.comm.barrier();
            Ok(())
        }
    }
}

#[cfg(feature = "mpi")]
pub use mpi_backend::MpiComm;
