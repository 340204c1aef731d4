//! Process-group abstraction over cooperating workers.
//!
//! The decomposition never touches an ambient communicator: every operation
//! receives a [`ProcessGroup`] handle bundling rank, size and the blocking
//! point-to-point primitives. Two implementations are provided: a trivial
//! [`SerialGroup`] for single-process runs, and [`ChannelGroup`], an
//! in-process mesh of simulated workers (one per thread) used by the tests,
//! benches and demos. An MPI-backed group only needs to implement the same
//! four required methods.

use std::cell::RefCell;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::trace;
use ndarray::Array2;

use crate::error::{PodError, Result};

/// Element-wise combining operation for [`ProcessGroup::reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    fn fold_into(self, accumulator: &mut Array2<f64>, incoming: &Array2<f64>) {
        match self {
            ReduceOp::Sum => *accumulator += incoming,
            ReduceOp::Min => accumulator.zip_mut_with(incoming, |a, &b| *a = a.min(b)),
            ReduceOp::Max => accumulator.zip_mut_with(incoming, |a, &b| *a = a.max(b)),
        }
    }
}

/// Handle to a group of cooperating processes.
///
/// `send` and `recv` are blocking and point-to-point; a given round of the
/// butterfly performs at most one of each. The collective `reduce` family is
/// built on top of them, so implementers only supply the four required
/// methods.
pub trait ProcessGroup {
    /// This participant's zero-based rank.
    fn rank(&self) -> usize;

    /// Number of participants in the group.
    fn size(&self) -> usize;

    /// Blocking send of a dense matrix to `dest`.
    fn send(&self, dest: usize, payload: &Array2<f64>) -> Result<()>;

    /// Blocking receive of a dense matrix from a specific `source`.
    fn recv(&self, source: usize) -> Result<Array2<f64>>;

    /// Element-wise reduction of `local` across the group.
    ///
    /// Rank 0 acts as the root. When `broadcast` is set every rank receives
    /// the combined value; otherwise only the root does and all other ranks
    /// get `None`. The result is not bit-for-bit reproducible across
    /// different group sizes because the floating-point combination order
    /// changes with the topology; that discrepancy is bounded and accepted.
    fn reduce(
        &self,
        local: &Array2<f64>,
        op: ReduceOp,
        broadcast: bool,
    ) -> Result<Option<Array2<f64>>> {
        let rank = self.rank();
        let size = self.size();
        if size == 1 {
            return Ok(Some(local.clone()));
        }
        if rank == 0 {
            let mut accumulator = local.clone();
            for source in 1..size {
                let incoming = self.recv(source)?;
                if incoming.dim() != accumulator.dim() {
                    return Err(PodError::Communication {
                        rank,
                        detail: format!(
                            "reduce contribution from rank {source} is {:?}, expected {:?}",
                            incoming.dim(),
                            accumulator.dim()
                        ),
                    });
                }
                op.fold_into(&mut accumulator, &incoming);
            }
            if broadcast {
                for dest in 1..size {
                    self.send(dest, &accumulator)?;
                }
            }
            Ok(Some(accumulator))
        } else {
            self.send(0, local)?;
            if broadcast {
                Ok(Some(self.recv(0)?))
            } else {
                Ok(None)
            }
        }
    }

    /// Reduction in which every rank receives the combined value.
    fn all_reduce(&self, local: &Array2<f64>, op: ReduceOp) -> Result<Array2<f64>> {
        self.reduce(local, op, true)?
            .ok_or_else(|| PodError::Communication {
                rank: self.rank(),
                detail: "broadcasting reduce returned no value".to_string(),
            })
    }

    /// Element-wise sum across the group.
    fn reduce_sum(&self, local: &Array2<f64>, broadcast: bool) -> Result<Option<Array2<f64>>> {
        self.reduce(local, ReduceOp::Sum, broadcast)
    }

    /// Scalar convenience wrapper around [`ProcessGroup::reduce_sum`].
    fn reduce_sum_scalar(&self, value: f64, broadcast: bool) -> Result<Option<f64>> {
        Ok(self
            .reduce_sum(&Array2::from_elem((1, 1), value), broadcast)?
            .map(|combined| combined[[0, 0]]))
    }
}

/// Trivial group for serial runs: a single rank with no peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialGroup;

impl ProcessGroup for SerialGroup {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, dest: usize, _payload: &Array2<f64>) -> Result<()> {
        Err(PodError::Communication {
            rank: 0,
            detail: format!("no peer rank {dest} in a serial group"),
        })
    }

    fn recv(&self, source: usize) -> Result<Array2<f64>> {
        Err(PodError::Communication {
            rank: 0,
            detail: format!("no peer rank {source} in a serial group"),
        })
    }
}

type Envelope = (usize, Array2<f64>);

/// One endpoint of an in-process mesh of simulated workers.
///
/// Every endpoint owns the receiving half of its own channel plus sender
/// clones for every rank in the group. Messages carry their source rank;
/// arrivals from other sources than the one currently awaited are stashed
/// and handed out by a later matching `recv`.
///
/// Receives wait at most `timeout` before failing with a communication
/// fault, so a partner stuck mid-round surfaces as a reported error instead
/// of an unbounded block.
pub struct ChannelGroup {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: RefCell<Vec<Envelope>>,
    timeout: Duration,
}

impl ChannelGroup {
    /// Default bounded wait for a single receive.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Builds a fully-connected mesh of `size` endpoints.
    pub fn mesh(size: usize) -> Vec<ChannelGroup> {
        Self::mesh_with_timeout(size, Self::DEFAULT_TIMEOUT)
    }

    /// Builds a mesh whose receives give up after `timeout`.
    pub fn mesh_with_timeout(size: usize, timeout: Duration) -> Vec<ChannelGroup> {
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            receivers.push(rx);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelGroup {
                rank,
                peers: senders.clone(),
                inbox,
                stash: RefCell::new(Vec::new()),
                timeout,
            })
            .collect()
    }
}

impl ProcessGroup for ChannelGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest: usize, payload: &Array2<f64>) -> Result<()> {
        let sender = self.peers.get(dest).ok_or_else(|| PodError::Communication {
            rank: self.rank,
            detail: format!(
                "destination rank {dest} outside the group of {}",
                self.peers.len()
            ),
        })?;
        trace!(
            "rank {} -> rank {}: {}x{} buffer",
            self.rank,
            dest,
            payload.nrows(),
            payload.ncols()
        );
        sender
            .send((self.rank, payload.clone()))
            .map_err(|_| PodError::Communication {
                rank: self.rank,
                detail: format!("rank {dest} disconnected before receiving"),
            })
    }

    fn recv(&self, source: usize) -> Result<Array2<f64>> {
        if source >= self.peers.len() {
            return Err(PodError::Communication {
                rank: self.rank,
                detail: format!(
                    "source rank {source} outside the group of {}",
                    self.peers.len()
                ),
            });
        }
        {
            let mut stash = self.stash.borrow_mut();
            if let Some(position) = stash.iter().position(|(from, _)| *from == source) {
                return Ok(stash.remove(position).1);
            }
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(remaining) {
                Ok((from, payload)) if from == source => {
                    trace!(
                        "rank {} <- rank {}: {}x{} buffer",
                        self.rank,
                        from,
                        payload.nrows(),
                        payload.ncols()
                    );
                    return Ok(payload);
                }
                Ok(envelope) => self.stash.borrow_mut().push(envelope),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(PodError::Communication {
                        rank: self.rank,
                        detail: format!(
                            "no message from rank {source} within {:?}",
                            self.timeout
                        ),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PodError::Communication {
                        rank: self.rank,
                        detail: format!("all peers disconnected while waiting for rank {source}"),
                    });
                }
            }
        }
    }
}

/// Runs one simulated worker per rank on scoped threads and returns their
/// results in rank order. A panicking worker is re-raised on the caller.
pub fn run_group<T, F>(size: usize, worker: F) -> Vec<T>
where
    F: Fn(ChannelGroup) -> T + Sync,
    T: Send,
{
    let endpoints = ChannelGroup::mesh(size);
    std::thread::scope(|scope| {
        let worker = &worker;
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|group| scope.spawn(move || worker(group)))
            .collect();
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
