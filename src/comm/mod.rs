//! Thin façade over inter-process message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees). All
//! handles are non-blocking and pollable: the engine calls `test()` while it
//! has other work and only falls back to the blocking `wait()` when the
//! ready queues are empty and nothing else can proceed.
//!
//! Three backends: [`NoComm`] for pure serial runs, [`ThreadComm`] for
//! multi-rank execution inside one process (tests, development), and
//! `MpiComm` (feature `mpi-support`) over a real MPI transport.

pub mod collective;
pub(crate) mod engine;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait + Send;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait + Send;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle;
}

/// Anything that can be polled or waited on. Receive handles yield the
/// message payload; send handles yield an empty buffer.
pub trait Wait {
    /// Non-blocking completion probe. Returns the payload once, then the
    /// handle must not be polled again.
    fn test(&mut self) -> Option<Vec<u8>>;

    /// Block until completion.
    fn wait(mut self) -> Vec<u8>
    where
        Self: Sized,
    {
        loop {
            if let Some(data) = self.test() {
                return data;
            }
            std::thread::yield_now();
        }
    }
}

/// Compile-time no-op comm for pure serial runs and unit tests. A
/// single-rank graph never produces remote edges, so its handles are never
/// actually created by the engine.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

/// Handle of [`NoComm`]; completes immediately and empty.
pub struct NoOpHandle;

impl Wait for NoOpHandle {
    fn test(&mut self) -> Option<Vec<u8>> {
        Some(Vec::new())
    }
}

impl Communicator for NoComm {
    type SendHandle = NoOpHandle;
    type RecvHandle = NoOpHandle;

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) -> NoOpHandle {
        NoOpHandle
    }

    fn irecv(&self, _peer: usize, _tag: u16) -> NoOpHandle {
        NoOpHandle
    }
}

// --- ThreadComm: multi-rank execution inside one process ---

/// (world, src, dst, tag). Worlds isolate concurrently-running groups
/// (parallel tests) from one another; messages on the same key queue FIFO.
type MailKey = (u64, usize, usize, u16);

static MAILBOX: Lazy<DashMap<MailKey, VecDeque<Bytes>>> = Lazy::new(DashMap::new);
static WORLD_COUNTER: AtomicU64 = AtomicU64::new(1);

/// In-process communicator: each rank is a thread, the transport is a
/// process-global mailbox. Intended for tests and single-node development.
#[derive(Clone, Debug)]
pub struct ThreadComm {
    world_id: u64,
    rank: usize,
    size: usize,
}

impl ThreadComm {
    /// A fresh world of `size` ranks, one communicator per rank. Each call
    /// gets its own mailbox namespace.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "need at least one rank");
        let world_id = WORLD_COUNTER.fetch_add(1, Ordering::Relaxed);
        (0..size)
            .map(|rank| ThreadComm {
                world_id,
                rank,
                size,
            })
            .collect()
    }
}

/// Pending receive on the mailbox; polls its key until a message lands.
pub struct MailboxRecv {
    key: MailKey,
    done: bool,
}

impl Wait for MailboxRecv {
    fn test(&mut self) -> Option<Vec<u8>> {
        debug_assert!(!self.done, "handle polled after completion");
        let data = {
            let mut entry = MAILBOX.get_mut(&self.key)?;
            entry.value_mut().pop_front()?
        };
        self.done = true;
        Some(data.to_vec())
    }
}

/// Sends into the mailbox complete at post time.
pub struct MailboxSend;

impl Wait for MailboxSend {
    fn test(&mut self) -> Option<Vec<u8>> {
        Some(Vec::new())
    }
}

impl Communicator for ThreadComm {
    type SendHandle = MailboxSend;
    type RecvHandle = MailboxRecv;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MailboxSend {
        let key = (self.world_id, self.rank, peer, tag);
        MAILBOX
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
        MailboxSend
    }

    fn irecv(&self, peer: usize, tag: u16) -> MailboxRecv {
        MailboxRecv {
            key: (self.world_id, peer, self.rank, tag),
            done: false,
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::Wait;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SystemCommunicator};

    /// Communicator over a real MPI world. One instance per process;
    /// `mpi::initialize` must be called exactly once.
    pub struct MpiComm {
        universe: mpi::environment::Universe,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Self {
            let universe = mpi::initialize().expect("MPI already initialized");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                universe,
                rank,
                size,
            }
        }

        fn world(&self) -> SystemCommunicator {
            self.universe.world()
        }
    }

    /// Eagerly-buffered send. MPI may buffer small messages; we complete
    /// the handle at post time and rely on the engine's drain at the end of
    /// execute to bound the number in flight.
    pub struct MpiSend;

    impl Wait for MpiSend {
        fn test(&mut self) -> Option<Vec<u8>> {
            Some(Vec::new())
        }
    }

    /// Probe-based receive: poll for a matching envelope, then complete
    /// with a blocking receive of the now-arrived message.
    pub struct MpiRecv {
        world: SystemCommunicator,
        peer: i32,
        tag: i32,
        done: bool,
    }

    impl Wait for MpiRecv {
        fn test(&mut self) -> Option<Vec<u8>> {
            debug_assert!(!self.done, "handle polled after completion");
            let proc = self.world.process_at_rank(self.peer);
            proc.immediate_probe_with_tag(self.tag)?;
            let (data, _status) = proc.receive_vec_with_tag::<u8>(self.tag);
            self.done = true;
            Some(data)
        }
    }

    impl super::Communicator for MpiComm {
        type SendHandle = MpiSend;
        type RecvHandle = MpiRecv;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSend {
            self.world()
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
            MpiSend
        }

        fn irecv(&self, peer: usize, tag: u16) -> MpiRecv {
            MpiRecv {
                world: self.world(),
                peer: peer as i32,
                tag: tag as i32,
                done: false,
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
