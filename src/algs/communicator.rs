//! Thin façade over the process group the writer runs in.
//!
//! The writer only needs rank/size discovery, a barrier, and three blocking
//! collectives over byte buffers. Every rank must issue the same collectives
//! in the same order; a rank that never arrives deadlocks the group.
//!
//! - [`NoComm`]: a single serial process.
//! - [`LocalComm`]: ranks are threads of one process (tests, single node).
//! - `MpiComm`: inter-process MPI (feature `mpi-support`).

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Blocking collective interface (minimal by design).
pub trait Communicator {
    /// Rank of the calling process, `0..size()`.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;
    /// Block until every rank has reached this point.
    fn barrier(&self);
    /// Replace `buf` on every non-root rank with the root's `buf`.
    fn broadcast(&self, root: usize, buf: &mut Vec<u8>);
    /// Collect every rank's `buf` on `root`, in rank order. Non-root ranks get `None`.
    fn gather(&self, root: usize, buf: &[u8]) -> Option<Vec<Vec<u8>>>;

    /// Every rank receives every rank's `buf`, in rank order.
    fn all_gather(&self, buf: &[u8]) -> Vec<Vec<u8>> {
        let mut packed = self
            .gather(0, buf)
            .map(|parts| pack(&parts))
            .unwrap_or_default();
        self.broadcast(0, &mut packed);
        unpack(&packed)
    }
}

/// Length-prefixed concatenation used by the provided `all_gather`.
fn pack(parts: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = parts.iter().map(|p| p.len() + 8).sum();
    let mut out = Vec::with_capacity(total + 8);
    out.extend_from_slice(&(parts.len() as u64).to_le_bytes());
    for part in parts {
        out.extend_from_slice(&(part.len() as u64).to_le_bytes());
        out.extend_from_slice(part);
    }
    out
}

fn unpack(buf: &[u8]) -> Vec<Vec<u8>> {
    fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
        let bytes = buf.get(at..at + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
    let mut parts = Vec::new();
    let Some(count) = read_u64(buf, 0) else {
        return parts;
    };
    let mut at = 8;
    for _ in 0..count {
        let Some(len) = read_u64(buf, at) else { break };
        at += 8;
        let Some(part) = buf.get(at..at + len as usize) else {
            break;
        };
        parts.push(part.to_vec());
        at += len as usize;
    }
    parts
}

/// Serial "group" of one.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
    fn broadcast(&self, _root: usize, _buf: &mut Vec<u8>) {}
    fn gather(&self, _root: usize, buf: &[u8]) -> Option<Vec<Vec<u8>>> {
        Some(vec![buf.to_vec()])
    }
}

// --- LocalComm: intra-process / one thread per rank ---
type Key = (usize, usize); // (src, dst)

#[derive(Debug, Default)]
struct Mailbox {
    queues: Mutex<HashMap<Key, VecDeque<Bytes>>>,
    arrived: Condvar,
}

/// Rank handle of a thread group sharing one mailbox.
///
/// Messages between a pair of ranks are delivered in FIFO order, which is
/// all the collectives below rely on.
#[derive(Clone, Debug)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl LocalComm {
    /// Create handles for ranks `0..size`, to be moved into one thread each.
    pub fn group(size: usize) -> Vec<LocalComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }

    fn send(&self, dst: usize, data: Bytes) {
        let mut queues = self.mailbox.queues.lock();
        queues.entry((self.rank, dst)).or_default().push_back(data);
        self.mailbox.arrived.notify_all();
    }

    fn recv(&self, src: usize) -> Bytes {
        let key = (src, self.rank);
        let mut queues = self.mailbox.queues.lock();
        loop {
            if let Some(data) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
                return data;
            }
            self.mailbox.arrived.wait(&mut queues);
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.gather(0, &[]);
        self.broadcast(0, &mut Vec::new());
    }

    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) {
        if self.rank == root {
            let payload = Bytes::copy_from_slice(buf);
            for peer in (0..self.size).filter(|&p| p != root) {
                self.send(peer, payload.clone());
            }
        } else {
            *buf = self.recv(root).to_vec();
        }
    }

    fn gather(&self, root: usize, buf: &[u8]) -> Option<Vec<Vec<u8>>> {
        if self.rank == root {
            let parts = (0..self.size)
                .map(|peer| {
                    if peer == root {
                        buf.to_vec()
                    } else {
                        self.recv(peer).to_vec()
                    }
                })
                .collect();
            Some(parts)
        } else {
            self.send(root, Bytes::copy_from_slice(buf));
            None
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::Communicator;
    use mpi::Count;
    use mpi::datatype::PartitionMut;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::{Communicator as _, CommunicatorCollectives as _, Root as _};

    /// MPI communicator wrapper; the caller keeps the `Universe` alive.
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new(world: SimpleCommunicator) -> Self {
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self { world, rank, size }
        }
    }

    impl Communicator for MpiComm {
        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn broadcast(&self, root: usize, buf: &mut Vec<u8>) {
            let root_process = self.world.process_at_rank(root as i32);
            let mut len = buf.len() as u64;
            root_process.broadcast_into(&mut len);
            buf.resize(len as usize, 0);
            root_process.broadcast_into(&mut buf[..]);
        }

        fn gather(&self, root: usize, buf: &[u8]) -> Option<Vec<Vec<u8>>> {
            let root_process = self.world.process_at_rank(root as i32);
            let len = buf.len() as Count;
            if self.rank != root {
                root_process.gather_into(&len);
                root_process.gather_varcount_into(buf);
                return None;
            }
            let mut counts = vec![0 as Count; self.size];
            root_process.gather_into_root(&len, &mut counts[..]);
            let displs: Vec<Count> = counts
                .iter()
                .scan(0, |acc, &c| {
                    let start = *acc;
                    *acc += c;
                    Some(start)
                })
                .collect();
            let total: Count = counts.iter().sum();
            let mut flat = vec![0u8; total as usize];
            {
                let mut partition = PartitionMut::new(&mut flat[..], counts.clone(), &displs[..]);
                root_process.gather_varcount_into_root(buf, &mut partition);
            }
            Some(
                counts
                    .iter()
                    .zip(&displs)
                    .map(|(&c, &d)| flat[d as usize..(d + c) as usize].to_vec())
                    .collect(),
            )
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
