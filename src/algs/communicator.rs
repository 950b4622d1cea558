//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! Handles are **waitable**: a send may complete eagerly, a receive blocks in
//! `.wait()` until the matching message has arrived.
//!
//! The process-group handle is always passed explicitly; nothing in this crate
//! consults an ambient "current communicator". Every helper in the collective
//! section below must be called by **all** ranks, in the same order, with the
//! same tag. A rank that skips one deadlocks its peers; this is not detected.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytemuck::Pod;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::algs::wire::{WireCount, cast_slice, pod_vec_from_bytes};
use crate::mesh_error::MeshSolveError;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Post a send of `buf` to `peer`. The buffer is copied before returning.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive for the next message from `peer` with `tag`.
    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle;

    /// Rank of this process in the group.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Synchronization barrier.
    fn barrier(&self) {}

    /// True for the compile-time serial communicator.
    fn is_no_comm(&self) -> bool {
        false
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Typed message tag; phases of one operation use deterministic offsets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Tag shifted by `by` (wrapping).
    #[inline]
    pub const fn offset(self, by: u16) -> Self {
        Self(self.0.wrapping_add(by))
    }
}

/// Tag pair for a two-phase "sizes then data" exchange.
#[derive(Copy, Clone, Debug)]
pub struct ExchangeTags {
    pub sizes: CommTag,
    pub data: CommTag,
}

impl ExchangeTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

/// Compile-time no-op comm for pure serial runs.
///
/// With one rank every collective below degenerates to a local copy and no
/// message is ever posted.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- ThreadComm: several ranks inside one process, one thread each ---

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Mailbox {
    slots: DashMap<Key, VecDeque<Bytes>>,
    lock: Mutex<()>,
    arrived: Condvar,
}

/// In-process communicator: every rank of a group shares one mailbox.
///
/// Messages between a `(src, dst, tag)` triple are delivered in FIFO order,
/// matching MPI's non-overtaking rule. Groups created by separate calls to
/// [`ThreadComm::group`] never see each other's traffic.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl ThreadComm {
    /// Create `size` connected ranks; hand one to each thread.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }
}

pub struct ThreadRecvHandle {
    key: Key,
    mailbox: Arc<Mailbox>,
}

impl Wait for ThreadRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            if let Some(mut queue) = self.mailbox.slots.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    return Some(bytes.to_vec());
                }
            }
            let mut guard = self.mailbox.lock.lock();
            // timed wait: a notify may land between the probe above and here
            let _ = self
                .mailbox
                .arrived
                .wait_for(&mut guard, Duration::from_millis(1));
        }
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = ThreadRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        self.mailbox
            .slots
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
        let _guard = self.mailbox.lock.lock();
        self.mailbox.arrived.notify_all();
    }

    fn irecv(&self, peer: usize, tag: u16) -> ThreadRecvHandle {
        ThreadRecvHandle {
            key: (peer, self.rank, tag),
            mailbox: Arc::clone(&self.mailbox),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    pub struct MpiComm {
        // declared before the universe so it is dropped first
        world: SimpleCommunicator,
        _universe: Universe,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        /// Initialize MPI and wrap `MPI_COMM_WORLD`.
        pub fn new() -> Result<Self, MeshSolveError> {
            let universe = mpi::initialize().ok_or_else(|| MeshSolveError::CommError {
                neighbor: 0,
                source: "MPI was already initialized".into(),
            })?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world,
                _universe: universe,
                rank,
                size,
            })
        }
    }

    /// Outstanding send; owns its buffer until the request completes.
    pub struct MpiSendHandle {
        request: Request<'static, [u8], StaticScope>,
        buffer: *mut [u8],
    }

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.request.wait();
            // SAFETY: `buffer` came from `Box::into_raw` in `isend` and the request
            // that borrowed it has completed.
            drop(unsafe { Box::from_raw(self.buffer) });
            None
        }
    }

    /// Receives complete eagerly inside `irecv`. Every helper in this crate
    /// posts its (non-blocking) sends before its receives, so a correctly
    /// sequenced collective cannot deadlock on this.
    pub struct MpiRecvHandle(Vec<u8>);

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            Some(self.0)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let buffer: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the boxed slice outlives the request; it is reclaimed in `wait`.
            let data: &'static [u8] = unsafe { &*buffer };
            let request = self.world.process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                data,
                i32::from(tag),
            );
            MpiSendHandle { request, buffer }
        }

        fn irecv(&self, peer: usize, tag: u16) -> MpiRecvHandle {
            let (data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(i32::from(tag));
            MpiRecvHandle(data)
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
        fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

// --- Collectives built on point-to-point messages ---

fn recv_exact<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: CommTag,
    expected: Option<usize>,
) -> Result<Vec<u8>, MeshSolveError> {
    let data = comm
        .irecv(peer, tag.as_u16())
        .wait()
        .ok_or_else(|| MeshSolveError::CommError {
            neighbor: peer,
            source: format!("no data received from rank {peer}").into(),
        })?;
    if let Some(expected) = expected {
        if data.len() != expected {
            return Err(MeshSolveError::BufferSizeMismatch {
                neighbor: peer,
                expected,
                got: data.len(),
            });
        }
    }
    Ok(data)
}

/// Every rank contributes `local`; returns all contributions indexed by rank.
///
/// Contributions may differ in length between ranks.
pub fn allgather_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    local: &[u8],
) -> Result<Vec<Vec<u8>>, MeshSolveError> {
    let me = comm.rank();
    let n = comm.size();
    let mut pending = Vec::with_capacity(n.saturating_sub(1));
    for peer in (0..n).filter(|&p| p != me) {
        pending.push(comm.isend(peer, tag.as_u16(), local));
    }
    let mut out = Vec::with_capacity(n);
    let mut maybe_err = None;
    for peer in 0..n {
        if peer == me {
            out.push(local.to_vec());
            continue;
        }
        match recv_exact(comm, peer, tag, None) {
            Ok(data) => out.push(data),
            Err(e) => {
                out.push(Vec::new());
                maybe_err.get_or_insert(e);
            }
        }
    }
    for send in pending {
        let _ = send.wait();
    }
    match maybe_err {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

/// Typed [`allgather_bytes`] for `Pod` records.
pub fn allgather<C: Communicator, T: Pod>(
    comm: &C,
    tag: CommTag,
    local: &[T],
) -> Result<Vec<Vec<T>>, MeshSolveError> {
    allgather_bytes(comm, tag, cast_slice(local))?
        .into_iter()
        .enumerate()
        .map(|(rank, raw)| pod_vec_from_bytes::<T>(&raw, rank))
        .collect()
}

/// Gather one count per rank (e.g. owned rows) into a rank-indexed vector.
pub fn allgather_counts<C: Communicator>(
    comm: &C,
    tag: CommTag,
    count: usize,
) -> Result<Vec<usize>, MeshSolveError> {
    let wire = [WireCount::new(count)];
    Ok(allgather(comm, tag, &wire)?
        .into_iter()
        .map(|v| v.first().map_or(0, WireCount::get))
        .collect())
}

/// Global sum of a scalar. Every rank sums the same values in rank order, so
/// the result is bit-identical across ranks.
pub fn all_reduce_sum<C: Communicator>(
    comm: &C,
    tag: CommTag,
    local: f64,
) -> Result<f64, MeshSolveError> {
    if comm.size() == 1 {
        return Ok(local);
    }
    Ok(allgather(comm, tag, &[local])?
        .iter()
        .filter_map(|v| v.first())
        .sum())
}

/// Global maximum of a scalar.
pub fn all_reduce_max<C: Communicator>(
    comm: &C,
    tag: CommTag,
    local: f64,
) -> Result<f64, MeshSolveError> {
    if comm.size() == 1 {
        return Ok(local);
    }
    Ok(allgather(comm, tag, &[local])?
        .iter()
        .filter_map(|v| v.first().copied())
        .fold(f64::NEG_INFINITY, f64::max))
}

/// Broadcast `data` from `root`; non-root ranks pass `None`.
///
/// No rank returns before it holds the root's payload.
pub fn broadcast_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    root: usize,
    data: Option<Vec<u8>>,
) -> Result<Vec<u8>, MeshSolveError> {
    let me = comm.rank();
    if me == root {
        let payload = data.ok_or_else(|| MeshSolveError::CommError {
            neighbor: root,
            source: "broadcast root has no payload".into(),
        })?;
        let pending: Vec<_> = (0..comm.size())
            .filter(|&p| p != root)
            .map(|peer| comm.isend(peer, tag.as_u16(), &payload))
            .collect();
        for send in pending {
            let _ = send.wait();
        }
        Ok(payload)
    } else {
        recv_exact(comm, root, tag, None)
    }
}

/// Gather every rank's `local` bytes to `root`. Returns `Some` only on root.
pub fn gather_bytes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    root: usize,
    local: &[u8],
) -> Result<Option<Vec<Vec<u8>>>, MeshSolveError> {
    let me = comm.rank();
    if me != root {
        let _ = comm.isend(root, tag.as_u16(), local).wait();
        return Ok(None);
    }
    let mut out = Vec::with_capacity(comm.size());
    for peer in 0..comm.size() {
        if peer == me {
            out.push(local.to_vec());
        } else {
            out.push(recv_exact(comm, peer, tag, None)?);
        }
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_comm_is_nop() {
        let comm = NoComm;
        assert!(comm.is_no_comm());
        assert!(comm.irecv(0, 123).wait().is_none());
        assert!(comm.isend(0, 123, &[]).wait().is_none());
        let all = allgather_bytes(&comm, CommTag::new(1), &[7, 8]).unwrap();
        assert_eq!(all, vec![vec![7, 8]]);
        assert_eq!(all_reduce_sum(&comm, CommTag::new(2), 3.5).unwrap(), 3.5);
    }

    #[test]
    fn thread_roundtrip_two_ranks() {
        let comms = ThreadComm::group(2);
        let _ = comms[0].isend(1, 7, &[1, 2, 3, 4]);
        let got = comms[1].irecv(0, 7).wait().expect("data from rank 0");
        assert_eq!(got, vec![1, 2, 3, 4]);
    }

    #[test]
    fn thread_fifo_order_per_tag() {
        let comms = ThreadComm::group(2);
        for i in 0..10u8 {
            let _ = comms[0].isend(1, 9, &[i]);
        }
        let got: Vec<u8> = (0..10)
            .map(|_| comms[1].irecv(0, 9).wait().unwrap()[0])
            .collect();
        assert_eq!(got, (0u8..10).collect::<Vec<_>>());
    }

    #[test]
    fn groups_are_isolated() {
        let a = ThreadComm::group(2);
        let b = ThreadComm::group(2);
        let _ = a[0].isend(1, 5, &[1]);
        let _ = b[0].isend(1, 5, &[2]);
        assert_eq!(b[1].irecv(0, 5).wait().unwrap(), vec![2]);
        assert_eq!(a[1].irecv(0, 5).wait().unwrap(), vec![1]);
    }

    #[test]
    fn tag_offsets_are_distinct() {
        let tags = ExchangeTags::from_base(CommTag::new(0xFFFF));
        assert_eq!(tags.sizes.as_u16(), 0xFFFF);
        assert_eq!(tags.data.as_u16(), 0);
    }
}
