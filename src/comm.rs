//! Transport seam between the messaging layer and the outside world.
//!
//! The engine only needs non-blocking point-to-point byte transfers, a
//! barrier and a few scalar reductions, so those are the whole trait. Three
//! implementations are provided: `NoComm` for serial runs, `ThreadComm` for
//! multi-rank tests inside one process, and (behind the `mpi` feature)
//! `MpiComm` over a real cluster.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::pmap::Rank;

/// A message delivered by the transport.
#[derive(Debug)]
pub struct Message {
    /// Sending rank.
    pub src: Rank,
    /// Raw payload, truncated to the posted length.
    pub data: Vec<u8>,
}

/// Handle to an in-flight send.
pub trait SendHandle: Send {
    /// True once the buffer may be reused.
    fn test(&mut self) -> bool;
    /// Block until the send completes.
    fn wait(&mut self);
}

/// Handle to a posted receive.
pub trait RecvHandle: Send {
    /// Completed message, if any.
    fn test(&mut self) -> Option<Message>;
    /// Block until a message arrives.
    fn wait(&mut self) -> Message;
}

/// Reduction operators understood by the collectives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    /// Elementwise sum.
    Sum,
    /// Elementwise maximum.
    Max,
    /// Elementwise minimum.
    Min,
}

/// Non-blocking transport with a handful of collectives.
pub trait Transport: Send + Sync {
    /// Post a non-blocking send of `buf` to `peer` on `tag`.
    fn isend(&self, peer: Rank, tag: u16, buf: &[u8]) -> Box<dyn SendHandle>;

    /// Post a non-blocking receive of at most `max_len` bytes on `tag`,
    /// from `peer` or from any rank when `peer` is `None`.
    fn irecv(&self, peer: Option<Rank>, tag: u16, max_len: usize) -> Box<dyn RecvHandle>;

    /// Rank of this process.
    fn rank(&self) -> Rank;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier.
    fn barrier(&self);

    /// Elementwise all-reduce over `f64` values.
    fn allreduce_f64(&self, vals: &mut [f64], op: ReduceOp);

    /// Elementwise all-reduce over `u64` values.
    fn allreduce_u64(&self, vals: &mut [u64], op: ReduceOp);

    /// Gather `vals` from every rank; rank 0 receives the concatenation in
    /// rank order, the others receive `None`.
    fn gather_u64(&self, vals: &[u64]) -> Option<Vec<u64>>;
}

// --- NoComm: single-process world ---

/// Transport for a world of one rank; point-to-point operations are never
/// issued because every destination is local.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

struct NoOp;

impl SendHandle for NoOp {
    fn test(&mut self) -> bool {
        true
    }
    fn wait(&mut self) {}
}

impl Transport for NoComm {
    fn isend(&self, _peer: Rank, _tag: u16, _buf: &[u8]) -> Box<dyn SendHandle> {
        unreachable!("NoComm cannot send: all keys are local")
    }

    fn irecv(&self, _peer: Option<Rank>, _tag: u16, _max_len: usize) -> Box<dyn RecvHandle> {
        unreachable!("NoComm cannot receive: all keys are local")
    }

    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn allreduce_f64(&self, _vals: &mut [f64], _op: ReduceOp) {}

    fn allreduce_u64(&self, _vals: &mut [u64], _op: ReduceOp) {}

    fn gather_u64(&self, vals: &[u64]) -> Option<Vec<u64>> {
        Some(vals.to_vec())
    }
}

// --- ThreadComm: in-process ranks connected by mailboxes ---

#[derive(Default)]
struct Slot {
    q: VecDeque<(Rank, Vec<u8>)>,
}

type SlotCell = Arc<(Mutex<Slot>, Condvar)>;

struct ReduceBoard {
    inner: Mutex<ReduceInner>,
    cv: Condvar,
}

#[derive(Default)]
struct ReduceInner {
    epoch: u64,
    joined: usize,
    acc_f: Vec<f64>,
    acc_u: Vec<u64>,
    gathered: Vec<Option<Vec<u64>>>,
    ready_f: Vec<f64>,
    ready_u: Vec<u64>,
    ready_gather: Vec<u64>,
}

struct Group {
    size: usize,
    mailboxes: Mutex<HashMap<(Rank, u16), SlotCell>>,
    reduce: ReduceBoard,
}

impl Group {
    fn slot(&self, dst: Rank, tag: u16) -> SlotCell {
        let mut map = self.mailboxes.lock();
        map.entry((dst, tag)).or_default().clone()
    }
}

/// One rank of an in-process multi-rank world; create a full set with
/// [`ThreadComm::group`] and hand one to each rank's thread.
#[derive(Clone)]
pub struct ThreadComm {
    rank: Rank,
    group: Arc<Group>,
}

impl ThreadComm {
    /// Create `size` connected ranks.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let group = Arc::new(Group {
            size,
            mailboxes: Mutex::new(HashMap::new()),
            reduce: ReduceBoard {
                inner: Mutex::new(ReduceInner::default()),
                cv: Condvar::new(),
            },
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                group: group.clone(),
            })
            .collect()
    }

    fn collective<R: Clone>(
        &self,
        join: impl FnOnce(&mut ReduceInner),
        finish: impl FnOnce(&mut ReduceInner),
        read: impl FnOnce(&ReduceInner) -> R,
    ) -> R {
        let board = &self.group.reduce;
        let mut g = board.inner.lock();
        let epoch = g.epoch;
        join(&mut g);
        g.joined += 1;
        if g.joined == self.group.size {
            finish(&mut g);
            g.joined = 0;
            g.epoch += 1;
            board.cv.notify_all();
        } else {
            while g.epoch == epoch {
                board.cv.wait(&mut g);
            }
        }
        read(&g)
    }
}

struct ThreadSendHandle;

impl SendHandle for ThreadSendHandle {
    fn test(&mut self) -> bool {
        true
    }
    fn wait(&mut self) {}
}

struct ThreadRecvHandle {
    cell: SlotCell,
    src: Option<Rank>,
    max_len: usize,
    done: bool,
}

impl ThreadRecvHandle {
    fn take(&mut self, slot: &mut Slot) -> Option<Message> {
        let pos = match self.src {
            None => {
                if slot.q.is_empty() {
                    return None;
                }
                0
            }
            Some(want) => slot.q.iter().position(|(src, _)| *src == want)?,
        };
        let (src, mut data) = slot.q.remove(pos).expect("position just found");
        data.truncate(self.max_len);
        self.done = true;
        Some(Message { src, data })
    }
}

impl RecvHandle for ThreadRecvHandle {
    fn test(&mut self) -> Option<Message> {
        assert!(!self.done, "receive handle already completed");
        let cell = self.cell.clone();
        let (lock, _cv) = &*cell;
        let mut slot = lock.lock();
        self.take(&mut slot)
    }

    fn wait(&mut self) -> Message {
        assert!(!self.done, "receive handle already completed");
        let cell = self.cell.clone();
        let (lock, cv) = &*cell;
        let mut slot = lock.lock();
        loop {
            if let Some(msg) = self.take(&mut slot) {
                return msg;
            }
            cv.wait(&mut slot);
        }
    }
}

impl Transport for ThreadComm {
    fn isend(&self, peer: Rank, tag: u16, buf: &[u8]) -> Box<dyn SendHandle> {
        let cell = self.group.slot(peer, tag);
        let (lock, cv) = &*cell;
        {
            let mut slot = lock.lock();
            slot.q.push_back((self.rank, buf.to_vec()));
        }
        cv.notify_all();
        Box::new(ThreadSendHandle)
    }

    fn irecv(&self, peer: Option<Rank>, tag: u16, max_len: usize) -> Box<dyn RecvHandle> {
        Box::new(ThreadRecvHandle {
            cell: self.group.slot(self.rank, tag),
            src: peer,
            max_len,
            done: false,
        })
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn barrier(&self) {
        self.collective(|_| {}, |_| {}, |_| ());
    }

    fn allreduce_f64(&self, vals: &mut [f64], op: ReduceOp) {
        let mine = vals.to_vec();
        let result = self.collective(
            |g| {
                if g.acc_f.is_empty() {
                    g.acc_f = mine.clone();
                } else {
                    for (a, b) in g.acc_f.iter_mut().zip(mine.iter()) {
                        *a = match op {
                            ReduceOp::Sum => *a + *b,
                            ReduceOp::Max => a.max(*b),
                            ReduceOp::Min => a.min(*b),
                        };
                    }
                }
            },
            |g| {
                g.ready_f = std::mem::take(&mut g.acc_f);
            },
            |g| g.ready_f.clone(),
        );
        vals.copy_from_slice(&result);
    }

    fn allreduce_u64(&self, vals: &mut [u64], op: ReduceOp) {
        let mine = vals.to_vec();
        let result = self.collective(
            |g| {
                if g.acc_u.is_empty() {
                    g.acc_u = mine.clone();
                } else {
                    for (a, b) in g.acc_u.iter_mut().zip(mine.iter()) {
                        *a = match op {
                            ReduceOp::Sum => *a + *b,
                            ReduceOp::Max => (*a).max(*b),
                            ReduceOp::Min => (*a).min(*b),
                        };
                    }
                }
            },
            |g| {
                g.ready_u = std::mem::take(&mut g.acc_u);
            },
            |g| g.ready_u.clone(),
        );
        vals.copy_from_slice(&result);
    }

    fn gather_u64(&self, vals: &[u64]) -> Option<Vec<u64>> {
        let size = self.group.size;
        let rank = self.rank;
        let mine = vals.to_vec();
        let result = self.collective(
            move |g| {
                if g.gathered.len() != size {
                    g.gathered = vec![None; size];
                }
                g.gathered[rank] = Some(mine);
            },
            |g| {
                let mut all = Vec::new();
                for part in g.gathered.iter_mut() {
                    all.extend(part.take().expect("every rank contributed"));
                }
                g.ready_gather = all;
            },
            |g| g.ready_gather.clone(),
        );
        if self.rank == 0 {
            Some(result)
        } else {
            None
        }
    }
}

// --- MPI backend ---

#[cfg(feature = "mpi")]
mod mpi_backend {
    use super::*;
    use core::ptr::NonNull;
    use mpi::collective::{CommunicatorCollectives, Root, SystemOperation};
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::request::StaticScope;
    use mpi::topology::{Communicator, SimpleCommunicator};
    use mpi::traits::Equivalence;
    use mpi::Threading;

    /// Transport over MPI; initializes the environment with full thread
    /// support for the messaging I/O thread.
    pub struct MpiComm {
        _universe: Universe,
        world: SimpleCommunicator,
        rank: Rank,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        fn default() -> Self {
            let (universe, threading) =
                mpi::initialize_with_threading(Threading::Multiple).expect("MPI init failed");
            assert_eq!(
                threading,
                Threading::Multiple,
                "MPI library does not support MPI_THREAD_MULTIPLE"
            );
            let world = universe.world();
            let rank = world.rank() as Rank;
            let size = world.size() as usize;
            Self {
                _universe: universe,
                world,
                rank,
                size,
            }
        }
    }

    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    unsafe impl Send for MpiSendHandle {}

    impl MpiSendHandle {
        fn release(&mut self) {
            if let Some(ptr) = self.buf.take() {
                unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            }
        }
    }

    impl SendHandle for MpiSendHandle {
        fn test(&mut self) -> bool {
            match self.req.take() {
                None => true,
                Some(req) => match req.test() {
                    Ok(_) => {
                        self.release();
                        true
                    }
                    Err(req) => {
                        self.req = Some(req);
                        false
                    }
                },
            }
        }

        fn wait(&mut self) {
            if let Some(req) = self.req.take() {
                req.wait();
                self.release();
            }
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            self.wait();
        }
    }

    pub struct MpiRecvHandle {
        req: Option<mpi::request::Request<'static, [u8], StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    unsafe impl Send for MpiRecvHandle {}

    impl MpiRecvHandle {
        fn finish(&mut self, status: mpi::point_to_point::Status) -> Message {
            let ptr = self.buf.take().expect("receive buffer missing");
            let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
            let mut data = Vec::from(boxed);
            let count = status.count(u8::equivalent_datatype()) as usize;
            data.truncate(count);
            Message {
                src: status.source_rank() as Rank,
                data,
            }
        }
    }

    impl RecvHandle for MpiRecvHandle {
        fn test(&mut self) -> Option<Message> {
            match self.req.take() {
                None => None,
                Some(req) => match req.test() {
                    Ok(status) => Some(self.finish(status)),
                    Err(req) => {
                        self.req = Some(req);
                        None
                    }
                },
            }
        }

        fn wait(&mut self) -> Message {
            let req = self.req.take().expect("receive already completed");
            let status = req.wait();
            self.finish(status)
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(req) = self.req.take() {
                let _ = req.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe { drop(Box::from_raw(ptr.as_ptr())) };
            }
        }
    }

    impl Transport for MpiComm {
        fn isend(&self, peer: Rank, tag: u16, buf: &[u8]) -> Box<dyn SendHandle> {
            let boxed = buf.to_vec().into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &'static [u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, tag as i32);
            Box::new(MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            })
        }

        fn irecv(&self, peer: Option<Rank>, tag: u16, max_len: usize) -> Box<dyn RecvHandle> {
            let boxed = vec![0u8; max_len].into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &'static mut [u8] = unsafe { &mut *raw };
            let req = match peer {
                Some(p) => self
                    .world
                    .process_at_rank(p as i32)
                    .immediate_receive_into_with_tag(StaticScope, slice, tag as i32),
                None => self
                    .world
                    .any_process()
                    .immediate_receive_into_with_tag(StaticScope, slice, tag as i32),
            };
            Box::new(MpiRecvHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            })
        }

        fn rank(&self) -> Rank {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn allreduce_f64(&self, vals: &mut [f64], op: ReduceOp) {
            let mine = vals.to_vec();
            let sysop = match op {
                ReduceOp::Sum => SystemOperation::sum(),
                ReduceOp::Max => SystemOperation::max(),
                ReduceOp::Min => SystemOperation::min(),
            };
            self.world.all_reduce_into(&mine[..], vals, sysop);
        }

        fn allreduce_u64(&self, vals: &mut [u64], op: ReduceOp) {
            let mine = vals.to_vec();
            let sysop = match op {
                ReduceOp::Sum => SystemOperation::sum(),
                ReduceOp::Max => SystemOperation::max(),
                ReduceOp::Min => SystemOperation::min(),
            };
            self.world.all_reduce_into(&mine[..], vals, sysop);
        }

        fn gather_u64(&self, vals: &[u64]) -> Option<Vec<u64>> {
            let root = self.world.process_at_rank(0);
            if self.rank == 0 {
                let mut all = vec![0u64; vals.len() * self.size];
                root.gather_into_root(vals, &mut all[..]);
                Some(all)
            } else {
                root.gather_into(vals);
                None
            }
        }
    }
}

#[cfg(feature = "mpi")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn mailbox_ranks_exchange_messages() {
        let comms = ThreadComm::group(2);
        let mut it = comms.into_iter();
        let c0 = it.next().unwrap();
        let c1 = it.next().unwrap();

        let sender = thread::spawn(move || {
            c0.isend(1, 7, b"hello").wait();
            c0.barrier();
        });
        let mut recv = c1.irecv(Some(0), 7, 16);
        let msg = recv.wait();
        assert_eq!(msg.src, 0);
        assert_eq!(&msg.data, b"hello");
        c1.barrier();
        sender.join().unwrap();
    }

    #[test]
    fn collectives_reduce_across_ranks() {
        let comms = ThreadComm::group(3);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let mut v = [c.rank() as f64 + 1.0];
                    c.allreduce_f64(&mut v, ReduceOp::Sum);
                    assert_eq!(v[0], 6.0);
                    let mut m = [c.rank() as u64];
                    c.allreduce_u64(&mut m, ReduceOp::Max);
                    assert_eq!(m[0], 2);
                    let gathered = c.gather_u64(&[c.rank() as u64]);
                    if c.rank() == 0 {
                        assert_eq!(gathered.unwrap(), vec![0, 1, 2]);
                    } else {
                        assert!(gathered.is_none());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
