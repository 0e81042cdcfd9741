//! The per-process context tying transport, messaging, tasks and
//! distributed objects together.
//!
//! There is no process-wide singleton: every distributed structure holds an
//! `Arc<World>` and the messaging I/O thread lives inside it. Distributed
//! objects (trees, containers) are registered under sequential ids; because
//! construction is collective, the ids agree on every rank and serve as the
//! remote addressing scheme.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::comm::{ReduceOp, Transport};
use crate::constants::ENV_NUM_THREADS;
use crate::pmap::Rank;
use crate::rmi::{Handler, Rmi, RmiConfig, RmiMessage, RmiStatsSnapshot, ATTR_ORDERED, ATTR_UNORDERED};
use crate::runtime::{Future, TaskQueue};

/// Handler id for future-reply messages.
const REPLY_HANDLER: u16 = 1;
/// Handler id for messages addressed to a registered object.
const OBJECT_HANDLER: u16 = 2;

/// A distributed object able to receive remote method calls.
pub trait WorldObject: Send + Sync + 'static {
    /// Decode and apply one incoming message. Runs on the I/O thread; long
    /// work must be pushed onto the task queue.
    fn deliver(self: Arc<Self>, src: Rank, bytes: &[u8]);

    /// Type-erased handle for downcasting cross-references between
    /// registered objects.
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;
}

type ReplyCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

#[derive(Default)]
struct Registry {
    objects: Mutex<HashMap<u64, Arc<dyn WorldObject>>>,
    pending: Mutex<Vec<(u64, Rank, Vec<u8>)>>,
    replies: Mutex<HashMap<u64, ReplyCallback>>,
    next_object: AtomicU64,
    next_token: AtomicU64,
}

/// The context of one process of the computation.
pub struct World {
    rmi: Rmi,
    taskq: Arc<TaskQueue>,
    comm: Arc<dyn Transport>,
    registry: Arc<Registry>,
    rank: Rank,
    size: usize,
}

impl World {
    /// Context over the given transport with environment-driven sizing.
    pub fn new(comm: Arc<dyn Transport>) -> Arc<World> {
        Self::with_config(comm, RmiConfig::from_env(), default_nthreads())
    }

    /// Context with explicit messaging and pool sizing.
    pub fn with_config(
        comm: Arc<dyn Transport>,
        config: RmiConfig,
        nthreads: usize,
    ) -> Arc<World> {
        let taskq = Arc::new(TaskQueue::new(nthreads));
        let registry = Arc::new(Registry::default());

        let noop: Handler = Arc::new(|_msg: RmiMessage| {});
        let reply_registry = registry.clone();
        let reply: Handler = Arc::new(move |msg: RmiMessage| {
            let token = u64::from_le_bytes(msg.payload[..8].try_into().expect("short reply"));
            let cb = reply_registry
                .replies
                .lock()
                .remove(&token)
                .expect("reply for unknown token");
            cb(msg.payload[8..].to_vec());
        });
        let object_registry = registry.clone();
        let object: Handler = Arc::new(move |msg: RmiMessage| {
            let id = u64::from_le_bytes(msg.payload[..8].try_into().expect("short object msg"));
            let target = object_registry.objects.lock().get(&id).cloned();
            match target {
                Some(obj) => obj.deliver(msg.src, &msg.payload[8..]),
                None => {
                    // Arrived before the collective construction finished
                    // here; parked until process_pending.
                    object_registry
                        .pending
                        .lock()
                        .push((id, msg.src, msg.payload[8..].to_vec()));
                }
            }
        });

        let rmi = Rmi::new(comm.clone(), vec![noop, reply, object], config);
        let rank = comm.rank();
        let size = comm.size();
        Arc::new(World {
            rmi,
            taskq,
            comm,
            registry,
            rank,
            size,
        })
    }

    /// Rank of this process.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The task pool.
    pub fn taskq(&self) -> &Arc<TaskQueue> {
        &self.taskq
    }

    /// Messaging statistics.
    pub fn rmi_stats(&self) -> RmiStatsSnapshot {
        self.rmi.stats()
    }

    /// Register a distributed object; must be called collectively and in
    /// the same order on every rank so the ids agree.
    pub fn register_object(&self, obj: Arc<dyn WorldObject>) -> u64 {
        let id = self.registry.next_object.fetch_add(1, Ordering::AcqRel);
        self.registry.objects.lock().insert(id, obj);
        id
    }

    /// Remove an object from the registry.
    pub fn unregister_object(&self, id: u64) {
        self.registry.objects.lock().remove(&id);
    }

    /// Deliver messages that arrived for `id` before it was registered, in
    /// their original arrival order.
    pub fn process_pending(&self, id: u64) {
        let target = self.registry.objects.lock().get(&id).cloned();
        let Some(obj) = target else { return };
        let mut parked = Vec::new();
        {
            let mut pending = self.registry.pending.lock();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].0 == id {
                    parked.push(pending.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for (_, src, bytes) in parked {
            obj.clone().deliver(src, &bytes);
        }
    }

    /// Send `bytes` to the object `id` on `dest`; `ordered` requests
    /// per-peer FIFO delivery.
    pub fn send_to_object(&self, dest: Rank, id: u64, ordered: bool, bytes: &[u8]) {
        let mut payload = Vec::with_capacity(8 + bytes.len());
        payload.extend_from_slice(&id.to_le_bytes());
        payload.extend_from_slice(bytes);
        let attr = if ordered { ATTR_ORDERED } else { ATTR_UNORDERED };
        self.rmi.isend(dest, OBJECT_HANDLER, attr, &payload);
    }

    /// Allocate a reply token and a future resolved when the reply arrives;
    /// `decode` turns the raw reply bytes into the value.
    pub fn expect_reply<R: Clone + Send + 'static>(
        &self,
        decode: impl FnOnce(Vec<u8>) -> R + Send + 'static,
    ) -> (u64, Future<R>) {
        let future = Future::new();
        let token = self.register_reply(&future, decode);
        (token, future)
    }

    /// Bind an existing future to a fresh reply token.
    pub fn register_reply<R: Clone + Send + 'static>(
        &self,
        future: &Future<R>,
        decode: impl FnOnce(Vec<u8>) -> R + Send + 'static,
    ) -> u64 {
        let token = self.registry.next_token.fetch_add(1, Ordering::AcqRel);
        let f2 = future.clone();
        self.registry
            .replies
            .lock()
            .insert(token, Box::new(move |bytes| f2.set(decode(bytes))));
        token
    }

    /// Downcast a registered object to its concrete type.
    pub fn object_as<O: WorldObject>(&self, id: u64) -> Option<Arc<O>> {
        let obj = self.registry.objects.lock().get(&id).cloned()?;
        obj.as_any().downcast::<O>().ok()
    }

    /// Send the bytes answering `token` back to `dest`.
    pub fn send_reply(&self, dest: Rank, token: u64, bytes: &[u8]) {
        let mut payload = Vec::with_capacity(8 + bytes.len());
        payload.extend_from_slice(&token.to_le_bytes());
        payload.extend_from_slice(bytes);
        self.rmi.isend(dest, REPLY_HANDLER, ATTR_UNORDERED, &payload);
    }

    /// Global operations.
    pub fn gop(&self) -> GlobalOps<'_> {
        GlobalOps { world: self }
    }
}

fn default_nthreads() -> usize {
    if let Ok(raw) = std::env::var(ENV_NUM_THREADS) {
        if let Ok(n) = raw.trim().parse::<usize>() {
            return n.max(1);
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2))
        .unwrap_or(1)
        .max(1)
}

/// Collectives over the whole world.
pub struct GlobalOps<'a> {
    world: &'a World,
}

impl GlobalOps<'_> {
    /// Synchronization barrier.
    pub fn barrier(&self) {
        self.world.comm.barrier();
    }

    /// Drain the task queue and in-flight messages everywhere, then
    /// barrier. This is the only point where global tree invariants are
    /// guaranteed to hold.
    pub fn fence(&self) {
        let world = self.world;
        if world.size == 1 {
            world.taskq.drain();
            world.comm.barrier();
            return;
        }
        // Double-counting termination detection: quiescent once the global
        // sent/received totals are equal and unchanged across two rounds.
        let mut prev: Option<[u64; 2]> = None;
        loop {
            world.taskq.drain();
            let stats = world.rmi.stats();
            let mut totals = [stats.nmsg_sent, stats.nmsg_recv];
            world.comm.allreduce_u64(&mut totals, ReduceOp::Sum);
            if totals[0] == totals[1] && prev == Some(totals) {
                break;
            }
            prev = Some(totals);
            std::thread::yield_now();
        }
        world.comm.barrier();
    }

    /// Global sum.
    pub fn sum_f64(&self, x: f64) -> f64 {
        let mut v = [x];
        self.world.comm.allreduce_f64(&mut v, ReduceOp::Sum);
        v[0]
    }

    /// Global elementwise sum over a slice.
    pub fn sum_f64s(&self, xs: &mut [f64]) {
        self.world.comm.allreduce_f64(xs, ReduceOp::Sum);
    }

    /// Global maximum.
    pub fn max_f64(&self, x: f64) -> f64 {
        let mut v = [x];
        self.world.comm.allreduce_f64(&mut v, ReduceOp::Max);
        v[0]
    }

    /// Global sum of an integer.
    pub fn sum_u64(&self, x: u64) -> u64 {
        let mut v = [x];
        self.world.comm.allreduce_u64(&mut v, ReduceOp::Sum);
        v[0]
    }

    /// Global maximum of an integer.
    pub fn max_u64(&self, x: u64) -> u64 {
        let mut v = [x];
        self.world.comm.allreduce_u64(&mut v, ReduceOp::Max);
        v[0]
    }

    /// Global minimum of an integer.
    pub fn min_u64(&self, x: u64) -> u64 {
        let mut v = [x];
        self.world.comm.allreduce_u64(&mut v, ReduceOp::Min);
        v[0]
    }

    /// Gather a slice from every rank to rank 0, unbounded in world size.
    pub fn gather_u64(&self, vals: &[u64]) -> Option<Vec<u64>> {
        self.world.comm.gather_u64(vals)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::NoComm;
    use crate::runtime::Priority;

    #[test]
    fn single_rank_fence_drains_tasks() {
        let world = World::with_config(Arc::new(NoComm), RmiConfig::default(), 2);
        let flag = Arc::new(AtomicU64::new(0));
        for _ in 0..32 {
            let f = flag.clone();
            world.taskq().add(Priority::Normal, move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        world.gop().fence();
        assert_eq!(flag.load(Ordering::SeqCst), 32);
        assert_eq!(world.gop().sum_f64(2.5), 2.5);
        assert_eq!(world.gop().sum_u64(7), 7);
    }

    #[test]
    fn object_ids_are_sequential() {
        struct Sink;
        impl WorldObject for Sink {
            fn deliver(self: Arc<Self>, _src: Rank, _bytes: &[u8]) {}
            fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
                self
            }
        }
        let world = World::with_config(Arc::new(NoComm), RmiConfig::default(), 1);
        let a = world.register_object(Arc::new(Sink));
        let b = world.register_object(Arc::new(Sink));
        assert_eq!(b, a + 1);
        world.unregister_object(a);
        world.process_pending(b);
    }
}
