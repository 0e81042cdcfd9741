//! The distributed container holding the nodes of one tree.
//!
//! Nodes are sharded over processes by a pluggable process map; the local
//! partition is a bucket-locked hash map. Operations on remote nodes travel
//! as one-way active messages carrying a `NodeOp`; per-peer FIFO ordering
//! makes parent-registration-before-child-use safe. `find` returns a future
//! resolved by a reply message.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::constants::NBUCKET;
use crate::key::Key;
use crate::node::Node;
use crate::pmap::{ProcessMap, Rank};
use crate::runtime::Future;
use crate::tensor::{CoeffTensor, TreeScalar};
use crate::world::{World, WorldObject};

/// One-way operations a container accepts for a node it owns.
#[derive(Serialize, Deserialize)]
pub enum NodeOp<T, const D: usize> {
    /// Store a node unconditionally.
    Replace {
        /// Target key.
        key: Key<D>,
        /// New node value.
        node: Node<T>,
    },
    /// Accumulate coefficients, creating the node if absent and registering
    /// a fresh leaf with its parent.
    Accumulate {
        /// Target key.
        key: Key<D>,
        /// Coefficients to add.
        coeff: CoeffTensor<T>,
    },
    /// `node <- alpha*node + beta*other` with child flags merged.
    GaxpyInplace {
        /// Target key.
        key: Key<D>,
        /// Scale on the resident node.
        alpha: T,
        /// Incoming node.
        node: Node<T>,
        /// Scale on the incoming node.
        beta: T,
    },
    /// Mark the node interior, creating it if needed and walking up until
    /// an ancestor already connected to the tree is found.
    SetHasChildrenRecursive {
        /// Target key.
        key: Key<D>,
    },
    /// Store a subtree norm.
    SetNormTree {
        /// Target key.
        key: Key<D>,
        /// Cached norm value.
        norm: f64,
    },
    /// Delete the node if present.
    Erase {
        /// Target key.
        key: Key<D>,
    },
    /// Ask for a copy of the node; answered with a reply message carrying
    /// `Option<Node<T>>`.
    FindRequest {
        /// Target key.
        key: Key<D>,
        /// Reply token at the requesting rank.
        token: u64,
    },
}

/// Sharded hash container keyed by tree node identifier.
pub struct NodeContainer<T: TreeScalar, const D: usize> {
    world: Arc<World>,
    pmap: Arc<dyn ProcessMap<D>>,
    buckets: Vec<Mutex<HashMap<Key<D>, Node<T>>>>,
    id: OnceCell<u64>,
}

impl<T: TreeScalar, const D: usize> NodeContainer<T, D> {
    /// Create and register the container; collective so that the object id
    /// agrees on every rank. `process_pending` must be called once local
    /// construction is complete.
    pub fn new(world: Arc<World>, pmap: Arc<dyn ProcessMap<D>>) -> Arc<Self> {
        let container = Arc::new(Self {
            world: world.clone(),
            pmap,
            buckets: (0..NBUCKET).map(|_| Mutex::new(HashMap::new())).collect(),
            id: OnceCell::new(),
        });
        let id = world.register_object(container.clone());
        container.id.set(id).expect("container registered once");
        container
    }

    /// Release messages that arrived before registration completed.
    pub fn process_pending(&self) {
        self.world.process_pending(*self.id.get().expect("registered"));
    }

    /// The world this container lives in.
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// The process map.
    pub fn pmap(&self) -> &Arc<dyn ProcessMap<D>> {
        &self.pmap
    }

    /// Owning rank of `key`.
    pub fn owner(&self, key: &Key<D>) -> Rank {
        self.pmap.owner(key)
    }

    /// True if `key` lives on this rank.
    pub fn is_local(&self, key: &Key<D>) -> bool {
        self.owner(key) == self.world.rank()
    }

    fn bucket(&self, key: &Key<D>) -> &Mutex<HashMap<Key<D>, Node<T>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % NBUCKET]
    }

    /// Copy of the local node, if present. The key must be local.
    pub fn get_local(&self, key: &Key<D>) -> Option<Node<T>> {
        debug_assert!(self.is_local(key), "get_local on remote key");
        self.bucket(key).lock().get(key).cloned()
    }

    /// True if the local shard holds `key`.
    pub fn probe_local(&self, key: &Key<D>) -> bool {
        self.bucket(key).lock().contains_key(key)
    }

    /// Run `f` on the local node under the bucket lock, creating a default
    /// node if absent. `f` must not reenter the container.
    pub fn with_local_mut<R>(&self, key: &Key<D>, f: impl FnOnce(&mut Node<T>) -> R) -> R {
        debug_assert!(self.is_local(key), "with_local_mut on remote key");
        let mut bucket = self.bucket(key).lock();
        f(bucket.entry(*key).or_default())
    }

    /// Run `f` on the local node if it exists.
    pub fn with_existing_mut<R>(
        &self,
        key: &Key<D>,
        f: impl FnOnce(&mut Node<T>) -> R,
    ) -> Option<R> {
        let mut bucket = self.bucket(key).lock();
        bucket.get_mut(key).map(f)
    }

    /// Store `node` under `key`, locally or through a message to the owner.
    pub fn replace(&self, key: Key<D>, node: Node<T>) {
        if self.is_local(&key) {
            self.bucket(&key).lock().insert(key, node);
        } else {
            self.send_op(NodeOp::Replace { key, node });
        }
    }

    /// Remove `key`, locally or remotely.
    pub fn erase(&self, key: Key<D>) {
        if self.is_local(&key) {
            self.bucket(&key).lock().remove(&key);
        } else {
            self.send_op(NodeOp::Erase { key });
        }
    }

    /// Fire-and-forget operation on the owner of its key.
    pub fn send_op(&self, op: NodeOp<T, D>) {
        let key = *op.key();
        if self.is_local(&key) {
            self.apply_op(self.world.rank(), op);
        } else {
            let bytes = bincode::serialize(&op).expect("NodeOp encodes");
            self.world
                .send_to_object(self.owner(&key), *self.id.get().expect("registered"), true, &bytes);
        }
    }

    /// Future of a copy of the node under `key`, wherever it lives.
    pub fn find(&self, key: &Key<D>) -> Future<Option<Node<T>>> {
        if self.is_local(key) {
            Future::ready(self.get_local(key))
        } else {
            let (token, future) = self.world.expect_reply(|bytes| {
                bincode::deserialize::<Option<Node<T>>>(&bytes).expect("find reply decodes")
            });
            let op: NodeOp<T, D> = NodeOp::FindRequest { key: *key, token };
            let bytes = bincode::serialize(&op).expect("NodeOp encodes");
            self.world
                .send_to_object(self.owner(key), *self.id.get().expect("registered"), true, &bytes);
            future
        }
    }

    /// Apply `op` to the local shard; `src` is the requesting rank for
    /// operations that reply.
    pub fn apply_op(&self, src: Rank, op: NodeOp<T, D>) {
        match op {
            NodeOp::Replace { key, node } => {
                self.bucket(&key).lock().insert(key, node);
            }
            NodeOp::Accumulate { key, coeff } => {
                let fresh_leaf = self.with_local_mut(&key, |node| node.accumulate(&coeff));
                if fresh_leaf && key.level() > 0 {
                    self.send_op(NodeOp::SetHasChildrenRecursive { key: key.parent() });
                }
            }
            NodeOp::GaxpyInplace {
                key,
                alpha,
                node,
                beta,
            } => {
                self.with_local_mut(&key, |mine| mine.gaxpy_inplace(alpha, &node, beta));
            }
            NodeOp::SetHasChildrenRecursive { key } => {
                let continue_up = self.with_local_mut(&key, |node| {
                    let fresh =
                        !(node.has_children() || node.has_coeff() || key.level() == 0);
                    node.set_has_children(true);
                    fresh
                });
                if continue_up {
                    self.send_op(NodeOp::SetHasChildrenRecursive { key: key.parent() });
                }
            }
            NodeOp::SetNormTree { key, norm } => {
                self.with_local_mut(&key, |node| node.set_norm_tree(norm));
            }
            NodeOp::Erase { key } => {
                self.bucket(&key).lock().remove(&key);
            }
            NodeOp::FindRequest { key, token } => {
                // Replied from the pool: a large node could push the reply
                // onto the rendezvous path, which must not block the I/O
                // thread that services it.
                let node = self.get_local(&key);
                let world = self.world.clone();
                self.world
                    .taskq()
                    .add(crate::runtime::Priority::High, move || {
                        let bytes = bincode::serialize(&node).expect("find reply encodes");
                        world.send_reply(src, token, &bytes);
                    });
            }
        }
    }

    /// Keys of all local nodes, a snapshot.
    pub fn local_keys(&self) -> Vec<Key<D>> {
        let mut keys = Vec::new();
        for bucket in &self.buckets {
            keys.extend(bucket.lock().keys().copied());
        }
        keys
    }

    /// Visit every local node; `f` must not reenter the container.
    pub fn for_each_local(&self, mut f: impl FnMut(&Key<D>, &Node<T>)) {
        for bucket in &self.buckets {
            for (key, node) in bucket.lock().iter() {
                f(key, node);
            }
        }
    }

    /// Mutably visit every local node; `f` must not reenter the container.
    pub fn for_each_local_mut(&self, mut f: impl FnMut(&Key<D>, &mut Node<T>)) {
        for bucket in &self.buckets {
            for (key, node) in bucket.lock().iter_mut() {
                f(key, node);
            }
        }
    }

    /// Parallel reduction over the local shard, bucket by bucket.
    pub fn par_reduce_local<R: Send>(
        &self,
        identity: impl Fn() -> R + Sync,
        map: impl Fn(&Key<D>, &Node<T>) -> R + Sync,
        reduce: impl Fn(R, R) -> R + Sync,
    ) -> R {
        use rayon::prelude::*;
        self.buckets
            .par_iter()
            .map(|bucket| {
                let guard = bucket.lock();
                let mut acc = identity();
                for (key, node) in guard.iter() {
                    acc = reduce(acc, map(key, node));
                }
                acc
            })
            .reduce(&identity, &reduce)
    }

    /// Number of local nodes.
    pub fn size_local(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    /// Remove every local node.
    pub fn clear_local(&self) {
        for bucket in &self.buckets {
            bucket.lock().clear();
        }
    }
}

impl<T, const D: usize> NodeOp<T, D> {
    /// Key the operation addresses.
    pub fn key(&self) -> &Key<D> {
        match self {
            NodeOp::Replace { key, .. }
            | NodeOp::Accumulate { key, .. }
            | NodeOp::GaxpyInplace { key, .. }
            | NodeOp::SetHasChildrenRecursive { key }
            | NodeOp::SetNormTree { key, .. }
            | NodeOp::Erase { key }
            | NodeOp::FindRequest { key, .. } => key,
        }
    }
}

impl<T: TreeScalar, const D: usize> WorldObject for NodeContainer<T, D> {
    fn deliver(self: Arc<Self>, src: Rank, bytes: &[u8]) {
        let op: NodeOp<T, D> = bincode::deserialize(bytes).expect("NodeOp decodes");
        self.apply_op(src, op);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::NoComm;
    use crate::pmap::LevelHashMap;
    use crate::rmi::RmiConfig;

    fn local_container() -> Arc<NodeContainer<f64, 2>> {
        let world = World::with_config(Arc::new(NoComm), RmiConfig::default(), 1);
        NodeContainer::new(world, Arc::new(LevelHashMap::new(1)))
    }

    #[test]
    fn replace_find_erase_round_trip() {
        let c = local_container();
        c.process_pending();
        let key = Key::<2>::new(1, [0, 1]);
        let node = Node::with_coeff(CoeffTensor::from_parts(vec![2, 2], vec![1.0; 4]), false);
        c.replace(key, node);
        assert!(c.find(&key).get().unwrap().has_coeff());
        assert_eq!(c.size_local(), 1);
        c.erase(key);
        assert!(c.find(&key).get().is_none());
    }

    #[test]
    fn accumulate_registers_fresh_leaves_with_parents() {
        let c = local_container();
        let key = Key::<2>::new(2, [1, 1]);
        let coeff = CoeffTensor::from_parts(vec![2, 2], vec![1.0; 4]);
        c.send_op(NodeOp::Accumulate { key, coeff });
        // The chain of ancestors must now exist and be marked interior.
        let parent = key.parent();
        let root = parent.parent();
        assert!(c.get_local(&parent).unwrap().has_children());
        assert!(c.get_local(&root).unwrap().has_children());
        assert!(c.get_local(&key).unwrap().has_coeff());
    }

    #[test]
    fn par_reduce_counts_nodes() {
        let c = local_container();
        for l in 0..4 {
            c.replace(
                Key::<2>::new(2, [l, 0]),
                Node::with_coeff(CoeffTensor::zeros(2, 2), false),
            );
        }
        let count = c.par_reduce_local(|| 0usize, |_, _| 1usize, |a, b| a + b);
        assert_eq!(count, 4);
    }
}
