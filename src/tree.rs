//! The adaptive function tree and its recursive algorithms.
//!
//! A `FunctionTree` is a shallow handle on the shared implementation; the
//! node data lives in a distributed container sharded by the process map.
//! Algorithms are trees of tasks; a fence re-establishes the global
//! invariants (connectivity, mode consistency, leaf sufficiency).

pub mod apply;
pub mod derivative;
pub mod multiply;
pub mod transform;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::container::NodeContainer;
use crate::factory::{BoundaryConds, Functor, TreeError, TreeFactory, TruncateMode};
use crate::key::Key;
use crate::node::Node;
use crate::pmap::Rank;
use crate::runtime::{Future, Priority};
use crate::tensor::{CoeffTensor, Mat, TreeScalar};
use crate::twoscale::{legendre_scaling_values, CommonData};
use crate::world::{World, WorldObject};

use self::apply::ApplyTime;

/// Shallow handle on a distributed function tree; clones share state.
pub struct FunctionTree<T: TreeScalar, const D: usize> {
    pub(crate) inner: Arc<TreeImpl<T, D>>,
}

impl<T: TreeScalar, const D: usize> Clone for FunctionTree<T, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct TreeImpl<T: TreeScalar, const D: usize> {
    pub(crate) world: Arc<World>,
    pub(crate) k: usize,
    pub(crate) thresh: f64,
    pub(crate) initial_level: u8,
    pub(crate) max_refine_level: u8,
    pub(crate) truncate_mode: TruncateMode,
    pub(crate) autorefine: bool,
    pub(crate) truncate_on_project: bool,
    pub(crate) nonstandard: AtomicBool,
    pub(crate) compressed: AtomicBool,
    pub(crate) cdata: CommonData<D>,
    pub(crate) functor: Option<Functor<T, D>>,
    pub(crate) coeffs: Arc<NodeContainer<T, D>>,
    pub(crate) bc: BoundaryConds<D>,
    pub(crate) apply_time: ApplyTime<D>,
    pub(crate) id: once_cell::sync::OnceCell<u64>,
}

/// Remote method calls between the shards of one tree.
#[derive(Serialize, Deserialize)]
pub(crate) enum TreeMsg<T, const D: usize> {
    ProjectRefineOp {
        key: Key<D>,
        refine: bool,
    },
    CompressSpawn {
        key: Key<D>,
        nonstandard: bool,
        keepleaves: bool,
        origin: u64,
        token: u64,
    },
    ReconstructOp {
        key: Key<D>,
        s: CoeffTensor<T>,
    },
    TruncateSpawn {
        key: Key<D>,
        tol: f64,
        origin: u64,
        token: u64,
    },
    NormTreeSpawn {
        key: Key<D>,
        origin: u64,
        token: u64,
    },
    RefineSpawn {
        key: Key<D>,
    },
    SockItToMe {
        key: Key<D>,
        origin: u64,
        token: u64,
    },
    Diff1 {
        f_id: u64,
        axis: u8,
        key: Key<D>,
        left: (Key<D>, CoeffTensor<T>),
        center: (Key<D>, CoeffTensor<T>),
        right: (Key<D>, CoeffTensor<T>),
    },
    Mul {
        left_id: u64,
        right_id: u64,
        key: Key<D>,
        lc: CoeffTensor<T>,
        rc: CoeffTensor<T>,
        tol: f64,
    },
    MulVec {
        left_id: u64,
        right_ids: Vec<u64>,
        result_ids: Vec<u64>,
        key: Key<D>,
        lc: CoeffTensor<T>,
        vrc: Vec<CoeffTensor<T>>,
        tol: f64,
    },
    Eval {
        x: Vec<f64>,
        key: Key<D>,
        origin: u64,
        token: u64,
    },
}

/// Where a recursive walk should deliver its answer.
pub(crate) enum Reply<R> {
    Local(Future<R>),
    Remote { rank: Rank, token: u64 },
}

impl<R: Serialize + Clone + Send + 'static> Reply<R> {
    pub(crate) fn resolve(self, world: &World, value: R) {
        match self {
            Reply::Local(future) => future.set(value),
            Reply::Remote { rank, token } => {
                let bytes = bincode::serialize(&value).expect("reply encodes");
                world.send_reply(rank, token, &bytes);
            }
        }
    }
}

/// Persisted form of a tree; the functor is deliberately omitted.
#[derive(Serialize, Deserialize)]
pub struct TreeSnapshot<T, const D: usize> {
    /// Wavelet order.
    pub k: usize,
    /// Screening threshold.
    pub thresh: f64,
    /// Initial refinement level.
    pub initial_level: u8,
    /// Refinement floor.
    pub max_refine_level: u8,
    /// Truncation policy code.
    pub truncate_mode: u8,
    /// Autorefine flag.
    pub autorefine: bool,
    /// Projection placement flag.
    pub truncate_on_project: bool,
    /// Non-standard compression flag.
    pub nonstandard: bool,
    /// Compression flag.
    pub compressed: bool,
    /// Boundary condition codes.
    pub bc: Vec<u8>,
    /// Local nodes.
    pub nodes: Vec<(Key<D>, Node<T>)>,
}

impl<T: TreeScalar, const D: usize> FunctionTree<T, D> {
    /// Build a tree from validated factory options.
    pub(crate) fn from_factory(factory: TreeFactory<T, D>) -> Self {
        let mut initial_level = factory.initial_level;
        if factory.refine {
            initial_level = initial_level.saturating_sub(1);
        }
        if !factory.empty && factory.functor.is_none() {
            initial_level = 1;
        }

        let world = factory.world;
        let pmap = factory.pmap.expect("factory supplies a pmap");
        let coeffs = NodeContainer::new(world.clone(), pmap);
        let tree = Arc::new(TreeImpl {
            world: world.clone(),
            k: factory.k,
            thresh: factory.thresh,
            initial_level,
            max_refine_level: factory.max_refine_level,
            truncate_mode: factory.truncate_mode,
            autorefine: factory.autorefine,
            truncate_on_project: factory.truncate_on_project,
            nonstandard: AtomicBool::new(false),
            compressed: AtomicBool::new(false),
            cdata: CommonData::new(factory.k),
            functor: factory.functor,
            coeffs,
            bc: factory.bc,
            apply_time: ApplyTime::new(),
            id: once_cell::sync::OnceCell::new(),
        });
        let id = world.register_object(tree.clone());
        tree.id.set(id).expect("tree registered once");

        if factory.empty {
            // No coefficients at all.
        } else if tree.functor.is_some() {
            tree.insert_zero_down_to_initial_level(&Key::root());
            for key in tree.coeffs.local_keys() {
                let Some(node) = tree.coeffs.get_local(&key) else { continue };
                if node.is_leaf() {
                    let t = tree.clone();
                    let refine = factory.refine;
                    tree.world
                        .taskq()
                        .add(Priority::Normal, move || t.project_refine_op(&key, refine));
                }
            }
        } else {
            // A zero-valued function.
            tree.insert_zero_down_to_initial_level(&Key::root());
        }

        tree.coeffs.process_pending();
        world.process_pending(id);
        if factory.fence && tree.functor.is_some() {
            world.gop().fence();
        }
        Self { inner: tree }
    }

    /// The world this tree lives in.
    pub fn world(&self) -> &Arc<World> {
        &self.inner.world
    }

    /// Wavelet order.
    pub fn k(&self) -> usize {
        self.inner.k
    }

    /// Screening threshold.
    pub fn thresh(&self) -> f64 {
        self.inner.thresh
    }

    /// True in compressed form.
    pub fn is_compressed(&self) -> bool {
        self.inner.is_compressed()
    }

    /// True when compress retained scaling coefficients everywhere.
    pub fn is_nonstandard(&self) -> bool {
        self.inner.nonstandard.load(Ordering::Acquire)
    }

    /// New empty tree sharing everything but the coefficients, optionally
    /// seeded with the zero function.
    pub fn empty_clone(&self, dozero: bool) -> Self {
        let src = &self.inner;
        let coeffs = NodeContainer::new(src.world.clone(), src.coeffs.pmap().clone());
        let tree = Arc::new(TreeImpl {
            world: src.world.clone(),
            k: src.k,
            thresh: src.thresh,
            initial_level: if dozero { 1 } else { src.initial_level },
            max_refine_level: src.max_refine_level,
            truncate_mode: src.truncate_mode,
            autorefine: src.autorefine,
            truncate_on_project: src.truncate_on_project,
            nonstandard: AtomicBool::new(src.nonstandard.load(Ordering::Acquire)),
            compressed: AtomicBool::new(src.compressed.load(Ordering::Acquire)),
            cdata: src.cdata.clone(),
            functor: None,
            coeffs,
            bc: src.bc,
            apply_time: ApplyTime::new(),
            id: once_cell::sync::OnceCell::new(),
        });
        let id = src.world.register_object(tree.clone());
        tree.id.set(id).expect("tree registered once");
        if dozero {
            tree.insert_zero_down_to_initial_level(&Key::root());
        }
        tree.coeffs.process_pending();
        src.world.process_pending(id);
        Self { inner: tree }
    }

    /// Copy every local node of `other` into this tree.
    pub fn copy_coeffs(&self, other: &Self, fence: bool) {
        other.inner.coeffs.for_each_local(|key, node| {
            self.inner.coeffs.replace(*key, node.clone());
        });
        self.inner
            .compressed
            .store(other.is_compressed(), Ordering::Release);
        self.inner
            .nonstandard
            .store(other.is_nonstandard(), Ordering::Release);
        if fence {
            self.inner.world.gop().fence();
        }
    }

    /// Deep copy with the same process map.
    pub fn deep_copy(&self, fence: bool) -> Self {
        let result = self.empty_clone(false);
        result.copy_coeffs(self, fence);
        result
    }

    /// Re-expand `other` (of possibly lower order) in this tree's basis.
    /// Both trees must be in reconstructed form.
    pub fn project_from<Q: TreeScalar + Into<T>>(
        &self,
        other: &FunctionTree<Q, D>,
        fence: bool,
    ) {
        let k_old = other.inner.k;
        assert!(
            k_old <= self.inner.k,
            "project_from requires a source of no higher order"
        );
        assert!(!other.is_compressed(), "project_from needs reconstructed input");
        let slices: Vec<crate::tensor::Slice> = (0..D)
            .map(|_| crate::tensor::Slice::new(0, k_old))
            .collect();
        other.inner.coeffs.for_each_local(|key, node| {
            if node.has_coeff() {
                let mut c = CoeffTensor::<T>::zeros(D, self.inner.k);
                let converted = CoeffTensor::from_parts(
                    node.coeff().shape().to_vec(),
                    node.coeff().data().iter().map(|&x| x.into()).collect(),
                );
                c.assign_patch(&slices, &converted);
                self.inner.coeffs.replace(*key, Node::with_coeff(c, false));
            } else {
                self.inner.coeffs.replace(*key, Node::interior());
            }
        });
        if fence {
            self.inner.world.gop().fence();
        }
    }

    /// `self <- alpha*self + beta*other`, node by node.
    pub fn gaxpy_inplace(&self, alpha: T, other: &Self, beta: T, fence: bool) {
        self.inner.gaxpy_inplace(alpha, &other.inner, beta);
        if fence {
            self.inner.world.gop().fence();
        }
    }

    /// `self <- self + alpha*left + beta*right` in compressed form, without
    /// assuming any shared distribution.
    pub fn gaxpy(&self, alpha: T, left: &Self, beta: T, right: &Self, fence: bool) {
        use crate::container::NodeOp;
        left.inner.coeffs.for_each_local(|key, node| {
            self.inner.coeffs.send_op(NodeOp::GaxpyInplace {
                key: *key,
                alpha: T::one(),
                node: node.clone(),
                beta: alpha,
            });
        });
        right.inner.coeffs.for_each_local(|key, node| {
            self.inner.coeffs.send_op(NodeOp::GaxpyInplace {
                key: *key,
                alpha: T::one(),
                node: node.clone(),
                beta,
            });
        });
        if fence {
            self.inner.world.gop().fence();
        }
    }

    /// In-place scale by a constant.
    pub fn scale_inplace(&self, q: T, fence: bool) {
        self.inner.coeffs.for_each_local_mut(|_, node| {
            if node.has_coeff() {
                node.coeff_mut().scale(q);
            }
        });
        if fence {
            self.inner.world.gop().fence();
        }
    }

    /// Out-of-place scale: `self <- q * other`.
    pub fn scale_oop(&self, q: T, other: &Self, fence: bool) {
        other.inner.coeffs.for_each_local(|key, node| {
            if node.has_coeff() {
                self.inner
                    .coeffs
                    .replace(*key, Node::with_coeff(node.coeff().scaled(q), node.has_children()));
            } else {
                self.inner.coeffs.replace(
                    *key,
                    if node.has_children() {
                        Node::interior()
                    } else {
                        Node::default()
                    },
                );
            }
        });
        self.inner
            .compressed
            .store(other.is_compressed(), Ordering::Release);
        if fence {
            self.inner.world.gop().fence();
        }
    }

    /// Add a constant to the function.
    ///
    /// In the scaling basis the properly scaled constant polynomial is
    /// added in every leaf; in the wavelet basis only the root scaling
    /// block changes.
    pub fn add_scalar_inplace(&self, t: T, fence: bool) {
        let tree = &self.inner;
        if self.is_compressed() {
            let root = Key::<D>::root();
            if tree.coeffs.is_local(&root) {
                tree.coeffs.with_existing_mut(&root, |node| {
                    if node.has_coeff() {
                        node.coeff_mut().data_mut()[0] += t;
                    }
                });
            }
        } else {
            tree.coeffs.for_each_local_mut(|key, node| {
                if node.has_coeff() && node.is_leaf() {
                    let scale = 0.5f64.powf(0.5 * D as f64 * key.level() as f64);
                    node.coeff_mut().data_mut()[0] += t.mul_real(scale);
                }
            });
        }
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Adaptive refinement pass using the autorefine square test.
    pub fn refine(&self, fence: bool) {
        let tree = &self.inner;
        let root = Key::<D>::root();
        if tree.coeffs.is_local(&root) {
            let t = tree.clone();
            tree.world
                .taskq()
                .add(Priority::High, move || t.refine_spawn(&root));
        }
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Squared L2 norm of the local shard.
    pub fn norm2sq_local(&self) -> f64 {
        self.inner.coeffs.par_reduce_local(
            || 0.0,
            |_, node| {
                if node.has_coeff() {
                    let n = node.coeff().normf();
                    n * n
                } else {
                    0.0
                }
            },
            |a, b| a + b,
        )
    }

    /// Squared L2 norm; collective.
    pub fn norm2sq(&self) -> f64 {
        self.inner.world.gop().sum_f64(self.norm2sq_local())
    }

    /// Inner product over co-located nodes; requires identical process
    /// maps. The conjugate is taken on `self`.
    pub fn inner_local(&self, other: &Self) -> T {
        debug_assert!(
            Arc::ptr_eq(self.inner.coeffs.pmap(), other.inner.coeffs.pmap()),
            "inner_local requires identical process maps"
        );
        let mut sum = T::zero();
        self.inner.coeffs.for_each_local(|key, fnode| {
            if fnode.has_coeff() {
                if let Some(gnode) = other.inner.coeffs.get_local(key) {
                    if gnode.has_coeff() {
                        assert_eq!(
                            fnode.coeff().dim0(),
                            gnode.coeff().dim0(),
                            "inner product between inconsistent representations"
                        );
                        sum += fnode.coeff().trace_conj(gnode.coeff());
                    }
                }
            }
        });
        sum
    }

    /// Inner product; collective.
    pub fn inner(&self, other: &Self) -> T {
        let local = self.inner_local(other);
        let mut parts = [local.re(), local.im()];
        self.inner.world.gop().sum_f64s(&mut parts);
        T::from_real(parts[0]) + T::from_real(parts[1]) * int_unit::<T>()
    }

    /// Integral of the function over the local boxes.
    pub fn trace_local(&self) -> T {
        let tree = &self.inner;
        let mut sum = T::zero();
        if self.is_compressed() {
            let root = Key::<D>::root();
            if tree.coeffs.is_local(&root) {
                if let Some(node) = tree.coeffs.get_local(&root) {
                    if node.has_coeff() {
                        sum = node.coeff().data()[0];
                    }
                }
            }
        } else {
            tree.coeffs.for_each_local(|key, node| {
                if node.has_coeff() && node.is_leaf() {
                    let scale = 0.5f64.powf(0.5 * D as f64 * key.level() as f64);
                    sum += node.coeff().data()[0].mul_real(scale);
                }
            });
        }
        sum
    }

    /// Integral of the function; collective.
    pub fn trace(&self) -> T {
        let local = self.trace_local();
        let mut parts = [local.re(), local.im()];
        self.inner.world.gop().sum_f64s(&mut parts);
        T::from_real(parts[0]) + T::from_real(parts[1]) * int_unit::<T>()
    }

    /// Number of stored coefficients; collective.
    pub fn size(&self) -> usize {
        let mut count = 0u64;
        self.inner.coeffs.for_each_local(|_, node| {
            if node.has_coeff() {
                count += 1;
            }
        });
        let per_node = if self.is_compressed() {
            (2 * self.inner.k).pow(D as u32)
        } else {
            self.inner.k.pow(D as u32)
        };
        (self.inner.world.gop().sum_u64(count) as usize) * per_node
    }

    /// Number of tree nodes; collective.
    pub fn tree_size(&self) -> usize {
        self.inner
            .world
            .gop()
            .sum_u64(self.inner.coeffs.size_local() as u64) as usize
    }

    /// Deepest refinement level present; collective.
    pub fn max_depth(&self) -> u8 {
        let mut local = 0u64;
        self.inner.coeffs.for_each_local(|key, _| {
            local = local.max(key.level() as u64);
        });
        self.inner.world.gop().max_u64(local) as u8
    }

    /// Largest per-rank node count; collective.
    pub fn max_nodes(&self) -> usize {
        self.inner
            .world
            .gop()
            .max_u64(self.inner.coeffs.size_local() as u64) as usize
    }

    /// Smallest per-rank node count; collective.
    pub fn min_nodes(&self) -> usize {
        self.inner
            .world
            .gop()
            .min_u64(self.inner.coeffs.size_local() as u64) as usize
    }

    /// Evaluate at a point in simulation coordinates; the walk may cross
    /// ranks. Requires reconstructed form.
    pub fn eval(&self, x: [f64; D]) -> Future<T> {
        assert!(!self.is_compressed(), "eval requires reconstructed form");
        let future = Future::new();
        self.inner
            .eval_task(x, Key::root(), Reply::Local(future.clone()));
        future
    }

    /// Squared L2 error against `functor` over the local shard, measured
    /// with a quadrature rule one order higher.
    pub fn errsq_local(&self, functor: &Functor<T, D>) -> f64 {
        self.inner.errsq_local(functor)
    }

    /// L2 error against `functor`; collective.
    pub fn err(&self, functor: &Functor<T, D>) -> f64 {
        self.inner
            .world
            .gop()
            .sum_f64(self.errsq_local(functor))
            .sqrt()
    }

    /// Walk the tree checking connectivity and mode consistency; fatal on
    /// breakage. Collective.
    pub fn verify_tree(&self) {
        let tree = &self.inner;
        tree.world.gop().fence();
        let compressed = self.is_compressed();
        let k = tree.k;
        let mut parent_checks: Vec<(Key<D>, Future<Option<Node<T>>>)> = Vec::new();
        tree.coeffs.for_each_local(|key, node| {
            if node.has_coeff() {
                let dim = node.coeff().dim0();
                if compressed {
                    assert!(
                        dim == 2 * k,
                        "compressed node {key} has bad coefficient size {dim}"
                    );
                } else {
                    assert!(
                        dim == k && node.is_leaf(),
                        "reconstructed tree holds coefficients at interior node {key}"
                    );
                }
            }
        });
        for key in tree.coeffs.local_keys() {
            if key.level() > 0 {
                let parent = key.parent();
                parent_checks.push((key, tree.coeffs.find(&parent)));
            }
        }
        for (key, future) in parent_checks {
            let parent = future.get();
            let parent = parent
                .unwrap_or_else(|| panic!("node {key} has no parent on its owner"));
            assert!(
                parent.has_children(),
                "parent of {key} is not marked interior"
            );
        }
        tree.world.gop().fence();
    }

    /// Gather the scaling coefficients of level `n` from non-standard form
    /// into a replicated dense tensor.
    ///
    /// With `q = 0` the layout is `[2^n; D] x [k; D]`, translation-major.
    /// With `q > 0` (a power of two dividing `2^n`) each translation
    /// component splits as `l = m*q + r` and the layout is
    /// `[q; D] x [2^n/q; D] x [k; D]`, remainder-major, so a length-`q`
    /// transform over the leading axes sees unit stride.
    pub fn coeffs_at_level(&self, n: u8, q: usize) -> CoeffTensor<T> {
        let tree = &self.inner;
        assert!(
            self.is_compressed() && self.is_nonstandard(),
            "coeffs_at_level requires non-standard compressed form"
        );
        let nn = 1usize << n;
        let k = tree.k;
        let m = if q > 0 {
            assert!(q.is_power_of_two() && nn % q == 0, "q must divide 2^n");
            nn / q
        } else {
            0
        };
        let mut shape = Vec::with_capacity(3 * D);
        if q == 0 {
            shape.extend(std::iter::repeat(nn).take(D));
        } else {
            shape.extend(std::iter::repeat(q).take(D));
            shape.extend(std::iter::repeat(m).take(D));
        }
        shape.extend(std::iter::repeat(k).take(D));
        let total: usize = shape.iter().product();
        let mut out = CoeffTensor::<T>::from_parts(shape, vec![T::zero(); total]);

        let mut t = [0i64; D];
        let mut done = false;
        while !done {
            let key = Key::<D>::new(n, t);
            if tree.coeffs.is_local(&key) {
                let block = tree.block_for_gather(&key);
                // Flat offset of this translation in the chosen layout.
                let mut box_index = 0usize;
                if q == 0 {
                    for &l in t.iter() {
                        box_index = box_index * nn + l as usize;
                    }
                } else {
                    for &l in t.iter() {
                        box_index = box_index * q + (l as usize % q);
                    }
                    for &l in t.iter() {
                        box_index = box_index * m + (l as usize / q);
                    }
                }
                let kd = k.pow(D as u32);
                out.data_mut()[box_index * kd..(box_index + 1) * kd]
                    .copy_from_slice(block.data());
            }
            done = true;
            for d in (0..D).rev() {
                t[d] += 1;
                if (t[d] as usize) < nn {
                    done = false;
                    break;
                }
                t[d] = 0;
            }
        }

        tree.world.gop().fence();
        let floats = bytemuck::cast_slice_mut::<T, f64>(out.data_mut());
        tree.world.gop().sum_f64s(floats);
        out
    }

    /// Per-rank leaf/interior counts via an unbounded gather; rank 0
    /// prints one line per rank.
    pub fn print_info(&self) {
        let mut nleaf = 0u64;
        let mut ninterior = 0u64;
        self.inner.coeffs.for_each_local(|_, node| {
            if node.is_leaf() {
                nleaf += 1;
            } else {
                ninterior += 1;
            }
        });
        if let Some(all) = self.inner.world.gop().gather_u64(&[nleaf, ninterior]) {
            for (rank, pair) in all.chunks(2).enumerate() {
                println!("load: {:5} {:8} {:8}", rank, pair[0], pair[1]);
            }
        }
        self.inner.world.gop().barrier();
    }

    /// Render the locally owned part of the tree, depth first.
    pub fn tree_to_string(&self, max_level: u8) -> String {
        use itertools::Itertools;
        let mut out = String::new();
        let keys = self.inner.coeffs.local_keys().into_iter().sorted();
        for key in keys {
            if key.level() > max_level {
                continue;
            }
            let node = self.inner.coeffs.get_local(&key).expect("key just listed");
            let norm = if node.has_coeff() {
                node.coeff().normf()
            } else {
                0.0
            };
            for _ in 0..key.level() {
                out.push_str("  ");
            }
            out.push_str(&format!(
                "{key} ({}, {}, {:.2e})\n",
                node.has_coeff(),
                node.has_children(),
                norm
            ));
        }
        out
    }

    /// Snapshot of the local shard and settings for persistence.
    pub fn store(&self) -> TreeSnapshot<T, D> {
        let mut nodes = Vec::new();
        self.inner.coeffs.for_each_local(|key, node| {
            nodes.push((*key, node.clone()));
        });
        TreeSnapshot {
            k: self.inner.k,
            thresh: self.inner.thresh,
            initial_level: self.inner.initial_level,
            max_refine_level: self.inner.max_refine_level,
            truncate_mode: self.inner.truncate_mode.code(),
            autorefine: self.inner.autorefine,
            truncate_on_project: self.inner.truncate_on_project,
            nonstandard: self.is_nonstandard(),
            compressed: self.is_compressed(),
            bc: self.inner.bc.codes(),
            nodes,
        }
    }

    /// Restore nodes and mode flags from a snapshot. The wavelet order must
    /// match; collective.
    pub fn load(&self, snapshot: TreeSnapshot<T, D>) -> Result<(), TreeError> {
        if snapshot.k != self.inner.k {
            return Err(TreeError::OrderMismatch {
                found: snapshot.k,
                expected: self.inner.k,
            });
        }
        self.inner
            .compressed
            .store(snapshot.compressed, Ordering::Release);
        self.inner
            .nonstandard
            .store(snapshot.nonstandard, Ordering::Release);
        for (key, node) in snapshot.nodes {
            self.inner.coeffs.replace(key, node);
        }
        self.inner.world.gop().fence();
        Ok(())
    }

    /// The underlying container's local node count.
    pub fn local_size(&self) -> usize {
        self.inner.coeffs.size_local()
    }

    /// Visit every locally owned node.
    pub fn for_each_local_node(&self, f: impl FnMut(&Key<D>, &Node<T>)) {
        self.inner.coeffs.for_each_local(f)
    }

    /// Future of a copy of the node under `key`, wherever it lives.
    pub fn find_node(&self, key: &Key<D>) -> Future<Option<Node<T>>> {
        self.inner.coeffs.find(key)
    }

    /// The process map sharding this tree.
    pub fn process_map(&self) -> Arc<dyn crate::pmap::ProcessMap<D>> {
        self.inner.coeffs.pmap().clone()
    }

    /// Neighbor of `key` along `axis`, mediated by this tree's boundary
    /// conditions; invalid when a zero boundary is crossed.
    pub fn neighbor_key(&self, key: &Key<D>, axis: usize, step: i64) -> Key<D> {
        self.inner.neighbor(key, axis, step)
    }
}

/// `i` for complex element types, zero-imaginary one otherwise; used to
/// reassemble reduced complex values from their parts.
fn int_unit<T: TreeScalar>() -> T {
    let mut val = T::zero();
    let floats = bytemuck::cast_slice_mut::<T, f64>(std::slice::from_mut(&mut val));
    if floats.len() == 2 {
        floats[1] = 1.0;
    }
    val
}

impl<T: TreeScalar, const D: usize> TreeImpl<T, D> {
    pub(crate) fn obj_id(&self) -> u64 {
        *self.id.get().expect("tree registered")
    }

    pub(crate) fn is_compressed(&self) -> bool {
        self.compressed.load(Ordering::Acquire)
    }

    pub(crate) fn send_tree_msg(&self, dest: Rank, msg: &TreeMsg<T, D>) {
        let bytes = bincode::serialize(msg).expect("TreeMsg encodes");
        self.world.send_to_object(dest, self.obj_id(), true, &bytes);
    }

    /// Threshold for discarding wavelet content at `key`.
    pub(crate) fn truncate_tol(&self, tol: f64, key: &Key<D>) -> f64 {
        // The minimum cell width; the domain is the unit hypercube.
        let l = 1.0f64;
        match self.truncate_mode {
            TruncateMode::Absolute => tol,
            TruncateMode::CellWidth => {
                tol * (0.5f64.powi(key.level() as i32) * l).min(1.0)
            }
            TruncateMode::CellWidthSquared => {
                tol * (0.25f64.powi(key.level() as i32) * l * l).min(1.0)
            }
        }
    }

    /// Convert child scaling blocks at level `n+1` into scaling + wavelet
    /// blocks at level `n`.
    pub(crate) fn filter(&self, s: &CoeffTensor<T>) -> CoeffTensor<T> {
        s.transform(&self.cdata.ts.hg_t)
    }

    /// Inverse of `filter`.
    pub(crate) fn unfilter(&self, d: &CoeffTensor<T>) -> CoeffTensor<T> {
        d.transform(&self.cdata.ts.hg)
    }

    /// Seed zero nodes down to the initial level; no communication, every
    /// rank inserts only the keys it owns.
    pub(crate) fn insert_zero_down_to_initial_level(&self, key: &Key<D>) {
        let interior = key.level() < self.initial_level;
        if self.coeffs.is_local(key) {
            let node = if self.is_compressed() {
                Node::with_coeff(CoeffTensor::zeros(D, 2 * self.k), interior)
            } else if interior {
                Node::interior()
            } else {
                Node::with_coeff(CoeffTensor::zeros(D, self.k), false)
            };
            self.coeffs.replace(*key, node);
        }
        if interior {
            for child in key.children() {
                self.insert_zero_down_to_initial_level(&child);
            }
        }
    }

    /// Functor values on the quadrature grid of `key`'s box.
    pub(crate) fn fcube(&self, key: &Key<D>) -> CoeffTensor<T> {
        let functor = self
            .functor
            .as_ref()
            .expect("projection requires a functor");
        let npt = self.cdata.ts.npt;
        let quad_x = &self.cdata.ts.quad_x;
        let cell = 0.5f64.powi(key.level() as i32);
        let l = key.translation();
        let total = npt.pow(D as u32);
        let mut data = Vec::with_capacity(total);
        let mut idx = [0usize; D];
        for _ in 0..total {
            let mut x = [0.0f64; D];
            for d in 0..D {
                x[d] = cell * (l[d] as f64 + quad_x[idx[d]]);
            }
            data.push(functor(&x));
            for d in (0..D).rev() {
                idx[d] += 1;
                if idx[d] < npt {
                    break;
                }
                idx[d] = 0;
            }
        }
        CoeffTensor::from_parts(vec![npt; D], data)
    }

    /// Scaling coefficients of the functor in `key`'s box.
    pub(crate) fn project_box(&self, key: &Key<D>) -> CoeffTensor<T> {
        let mut fval = self.fcube(key);
        let scale = 0.5f64.powf(0.5 * D as f64 * key.level() as f64);
        fval.scale(T::from_real(scale));
        fval.transform(&self.cdata.ts.quad_phiw)
    }

    /// Project this box, testing the child-level wavelet energy and
    /// recursing while it exceeds the truncation threshold.
    pub(crate) fn project_refine_op(self: &Arc<Self>, key: &Key<D>, refine: bool) {
        if refine && key.level() < self.max_refine_level {
            // Project the children, filter, and look at the wavelet half.
            let mut r = CoeffTensor::<T>::zeros(D, 2 * self.k);
            for child in key.children() {
                let patch = self.cdata.child_patch(&child);
                r.assign_patch(&patch, &self.project_box(&child));
            }
            let mut d = self.filter(&r);
            let s0 = if self.truncate_on_project {
                Some(d.patch(&self.cdata.s0))
            } else {
                None
            };
            d.zero_patch(&self.cdata.s0);
            if d.normf() < self.truncate_tol(self.thresh, key) {
                if let Some(s0) = s0 {
                    self.coeffs.replace(*key, Node::with_coeff(s0, false));
                } else {
                    self.coeffs.replace(*key, Node::interior());
                    for child in key.children() {
                        let patch = self.cdata.child_patch(&child);
                        self.coeffs
                            .replace(child, Node::with_coeff(r.patch(&patch), false));
                    }
                }
            } else {
                self.coeffs.replace(*key, Node::interior());
                for child in key.children() {
                    let owner = self.coeffs.owner(&child);
                    if owner == self.world.rank() {
                        let this = self.clone();
                        self.world.taskq().add(Priority::Normal, move || {
                            this.project_refine_op(&child, refine)
                        });
                    } else {
                        self.send_tree_msg(
                            owner,
                            &TreeMsg::ProjectRefineOp { key: child, refine },
                        );
                    }
                }
            }
        } else {
            self.coeffs
                .replace(*key, Node::with_coeff(self.project_box(key), false));
        }
    }

    /// Norms of the low-order and high-order halves of a `k^D` block, for
    /// the autorefine screen.
    pub(crate) fn tnorm(&self, t: &CoeffTensor<T>) -> (f64, f64) {
        let total = t.normf();
        let lo = t.patch(&self.cdata.sh).normf();
        let hi = (total * total - lo * lo).max(0.0).sqrt();
        (lo, hi)
    }

    /// True when the square of this block needs refinement to be
    /// represented.
    pub(crate) fn autorefine_square_test(&self, key: &Key<D>, t: &CoeffTensor<T>) -> bool {
        let (lo, hi) = self.tnorm(t);
        2.0 * lo * hi + hi * hi > self.truncate_tol(self.thresh, key)
    }

    /// Split a leaf whose square test fires, installing the child scaling
    /// blocks synthesized by `unfilter`.
    pub(crate) fn refine_op(&self, key: &Key<D>) {
        let split = self.coeffs.with_existing_mut(key, |node| {
            if node.has_coeff()
                && key.level() < self.max_refine_level
                && self.autorefine_square_test(key, node.coeff())
            {
                let mut d = CoeffTensor::<T>::zeros(D, 2 * self.k);
                d.assign_patch(&self.cdata.s0, node.coeff());
                let d = self.unfilter(&d);
                node.clear_coeff();
                node.set_has_children(true);
                Some(d)
            } else {
                None
            }
        });
        if let Some(Some(d)) = split {
            for child in key.children() {
                let ss = d.patch(&self.cdata.child_patch(&child));
                self.coeffs.replace(child, Node::with_coeff(ss, false));
            }
        }
    }

    /// Walk down to the leaves, then apply `refine_op` there.
    pub(crate) fn refine_spawn(self: &Arc<Self>, key: &Key<D>) {
        let Some(node) = self.coeffs.get_local(key) else { return };
        if node.has_children() {
            for child in key.children() {
                let owner = self.coeffs.owner(&child);
                if owner == self.world.rank() {
                    let this = self.clone();
                    self.world
                        .taskq()
                        .add(Priority::High, move || this.refine_spawn(&child));
                } else {
                    self.send_tree_msg(owner, &TreeMsg::RefineSpawn { key: child });
                }
            }
        } else {
            let this = self.clone();
            let key = *key;
            self.world
                .taskq()
                .add(Priority::Normal, move || this.refine_op(&key));
        }
    }

    /// Key of the neighbor `step` boxes away along `axis`, mapped by the
    /// boundary conditions; invalid when a zero boundary is crossed.
    pub(crate) fn neighbor(&self, key: &Key<D>, axis: usize, step: i64) -> Key<D> {
        let (shifted, inside) = key.shifted(axis, step);
        if inside {
            shifted
        } else if self.bc.is_periodic(axis) {
            shifted.wrapped()
        } else {
            Key::invalid()
        }
    }

    /// General displacement neighbor under the boundary conditions.
    pub(crate) fn neighbor_disp(&self, key: &Key<D>, disp: &[i64; D]) -> Key<D> {
        let (shifted, inside) = key.shifted_by(disp);
        for d in 0..D {
            if !inside[d] && !self.bc.is_periodic(d) {
                return Key::invalid();
            }
        }
        shifted.wrapped()
    }

    /// Walk up from `key` to the first ancestor carrying coefficients and
    /// deliver `(ancestor, coeffs)`; descendants holding them instead get
    /// an empty tensor back.
    pub(crate) fn sock_it_to_me(self: &Arc<Self>, key: Key<D>, reply: Reply<(Key<D>, CoeffTensor<T>)>) {
        if self.coeffs.is_local(&key) {
            if let Some(node) = self.coeffs.get_local(&key) {
                if node.has_coeff() {
                    reply.resolve(&self.world, (key, node.coeff().clone()));
                } else {
                    reply.resolve(&self.world, (key, CoeffTensor::empty()));
                }
                return;
            }
            if key.level() == 0 {
                reply.resolve(&self.world, (key, CoeffTensor::empty()));
                return;
            }
            self.forward_sock_it_to_me(key.parent(), reply);
        } else {
            self.forward_sock_it_to_me(key, reply);
        }
    }

    fn forward_sock_it_to_me(
        self: &Arc<Self>,
        key: Key<D>,
        reply: Reply<(Key<D>, CoeffTensor<T>)>,
    ) {
        let owner = self.coeffs.owner(&key);
        if owner == self.world.rank() {
            let this = self.clone();
            self.world
                .taskq()
                .add(Priority::High, move || this.sock_it_to_me(key, reply));
        } else {
            let (origin, token) = match reply {
                Reply::Remote { rank, token } => (rank as u64, token),
                Reply::Local(future) => {
                    let token = self.world.register_reply(&future, |bytes| {
                        bincode::deserialize::<(Key<D>, CoeffTensor<T>)>(&bytes)
                            .expect("sock reply decodes")
                    });
                    (self.world.rank() as u64, token)
                }
            };
            self.send_tree_msg(owner, &TreeMsg::SockItToMe { key, origin, token });
        }
    }

    /// Interpolate `s` (living at `parent`) down to `child` by repeated
    /// `unfilter` and patch extraction.
    pub(crate) fn parent_to_child(
        &self,
        s: &CoeffTensor<T>,
        parent: &Key<D>,
        child: &Key<D>,
    ) -> CoeffTensor<T> {
        if parent == child || !parent.is_valid() {
            return s.clone();
        }
        let up = child.parent();
        let coarse = self.parent_to_child(s, parent, &up);
        let mut d = CoeffTensor::<T>::zeros(D, 2 * self.k);
        d.assign_patch(&self.cdata.s0, &coarse);
        let d = self.unfilter(&d);
        d.patch(&self.cdata.child_patch(child))
    }

    /// `self <- alpha*self + beta*other`, driven from `other`'s shard.
    pub(crate) fn gaxpy_inplace(&self, alpha: T, other: &TreeImpl<T, D>, beta: T) {
        use crate::container::NodeOp;
        other.coeffs.for_each_local(|key, node| {
            self.coeffs.send_op(NodeOp::GaxpyInplace {
                key: *key,
                alpha,
                node: node.clone(),
                beta,
            });
        });
    }

    /// Evaluate at `x` by walking down to the owning leaf.
    pub(crate) fn eval_task(self: &Arc<Self>, x: [f64; D], key: Key<D>, reply: Reply<T>) {
        let owner = self.coeffs.owner(&key);
        if owner != self.world.rank() {
            let (origin, token) = match reply {
                Reply::Remote { rank, token } => (rank as u64, token),
                Reply::Local(future) => {
                    let token = self.world.register_reply(&future, |bytes| {
                        bincode::deserialize::<T>(&bytes).expect("eval reply decodes")
                    });
                    (self.world.rank() as u64, token)
                }
            };
            self.send_tree_msg(
                owner,
                &TreeMsg::Eval {
                    x: x.to_vec(),
                    key,
                    origin,
                    token,
                },
            );
            return;
        }
        let node = self
            .coeffs
            .get_local(&key)
            .unwrap_or_else(|| panic!("eval reached missing node {key}"));
        if node.has_children() {
            // Child whose box contains x.
            let mut index = 0usize;
            let next_level = key.level() + 1;
            for d in 0..D {
                let scaled = x[d] * (1i64 << next_level) as f64;
                let bit = if scaled - (2 * key.translation()[d]) as f64 >= 1.0 {
                    1
                } else {
                    0
                };
                index |= bit << d;
            }
            let child = key.child(index);
            let this = self.clone();
            self.world
                .taskq()
                .add(Priority::High, move || this.eval_task(x, child, reply));
        } else {
            assert!(node.has_coeff(), "eval hit an invalid leaf {key}");
            let value = self.eval_cube(&key, &x, node.coeff());
            reply.resolve(&self.world, value);
        }
    }

    /// Evaluate the scaling expansion of one box at a point.
    pub(crate) fn eval_cube(&self, key: &Key<D>, x: &[f64; D], c: &CoeffTensor<T>) -> T {
        let n = key.level();
        let two_n = (1i64 << n) as f64;
        let mut mats = Vec::with_capacity(D);
        for d in 0..D {
            let xi = (x[d] * two_n - key.translation()[d] as f64).clamp(0.0, 1.0);
            let phi = legendre_scaling_values(self.k, xi);
            let mut m = Mat::zeros(self.k, 1);
            for (i, v) in phi.iter().enumerate() {
                *m.get_mut(i, 0) = *v;
            }
            mats.push(m);
        }
        let reduced = c.general_transform(&mats);
        let scale = 2.0f64.powf(0.5 * D as f64 * n as f64);
        reduced.data()[0].mul_real(scale)
    }

    /// Squared error against the functor with an order-`k+1` rule.
    pub(crate) fn errsq_local(&self, functor: &Functor<T, D>) -> f64 {
        use crate::twoscale::gauss_legendre;
        let npt = self.k + 1;
        let (qx, qw) = gauss_legendre(npt);
        let mut phiw = Mat::zeros(npt, npt);
        for i in 0..npt {
            let phi = legendre_scaling_values(npt, qx[i]);
            for j in 0..npt {
                *phiw.get_mut(i, j) = qw[i] * phi[j];
            }
        }

        let mut sum = 0.0;
        self.coeffs.for_each_local(|key, node| {
            if !node.has_coeff() || node.coeff().dim0() != self.k {
                return;
            }
            let cell = 0.5f64.powi(key.level() as i32);
            let l = key.translation();
            let total = npt.pow(D as u32);
            let mut data = Vec::with_capacity(total);
            let mut idx = [0usize; D];
            for _ in 0..total {
                let mut x = [0.0f64; D];
                for d in 0..D {
                    x[d] = cell * (l[d] as f64 + qx[idx[d]]);
                }
                data.push(functor(&x));
                for d in (0..D).rev() {
                    idx[d] += 1;
                    if idx[d] < npt {
                        break;
                    }
                    idx[d] = 0;
                }
            }
            let mut fval = CoeffTensor::from_parts(vec![npt; D], data);
            let scale = 0.5f64.powf(0.5 * D as f64 * key.level() as f64);
            fval.scale(T::from_real(scale));
            let mut exact = fval.transform(&phiw);
            // The first k entries per axis live in the same basis as the
            // node's coefficients; the rest measure what the order-k
            // representation cannot hold.
            let klow: Vec<crate::tensor::Slice> = (0..D)
                .map(|_| crate::tensor::Slice::new(0, self.k))
                .collect();
            let mut low = exact.patch(&klow);
            low.gaxpy(T::one(), node.coeff(), -T::one());
            exact.zero_patch(&klow);
            let err2 = exact.normf().powi(2) + low.normf().powi(2);
            sum += err2;
        });
        sum
    }

    /// Coefficient block used by the level gather, synthesized from an
    /// ancestor when the key itself holds nothing.
    pub(crate) fn block_for_gather(self: &Arc<Self>, key: &Key<D>) -> CoeffTensor<T> {
        if let Some(node) = self.coeffs.get_local(key) {
            if node.has_coeff() {
                let c = node.coeff();
                return if c.dim0() == 2 * self.k {
                    c.patch(&self.cdata.s0)
                } else {
                    c.clone()
                };
            }
        }
        let future = Future::new();
        self.sock_it_to_me(*key, Reply::Local(future.clone()));
        let (parent, coeff) = future.get();
        if coeff.is_empty() {
            return CoeffTensor::zeros(D, self.k);
        }
        let coeff = if coeff.dim0() == 2 * self.k {
            coeff.patch(&self.cdata.s0)
        } else {
            coeff
        };
        self.parent_to_child(&coeff, &parent, key)
    }
}

impl<T: TreeScalar, const D: usize> WorldObject for TreeImpl<T, D> {
    fn deliver(self: Arc<Self>, src: Rank, bytes: &[u8]) {
        let msg: TreeMsg<T, D> = bincode::deserialize(bytes).expect("TreeMsg decodes");
        let this = self.clone();
        match msg {
            TreeMsg::ProjectRefineOp { key, refine } => {
                self.world.taskq().add(Priority::Normal, move || {
                    this.project_refine_op(&key, refine)
                });
            }
            TreeMsg::CompressSpawn {
                key,
                nonstandard,
                keepleaves,
                origin,
                token,
            } => {
                self.world.taskq().add(Priority::High, move || {
                    let result = this.compress_spawn(&key, nonstandard, keepleaves);
                    let world = this.world.clone();
                    result.on_ready(move |tensor| {
                        let bytes = bincode::serialize(&tensor).expect("tensor encodes");
                        world.send_reply(origin as Rank, token, &bytes);
                    });
                });
            }
            TreeMsg::ReconstructOp { key, s } => {
                self.world
                    .taskq()
                    .add(Priority::High, move || this.reconstruct_op(&key, &s));
            }
            TreeMsg::TruncateSpawn {
                key,
                tol,
                origin,
                token,
            } => {
                self.world.taskq().add(Priority::High, move || {
                    let result = this.truncate_spawn(&key, tol);
                    let world = this.world.clone();
                    result.on_ready(move |keep| {
                        let bytes = bincode::serialize(&keep).expect("bool encodes");
                        world.send_reply(origin as Rank, token, &bytes);
                    });
                });
            }
            TreeMsg::NormTreeSpawn { key, origin, token } => {
                self.world.taskq().add(Priority::High, move || {
                    let result = this.norm_tree_spawn(&key);
                    let world = this.world.clone();
                    result.on_ready(move |norm| {
                        let bytes = bincode::serialize(&norm).expect("f64 encodes");
                        world.send_reply(origin as Rank, token, &bytes);
                    });
                });
            }
            TreeMsg::RefineSpawn { key } => {
                self.world
                    .taskq()
                    .add(Priority::High, move || this.refine_spawn(&key));
            }
            TreeMsg::SockItToMe { key, origin, token } => {
                self.world.taskq().add(Priority::High, move || {
                    this.sock_it_to_me(
                        key,
                        Reply::Remote {
                            rank: origin as Rank,
                            token,
                        },
                    )
                });
            }
            TreeMsg::Diff1 {
                f_id,
                axis,
                key,
                left,
                center,
                right,
            } => {
                self.world.taskq().add(Priority::High, move || {
                    let f = this
                        .world
                        .object_as::<TreeImpl<T, D>>(f_id)
                        .expect("source tree of diff is registered");
                    this.do_diff1(&f, axis as usize, &key, left, center, right);
                });
            }
            TreeMsg::Mul {
                left_id,
                right_id,
                key,
                lc,
                rc,
                tol,
            } => {
                self.world.taskq().add(Priority::High, move || {
                    let left = this
                        .world
                        .object_as::<TreeImpl<T, D>>(left_id)
                        .expect("left operand is registered");
                    let right = this
                        .world
                        .object_as::<TreeImpl<T, D>>(right_id)
                        .expect("right operand is registered");
                    this.mul_op(&left, &right, &key, lc, rc, tol);
                });
            }
            TreeMsg::MulVec {
                left_id,
                right_ids,
                result_ids,
                key,
                lc,
                vrc,
                tol,
            } => {
                self.world.taskq().add(Priority::High, move || {
                    let left = this
                        .world
                        .object_as::<TreeImpl<T, D>>(left_id)
                        .expect("left operand is registered");
                    let vright: Vec<_> = right_ids
                        .iter()
                        .map(|id| {
                            this.world
                                .object_as::<TreeImpl<T, D>>(*id)
                                .expect("right operand is registered")
                        })
                        .collect();
                    let vresult: Vec<_> = result_ids
                        .iter()
                        .map(|id| {
                            this.world
                                .object_as::<TreeImpl<T, D>>(*id)
                                .expect("result tree is registered")
                        })
                        .collect();
                    this.mul_vec_op(&left, &vright, &vresult, &key, lc, vrc, tol);
                });
            }
            TreeMsg::Eval {
                x,
                key,
                origin,
                token,
            } => {
                let mut coords = [0.0f64; D];
                coords.copy_from_slice(&x);
                self.world.taskq().add(Priority::High, move || {
                    this.eval_task(
                        coords,
                        key,
                        Reply::Remote {
                            rank: origin as Rank,
                            token,
                        },
                    )
                });
            }
        }
        let _ = src;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
