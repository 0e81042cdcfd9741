//! Transitions between the reconstructed, compressed and non-standard
//! representations, truncation, and the subtree-norm cache.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::container::NodeOp;
use crate::key::Key;
use crate::node::Node;
use crate::runtime::{join, Future, Priority};
use crate::tensor::{CoeffTensor, TreeScalar};
use crate::tree::{FunctionTree, TreeImpl, TreeMsg};

impl<T: TreeScalar, const D: usize> FunctionTree<T, D> {
    /// Convert scaling coefficients at the leaves into scaling + wavelet
    /// coefficients up the tree.
    ///
    /// With `nonstandard` the interior scaling blocks are retained; with
    /// `keepleaves` the leaf scaling coefficients survive as well.
    pub fn compress(&self, nonstandard: bool, keepleaves: bool, fence: bool) {
        let tree = &self.inner;
        // Set eagerly so back-to-back calls without a fence see the final
        // state.
        tree.compressed.store(true, Ordering::Release);
        tree.nonstandard.store(nonstandard, Ordering::Release);
        let root = Key::<D>::root();
        if tree.coeffs.is_local(&root) {
            let _root_scaling = tree.compress_spawn(&root, nonstandard, keepleaves);
        }
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Inverse of `compress`: redistribute coefficients so that every leaf
    /// carries its scaling block.
    pub fn reconstruct(&self, fence: bool) {
        let tree = &self.inner;
        tree.compressed.store(false, Ordering::Release);
        tree.nonstandard.store(false, Ordering::Release);
        let root = Key::<D>::root();
        if tree.coeffs.is_local(&root) {
            let this = tree.clone();
            tree.world.taskq().add(Priority::High, move || {
                this.reconstruct_op(&root, &CoeffTensor::empty())
            });
        }
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Convert non-standard compressed form to standard compressed form by
    /// zeroing interior scaling blocks and dropping leaf coefficients.
    pub fn standard(&self, fence: bool) {
        let tree = &self.inner;
        let s0 = tree.cdata.s0.clone();
        tree.coeffs.for_each_local_mut(|key, node| {
            if key.level() > 0 && node.has_coeff() {
                if node.has_children() {
                    node.coeff_mut().zero_patch(&s0);
                } else {
                    node.clear_coeff();
                }
            }
        });
        tree.nonstandard.store(false, Ordering::Release);
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Discard wavelet content below the threshold, pruning subtrees whose
    /// children are all empty. Expects compressed form; `tol <= 0` uses the
    /// tree's threshold.
    pub fn truncate(&self, tol: f64, fence: bool) {
        let tree = &self.inner;
        let tol = if tol <= 0.0 { tree.thresh } else { tol };
        let root = Key::<D>::root();
        if tree.coeffs.is_local(&root) {
            let _keep = tree.truncate_spawn(&root, tol);
        }
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Cache the subtree norms consumed by multiplication screening.
    /// Expects reconstructed form.
    pub fn norm_tree(&self, fence: bool) {
        let tree = &self.inner;
        let root = Key::<D>::root();
        if tree.coeffs.is_local(&root) {
            let _norm = tree.norm_tree_spawn(&root);
        }
        if fence {
            tree.world.gop().fence();
        }
    }
}

impl<T: TreeScalar, const D: usize> TreeImpl<T, D> {
    /// Post-order compression of the subtree at `key`; the future carries
    /// this box's scaling block up to the parent.
    pub(crate) fn compress_spawn(
        self: &Arc<Self>,
        key: &Key<D>,
        nonstandard: bool,
        keepleaves: bool,
    ) -> Future<CoeffTensor<T>> {
        let node = self
            .coeffs
            .get_local(key)
            .unwrap_or_else(|| panic!("compress reached missing node {key}"));
        if node.has_children() {
            let futures: Vec<_> = key
                .children()
                .map(|child| self.compress_task(&child, nonstandard, keepleaves))
                .collect();
            let this = self.clone();
            let key = *key;
            self.world
                .taskq()
                .add_when(Priority::Normal, join(futures), move |v| {
                    this.compress_op(&key, &v, nonstandard)
                })
        } else {
            let result = node.coeff().clone();
            if !keepleaves {
                self.coeffs.with_existing_mut(key, |n| n.clear_coeff());
            }
            Future::ready(result)
        }
    }

    fn compress_task(
        self: &Arc<Self>,
        key: &Key<D>,
        nonstandard: bool,
        keepleaves: bool,
    ) -> Future<CoeffTensor<T>> {
        let owner = self.coeffs.owner(key);
        if owner == self.world.rank() {
            self.compress_spawn(key, nonstandard, keepleaves)
        } else {
            let (token, future) = self.world.expect_reply(|bytes| {
                bincode::deserialize::<CoeffTensor<T>>(&bytes).expect("tensor reply decodes")
            });
            self.send_tree_msg(
                owner,
                &TreeMsg::CompressSpawn {
                    key: *key,
                    nonstandard,
                    keepleaves,
                    origin: self.world.rank() as u64,
                    token,
                },
            );
            future
        }
    }

    /// Assemble the child scaling blocks, filter, store, and hand the
    /// parent this box's scaling block.
    fn compress_op(
        &self,
        key: &Key<D>,
        v: &[CoeffTensor<T>],
        nonstandard: bool,
    ) -> CoeffTensor<T> {
        let mut d = CoeffTensor::<T>::zeros(D, 2 * self.k);
        for (i, child) in key.children().enumerate() {
            d.assign_patch(&self.cdata.child_patch(&child), &v[i]);
        }
        let mut d = self.filter(&d);
        let s = d.patch(&self.cdata.s0);
        if key.level() > 0 && !nonstandard {
            d.zero_patch(&self.cdata.s0);
        }
        self.coeffs.replace(*key, Node::with_coeff(d, true));
        s
    }

    /// Pre-order reconstruction: push the incoming parent scaling block
    /// down through `unfilter`, installing leaf coefficients on the way.
    pub(crate) fn reconstruct_op(self: &Arc<Self>, key: &Key<D>, s: &CoeffTensor<T>) {
        // After an integral operator not every sibling need exist.
        if !self.coeffs.probe_local(key) {
            self.coeffs.replace(*key, Node::default());
        }
        let down = self
            .coeffs
            .with_existing_mut(key, |node| {
                // Interior nodes can arrive without coefficients; they
                // still must sum down, so give them zeros.
                if node.has_children() && !node.has_coeff() {
                    node.set_coeff(CoeffTensor::zeros(D, 2 * self.k));
                }
                if node.has_children() || node.has_coeff() {
                    let mut d = node.coeff().clone();
                    if d.is_empty() {
                        d = CoeffTensor::zeros(D, 2 * self.k);
                    }
                    if key.level() > 0 && !s.is_empty() {
                        d.add_patch(&self.cdata.s0, s);
                    }
                    node.clear_coeff();
                    node.set_has_children(true);
                    Some(self.unfilter(&d))
                } else {
                    node.set_coeff(s.clone());
                    None
                }
            })
            .expect("node just ensured");
        if let Some(d) = down {
            for child in key.children() {
                let ss = d.patch(&self.cdata.child_patch(&child));
                let owner = self.coeffs.owner(&child);
                if owner == self.world.rank() {
                    let this = self.clone();
                    self.world
                        .taskq()
                        .add(Priority::High, move || this.reconstruct_op(&child, &ss));
                } else {
                    self.send_tree_msg(owner, &TreeMsg::ReconstructOp { key: child, s: ss });
                }
            }
        }
    }

    /// Depth-first truncation; the future reports whether anything below
    /// `key` survived.
    pub(crate) fn truncate_spawn(self: &Arc<Self>, key: &Key<D>, tol: f64) -> Future<bool> {
        let Some(node) = self.coeffs.get_local(key) else {
            return Future::ready(false);
        };
        if node.has_children() {
            let futures: Vec<_> = key
                .children()
                .map(|child| self.truncate_task(&child, tol))
                .collect();
            let this = self.clone();
            let key = *key;
            self.world
                .taskq()
                .add_when(Priority::Normal, join(futures), move |v| {
                    this.truncate_op(&key, tol, &v)
                })
        } else {
            Future::ready(node.has_coeff())
        }
    }

    fn truncate_task(self: &Arc<Self>, key: &Key<D>, tol: f64) -> Future<bool> {
        let owner = self.coeffs.owner(key);
        if owner == self.world.rank() {
            self.truncate_spawn(key, tol)
        } else {
            let (token, future) = self.world.expect_reply(|bytes| {
                bincode::deserialize::<bool>(&bytes).expect("bool reply decodes")
            });
            self.send_tree_msg(
                owner,
                &TreeMsg::TruncateSpawn {
                    key: *key,
                    tol,
                    origin: self.world.rank() as u64,
                    token,
                },
            );
            future
        }
    }

    /// A parent may truncate only when every child reported empty and its
    /// own wavelet norm is below threshold.
    fn truncate_op(&self, key: &Key<D>, tol: f64, v: &[bool]) -> bool {
        if v.iter().any(|&keep| keep) {
            return true;
        }
        let (keep, erase_children) = self
            .coeffs
            .with_existing_mut(key, |node| {
                if node.has_coeff() {
                    if node.coeff().normf() < self.truncate_tol(tol, key) {
                        node.clear_coeff();
                        let had_children = node.has_children();
                        node.set_has_children(false);
                        (false, had_children)
                    } else {
                        (true, false)
                    }
                } else {
                    let had_children = node.has_children();
                    node.set_has_children(false);
                    (false, had_children)
                }
            })
            .unwrap_or((false, false));
        if erase_children {
            for child in key.children() {
                self.coeffs.erase(child);
            }
        }
        keep
    }

    /// Post-order walk caching the subtree norm at every interior node.
    pub(crate) fn norm_tree_spawn(self: &Arc<Self>, key: &Key<D>) -> Future<f64> {
        let node = self
            .coeffs
            .get_local(key)
            .unwrap_or_else(|| panic!("norm_tree reached missing node {key}"));
        if node.has_children() {
            let futures: Vec<_> = key
                .children()
                .map(|child| self.norm_tree_task(&child))
                .collect();
            let this = self.clone();
            let key = *key;
            self.world
                .taskq()
                .add_when(Priority::Normal, join(futures), move |v| {
                    this.norm_tree_op(&key, &v)
                })
        } else {
            Future::ready(node.coeff().normf())
        }
    }

    fn norm_tree_task(self: &Arc<Self>, key: &Key<D>) -> Future<f64> {
        let owner = self.coeffs.owner(key);
        if owner == self.world.rank() {
            self.norm_tree_spawn(key)
        } else {
            let (token, future) = self.world.expect_reply(|bytes| {
                bincode::deserialize::<f64>(&bytes).expect("norm reply decodes")
            });
            self.send_tree_msg(
                owner,
                &TreeMsg::NormTreeSpawn {
                    key: *key,
                    origin: self.world.rank() as u64,
                    token,
                },
            );
            future
        }
    }

    fn norm_tree_op(&self, key: &Key<D>, v: &[f64]) -> f64 {
        let sum: f64 = v.iter().map(|n| n * n).sum();
        let norm = sum.sqrt();
        self.coeffs.send_op(NodeOp::SetNormTree { key: *key, norm });
        norm
    }
}
