//! Differentiation along one axis with the adaptive three-point stencil.
//!
//! Each leaf fetches the scaling blocks of its two neighbours along the
//! axis; a neighbour at a different refinement level triggers a local
//! refinement and the work is re-spawned on the children. Forwarded tasks
//! run at high priority so communication overlaps the stencil compute.

use std::sync::Arc;

use crate::key::Key;
use crate::node::Node;
use crate::runtime::{join, Future, Priority};
use crate::tensor::{CoeffTensor, TreeScalar};
use crate::tree::{FunctionTree, Reply, TreeImpl, TreeMsg};

type NeighborBlock<T, const D: usize> = (Key<D>, CoeffTensor<T>);

impl<T: TreeScalar, const D: usize> FunctionTree<T, D> {
    /// `self <- d f / dx_axis`. `f` must be reconstructed; the result gets
    /// the same process map.
    pub fn diff(&self, f: &Self, axis: usize, fence: bool) {
        assert!(axis < D, "differentiation axis out of range");
        assert!(!f.is_compressed(), "diff requires reconstructed input");
        let tree = &self.inner;
        let ftree = &f.inner;
        for key in ftree.coeffs.local_keys() {
            let Some(node) = ftree.coeffs.get_local(&key) else { continue };
            if node.has_coeff() {
                let left = ftree.find_neighbor(&key, axis, -1);
                let right = ftree.find_neighbor(&key, axis, 1);
                let center = (key, node.coeff().clone());
                let this = tree.clone();
                let fimpl = ftree.clone();
                tree.world
                    .taskq()
                    .add_when(Priority::High, join(vec![left, right]), move |lr| {
                        let mut lr = lr;
                        let right = lr.pop().expect("two neighbours");
                        let left = lr.pop().expect("two neighbours");
                        this.do_diff1(&fimpl, axis, &key, left, center, right);
                    });
            } else {
                tree.coeffs.replace(key, Node::interior());
            }
        }
        if fence {
            tree.world.gop().fence();
        }
    }
}

impl<T: TreeScalar, const D: usize> TreeImpl<T, D> {
    /// Future of `(key, coeffs)` for the neighbour `step` boxes along
    /// `axis`, routed through the process map. A zero boundary yields a
    /// zero block under the invalid key; an empty block means the
    /// neighbour is refined more deeply than `key`.
    pub(crate) fn find_neighbor(
        self: &Arc<Self>,
        key: &Key<D>,
        axis: usize,
        step: i64,
    ) -> Future<NeighborBlock<T, D>> {
        let neigh = self.neighbor(key, axis, step);
        if !neigh.is_valid() {
            return Future::ready((neigh, CoeffTensor::zeros(D, self.k)));
        }
        let future = Future::new();
        self.sock_it_to_me(neigh, Reply::Local(future.clone()));
        future
    }

    /// Dispatch one stencil evaluation, refining into the children when a
    /// neighbour sits below this box in the tree.
    pub(crate) fn do_diff1(
        self: &Arc<Self>,
        f: &Arc<TreeImpl<T, D>>,
        axis: usize,
        key: &Key<D>,
        left: NeighborBlock<T, D>,
        center: NeighborBlock<T, D>,
        right: NeighborBlock<T, D>,
    ) {
        if left.1.is_empty() || right.1.is_empty() {
            // A neighbour is more refined; recur onto the children. Inner
            // children find their missing sibling inside this box.
            self.coeffs.replace(*key, Node::interior());
            for child in key.children() {
                if (child.translation()[axis] & 1) == 0 {
                    self.forward_do_diff1(
                        f,
                        axis,
                        &child,
                        left.clone(),
                        center.clone(),
                        center.clone(),
                    );
                } else {
                    self.forward_do_diff1(
                        f,
                        axis,
                        &child,
                        center.clone(),
                        center.clone(),
                        right.clone(),
                    );
                }
            }
        } else {
            self.forward_do_diff1(f, axis, key, left, center, right);
        }
    }

    /// Route a stencil evaluation to the owner of `key`, re-fetching any
    /// neighbour block the recursion has not resolved yet.
    fn forward_do_diff1(
        self: &Arc<Self>,
        f: &Arc<TreeImpl<T, D>>,
        axis: usize,
        key: &Key<D>,
        left: NeighborBlock<T, D>,
        center: NeighborBlock<T, D>,
        right: NeighborBlock<T, D>,
    ) {
        let owner = self.coeffs.owner(key);
        if owner == self.world.rank() {
            if left.1.is_empty() {
                let refetched = f.find_neighbor(key, axis, -1);
                let this = self.clone();
                let f = f.clone();
                let key = *key;
                self.world
                    .taskq()
                    .add_when(Priority::High, refetched, move |l| {
                        this.do_diff1(&f, axis, &key, l, center, right)
                    });
            } else if right.1.is_empty() {
                let refetched = f.find_neighbor(key, axis, 1);
                let this = self.clone();
                let f = f.clone();
                let key = *key;
                self.world
                    .taskq()
                    .add_when(Priority::High, refetched, move |r| {
                        this.do_diff1(&f, axis, &key, left, center, r)
                    });
            } else {
                let this = self.clone();
                let f = f.clone();
                let key = *key;
                self.world.taskq().add(Priority::Normal, move || {
                    this.do_diff2(&f, axis, &key, &left, &center, &right)
                });
            }
        } else {
            self.send_tree_msg(
                owner,
                &TreeMsg::Diff1 {
                    f_id: f.obj_id(),
                    axis: axis as u8,
                    key: *key,
                    left,
                    center,
                    right,
                },
            );
        }
    }

    /// Three-point derivative from conforming neighbour blocks.
    pub(crate) fn do_diff2(
        &self,
        f: &Arc<TreeImpl<T, D>>,
        axis: usize,
        key: &Key<D>,
        left: &NeighborBlock<T, D>,
        center: &NeighborBlock<T, D>,
        right: &NeighborBlock<T, D>,
    ) {
        let ts = &self.cdata.ts;
        let lkey = f.neighbor(key, axis, -1);
        let rkey = f.neighbor(key, axis, 1);
        let lt = self.parent_to_child(&left.1, &left.0, &lkey);
        let ct = self.parent_to_child(&center.1, &center.0, key);
        let rt = self.parent_to_child(&right.1, &right.0, &rkey);

        let mut d = lt.inner_axis(&ts.rp, axis);
        d.add_assign(&ct.inner_axis(&ts.r0, axis));
        d.add_assign(&rt.inner_axis(&ts.rm, axis));
        d.scale(T::from_real(2.0f64.powi(key.level() as i32)));
        self.coeffs.replace(*key, Node::with_coeff(d, false));
    }
}
