//! Pointwise multiplication by recursive descent over reconstructed trees,
//! plus the value-space unary operations built on the same machinery.
//!
//! The descent assumes both operands share the result's process map and
//! that `norm_tree` has been run when screening is requested.

use std::sync::Arc;

use crate::key::Key;
use crate::node::Node;
use crate::runtime::Priority;
use crate::tensor::{CoeffTensor, Mat, TreeScalar};
use crate::tree::{FunctionTree, TreeImpl, TreeMsg};
use crate::twoscale::legendre_scaling_values;

impl<T: TreeScalar, const D: usize> FunctionTree<T, D> {
    /// `self <- left * right` pointwise. Operands must be reconstructed
    /// with cached subtree norms when `tol > 0`; `self` starts empty.
    pub fn mul(&self, left: &Self, right: &Self, tol: f64, fence: bool) {
        let tree = &self.inner;
        let root = Key::<D>::root();
        if tree.coeffs.is_local(&root) {
            tree.mul_op(
                &left.inner,
                &right.inner,
                &root,
                CoeffTensor::empty(),
                CoeffTensor::empty(),
                tol,
            );
        }
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Multiply one left operand against many right operands with a shared
    /// descent; `results[i] <- left * rights[i]`.
    pub fn mul_vec(left: &Self, rights: &[Self], results: &[Self], tol: f64, fence: bool) {
        assert_eq!(rights.len(), results.len());
        if results.is_empty() {
            return;
        }
        let coordinator = &results[0].inner;
        let root = Key::<D>::root();
        if coordinator.coeffs.is_local(&root) {
            let vright: Vec<_> = rights.iter().map(|r| r.inner.clone()).collect();
            let vresult: Vec<_> = results.iter().map(|r| r.inner.clone()).collect();
            let vrc = vec![CoeffTensor::empty(); rights.len()];
            coordinator.mul_vec_op(&left.inner, &vright, &vresult, &root, CoeffTensor::empty(), vrc, tol);
        }
        if fence {
            coordinator.world.gop().fence();
        }
    }

    /// Pointwise square in place; splits leaves that fail the autorefine
    /// square test before squaring.
    pub fn square_inplace(&self, fence: bool) {
        let tree = &self.inner;
        assert!(!self.is_compressed(), "square_inplace needs reconstructed form");
        for key in tree.coeffs.local_keys() {
            let Some(node) = tree.coeffs.get_local(&key) else { continue };
            if !node.has_coeff() || node.has_children() {
                continue;
            }
            let c = node.coeff().clone();
            if tree.autorefine
                && key.level() < tree.max_refine_level
                && tree.autorefine_square_test(&key, &c)
            {
                let mut d = CoeffTensor::<T>::zeros(D, 2 * tree.k);
                d.assign_patch(&tree.cdata.s0, &c);
                let d = tree.unfilter(&d);
                tree.coeffs.with_existing_mut(&key, |n| {
                    n.clear_coeff();
                    n.set_has_children(true);
                });
                for child in key.children() {
                    let ss = d.patch(&tree.cdata.child_patch(&child));
                    let sq = tree.square_values(&child, &ss);
                    tree.coeffs.replace(child, Node::with_coeff(sq, false));
                }
            } else {
                let sq = tree.square_values(&key, &c);
                tree.coeffs
                    .with_existing_mut(&key, |n| n.set_coeff(sq));
            }
        }
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Apply `op` to the raw coefficients of every local node.
    pub fn unary_op_coeff_inplace(
        &self,
        op: impl Fn(&Key<D>, &mut CoeffTensor<T>),
        fence: bool,
    ) {
        self.inner.coeffs.for_each_local_mut(|key, node| {
            if node.has_coeff() {
                op(key, node.coeff_mut());
            }
        });
        if fence {
            self.inner.world.gop().fence();
        }
    }

    /// Apply `op` to the function values on each box's quadrature grid and
    /// transform back. Requires reconstructed form.
    pub fn unary_op_value_inplace(
        &self,
        op: impl Fn(&Key<D>, &mut CoeffTensor<T>),
        fence: bool,
    ) {
        let tree = &self.inner;
        assert!(
            !self.is_compressed(),
            "unary_op_value_inplace needs reconstructed form"
        );
        tree.coeffs.for_each_local_mut(|key, node| {
            if node.has_coeff() {
                let mut values = tree.fcube_for_mul(key, key, node.coeff());
                op(key, &mut values);
                let scale = 0.5f64.powf(0.5 * D as f64 * key.level() as f64);
                let mut c = values.transform(&tree.cdata.ts.quad_phiw);
                c.scale(T::from_real(scale));
                node.set_coeff(c);
            }
        });
        if fence {
            tree.world.gop().fence();
        }
    }
}

impl<T: TreeScalar, const D: usize> TreeImpl<T, D> {
    /// Scaling functions of `parent`'s box evaluated at the quadrature
    /// points of `child`'s box along one dimension, including the 2^{n/2}
    /// prefactor; the `k x npt` counterpart of `quad_phit` for unequal
    /// levels.
    pub(crate) fn phi_for_mul(&self, np: u8, lp: i64, nc: u8, lc: i64) -> Mat {
        let ts = &self.cdata.ts;
        let mut phi = Mat::zeros(self.k, ts.npt);
        let scale = 2.0f64.powi(np as i32 - nc as i32);
        for (mu, &xq) in ts.quad_x.iter().enumerate() {
            let xmu = scale * (xq + lc as f64) - lp as f64;
            debug_assert!(xmu > -1e-15 && xmu < 1.0 + 1e-15);
            let p = legendre_scaling_values(self.k, xmu.clamp(0.0, 1.0));
            for i in 0..self.k {
                *phi.get_mut(i, mu) = p[i];
            }
        }
        let norm = 2.0f64.powf(0.5 * np as f64);
        for v in phi.data.iter_mut() {
            *v *= norm;
        }
        phi
    }

    /// Values of the function on `child`'s quadrature grid given
    /// coefficients living at `parent`.
    pub(crate) fn fcube_for_mul(
        &self,
        child: &Key<D>,
        parent: &Key<D>,
        coeff: &CoeffTensor<T>,
    ) -> CoeffTensor<T> {
        if child.level() == parent.level() {
            let scale = 2.0f64.powf(0.5 * D as f64 * parent.level() as f64);
            let mut v = coeff.transform(&self.cdata.ts.quad_phit);
            v.scale(T::from_real(scale));
            v
        } else {
            assert!(
                child.level() > parent.level(),
                "fcube_for_mul child above parent"
            );
            let mats: Vec<Mat> = (0..D)
                .map(|d| {
                    self.phi_for_mul(
                        parent.level(),
                        parent.translation()[d],
                        child.level(),
                        child.translation()[d],
                    )
                })
                .collect();
            coeff.general_transform(&mats)
        }
    }

    /// Multiply the two coefficient blocks in value space and store the
    /// product as this box's leaf.
    pub(crate) fn do_mul(
        &self,
        key: &Key<D>,
        lc: &CoeffTensor<T>,
        rkey: &Key<D>,
        rc: &CoeffTensor<T>,
    ) {
        let lcube = self.fcube_for_mul(key, key, lc);
        let rcube = self.fcube_for_mul(key, rkey, rc);
        let tcube = lcube.emul(&rcube);
        let scale = 0.5f64.powf(0.5 * D as f64 * key.level() as f64);
        let mut c = tcube.transform(&self.cdata.ts.quad_phiw);
        c.scale(T::from_real(scale));
        self.coeffs.replace(*key, Node::with_coeff(c, false));
    }

    /// One step of the recursive descent for `result <- left * right`.
    pub(crate) fn mul_op(
        self: &Arc<Self>,
        left: &Arc<TreeImpl<T, D>>,
        right: &Arc<TreeImpl<T, D>>,
        key: &Key<D>,
        lcin: CoeffTensor<T>,
        rcin: CoeffTensor<T>,
        tol: f64,
    ) {
        let mut lnorm = 1e99;
        let mut rnorm = 1e99;

        let mut lc = lcin;
        if lc.is_empty() {
            let node = left
                .coeffs
                .get_local(key)
                .unwrap_or_else(|| panic!("mul: left operand missing node {key}"));
            lnorm = node.norm_tree();
            if node.has_coeff() {
                lc = node.coeff().clone();
            }
        }
        let mut rc = rcin;
        if rc.is_empty() {
            let node = right
                .coeffs
                .get_local(key)
                .unwrap_or_else(|| panic!("mul: right operand missing node {key}"));
            rnorm = node.norm_tree();
            if node.has_coeff() {
                rc = node.coeff().clone();
            }
        }

        if !lc.is_empty() && !rc.is_empty() {
            let this = self.clone();
            let key = *key;
            let rkey = key;
            self.world.taskq().add(Priority::Normal, move || {
                this.do_mul(&key, &lc, &rkey, &rc)
            });
            return;
        }

        if tol != 0.0 {
            if !lc.is_empty() {
                lnorm = lc.normf();
            }
            if !rc.is_empty() {
                rnorm = rc.normf();
            }
            if lnorm * rnorm < self.truncate_tol(tol, key) {
                self.coeffs
                    .replace(*key, Node::with_coeff(CoeffTensor::zeros(D, self.k), false));
                return;
            }
        }

        // Recur down, synthesizing child scaling blocks for whichever side
        // already has coefficients.
        self.coeffs.replace(*key, Node::interior());
        let lss = self.synthesize_children(&lc);
        let rss = self.synthesize_children(&rc);
        for child in key.children() {
            let patch = self.cdata.child_patch(&child);
            let ll = lss.as_ref().map(|t| t.patch(&patch)).unwrap_or_else(CoeffTensor::empty);
            let rr = rss.as_ref().map(|t| t.patch(&patch)).unwrap_or_else(CoeffTensor::empty);
            let owner = self.coeffs.owner(&child);
            if owner == self.world.rank() {
                let this = self.clone();
                let left = left.clone();
                let right = right.clone();
                self.world.taskq().add(Priority::High, move || {
                    this.mul_op(&left, &right, &child, ll, rr, tol)
                });
            } else {
                self.send_tree_msg(
                    owner,
                    &TreeMsg::Mul {
                        left_id: left.obj_id(),
                        right_id: right.obj_id(),
                        key: child,
                        lc: ll,
                        rc: rr,
                        tol,
                    },
                );
            }
        }
    }

    /// Shared-descent variant multiplying one left block against a list of
    /// right operands.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn mul_vec_op(
        self: &Arc<Self>,
        left: &Arc<TreeImpl<T, D>>,
        vright: &[Arc<TreeImpl<T, D>>],
        vresult: &[Arc<TreeImpl<T, D>>],
        key: &Key<D>,
        lcin: CoeffTensor<T>,
        vrcin: Vec<CoeffTensor<T>>,
        tol: f64,
    ) {
        let mut lnorm = 1e99;
        let mut lc = lcin;
        if lc.is_empty() {
            let node = left
                .coeffs
                .get_local(key)
                .unwrap_or_else(|| panic!("mul_vec: left operand missing node {key}"));
            lnorm = node.norm_tree();
            if node.has_coeff() {
                lc = node.coeff().clone();
            }
        }
        if !lc.is_empty() {
            lnorm = lc.normf();
        }

        let mut pending: Vec<(Arc<TreeImpl<T, D>>, Arc<TreeImpl<T, D>>, CoeffTensor<T>)> =
            Vec::new();
        for (i, (right, result)) in vright.iter().zip(vresult.iter()).enumerate() {
            let mut rc = vrcin[i].clone();
            let rnorm;
            if rc.is_empty() {
                let node = right
                    .coeffs
                    .get_local(key)
                    .unwrap_or_else(|| panic!("mul_vec: right operand missing node {key}"));
                rnorm = node.norm_tree();
                if node.has_coeff() {
                    rc = node.coeff().clone();
                }
            } else {
                rnorm = rc.normf();
            }

            if !rc.is_empty() && !lc.is_empty() {
                let target = result.clone();
                let key = *key;
                let lc = lc.clone();
                self.world.taskq().add(Priority::Normal, move || {
                    target.do_mul(&key, &lc, &key, &rc)
                });
            } else if tol != 0.0 && lnorm * rnorm < self.truncate_tol(tol, key) {
                result
                    .coeffs
                    .replace(*key, Node::with_coeff(CoeffTensor::zeros(D, self.k), false));
            } else {
                result.coeffs.replace(*key, Node::interior());
                pending.push((result.clone(), right.clone(), rc));
            }
        }

        if pending.is_empty() {
            return;
        }
        let lss = self.synthesize_children(&lc);
        let vrss: Vec<Option<CoeffTensor<T>>> = pending
            .iter()
            .map(|(_, _, rc)| self.synthesize_children(rc))
            .collect();
        for child in key.children() {
            let patch = self.cdata.child_patch(&child);
            let ll = lss.as_ref().map(|t| t.patch(&patch)).unwrap_or_else(CoeffTensor::empty);
            let vv: Vec<CoeffTensor<T>> = vrss
                .iter()
                .map(|rss| rss.as_ref().map(|t| t.patch(&patch)).unwrap_or_else(CoeffTensor::empty))
                .collect();
            let owner = self.coeffs.owner(&child);
            if owner == self.world.rank() {
                let this = self.clone();
                let left = left.clone();
                let vright: Vec<_> = pending.iter().map(|(_, r, _)| r.clone()).collect();
                let vresult: Vec<_> = pending.iter().map(|(r, _, _)| r.clone()).collect();
                self.world.taskq().add(Priority::High, move || {
                    this.mul_vec_op(&left, &vright, &vresult, &child, ll, vv, tol)
                });
            } else {
                self.send_tree_msg(
                    owner,
                    &TreeMsg::MulVec {
                        left_id: left.obj_id(),
                        right_ids: pending.iter().map(|(_, r, _)| r.obj_id()).collect(),
                        result_ids: pending.iter().map(|(r, _, _)| r.obj_id()).collect(),
                        key: child,
                        lc: ll,
                        vrc: vv,
                        tol,
                    },
                );
            }
        }
    }

    /// Child-level scaling blocks of one parent block, or `None` when the
    /// parent has no coefficients here.
    fn synthesize_children(&self, c: &CoeffTensor<T>) -> Option<CoeffTensor<T>> {
        if c.is_empty() {
            return None;
        }
        let mut d = CoeffTensor::<T>::zeros(D, 2 * self.k);
        d.assign_patch(&self.cdata.s0, c);
        Some(self.unfilter(&d))
    }

    /// Square the values represented by the scaling block `s` of `key`.
    fn square_values(&self, key: &Key<D>, s: &CoeffTensor<T>) -> CoeffTensor<T> {
        let values = self.fcube_for_mul(key, key, s);
        let squared = values.emul(&values);
        let scale = 0.5f64.powf(0.5 * D as f64 * key.level() as f64);
        let mut c = squared.transform(&self.cdata.ts.quad_phiw);
        c.scale(T::from_real(scale));
        c
    }
}
