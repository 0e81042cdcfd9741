//! Nodes of the coefficient tree.

use serde::{Deserialize, Serialize};

use crate::constants::{KMAX, NORM_TREE_UNSET};
use crate::tensor::{CoeffTensor, TreeScalar};

/// One node of the 2^D-ary coefficient tree.
///
/// A node may carry scaling coefficients (`k^D`), concatenated
/// scaling+wavelet coefficients (`(2k)^D`) or nothing at all; a node with
/// neither coefficients nor children only exists transiently while a remote
/// operation is materializing it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node<T> {
    coeff: CoeffTensor<T>,
    has_children: bool,
    norm_tree: f64,
}

impl<T: TreeScalar> Default for Node<T> {
    fn default() -> Self {
        Self {
            coeff: CoeffTensor::empty(),
            has_children: false,
            norm_tree: NORM_TREE_UNSET,
        }
    }
}

impl<T: TreeScalar> Node<T> {
    /// Node with the given coefficients and child flag.
    pub fn with_coeff(coeff: CoeffTensor<T>, has_children: bool) -> Self {
        assert!(coeff.dim0() <= 2 * KMAX, "coefficient tensor too large");
        Self {
            coeff,
            has_children,
            norm_tree: NORM_TREE_UNSET,
        }
    }

    /// Interior node without coefficients.
    pub fn interior() -> Self {
        Self {
            coeff: CoeffTensor::empty(),
            has_children: true,
            norm_tree: NORM_TREE_UNSET,
        }
    }

    /// True if coefficients are stored.
    pub fn has_coeff(&self) -> bool {
        !self.coeff.is_empty()
    }

    /// True if the node has children.
    pub fn has_children(&self) -> bool {
        self.has_children
    }

    /// True if the node has no children.
    pub fn is_leaf(&self) -> bool {
        !self.has_children
    }

    /// True for the transient state with neither coefficients nor children.
    pub fn is_invalid(&self) -> bool {
        !self.has_coeff() && !self.has_children()
    }

    /// Coefficient tensor; empty when none are stored.
    pub fn coeff(&self) -> &CoeffTensor<T> {
        &self.coeff
    }

    /// Mutable coefficient tensor.
    pub fn coeff_mut(&mut self) -> &mut CoeffTensor<T> {
        &mut self.coeff
    }

    /// Replace the coefficients.
    pub fn set_coeff(&mut self, coeff: CoeffTensor<T>) {
        assert!(coeff.dim0() <= 2 * KMAX, "coefficient tensor too large");
        self.coeff = coeff;
    }

    /// Drop the coefficients.
    pub fn clear_coeff(&mut self) {
        self.coeff = CoeffTensor::empty();
    }

    /// Set the child flag.
    pub fn set_has_children(&mut self, flag: bool) {
        self.has_children = flag;
    }

    /// Cached subtree norm; `NORM_TREE_UNSET` when not yet computed.
    pub fn norm_tree(&self) -> f64 {
        self.norm_tree
    }

    /// Store the subtree norm.
    pub fn set_norm_tree(&mut self, norm: f64) {
        self.norm_tree = norm;
    }

    /// `self <- alpha*self + beta*other` on the coefficients, with the child
    /// flag becoming the OR of the two. Either side may lack coefficients.
    pub fn gaxpy_inplace(&mut self, alpha: T, other: &Node<T>, beta: T) {
        if other.has_children() {
            self.has_children = true;
        }
        if self.has_coeff() {
            if other.has_coeff() {
                self.coeff.gaxpy(alpha, &other.coeff, beta);
            } else {
                self.coeff.scale(alpha);
            }
        } else if other.has_coeff() {
            self.coeff = other.coeff.scaled(beta);
        }
    }

    /// Accumulate coefficients in place. Returns true when the node was a
    /// fresh leaf without coefficients, in which case the caller must
    /// register it with its parent.
    pub fn accumulate(&mut self, t: &CoeffTensor<T>) -> bool {
        if self.has_coeff() {
            self.coeff.add_assign(t);
            false
        } else {
            self.coeff = t.clone();
            !self.has_children
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gaxpy_merges_coefficients_and_children() {
        let a = CoeffTensor::<f64>::from_parts(vec![2], vec![1.0, 2.0]);
        let b = CoeffTensor::<f64>::from_parts(vec![2], vec![10.0, 20.0]);
        let mut left = Node::with_coeff(a, false);
        let right = Node::with_coeff(b, true);
        left.gaxpy_inplace(2.0, &right, 0.5);
        assert!(left.has_children());
        assert_relative_eq!(left.coeff().data()[0], 7.0);
        assert_relative_eq!(left.coeff().data()[1], 14.0);
    }

    #[test]
    fn gaxpy_into_empty_scales_other() {
        let b = CoeffTensor::<f64>::from_parts(vec![2], vec![4.0, 8.0]);
        let mut left = Node::<f64>::default();
        left.gaxpy_inplace(3.0, &Node::with_coeff(b, false), 0.25);
        assert_relative_eq!(left.coeff().data()[0], 1.0);
        assert_relative_eq!(left.coeff().data()[1], 2.0);
    }

    #[test]
    fn accumulate_reports_fresh_leaves() {
        let t = CoeffTensor::<f64>::from_parts(vec![2], vec![1.0, 1.0]);
        let mut node = Node::<f64>::default();
        assert!(node.accumulate(&t));
        assert!(!node.accumulate(&t));
        assert_relative_eq!(node.coeff().data()[0], 2.0);
    }
}
