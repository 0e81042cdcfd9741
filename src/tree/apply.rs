//! Integral-operator application over the non-standard form, with norm
//! screening, displacement monotonicity, and the decayed per-key timing
//! record consumed by load balancing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::constants::{APPLY_SCREEN_FAC, APPLY_TIME_DECAY};
use crate::container::NodeOp;
use crate::key::Key;
use crate::runtime::Priority;
use crate::tensor::{CoeffTensor, TreeScalar};
use crate::tree::{FunctionTree, TreeImpl};

/// An integral operator in separated form, applied box by box.
///
/// Displacement lists must be isotropic and ordered so that the operator
/// norm decays monotonically with distance; screening relies on it.
pub trait IntegralOperator<T: TreeScalar, const D: usize>: Send + Sync {
    /// Neighbour displacements relevant at `level`.
    fn displacements(&self, level: u8) -> Vec<[i64; D]>;

    /// Operator norm of the block coupling a box at `level` to the box
    /// `disp` away.
    fn norm(&self, level: u8, disp: &[i64; D]) -> f64;

    /// Apply the operator block for `disp` to a source coefficient block.
    fn apply(
        &self,
        source: &Key<D>,
        disp: &[i64; D],
        coeff: &CoeffTensor<T>,
        tol: f64,
    ) -> CoeffTensor<T>;

    /// Whether pure leaf scaling blocks are also driven through the
    /// operator.
    fn doleaves(&self) -> bool {
        false
    }
}

/// Exponentially decayed per-key wallclock of operator application.
pub struct ApplyTime<const D: usize> {
    table: Mutex<HashMap<Key<D>, f64>>,
    decay: f64,
}

impl<const D: usize> ApplyTime<D> {
    /// Empty record with the standard decay.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            decay: APPLY_TIME_DECAY,
        }
    }

    /// Recorded time for `key`, zero if never measured.
    pub fn get(&self, key: &Key<D>) -> f64 {
        self.table.lock().get(key).copied().unwrap_or(0.0)
    }

    /// Fold a new measurement into the record: `s <- s + (y - s) * decay`.
    pub fn update(&self, key: &Key<D>, y: f64) {
        let mut table = self.table.lock();
        match table.get_mut(key) {
            Some(s) => *s += (y - *s) * self.decay,
            None => {
                table.insert(*key, y);
            }
        }
    }

    /// Overwrite the record for `key`.
    pub fn set(&self, key: &Key<D>, value: f64) {
        self.table.lock().insert(*key, value);
    }

    /// Drop all measurements.
    pub fn clear(&self) {
        self.table.lock().clear();
    }

    /// Snapshot of all measurements.
    pub fn entries(&self) -> Vec<(Key<D>, f64)> {
        self.table.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

impl<const D: usize> Default for ApplyTime<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TreeScalar, const D: usize> FunctionTree<T, D> {
    /// `self <- op(f)` over the source tree's non-standard form; `self`
    /// starts empty and ends in the same compression state as `f`.
    pub fn apply<Op: IntegralOperator<T, D> + 'static>(
        &self,
        op: &Arc<Op>,
        f: &Self,
        fence: bool,
    ) {
        let tree = &self.inner;
        let ftree = &f.inner;
        tree.compressed
            .store(f.is_compressed(), std::sync::atomic::Ordering::Release);
        tree.nonstandard
            .store(f.is_nonstandard(), std::sync::atomic::Ordering::Release);
        for key in ftree.coeffs.local_keys() {
            let Some(node) = ftree.coeffs.get_local(&key) else { continue };
            if !node.has_coeff() {
                continue;
            }
            if node.coeff().dim0() != tree.k || op.doleaves() {
                let this = tree.clone();
                let op = op.clone();
                let c = node.coeff().clone();
                tree.world
                    .taskq()
                    .add(Priority::Normal, move || this.do_apply(&op, &key, c));
            }
        }
        if fence {
            tree.world.gop().fence();
        }
    }

    /// Timing record of the last `apply` calls on this tree.
    pub fn apply_time(&self) -> &ApplyTime<D> {
        &self.inner.apply_time
    }
}

impl<T: TreeScalar, const D: usize> TreeImpl<T, D> {
    /// Walk the displacement list of one source box, screening on the
    /// product of coefficient and operator norms.
    pub(crate) fn do_apply<Op: IntegralOperator<T, D> + 'static>(
        self: &Arc<Self>,
        op: &Arc<Op>,
        key: &Key<D>,
        c: CoeffTensor<T>,
    ) {
        let start = Instant::now();
        let fac = APPLY_SCREEN_FAC;
        let cnorm = c.normf();
        let level = key.level();
        let lmax = if level == 0 { 0 } else { 1i64 << (level - 1) };
        let tol = self.truncate_tol(self.thresh, key);

        for disp in op.displacements(level) {
            // Periodic directions cap displacements at half the unit cell
            // to avoid double counting.
            let mut doit = true;
            for i in 0..D {
                if self.bc.is_periodic(i) {
                    if disp[i] > lmax || disp[i] <= -lmax {
                        doit = false;
                    }
                    break;
                }
            }
            if !doit {
                break;
            }

            let dest = self.neighbor_disp(key, &disp);
            if dest.is_valid() {
                let opnorm = op.norm(level, &disp);
                if cnorm * opnorm > tol / fac {
                    let this = self.clone();
                    let op = op.clone();
                    let key = *key;
                    let c = c.clone();
                    self.world.taskq().add(Priority::Normal, move || {
                        this.do_apply_kernel(&op, &key, &disp, &dest, &c, tol, fac, cnorm)
                    });
                } else if disp.iter().map(|l| l * l).sum::<i64>() >= 1 {
                    // Monotonic decay beyond the nearest neighbour.
                    break;
                }
            }
        }

        self.apply_time.update(key, start.elapsed().as_secs_f64());
    }

    /// Apply one operator block and accumulate the screened result into
    /// the destination node.
    #[allow(clippy::too_many_arguments)]
    fn do_apply_kernel<Op: IntegralOperator<T, D>>(
        &self,
        op: &Arc<Op>,
        key: &Key<D>,
        disp: &[i64; D],
        dest: &Key<D>,
        c: &CoeffTensor<T>,
        tol: f64,
        fac: f64,
        cnorm: f64,
    ) {
        let result = op.apply(key, disp, c, tol / fac / cnorm);
        // Screen again to keep negligible blocks off the wire and the tree
        // from widening needlessly.
        if result.normf() > 0.3 * tol / fac {
            self.coeffs.send_op(NodeOp::Accumulate {
                key: *dest,
                coeff: result,
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn apply_time_decays_toward_new_measurements() {
        let record = ApplyTime::<2>::new();
        let key = Key::<2>::root();
        assert_eq!(record.get(&key), 0.0);
        record.update(&key, 1.0);
        assert!((record.get(&key) - 1.0).abs() < 1e-15);
        record.update(&key, 0.0);
        // s <- 1 + (0 - 1)*0.9 = 0.1
        assert!((record.get(&key) - 0.1).abs() < 1e-12);
        record.clear();
        assert_eq!(record.entries().len(), 0);
    }
}
