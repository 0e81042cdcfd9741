//! Per-order tables shared by every tree of a given wavelet order `k`.
//!
//! Holds the Gauss-Legendre rule on `[0, 1]`, the Legendre scaling-function
//! evaluation matrices, the two-scale matrices `h0, h1, g0, g1` with their
//! composed `2k x 2k` forms, and the periodic central-difference blocks.
//! Tables are computed on first request for a given `k` and shared read-only
//! afterwards.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use itertools::izip;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::constants::KMAX;
use crate::key::Key;
use crate::tensor::{Mat, Slice};

/// Immutable numerical tables for one wavelet order.
#[derive(Debug)]
pub struct TwoScale {
    /// Wavelet order.
    pub k: usize,
    /// Number of quadrature points (equal to `k`).
    pub npt: usize,
    /// `s[i] = [i*k, (i+1)*k)`.
    pub s: [Slice; 4],
    /// Gauss-Legendre nodes on `[0, 1]`.
    pub quad_x: Vec<f64>,
    /// Gauss-Legendre weights on `[0, 1]`.
    pub quad_w: Vec<f64>,
    /// `quad_phi[i][j]`: value of scaling function `j` at node `i` (`npt x k`).
    pub quad_phi: Mat,
    /// `quad_phiw[i][j] = w[i] * phi_j(x_i)` (`npt x k`).
    pub quad_phiw: Mat,
    /// Transpose of `quad_phi` (`k x npt`).
    pub quad_phit: Mat,
    /// Low-half block of the two-scale relation (`k x k`).
    pub h0: Mat,
    /// High-half block of the two-scale relation (`k x k`).
    pub h1: Mat,
    /// Low-half wavelet block (`k x k`).
    pub g0: Mat,
    /// High-half wavelet block (`k x k`).
    pub g1: Mat,
    /// Composed orthogonal two-scale matrix `[[h0 h1]; [g0 g1]]` (`2k x 2k`),
    /// used by `unfilter`.
    pub hg: Mat,
    /// Transpose of `hg`, used by `filter`.
    pub hg_t: Mat,
    /// Central block of the periodic difference operator.
    pub r0: Mat,
    /// Coupling to the right neighbour.
    pub rm: Mat,
    /// Coupling to the left neighbour.
    pub rp: Mat,
    /// Rank-1 factors of `rm` and `rp`.
    pub rm_left: Vec<f64>,
    /// See `rm_left`.
    pub rm_right: Vec<f64>,
    /// See `rm_left`.
    pub rp_left: Vec<f64>,
    /// See `rm_left`.
    pub rp_right: Vec<f64>,
}

/// Values of the first `k` normalized Legendre scaling functions at `x`.
///
/// `phi_j(x) = sqrt(2j + 1) P_j(2x - 1)` on `[0, 1]`.
pub fn legendre_scaling_values(k: usize, x: f64) -> Vec<f64> {
    let z = 2.0 * x - 1.0;
    let mut p = vec![0.0; k];
    let mut p0 = 1.0;
    let mut p1 = z;
    for (j, phi) in p.iter_mut().enumerate() {
        let pj = if j == 0 {
            p0
        } else if j == 1 {
            p1
        } else {
            let jf = (j - 1) as f64;
            let pj = ((2.0 * jf + 1.0) * z * p1 - jf * p0) / (jf + 1.0);
            p0 = p1;
            p1 = pj;
            pj
        };
        *phi = ((2 * j + 1) as f64).sqrt() * pj;
    }
    p
}

/// Gauss-Legendre nodes and weights on `[0, 1]` by Newton iteration.
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut x = vec![0.0; n];
    let mut w = vec![0.0; n];
    for i in 0..(n + 1) / 2 {
        let mut z = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut pp;
        loop {
            let mut p1 = 1.0;
            let mut p2 = 0.0;
            for j in 0..n {
                let p3 = p2;
                p2 = p1;
                let jf = j as f64;
                p1 = ((2.0 * jf + 1.0) * z * p2 - jf * p3) / (jf + 1.0);
            }
            pp = n as f64 * (z * p1 - p2) / (z * z - 1.0);
            let z1 = z;
            z = z1 - p1 / pp;
            if (z - z1).abs() < 5e-16 {
                break;
            }
        }
        // Map the symmetric pair from [-1, 1] onto [0, 1].
        x[i] = 0.5 * (1.0 - z);
        x[n - 1 - i] = 0.5 * (1.0 + z);
        let wi = 1.0 / ((1.0 - z * z) * pp * pp);
        w[i] = wi;
        w[n - 1 - i] = wi;
    }
    (x, w)
}

impl TwoScale {
    fn new(k: usize) -> Self {
        assert!(k >= 1 && k <= KMAX, "illegal wavelet order {}", k);
        let npt = k;
        let (quad_x, quad_w) = gauss_legendre(npt);

        let mut quad_phi = Mat::zeros(npt, k);
        let mut quad_phiw = Mat::zeros(npt, k);
        for (i, (&xq, &wq)) in izip!(&quad_x, &quad_w).enumerate() {
            let phi = legendre_scaling_values(k, xq);
            for j in 0..k {
                *quad_phi.get_mut(i, j) = phi[j];
                *quad_phiw.get_mut(i, j) = wq * phi[j];
            }
        }
        let quad_phit = quad_phi.transpose();

        let (h0, h1) = Self::make_h_blocks(k, &quad_x, &quad_w);
        let (hg, hg_t, g0, g1) = Self::complete_twoscale(k, &h0, &h1);
        let (r0, rm, rp, rm_left, rm_right, rp_left, rp_right) = Self::make_dc_periodic(k);

        let s = [
            Slice::new(0, k),
            Slice::new(k, 2 * k),
            Slice::new(2 * k, 3 * k),
            Slice::new(3 * k, 4 * k),
        ];

        Self {
            k,
            npt,
            s,
            quad_x,
            quad_w,
            quad_phi,
            quad_phiw,
            quad_phit,
            h0,
            h1,
            g0,
            g1,
            hg,
            hg_t,
            r0,
            rm,
            rp,
            rm_left,
            rm_right,
            rp_left,
            rp_right,
        }
    }

    /// Two-scale blocks of the scaling functions by exact quadrature:
    /// `h0[i][j] = sqrt(1/2) int phi_i(y/2) phi_j(y) dy` and the mirrored
    /// `h1` block on the right half. The integrands are polynomials of
    /// degree `< 2k`, so the `k`-point rule is exact.
    fn make_h_blocks(k: usize, quad_x: &[f64], quad_w: &[f64]) -> (Mat, Mat) {
        let mut h0 = Mat::zeros(k, k);
        let mut h1 = Mat::zeros(k, k);
        let scale = 0.5f64.sqrt();
        for (&xq, &wq) in quad_x.iter().zip(quad_w.iter()) {
            let child = legendre_scaling_values(k, xq);
            let lo = legendre_scaling_values(k, 0.5 * xq);
            let hi = legendre_scaling_values(k, 0.5 * (xq + 1.0));
            for i in 0..k {
                for j in 0..k {
                    *h0.get_mut(i, j) += scale * wq * lo[i] * child[j];
                    *h1.get_mut(i, j) += scale * wq * hi[i] * child[j];
                }
            }
        }
        (h0, h1)
    }

    /// Complete the `[h0 h1]` rows to an orthonormal `2k x 2k` matrix by
    /// Gram-Schmidt over canonical seeds. The lower `k` rows span the
    /// wavelet space; orthogonality to the scaling rows gives them vanishing
    /// moments through order `k - 1`.
    fn complete_twoscale(k: usize, h0: &Mat, h1: &Mat) -> (Mat, Mat, Mat, Mat) {
        let n = 2 * k;
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(n);
        for i in 0..k {
            let mut row = vec![0.0; n];
            row[..k].copy_from_slice(h0.row(i));
            row[k..].copy_from_slice(h1.row(i));
            rows.push(row);
        }
        let mut seed = 0;
        while rows.len() < n {
            assert!(seed < n, "two-scale completion ran out of seeds");
            let mut v = vec![0.0; n];
            v[seed] = 1.0;
            seed += 1;
            // Re-orthogonalize once for stability.
            for _ in 0..2 {
                for row in &rows {
                    let dot: f64 = row.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
                    for (vi, ri) in v.iter_mut().zip(row.iter()) {
                        *vi -= dot * ri;
                    }
                }
            }
            let norm: f64 = v.iter().map(|a| a * a).sum::<f64>().sqrt();
            if norm > 1e-10 {
                for vi in &mut v {
                    *vi /= norm;
                }
                rows.push(v);
            }
        }

        let mut hg = Mat::zeros(n, n);
        for (i, row) in rows.iter().enumerate() {
            hg.data[i * n..(i + 1) * n].copy_from_slice(row);
        }
        let hg_t = hg.transpose();

        let mut g0 = Mat::zeros(k, k);
        let mut g1 = Mat::zeros(k, k);
        for i in 0..k {
            for j in 0..k {
                *g0.get_mut(i, j) = hg.get(k + i, j);
                *g1.get_mut(i, j) = hg.get(k + i, k + j);
            }
        }
        (hg, hg_t, g0, g1)
    }

    /// Level-0 blocks of the periodic central-difference derivative.
    #[allow(clippy::type_complexity)]
    fn make_dc_periodic(
        k: usize,
    ) -> (Mat, Mat, Mat, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut r0 = Mat::zeros(k, k);
        let mut rm = Mat::zeros(k, k);
        let mut rp = Mat::zeros(k, k);
        let mut iphase = 1.0;
        for i in 0..k {
            let mut jphase = 1.0;
            for j in 0..k {
                let gammaij = (((2 * i + 1) * (2 * j + 1)) as f64).sqrt();
                let kij = if i > j && (i - j) % 2 == 1 { 2.0 } else { 0.0 };
                *r0.get_mut(i, j) = 0.5 * (1.0 - iphase * jphase - 2.0 * kij) * gammaij;
                *rm.get_mut(i, j) = 0.5 * jphase * gammaij;
                *rp.get_mut(i, j) = -0.5 * iphase * gammaij;
                jphase = -jphase;
            }
            iphase = -iphase;
        }

        let mut rm_left = vec![0.0; k];
        let mut rm_right = vec![0.0; k];
        let mut rp_left = vec![0.0; k];
        let mut rp_right = vec![0.0; k];
        let mut iphase = 1.0;
        for i in 0..k {
            let gamma = (0.5 * (2 * i + 1) as f64).sqrt();
            rm_left[i] = gamma;
            rp_right[i] = gamma;
            rm_right[i] = gamma * iphase;
            rp_left[i] = -gamma * iphase;
            iphase = -iphase;
        }

        (r0, rm, rp, rm_left, rm_right, rp_left, rp_right)
    }
}

static CACHE: Lazy<RwLock<HashMap<usize, Arc<TwoScale>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Tables for order `k`, computed on first request.
pub fn get(k: usize) -> Arc<TwoScale> {
    if let Some(ts) = CACHE.read().get(&k) {
        return ts.clone();
    }
    let mut cache = CACHE.write();
    cache
        .entry(k)
        .or_insert_with(|| Arc::new(TwoScale::new(k)))
        .clone()
}

/// Dimension-expanded views of the per-order tables for one tree.
#[derive(Debug, Clone)]
pub struct CommonData<const D: usize> {
    /// Shared per-order tables.
    pub ts: Arc<TwoScale>,
    /// The scaling block `[0, k)` in every dimension.
    pub s0: Vec<Slice>,
    /// The low-order half `[0, (k+1)/2)` in every dimension, for the
    /// autorefine test.
    pub sh: Vec<Slice>,
}

impl<const D: usize> CommonData<D> {
    /// Build the dimension-expanded views for order `k`.
    pub fn new(k: usize) -> Self {
        let ts = get(k);
        let s0 = vec![ts.s[0]; D];
        let sh = vec![Slice::new(0, (k + 1) / 2); D];
        Self { ts, s0, sh }
    }

    /// Wavelet order.
    pub fn k(&self) -> usize {
        self.ts.k
    }

    /// Patch of a child's scaling block inside its parent's `(2k)^D`
    /// tensor, selected by the low bit of each translation component.
    pub fn child_patch(&self, child: &Key<D>) -> Vec<Slice> {
        let k = self.ts.k;
        child
            .translation()
            .iter()
            .map(|&l| {
                if l & 1 == 0 {
                    Slice::new(0, k)
                } else {
                    Slice::new(k, 2 * k)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quadrature_integrates_polynomials_exactly() {
        let (x, w) = gauss_legendre(5);
        // int_0^1 x^p dx = 1/(p+1) for p <= 2n-1 = 9
        for p in 0..10u32 {
            let approx: f64 = x
                .iter()
                .zip(w.iter())
                .map(|(&xi, &wi)| wi * xi.powi(p as i32))
                .sum();
            assert_relative_eq!(approx, 1.0 / (p as f64 + 1.0), max_relative = 1e-12);
        }
    }

    #[test]
    fn scaling_functions_are_orthonormal() {
        let k = 6;
        let (x, w) = gauss_legendre(k);
        for i in 0..k {
            for j in 0..k {
                let mut dot = 0.0;
                for (&xq, &wq) in x.iter().zip(w.iter()) {
                    let phi = legendre_scaling_values(k, xq);
                    dot += wq * phi[i] * phi[j];
                }
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(dot, expect, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn composed_twoscale_matrix_is_orthogonal() {
        for k in [1, 2, 5, 8] {
            let ts = get(k);
            let n = 2 * k;
            for i in 0..n {
                for j in 0..n {
                    let mut dot = 0.0;
                    for p in 0..n {
                        dot += ts.hg.get(i, p) * ts.hg.get(j, p);
                    }
                    let expect = if i == j { 1.0 } else { 0.0 };
                    assert_relative_eq!(dot, expect, epsilon = 1e-10);
                }
            }
        }
    }

    #[test]
    fn wavelet_rows_have_vanishing_moments() {
        // Rows k..2k of hg are orthogonal to every scaling row, hence to
        // every polynomial of degree < k expanded over the children.
        let k = 4;
        let ts = get(k);
        let (x, w) = gauss_legendre(k);
        for p in 0..k as u32 {
            // Expand x^p over the two child boxes in the child basis.
            let mut child = vec![0.0; 2 * k];
            for (&xq, &wq) in x.iter().zip(w.iter()) {
                let phi = legendre_scaling_values(k, xq);
                for j in 0..k {
                    let sqrt2 = 2.0f64.sqrt();
                    // Left child covers [0, 1/2): y = xq/2.
                    child[j] += wq * 0.5 * (0.5 * xq).powi(p as i32) * phi[j] * sqrt2;
                    // Right child covers [1/2, 1).
                    child[k + j] +=
                        wq * 0.5 * (0.5 * (xq + 1.0)).powi(p as i32) * phi[j] * sqrt2;
                }
            }
            for row in k..2 * k {
                let mut moment = 0.0;
                for (q, c) in child.iter().enumerate() {
                    moment += ts.hg.get(row, q) * c;
                }
                assert_relative_eq!(moment, 0.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn filter_inverts_unfilter_on_random_blocks() {
        use crate::tensor::CoeffTensor;
        use rand::Rng;
        let k = 5;
        let ts = get(k);
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..(2 * k) * (2 * k)).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let s = CoeffTensor::from_parts(vec![2 * k, 2 * k], data);
        let round = s.transform(&ts.hg_t).transform(&ts.hg);
        for (a, b) in s.data().iter().zip(round.data().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn derivative_blocks_for_constants() {
        let ts = get(1);
        assert_relative_eq!(ts.r0.get(0, 0), 0.0);
        assert_relative_eq!(ts.rm.get(0, 0), 0.5);
        assert_relative_eq!(ts.rp.get(0, 0), -0.5);
        assert_relative_eq!(ts.rm_left[0] * ts.rm_right[0], ts.rm.get(0, 0));
        assert_relative_eq!(ts.rp_left[0] * ts.rp_right[0], ts.rp.get(0, 0));
    }
}
