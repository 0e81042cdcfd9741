//! Dense coefficient tensors and the small real matrices that act on them.
//!
//! Coefficient blocks are rank-`d` tensors with every axis of equal length
//! (`k`, `2k` or `npt`), stored row-major over a flat buffer. The transforms
//! contract each axis in turn with a small square matrix, which is the only
//! dense kernel the tree algorithms need.

use bytemuck::Pod;
use cauchy::Scalar;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Scalar types admitted as tree elements.
///
/// Tables and transform matrices are kept in `f64`, so elements are `f64` or
/// `c64`; the `Pod` bound lets coefficient blocks cross the wire as raw
/// bytes, and the serde bounds carry them through the message codec.
pub trait TreeScalar: Scalar<Real = f64> + Pod + Serialize + DeserializeOwned + Send + Sync {}
impl<T: Scalar<Real = f64> + Pod + Serialize + DeserializeOwned + Send + Sync> TreeScalar for T {}

/// Half-open index range along one tensor axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slice {
    /// First index in the range.
    pub start: usize,
    /// One past the last index in the range.
    pub end: usize,
}

impl Slice {
    /// Create the range `[start, end)`.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Length of the range.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Dense row-major `rows x cols` matrix of `f64`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Mat {
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
    /// Row-major entries.
    pub data: Vec<f64>,
}

impl Mat {
    /// Zero matrix of the given shape.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Entry accessor.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    /// Mutable entry accessor.
    #[inline]
    pub fn get_mut(&mut self, i: usize, j: usize) -> &mut f64 {
        &mut self.data[i * self.cols + j]
    }

    /// Transposed copy.
    pub fn transpose(&self) -> Mat {
        let mut t = Mat::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                *t.get_mut(j, i) = self.get(i, j);
            }
        }
        t
    }

    /// Row as a slice.
    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Dense rank-`d` tensor over a flat row-major buffer.
///
/// An empty tensor (`size() == 0`) stands for "no coefficients" throughout
/// the tree code.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoeffTensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: TreeScalar> CoeffTensor<T> {
    /// The empty tensor.
    pub fn empty() -> Self {
        Self {
            shape: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Zero-filled tensor with `dim` points along each of `ndim` axes.
    pub fn zeros(ndim: usize, dim: usize) -> Self {
        Self {
            shape: vec![dim; ndim],
            data: vec![T::zero(); dim.pow(ndim as u32)],
        }
    }

    /// Build from an explicit shape and flat data.
    pub fn from_parts(shape: Vec<usize>, data: Vec<T>) -> Self {
        assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    /// Number of elements; zero for the empty tensor.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// True when no coefficients are stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Length of the first axis, or zero for the empty tensor.
    pub fn dim0(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Shape per axis.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat data.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable flat data.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Frobenius norm.
    pub fn normf(&self) -> f64 {
        self.data.iter().map(|x| x.square()).sum::<f64>().sqrt()
    }

    /// In-place scale by a scalar.
    pub fn scale(&mut self, q: T) -> &mut Self {
        for x in &mut self.data {
            *x *= q;
        }
        self
    }

    /// Scaled copy.
    pub fn scaled(&self, q: T) -> Self {
        let mut r = self.clone();
        r.scale(q);
        r
    }

    /// In-place `self <- alpha*self + beta*other`; shapes must agree.
    pub fn gaxpy(&mut self, alpha: T, other: &Self, beta: T) {
        assert_eq!(self.shape, other.shape, "gaxpy on non-conforming tensors");
        for (x, y) in self.data.iter_mut().zip(other.data.iter()) {
            *x = *x * alpha + *y * beta;
        }
    }

    /// In-place elementwise accumulate; shapes must agree.
    pub fn add_assign(&mut self, other: &Self) {
        assert_eq!(self.shape, other.shape, "accumulate on non-conforming tensors");
        for (x, y) in self.data.iter_mut().zip(other.data.iter()) {
            *x += *y;
        }
    }

    /// Trace-conjugate inner product `sum conj(self) * other`.
    pub fn trace_conj(&self, other: &Self) -> T {
        assert_eq!(self.shape, other.shape, "trace_conj on non-conforming tensors");
        let mut sum = T::zero();
        for (x, y) in self.data.iter().zip(other.data.iter()) {
            sum += x.conj() * *y;
        }
        sum
    }

    /// Elementwise product into a new tensor.
    pub fn emul(&self, other: &Self) -> Self {
        assert_eq!(self.shape, other.shape, "emul on non-conforming tensors");
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(x, y)| *x * *y)
            .collect();
        Self {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Contract the first axis with `m` (summing over the row index of `m`)
    /// and rotate it to the back, writing into `out`.
    fn contract_first(&self, m: &Mat, out: &mut Self) {
        let n0 = self.dim0();
        assert_eq!(n0, m.rows, "transform matrix does not match axis length");
        let rest: usize = self.shape[1..].iter().product();
        out.shape.clear();
        out.shape.extend_from_slice(&self.shape[1..]);
        out.shape.push(m.cols);
        out.data.clear();
        out.data.resize(rest * m.cols, T::zero());
        for j in 0..n0 {
            let mrow = m.row(j);
            let trow = &self.data[j * rest..(j + 1) * rest];
            for (r, &v) in trow.iter().enumerate() {
                let orow = &mut out.data[r * m.cols..(r + 1) * m.cols];
                for (o, &mji) in orow.iter_mut().zip(mrow.iter()) {
                    *o += v.mul_real(mji);
                }
            }
        }
    }

    /// Contract every axis with the same square matrix.
    ///
    /// `result[i...] = sum_j self[j...] prod_a m[j_a, i_a]` - the two-scale
    /// and quadrature workhorse.
    pub fn transform(&self, m: &Mat) -> Self {
        let mut r = Self::empty();
        let mut w = Self::empty();
        self.fast_transform(m, &mut r, &mut w)
    }

    /// `transform` with caller-provided scratch to avoid reallocation in the
    /// recursive hot loops.
    pub fn fast_transform(&self, m: &Mat, r: &mut Self, w: &mut Self) -> Self {
        let mut cur = self.clone();
        for _ in 0..self.ndim() {
            cur.contract_first(m, r);
            std::mem::swap(&mut cur, r);
            std::mem::swap(r, w);
        }
        cur
    }

    /// Contract axis `a` with matrix `ms[a]` for every axis.
    pub fn general_transform(&self, ms: &[Mat]) -> Self {
        assert_eq!(ms.len(), self.ndim());
        let mut cur = self.clone();
        let mut out = Self::empty();
        for m in ms {
            cur.contract_first(m, &mut out);
            std::mem::swap(&mut cur, &mut out);
        }
        cur
    }

    /// Contract `m`'s column index with the tensor's `axis` index, leaving
    /// the result index in place: `out[.., i, ..] = sum_j m[i, j] t[.., j, ..]`.
    pub fn inner_axis(&self, m: &Mat, axis: usize) -> Self {
        let n = self.shape[axis];
        assert_eq!(n, m.cols, "inner_axis matrix does not match axis length");
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let mut shape = self.shape.clone();
        shape[axis] = m.rows;
        let mut data = vec![T::zero(); outer * m.rows * inner];
        for o in 0..outer {
            for i in 0..m.rows {
                let mrow = m.row(i);
                let dst = &mut data[(o * m.rows + i) * inner..(o * m.rows + i + 1) * inner];
                for (j, &mij) in mrow.iter().enumerate() {
                    let src = &self.data[(o * n + j) * inner..(o * n + j + 1) * inner];
                    for (d, &s) in dst.iter_mut().zip(src.iter()) {
                        *d += s.mul_real(mij);
                    }
                }
            }
        }
        Self { shape, data }
    }

    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.ndim()];
        for a in (0..self.ndim().saturating_sub(1)).rev() {
            strides[a] = strides[a + 1] * self.shape[a + 1];
        }
        strides
    }

    fn for_each_patch_index(&self, patch: &[Slice], mut f: impl FnMut(usize, usize)) {
        // Walks the patch in row-major order, handing out (flat index in
        // self, flat index in the patch) pairs.
        assert_eq!(patch.len(), self.ndim());
        let strides = self.strides();
        let plen: Vec<usize> = patch.iter().map(|s| s.len()).collect();
        let total: usize = plen.iter().product();
        let mut idx = vec![0usize; patch.len()];
        for p in 0..total {
            let mut flat = 0;
            for a in 0..patch.len() {
                flat += (patch[a].start + idx[a]) * strides[a];
            }
            f(flat, p);
            for a in (0..patch.len()).rev() {
                idx[a] += 1;
                if idx[a] < plen[a] {
                    break;
                }
                idx[a] = 0;
            }
        }
    }

    /// Copy the sub-block selected by `patch` into a new tensor.
    pub fn patch(&self, patch: &[Slice]) -> Self {
        let shape: Vec<usize> = patch.iter().map(|s| s.len()).collect();
        let mut data = vec![T::zero(); shape.iter().product()];
        self.for_each_patch_index(patch, |flat, p| data[p] = self.data[flat]);
        Self { shape, data }
    }

    /// Overwrite the sub-block selected by `patch` with `src`.
    pub fn assign_patch(&mut self, patch: &[Slice], src: &Self) {
        let shape: Vec<usize> = patch.iter().map(|s| s.len()).collect();
        assert_eq!(shape, src.shape, "assign_patch shape mismatch");
        let strides = self.strides();
        let plen = shape;
        let total: usize = plen.iter().product();
        let mut idx = vec![0usize; patch.len()];
        for p in 0..total {
            let mut flat = 0;
            for a in 0..patch.len() {
                flat += (patch[a].start + idx[a]) * strides[a];
            }
            self.data[flat] = src.data[p];
            for a in (0..patch.len()).rev() {
                idx[a] += 1;
                if idx[a] < plen[a] {
                    break;
                }
                idx[a] = 0;
            }
        }
    }

    /// Accumulate `src` into the sub-block selected by `patch`.
    pub fn add_patch(&mut self, patch: &[Slice], src: &Self) {
        let shape: Vec<usize> = patch.iter().map(|s| s.len()).collect();
        assert_eq!(shape, src.shape, "add_patch shape mismatch");
        let mut i = 0;
        let strides = self.strides();
        let total: usize = shape.iter().product();
        let mut idx = vec![0usize; patch.len()];
        while i < total {
            let mut flat = 0;
            for a in 0..patch.len() {
                flat += (patch[a].start + idx[a]) * strides[a];
            }
            self.data[flat] += src.data[i];
            i += 1;
            for a in (0..patch.len()).rev() {
                idx[a] += 1;
                if idx[a] < shape[a] {
                    break;
                }
                idx[a] = 0;
            }
        }
    }

    /// Zero the sub-block selected by `patch`.
    pub fn zero_patch(&mut self, patch: &[Slice]) {
        let mut zeros = Vec::new();
        self.for_each_patch_index(patch, |flat, _| zeros.push(flat));
        for flat in zeros {
            self.data[flat] = T::zero();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn identity(n: usize) -> Mat {
        let mut m = Mat::zeros(n, n);
        for i in 0..n {
            *m.get_mut(i, i) = 1.0;
        }
        m
    }

    #[test]
    fn transform_with_identity_is_identity() {
        let t = CoeffTensor::<f64>::from_parts(vec![3, 3], (0..9).map(|x| x as f64).collect());
        let r = t.transform(&identity(3));
        for (a, b) in t.data().iter().zip(r.data().iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-14);
        }
    }

    #[test]
    fn transform_matches_explicit_contraction_in_2d() {
        let t = CoeffTensor::<f64>::from_parts(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let mut m = Mat::zeros(2, 2);
        *m.get_mut(0, 0) = 1.0;
        *m.get_mut(0, 1) = 2.0;
        *m.get_mut(1, 0) = -1.0;
        *m.get_mut(1, 1) = 0.5;
        let r = t.transform(&m);
        for i in 0..2 {
            for j in 0..2 {
                let mut expect = 0.0;
                for p in 0..2 {
                    for q in 0..2 {
                        expect += t.data()[p * 2 + q] * m.get(p, i) * m.get(q, j);
                    }
                }
                assert_relative_eq!(r.data()[i * 2 + j], expect, max_relative = 1e-14);
            }
        }
    }

    #[test]
    fn patch_round_trip() {
        let mut t = CoeffTensor::<f64>::zeros(2, 4);
        let block =
            CoeffTensor::<f64>::from_parts(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let patch = vec![Slice::new(2, 4), Slice::new(0, 2)];
        t.assign_patch(&patch, &block);
        let back = t.patch(&patch);
        assert_eq!(back.data(), block.data());
        assert_relative_eq!(t.normf(), block.normf(), max_relative = 1e-14);
        t.zero_patch(&patch);
        assert_relative_eq!(t.normf(), 0.0);
    }

    #[test]
    fn inner_axis_contracts_one_axis_only() {
        let t = CoeffTensor::<f64>::from_parts(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let mut m = Mat::zeros(2, 2);
        *m.get_mut(0, 1) = 1.0;
        *m.get_mut(1, 0) = 1.0;
        // Swap along axis 0: rows exchange.
        let r = t.inner_axis(&m, 0);
        assert_eq!(r.data(), &[3.0, 4.0, 1.0, 2.0]);
        // Swap along axis 1: columns exchange.
        let r = t.inner_axis(&m, 1);
        assert_eq!(r.data(), &[2.0, 1.0, 4.0, 3.0]);
    }
}
