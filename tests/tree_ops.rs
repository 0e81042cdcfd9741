//! End-to-end behaviour of the function tree on a single rank.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use approx::assert_relative_eq;
use num::Complex;

use multiwavelet::comm::NoComm;
use multiwavelet::factory::{BoundaryConds, TreeFactory};
use multiwavelet::key::Key;
use multiwavelet::pmap::LevelHashMap;
use multiwavelet::rmi::RmiConfig;
use multiwavelet::tensor::{CoeffTensor, Slice};
use multiwavelet::tree::apply::IntegralOperator;
use multiwavelet::tree::FunctionTree;
use multiwavelet::twoscale::gauss_legendre;
use multiwavelet::world::World;

fn world() -> Arc<World> {
    World::with_config(Arc::new(NoComm), RmiConfig::default(), 2)
}

/// Reference value of `int_0^1 f(x) dx` by a high-order rule.
fn integrate_1d(f: impl Fn(f64) -> f64) -> f64 {
    let (x, w) = gauss_legendre(48);
    x.iter().zip(w.iter()).map(|(&xi, &wi)| wi * f(xi)).sum()
}

#[test]
fn projected_gaussian_norm_matches_analytic_integral() {
    let world = world();
    let f = TreeFactory::<f64, 3>::new(world)
        .k(6)
        .thresh(1e-6)
        .f(|x| (-(x[0] * x[0] + x[1] * x[1] + x[2] * x[2])).exp())
        .build()
        .unwrap();
    f.compress(false, false, true);
    // int f^2 over the unit cube separates into a 1-D factor cubed.
    let reference = integrate_1d(|x| (-2.0 * x * x).exp()).powi(3);
    assert!((f.norm2sq() - reference).abs() < 1e-6);
}

#[test]
fn compress_reconstruct_round_trips_leaf_coefficients() {
    let world = world();
    let f = TreeFactory::<f64, 2>::new(world)
        .k(5)
        .thresh(1e-5)
        .f(|x| (-(x[0] * x[0] + 2.0 * x[1] * x[1])).exp())
        .build()
        .unwrap();

    let mut before: HashMap<Key<2>, CoeffTensor<f64>> = HashMap::new();
    f.for_each_local_node(|key, node| {
        if node.has_coeff() {
            before.insert(*key, node.coeff().clone());
        }
    });
    assert!(!before.is_empty());

    f.compress(false, false, true);
    f.reconstruct(true);

    let mut checked = 0;
    f.for_each_local_node(|key, node| {
        if let Some(original) = before.get(key) {
            assert!(node.has_coeff(), "leaf {key} lost its coefficients");
            let mut diff = node.coeff().clone();
            diff.gaxpy(1.0, original, -1.0);
            assert!(
                diff.normf() <= 1e-12 * (1.0 + original.normf()),
                "round trip changed coefficients at {key}"
            );
            checked += 1;
        }
    });
    assert_eq!(checked, before.len());
}

#[test]
fn mode_classification_after_reconstruct_and_compress() {
    let world = world();
    let k = 4;
    let f = TreeFactory::<f64, 2>::new(world)
        .k(k)
        .thresh(1e-4)
        .f(|x| (x[0] + 0.5 * x[1]).sin())
        .build()
        .unwrap();

    // Reconstructed: interior nodes empty, leaves carry k^d scaling blocks.
    f.for_each_local_node(|key, node| {
        if node.has_children() {
            assert!(!node.has_coeff(), "interior node {key} holds coefficients");
        } else {
            assert!(node.has_coeff());
            assert_eq!(node.coeff().dim0(), k);
        }
    });

    f.compress(false, false, true);
    let s0: Vec<Slice> = (0..2).map(|_| Slice::new(0, k)).collect();
    f.for_each_local_node(|key, node| {
        if node.has_coeff() {
            assert_eq!(node.coeff().dim0(), 2 * k);
            if key.level() > 0 {
                assert_eq!(
                    node.coeff().patch(&s0).normf(),
                    0.0,
                    "interior scaling block of {key} not zeroed"
                );
            }
        }
    });
}

#[test]
fn gaxpy_algebra_commutes_with_compression() {
    let world = world();
    let pmap = Arc::new(LevelHashMap::new(1));
    let a = TreeFactory::<f64, 1>::new(world.clone())
        .k(7)
        .thresh(1e-8)
        .pmap(pmap.clone())
        .f(|x| (PI * x[0]).sin())
        .build()
        .unwrap();
    let b = TreeFactory::<f64, 1>::new(world)
        .k(7)
        .thresh(1e-8)
        .pmap(pmap)
        .f(|x| (-3.0 * x[0] * x[0]).exp())
        .build()
        .unwrap();

    let na = a.norm2sq();
    a.compress(false, false, true);
    b.compress(false, false, true);
    // Parseval: compression preserves the norm.
    assert_relative_eq!(a.norm2sq(), na, max_relative = 1e-10);

    let ab = a.inner(&b);
    let c = a.empty_clone(true);
    c.gaxpy(2.0, &a, 3.0, &b, true);
    let expected = 4.0 * a.norm2sq() + 12.0 * ab + 9.0 * b.norm2sq();
    assert_relative_eq!(c.norm2sq(), expected, max_relative = 1e-9);
}

#[test]
fn trig_identity_collapses_to_zero() {
    let world = world();
    let pmap = Arc::new(LevelHashMap::new(1));
    let factory = |w: Arc<World>, pm: Arc<LevelHashMap>| {
        TreeFactory::<f64, 1>::new(w).k(8).thresh(1e-8).pmap(pm)
    };
    let a = factory(world.clone(), pmap.clone())
        .f(|x| (PI * x[0]).sin())
        .build()
        .unwrap();
    let b = factory(world.clone(), pmap.clone())
        .f(|x| (PI * x[0]).cos())
        .build()
        .unwrap();
    let one = factory(world.clone(), pmap.clone())
        .f(|_| 1.0)
        .build()
        .unwrap();

    a.norm_tree(true);
    b.norm_tree(true);
    let a2 = a.empty_clone(false);
    a2.mul(&a, &a, 0.0, true);
    let b2 = b.empty_clone(false);
    b2.mul(&b, &b, 0.0, true);

    a2.compress(false, false, true);
    b2.compress(false, false, true);
    one.compress(false, false, true);

    let sum = a2.empty_clone(true);
    sum.gaxpy(1.0, &a2, 1.0, &b2, true);
    let residual = sum.empty_clone(true);
    residual.gaxpy(0.5, &sum, -0.5, &one, true);
    assert!(residual.norm2sq() <= 1e-12);
}

#[test]
fn second_derivative_of_periodic_sine() {
    let world = world();
    let pmap = Arc::new(LevelHashMap::new(1));
    let f = TreeFactory::<f64, 1>::new(world.clone())
        .k(10)
        .thresh(1e-10)
        .bc(BoundaryConds::periodic())
        .pmap(pmap.clone())
        .f(|x| (2.0 * PI * x[0]).sin())
        .build()
        .unwrap();

    let df = f.empty_clone(false);
    df.diff(&f, 0, true);
    let ddf = df.empty_clone(false);
    ddf.diff(&df, 0, true);

    let reference = TreeFactory::<f64, 1>::new(world)
        .k(10)
        .thresh(1e-10)
        .bc(BoundaryConds::periodic())
        .pmap(pmap)
        .f(|x| -4.0 * PI * PI * (2.0 * PI * x[0]).sin())
        .build()
        .unwrap();

    ddf.compress(false, false, true);
    reference.compress(false, false, true);
    let err = ddf.empty_clone(true);
    err.gaxpy(1.0, &ddf, -1.0, &reference, true);
    assert!(err.norm2sq().sqrt() <= 1e-5);
}

struct IdentityKernel;

impl IntegralOperator<f64, 2> for IdentityKernel {
    fn displacements(&self, _level: u8) -> Vec<[i64; 2]> {
        vec![[0, 0]]
    }

    fn norm(&self, _level: u8, _disp: &[i64; 2]) -> f64 {
        1.0
    }

    fn apply(
        &self,
        _source: &Key<2>,
        _disp: &[i64; 2],
        coeff: &CoeffTensor<f64>,
        _tol: f64,
    ) -> CoeffTensor<f64> {
        coeff.clone()
    }
}

#[test]
fn identity_convolution_reproduces_the_tree_bitwise() {
    let world = world();
    let f = TreeFactory::<f64, 2>::new(world)
        .k(4)
        .thresh(0.0)
        .initial_level(3)
        .norefine()
        .f(|x| (x[0] * 7.1).sin() * (x[1] * 3.3).cos() + 0.25)
        .build()
        .unwrap();
    f.compress(true, false, true);

    let g = f.empty_clone(false);
    let op = Arc::new(IdentityKernel);
    g.apply(&op, &f, true);

    let mut compared = 0;
    f.for_each_local_node(|key, node| {
        if node.has_coeff() {
            let got = g
                .find_node(key)
                .get()
                .unwrap_or_else(|| panic!("output missing node {key}"));
            assert_eq!(
                got.coeff().data(),
                node.coeff().data(),
                "output differs at {key}"
            );
            compared += 1;
        }
    });
    assert!(compared > 0);
}

#[test]
fn truncate_is_monotone_in_the_threshold() {
    let world = world();
    let f = TreeFactory::<f64, 2>::new(world)
        .k(4)
        .thresh(1e-8)
        .f(|x| (-16.0 * ((x[0] - 0.4).powi(2) + (x[1] - 0.6).powi(2))).exp())
        .build()
        .unwrap();
    f.compress(false, false, true);

    let loose = f.deep_copy(true);
    loose.truncate(1e-2, true);
    let tight = f.deep_copy(true);
    tight.truncate(1e-5, true);

    assert!(tight.size() >= loose.size());
    assert!(f.size() >= tight.size());
}

#[test]
fn inner_product_is_conjugate_symmetric() {
    let world = world();
    let pmap = Arc::new(LevelHashMap::new(1));
    let a = TreeFactory::<Complex<f64>, 1>::new(world.clone())
        .k(6)
        .thresh(1e-7)
        .pmap(pmap.clone())
        .f(|x| Complex::new((PI * x[0]).cos(), (2.0 * PI * x[0]).sin()))
        .build()
        .unwrap();
    let b = TreeFactory::<Complex<f64>, 1>::new(world)
        .k(6)
        .thresh(1e-7)
        .pmap(pmap)
        .f(|x| Complex::new((-x[0]).exp(), 0.5 * x[0]))
        .build()
        .unwrap();
    a.compress(false, false, true);
    b.compress(false, false, true);

    let ab = a.inner(&b);
    let ba = b.inner(&a);
    let bound = 1e-14 * a.norm2sq().sqrt() * b.norm2sq().sqrt();
    assert!((ab - ba.conj()).norm() <= bound.max(1e-15));
}

#[test]
fn boundary_conditions_shape_neighbor_lookups() {
    let world = world();
    let periodic = TreeFactory::<f64, 2>::new(world.clone())
        .bc(BoundaryConds::periodic())
        .empty()
        .build()
        .unwrap();
    let zero = TreeFactory::<f64, 2>::new(world).empty().build().unwrap();

    let edge = Key::<2>::new(2, [3, 1]);
    let wrapped = periodic.neighbor_key(&edge, 0, 1);
    assert!(wrapped.is_valid());
    assert_eq!(wrapped.translation()[0], 0);
    // neighbor(neighbor(k, +1), -1) = k around the wrap.
    assert_eq!(periodic.neighbor_key(&wrapped, 0, -1), edge);

    assert!(!zero.neighbor_key(&edge, 0, 1).is_valid());
    assert!(zero.neighbor_key(&edge, 1, 1).is_valid());
}

#[test]
fn eval_matches_the_projected_functor() {
    let world = world();
    let f = TreeFactory::<f64, 1>::new(world)
        .k(8)
        .thresh(1e-8)
        .f(|x| (PI * x[0]).sin())
        .build()
        .unwrap();
    for &x in &[0.125, 0.3, 0.5, 0.77, 0.9375] {
        let value = f.eval([x]).get();
        assert_relative_eq!(value, (PI * x).sin(), epsilon = 1e-7);
    }
}

#[test]
fn add_scalar_shifts_the_trace() {
    let world = world();
    let f = TreeFactory::<f64, 1>::new(world)
        .k(6)
        .thresh(1e-7)
        .f(|x| x[0] * x[0])
        .build()
        .unwrap();
    let before = f.trace();
    f.add_scalar_inplace(0.5, true);
    assert_relative_eq!(f.trace(), before + 0.5, epsilon = 1e-10);
    assert_relative_eq!(before, 1.0 / 3.0, epsilon = 1e-10);
}

#[test]
fn snapshot_round_trips_through_bincode() {
    let world = world();
    let f = TreeFactory::<f64, 2>::new(world)
        .k(5)
        .thresh(1e-5)
        .f(|x| (-(x[0] + x[1])).exp())
        .build()
        .unwrap();
    f.compress(false, false, true);

    let bytes = bincode::serialize(&f.store()).unwrap();
    let snapshot = bincode::deserialize(&bytes).unwrap();

    let g = f.empty_clone(false);
    g.load(snapshot).unwrap();
    assert_eq!(g.tree_size(), f.tree_size());
    assert!(g.is_compressed());
    assert_relative_eq!(g.norm2sq(), f.norm2sq(), max_relative = 1e-14);
}

#[test]
fn projection_error_is_controlled_by_the_threshold() {
    let world = world();
    let functor: multiwavelet::factory::Functor<f64, 1> =
        Arc::new(|x: &[f64; 1]| (4.0 * x[0]).cos());
    let f = TreeFactory::<f64, 1>::new(world)
        .k(6)
        .thresh(1e-7)
        .functor(functor.clone())
        .build()
        .unwrap();
    assert!(f.err(&functor) < 1e-6);
}
