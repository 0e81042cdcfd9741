//! The same tree algorithms driven across two in-process ranks.

use std::f64::consts::PI;
use std::sync::Arc;
use std::thread;

use multiwavelet::comm::ThreadComm;
use multiwavelet::factory::TreeFactory;
use multiwavelet::key::Key;
use multiwavelet::pmap::{ProcessMap, Rank};
use multiwavelet::rmi::RmiConfig;
use multiwavelet::twoscale::gauss_legendre;
use multiwavelet::world::World;

/// Splits every level by translation parity, so both ranks are guaranteed
/// to own nodes and every recursion crosses the rank boundary.
struct ParityMap;

impl ProcessMap<1> for ParityMap {
    fn owner(&self, key: &Key<1>) -> Rank {
        if key.level() == 0 {
            0
        } else {
            (key.translation()[0] & 1) as Rank
        }
    }
}

fn reference_norm2sq() -> f64 {
    let (x, w) = gauss_legendre(48);
    x.iter()
        .zip(w.iter())
        .map(|(&xi, &wi)| wi * (PI * xi).sin().powi(2))
        .sum()
}

#[test]
fn two_ranks_project_compress_and_reduce() {
    let comms = ThreadComm::group(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let world = World::with_config(Arc::new(comm), RmiConfig::default(), 2);
                let pmap = Arc::new(ParityMap);
                let f = TreeFactory::<f64, 1>::new(world.clone())
                    .k(7)
                    .thresh(1e-7)
                    .pmap(pmap)
                    .f(|x| (PI * x[0]).sin())
                    .build()
                    .unwrap();

                let reference = reference_norm2sq();
                let reconstructed_norm = f.norm2sq();
                assert!(
                    (reconstructed_norm - reference).abs() < 1e-6,
                    "rank {} saw norm {}",
                    world.rank(),
                    reconstructed_norm
                );

                // Both ranks own a piece of a tree this deep.
                assert!(f.local_size() > 0, "rank {} owns no nodes", world.rank());

                f.compress(false, false, true);
                assert!((f.norm2sq() - reference).abs() < 1e-6);

                f.reconstruct(true);
                assert!((f.norm2sq() - reference).abs() < 1e-6);

                let total = f.tree_size();
                assert!(total > f.local_size());

                world.gop().fence();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
