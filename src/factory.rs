//! Named-parameter construction of function trees.

use std::sync::Arc;

use thiserror::Error;

use crate::constants::{
    DEFAULT_INITIAL_LEVEL, DEFAULT_K, DEFAULT_MAX_REFINE_LEVEL, DEFAULT_THRESH, KMAX,
};
use crate::pmap::{LevelHashMap, ProcessMap};
use crate::tensor::TreeScalar;
use crate::tree::FunctionTree;
use crate::world::World;

/// Configuration errors surfaced at tree construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Wavelet order outside `[1, KMAX]`.
    #[error("wavelet order {0} outside [1, {KMAX}]")]
    IllegalOrder(usize),
    /// Initial level deeper than the refinement limit.
    #[error("initial level {initial} exceeds max refine level {max}")]
    IllegalInitialLevel {
        /// Requested initial level.
        initial: u8,
        /// Configured refinement limit.
        max: u8,
    },
    /// A stored tree was read back with a different wavelet order.
    #[error("snapshot has order {found}, tree has order {expected}")]
    OrderMismatch {
        /// Order found in the snapshot.
        found: usize,
        /// Order of the receiving tree.
        expected: usize,
    },
}

/// Boundary behaviour on one face of the domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundaryKind {
    /// The function vanishes outside the volume.
    Zero,
    /// The volume wraps around.
    Periodic,
}

/// Boundary conditions per dimension and side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundaryConds<const D: usize> {
    /// `sides[d] = [low, high]` behaviour along dimension `d`.
    pub sides: [[BoundaryKind; 2]; D],
}

impl<const D: usize> Default for BoundaryConds<D> {
    fn default() -> Self {
        Self {
            sides: [[BoundaryKind::Zero; 2]; D],
        }
    }
}

impl<const D: usize> BoundaryConds<D> {
    /// Periodic in every dimension.
    pub fn periodic() -> Self {
        Self {
            sides: [[BoundaryKind::Periodic; 2]; D],
        }
    }

    /// True if dimension `d` wraps.
    pub fn is_periodic(&self, d: usize) -> bool {
        self.sides[d][0] == BoundaryKind::Periodic
    }

    /// Flat encoding for the persisted form, `0` = zero, `1` = periodic.
    pub fn codes(&self) -> Vec<u8> {
        self.sides
            .iter()
            .flat_map(|pair| {
                pair.iter().map(|kind| match kind {
                    BoundaryKind::Zero => 0u8,
                    BoundaryKind::Periodic => 1u8,
                })
            })
            .collect()
    }

    /// Decode the persisted form.
    pub fn from_codes(codes: &[u8]) -> Self {
        assert_eq!(codes.len(), 2 * D, "boundary code length mismatch");
        let mut bc = Self::default();
        for d in 0..D {
            for s in 0..2 {
                bc.sides[d][s] = if codes[2 * d + s] == 1 {
                    BoundaryKind::Periodic
                } else {
                    BoundaryKind::Zero
                };
            }
        }
        bc
    }
}

/// Truncation threshold policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncateMode {
    /// Plain `tol`.
    Absolute,
    /// `tol * min(1, 2^-n L)`.
    CellWidth,
    /// `tol * min(1, 4^-n L^2)`.
    CellWidthSquared,
}

impl TruncateMode {
    /// Persisted encoding.
    pub fn code(self) -> u8 {
        match self {
            TruncateMode::Absolute => 0,
            TruncateMode::CellWidth => 1,
            TruncateMode::CellWidthSquared => 2,
        }
    }

    /// Decode the persisted form; unknown codes fall back to `Absolute`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => TruncateMode::CellWidth,
            2 => TruncateMode::CellWidthSquared,
            _ => TruncateMode::Absolute,
        }
    }
}

/// Callable evaluated during projection.
pub type Functor<T, const D: usize> = Arc<dyn Fn(&[f64; D]) -> T + Send + Sync>;

/// Named-parameter builder for function trees.
///
/// ```ignore
/// let f = TreeFactory::<f64, 3>::new(world)
///     .k(9)
///     .thresh(1e-7)
///     .functor(Arc::new(|x| (-x.iter().map(|c| c * c).sum::<f64>()).exp()))
///     .build()?;
/// ```
pub struct TreeFactory<T: TreeScalar, const D: usize> {
    pub(crate) world: Arc<World>,
    pub(crate) k: usize,
    pub(crate) thresh: f64,
    pub(crate) initial_level: u8,
    pub(crate) max_refine_level: u8,
    pub(crate) truncate_mode: TruncateMode,
    pub(crate) refine: bool,
    pub(crate) empty: bool,
    pub(crate) autorefine: bool,
    pub(crate) truncate_on_project: bool,
    pub(crate) fence: bool,
    pub(crate) bc: BoundaryConds<D>,
    pub(crate) pmap: Option<Arc<dyn ProcessMap<D>>>,
    pub(crate) functor: Option<Functor<T, D>>,
}

impl<T: TreeScalar, const D: usize> TreeFactory<T, D> {
    /// Builder with the recognized defaults.
    pub fn new(world: Arc<World>) -> Self {
        Self {
            world,
            k: DEFAULT_K,
            thresh: DEFAULT_THRESH,
            initial_level: DEFAULT_INITIAL_LEVEL,
            max_refine_level: DEFAULT_MAX_REFINE_LEVEL,
            truncate_mode: TruncateMode::Absolute,
            refine: true,
            empty: false,
            autorefine: true,
            truncate_on_project: false,
            fence: true,
            bc: BoundaryConds::default(),
            pmap: None,
            functor: None,
        }
    }

    /// Wavelet order.
    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Screening threshold.
    pub fn thresh(mut self, thresh: f64) -> Self {
        self.thresh = thresh;
        self
    }

    /// Level to which the tree is seeded before projection.
    pub fn initial_level(mut self, level: u8) -> Self {
        self.initial_level = level;
        self
    }

    /// Hard refinement floor.
    pub fn max_refine_level(mut self, level: u8) -> Self {
        self.max_refine_level = level;
        self
    }

    /// Truncation policy.
    pub fn truncate_mode(mut self, mode: TruncateMode) -> Self {
        self.truncate_mode = mode;
        self
    }

    /// Refine adaptively during projection (the default).
    pub fn refine(mut self) -> Self {
        self.refine = true;
        self
    }

    /// Project at the initial level only.
    pub fn norefine(mut self) -> Self {
        self.refine = false;
        self
    }

    /// Construct with no coefficients at all.
    pub fn empty(mut self) -> Self {
        self.empty = true;
        self
    }

    /// Split nodes when products concentrate in the high-order half.
    pub fn autorefine(mut self) -> Self {
        self.autorefine = true;
        self
    }

    /// Disable the autorefine test.
    pub fn noautorefine(mut self) -> Self {
        self.autorefine = false;
        self
    }

    /// Store projected coefficients at the parent level.
    pub fn truncate_on_project(mut self) -> Self {
        self.truncate_on_project = true;
        self
    }

    /// Store projected coefficients at the probed leaf (the default).
    pub fn notruncate_on_project(mut self) -> Self {
        self.truncate_on_project = false;
        self
    }

    /// Fence after construction (the default).
    pub fn fence(mut self) -> Self {
        self.fence = true;
        self
    }

    /// Let the caller fence later.
    pub fn nofence(mut self) -> Self {
        self.fence = false;
        self
    }

    /// Boundary conditions.
    pub fn bc(mut self, bc: BoundaryConds<D>) -> Self {
        self.bc = bc;
        self
    }

    /// Process map; defaults to the level-hashed map.
    pub fn pmap(mut self, pmap: Arc<dyn ProcessMap<D>>) -> Self {
        self.pmap = Some(pmap);
        self
    }

    /// Functor projected into the tree.
    pub fn functor(mut self, functor: Functor<T, D>) -> Self {
        self.functor = Some(functor);
        self
    }

    /// Convenience wrapper for a plain function pointer.
    pub fn f(self, f: fn(&[f64; D]) -> T) -> Self {
        self.functor(Arc::new(f))
    }

    /// Validate the options and build the tree.
    pub fn build(mut self) -> Result<FunctionTree<T, D>, TreeError> {
        if self.k < 1 || self.k > KMAX {
            return Err(TreeError::IllegalOrder(self.k));
        }
        if self.initial_level > self.max_refine_level {
            return Err(TreeError::IllegalInitialLevel {
                initial: self.initial_level,
                max: self.max_refine_level,
            });
        }
        if self.pmap.is_none() {
            self.pmap = Some(Arc::new(LevelHashMap::new(self.world.size())));
        }
        Ok(FunctionTree::from_factory(self))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boundary_codes_round_trip() {
        let mut bc = BoundaryConds::<3>::default();
        bc.sides[1] = [BoundaryKind::Periodic; 2];
        let back = BoundaryConds::<3>::from_codes(&bc.codes());
        assert_eq!(bc, back);
        assert!(!bc.is_periodic(0));
        assert!(bc.is_periodic(1));
    }

    #[test]
    fn truncate_modes_encode() {
        for mode in [
            TruncateMode::Absolute,
            TruncateMode::CellWidth,
            TruncateMode::CellWidthSquared,
        ] {
            assert_eq!(TruncateMode::from_code(mode.code()), mode);
        }
    }
}
