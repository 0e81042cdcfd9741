//! # Distributed adaptive multiwavelet trees
//!
//! Represents real- or complex-valued functions on a d-dimensional
//! Cartesian domain as adaptively refined multiwavelet expansions over a
//! 2^d-ary tree, sharded across processes, with arithmetic,
//! differentiation, pointwise multiplication and integral-operator
//! application expressed as trees of tasks over a reliable active-message
//! layer.
//!
//! ## References
//! \[1\] Alpert, B., Beylkin, G., Gines, D., & Vozovoi, L. "Adaptive
//! solution of partial differential equations in multiwavelet bases."
//! Journal of Computational Physics 182.1 (2002): 149-190.
//!
//! \[2\] Harrison, R. J., Fann, G. I., Yanai, T., Gan, Z., & Beylkin, G.
//! "Multiresolution quantum chemistry: Basic theory and initial
//! applications." The Journal of Chemical Physics 121.23 (2004).
#![cfg_attr(feature = "strict", deny(warnings))]
#![warn(missing_docs)]

pub mod comm;
pub mod constants;
pub mod container;
pub mod factory;
pub mod key;
pub mod node;
pub mod pmap;
pub mod rmi;
pub mod runtime;
pub mod tensor;
pub mod tree;
pub mod twoscale;
pub mod world;
