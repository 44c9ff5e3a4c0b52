//! # sprout-net
//!
//! The network family the growth engine operates on.
//!
//! ## Key Components
//!
//! - [`network::Network`]: growable MLP with trace, backward and JVP
//! - [`tree::ParamTree`]: typed per-slot parameters with tree-map utilities
//! - [`feature::Feature`]: candidate neuron or layer
//! - [`loss`]: task losses and labels
//! - [`linalg`]: pseudo-inverse, moments, log-determinant, invertible clipping
//!
//! All derivatives are hand-written for this one model family; there is no
//! general autodiff.

pub mod feature;
pub mod linalg;
pub mod loss;
pub mod network;
pub mod tree;

pub use feature::Feature;
pub use linalg::Mat;
pub use loss::{Labels, LossFunction, MeanSquared, SoftmaxCrossEntropy};
pub use network::{Gradients, Network, Trace};
pub use tree::{Basis, LayerParams, ParamTree};
