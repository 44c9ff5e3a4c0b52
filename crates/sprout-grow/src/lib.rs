//! # sprout-grow
//!
//! Curvature-driven growth for the Sprout network family: the solver that
//! trains a fixed architecture, the engine that decides when and where to
//! add a neuron or a layer, and the epoch loop that ties them together.
//!
//! ## Key Components
//!
//! - [`solver::Solver`]: training steps, evaluation, the gradient growth reads
//! - [`curvature`]: per-site activation and gradient second moments
//! - [`score::ScoreContext`]: expansion score of a candidate and its gradient
//! - [`ascent`] / [`mala`]: candidate refinement
//! - [`proposer`]: candidate draws, function-preserving embedding, invariant checks
//! - [`growth::GrowthEngine`]: the per-cycle decision and commit
//! - [`trainer::Trainer`]: epochs, growth cadence, checkpoints
//!
//! ## Architecture Rules
//!
//! - Every committed modification leaves the network function unchanged.
//! - At most one modification per growth cycle.
//! - Randomness is drawn only from [`sprout_core::KeyStream`]s owned by the
//!   caller; identical seeds give identical runs.

pub mod ascent;
pub mod checkpoint;
pub mod config;
pub mod curvature;
pub mod data;
pub mod growth;
pub mod mala;
pub mod proposer;
pub mod sampler;
pub mod score;
pub mod solver;
pub mod trainer;

pub use checkpoint::TrainState;
pub use config::{ExperimentConfig, TaskKind};
pub use data::{Batch, Dataset};
pub use growth::{GrowthConfig, GrowthEngine, GrowthEvent, GrowthKind, RefineMethod, RegressionPolicy};
pub use sampler::Sampler;
pub use solver::{Optimizer, SimpleGradient, Solver};
pub use trainer::{architecture_report, TrainSummary, Trainer};
