//! # sprout-core
//!
//! Shared types for the Sprout growth engine.
//!
//! ## Key Components
//!
//! - [`ModelTemplate`]: layer capacities and contents, growth-site boundaries
//! - [`Key`] / [`KeyStream`]: splittable counter-based randomness
//! - [`MetricsSink`]: named scalar output ([`NullSink`], [`RecordingSink`], [`TracingSink`])
//! - [`SproutError`]: the error type every crate returns
//!
//! ## Architecture Rules
//!
//! - No numeric kernels here; linear algebra lives in `sprout-net`.
//! - No global state: randomness and metrics are passed explicitly.

pub mod error;
pub mod keys;
pub mod metrics;
pub mod template;

pub use error::SproutError;
pub use keys::{Key, KeyStream};
pub use metrics::{MetricsSink, NullSink, RecordingSink, TracingSink};
pub use template::ModelTemplate;
