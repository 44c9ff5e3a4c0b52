//! Error types for Sprout.
//!
//! Every fallible operation in the workspace returns [`SproutError`].
//! Invariant and regression variants are fatal by contract: callers
//! propagate them to the driver, which aborts the run.

use thiserror::Error;

/// The unified error type for all Sprout crates.
///
/// # Example
///
/// ```
/// use sprout_core::SproutError;
///
/// let err = SproutError::Invariant {
///     message: "content-null mismatch at layer 0".to_string(),
/// };
/// assert!(err.is_fatal());
/// assert!(err.to_string().contains("layer 0"));
/// ```
#[derive(Debug, Clone, Error)]
pub enum SproutError {
    /// A structural invariant of the architecture or parameter state broke.
    ///
    /// Raised for content/null mismatches, a missing null slot, misuse of a
    /// dormant layer, or a template with no enabled output boundary.
    #[error("invariant violated: {message}")]
    Invariant {
        /// Description of the broken invariant.
        message: String,
    },

    /// Training loss got worse after a committed growth step.
    #[error(
        "growth at layer {site} regressed training loss: {before:.6e} -> {after:.6e} (limit ratio {limit})\n  before: {before_state}\n  after:  {after_state}"
    )]
    Regression {
        /// Layer slot that was grown.
        site: usize,
        /// Full-training-set loss before the commit.
        before: f64,
        /// Full-training-set loss after the commit.
        after: f64,
        /// Maximum allowed `after / before` ratio.
        limit: f64,
        /// JSON dump of the contents, parameters and null masks before the commit.
        before_state: String,
        /// JSON dump of the same state after the commit.
        after_state: String,
    },

    /// Invalid configuration, template, or task selection.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// Two arrays that must agree in shape do not.
    #[error("shape mismatch: {message}")]
    Shape {
        /// Description of the mismatch.
        message: String,
    },

    /// Checkpoint save/restore failure.
    #[error("checkpoint error: {message}")]
    Checkpoint {
        /// Description of the failure.
        message: String,
    },

    /// Dataset file could not be read or decoded.
    #[error("dataset error: {message}")]
    Dataset {
        /// Description of the failure.
        message: String,
    },

    /// Catch-all for unexpected internal failures.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl SproutError {
    /// Shorthand for an [`SproutError::Invariant`].
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Shorthand for a [`SproutError::Shape`].
    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    /// Shorthand for a [`SproutError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true for errors that signal a structural bug rather than
    /// bad input: invariant violations and loss regressions.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant { .. } | Self::Regression { .. })
    }
}
