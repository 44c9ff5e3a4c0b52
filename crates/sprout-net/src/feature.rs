//! Candidate features.
//!
//! A [`Feature`] is a small dense layer with its own basis activation: one
//! output for a width candidate, `k` outputs for a depth candidate. It is
//! refined in isolation and, if accepted, spliced into the network.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sprout_core::{keys::normal_vec, SproutError};

use crate::linalg::{column_sums, Mat};
use crate::tree::{Basis, LayerParams};

/// Parameters of one candidate neuron or layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// `in × k` weights.
    pub kernel: Mat,
    /// `1 × k` offsets.
    pub bias: Mat,
    /// Basis activation of the `k` outputs.
    pub basis: Basis,
}

/// Forward values of a feature on a batch.
#[derive(Debug, Clone)]
pub struct FeatureTrace {
    /// Pre-activations `x K + b`.
    pub pre: Mat,
    /// Outputs `φ(pre)`.
    pub out: Mat,
}

impl Feature {
    /// Random feature: kernel `~ N(0, 1/inputs)`, bias `~ N(0, 1)`, SiLU basis.
    pub fn init(rng: &mut impl Rng, inputs: usize, outputs: usize) -> Self {
        let scale = 1.0 / (inputs.max(1) as f64).sqrt();
        let kernel = normal_vec(rng, inputs * outputs);
        let bias = normal_vec(rng, outputs);
        Self {
            kernel: Mat::from_vec(inputs, outputs, kernel) * scale,
            bias: Mat::from_vec(1, outputs, bias),
            basis: Basis::silu(outputs),
        }
    }

    /// Input width.
    pub fn inputs(&self) -> usize {
        self.kernel.nrows()
    }

    /// Output width.
    pub fn outputs(&self) -> usize {
        self.kernel.ncols()
    }

    /// Appends `extra` zero input rows so the feature ignores inputs it
    /// was not initialised over.
    pub fn pad_inputs(self, extra: usize) -> Self {
        let rows = self.kernel.nrows() + extra;
        Self {
            kernel: self.kernel.resize_vertically(rows, 0.0),
            ..self
        }
    }

    /// Forward pass on a batch.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if `x` has the wrong width.
    pub fn apply(&self, x: &Mat) -> Result<FeatureTrace, SproutError> {
        if x.ncols() != self.inputs() {
            return Err(SproutError::shape(format!(
                "feature expects {} inputs, got {}",
                self.inputs(),
                x.ncols()
            )));
        }
        let mut pre = x * &self.kernel;
        crate::linalg::add_row(&mut pre, &self.bias);
        let out = self.basis.apply(&pre);
        Ok(FeatureTrace { pre, out })
    }

    /// Pulls per-datum output cotangents `dout` back to the parameters,
    /// summed over the batch.
    pub fn vjp(&self, x: &Mat, trace: &FeatureTrace, dout: &Mat) -> Feature {
        let dh = self.basis.derivative(&trace.pre).component_mul(dout);
        Feature {
            kernel: x.tr_mul(&dh),
            bias: column_sums(&dh),
            basis: Basis::weight_grad(&trace.pre, dout),
        }
    }

    /// `self + alpha * other`, leaf by leaf.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the features differ in shape.
    pub fn add_scaled(&self, alpha: f64, other: &Feature) -> Result<Feature, SproutError> {
        if self.kernel.shape() != other.kernel.shape() {
            return Err(SproutError::shape(format!(
                "feature {:?} vs {:?}",
                self.kernel.shape(),
                other.kernel.shape()
            )));
        }
        Ok(Feature {
            kernel: &self.kernel + &other.kernel * alpha,
            bias: &self.bias + &other.bias * alpha,
            basis: Basis {
                constant: &self.basis.constant + &other.basis.constant * alpha,
                linear: &self.basis.linear + &other.basis.linear * alpha,
                silu: &self.basis.silu + &other.basis.silu * alpha,
            },
        })
    }

    /// Number of scalar parameters.
    pub fn len(&self) -> usize {
        self.kernel.len() + self.bias.len() + 3 * self.basis.width()
    }

    /// True for a feature with no outputs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens every parameter: kernel, bias, basis constant, linear, silu.
    pub fn to_vector(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.kernel.iter());
        out.extend(self.bias.iter());
        out.extend(self.basis.constant.iter());
        out.extend(self.basis.linear.iter());
        out.extend(self.basis.silu.iter());
        out
    }

    /// A feature of the same shape filled from a flat vector in
    /// [`Feature::to_vector`] order.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the length differs.
    pub fn with_vector(&self, values: &[f64]) -> Result<Feature, SproutError> {
        if values.len() != self.len() {
            return Err(SproutError::shape(format!(
                "feature has {} parameters, vector has {}",
                self.len(),
                values.len()
            )));
        }
        let (rows, k) = self.kernel.shape();
        let mut at = 0;
        let mut take = |r: usize, c: usize| {
            let m = Mat::from_column_slice(r, c, &values[at..at + r * c]);
            at += r * c;
            m
        };
        let kernel = take(rows, k);
        let bias = take(1, k);
        let basis = Basis {
            constant: take(1, k),
            linear: take(1, k),
            silu: take(1, k),
        };
        Ok(Feature {
            kernel,
            bias,
            basis,
        })
    }

    /// Converts into hidden-layer parameters.
    pub fn into_layer(self) -> LayerParams {
        LayerParams {
            kernel: self.kernel,
            bias: self.bias,
            basis: Some(self.basis),
        }
    }
}

/// Builds a one-input neuron centred at `position` with width `scale`:
/// `kernel = 1/(1e-6 + scale)`, `bias = -position * kernel`.
///
/// # Example
///
/// ```
/// use sprout_net::feature::{locate_feature, make_feature};
///
/// let f = make_feature(0.7, 2.0, 0.0, 0.0, 1.0);
/// let (p, s) = locate_feature(&f).unwrap();
/// assert!((p - 0.7).abs() < 1e-9);
/// assert!((s - 2.0).abs() < 1e-9);
/// ```
pub fn make_feature(position: f64, scale: f64, c: f64, l: f64, v: f64) -> Feature {
    let kernel = 1.0 / (1e-6 + scale);
    let bias = -position * kernel;
    Feature {
        kernel: Mat::from_element(1, 1, kernel),
        bias: Mat::from_element(1, 1, bias),
        basis: Basis {
            constant: Mat::from_element(1, 1, c),
            linear: Mat::from_element(1, 1, l),
            silu: Mat::from_element(1, 1, v),
        },
    }
}

/// Position and scale of a neuron with scalar weight `kernel` and `bias`.
/// Inverse of the parametrisation used by [`make_feature`].
pub fn locate_linear(kernel: f64, bias: f64) -> (f64, f64) {
    (-bias / kernel, 1.0 / kernel - 1e-6)
}

/// Position and scale of a one-input, one-output feature.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if the feature is not `1 × 1`.
pub fn locate_feature(feature: &Feature) -> Result<(f64, f64), SproutError> {
    if feature.kernel.shape() != (1, 1) {
        return Err(SproutError::shape(format!(
            "locate needs a 1x1 feature, got {:?}",
            feature.kernel.shape()
        )));
    }
    Ok(locate_linear(feature.kernel[(0, 0)], feature.bias[(0, 0)]))
}

/// Positions and scales of every unit of `layer` with respect to input `wrt`.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if `wrt` is not an input of the layer.
pub fn locate_neurons(layer: &LayerParams, wrt: usize) -> Result<Vec<(f64, f64)>, SproutError> {
    if wrt >= layer.kernel.nrows() {
        return Err(SproutError::shape(format!(
            "input {wrt} out of range for a layer with {} inputs",
            layer.kernel.nrows()
        )));
    }
    Ok((0..layer.width())
        .map(|j| locate_linear(layer.kernel[(wrt, j)], layer.bias[(0, j)]))
        .collect())
}
