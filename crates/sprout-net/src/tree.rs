//! Typed parameter trees.
//!
//! A [`ParamTree`] holds one optional [`LayerParams`] per template slot
//! (`None` for dormant slots). Gradients, tangents and optimizer directions
//! are parameter trees of the same structure, and the generic
//! `tree_map` / `tree_zip_map` / `tree_reduce` helpers walk every array leaf
//! in a fixed order: kernel, bias, then basis constant, linear, silu.

use serde::{Deserialize, Serialize};
use sprout_core::SproutError;

use crate::linalg::Mat;

/// Logistic sigmoid.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// `x * sigmoid(x)`.
pub fn silu(x: f64) -> f64 {
    x * sigmoid(x)
}

/// Derivative of [`silu`].
pub fn silu_prime(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 + x * (1.0 - s))
}

/// Per-unit basis activation `φ(h) = c + l·h + v·silu(h)`.
///
/// Each field is a `1 × width` row.
///
/// # Example
///
/// ```
/// use sprout_net::tree::Basis;
/// use sprout_net::linalg::Mat;
///
/// let identity = Basis::identity(2);
/// let h = Mat::from_row_slice(1, 2, &[-1.5, 3.0]);
/// assert_eq!(identity.apply(&h), h);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basis {
    /// Constant offset `c`.
    pub constant: Mat,
    /// Linear weight `l`.
    pub linear: Mat,
    /// SiLU weight `v`.
    pub silu: Mat,
}

impl Basis {
    /// Plain SiLU: `c = 0, l = 0, v = 1`.
    pub fn silu(width: usize) -> Self {
        Self {
            constant: Mat::zeros(1, width),
            linear: Mat::zeros(1, width),
            silu: Mat::from_element(1, width, 1.0),
        }
    }

    /// Identity: `c = 0, l = 1, v = 0`.
    pub fn identity(width: usize) -> Self {
        Self {
            constant: Mat::zeros(1, width),
            linear: Mat::from_element(1, width, 1.0),
            silu: Mat::zeros(1, width),
        }
    }

    /// All-zero weights, the shape of a basis gradient.
    pub fn zeros(width: usize) -> Self {
        Self {
            constant: Mat::zeros(1, width),
            linear: Mat::zeros(1, width),
            silu: Mat::zeros(1, width),
        }
    }

    /// Number of units.
    pub fn width(&self) -> usize {
        self.constant.ncols()
    }

    /// Applies `φ` column-wise to a batch of pre-activations.
    pub fn apply(&self, h: &Mat) -> Mat {
        let mut out = h.clone();
        for j in 0..h.ncols() {
            let (c, l, v) = (self.constant[(0, j)], self.linear[(0, j)], self.silu[(0, j)]);
            for i in 0..h.nrows() {
                let x = h[(i, j)];
                out[(i, j)] = c + l * x + v * silu(x);
            }
        }
        out
    }

    /// `φ'(h) = l + v·silu'(h)`, column-wise.
    pub fn derivative(&self, h: &Mat) -> Mat {
        let mut out = h.clone();
        for j in 0..h.ncols() {
            let (l, v) = (self.linear[(0, j)], self.silu[(0, j)]);
            for i in 0..h.nrows() {
                out[(i, j)] = l + v * silu_prime(h[(i, j)]);
            }
        }
        out
    }

    /// Gradient of `Σ dout ⊙ φ(h)` with respect to the basis weights.
    pub fn weight_grad(h: &Mat, dout: &Mat) -> Self {
        let mut grad = Self::zeros(h.ncols());
        for j in 0..h.ncols() {
            let (mut dc, mut dl, mut dv) = (0.0, 0.0, 0.0);
            for i in 0..h.nrows() {
                let (x, d) = (h[(i, j)], dout[(i, j)]);
                dc += d;
                dl += d * x;
                dv += d * silu(x);
            }
            grad.constant[(0, j)] = dc;
            grad.linear[(0, j)] = dl;
            grad.silu[(0, j)] = dv;
        }
        grad
    }

    /// Tangent of `φ(h)` for a tangent `dh` of the pre-activations and a
    /// tangent `dbasis` of the weights.
    pub fn jvp(&self, h: &Mat, dh: &Mat, dbasis: &Basis) -> Mat {
        let mut out = h.clone();
        for j in 0..h.ncols() {
            let (l, v) = (self.linear[(0, j)], self.silu[(0, j)]);
            let (dc, dl, dv) = (
                dbasis.constant[(0, j)],
                dbasis.linear[(0, j)],
                dbasis.silu[(0, j)],
            );
            for i in 0..h.nrows() {
                let x = h[(i, j)];
                out[(i, j)] = dc + dl * x + dv * silu(x) + (l + v * silu_prime(x)) * dh[(i, j)];
            }
        }
        out
    }

    /// Appends one unit with the given weights.
    pub fn insert_unit(self, index: usize, c: f64, l: f64, v: f64) -> Self {
        Self {
            constant: self.constant.insert_column(index, c),
            linear: self.linear.insert_column(index, l),
            silu: self.silu.insert_column(index, v),
        }
    }

    fn leaves(&self) -> [&Mat; 3] {
        [&self.constant, &self.linear, &self.silu]
    }
}

/// Parameters of one enabled layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    /// `in × width` weights.
    pub kernel: Mat,
    /// `1 × width` offsets.
    pub bias: Mat,
    /// Basis activation; `None` for the linear output layer.
    pub basis: Option<Basis>,
}

impl LayerParams {
    /// Input width.
    pub fn input_width(&self) -> usize {
        self.kernel.nrows()
    }

    /// Output width (number of active units).
    pub fn width(&self) -> usize {
        self.kernel.ncols()
    }

    /// Pre-activations `x K + b` for a batch.
    pub fn affine(&self, x: &Mat) -> Mat {
        let mut h = x * &self.kernel;
        crate::linalg::add_row(&mut h, &self.bias);
        h
    }

    fn leaves(&self) -> Vec<&Mat> {
        let mut out = vec![&self.kernel, &self.bias];
        if let Some(basis) = &self.basis {
            out.extend(basis.leaves());
        }
        out
    }

    fn map(&self, f: &impl Fn(&Mat) -> Mat) -> Self {
        Self {
            kernel: f(&self.kernel),
            bias: f(&self.bias),
            basis: self.basis.as_ref().map(|b| Basis {
                constant: f(&b.constant),
                linear: f(&b.linear),
                silu: f(&b.silu),
            }),
        }
    }
}

/// One optional layer record per template slot.
///
/// # Example
///
/// ```
/// use sprout_net::tree::{LayerParams, ParamTree};
/// use sprout_net::linalg::Mat;
///
/// let layer = LayerParams {
///     kernel: Mat::from_element(2, 3, 1.0),
///     bias: Mat::zeros(1, 3),
///     basis: None,
/// };
/// let tree = ParamTree { layers: vec![None, Some(layer)] };
/// assert_eq!(tree.param_count(), 9);
/// assert_eq!(tree.dot(&tree).unwrap(), 6.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTree {
    /// Per-slot parameters, `None` for dormant slots.
    pub layers: Vec<Option<LayerParams>>,
}

impl ParamTree {
    /// Applies `f` to every leaf, keeping the structure.
    pub fn tree_map(&self, f: impl Fn(&Mat) -> Mat) -> Self {
        Self {
            layers: self
                .layers
                .iter()
                .map(|layer| layer.as_ref().map(|p| p.map(&f)))
                .collect(),
        }
    }

    /// Combines two trees of identical structure leaf by leaf.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the trees differ in slot count,
    /// slot presence, basis presence or any leaf shape.
    pub fn tree_zip_map(
        &self,
        other: &ParamTree,
        f: impl Fn(&Mat, &Mat) -> Mat,
    ) -> Result<Self, SproutError> {
        if self.layers.len() != other.layers.len() {
            return Err(SproutError::shape(format!(
                "parameter trees have {} and {} slots",
                self.layers.len(),
                other.layers.len()
            )));
        }
        let zip = |i: usize, a: &Mat, b: &Mat| -> Result<Mat, SproutError> {
            if a.shape() != b.shape() {
                return Err(SproutError::shape(format!(
                    "slot {i}: leaf {:?} vs {:?}",
                    a.shape(),
                    b.shape()
                )));
            }
            Ok(f(a, b))
        };
        let mut layers = Vec::with_capacity(self.layers.len());
        for (i, pair) in self.layers.iter().zip(other.layers.iter()).enumerate() {
            let merged = match pair {
                (None, None) => None,
                (Some(a), Some(b)) => {
                    let basis = match (&a.basis, &b.basis) {
                        (None, None) => None,
                        (Some(x), Some(y)) => Some(Basis {
                            constant: zip(i, &x.constant, &y.constant)?,
                            linear: zip(i, &x.linear, &y.linear)?,
                            silu: zip(i, &x.silu, &y.silu)?,
                        }),
                        _ => {
                            return Err(SproutError::shape(format!(
                                "slot {i}: basis present in only one tree"
                            )))
                        }
                    };
                    Some(LayerParams {
                        kernel: zip(i, &a.kernel, &b.kernel)?,
                        bias: zip(i, &a.bias, &b.bias)?,
                        basis,
                    })
                }
                _ => {
                    return Err(SproutError::shape(format!(
                        "slot {i}: enabled in only one tree"
                    )))
                }
            };
            layers.push(merged);
        }
        Ok(Self { layers })
    }

    /// Folds over every leaf in tree order.
    pub fn tree_reduce<A>(&self, init: A, f: impl Fn(A, &Mat) -> A) -> A {
        self.layers
            .iter()
            .flatten()
            .flat_map(|p| p.leaves())
            .fold(init, f)
    }

    /// Sum over leaves of elementwise products.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] on structure mismatch.
    pub fn dot(&self, other: &ParamTree) -> Result<f64, SproutError> {
        let prod = self.tree_zip_map(other, |a, b| a.component_mul(b))?;
        Ok(prod.tree_reduce(0.0, |acc, m| acc + m.sum()))
    }

    /// A tree of zeros with the same structure.
    pub fn zeros_like(&self) -> Self {
        self.tree_map(|m| Mat::zeros(m.nrows(), m.ncols()))
    }

    /// Total number of scalar parameters.
    pub fn param_count(&self) -> usize {
        self.tree_reduce(0, |acc, m| acc + m.len())
    }

    /// `‖θ‖²` over all leaves.
    pub fn sqnorm(&self) -> f64 {
        self.tree_reduce(0.0, |acc, m| acc + m.norm_squared())
    }

    /// True if every leaf is finite.
    pub fn is_finite(&self) -> bool {
        self.tree_reduce(true, |acc, m| acc && m.iter().all(|x| x.is_finite()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(rows: usize, cols: usize, basis: bool, fill: f64) -> LayerParams {
        LayerParams {
            kernel: Mat::from_element(rows, cols, fill),
            bias: Mat::from_element(1, cols, fill),
            basis: basis.then(|| Basis::silu(cols)),
        }
    }

    #[test]
    fn silu_derivative_matches_finite_difference() {
        for &x in &[-4.0, -1.0, 0.0, 0.3, 2.5] {
            let h = 1e-6;
            let fd = (silu(x + h) - silu(x - h)) / (2.0 * h);
            assert!((fd - silu_prime(x)).abs() < 1e-8, "x={x}");
        }
    }

    #[test]
    fn zip_map_rejects_structure_mismatch() {
        let a = ParamTree { layers: vec![Some(layer(2, 2, true, 1.0)), None] };
        let b = ParamTree { layers: vec![Some(layer(2, 2, true, 1.0)), Some(layer(2, 1, false, 1.0))] };
        assert!(a.tree_zip_map(&b, |x, y| x + y).is_err());
        let c = ParamTree { layers: vec![Some(layer(2, 3, true, 1.0)), None] };
        assert!(a.dot(&c).is_err());
        let d = ParamTree { layers: vec![Some(layer(2, 2, false, 1.0)), None] };
        assert!(a.dot(&d).is_err());
    }

    #[test]
    fn reduce_visits_every_leaf() {
        let t = ParamTree {
            layers: vec![Some(layer(3, 2, true, 2.0)), None, Some(layer(2, 1, false, 2.0))],
        };
        // 6 + 2 + 3*2 hidden, 2 + 1 output.
        assert_eq!(t.param_count(), 17);
        assert!((t.sqnorm() - (6.0 + 2.0) * 4.0 - 2.0 - 3.0 * 4.0).abs() < 1e-12);
        assert_eq!(t.zeros_like().sqnorm(), 0.0);
        assert!(t.is_finite());
    }

    #[test]
    fn basis_jvp_matches_finite_difference() {
        let basis = Basis {
            constant: Mat::from_row_slice(1, 2, &[0.1, -0.2]),
            linear: Mat::from_row_slice(1, 2, &[0.5, 1.0]),
            silu: Mat::from_row_slice(1, 2, &[1.0, -0.7]),
        };
        let dbasis = Basis {
            constant: Mat::from_row_slice(1, 2, &[0.3, 0.1]),
            linear: Mat::from_row_slice(1, 2, &[-0.2, 0.4]),
            silu: Mat::from_row_slice(1, 2, &[0.6, 0.2]),
        };
        let h = Mat::from_row_slice(2, 2, &[0.4, -1.2, 2.0, 0.0]);
        let dh = Mat::from_row_slice(2, 2, &[1.0, 0.5, -0.3, 0.8]);
        let eps = 1e-6;
        let shifted = |s: f64| {
            let b = Basis {
                constant: &basis.constant + &dbasis.constant * s,
                linear: &basis.linear + &dbasis.linear * s,
                silu: &basis.silu + &dbasis.silu * s,
            };
            b.apply(&(&h + &dh * s))
        };
        let fd = (shifted(eps) - shifted(-eps)) / (2.0 * eps);
        let jvp = basis.jvp(&h, &dh, &dbasis);
        assert!((fd - jvp).abs().max() < 1e-6);
    }
}
