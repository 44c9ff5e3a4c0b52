//! The growable MLP.
//!
//! Every enabled slot is a dense layer `h = x K + b` followed by its basis
//! activation (hidden slots) or nothing (the output slot). Dormant slots
//! are skipped and pass their input through unchanged. Storage is trimmed
//! to the active width; the per-slot null mask is capacity-sized.
//!
//! Derivatives are hand-written: [`Network::backward`] is reverse mode over
//! a recorded [`Trace`], [`Network::jvp`] is forward mode along a tangent
//! parameter tree.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sprout_core::{Key, ModelTemplate, SproutError};

use crate::linalg::{column_sums, Mat};
use crate::tree::{Basis, LayerParams, ParamTree};

/// Growable multilayer perceptron.
///
/// # Example
///
/// ```
/// use sprout_core::{Key, ModelTemplate};
/// use sprout_net::{linalg::Mat, Network};
///
/// let template = ModelTemplate::with_output(vec![4, 2], vec![Some(2), None], 2).unwrap();
/// let net = Network::init(&template, 3, Key::new(0)).unwrap();
/// let y = net.forward(&Mat::zeros(5, 3)).unwrap();
/// assert_eq!(y.shape(), (5, 2));
/// assert_eq!(net.null(0).unwrap(), &[false, false, true, true]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    input_size: usize,
    /// Per-slot parameters.
    pub params: ParamTree,
    nulls: Vec<Option<Vec<bool>>>,
}

/// Activations recorded by a forward pass.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Activations entering each slot (`N × in`). A dormant slot sees the
    /// same activations as the next enabled slot after it.
    pub inputs: Vec<Mat>,
    /// Pre-activations of each enabled slot (`N × width`).
    pub pre: Vec<Option<Mat>>,
    /// Network output (`N × out`).
    pub output: Mat,
}

/// Result of a reverse pass.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// Parameter gradient summed over the batch.
    pub params: ParamTree,
    /// Per-datum gradients with respect to each enabled slot's pre-activations.
    pub pre: Vec<Option<Mat>>,
}

fn null_mask(capacity: usize, content: usize) -> Vec<bool> {
    (0..capacity).map(|i| i >= content).collect()
}

impl Network {
    /// Initializes a network for `template` on inputs of width `input_size`.
    ///
    /// Kernels are Xavier-uniform, biases zero, hidden bases plain SiLU.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] if `input_size` is zero.
    pub fn init(template: &ModelTemplate, input_size: usize, key: Key) -> Result<Self, SproutError> {
        if input_size == 0 {
            return Err(SproutError::config("network input size must be positive"));
        }
        let last = template.num_layers() - 1;
        let mut prev = input_size;
        let mut layers = Vec::with_capacity(template.num_layers());
        let mut nulls = Vec::with_capacity(template.num_layers());
        for (i, (&capacity, content)) in template
            .capacities()
            .iter()
            .zip(template.contents())
            .enumerate()
        {
            let Some(width) = *content else {
                layers.push(None);
                nulls.push(None);
                continue;
            };
            let mut rng = key.fold_in(i as u64).rng();
            let limit = (6.0 / (prev + width) as f64).sqrt();
            let kernel = Mat::from_fn(prev, width, |_, _| rng.gen_range(-limit..limit));
            layers.push(Some(LayerParams {
                kernel,
                bias: Mat::zeros(1, width),
                basis: (i != last).then(|| Basis::silu(width)),
            }));
            nulls.push(Some(null_mask(capacity, width)));
            prev = width;
        }
        Ok(Self {
            input_size,
            params: ParamTree { layers },
            nulls,
        })
    }

    /// Assembles a network from parts without checking consistency.
    /// Call [`Network::check_shapes`] afterwards.
    pub fn from_parts(input_size: usize, params: ParamTree, nulls: Vec<Option<Vec<bool>>>) -> Self {
        Self {
            input_size,
            params,
            nulls,
        }
    }

    /// Width of the network input.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Number of slots.
    pub fn num_layers(&self) -> usize {
        self.params.layers.len()
    }

    /// Parameters of one slot, `None` if dormant or out of range.
    pub fn layer(&self, index: usize) -> Option<&LayerParams> {
        self.params.layers.get(index).and_then(|l| l.as_ref())
    }

    /// Mutable parameters of one slot.
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut LayerParams> {
        self.params.layers.get_mut(index).and_then(|l| l.as_mut())
    }

    /// Null mask of one slot, `None` if dormant.
    pub fn null(&self, index: usize) -> Option<&[bool]> {
        self.nulls.get(index).and_then(|n| n.as_deref())
    }

    /// All null masks.
    pub fn nulls(&self) -> &[Option<Vec<bool>>] {
        &self.nulls
    }

    /// Replaces the null mask of one slot.
    pub fn set_null(&mut self, index: usize, null: Option<Vec<bool>>) -> Result<(), SproutError> {
        let slot = self.nulls.get_mut(index).ok_or_else(|| {
            SproutError::invariant(format!("slot {index} is outside the network"))
        })?;
        *slot = null;
        Ok(())
    }

    /// Installs or removes the parameters of one slot.
    pub fn set_layer(&mut self, index: usize, layer: Option<LayerParams>) -> Result<(), SproutError> {
        let slot = self.params.layers.get_mut(index).ok_or_else(|| {
            SproutError::invariant(format!("slot {index} is outside the network"))
        })?;
        *slot = layer;
        Ok(())
    }

    /// Width of the activations entering `slot`.
    pub fn input_width(&self, slot: usize) -> usize {
        self.params.layers[..slot.min(self.num_layers())]
            .iter()
            .rev()
            .flatten()
            .next()
            .map_or(self.input_size, |p| p.width())
    }

    /// Input null mask seen by a site whose first input slot is `in_index`:
    /// the mask of slot `in_index - 1`, or all-active network inputs.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Invariant`] if slot `in_index - 1` is dormant.
    pub fn input_null(&self, in_index: usize) -> Result<Vec<bool>, SproutError> {
        if in_index == 0 {
            return Ok(vec![false; self.input_size]);
        }
        self.null(in_index - 1).map(<[bool]>::to_vec).ok_or_else(|| {
            SproutError::invariant(format!(
                "slot {} feeding growth input is dormant",
                in_index - 1
            ))
        })
    }

    /// Total parameter count.
    pub fn param_count(&self) -> usize {
        self.params.param_count()
    }

    /// Checks that kernels chain, biases and bases match kernel widths,
    /// the output slot is linear and enabled, and masks cover widths.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] describing the first inconsistency.
    pub fn check_shapes(&self) -> Result<(), SproutError> {
        if self.nulls.len() != self.params.layers.len() {
            return Err(SproutError::shape(format!(
                "{} null masks for {} slots",
                self.nulls.len(),
                self.params.layers.len()
            )));
        }
        let mut prev = self.input_size;
        let last = self.num_layers().saturating_sub(1);
        for (i, (layer, null)) in self.params.layers.iter().zip(&self.nulls).enumerate() {
            let (Some(p), Some(null)) = (layer, null) else {
                if layer.is_some() != null.is_some() {
                    return Err(SproutError::shape(format!(
                        "slot {i} has parameters without a mask or vice versa"
                    )));
                }
                if i == last {
                    return Err(SproutError::shape("output slot is dormant"));
                }
                continue;
            };
            if p.kernel.nrows() != prev {
                return Err(SproutError::shape(format!(
                    "slot {i} kernel expects {} inputs, previous width is {prev}",
                    p.kernel.nrows()
                )));
            }
            let width = p.width();
            if p.bias.shape() != (1, width) {
                return Err(SproutError::shape(format!("slot {i} bias is {:?}", p.bias.shape())));
            }
            match (&p.basis, i == last) {
                (Some(_), true) => return Err(SproutError::shape("output slot has a basis")),
                (None, false) => {
                    return Err(SproutError::shape(format!("hidden slot {i} has no basis")))
                }
                (Some(b), false) if b.width() != width => {
                    return Err(SproutError::shape(format!(
                        "slot {i} basis width {} vs kernel width {width}",
                        b.width()
                    )))
                }
                _ => {}
            }
            if null.len() < width {
                return Err(SproutError::shape(format!(
                    "slot {i} mask covers {} of {width} units",
                    null.len()
                )));
            }
            prev = width;
        }
        Ok(())
    }

    fn check_input(&self, x: &Mat) -> Result<(), SproutError> {
        if x.ncols() != self.input_size {
            return Err(SproutError::shape(format!(
                "input has {} columns, network expects {}",
                x.ncols(),
                self.input_size
            )));
        }
        Ok(())
    }

    /// Output for a batch (`N × input_size`).
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the input width is wrong.
    pub fn forward(&self, x: &Mat) -> Result<Mat, SproutError> {
        self.check_input(x)?;
        let mut a = x.clone();
        for layer in self.params.layers.iter().flatten() {
            let h = layer.affine(&a);
            a = match &layer.basis {
                Some(basis) => basis.apply(&h),
                None => h,
            };
        }
        Ok(a)
    }

    /// Forward pass keeping every slot's input and pre-activation.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the input width is wrong.
    pub fn trace(&self, x: &Mat) -> Result<Trace, SproutError> {
        self.check_input(x)?;
        let mut inputs = Vec::with_capacity(self.num_layers());
        let mut pre = Vec::with_capacity(self.num_layers());
        let mut a = x.clone();
        for layer in &self.params.layers {
            inputs.push(a.clone());
            match layer {
                Some(p) => {
                    let h = p.affine(&a);
                    a = match &p.basis {
                        Some(basis) => basis.apply(&h),
                        None => h.clone(),
                    };
                    pre.push(Some(h));
                }
                None => pre.push(None),
            }
        }
        Ok(Trace {
            inputs,
            pre,
            output: a,
        })
    }

    /// Reverse pass for per-datum output cotangents `cot` (`N × out`).
    ///
    /// The parameter gradient is the sum over the batch; scale `cot` by
    /// `1/N` for a mean loss.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if `cot` does not match the output.
    pub fn backward(&self, trace: &Trace, cot: &Mat) -> Result<Gradients, SproutError> {
        if cot.shape() != trace.output.shape() {
            return Err(SproutError::shape(format!(
                "cotangent {:?} vs output {:?}",
                cot.shape(),
                trace.output.shape()
            )));
        }
        let n = self.num_layers();
        let mut grads: Vec<Option<LayerParams>> = vec![None; n];
        let mut pre_grads: Vec<Option<Mat>> = vec![None; n];
        let mut delta = cot.clone();
        for j in (0..n).rev() {
            let (Some(p), Some(h)) = (&self.params.layers[j], &trace.pre[j]) else {
                continue;
            };
            // delta: gradient with respect to this slot's output
            let (dh, basis_grad) = match &p.basis {
                Some(basis) => (
                    basis.derivative(h).component_mul(&delta),
                    Some(Basis::weight_grad(h, &delta)),
                ),
                None => (delta.clone(), None),
            };
            grads[j] = Some(LayerParams {
                kernel: trace.inputs[j].tr_mul(&dh),
                bias: column_sums(&dh),
                basis: basis_grad,
            });
            delta = &dh * p.kernel.transpose();
            pre_grads[j] = Some(dh);
        }
        Ok(Gradients {
            params: ParamTree { layers: grads },
            pre: pre_grads,
        })
    }

    /// Forward-mode derivative of the output along `tangent`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if `tangent` does not match the
    /// parameter structure.
    pub fn jvp(&self, trace: &Trace, tangent: &ParamTree) -> Result<Mat, SproutError> {
        if tangent.layers.len() != self.num_layers() {
            return Err(SproutError::shape("tangent slot count differs from network"));
        }
        if trace.pre.len() != self.num_layers() || trace.inputs.len() != self.num_layers() {
            return Err(SproutError::shape("trace slot count differs from network"));
        }
        let rows = trace.output.nrows();
        let mut da = Mat::zeros(rows, self.input_size);
        for (j, (layer, t)) in self.params.layers.iter().zip(&tangent.layers).enumerate() {
            let (p, t, h) = match (layer, t, &trace.pre[j]) {
                (None, None, _) => continue,
                (Some(p), Some(t), Some(h))
                    if t.kernel.shape() == p.kernel.shape()
                        && t.bias.shape() == p.bias.shape()
                        && h.shape() == (rows, p.width())
                        && trace.inputs[j].shape() == (rows, p.kernel.nrows()) =>
                {
                    (p, t, h)
                }
                _ => {
                    return Err(SproutError::shape(format!(
                        "tangent does not match slot {j}"
                    )))
                }
            };
            let mut dh = &da * &p.kernel + &trace.inputs[j] * &t.kernel;
            crate::linalg::add_row(&mut dh, &t.bias);
            da = match (&p.basis, &t.basis) {
                (Some(basis), Some(dbasis)) if same_basis_shape(basis, dbasis) => {
                    basis.jvp(h, &dh, dbasis)
                }
                (None, None) => dh,
                _ => {
                    return Err(SproutError::shape(format!(
                        "tangent basis does not match slot {j}"
                    )))
                }
            };
        }
        Ok(da)
    }
}

fn same_basis_shape(a: &Basis, b: &Basis) -> bool {
    a.constant.shape() == b.constant.shape()
        && a.linear.shape() == b.linear.shape()
        && a.silu.shape() == b.silu.shape()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_net() -> (Network, Mat) {
        let template = ModelTemplate::with_output(vec![4, 3], vec![Some(3), Some(2)], 2).unwrap();
        let mut net = Network::init(&template, 2, Key::new(3)).unwrap();
        // Non-trivial basis and bias so every leaf matters.
        if let Some(p) = net.layer_mut(0) {
            p.bias = Mat::from_row_slice(1, 3, &[0.1, -0.2, 0.3]);
            if let Some(b) = p.basis.as_mut() {
                b.constant = Mat::from_row_slice(1, 3, &[0.05, 0.0, -0.1]);
                b.linear = Mat::from_row_slice(1, 3, &[0.2, -0.3, 0.1]);
            }
        }
        let x = Mat::from_row_slice(3, 2, &[0.5, -1.0, 1.5, 0.2, -0.7, 0.9]);
        (net, x)
    }

    fn half_sq(net: &Network, x: &Mat) -> f64 {
        net.forward(x).unwrap().norm_squared() / 2.0
    }

    fn kernel(p: &mut LayerParams) -> &mut Mat {
        &mut p.kernel
    }

    fn bias(p: &mut LayerParams) -> &mut Mat {
        &mut p.bias
    }

    fn basis_constant(p: &mut LayerParams) -> &mut Mat {
        &mut p.basis.as_mut().unwrap().constant
    }

    fn basis_linear(p: &mut LayerParams) -> &mut Mat {
        &mut p.basis.as_mut().unwrap().linear
    }

    fn basis_silu(p: &mut LayerParams) -> &mut Mat {
        &mut p.basis.as_mut().unwrap().silu
    }

    fn check_leaf(
        net: &Network,
        x: &Mat,
        layer: usize,
        pick: fn(&mut LayerParams) -> &mut Mat,
        got: &Mat,
    ) {
        let h = 1e-6;
        for idx in 0..got.len() {
            let mut plus = net.clone();
            let mut minus = net.clone();
            pick(plus.layer_mut(layer).unwrap())[idx] += h;
            pick(minus.layer_mut(layer).unwrap())[idx] -= h;
            let fd = (half_sq(&plus, x) - half_sq(&minus, x)) / (2.0 * h);
            assert!(
                (fd - got[idx]).abs() < 1e-6,
                "slot {layer} leaf[{idx}]: {fd} vs {}",
                got[idx]
            );
        }
    }

    #[test]
    fn backward_matches_finite_difference() {
        let (net, x) = toy_net();
        let trace = net.trace(&x).unwrap();
        let grads = net.backward(&trace, &trace.output).unwrap();
        for layer in [0, 1, 2] {
            let g = grads.params.layers[layer].as_ref().unwrap();
            check_leaf(&net, &x, layer, kernel, &g.kernel);
            check_leaf(&net, &x, layer, bias, &g.bias);
            if let Some(gb) = &g.basis {
                check_leaf(&net, &x, layer, basis_constant, &gb.constant);
                check_leaf(&net, &x, layer, basis_linear, &gb.linear);
                check_leaf(&net, &x, layer, basis_silu, &gb.silu);
            }
        }
    }

    #[test]
    fn jvp_matches_finite_difference() {
        let (net, x) = toy_net();
        let trace = net.trace(&x).unwrap();
        let tangent = net.params.tree_map(|m| m.map(|v| 0.3 * v.sin() + 0.1));
        let jt = net.jvp(&trace, &tangent).unwrap();
        let eps = 1e-6;
        let shifted = |s: f64| {
            let mut moved = net.clone();
            moved.params = net.params.tree_zip_map(&tangent, |p, t| p + t * s).unwrap();
            moved.forward(&x).unwrap()
        };
        let fd = (shifted(eps) - shifted(-eps)) / (2.0 * eps);
        assert!((fd - jt).abs().max() < 1e-6);
    }

    #[test]
    fn jvp_rejects_malformed_tangent() {
        let (net, x) = toy_net();
        let trace = net.trace(&x).unwrap();

        let mut short_bias = net.params.zeros_like();
        if let Some(t) = short_bias.layers[0].as_mut() {
            t.bias = Mat::zeros(1, 2);
        }
        assert!(matches!(
            net.jvp(&trace, &short_bias),
            Err(SproutError::Shape { .. })
        ));

        let mut short_basis = net.params.zeros_like();
        if let Some(b) = short_basis.layers[0].as_mut().and_then(|t| t.basis.as_mut()) {
            b.silu = Mat::zeros(1, 1);
        }
        assert!(net.jvp(&trace, &short_basis).is_err());

        let mut truncated = net.trace(&x).unwrap();
        truncated.pre.pop();
        assert!(matches!(
            net.jvp(&truncated, &net.params.zeros_like()),
            Err(SproutError::Shape { .. })
        ));
    }

    #[test]
    fn dormant_slots_pass_through() {
        let template = ModelTemplate::with_output(vec![4, 4], vec![Some(3), None], 2).unwrap();
        let net = Network::init(&template, 2, Key::new(1)).unwrap();
        let trace = net.trace(&Mat::from_element(4, 2, 0.5)).unwrap();
        assert!(trace.pre[1].is_none());
        assert_eq!(trace.inputs[1], trace.inputs[2]);
        assert_eq!(net.input_width(1), 3);
        assert_eq!(net.input_width(2), 3);
        assert_eq!(net.input_width(0), 2);
        assert!(net.input_null(2).is_err());
        assert_eq!(net.input_null(1).unwrap(), vec![false, false, false, true]);
        net.check_shapes().unwrap();
    }

    #[test]
    fn rejects_wrong_input_width() {
        let (net, _) = toy_net();
        assert!(matches!(
            net.forward(&Mat::zeros(2, 5)),
            Err(SproutError::Shape { .. })
        ));
    }

    #[test]
    fn serde_round_trip_keeps_outputs() {
        let (net, x) = toy_net();
        let json = serde_json::to_string(&net).unwrap();
        let back: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(net.forward(&x).unwrap(), back.forward(&x).unwrap());
    }
}
