//! Block-diagonal curvature estimates.
//!
//! [`observe`] runs one forward pass with a JVP along a tangent and two
//! backward passes, and keeps for every enabled slot the Kronecker factors
//! `A = E[a aᵀ]` (slot inputs) and `G = E[g gᵀ]` (pre-activation gradients
//! of the per-datum normalised loss gradient), plus the residual
//! pre-activation gradients left after removing the tangent's explained
//! part of the output gradient.
//!
//! [`SiteCurvature::prepare`] narrows a snapshot to one growth site: the
//! activations a candidate reads, the residual of the receiving slot after
//! projecting out what its current inputs already explain, the damped
//! inverse of its `G`, and the baseline score of its existing kernel.

use sprout_core::{ModelTemplate, SproutError};
use sprout_net::linalg::{cross_moment, mean_diag, pinv, second_moment, tikhonov, Mat};
use sprout_net::{LossFunction, Network, ParamTree};

use crate::data::Batch;

/// Curvature factors of one enabled slot.
#[derive(Debug, Clone)]
pub struct LayerCurvature {
    /// Second moment of the slot's inputs.
    pub a: Mat,
    /// Second moment of the slot's normalised pre-activation gradients.
    pub g: Mat,
    /// Per-datum residual pre-activation gradients (`N × width`).
    pub residual: Mat,
}

/// Everything [`observe`] measured on one batch.
#[derive(Debug, Clone)]
pub struct CurvatureSnapshot {
    /// Per-slot factors, `None` for dormant slots.
    pub layers: Vec<Option<LayerCurvature>>,
    /// Activations entering each slot.
    pub acts: Vec<Mat>,
    /// Per-datum output loss gradients, unnormalised.
    pub dloss: Mat,
    /// `E‖dℓ‖²`.
    pub loss_sqnorm: f64,
}

/// Measures curvature factors and residuals of `net` on `batch`.
///
/// `tangent` is the direction whose linearised effect is removed from the
/// residual; pass a zero tree for plain output gradients.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if the batch, labels or tangent do not fit
/// the network.
pub fn observe(
    net: &Network,
    loss: &dyn LossFunction,
    tangent: &ParamTree,
    batch: &Batch,
) -> Result<CurvatureSnapshot, SproutError> {
    let trace = net.trace(&batch.inputs)?;
    let (_, dloss) = loss.evaluate(&trace.output, &batch.labels)?;
    let n = dloss.nrows().max(1) as f64;
    let loss_sqnorm = dloss.norm_squared() / n;

    let jt = net.jvp(&trace, tangent)?;
    let rho = jt.component_mul(&dloss).sum() / (jt.norm_squared() + 1e-10);
    let lres = &dloss - &jt * rho;

    let mut normed = dloss.clone();
    for mut row in normed.row_iter_mut() {
        let norm = row.norm().max(1e-12);
        row /= norm;
    }

    let grads = net.backward(&trace, &normed)?;
    let residuals = net.backward(&trace, &lres)?;

    let layers = grads
        .pre
        .iter()
        .zip(&residuals.pre)
        .zip(&trace.inputs)
        .map(|((g, r), input)| match (g, r) {
            (Some(g), Some(r)) => Some(LayerCurvature {
                a: second_moment(input),
                g: second_moment(g),
                residual: r.clone(),
            }),
            _ => None,
        })
        .collect();

    Ok(CurvatureSnapshot {
        layers,
        acts: trace.inputs,
        dloss,
        loss_sqnorm,
    })
}

/// `res − act·A⁺·Craᵀ` with `Cra = E[res ⊗ act]`: the part of the residual
/// the slot's current inputs cannot explain linearly.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if `res` and `act` differ in batch size.
pub fn layer_residual(a: &Mat, res: &Mat, act: &Mat) -> Result<Mat, SproutError> {
    let cra = cross_moment(res, act)?;
    Ok(res - act * pinv(a) * cra.transpose())
}

/// Score of the slot's existing kernel: `Σ ∇K ⊙ (A⁺ ∇K G⁺)`.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if `kernel_grad` is not `dim(A) × dim(G)`.
pub fn layer_baseline(a: &Mat, g: &Mat, kernel_grad: &Mat) -> Result<f64, SproutError> {
    if kernel_grad.shape() != (a.nrows(), g.nrows()) {
        return Err(SproutError::shape(format!(
            "kernel gradient {:?} vs factors {}x{}",
            kernel_grad.shape(),
            a.nrows(),
            g.nrows()
        )));
    }
    let normed = pinv(a) * kernel_grad * pinv(g);
    Ok(kernel_grad.component_mul(&normed).sum())
}

/// Curvature seen by candidates for one growth site.
#[derive(Debug, Clone)]
pub struct SiteCurvature {
    /// Slot being grown.
    pub site: usize,
    /// First slot whose input the candidate reads.
    pub in_index: usize,
    /// Receiving slot.
    pub out_index: usize,
    /// Activations the candidate reads (`N × in`).
    pub act_in: Mat,
    /// Receiving slot residual after projecting out its current inputs.
    pub residual: Mat,
    /// Damped pseudo-inverse of the receiving slot's `G`.
    pub g_inv: Mat,
    /// Baseline score of the receiving slot's kernel.
    pub baseline: f64,
    /// `E‖dℓ‖²` of the batch.
    pub loss_sqnorm: f64,
}

impl SiteCurvature {
    /// Narrows `snapshot` to `site`.
    ///
    /// `kernel_grad` is the mean training gradient of the receiving slot's
    /// kernel; `g_damping` scales the Tikhonov term `meandiag(G)·I`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Invariant`] if no enabled slot receives the
    /// site's output, and [`SproutError::Shape`] on mismatched factors.
    pub fn prepare(
        snapshot: &CurvatureSnapshot,
        template: &ModelTemplate,
        site: usize,
        kernel_grad: &Mat,
        g_damping: f64,
    ) -> Result<Self, SproutError> {
        let (in_index, out_index) = template.in_out_indices(site)?;
        let layer = snapshot
            .layers
            .get(out_index)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                SproutError::invariant(format!("receiving slot {out_index} was not observed"))
            })?;
        let residual = layer_residual(&layer.a, &layer.residual, &snapshot.acts[out_index])?;
        let g_inv = pinv(&tikhonov(&layer.g, g_damping * mean_diag(&layer.g)));
        let baseline = layer_baseline(&layer.a, &layer.g, kernel_grad)?;
        Ok(Self {
            site,
            in_index,
            out_index,
            act_in: snapshot.acts[in_index].clone(),
            residual,
            g_inv,
            baseline,
            loss_sqnorm: snapshot.loss_sqnorm,
        })
    }
}
