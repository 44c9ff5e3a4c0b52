//! Deterministic candidate refinement.
//!
//! Plain gradient ascent on the r-score with a ratcheting step size: a step
//! that does not strictly improve the score divides the step by three, and
//! the step never grows back. A log-determinant penalty on the kernel Gram
//! keeps the candidate's outputs from collapsing onto each other.

use sprout_core::SproutError;
use sprout_net::linalg::slogdet_gram;
use sprout_net::Feature;

use crate::score::ScoreContext;

/// Factor applied to the step after a non-improving update.
pub const STEP_DECAY: f64 = 3.0;

/// Result of [`refine_ascent`].
#[derive(Debug, Clone)]
pub struct AscentResult {
    /// Score of the returned feature under the context's normaliser.
    pub score: f64,
    /// Refined feature.
    pub feature: Feature,
    /// Step size used at every iteration.
    pub step_sizes: Vec<f64>,
}

/// Next step size: unchanged after a strict improvement, divided by
/// [`STEP_DECAY`] otherwise.
///
/// # Example
///
/// ```
/// use sprout_grow::ascent::ratchet_step;
///
/// assert_eq!(ratchet_step(0.3, true), 0.3);
/// assert!((ratchet_step(0.3, false) - 0.1).abs() < 1e-12);
/// ```
pub fn ratchet_step(step: f64, improved: bool) -> f64 {
    if improved {
        step
    } else {
        step / STEP_DECAY
    }
}

/// Runs `steps` ascent iterations from `feature`.
///
/// Each iteration moves `θ ← θ + ε∇r − λ·ld·∇ld` where `ld` is the
/// log-determinant of the kernel Gram and `λ = logdet_weight`. A step that
/// produces a non-finite score is discarded.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if the feature does not fit the context.
pub fn refine_ascent(
    ctx: &ScoreContext<'_>,
    feature: Feature,
    steps: usize,
    initial_step: f64,
    logdet_weight: f64,
) -> Result<AscentResult, SproutError> {
    let mut feature = feature;
    let (mut score, mut grad) = ctx.score_and_grad(&feature)?;
    let mut step = initial_step;
    let mut step_sizes = Vec::with_capacity(steps);

    for _ in 0..steps {
        step_sizes.push(step);
        let mut next = feature.add_scaled(step, &grad)?;
        if logdet_weight != 0.0 {
            let (ld, ld_grad) = slogdet_gram(&feature.kernel);
            next.kernel -= ld_grad * (logdet_weight * ld);
        }
        let (next_score, next_grad) = ctx.score_and_grad(&next)?;
        if !next_score.is_finite() {
            tracing::debug!(step, "discarding non-finite ascent step");
            step = ratchet_step(step, false);
            continue;
        }
        step = ratchet_step(step, next_score > score);
        feature = next;
        score = next_score;
        grad = next_grad;
    }

    Ok(AscentResult {
        score,
        feature,
        step_sizes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprout_core::Key;
    use sprout_net::linalg::Mat;

    #[test]
    fn step_sizes_never_increase() {
        let act = Mat::from_fn(20, 2, |i, j| ((i * 3 + j * 5) % 7) as f64 / 3.0 - 1.0);
        let res = Mat::from_fn(20, 1, |i, _| (i as f64 * 0.4).sin());
        let g_inv = Mat::from_element(1, 1, 1.0);
        let ctx = ScoreContext {
            act_in: &act,
            residual: &res,
            g_inv: &g_inv,
            a_damping: 0.0,
            norm: 1.0,
        };
        let start = Feature::init(&mut Key::new(6).rng(), 2, 1);
        let initial = ctx.score(&start).unwrap();
        let result = refine_ascent(&ctx, start, 25, 0.5, 1e-2).unwrap();
        assert_eq!(result.step_sizes.len(), 25);
        assert!(result.step_sizes.windows(2).all(|w| w[1] <= w[0]));
        assert!(result.score.is_finite());
        assert!(result.score >= 0.0);
        assert!((ctx.score(&result.feature).unwrap() - result.score).abs() < 1e-9);
        assert!(initial.is_finite());
    }

    #[test]
    fn ratchet_only_shrinks() {
        let mut step = 1.0;
        for improved in [true, false, true, false, false] {
            let next = ratchet_step(step, improved);
            assert!(next <= step);
            step = next;
        }
        assert!((step - 1.0 / 27.0).abs() < 1e-12);
    }
}
