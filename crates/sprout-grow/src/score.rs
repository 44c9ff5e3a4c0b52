//! Candidate scoring.
//!
//! The r-score of a feature `f` is the loss decrease its outputs would buy
//! the receiving slot under the curvature model:
//!
//! ```text
//! F = f(act_in),  A_f = E[F Fᵀ],  C = E[F ⊗ res]
//! N = (A_f + t·I)⁺ C G⁻¹,         r = Σ C ⊙ N
//! ```
//!
//! Its gradient with respect to `F` is `(2/B)(res − F A_f⁺ C) Nᵀ`, pulled
//! back through the feature with [`Feature::vjp`].

use sprout_core::SproutError;
use sprout_net::linalg::{cross_moment, mean_diag, pinv, second_moment, tikhonov, Mat};
use sprout_net::Feature;

use crate::curvature::SiteCurvature;

/// Fixed inputs of the score for one site.
#[derive(Debug, Clone, Copy)]
pub struct ScoreContext<'a> {
    /// Activations the candidate reads.
    pub act_in: &'a Mat,
    /// Residual of the receiving slot.
    pub residual: &'a Mat,
    /// Inverse output-gradient factor.
    pub g_inv: &'a Mat,
    /// Relative Tikhonov damping of the candidate's `A_f`.
    pub a_damping: f64,
    /// Divisor applied to scores and gradients.
    pub norm: f64,
}

impl<'a> ScoreContext<'a> {
    /// Context over a prepared site.
    pub fn new(site: &'a SiteCurvature, a_damping: f64, norm: f64) -> Self {
        Self {
            act_in: &site.act_in,
            residual: &site.residual,
            g_inv: &site.g_inv,
            a_damping,
            norm,
        }
    }

    /// Same site with another score divisor.
    pub fn with_norm(self, norm: f64) -> Self {
        Self { norm, ..self }
    }

    /// Normalised r-score of `feature`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the feature does not read `act_in`.
    pub fn score(&self, feature: &Feature) -> Result<f64, SproutError> {
        let out = feature.apply(self.act_in)?.out;
        let (r, _, _) = self.moments(&out)?;
        Ok(r / self.norm)
    }

    /// Normalised r-score and its gradient with respect to every feature
    /// parameter.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the feature does not read `act_in`.
    pub fn score_and_grad(&self, feature: &Feature) -> Result<(f64, Feature), SproutError> {
        let trace = feature.apply(self.act_in)?;
        let (r, a_inv_c, normed) = self.moments(&trace.out)?;
        let batch = trace.out.nrows().max(1) as f64;
        let unexplained = self.residual - &trace.out * a_inv_c;
        let dout = unexplained * normed.transpose() * (2.0 / batch / self.norm);
        let grad = feature.vjp(self.act_in, &trace, &dout);
        Ok((r / self.norm, grad))
    }

    /// Raw score, `A_f⁺ C` and `N`.
    fn moments(&self, out: &Mat) -> Result<(f64, Mat, Mat), SproutError> {
        let a = second_moment(out);
        let a_inv = pinv(&tikhonov(&a, self.a_damping * mean_diag(&a)));
        let c = cross_moment(out, self.residual)?;
        if c.ncols() != self.g_inv.nrows() {
            return Err(SproutError::shape(format!(
                "residual width {} vs inverse factor {:?}",
                c.ncols(),
                self.g_inv.shape()
            )));
        }
        let a_inv_c = a_inv * &c;
        let normed = &a_inv_c * self.g_inv;
        let r = c.component_mul(&normed).sum();
        Ok((r, a_inv_c, normed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprout_core::Key;

    fn fixture() -> (Mat, Mat, Mat) {
        let act = Mat::from_fn(12, 2, |i, j| ((i * 5 + j * 7) % 9) as f64 / 4.0 - 1.0);
        let res = Mat::from_fn(12, 2, |i, j| ((i + 2 * j) as f64 * 0.7).cos());
        let g_inv = Mat::from_row_slice(2, 2, &[1.5, 0.2, 0.2, 0.8]);
        (act, res, g_inv)
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let (act, res, g_inv) = fixture();
        let ctx = ScoreContext {
            act_in: &act,
            residual: &res,
            g_inv: &g_inv,
            a_damping: 0.0,
            norm: 2.0,
        };
        let feature = Feature::init(&mut Key::new(3).rng(), 2, 1);
        let (score, grad) = ctx.score_and_grad(&feature).unwrap();
        assert!((score - ctx.score(&feature).unwrap()).abs() < 1e-12);
        let theta = feature.to_vector();
        let grad = grad.to_vector();
        let h = 1e-6;
        for i in 0..theta.len() {
            let mut plus = theta.clone();
            plus[i] += h;
            let mut minus = theta.clone();
            minus[i] -= h;
            let fp = ctx.score(&feature.with_vector(&plus).unwrap()).unwrap();
            let fm = ctx.score(&feature.with_vector(&minus).unwrap()).unwrap();
            let fd = (fp - fm) / (2.0 * h);
            assert!((fd - grad[i]).abs() < 1e-5 * fd.abs().max(1.0), "param {i}: {fd} vs {}", grad[i]);
        }
    }

    #[test]
    fn score_is_nonnegative_and_scales_with_norm() {
        let (act, res, g_inv) = fixture();
        let ctx = ScoreContext {
            act_in: &act,
            residual: &res,
            g_inv: &g_inv,
            a_damping: 0.1,
            norm: 1.0,
        };
        let feature = Feature::init(&mut Key::new(9).rng(), 2, 2);
        let raw = ctx.score(&feature).unwrap();
        assert!(raw >= 0.0);
        let halved = ctx.with_norm(2.0).score(&feature).unwrap();
        assert!((raw / 2.0 - halved).abs() < 1e-12);
    }

    #[test]
    fn rejects_feature_of_wrong_width() {
        let (act, res, g_inv) = fixture();
        let ctx = ScoreContext {
            act_in: &act,
            residual: &res,
            g_inv: &g_inv,
            a_damping: 0.0,
            norm: 1.0,
        };
        let feature = Feature::init(&mut Key::new(1).rng(), 3, 1);
        assert!(ctx.score(&feature).is_err());
    }
}
