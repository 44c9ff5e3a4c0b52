//! Langevin candidate refinement.
//!
//! Samples candidates from `exp(−E(θ)/T)` with
//! `E(θ) = −r(θ)/s + ½‖θ‖²`, using Metropolis-adjusted Langevin proposals
//! `θ' = θ − η∇E(θ) + √(2ηT)·ξ`. Proposals run in bursts; after each burst
//! the acceptance rate nudges `η` towards [`TARGET_ACCEPTANCE`].

use rand::Rng;
use sprout_core::keys::normal_vec;
use sprout_core::{Key, SproutError};
use sprout_net::Feature;

use crate::score::ScoreContext;

/// Acceptance rate the step controller aims for.
pub const TARGET_ACCEPTANCE: f64 = 0.6;
/// Deviation from the target tolerated without changing the step.
pub const ACCEPTANCE_TOLERANCE: f64 = 0.3;
/// Multiplicative step adjustment.
pub const STEP_FACTOR: f64 = 1.3;

/// Result of [`refine_mala`].
#[derive(Debug, Clone)]
pub struct MalaResult {
    /// Final chain state.
    pub feature: Feature,
    /// Raw r-score of the final state (normalised score times `s`).
    pub score: f64,
    /// Acceptance rate of every burst.
    pub acceptance_rates: Vec<f64>,
    /// Step size after the last burst.
    pub final_step: f64,
}

/// Step-size controller applied after a burst with acceptance `rate`.
///
/// # Example
///
/// ```
/// use sprout_grow::mala::adapt_step_size;
///
/// assert!(adapt_step_size(0.1, 0.95) > 0.1);
/// assert!(adapt_step_size(0.1, 0.2) < 0.1);
/// assert_eq!(adapt_step_size(0.1, 0.6), 0.1);
/// ```
pub fn adapt_step_size(step: f64, rate: f64) -> f64 {
    let deviation = rate - TARGET_ACCEPTANCE;
    // slack keeps rates that sit exactly on a band edge, such as 9/10, inside
    if deviation.abs() <= ACCEPTANCE_TOLERANCE + 1e-9 {
        step
    } else if deviation > 0.0 {
        step * STEP_FACTOR
    } else {
        step / STEP_FACTOR
    }
}

/// Chain state: parameters, energy and energy gradient.
struct State {
    theta: Vec<f64>,
    energy: f64,
    grad: Vec<f64>,
}

fn evaluate(ctx: &ScoreContext<'_>, shape: &Feature, theta: Vec<f64>) -> Result<State, SproutError> {
    let feature = shape.with_vector(&theta)?;
    let (score, score_grad) = ctx.score_and_grad(&feature)?;
    let prior = 0.5 * theta.iter().map(|t| t * t).sum::<f64>();
    let grad = score_grad
        .to_vector()
        .iter()
        .zip(&theta)
        .map(|(g, t)| t - g)
        .collect();
    Ok(State {
        theta,
        energy: prior - score,
        grad,
    })
}

/// `log q(to | from)` up to a constant, for the Langevin proposal.
fn log_proposal(to: &[f64], from: &State, step: f64, temperature: f64) -> f64 {
    let sq: f64 = to
        .iter()
        .zip(&from.theta)
        .zip(&from.grad)
        .map(|((t, f), g)| {
            let d = t - f + step * g;
            d * d
        })
        .sum();
    -sq / (4.0 * step * temperature)
}

/// Runs `bursts × steps_per_burst` MALA proposals from `feature`.
///
/// The context's normaliser is the energy scale `s`; pass the site
/// baseline so the temperature is comparable across sites.
///
/// # Errors
///
/// Returns [`SproutError::Shape`] if the feature does not fit the context,
/// or [`SproutError::Config`] for a non-positive step or temperature.
pub fn refine_mala(
    ctx: &ScoreContext<'_>,
    feature: Feature,
    bursts: usize,
    steps_per_burst: usize,
    step: f64,
    temperature: f64,
    key: Key,
) -> Result<MalaResult, SproutError> {
    if step <= 0.0 || temperature <= 0.0 {
        return Err(SproutError::config(format!(
            "MALA needs positive step and temperature, got {step} and {temperature}"
        )));
    }
    let mut rng = key.rng();
    let mut current = evaluate(ctx, &feature, feature.to_vector())?;
    let mut step = step;
    let mut acceptance_rates = Vec::with_capacity(bursts);

    for _ in 0..bursts {
        let mut accepted = 0usize;
        for _ in 0..steps_per_burst {
            let noise = normal_vec(&mut rng, current.theta.len());
            let spread = (2.0 * step * temperature).sqrt();
            let proposal: Vec<f64> = current
                .theta
                .iter()
                .zip(&current.grad)
                .zip(&noise)
                .map(|((t, g), n)| t - step * g + spread * n)
                .collect();
            let candidate = evaluate(ctx, &feature, proposal)?;
            let u: f64 = rng.gen();
            if !candidate.energy.is_finite() {
                continue;
            }
            let log_accept = (current.energy - candidate.energy) / temperature
                + log_proposal(&current.theta, &candidate, step, temperature)
                - log_proposal(&candidate.theta, &current, step, temperature);
            if u.ln() < log_accept {
                current = candidate;
                accepted += 1;
            }
        }
        let rate = accepted as f64 / steps_per_burst.max(1) as f64;
        step = adapt_step_size(step, rate);
        acceptance_rates.push(rate);
    }

    let final_feature = feature.with_vector(&current.theta)?;
    let score = ctx.score(&final_feature)? * ctx.norm;
    Ok(MalaResult {
        feature: final_feature,
        score,
        acceptance_rates,
        final_step: step,
    })
}
