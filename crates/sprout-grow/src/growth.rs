//! Growth decisions.
//!
//! One growth cycle visits every growable site of the live template:
//!
//! 1. **Observe**: curvature snapshots on the addition batch and the
//!    validation batch (zero tangent for width sites, the optimizer
//!    direction for depth sites unless `pure_kfac`)
//! 2. **Propose**: `proposals_per_site` random candidates per site
//! 3. **Refine**: every candidate in parallel on the rayon pool, each with
//!    its own feature and pre-drawn key
//! 4. **Select**: a categorical draw over `r / (T·baseline)`; the expected
//!    score `r̄` under the same softmax is what the gates see
//! 5. **Validate**: rescore the selected candidate on the validation batch
//! 6. **Gate**: relative and absolute thresholds
//!
//! The single modification with the highest ratio `1 + r̄/global_baseline`
//! is committed, and the full-training-set loss is checked before and after.
//! A regression either aborts the run or rolls back and cools the site down.

use std::collections::HashMap;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sprout_core::keys::categorical;
use sprout_core::{Key, KeyStream, MetricsSink, ModelTemplate, SproutError};
use sprout_net::linalg::make_invertible;
use sprout_net::{Feature, Network, ParamTree};

use crate::ascent::refine_ascent;
use crate::curvature::{observe, CurvatureSnapshot, SiteCurvature};
use crate::data::Batch;
use crate::mala::refine_mala;
use crate::proposer::{embed_feature, embed_layer, new_feature};
use crate::score::ScoreContext;
use crate::solver::Solver;

/// Candidate refinement algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefineMethod {
    /// Ratcheting-step gradient ascent.
    Ascent,
    /// Metropolis-adjusted Langevin sampling.
    Mala,
}

/// What to do when a committed modification makes the training loss worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionPolicy {
    /// Stop with [`SproutError::Regression`].
    Abort,
    /// Restore the previous architecture and cool the site down.
    Rollback,
}

/// Growth engine settings.
///
/// # Example
///
/// ```
/// use sprout_grow::growth::{GrowthConfig, RefineMethod};
///
/// let config = GrowthConfig::default();
/// assert_eq!(config.proposals_per_site, 10);
/// assert_eq!(config.depth_method, RefineMethod::Mala);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthConfig {
    /// Run growth cycles at all.
    pub enabled: bool,
    /// Consider adding units to enabled slots.
    pub allow_width: bool,
    /// Consider activating dormant slots.
    pub allow_depth: bool,
    /// Candidates per width site (default: 10).
    pub proposals_per_site: usize,
    /// Candidates per depth site (default: 10).
    pub layer_proposals_per_site: usize,
    /// Ascent iterations, or MALA bursts (default: 10).
    pub steps: usize,
    /// MALA proposals per burst (default: 10).
    pub mala_steps_per_burst: usize,
    /// Initial step size for width candidates (default: 0.1).
    pub initial_step_size: f64,
    /// Initial step size for depth candidates (default: 0.3).
    pub layer_initial_step_size: f64,
    /// Selection and MALA temperature (default: 1).
    pub temperature: f64,
    /// Minimum `r̄ / baseline` (default: 1).
    pub thresh: f64,
    /// Minimum `r̄ / E‖dℓ‖²` for width (default: 0).
    pub abs_thresh: f64,
    /// Minimum adjusted `r̄ / E‖dℓ‖²` for depth (default: 0).
    pub layer_abs_thresh: f64,
    /// Cost divisor of a new layer's score (default: 1).
    pub layer_cost_mul: f64,
    /// Multiply the layer cost by the new layer's width.
    pub size_costing: bool,
    /// Epochs between growth cycles (default: 20).
    pub cooldown: usize,
    /// Epochs a rolled-back site is skipped (default: 20).
    pub rollback_cooldown: usize,
    /// Relative Tikhonov damping of `G` (default: 0.1).
    pub g_damping: f64,
    /// Relative Tikhonov damping of a candidate's `A_f` (default: 0).
    pub a_damping: f64,
    /// Log-determinant penalty weight in ascent (default: 0.01).
    pub logdet_weight: f64,
    /// Maximum loss ratio after adding width (default: 1.001).
    pub width_tolerance: f64,
    /// Maximum loss ratio after adding a layer (default: 1.2).
    pub depth_tolerance: f64,
    /// Behaviour on a loss regression.
    pub on_regression: RegressionPolicy,
    /// Refinement for width candidates.
    pub width_method: RefineMethod,
    /// Refinement for depth candidates.
    pub depth_method: RefineMethod,
    /// Use a zero tangent for depth sites too.
    pub pure_kfac: bool,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_width: true,
            allow_depth: true,
            proposals_per_site: 10,
            layer_proposals_per_site: 10,
            steps: 10,
            mala_steps_per_burst: 10,
            initial_step_size: 0.1,
            layer_initial_step_size: 0.3,
            temperature: 1.0,
            thresh: 1.0,
            abs_thresh: 0.0,
            layer_abs_thresh: 0.0,
            layer_cost_mul: 1.0,
            size_costing: false,
            cooldown: 20,
            rollback_cooldown: 20,
            g_damping: 0.1,
            a_damping: 0.0,
            logdet_weight: 1e-2,
            width_tolerance: 1.001,
            depth_tolerance: 1.2,
            on_regression: RegressionPolicy::Abort,
            width_method: RefineMethod::Ascent,
            depth_method: RefineMethod::Mala,
            pure_kfac: false,
        }
    }
}

impl GrowthConfig {
    /// Checks ranges.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<(), SproutError> {
        let positive = [
            ("temperature", self.temperature),
            ("initial_step_size", self.initial_step_size),
            ("layer_initial_step_size", self.layer_initial_step_size),
            ("layer_cost_mul", self.layer_cost_mul),
            ("width_tolerance", self.width_tolerance),
            ("depth_tolerance", self.depth_tolerance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(SproutError::config(format!("evo.{name} must be positive, got {value}")));
            }
        }
        let counts = [
            ("proposals_per_site", self.proposals_per_site),
            ("layer_proposals_per_site", self.layer_proposals_per_site),
            ("mala_steps_per_burst", self.mala_steps_per_burst),
            ("cooldown", self.cooldown),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(SproutError::config(format!("evo.{name} must be at least 1")));
            }
        }
        if self.g_damping < 0.0 || self.a_damping < 0.0 {
            return Err(SproutError::config("evo damping must be non-negative"));
        }
        Ok(())
    }
}

/// Kind of architectural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthKind {
    /// One unit added to an enabled slot.
    Width,
    /// A dormant slot activated.
    Depth,
}

impl fmt::Display for GrowthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Width => write!(f, "width"),
            Self::Depth => write!(f, "depth"),
        }
    }
}

/// A gated candidate modification, not yet committed.
#[derive(Debug, Clone)]
pub struct Modification {
    /// Kind of change.
    pub kind: GrowthKind,
    /// Slot grown.
    pub site: usize,
    /// `1 + r̄ / global_baseline` (depth uses the cost-adjusted score).
    pub ratio: f64,
    /// Grown template.
    pub template: ModelTemplate,
    /// Grown network.
    pub network: Network,
}

/// Outcome of a committed (or rolled-back) modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthEvent {
    /// Epoch of the cycle.
    pub epoch: usize,
    /// Kind of change.
    pub kind: GrowthKind,
    /// Slot grown.
    pub site: usize,
    /// Selection ratio.
    pub ratio: f64,
    /// Full-training-set loss before the commit.
    pub loss_before: f64,
    /// Full-training-set loss after the commit.
    pub loss_after: f64,
    /// Contents after the cycle.
    pub contents: Vec<Option<usize>>,
    /// True if the change was undone.
    pub rolled_back: bool,
}

/// Curvature snapshots shared by every site of one kind in a cycle.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Snapshot on the addition batch.
    pub train: CurvatureSnapshot,
    /// Snapshot on the validation batch.
    pub validation: CurvatureSnapshot,
}

impl Observation {
    /// Observes the solver's network on both batches along `tangent`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if a batch or the tangent does not fit.
    pub fn new(
        solver: &Solver,
        tangent: &ParamTree,
        addition: &Batch,
        validation: &Batch,
    ) -> Result<Self, SproutError> {
        Ok(Self {
            train: observe(solver.network(), solver.loss(), tangent, addition)?,
            validation: observe(solver.network(), solver.loss(), tangent, validation)?,
        })
    }
}

struct Refined {
    feature: Feature,
    score: f64,
    acceptance: Option<f64>,
}

fn refine_candidate(
    config: &GrowthConfig,
    site: &SiteCurvature,
    method: RefineMethod,
    initial_step: f64,
    feature: Feature,
    key: Key,
) -> Result<Refined, SproutError> {
    let ctx = ScoreContext::new(site, config.a_damping, site.baseline);
    match method {
        RefineMethod::Ascent => {
            let result = refine_ascent(&ctx, feature, config.steps, initial_step, config.logdet_weight)?;
            Ok(Refined {
                feature: result.feature,
                score: result.score * site.baseline,
                acceptance: None,
            })
        }
        RefineMethod::Mala => {
            let result = refine_mala(
                &ctx,
                feature,
                config.steps,
                config.mala_steps_per_burst,
                initial_step,
                config.temperature,
                key,
            )?;
            let rates = &result.acceptance_rates;
            let acceptance = (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64);
            Ok(Refined {
                feature: result.feature,
                score: result.score,
                acceptance,
            })
        }
    }
}

/// Softmax-weighted mean of `scores` under `logits`; non-finite entries get
/// zero weight.
fn expected_score(logits: &[f64], scores: &[f64]) -> f64 {
    let max = logits
        .iter()
        .copied()
        .filter(|l| l.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return 0.0;
    }
    let mut total = 0.0;
    let mut weighted = 0.0;
    for (l, s) in logits.iter().zip(scores) {
        if l.is_finite() && s.is_finite() {
            let w = (l - max).exp();
            total += w;
            weighted += w * s;
        }
    }
    if total > 0.0 {
        weighted / total
    } else {
        0.0
    }
}

/// Result of refining and selecting at one site, before gating.
struct Selection {
    curvature: SiteCurvature,
    feature: Feature,
    best_raw: f64,
    acceptance: Option<f64>,
}

/// Stateful driver of growth cycles.
#[derive(Debug)]
pub struct GrowthEngine {
    config: GrowthConfig,
    keys: KeyStream,
    cooled_until: HashMap<usize, usize>,
}

impl GrowthEngine {
    /// Creates an engine drawing proposal keys from `keys`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] if `config` is invalid.
    pub fn new(config: GrowthConfig, keys: KeyStream) -> Result<Self, SproutError> {
        config.validate()?;
        Ok(Self {
            config,
            keys,
            cooled_until: HashMap::new(),
        })
    }

    /// Settings.
    pub fn config(&self) -> &GrowthConfig {
        &self.config
    }

    /// True if `site` is cooling down after a rollback at `epoch`.
    pub fn is_cooling(&self, site: usize, epoch: usize) -> bool {
        self.cooled_until.get(&site).is_some_and(|&until| epoch < until)
    }

    /// Runs one growth cycle and commits at most one modification.
    ///
    /// `addition` is the batch candidates are refined on, `validation` the
    /// batch the selected candidate is rescored on, and `full` the training
    /// set whose loss must not regress.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Invariant`] if the solver has not observed a
    /// gradient yet or the state is inconsistent, and
    /// [`SproutError::Regression`] under the abort policy.
    pub fn cycle(
        &mut self,
        solver: &mut Solver,
        addition: &Batch,
        validation: &Batch,
        full: &Batch,
        epoch: usize,
        sink: &mut dyn MetricsSink,
    ) -> Result<Option<GrowthEvent>, SproutError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let ngrad = solver
            .last_ngrad()
            .cloned()
            .ok_or_else(|| SproutError::invariant("growth needs an observed gradient"))?;

        let template = solver.template();
        let sites = 0..template.num_layers().saturating_sub(1);
        let width_sites: Vec<usize> = sites
            .clone()
            .filter(|&i| self.config.allow_width && template.is_width_growable(i))
            .filter(|&i| !self.is_cooling(i, epoch))
            .collect();
        let depth_sites: Vec<usize> = sites
            .filter(|&i| self.config.allow_depth && template.is_depth_growable(i))
            .filter(|&i| !self.is_cooling(i, epoch))
            .collect();
        if width_sites.is_empty() && depth_sites.is_empty() {
            tracing::debug!(epoch, "no growable sites");
            return Ok(None);
        }

        let zero = solver.network().params.zeros_like();
        let plain = Observation::new(solver, &zero, addition, validation)?;
        let fitted = if depth_sites.is_empty() || self.config.pure_kfac {
            None
        } else {
            Some(Observation::new(solver, &ngrad, addition, validation)?)
        };

        let mut best: Option<Modification> = None;
        for &site in &width_sites {
            if let Some(m) = self.consider_width(solver, &plain, site, sink)? {
                if best.as_ref().map_or(true, |b| m.ratio > b.ratio) {
                    best = Some(m);
                }
            }
        }
        for &site in &depth_sites {
            let obs = fitted.as_ref().unwrap_or(&plain);
            if let Some(m) = self.consider_depth(solver, obs, site, sink)? {
                if best.as_ref().map_or(true, |b| m.ratio > b.ratio) {
                    best = Some(m);
                }
            }
        }

        match best {
            Some(m) => self.apply(solver, m, full, epoch, sink).map(Some),
            None => Ok(None),
        }
    }

    /// Proposes, refines and selects candidates for `site`.
    fn select(
        &mut self,
        solver: &Solver,
        obs: &Observation,
        site: usize,
        kind: GrowthKind,
        sink: &mut dyn MetricsSink,
    ) -> Result<Option<Selection>, SproutError> {
        let template = solver.template();
        let net = solver.network();
        let grad = solver
            .last_grad()
            .ok_or_else(|| SproutError::invariant("growth needs an observed gradient"))?;
        let global = solver
            .last_natlen()
            .ok_or_else(|| SproutError::invariant("growth needs an observed baseline"))?;
        let (in_index, out_index) = template.in_out_indices(site)?;
        let kernel_grad = &grad.layers[out_index]
            .as_ref()
            .ok_or_else(|| SproutError::invariant(format!("receiving slot {out_index} has no gradient")))?
            .kernel;

        let curvature = SiteCurvature::prepare(&obs.train, template, site, kernel_grad, self.config.g_damping)?;
        if !(curvature.baseline.is_finite() && curvature.baseline > 0.0) {
            tracing::warn!(site, baseline = curvature.baseline, "skipping site with degenerate baseline");
            return Ok(None);
        }

        let null = net.input_null(in_index)?;
        let input_size = net.input_width(site);
        let (count, outputs, method, step) = match kind {
            GrowthKind::Width => (
                self.config.proposals_per_site,
                1,
                self.config.width_method,
                self.config.initial_step_size,
            ),
            GrowthKind::Depth => (
                self.config.layer_proposals_per_site,
                input_size,
                self.config.depth_method,
                self.config.layer_initial_step_size,
            ),
        };
        let candidates = (0..count)
            .map(|_| new_feature(&null, input_size, outputs, self.keys.next_key()))
            .collect::<Result<Vec<_>, _>>()?;
        let refine_keys: Vec<Key> = (0..count).map(|_| self.keys.next_key()).collect();

        let config = &self.config;
        let refined: Vec<Refined> = candidates
            .into_par_iter()
            .zip(refine_keys)
            .map(|(feature, key)| refine_candidate(config, &curvature, method, step, feature, key))
            .collect::<Result<_, _>>()?;

        let scores: Vec<f64> = refined.iter().map(|r| r.score).collect();
        let logits: Vec<f64> = scores
            .iter()
            .map(|r| r / (self.config.temperature * curvature.baseline))
            .collect();
        let chosen = categorical(self.keys.next_key(), &logits);
        let best_raw = expected_score(&logits, &scores);
        tracing::debug!(site, %kind, ?scores, chosen, "refined candidates");

        let best_ratio = 1.0 + best_raw / global;
        sink.scalar(&format!("local_baseline_{site}"), curvature.baseline);
        sink.scalar(&format!("best_local_ratio_{site}"), best_raw / curvature.baseline);
        sink.scalar(&format!("best_proposal_{site}"), best_ratio);
        sink.scalar(&format!("best_raw_rmetric_{site}"), best_raw);
        sink.scalar(&format!("normed_rmetric_{site}"), best_raw / curvature.loss_sqnorm);
        sink.scalar("normed_baseline", global / curvature.loss_sqnorm);
        sink.scalar("loss_sqnorm", curvature.loss_sqnorm);

        let Some(selected) = refined.into_iter().nth(chosen) else {
            return Err(SproutError::Internal {
                message: format!("selected candidate {chosen} of {count}"),
            });
        };
        if let Some(rate) = selected.acceptance {
            sink.scalar(&format!("acceptance_rate_{site}"), rate);
        }
        Ok(Some(Selection {
            curvature,
            feature: selected.feature,
            best_raw,
            acceptance: selected.acceptance,
        }))
    }

    /// Score of `feature` and the baseline at `site` on the validation
    /// snapshot, both undamped.
    fn validate_candidate(
        &self,
        solver: &Solver,
        obs: &Observation,
        site: usize,
        feature: &Feature,
        sink: &mut dyn MetricsSink,
    ) -> Result<(f64, f64), SproutError> {
        let template = solver.template();
        let (_, out_index) = template.in_out_indices(site)?;
        let kernel_grad = solver
            .last_grad()
            .and_then(|g| g.layers[out_index].as_ref())
            .map(|l| &l.kernel)
            .ok_or_else(|| SproutError::invariant(format!("receiving slot {out_index} has no gradient")))?;
        let curvature = SiteCurvature::prepare(&obs.validation, template, site, kernel_grad, 0.0)?;
        let score = ScoreContext::new(&curvature, self.config.a_damping, 1.0).score(feature)?;
        sink.scalar(&format!("local_validation_baseline_{site}"), curvature.baseline);
        sink.scalar(&format!("best_local_validation_ratio_{site}"), score / curvature.baseline);
        sink.scalar(&format!("best_raw_validation_metric_{site}"), score);
        Ok((score, curvature.baseline))
    }

    /// Evaluates adding one unit to the enabled slot `site`.
    ///
    /// Gate: `r̄/baseline > thresh` and `r̄/E‖dℓ‖² > abs_thresh`.
    ///
    /// # Errors
    ///
    /// Propagates invariant and shape errors from observation, refinement
    /// and embedding.
    pub fn consider_width(
        &mut self,
        solver: &Solver,
        obs: &Observation,
        site: usize,
        sink: &mut dyn MetricsSink,
    ) -> Result<Option<Modification>, SproutError> {
        let Some(sel) = self.select(solver, obs, site, GrowthKind::Width, sink)? else {
            return Ok(None);
        };
        self.validate_candidate(solver, obs, site, &sel.feature, sink)?;

        let local_ratio = sel.best_raw / sel.curvature.baseline;
        let absolute = sel.best_raw / sel.curvature.loss_sqnorm;
        tracing::info!(
            site,
            local_ratio,
            best_raw = sel.best_raw,
            baseline = sel.curvature.baseline,
            "width proposal"
        );
        if !(local_ratio > self.config.thresh && absolute > self.config.abs_thresh) {
            return Ok(None);
        }
        let global = solver.last_natlen().unwrap_or(f64::NAN);
        let (template, network) = embed_feature(solver.template(), solver.network(), &sel.feature, site)?;
        Ok(Some(Modification {
            kind: GrowthKind::Width,
            site,
            ratio: 1.0 + sel.best_raw / global,
            template,
            network,
        }))
    }

    /// Evaluates activating the dormant slot `site`.
    ///
    /// The selected kernel is made invertible before validation. Gate:
    /// `adj/validation_baseline > thresh` and `adj/E‖dℓ‖² > layer_abs_thresh`
    /// with `adj = r̄ / cost`.
    ///
    /// # Errors
    ///
    /// Propagates invariant and shape errors from observation, refinement
    /// and embedding.
    pub fn consider_depth(
        &mut self,
        solver: &Solver,
        obs: &Observation,
        site: usize,
        sink: &mut dyn MetricsSink,
    ) -> Result<Option<Modification>, SproutError> {
        let width = solver.network().input_width(site);
        let capacity = solver.template().capacity(site).unwrap_or(0);
        if width > capacity {
            tracing::warn!(site, width, capacity, "dormant slot too small for its inputs");
            return Ok(None);
        }
        let Some(sel) = self.select(solver, obs, site, GrowthKind::Depth, sink)? else {
            return Ok(None);
        };
        let mut feature = sel.feature;
        feature.kernel = make_invertible(&feature.kernel)?.0;
        let (_, validation_baseline) = self.validate_candidate(solver, obs, site, &feature, sink)?;

        let mut cost = self.config.layer_cost_mul;
        if self.config.size_costing {
            cost *= width as f64;
        }
        let adjusted = sel.best_raw / cost;
        let adjusted_ratio = adjusted / validation_baseline;
        sink.scalar(&format!("adjusted_ratio_{site}"), adjusted_ratio);
        tracing::info!(
            site,
            adjusted_ratio,
            adjusted,
            validation_baseline,
            acceptance = sel.acceptance.unwrap_or(f64::NAN),
            "depth proposal"
        );
        if !(validation_baseline.is_finite() && validation_baseline > 0.0) {
            tracing::warn!(site, validation_baseline, "skipping depth site with degenerate validation baseline");
            return Ok(None);
        }
        if !(adjusted_ratio > self.config.thresh
            && adjusted / sel.curvature.loss_sqnorm > self.config.layer_abs_thresh)
        {
            return Ok(None);
        }
        let global = solver.last_natlen().unwrap_or(f64::NAN);
        let (template, network) = embed_layer(solver.template(), solver.network(), &feature, site)?;
        Ok(Some(Modification {
            kind: GrowthKind::Depth,
            site,
            ratio: 1.0 + adjusted / global,
            template,
            network,
        }))
    }

    /// Commits `m` and checks the full-training-set loss.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Regression`] if the loss ratio exceeds the
    /// tolerance under the abort policy.
    pub fn apply(
        &mut self,
        solver: &mut Solver,
        m: Modification,
        full: &Batch,
        epoch: usize,
        sink: &mut dyn MetricsSink,
    ) -> Result<GrowthEvent, SproutError> {
        let old_template = solver.template().clone();
        let old_network = solver.network().clone();
        let before = solver.train_batch(full, true, sink)?;
        let limit = match m.kind {
            GrowthKind::Width => self.config.width_tolerance,
            GrowthKind::Depth => self.config.depth_tolerance,
        };
        let contents = m.template.summary();

        solver.install(m.template, m.network)?;
        let after = solver.train_batch(full, true, sink)?;

        if after <= before || after / before < limit {
            tracing::info!(
                epoch,
                site = m.site,
                kind = %m.kind,
                ratio = m.ratio,
                before,
                after,
                contents = %contents,
                "committed growth"
            );
            return Ok(GrowthEvent {
                epoch,
                kind: m.kind,
                site: m.site,
                ratio: m.ratio,
                loss_before: before,
                loss_after: after,
                contents: solver.template().contents().to_vec(),
                rolled_back: false,
            });
        }

        let before_state = state_dump(&old_template, &old_network)?;
        let after_state = state_dump(solver.template(), solver.network())?;
        match self.config.on_regression {
            RegressionPolicy::Abort => Err(SproutError::Regression {
                site: m.site,
                before,
                after,
                limit,
                before_state,
                after_state,
            }),
            RegressionPolicy::Rollback => {
                solver.install(old_template, old_network)?;
                solver.train_batch(full, true, sink)?;
                let until = epoch + self.config.rollback_cooldown;
                self.cooled_until.insert(m.site, until);
                tracing::warn!(
                    epoch,
                    site = m.site,
                    kind = %m.kind,
                    before,
                    after,
                    until,
                    %before_state,
                    %after_state,
                    "growth regressed training loss, rolled back"
                );
                Ok(GrowthEvent {
                    epoch,
                    kind: m.kind,
                    site: m.site,
                    ratio: m.ratio,
                    loss_before: before,
                    loss_after: after,
                    contents: solver.template().contents().to_vec(),
                    rolled_back: true,
                })
            }
        }
    }
}

#[derive(Serialize)]
struct StateDump<'a> {
    contents: &'a [Option<usize>],
    network: &'a Network,
}

/// Serialises the template contents and the full network (parameters and
/// null masks) for regression diagnostics.
fn state_dump(template: &ModelTemplate, network: &Network) -> Result<String, SproutError> {
    serde_json::to_string(&StateDump {
        contents: template.contents(),
        network,
    })
    .map_err(|e| SproutError::Internal {
        message: format!("cannot serialise network state: {e}"),
    })
}
