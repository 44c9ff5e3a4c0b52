//! Ordinary parameter training.
//!
//! The [`Solver`] owns the live architecture: the template, the network, the
//! task loss and an [`Optimizer`] that turns raw gradients into update
//! directions. Growth reads its last gradient and direction, and installs a
//! grown template/network pair through [`Solver::install`].
//!
//! ## Update Rule
//!
//! Per batch:
//! 1. Mean loss and raw mean gradient `∇` by one trace + backward pass
//! 2. Direction `t = optimizer(∇)`
//! 3. Baseline `⟨t, ∇⟩` (the loss decrease the current architecture can buy)
//! 4. Unless observing only: `θ ← θ − lr·(t + wd·θ)/(1 + wd)`

use sprout_core::{MetricsSink, ModelTemplate, SproutError};
use sprout_net::loss::accuracy;
use sprout_net::{LossFunction, Network, ParamTree};

use crate::config::OptConfig;
use crate::data::Batch;
use crate::proposer::verify_state;

/// Maps a raw gradient to an update direction.
pub trait Optimizer: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Update direction for the raw mean gradient `grad`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if `grad` does not match state the
    /// optimizer keeps between calls.
    fn direction(&mut self, grad: &ParamTree) -> Result<ParamTree, SproutError>;

    /// Drops per-parameter state after the architecture changed.
    fn reset(&mut self) {}
}

/// Plain gradient descent: the direction is the gradient itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleGradient;

impl Optimizer for SimpleGradient {
    fn name(&self) -> &'static str {
        "simple_gradient"
    }

    fn direction(&mut self, grad: &ParamTree) -> Result<ParamTree, SproutError> {
        Ok(grad.clone())
    }
}

/// Owner of the live architecture and its ordinary training.
pub struct Solver {
    template: ModelTemplate,
    network: Network,
    loss: Box<dyn LossFunction>,
    optimizer: Box<dyn Optimizer>,
    lr: f64,
    weight_decay: f64,
    last_grad: Option<ParamTree>,
    last_ngrad: Option<ParamTree>,
    last_natlen: Option<f64>,
}

impl std::fmt::Debug for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Solver")
            .field("template", &self.template.summary())
            .field("loss", &self.loss.name())
            .field("optimizer", &self.optimizer.name())
            .field("lr", &self.lr)
            .field("weight_decay", &self.weight_decay)
            .finish()
    }
}

impl Solver {
    /// Creates a solver after checking the network against the template.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Invariant`] if template and network disagree,
    /// or [`SproutError::Config`] for a non-positive learning rate or a
    /// negative weight decay.
    pub fn new(
        template: ModelTemplate,
        network: Network,
        loss: Box<dyn LossFunction>,
        optimizer: Box<dyn Optimizer>,
        config: &OptConfig,
    ) -> Result<Self, SproutError> {
        if !(config.lr.is_finite() && config.lr > 0.0) {
            return Err(SproutError::config(format!("learning rate {} must be positive", config.lr)));
        }
        if !(config.weight_decay.is_finite() && config.weight_decay >= 0.0) {
            return Err(SproutError::config(format!(
                "weight decay {} must be non-negative",
                config.weight_decay
            )));
        }
        verify_state(&template, &network)?;
        Ok(Self {
            template,
            network,
            loss,
            optimizer,
            lr: config.lr,
            weight_decay: config.weight_decay,
            last_grad: None,
            last_ngrad: None,
            last_natlen: None,
        })
    }

    /// Current architecture.
    pub fn template(&self) -> &ModelTemplate {
        &self.template
    }

    /// Current network.
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Task loss.
    pub fn loss(&self) -> &dyn LossFunction {
        self.loss.as_ref()
    }

    /// Raw mean gradient of the last [`Solver::train_batch`].
    pub fn last_grad(&self) -> Option<&ParamTree> {
        self.last_grad.as_ref()
    }

    /// Optimizer direction of the last [`Solver::train_batch`].
    pub fn last_ngrad(&self) -> Option<&ParamTree> {
        self.last_ngrad.as_ref()
    }

    /// `⟨direction, gradient⟩` of the last [`Solver::train_batch`].
    pub fn last_natlen(&self) -> Option<f64> {
        self.last_natlen
    }

    /// Replaces the architecture, e.g. after growth or a rollback.
    ///
    /// Optimizer state and the recorded gradients are dropped, since their
    /// shapes belong to the old network.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Invariant`] if template and network disagree.
    pub fn install(&mut self, template: ModelTemplate, network: Network) -> Result<(), SproutError> {
        verify_state(&template, &network)?;
        self.template = template;
        self.network = network;
        self.optimizer.reset();
        self.last_grad = None;
        self.last_ngrad = None;
        self.last_natlen = None;
        Ok(())
    }

    /// Mean loss and raw mean parameter gradient on `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the batch does not fit the network.
    pub fn gradient(&self, batch: &Batch) -> Result<(f64, ParamTree), SproutError> {
        let trace = self.network.trace(&batch.inputs)?;
        let (losses, dloss) = self.loss.evaluate(&trace.output, &batch.labels)?;
        let n = losses.len().max(1) as f64;
        let grads = self.network.backward(&trace, &(dloss / n))?;
        Ok((losses.iter().sum::<f64>() / n, grads.params))
    }

    /// One training step (or just an observation) on `batch`; returns the
    /// mean loss before the update.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the batch does not fit the network.
    pub fn train_batch(
        &mut self,
        batch: &Batch,
        observe_only: bool,
        sink: &mut dyn MetricsSink,
    ) -> Result<f64, SproutError> {
        let (loss, grad) = self.gradient(batch)?;
        let ngrad = self.optimizer.direction(&grad)?;
        let natlen = ngrad.dot(&grad)?;

        sink.scalar("loss", loss);
        sink.scalar("features", self.template.total_features() as f64);
        for (i, content) in self.template.contents().iter().enumerate() {
            if let Some(c) = content {
                sink.scalar(&format!("features_{i}"), *c as f64);
            }
        }
        sink.scalar("baseline", natlen);
        sink.scalar("normed_baseline", natlen / loss);
        sink.scalar("param_l2norm", self.network.params.sqnorm().sqrt());

        if !observe_only {
            let (lr, wd) = (self.lr, self.weight_decay);
            self.network.params = self
                .network
                .params
                .tree_zip_map(&ngrad, |p, t| p - (t + p * wd) * (lr / (1.0 + wd)))?;
        }
        self.last_grad = Some(grad);
        self.last_ngrad = Some(ngrad);
        self.last_natlen = Some(natlen);
        Ok(loss)
    }

    /// Mean loss on `batch` without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the batch does not fit the network.
    pub fn batch_loss(&self, batch: &Batch) -> Result<f64, SproutError> {
        let output = self.network.forward(&batch.inputs)?;
        self.loss.mean_loss(&output, &batch.labels)
    }

    /// Argmax accuracy on `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the batch does not fit the network.
    pub fn batch_acc(&self, batch: &Batch) -> Result<f64, SproutError> {
        let output = self.network.forward(&batch.inputs)?;
        accuracy(&output, &batch.labels)
    }

    /// Held-out loss, emitted as `validation_loss`.
    ///
    /// # Errors
    ///
    /// Same as [`Solver::batch_loss`].
    pub fn test_batch(&self, batch: &Batch, sink: &mut dyn MetricsSink) -> Result<f64, SproutError> {
        let loss = self.batch_loss(batch)?;
        sink.scalar("validation_loss", loss);
        Ok(loss)
    }

    /// Held-out accuracy, emitted as `validation_accuracy`.
    ///
    /// # Errors
    ///
    /// Same as [`Solver::batch_acc`].
    pub fn test_acc(&self, batch: &Batch, sink: &mut dyn MetricsSink) -> Result<f64, SproutError> {
        let acc = self.batch_acc(batch)?;
        sink.scalar("validation_accuracy", acc);
        Ok(acc)
    }

    /// Training accuracy, emitted as `training_accuracy`.
    ///
    /// # Errors
    ///
    /// Same as [`Solver::batch_acc`].
    pub fn train_acc(&self, batch: &Batch, sink: &mut dyn MetricsSink) -> Result<f64, SproutError> {
        let acc = self.batch_acc(batch)?;
        sink.scalar("training_accuracy", acc);
        Ok(acc)
    }
}
