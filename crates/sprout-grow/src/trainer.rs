//! Epoch loop.
//!
//! Per epoch:
//! 1. Train on every mini-batch of a fresh permutation
//! 2. Held-out loss (and accuracy for classification), training accuracy
//! 3. Observe the full training set, refreshing the gradient growth reads
//! 4. Check the template/network invariants
//! 5. Every `evo.cooldown` epochs, and on the first and last epoch, run a
//!    growth cycle
//! 6. Every `checkpointing.cooldown` epochs, save a checkpoint

use serde::{Deserialize, Serialize};
use sprout_core::{Key, KeyStream, MetricsSink, ModelTemplate, SproutError};
use sprout_net::Network;

use crate::checkpoint::TrainState;
use crate::config::{ExperimentConfig, TaskKind};
use crate::data::{Batch, Dataset};
use crate::growth::{GrowthEngine, GrowthEvent};
use crate::proposer::verify_state;
use crate::sampler::Sampler;
use crate::solver::{SimpleGradient, Solver};

/// What a run did to the architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    /// Epochs executed in this run.
    pub epochs_run: usize,
    /// Contents before the first epoch.
    pub initial_contents: Vec<Option<usize>>,
    /// Contents after the last epoch.
    pub final_contents: Vec<Option<usize>>,
    /// Parameter count before the first epoch.
    pub initial_params: usize,
    /// Parameter count after the last epoch.
    pub final_params: usize,
    /// Growth events in order.
    pub events: Vec<GrowthEvent>,
    /// Full-training-set loss at the end.
    pub final_train_loss: f64,
    /// Test loss at the end.
    pub final_test_loss: f64,
}

/// One line per slot: `Layer i: n neurons` or `Layer i: Not active`.
pub fn architecture_report(template: &ModelTemplate) -> String {
    template
        .contents()
        .iter()
        .enumerate()
        .map(|(i, c)| match c {
            Some(n) => format!("Layer {i}: {n} neurons"),
            None => format!("Layer {i}: Not active"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drives training and growth for one experiment.
#[derive(Debug)]
pub struct Trainer {
    config: ExperimentConfig,
    solver: Solver,
    engine: GrowthEngine,
    sampler: Sampler,
    test: Batch,
    addition: Batch,
    start_epoch: usize,
}

impl Trainer {
    /// Builds the network (or restores it from a checkpoint), the solver,
    /// the sampler and the growth engine.
    ///
    /// The addition batch is the first batch the sampler yields; the
    /// validation batch is the full training set.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] if the task kind does not match the
    /// dataset labels or the layout is invalid, and
    /// [`SproutError::Checkpoint`] if a restored checkpoint does not fit.
    pub fn new(config: ExperimentConfig, dataset: Dataset) -> Result<Self, SproutError> {
        config.validate()?;
        let classification = config.task.kind == TaskKind::Classification;
        if classification != dataset.is_classification() {
            return Err(SproutError::config(format!(
                "task kind `{}` does not match the dataset labels",
                config.task.kind.label()
            )));
        }

        let mut template = config.net.template(dataset.output_size())?;
        let mut network = Network::init(&template, dataset.input_size(), Key::new(config.meta.seed))?;
        let mut start_epoch = 0;
        let path = config.checkpointing.path(&config.meta.name);
        if config.checkpointing.restore && path.exists() {
            let state = TrainState::load(&path)?;
            let (restored_template, restored_network) = state.restore(&template)?;
            if restored_network.input_size() != dataset.input_size() {
                return Err(SproutError::Checkpoint {
                    message: format!(
                        "checkpoint expects {} inputs, dataset has {}",
                        restored_network.input_size(),
                        dataset.input_size()
                    ),
                });
            }
            tracing::info!(path = %path.display(), epoch = state.epoch, "restored checkpoint");
            template = restored_template;
            network = restored_network;
            start_epoch = state.epoch;
        }

        let solver = Solver::new(
            template,
            network,
            config.task.kind.loss(),
            Box::new(SimpleGradient),
            &config.opt,
        )?;
        let batch_keys = KeyStream::new(Key::new(config.meta.seed).fold_in(1).bits());
        let mut sampler = Sampler::new(dataset.train, config.opt.batch_size, batch_keys)?;
        let addition = sampler
            .batches()
            .next()
            .ok_or_else(|| SproutError::config("training set yields no batches"))?;
        let engine = GrowthEngine::new(config.evo.clone(), KeyStream::new(config.meta.propseed))?;

        Ok(Self {
            config,
            solver,
            engine,
            sampler,
            test: dataset.test,
            addition,
            start_epoch,
        })
    }

    /// The solver holding the live architecture.
    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    /// First epoch [`Trainer::run`] executes.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Runs the remaining epochs.
    ///
    /// # Errors
    ///
    /// Propagates invariant, regression and checkpoint errors; any of them
    /// ends the run.
    pub fn run(&mut self, sink: &mut dyn MetricsSink) -> Result<TrainSummary, SproutError> {
        let max_epochs = self.config.opt.max_epochs;
        let classification = self.config.task.kind == TaskKind::Classification;
        let initial_contents = self.solver.template().contents().to_vec();
        let initial_params = self.solver.network().param_count();
        tracing::info!(
            contents = %self.solver.template().summary(),
            params = initial_params,
            "initial architecture"
        );

        let mut events = Vec::new();
        let num_batches = self.sampler.num_batches();
        for epoch in self.start_epoch..max_epochs {
            let is_final = epoch + 1 == max_epochs || epoch == 0;

            for (b, batch) in self.sampler.batches().enumerate() {
                sink.set_step((b + num_batches * epoch) as u64);
                self.solver.train_batch(&batch, false, sink)?;
            }

            self.solver.test_batch(&self.test, sink)?;
            if classification {
                self.solver.test_acc(&self.test, sink)?;
                self.solver.train_acc(self.sampler.data(), sink)?;
            }
            self.solver.train_batch(self.sampler.data(), true, sink)?;
            verify_state(self.solver.template(), self.solver.network())?;

            if epoch % self.config.evo.cooldown == 0 || is_final {
                let full = self.sampler.data();
                if let Some(event) =
                    self.engine
                        .cycle(&mut self.solver, &self.addition, full, full, epoch, sink)?
                {
                    events.push(event);
                }
            }

            let ckpt = &self.config.checkpointing;
            if ckpt.enable && epoch % ckpt.cooldown == 0 {
                TrainState {
                    epoch: epoch + 1,
                    contents: self.solver.template().contents().to_vec(),
                    network: self.solver.network().clone(),
                }
                .save(&ckpt.path(&self.config.meta.name))?;
            }
        }

        let summary = TrainSummary {
            epochs_run: max_epochs.saturating_sub(self.start_epoch),
            initial_contents,
            final_contents: self.solver.template().contents().to_vec(),
            initial_params,
            final_params: self.solver.network().param_count(),
            events,
            final_train_loss: self.solver.batch_loss(self.sampler.data())?,
            final_test_loss: self.solver.batch_loss(&self.test)?,
        };
        tracing::info!(
            contents = %self.solver.template().summary(),
            params = summary.final_params,
            growth_events = summary.events.len(),
            "final architecture"
        );
        self.start_epoch = max_epochs;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_every_slot() {
        let t = ModelTemplate::with_output(vec![4, 4], vec![Some(3), None], 2).unwrap();
        assert_eq!(
            architecture_report(&t),
            "Layer 0: 3 neurons\nLayer 1: Not active\nLayer 2: 2 neurons"
        );
    }

    #[test]
    fn rejects_task_dataset_mismatch() {
        let data = Dataset::from_json(
            r#"{ "train": { "inputs": [[0.0], [1.0]], "classes": [0, 1] },
                 "test":  { "inputs": [[0.5]], "classes": [1] } }"#,
        )
        .unwrap();
        let config = ExperimentConfig::default();
        assert!(matches!(Trainer::new(config, data), Err(SproutError::Config { .. })));
    }
}
