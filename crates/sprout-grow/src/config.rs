//! Experiment configuration.
//!
//! One JSON file describes a run:
//!
//! ```json
//! {
//!   "meta": { "name": "two-moons", "seed": 3 },
//!   "task": { "kind": "classification" },
//!   "net": { "capacities": [16, 16], "contents": [4, null] },
//!   "opt": { "lr": 0.05, "batch_size": 32, "max_epochs": 200 },
//!   "evo": { "thresh": 1.0, "cooldown": 20 },
//!   "checkpointing": { "enable": true, "directory": "checkpoints", "cooldown": 10 }
//! }
//! ```
//!
//! `task` and `net` are required; every other section falls back to its
//! `Default`. The network's output slot is appended from the dataset, so
//! `net` lists hidden slots only.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sprout_core::{ModelTemplate, SproutError};
use sprout_net::{LossFunction, MeanSquared, SoftmaxCrossEntropy};

use crate::growth::GrowthConfig;

/// Run identity and seeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Run name, also the checkpoint file stem.
    pub name: String,
    /// Seed for network initialisation and batch order.
    pub seed: u64,
    /// Seed for growth proposals.
    pub propseed: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            name: "untitled".to_string(),
            seed: 0,
            propseed: 1,
        }
    }
}

/// Task family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Real-valued targets, mean squared error.
    #[default]
    Regression,
    /// Class indices, softmax cross-entropy.
    Classification,
}

impl TaskKind {
    /// Loss function for this task.
    pub fn loss(self) -> Box<dyn LossFunction> {
        match self {
            Self::Regression => Box::new(MeanSquared),
            Self::Classification => Box::new(SoftmaxCrossEntropy),
        }
    }

    /// Lowercase name as written in config files.
    pub fn label(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Classification => "classification",
        }
    }
}

/// Task section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task family.
    pub kind: TaskKind,
}

/// Hidden-slot layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Maximum width per hidden slot.
    pub capacities: Vec<usize>,
    /// Initial width per hidden slot, `null` for dormant.
    pub contents: Vec<Option<usize>>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            capacities: vec![8, 8],
            contents: vec![Some(4), None],
        }
    }
}

impl NetConfig {
    /// Template with an output slot of `output_size` appended.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] if the layout is invalid.
    pub fn template(&self, output_size: usize) -> Result<ModelTemplate, SproutError> {
        ModelTemplate::with_output(self.capacities.clone(), self.contents.clone(), output_size)
    }
}

/// Ordinary optimisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptConfig {
    /// Learning rate (default: 0.05).
    pub lr: f64,
    /// Mini-batch size; `None` trains on the full set each step.
    pub batch_size: Option<usize>,
    /// Number of epochs (default: 100).
    pub max_epochs: usize,
    /// Decoupled weight decay (default: 0).
    pub weight_decay: f64,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            lr: 0.05,
            batch_size: None,
            max_epochs: 100,
            weight_decay: 0.0,
        }
    }
}

/// Checkpoint cadence and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Write checkpoints during training.
    pub enable: bool,
    /// Resume from an existing checkpoint at startup.
    pub restore: bool,
    /// Directory holding `<name>.json`.
    pub directory: PathBuf,
    /// Epochs between checkpoints.
    pub cooldown: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enable: false,
            restore: false,
            directory: PathBuf::from("checkpoints"),
            cooldown: 10,
        }
    }
}

impl CheckpointConfig {
    /// Checkpoint file for a run called `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.json"))
    }
}

/// A complete run description.
///
/// # Example
///
/// ```
/// use sprout_grow::config::{ExperimentConfig, TaskKind};
///
/// let cfg = ExperimentConfig::from_json(r#"{
///     "task": { "kind": "classification" },
///     "net": { "capacities": [4, 2], "contents": [2, null] }
/// }"#).unwrap();
/// assert_eq!(cfg.task.kind, TaskKind::Classification);
/// assert_eq!(cfg.opt.max_epochs, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Run identity and seeds.
    #[serde(default)]
    pub meta: MetaConfig,
    /// Task family.
    pub task: TaskConfig,
    /// Hidden-slot layout.
    pub net: NetConfig,
    /// Ordinary optimisation.
    #[serde(default)]
    pub opt: OptConfig,
    /// Growth engine.
    #[serde(default)]
    pub evo: GrowthConfig,
    /// Checkpointing.
    #[serde(default)]
    pub checkpointing: CheckpointConfig,
}

impl ExperimentConfig {
    /// Parses and validates a config.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] for malformed JSON, a missing `task`
    /// or `net` section, an unknown task kind, or an invalid value.
    pub fn from_json(text: &str) -> Result<Self, SproutError> {
        let cfg: Self = serde_json::from_str(text)
            .map_err(|e| SproutError::config(format!("invalid config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] if the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> Result<Self, SproutError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SproutError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Checks values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<(), SproutError> {
        if self.net.capacities.len() != self.net.contents.len() {
            return Err(SproutError::config(format!(
                "net has {} capacities and {} contents",
                self.net.capacities.len(),
                self.net.contents.len()
            )));
        }
        if self.opt.max_epochs == 0 {
            return Err(SproutError::config("opt.max_epochs must be positive"));
        }
        if self.checkpointing.enable && self.checkpointing.cooldown == 0 {
            return Err(SproutError::config("checkpointing.cooldown must be positive"));
        }
        self.evo.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_sections_fail() {
        assert!(ExperimentConfig::from_json(r#"{ "task": { "kind": "regression" } }"#).is_err());
        assert!(ExperimentConfig::from_json(r#"{ "net": { "capacities": [2], "contents": [1] } }"#).is_err());
    }

    #[test]
    fn unknown_task_kind_fails() {
        let err = ExperimentConfig::from_json(
            r#"{ "task": { "kind": "ranking" }, "net": { "capacities": [2], "contents": [1] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, SproutError::Config { .. }));
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = ExperimentConfig::from_json(
            r#"{
                "meta": { "name": "moons", "seed": 9 },
                "task": { "kind": "regression" },
                "net": { "capacities": [4], "contents": [2] },
                "opt": { "batch_size": 8 },
                "evo": { "thresh": 2.5, "depth_method": "ascent" },
                "checkpointing": { "enable": true, "directory": "/tmp/ck" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.meta.name, "moons");
        assert_eq!(cfg.meta.propseed, 1);
        assert_eq!(cfg.opt.batch_size, Some(8));
        assert_eq!(cfg.opt.lr, 0.05);
        assert_eq!(cfg.evo.thresh, 2.5);
        assert_eq!(cfg.evo.proposals_per_site, 10);
        assert_eq!(cfg.checkpointing.path("moons"), PathBuf::from("/tmp/ck/moons.json"));
        assert_eq!(cfg.net.template(3).unwrap().output_size(), 3);
    }

    #[test]
    fn rejects_bad_values() {
        let mismatched = r#"{ "task": { "kind": "regression" }, "net": { "capacities": [2, 2], "contents": [1] } }"#;
        assert!(ExperimentConfig::from_json(mismatched).is_err());
        let cold = r#"{ "task": { "kind": "regression" }, "net": { "capacities": [2], "contents": [1] },
                        "evo": { "temperature": 0.0 } }"#;
        assert!(ExperimentConfig::from_json(cold).is_err());
        let growing = r#"{ "task": { "kind": "regression" }, "net": { "capacities": [2], "contents": [3] } }"#;
        let cfg = ExperimentConfig::from_json(growing).unwrap();
        assert!(cfg.net.template(1).is_err());
    }
}
