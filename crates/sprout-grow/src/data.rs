//! Datasets and batches.
//!
//! Datasets are read from a JSON file holding a training and a test split:
//!
//! ```json
//! {
//!   "train": { "inputs": [[0.1, 0.2], [0.3, 0.4]], "classes": [0, 1] },
//!   "test":  { "inputs": [[0.5, 0.6]], "classes": [1] }
//! }
//! ```
//!
//! A split carries either `classes` (classification) or `targets`
//! (regression rows), never both.

use std::path::Path;

use serde::Deserialize;
use sprout_core::SproutError;
use sprout_net::{linalg::Mat, Labels};

/// Inputs and labels for a set of items.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `N × input_size` inputs.
    pub inputs: Mat,
    /// One label per input row.
    pub labels: Labels,
}

impl Batch {
    /// Pairs inputs with labels.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if the row counts differ.
    pub fn new(inputs: Mat, labels: Labels) -> Result<Self, SproutError> {
        if inputs.nrows() != labels.len() {
            return Err(SproutError::shape(format!(
                "{} input rows for {} labels",
                inputs.nrows(),
                labels.len()
            )));
        }
        Ok(Self { inputs, labels })
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    /// True if the batch holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of one input row.
    pub fn input_size(&self) -> usize {
        self.inputs.ncols()
    }

    /// The given rows, in order.
    pub fn select(&self, rows: &[usize]) -> Batch {
        Batch {
            inputs: self.inputs.select_rows(rows),
            labels: self.labels.select(rows),
        }
    }
}

/// A training split and a held-out test split.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Training items.
    pub train: Batch,
    /// Test items.
    pub test: Batch,
}

#[derive(Deserialize)]
struct SplitFile {
    inputs: Vec<Vec<f64>>,
    #[serde(default)]
    classes: Option<Vec<usize>>,
    #[serde(default)]
    targets: Option<Vec<Vec<f64>>>,
}

#[derive(Deserialize)]
struct DatasetFile {
    train: SplitFile,
    test: SplitFile,
}

fn dataset_error(message: impl Into<String>) -> SproutError {
    SproutError::Dataset {
        message: message.into(),
    }
}

fn rows_to_mat(rows: &[Vec<f64>], what: &str) -> Result<Mat, SproutError> {
    let width = rows.first().map_or(0, Vec::len);
    if width == 0 {
        return Err(dataset_error(format!("{what} are empty")));
    }
    if let Some(bad) = rows.iter().position(|r| r.len() != width) {
        return Err(dataset_error(format!(
            "{what} row {bad} has {} values, expected {width}",
            rows[bad].len()
        )));
    }
    Ok(Mat::from_fn(rows.len(), width, |i, j| rows[i][j]))
}

impl SplitFile {
    fn into_batch(self, name: &str) -> Result<Batch, SproutError> {
        let inputs = rows_to_mat(&self.inputs, &format!("{name} inputs"))?;
        let labels = match (self.classes, self.targets) {
            (Some(classes), None) => Labels::Classes(classes),
            (None, Some(targets)) => {
                Labels::Targets(rows_to_mat(&targets, &format!("{name} targets"))?)
            }
            _ => {
                return Err(dataset_error(format!(
                    "{name} split needs exactly one of `classes` or `targets`"
                )))
            }
        };
        Batch::new(inputs, labels).map_err(|e| dataset_error(format!("{name}: {e}")))
    }
}

impl Dataset {
    /// Parses a dataset from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Dataset`] on malformed JSON, ragged rows,
    /// mismatched label counts, or splits of different kinds or widths.
    pub fn from_json(text: &str) -> Result<Self, SproutError> {
        let file: DatasetFile =
            serde_json::from_str(text).map_err(|e| dataset_error(format!("invalid dataset: {e}")))?;
        let train = file.train.into_batch("train")?;
        let test = file.test.into_batch("test")?;
        if train.input_size() != test.input_size() {
            return Err(dataset_error(format!(
                "train inputs have width {}, test inputs {}",
                train.input_size(),
                test.input_size()
            )));
        }
        match (&train.labels, &test.labels) {
            (Labels::Classes(_), Labels::Classes(_)) => {}
            (Labels::Targets(a), Labels::Targets(b)) if a.ncols() == b.ncols() => {}
            _ => return Err(dataset_error("train and test labels disagree in kind or width")),
        }
        Ok(Self { train, test })
    }

    /// Reads a dataset file.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Dataset`] if the file cannot be read or decoded.
    pub fn from_file(path: &Path) -> Result<Self, SproutError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| dataset_error(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Width of one input row.
    pub fn input_size(&self) -> usize {
        self.train.input_size()
    }

    /// True for class-index labels.
    pub fn is_classification(&self) -> bool {
        matches!(self.train.labels, Labels::Classes(_))
    }

    /// Network output width the labels call for: one logit per class seen
    /// in either split, or the number of target columns.
    pub fn output_size(&self) -> usize {
        match (&self.train.labels, &self.test.labels) {
            (Labels::Classes(a), Labels::Classes(b)) => {
                a.iter().chain(b).max().map_or(1, |&m| m + 1)
            }
            (Labels::Targets(t), _) => t.ncols(),
            (Labels::Classes(a), Labels::Targets(_)) => a.iter().max().map_or(1, |&m| m + 1),
        }
    }
}
