//! Task losses.
//!
//! A [`LossFunction`] scores a batch of outputs against [`Labels`] and
//! returns per-item losses together with the per-item output gradients the
//! curvature estimator needs.

use serde::{Deserialize, Serialize};
use sprout_core::SproutError;

use crate::linalg::Mat;

/// Batch labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Labels {
    /// Class indices, one per datum.
    Classes(Vec<usize>),
    /// Regression targets, `N × out`.
    Targets(Mat),
}

impl Labels {
    /// Number of labelled items.
    pub fn len(&self) -> usize {
        match self {
            Labels::Classes(c) => c.len(),
            Labels::Targets(t) => t.nrows(),
        }
    }

    /// True if there are no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels of the given rows, in order.
    pub fn select(&self, rows: &[usize]) -> Labels {
        match self {
            Labels::Classes(c) => Labels::Classes(rows.iter().map(|&i| c[i]).collect()),
            Labels::Targets(t) => Labels::Targets(t.select_rows(rows)),
        }
    }
}

/// Per-item loss and output gradient for one task family.
pub trait LossFunction: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Per-item losses and per-item gradients `dℓ_i/do_i` (`N × out`).
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Shape`] if labels and outputs disagree.
    fn evaluate(&self, output: &Mat, labels: &Labels) -> Result<(Vec<f64>, Mat), SproutError>;

    /// Mean loss over the batch.
    ///
    /// # Errors
    ///
    /// Same as [`LossFunction::evaluate`].
    fn mean_loss(&self, output: &Mat, labels: &Labels) -> Result<f64, SproutError> {
        let (losses, _) = self.evaluate(output, labels)?;
        Ok(losses.iter().sum::<f64>() / losses.len().max(1) as f64)
    }
}

fn check_rows(output: &Mat, labels: &Labels) -> Result<(), SproutError> {
    if output.nrows() != labels.len() {
        return Err(SproutError::shape(format!(
            "{} outputs for {} labels",
            output.nrows(),
            labels.len()
        )));
    }
    Ok(())
}

/// Mean squared error over output units: `mean_j (o_j - y_j)²`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquared;

impl LossFunction for MeanSquared {
    fn name(&self) -> &'static str {
        "mean_squared"
    }

    fn evaluate(&self, output: &Mat, labels: &Labels) -> Result<(Vec<f64>, Mat), SproutError> {
        check_rows(output, labels)?;
        let Labels::Targets(targets) = labels else {
            return Err(SproutError::shape("regression needs target vectors"));
        };
        if targets.shape() != output.shape() {
            return Err(SproutError::shape(format!(
                "targets {:?} vs outputs {:?}",
                targets.shape(),
                output.shape()
            )));
        }
        let m = output.ncols().max(1) as f64;
        let diff = output - targets;
        let losses = diff.row_iter().map(|r| r.norm_squared() / m).collect();
        Ok((losses, diff * (2.0 / m)))
    }
}

/// Softmax cross-entropy: `logsumexp(o) - o[label]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftmaxCrossEntropy;

impl LossFunction for SoftmaxCrossEntropy {
    fn name(&self) -> &'static str {
        "softmax_cross_entropy"
    }

    fn evaluate(&self, output: &Mat, labels: &Labels) -> Result<(Vec<f64>, Mat), SproutError> {
        check_rows(output, labels)?;
        let Labels::Classes(classes) = labels else {
            return Err(SproutError::shape("classification needs class indices"));
        };
        let k = output.ncols();
        let mut losses = Vec::with_capacity(classes.len());
        let mut grads = Mat::zeros(output.nrows(), k);
        for (i, &label) in classes.iter().enumerate() {
            if label >= k {
                return Err(SproutError::shape(format!(
                    "class {label} out of range for {k} outputs"
                )));
            }
            let row = output.row(i);
            let max = row.max();
            let sum: f64 = row.iter().map(|o| (o - max).exp()).sum();
            let lse = max + sum.ln();
            losses.push(lse - row[label]);
            for j in 0..k {
                grads[(i, j)] = (row[j] - lse).exp();
            }
            grads[(i, label)] -= 1.0;
        }
        Ok((losses, grads))
    }
}

/// Index of the largest entry of each row.
pub fn argmax_rows(m: &Mat) -> Vec<usize> {
    m.row_iter()
        .map(|r| {
            r.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (j, &v)| if v > best.1 { (j, v) } else { best })
                .0
        })
        .collect()
}

/// Fraction of rows whose argmax matches the label (class index, or the
/// argmax of a target row).
///
/// # Errors
///
/// Returns [`SproutError::Shape`] on a row-count mismatch.
pub fn accuracy(output: &Mat, labels: &Labels) -> Result<f64, SproutError> {
    check_rows(output, labels)?;
    let predicted = argmax_rows(output);
    let truth = match labels {
        Labels::Classes(c) => c.clone(),
        Labels::Targets(t) => argmax_rows(t),
    };
    let correct = predicted.iter().zip(&truth).filter(|(p, t)| p == t).count();
    Ok(correct as f64 / predicted.len().max(1) as f64)
}
