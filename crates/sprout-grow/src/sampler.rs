//! Mini-batch sampling.
//!
//! Each call to [`Sampler::batches`] draws one key from the stream and walks
//! a fresh permutation of the training set in `floor(N / batch_size)`
//! batches. Trailing items that do not fill a batch are skipped for that
//! epoch. Without a batch size the whole set is one batch, in order.

use sprout_core::{keys::permutation, KeyStream, SproutError};

use crate::data::Batch;

/// Per-epoch permuted mini-batch source.
#[derive(Debug, Clone)]
pub struct Sampler {
    keys: KeyStream,
    data: Batch,
    batch_size: Option<usize>,
}

impl Sampler {
    /// Creates a sampler over `data`.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Config`] if `batch_size` is zero or larger
    /// than the dataset.
    pub fn new(data: Batch, batch_size: Option<usize>, keys: KeyStream) -> Result<Self, SproutError> {
        if let Some(b) = batch_size {
            if b == 0 || b > data.len() {
                return Err(SproutError::config(format!(
                    "batch size {b} must be in 1..={}",
                    data.len()
                )));
            }
        }
        Ok(Self {
            keys,
            data,
            batch_size,
        })
    }

    /// Batches yielded per epoch.
    pub fn num_batches(&self) -> usize {
        match self.batch_size {
            Some(b) => self.data.len() / b,
            None => 1,
        }
    }

    /// The full training set.
    pub fn data(&self) -> &Batch {
        &self.data
    }

    /// One epoch of batches.
    pub fn batches(&mut self) -> Batches<'_> {
        let n = self.data.len();
        let (order, size) = match self.batch_size {
            Some(b) => (permutation(self.keys.next_key(), n), b),
            None => ((0..n).collect(), n),
        };
        Batches {
            data: &self.data,
            order,
            size,
            next: 0,
        }
    }
}

/// Iterator over one epoch of batches.
#[derive(Debug)]
pub struct Batches<'a> {
    data: &'a Batch,
    order: Vec<usize>,
    size: usize,
    next: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let end = self.next + self.size;
        if self.size == 0 || end > self.order.len() {
            return None;
        }
        let batch = self.data.select(&self.order[self.next..end]);
        self.next = end;
        Some(batch)
    }
}
