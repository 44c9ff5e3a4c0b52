//! Splittable, counter-based pseudo-random keys.
//!
//! A [`Key`] is a 64-bit value that can be split into independent children
//! or turned into a seeded [`ChaCha8Rng`]. A [`KeyStream`] hands out keys
//! from a root by draw count, so the `n`-th draw of a stream depends only
//! on the seed and `n`. Randomness is threaded explicitly; nothing in the
//! workspace touches a global generator.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// splitmix64 finaliser.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// An immutable random key.
///
/// # Example
///
/// ```
/// use sprout_core::Key;
///
/// let key = Key::new(7);
/// let kids = key.split(3);
/// assert_eq!(kids, Key::new(7).split(3));
/// assert_ne!(kids[0], kids[1]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key(u64);

impl Key {
    /// Creates a key from a seed.
    pub fn new(seed: u64) -> Self {
        Self(mix(seed))
    }

    /// Raw key bits.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Derives a child key from this key and a tag.
    pub fn fold_in(self, data: u64) -> Self {
        Self(mix(self.0 ^ mix(data.wrapping_add(1))))
    }

    /// Splits into `n` independent child keys.
    pub fn split(self, n: usize) -> Vec<Key> {
        (0..n as u64).map(|i| self.fold_in(i)).collect()
    }

    /// A generator seeded from this key.
    pub fn rng(self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.0)
    }
}

/// Counter-based stream of keys.
///
/// The `n`-th key is `root.fold_in(n)`; cloning a stream or restoring it
/// from `(seed, drawn)` reproduces every later draw.
///
/// # Example
///
/// ```
/// use sprout_core::KeyStream;
///
/// let mut a = KeyStream::new(42);
/// let first = a.next_key();
/// let mut b = KeyStream::resume(42, 1);
/// assert_eq!(a.next_key(), b.next_key());
/// assert_ne!(first, a.next_key());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStream {
    seed: u64,
    drawn: u64,
}

impl KeyStream {
    /// Starts a fresh stream.
    pub fn new(seed: u64) -> Self {
        Self { seed, drawn: 0 }
    }

    /// Resumes a stream after `drawn` draws.
    pub fn resume(seed: u64, drawn: u64) -> Self {
        Self { seed, drawn }
    }

    /// Number of keys drawn so far.
    pub fn drawn(&self) -> u64 {
        self.drawn
    }

    /// Draws the next key.
    pub fn next_key(&mut self) -> Key {
        let key = Key::new(self.seed).fold_in(self.drawn);
        self.drawn += 1;
        key
    }
}

impl Iterator for KeyStream {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        Some(self.next_key())
    }
}

/// Draws `n` standard normal samples.
pub fn normal_vec(rng: &mut impl Rng, n: usize) -> Vec<f64> {
    (0..n)
        .map(|_| {
            let x: f64 = StandardNormal.sample(rng);
            x
        })
        .collect()
}

/// Gumbel-max draw from a categorical distribution given by `logits`.
///
/// Non-finite logits never win unless every logit is non-finite, in which
/// case index 0 is returned.
pub fn categorical(key: Key, logits: &[f64]) -> usize {
    let mut rng = key.rng();
    let mut best = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (i, &logit) in logits.iter().enumerate() {
        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        let gumbel = -(-u.ln()).ln();
        let val = logit + gumbel;
        if val.is_finite() && val > best_val {
            best_val = val;
            best = i;
        }
    }
    best
}

/// Uniform random permutation of `0..n` (Fisher-Yates).
pub fn permutation(key: Key, n: usize) -> Vec<usize> {
    let mut rng = key.rng();
    let mut idx: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = rng.gen_range(0..=i);
        idx.swap(i, j);
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_is_reproducible_from_count() {
        let mut s = KeyStream::new(9);
        let keys: Vec<Key> = s.by_ref().take(5).collect();
        assert_eq!(s.drawn(), 5);
        let mut r = KeyStream::resume(9, 3);
        assert_eq!(r.next_key(), keys[3]);
        assert_eq!(r.next_key(), keys[4]);
    }

    #[test]
    fn split_children_are_distinct() {
        let kids = Key::new(1).split(64);
        let mut bits: Vec<u64> = kids.iter().map(|k| k.bits()).collect();
        bits.sort_unstable();
        bits.dedup();
        assert_eq!(bits.len(), 64);
    }

    #[test]
    fn permutation_covers_every_index() {
        let mut p = permutation(Key::new(3), 50);
        p.sort_unstable();
        assert_eq!(p, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn categorical_prefers_dominant_logit() {
        let logits = [0.0, 50.0, 0.0];
        for k in Key::new(5).split(20) {
            assert_eq!(categorical(k, &logits), 1);
        }
    }

    #[test]
    fn categorical_ignores_nan() {
        let logits = [f64::NAN, 0.0];
        for k in Key::new(6).split(10) {
            assert_eq!(categorical(k, &logits), 1);
        }
    }

    #[test]
    fn normal_samples_have_unit_scale() {
        let xs = normal_vec(&mut Key::new(11).rng(), 4000);
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var - 1.0).abs() < 0.15, "var {var}");
    }
}
