//! Temperature and top-k sampling over logits.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::matrix::{softmax_in_place, top_k_indices};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sampler {
    pub temperature: f64,
    /// Keep only the `k` largest logits; `None` keeps all.
    pub top_k: Option<usize>,
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
        }
    }
}

impl Sampler {
    pub fn new(temperature: f64, top_k: Option<usize>) -> Result<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(CoreError::InvalidTemperature(temperature));
        }
        if top_k == Some(0) {
            return Err(CoreError::InvalidK { k: 0, max: usize::MAX });
        }
        Ok(Self { temperature, top_k })
    }

    /// `softmax(logits / T)`, restricted to the top-k logits when set.
    ///
    /// Excluded entries are exactly 0; the rest sum to 1. Logits are shifted
    /// by their kept maximum before dividing by `T`, so every scaled value is
    /// `<= 0` and a tiny `T` collapses onto the argmax instead of overflowing.
    pub fn probabilities(&self, logits: &[f64]) -> Result<Vec<f64>> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(CoreError::InvalidTemperature(self.temperature));
        }
        if logits.is_empty() {
            return Err(CoreError::EmptySequence);
        }
        if let Some(&bad) = logits.iter().find(|l| l.is_nan() || **l == f64::INFINITY) {
            return Err(CoreError::InvalidValue {
                field: "logit".to_string(),
                value: bad,
            });
        }

        let mut keep = vec![true; logits.len()];
        if let Some(k) = self.top_k {
            if k == 0 || k > logits.len() {
                return Err(CoreError::InvalidK { k, max: logits.len() });
            }
            keep = vec![false; logits.len()];
            for i in top_k_indices(logits, k) {
                keep[i] = true;
            }
        }

        let max = logits
            .iter()
            .zip(&keep)
            .filter(|&(_, &kept)| kept)
            .fold(f64::NEG_INFINITY, |m, (&l, _)| m.max(l));
        if max == f64::NEG_INFINITY {
            return Err(CoreError::InvalidValue {
                field: "logit".to_string(),
                value: max,
            });
        }

        let mut scaled: Vec<f64> = logits
            .iter()
            .zip(&keep)
            .map(|(&l, &kept)| if kept { (l - max) / self.temperature } else { f64::NEG_INFINITY })
            .collect();
        softmax_in_place(&mut scaled);
        Ok(scaled)
    }

    /// Index of the largest logit; ties go to the lower index.
    pub fn greedy(logits: &[f64]) -> Result<usize> {
        top_k_indices(logits, 1)
            .first()
            .copied()
            .ok_or(CoreError::EmptySequence)
    }

    /// Draw one index from `probabilities(logits)`.
    pub fn sample(&self, logits: &[f64], rng: &mut impl Rng) -> Result<usize> {
        let probs = self.probabilities(logits)?;
        let u: f64 = rng.random();
        let mut acc = 0.0;
        let mut last_nonzero = 0;
        for (i, &p) in probs.iter().enumerate() {
            if p == 0.0 {
                continue;
            }
            acc += p;
            last_nonzero = i;
            if u < acc {
                return Ok(i);
            }
        }
        // rounding left the cumulative sum just under u
        Ok(last_nonzero)
    }
}

/// Shannon entropy in nats; zero-probability entries contribute nothing.
pub fn entropy(probs: &[f64]) -> f64 {
    probs
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.ln())
        .sum()
}
