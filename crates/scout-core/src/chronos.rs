//! Chronos: time awareness for signal sequences.
//!
//! Two independent pieces: an exponential recency decay applied to each
//! signal's embedding, and the fixed sinusoidal positional encoding added on
//! top so attention can tell sequence slots apart.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_HALF_LIFE_HOURS, PE_BASE};
use crate::error::{CoreError, Result};
use crate::matrix::Matrix;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chronos {
    /// Decay rate λ per hour. Zero disables decay.
    pub decay_lambda: f64,
}

impl Default for Chronos {
    fn default() -> Self {
        Self {
            decay_lambda: std::f64::consts::LN_2 / DEFAULT_HALF_LIFE_HOURS,
        }
    }
}

impl Chronos {
    pub fn new(decay_lambda: f64) -> Result<Self> {
        if !decay_lambda.is_finite() || decay_lambda < 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "decay_lambda must be finite and >= 0, got {decay_lambda}"
            )));
        }
        Ok(Self { decay_lambda })
    }

    /// λ = ln 2 / half-life, so a signal's weight halves every `half_life_hours`.
    pub fn from_half_life(half_life_hours: f64) -> Result<Self> {
        if !half_life_hours.is_finite() || half_life_hours <= 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "half_life_hours must be > 0, got {half_life_hours}"
            )));
        }
        Self::new(std::f64::consts::LN_2 / half_life_hours)
    }

    /// `exp(-λ·age)`. Negative ages (future timestamps) count as 0.
    pub fn decay_weight(&self, age_hours: f64) -> f64 {
        let age = if age_hours.is_nan() { 0.0 } else { age_hours.max(0.0) };
        (-self.decay_lambda * age).exp()
    }

    /// Stack `w(age_i) · e_i + PE[i]` into an `(L, d_model)` matrix.
    pub fn encode(&self, sequence: &[(Vec<f64>, f64)]) -> Result<Matrix> {
        let d_model = sequence.first().map_or(0, |(v, _)| v.len());
        let pe = positional_encoding(sequence.len(), d_model);
        let mut out = Matrix::zeros(sequence.len(), d_model);
        for (pos, (vector, age)) in sequence.iter().enumerate() {
            if vector.len() != d_model {
                return Err(CoreError::shape(
                    "Chronos::encode",
                    format!("{d_model} features"),
                    format!("{} at position {pos}", vector.len()),
                ));
            }
            let w = self.decay_weight(*age);
            for ((dst, &x), &p) in out.row_mut(pos).iter_mut().zip(vector).zip(pe.row(pos)) {
                *dst = w * x + p;
            }
        }
        Ok(out)
    }
}

/// Sinusoidal positional encoding of shape `(len, d_model)`.
///
/// Column `j` uses frequency `1 / 10000^(2⌊j/2⌋ / d_model)`; even columns
/// take `sin`, odd columns `cos`.
pub fn positional_encoding(len: usize, d_model: usize) -> Matrix {
    let mut pe = Matrix::zeros(len, d_model);
    for pos in 0..len {
        for j in 0..d_model {
            let i = j / 2;
            let angle = pos as f64 / PE_BASE.powf(2.0 * i as f64 / d_model as f64);
            pe.set(pos, j, if j % 2 == 0 { angle.sin() } else { angle.cos() });
        }
    }
    pe
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_decay_at_zero_is_one() {
        assert_eq!(Chronos::default().decay_weight(0.0), 1.0);
    }

    #[test]
    fn test_half_life() {
        let c = Chronos::from_half_life(72.0).unwrap();
        assert_relative_eq!(c.decay_weight(72.0), 0.5, epsilon = 1e-12);
        assert_relative_eq!(c.decay_weight(144.0), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_future_age_clamped() {
        let c = Chronos::default();
        assert_eq!(c.decay_weight(-10.0), 1.0);
    }

    #[test]
    fn test_zero_lambda_is_flat() {
        let c = Chronos::new(0.0).unwrap();
        assert_eq!(c.decay_weight(1000.0), 1.0);
    }

    #[test]
    fn test_rejects_negative_lambda() {
        assert!(Chronos::new(-0.1).is_err());
        assert!(Chronos::new(f64::NAN).is_err());
        assert!(Chronos::from_half_life(0.0).is_err());
    }

    #[test]
    fn test_pe_columns_follow_formula() {
        let d = 6;
        let pe = positional_encoding(5, d);
        for pos in 0..5 {
            for j in 0..d {
                let freq = 1.0 / 10000f64.powf((2 * (j / 2)) as f64 / d as f64);
                let expected = if j % 2 == 0 {
                    (pos as f64 * freq).sin()
                } else {
                    (pos as f64 * freq).cos()
                };
                assert_relative_eq!(pe.get(pos, j), expected, epsilon = 1e-12);
            }
        }
        // Position 0: sin(0) = 0, cos(0) = 1
        assert_eq!(pe.row(0), &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_pe_odd_width() {
        let pe = positional_encoding(3, 5);
        assert_eq!(pe.shape(), (3, 5));
        assert_relative_eq!(pe.get(1, 4), (1.0 / 10000f64.powf(4.0 / 5.0)).sin(), epsilon = 1e-12);
    }

    #[test]
    fn test_encode_adds_pe_to_decayed_vectors() {
        let c = Chronos::from_half_life(10.0).unwrap();
        let seq = vec![(vec![2.0, 2.0], 0.0), (vec![2.0, 2.0], 10.0)];
        let out = c.encode(&seq).unwrap();
        let pe = positional_encoding(2, 2);
        assert_relative_eq!(out.get(0, 0), 2.0 + pe.get(0, 0));
        assert_relative_eq!(out.get(1, 1), 1.0 + pe.get(1, 1), epsilon = 1e-12);
    }

    #[test]
    fn test_encode_ragged_fails() {
        let seq = vec![(vec![1.0, 2.0], 0.0), (vec![1.0], 0.0)];
        assert!(Chronos::default().encode(&seq).is_err());
    }

    proptest! {
        #[test]
        fn prop_decay_monotone(a in 0.0f64..10_000.0, b in 0.0f64..10_000.0, lambda in 0.0001f64..1.0) {
            let c = Chronos::new(lambda).unwrap();
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            prop_assert!(c.decay_weight(lo) >= c.decay_weight(hi));
            if (hi - lo) * lambda > 1e-9 && c.decay_weight(hi) > 1e-300 {
                prop_assert!(c.decay_weight(lo) > c.decay_weight(hi));
            }
        }
    }
}
