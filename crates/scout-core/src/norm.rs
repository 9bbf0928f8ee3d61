use serde::{Deserialize, Serialize};

use crate::constants::NORM_EPSILON;
use crate::error::{CoreError, Result};
use crate::matrix::Matrix;

/// Learned affine parameters of one normalization layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub gamma: Vec<f64>,
    pub beta: Vec<f64>,
}

impl LayerParams {
    /// Identity affine: `gamma = 1`, `beta = 0`.
    pub fn identity(d_model: usize) -> Self {
        Self {
            gamma: vec![1.0; d_model],
            beta: vec![0.0; d_model],
        }
    }
}

/// Per-sample layer normalization: statistics come from each row alone,
/// never from the batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerNorm {
    pub params: LayerParams,
    #[serde(default = "default_eps")]
    pub eps: f64,
}

fn default_eps() -> f64 {
    NORM_EPSILON
}

impl LayerNorm {
    pub fn new(d_model: usize, eps: f64) -> Self {
        Self {
            params: LayerParams::identity(d_model),
            eps,
        }
    }

    pub fn validate(&self, d_model: usize) -> Result<()> {
        if self.params.gamma.len() != d_model {
            return Err(CoreError::shape("LayerNorm gamma", d_model, self.params.gamma.len()));
        }
        if self.params.beta.len() != d_model {
            return Err(CoreError::shape("LayerNorm beta", d_model, self.params.beta.len()));
        }
        if !(self.eps > 0.0) {
            return Err(CoreError::InvalidConfig(format!("norm eps must be > 0, got {}", self.eps)));
        }
        Ok(())
    }

    /// `γ·(x-μ)/sqrt(σ²+ε) + β` applied to every row.
    pub fn forward(&self, x: &Matrix) -> Result<Matrix> {
        if x.cols() != self.params.gamma.len() {
            return Err(CoreError::shape("LayerNorm::forward", self.params.gamma.len(), x.cols()));
        }
        let mut out = x.clone();
        for r in 0..out.rows() {
            let row = out.row_mut(r);
            standardize_in_place(row, self.eps);
            for ((v, &g), &b) in row.iter_mut().zip(&self.params.gamma).zip(&self.params.beta) {
                *v = g * *v + b;
            }
        }
        Ok(out)
    }
}

/// Mean and population variance of one row.
pub fn moments(row: &[f64]) -> (f64, f64) {
    if row.is_empty() {
        return (0.0, 0.0);
    }
    let n = row.len() as f64;
    let mean = row.iter().sum::<f64>() / n;
    let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, var)
}

/// `(x-μ)/sqrt(σ²+ε)` in place, without the affine step.
///
/// A row with σ² exactly 0 maps to all zeros (the ε guard keeps the division
/// finite) and is logged for monitoring.
pub fn standardize_in_place(row: &mut [f64], eps: f64) {
    let (mean, var) = moments(row);
    if var == 0.0 {
        tracing::debug!(width = row.len(), mean, "degenerate norm: zero-variance row");
    }
    let inv_std = 1.0 / (var + eps).sqrt();
    row.iter_mut().for_each(|x| *x = (*x - mean) * inv_std);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_known_row() {
        let ln = LayerNorm::new(4, 1e-5);
        let out = ln
            .forward(&Matrix::from_rows(&[vec![1.0, 2.0, 3.0, 4.0]]).unwrap())
            .unwrap();
        // μ = 2.5, σ² = 1.25
        let inv = 1.0 / (1.25f64 + 1e-5).sqrt();
        assert_relative_eq!(out.get(0, 0), -1.5 * inv, epsilon = 1e-12);
        assert_relative_eq!(out.get(0, 3), 1.5 * inv, epsilon = 1e-12);
    }

    #[test]
    fn test_affine_applied() {
        let mut ln = LayerNorm::new(2, 1e-5);
        ln.params.gamma = vec![2.0, 2.0];
        ln.params.beta = vec![10.0, 10.0];
        let out = ln.forward(&Matrix::from_rows(&[vec![-1.0, 1.0]]).unwrap()).unwrap();
        let z = 1.0 / (1.0f64 + 1e-5).sqrt();
        assert_relative_eq!(out.get(0, 0), 10.0 - 2.0 * z, epsilon = 1e-12);
        assert_relative_eq!(out.get(0, 1), 10.0 + 2.0 * z, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_variance_is_finite_zero() {
        let ln = LayerNorm::new(3, 1e-5);
        let out = ln.forward(&Matrix::filled(2, 3, 7.0)).unwrap();
        assert!(out.data().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_per_sample_not_per_batch() {
        let ln = LayerNorm::new(3, 1e-5);
        let a = Matrix::from_rows(&[vec![1.0, 2.0, 6.0]]).unwrap();
        let batch = Matrix::from_rows(&[vec![1.0, 2.0, 6.0], vec![100.0, -50.0, 3.0]]).unwrap();
        let alone = ln.forward(&a).unwrap();
        let together = ln.forward(&batch).unwrap();
        assert_eq!(alone.row(0), together.row(0));
    }

    #[test]
    fn test_width_mismatch() {
        let ln = LayerNorm::new(3, 1e-5);
        assert!(ln.forward(&Matrix::zeros(1, 4)).is_err());
        assert!(ln.validate(4).is_err());
        assert!(LayerNorm::new(3, 0.0).validate(3).is_err());
    }

    proptest! {
        #[test]
        fn prop_standardized_moments(row in prop::collection::vec(-100.0f64..100.0, 2..64)) {
            let (_, var) = moments(&row);
            // Below this spread ε visibly shrinks the unit variance.
            prop_assume!(var > 1.0);
            let mut z = row.clone();
            standardize_in_place(&mut z, 1e-5);
            let (mean, var) = moments(&z);
            prop_assert!(mean.abs() < 1e-5);
            prop_assert!((var.sqrt() - 1.0).abs() < 1e-5);
        }
    }
}
