//! Masked scaled dot-product attention, single and multi-head.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::matrix::{Matrix, softmax_in_place};

/// Which key positions each query position may attend to.
///
/// `visible[q][k] == false` forces the post-softmax weight of `(q, k)` to
/// exactly 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttentionMask {
    rows: usize,
    cols: usize,
    visible: Vec<bool>,
}

impl AttentionMask {
    pub fn all_visible(len: usize) -> Self {
        Self {
            rows: len,
            cols: len,
            visible: vec![true; len * len],
        }
    }

    /// Key-padding mask: only the first `valid` positions are real tokens.
    /// Every query (padding included) sees exactly those keys.
    pub fn padding(len: usize, valid: usize) -> Self {
        let mut mask = Self::all_visible(len);
        for q in 0..len {
            for k in valid.min(len)..len {
                mask.visible[q * len + k] = false;
            }
        }
        mask
    }

    /// Causal mask: query `q` sees keys `0..=q`.
    pub fn causal(len: usize) -> Self {
        let mut mask = Self::all_visible(len);
        for q in 0..len {
            for k in (q + 1)..len {
                mask.visible[q * len + k] = false;
            }
        }
        mask
    }

    pub fn from_rows(rows: &[Vec<bool>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(CoreError::shape("AttentionMask::from_rows", cols, bad.len()));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            visible: rows.concat(),
        })
    }

    /// Positions visible under both masks.
    pub fn intersect(&self, other: &AttentionMask) -> Result<AttentionMask> {
        if self.shape() != other.shape() {
            return Err(CoreError::shape(
                "AttentionMask::intersect",
                format!("{:?}", self.shape()),
                format!("{:?}", other.shape()),
            ));
        }
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            visible: self
                .visible
                .iter()
                .zip(&other.visible)
                .map(|(&a, &b)| a && b)
                .collect(),
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_visible(&self, q: usize, k: usize) -> bool {
        self.visible[q * self.cols + k]
    }
}

/// `softmax(Q·Kᵀ / sqrt(d_k) + mask) · V`.
///
/// Returns `(output (L_q × d_v), weights (L_q × L_k))`. Masked scores become
/// `-∞` before the row-max-subtracted softmax, so their weight is exactly 0.
/// A query row with every key masked gets an all-zero weight row and a zero
/// output row.
pub fn scaled_dot_product_attention(
    q: &Matrix,
    k: &Matrix,
    v: &Matrix,
    mask: Option<&AttentionMask>,
) -> Result<(Matrix, Matrix)> {
    let d_k = q.cols();
    if d_k == 0 || k.cols() != d_k {
        return Err(CoreError::shape(
            "attention Q/K width",
            format!("d_k = {d_k} > 0 on both"),
            format!("K width {}", k.cols()),
        ));
    }
    if k.rows() != v.rows() {
        return Err(CoreError::shape("attention K/V length", k.rows(), v.rows()));
    }
    if let Some(m) = mask
        && m.shape() != (q.rows(), k.rows())
    {
        return Err(CoreError::shape(
            "attention mask",
            format!("{:?}", (q.rows(), k.rows())),
            format!("{:?}", m.shape()),
        ));
    }

    let scale = 1.0 / (d_k as f64).sqrt();
    let mut weights = q.matmul(&k.transpose())?.scale(scale);
    for r in 0..weights.rows() {
        let row = weights.row_mut(r);
        if let Some(m) = mask {
            for (c, s) in row.iter_mut().enumerate() {
                if !m.is_visible(r, c) {
                    *s = f64::NEG_INFINITY;
                }
            }
        }
        softmax_in_place(row);
    }
    let output = weights.matmul(v)?;
    Ok((output, weights))
}

/// Output of a multi-head attention pass.
#[derive(Clone, Debug)]
pub struct AttentionOutput {
    /// `(L, d_model)` after the output projection.
    pub output: Matrix,
    /// `(L, L)` weights averaged over heads, for explainability.
    pub weights: Matrix,
    pub head_weights: Vec<Matrix>,
}

/// Multi-head self-attention parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiHeadAttention {
    pub n_heads: usize,
    pub w_q: Matrix,
    pub w_k: Matrix,
    pub w_v: Matrix,
    pub w_o: Matrix,
    pub b_q: Vec<f64>,
    pub b_k: Vec<f64>,
    pub b_v: Vec<f64>,
    pub b_o: Vec<f64>,
}

impl MultiHeadAttention {
    pub fn init(d_model: usize, n_heads: usize, rng: &mut impl Rng) -> Result<Self> {
        check_heads(d_model, n_heads)?;
        Ok(Self {
            n_heads,
            w_q: Matrix::xavier_uniform(d_model, d_model, rng),
            w_k: Matrix::xavier_uniform(d_model, d_model, rng),
            w_v: Matrix::xavier_uniform(d_model, d_model, rng),
            w_o: Matrix::xavier_uniform(d_model, d_model, rng),
            b_q: vec![0.0; d_model],
            b_k: vec![0.0; d_model],
            b_v: vec![0.0; d_model],
            b_o: vec![0.0; d_model],
        })
    }

    /// Projection matrices, for whole-model quantization. Biases stay float.
    pub fn weights_mut(&mut self) -> Vec<&mut Matrix> {
        vec![&mut self.w_q, &mut self.w_k, &mut self.w_v, &mut self.w_o]
    }

    pub fn head_dim(&self) -> usize {
        self.w_q.cols() / self.n_heads.max(1)
    }

    pub fn validate(&self, d_model: usize) -> Result<()> {
        check_heads(d_model, self.n_heads)?;
        for (name, w) in [("w_q", &self.w_q), ("w_k", &self.w_k), ("w_v", &self.w_v), ("w_o", &self.w_o)] {
            if w.shape() != (d_model, d_model) {
                return Err(CoreError::shape(
                    name,
                    format!("{:?}", (d_model, d_model)),
                    format!("{:?}", w.shape()),
                ));
            }
        }
        for (name, b) in [("b_q", &self.b_q), ("b_k", &self.b_k), ("b_v", &self.b_v), ("b_o", &self.b_o)] {
            if b.len() != d_model {
                return Err(CoreError::shape(name, d_model, b.len()));
            }
        }
        Ok(())
    }

    /// Project, split into heads, attend per head, concatenate, project out.
    pub fn forward(&self, x: &Matrix, mask: Option<&AttentionMask>) -> Result<AttentionOutput> {
        let q = x.affine(&self.w_q, &self.b_q)?;
        let k = x.affine(&self.w_k, &self.b_k)?;
        let v = x.affine(&self.w_v, &self.b_v)?;

        let head_dim = self.head_dim();
        let mut head_outputs = Vec::with_capacity(self.n_heads);
        let mut head_weights = Vec::with_capacity(self.n_heads);
        for h in 0..self.n_heads {
            let start = h * head_dim;
            let (out, w) = scaled_dot_product_attention(
                &q.slice_cols(start, head_dim)?,
                &k.slice_cols(start, head_dim)?,
                &v.slice_cols(start, head_dim)?,
                mask,
            )?;
            head_outputs.push(out);
            head_weights.push(w);
        }

        let concat = Matrix::hstack(&head_outputs)?;
        let output = concat.affine(&self.w_o, &self.b_o)?;

        let mut weights = Matrix::zeros(x.rows(), x.rows());
        for w in &head_weights {
            weights = weights.add(w)?;
        }
        let weights = weights.scale(1.0 / self.n_heads as f64);

        Ok(AttentionOutput {
            output,
            weights,
            head_weights,
        })
    }
}

fn check_heads(d_model: usize, n_heads: usize) -> Result<()> {
    if n_heads == 0 || d_model % n_heads != 0 {
        return Err(CoreError::shape(
            "d_model / n_heads",
            format!("n_heads > 0 dividing d_model = {d_model}"),
            format!("n_heads = {n_heads}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn assert_rows_stochastic(w: &Matrix, mask: Option<&AttentionMask>) {
        for r in 0..w.rows() {
            let sum: f64 = w.row(r).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "row {r} sums to {sum}");
            if let Some(m) = mask {
                for c in 0..w.cols() {
                    if !m.is_visible(r, c) {
                        assert_eq!(w.get(r, c), 0.0, "masked ({r},{c}) leaked weight");
                    }
                }
            }
        }
    }

    #[test]
    fn test_uniform_when_scores_equal() {
        let q = Matrix::zeros(3, 4);
        let k = Matrix::zeros(3, 4);
        let v = Matrix::from_rows(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let (out, w) = scaled_dot_product_attention(&q, &k, &v, None).unwrap();
        for r in 0..3 {
            assert_relative_eq!(w.get(r, 0), 1.0 / 3.0, epsilon = 1e-12);
            assert_relative_eq!(out.get(r, 0), 2.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_scaling_by_sqrt_dk() {
        // One query, two keys: scores 4/2 = 2 and 0 → weights softmax([2, 0])
        let q = Matrix::from_rows(&[vec![1.0, 1.0, 1.0, 1.0]]).unwrap();
        let k = Matrix::from_rows(&[vec![1.0, 1.0, 1.0, 1.0], vec![0.0; 4]]).unwrap();
        let v = Matrix::from_rows(&[vec![1.0], vec![0.0]]).unwrap();
        let (_, w) = scaled_dot_product_attention(&q, &k, &v, None).unwrap();
        let expected = 2f64.exp() / (2f64.exp() + 1.0);
        assert_relative_eq!(w.get(0, 0), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_causal_mask_exact_zeros() {
        let mut rng = rng();
        let x = Matrix::uniform(5, 4, -1.0, 1.0, &mut rng);
        let mask = AttentionMask::causal(5);
        let (_, w) = scaled_dot_product_attention(&x, &x, &x, Some(&mask)).unwrap();
        assert_rows_stochastic(&w, Some(&mask));
        assert_eq!(w.get(0, 0), 1.0);
    }

    #[test]
    fn test_padding_mask() {
        let mut rng = rng();
        let x = Matrix::uniform(4, 2, -1.0, 1.0, &mut rng);
        let mask = AttentionMask::padding(4, 2);
        let (_, w) = scaled_dot_product_attention(&x, &x, &x, Some(&mask)).unwrap();
        assert_rows_stochastic(&w, Some(&mask));
    }

    #[test]
    fn test_fully_masked_row_is_zero() {
        let mask = AttentionMask::from_rows(&[vec![true, true], vec![false, false]]).unwrap();
        let x = Matrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let (out, w) = scaled_dot_product_attention(&x, &x, &x, Some(&mask)).unwrap();
        assert_eq!(w.row(1), &[0.0, 0.0]);
        assert_eq!(out.row(1), &[0.0, 0.0]);
        assert!(out.is_finite());
    }

    #[test]
    fn test_huge_scores_do_not_overflow() {
        let q = Matrix::filled(2, 2, 1e6);
        let (out, w) = scaled_dot_product_attention(&q, &q, &q, None).unwrap();
        assert!(w.is_finite() && out.is_finite());
    }

    #[test]
    fn test_shape_errors() {
        let a = Matrix::zeros(3, 4);
        let b = Matrix::zeros(3, 2);
        assert!(scaled_dot_product_attention(&a, &b, &a, None).is_err());
        assert!(scaled_dot_product_attention(&a, &a, &Matrix::zeros(2, 4), None).is_err());
        let mask = AttentionMask::all_visible(2);
        assert!(scaled_dot_product_attention(&a, &a, &a, Some(&mask)).is_err());
    }

    #[test]
    fn test_mask_intersect() {
        let causal = AttentionMask::causal(3);
        let pad = AttentionMask::padding(3, 2);
        let both = causal.intersect(&pad).unwrap();
        assert!(both.is_visible(2, 1));
        assert!(!both.is_visible(2, 2));
        assert!(!both.is_visible(0, 1));
        assert!(causal.intersect(&AttentionMask::causal(4)).is_err());
    }

    #[test]
    fn test_multi_head_shapes_and_rows() {
        let mut rng = rng();
        let mha = MultiHeadAttention::init(8, 2, &mut rng).unwrap();
        mha.validate(8).unwrap();
        let x = Matrix::uniform(5, 8, -1.0, 1.0, &mut rng);
        let mask = AttentionMask::padding(5, 3);
        let out = mha.forward(&x, Some(&mask)).unwrap();
        assert_eq!(out.output.shape(), (5, 8));
        assert_eq!(out.weights.shape(), (5, 5));
        assert_eq!(out.head_weights.len(), 2);
        assert_rows_stochastic(&out.weights, Some(&mask));
    }

    #[test]
    fn test_single_head_matches_plain_attention() {
        let mut rng = rng();
        let mut mha = MultiHeadAttention::init(4, 1, &mut rng).unwrap();
        mha.w_o = identity(4);
        let x = Matrix::uniform(3, 4, -1.0, 1.0, &mut rng);
        let out = mha.forward(&x, None).unwrap();
        let q = x.matmul(&mha.w_q).unwrap();
        let k = x.matmul(&mha.w_k).unwrap();
        let v = x.matmul(&mha.w_v).unwrap();
        let (expected, _) = scaled_dot_product_attention(&q, &k, &v, None).unwrap();
        for (a, b) in out.output.data().iter().zip(expected.data()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let mut rng = rng();
        assert!(matches!(
            MultiHeadAttention::init(10, 3, &mut rng),
            Err(CoreError::ShapeMismatch { .. })
        ));
        assert!(MultiHeadAttention::init(8, 0, &mut rng).is_err());
    }

    fn identity(n: usize) -> Matrix {
        let mut m = Matrix::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    proptest! {
        #[test]
        fn prop_rows_sum_to_one(
            data in prop::collection::vec(-10.0f64..10.0, 24),
            valid in 1usize..=6,
        ) {
            let x = Matrix::from_vec(6, 4, data).unwrap();
            let mask = AttentionMask::padding(6, valid).intersect(&AttentionMask::causal(6)).unwrap();
            let (_, w) = scaled_dot_product_attention(&x, &x, &x, Some(&mask)).unwrap();
            for r in 0..6 {
                let sum: f64 = w.row(r).iter().sum();
                prop_assert!((sum - 1.0).abs() < 1e-6);
                for c in 0..6 {
                    if !mask.is_visible(r, c) {
                        prop_assert_eq!(w.get(r, c), 0.0);
                    }
                }
            }
        }
    }
}
