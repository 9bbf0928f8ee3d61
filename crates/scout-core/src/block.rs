//! Transformer block: pre-norm attention and feed-forward sublayers, each
//! wrapped in a residual connection.
//!
//! ```text
//! h = x + Attention(LN1(x))
//! y = h + FFN(LN2(h))
//! ```
//!
//! The FFN slot holds either one dense network or a mixture-of-experts router.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attention::{AttentionMask, MultiHeadAttention};
use crate::error::{CoreError, Result};
use crate::matrix::{Matrix, relu};
use crate::norm::LayerNorm;
use crate::router::Router;

/// Two-layer position-wise network: `ReLU(x·W1 + b1)·W2 + b2`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedForward {
    pub w1: Matrix,
    pub b1: Vec<f64>,
    pub w2: Matrix,
    pub b2: Vec<f64>,
}

impl FeedForward {
    pub fn init(d_model: usize, hidden: usize, rng: &mut impl Rng) -> Self {
        Self {
            w1: Matrix::xavier_uniform(d_model, hidden, rng),
            b1: vec![0.0; hidden],
            w2: Matrix::xavier_uniform(hidden, d_model, rng),
            b2: vec![0.0; d_model],
        }
    }

    pub fn hidden(&self) -> usize {
        self.w1.cols()
    }

    pub fn validate(&self, d_model: usize) -> Result<()> {
        let h = self.hidden();
        if self.w1.rows() != d_model {
            return Err(CoreError::shape("ffn w1 rows", d_model, self.w1.rows()));
        }
        if self.b1.len() != h {
            return Err(CoreError::shape("ffn b1", h, self.b1.len()));
        }
        if self.w2.shape() != (h, d_model) {
            return Err(CoreError::shape(
                "ffn w2",
                format!("{:?}", (h, d_model)),
                format!("{:?}", self.w2.shape()),
            ));
        }
        if self.b2.len() != d_model {
            return Err(CoreError::shape("ffn b2", d_model, self.b2.len()));
        }
        Ok(())
    }

    pub fn forward(&self, x: &Matrix) -> Result<Matrix> {
        let hidden = x.affine(&self.w1, &self.b1)?.map(relu);
        hidden.affine(&self.w2, &self.b2)
    }

    pub fn weights_mut(&mut self) -> Vec<&mut Matrix> {
        vec![&mut self.w1, &mut self.w2]
    }

    /// Zero the output projection so the sublayer contributes nothing.
    pub fn zero_output(&mut self) {
        self.w2 = Matrix::zeros(self.w2.rows(), self.w2.cols());
        self.b2.iter_mut().for_each(|b| *b = 0.0);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedSublayer {
    Dense(FeedForward),
    Experts(Router),
}

impl FeedSublayer {
    fn validate(&self, d_model: usize) -> Result<()> {
        match self {
            FeedSublayer::Dense(ffn) => ffn.validate(d_model),
            FeedSublayer::Experts(router) => router.validate(d_model),
        }
    }

    fn forward(&self, x: &Matrix) -> Result<(Matrix, Option<Vec<usize>>)> {
        match self {
            FeedSublayer::Dense(ffn) => Ok((ffn.forward(x)?, None)),
            FeedSublayer::Experts(router) => {
                let routed = router.forward(x)?;
                Ok((routed.output, Some(routed.utilization)))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformerBlock {
    pub attention: MultiHeadAttention,
    pub norm1: LayerNorm,
    pub norm2: LayerNorm,
    pub ffn: FeedSublayer,
}

#[derive(Clone, Debug)]
pub struct BlockOutput {
    pub output: Matrix,
    /// Head-averaged `(L, L)` attention weights.
    pub attention: Matrix,
    /// Per-expert token counts when the FFN slot is routed.
    pub utilization: Option<Vec<usize>>,
}

impl TransformerBlock {
    pub fn validate(&self, d_model: usize) -> Result<()> {
        self.attention.validate(d_model)?;
        self.norm1.validate(d_model)?;
        self.norm2.validate(d_model)?;
        self.ffn.validate(d_model)
    }

    pub fn forward(&self, x: &Matrix, mask: Option<&AttentionMask>) -> Result<BlockOutput> {
        let attn = self.attention.forward(&self.norm1.forward(x)?, mask)?;
        let h = x.add(&attn.output)?;
        let (ff, utilization) = self.ffn.forward(&self.norm2.forward(&h)?)?;
        let output = h.add(&ff)?;
        Ok(BlockOutput {
            output,
            attention: attn.weights,
            utilization,
        })
    }

    pub fn weights_mut(&mut self) -> Vec<&mut Matrix> {
        let mut out = self.attention.weights_mut();
        match &mut self.ffn {
            FeedSublayer::Dense(ffn) => out.extend(ffn.weights_mut()),
            FeedSublayer::Experts(router) => out.extend(router.weights_mut()),
        }
        out
    }

    /// Zero both sublayers' output projections; the block then returns its
    /// input unchanged.
    pub fn zero_sublayers(&mut self) {
        let a = &mut self.attention;
        a.w_o = Matrix::zeros(a.w_o.rows(), a.w_o.cols());
        a.b_o.iter_mut().for_each(|b| *b = 0.0);
        match &mut self.ffn {
            FeedSublayer::Dense(ffn) => ffn.zero_output(),
            FeedSublayer::Experts(router) => router.experts.iter_mut().for_each(FeedForward::zero_output),
        }
    }
}
