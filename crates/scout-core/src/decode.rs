//! Autoregressive outreach decoder.
//!
//! The pooled lead representation opens the sequence, followed by `[BOS]`, the
//! prompt and every token generated so far. Each step runs the scoring
//! blocks under a causal mask, projects the last position onto the
//! vocabulary and hands the logits to a `Sampler`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attention::AttentionMask;
use crate::block::TransformerBlock;
use crate::chronos::positional_encoding;
use crate::error::{CoreError, Result};
use crate::matrix::{Matrix, dot};
use crate::sampler::Sampler;
use crate::tokenizer::{BOS_ID, EOS_ID, OutreachVocab, PAD_ID};

pub const DEFAULT_MAX_DRAFT_TOKENS: usize = 32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutreachDecoder {
    pub vocab: OutreachVocab,
    /// `V × d_model`
    pub token_embed: Matrix,
    /// `d_model × V`
    pub lm_head: Matrix,
    pub lm_bias: Vec<f64>,
    pub max_len: usize,
}

impl OutreachDecoder {
    pub fn init(d_model: usize, vocab: OutreachVocab, max_len: usize, rng: &mut impl Rng) -> Self {
        let v = vocab.len();
        Self {
            token_embed: Matrix::xavier_uniform(v, d_model, rng),
            lm_head: Matrix::xavier_uniform(d_model, v, rng),
            lm_bias: vec![0.0; v],
            vocab,
            max_len,
        }
    }

    pub fn validate(&self, d_model: usize) -> Result<()> {
        let v = self.vocab.len();
        if self.token_embed.shape() != (v, d_model) {
            return Err(CoreError::shape(
                "decoder token embedding",
                format!("{:?}", (v, d_model)),
                format!("{:?}", self.token_embed.shape()),
            ));
        }
        if self.lm_head.shape() != (d_model, v) {
            return Err(CoreError::shape(
                "decoder lm head",
                format!("{:?}", (d_model, v)),
                format!("{:?}", self.lm_head.shape()),
            ));
        }
        if self.lm_bias.len() != v {
            return Err(CoreError::shape("decoder lm bias", v, self.lm_bias.len()));
        }
        Ok(())
    }

    pub fn weights_mut(&mut self) -> Vec<&mut Matrix> {
        vec![&mut self.token_embed, &mut self.lm_head]
    }

    /// Vocabulary logits for the token following `prefix`. `[PAD]` and `[BOS]`
    /// are never valid continuations and come back as `-∞`.
    pub fn next_logits(&self, blocks: &[TransformerBlock], context: &[f64], prefix: &[usize]) -> Result<Vec<f64>> {
        let d_model = self.token_embed.cols();
        if context.len() != d_model {
            return Err(CoreError::shape("decoder context", d_model, context.len()));
        }

        let mut x = Matrix::row_vector(context.to_vec());
        for &id in prefix {
            if id >= self.vocab.len() {
                return Err(CoreError::InvalidValue {
                    field: "token id".to_string(),
                    value: id as f64,
                });
            }
            x.push_row(self.token_embed.row(id))?;
        }
        let len = x.rows();
        x = x.add(&positional_encoding(len, d_model))?;

        let mask = AttentionMask::causal(len);
        for block in blocks {
            x = block.forward(&x, Some(&mask))?.output;
        }

        let last = x.row(len - 1);
        let mut logits: Vec<f64> = (0..self.vocab.len())
            .map(|t| self.lm_bias[t] + dot(last, &self.lm_head.column(t)))
            .collect();
        logits[PAD_ID] = f64::NEG_INFINITY;
        logits[BOS_ID] = f64::NEG_INFINITY;
        Ok(logits)
    }

    /// Sample up to `max_len` tokens after `prompt`, stopping at `[EOS]`.
    /// Returns only the newly generated ids.
    pub fn generate(
        &self,
        blocks: &[TransformerBlock],
        context: &[f64],
        prompt: &[usize],
        sampler: &Sampler,
        rng: &mut impl Rng,
    ) -> Result<Vec<usize>> {
        let mut prefix = Vec::with_capacity(1 + prompt.len() + self.max_len);
        prefix.push(BOS_ID);
        prefix.extend_from_slice(prompt);

        let mut generated = Vec::new();
        while generated.len() < self.max_len {
            let logits = self.next_logits(blocks, context, &prefix)?;
            let next = sampler.sample(&logits, rng)?;
            if next == EOS_ID {
                break;
            }
            prefix.push(next);
            generated.push(next);
        }
        tracing::debug!(prompt = prompt.len(), generated = generated.len(), "decoded draft");
        Ok(generated)
    }
}
