//! Model snapshot and the end-to-end scoring pipeline.
//!
//! ```text
//! [START] + profile tokens + time-ordered signals
//!   → Embedder → Chronos (decay · e + PE)
//!   → N × TransformerBlock
//!   → pool ([START] row by default) → Linear → ReLU → Linear → sigmoid
//! ```
//!
//! Every parameter lives in one immutable `ModelSnapshot`. `LeadScout` holds
//! it behind an `Arc` so scoring threads share it read-only; replacing a
//! model means building a new snapshot, never mutating a live one.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attention::MultiHeadAttention;
use crate::block::{FeedForward, FeedSublayer, TransformerBlock};
use crate::chronos::Chronos;
use crate::config::{ModelConfig, Pooling};
use crate::constants::{HIGH_INTENT_THRESHOLD, MEDIUM_INTENT_THRESHOLD};
use crate::decode::{DEFAULT_MAX_DRAFT_TOKENS, OutreachDecoder};
use crate::embed::{Embedder, FeatureToken};
use crate::error::{CoreError, Result};
use crate::matrix::{Matrix, dot, relu, sigmoid};
use crate::norm::LayerNorm;
use crate::profile::{LeadProfile, ProfileToken};
use crate::quantize::{DegradationReport, Granularity, QuantizedTensor};
use crate::router::{Router, Utilization};
use crate::signal::{RawSignal, SignalKind, SignalRecord};
use crate::time::parse_iso8601;
use crate::tokenizer::{OutreachVocab, opening_hook};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub config: ModelConfig,
    pub embedder: Embedder,
    pub blocks: Vec<TransformerBlock>,
    pub head: ScoreHead,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoder: Option<OutreachDecoder>,
}

impl ModelSnapshot {
    /// Freshly initialized (untrained) parameters for `config`.
    pub fn init(config: ModelConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let d = config.d_model;
        let embedder = Embedder::init(d, rng);
        let mut blocks = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            let ffn = if config.uses_experts() {
                FeedSublayer::Experts(Router::init(d, config.ff_hidden, config.n_experts, config.top_k_experts, rng)?)
            } else {
                FeedSublayer::Dense(FeedForward::init(d, config.ff_hidden, rng))
            };
            blocks.push(TransformerBlock {
                attention: MultiHeadAttention::init(d, config.n_heads, rng)?,
                norm1: LayerNorm::new(d, config.norm_eps),
                norm2: LayerNorm::new(d, config.norm_eps),
                ffn,
            });
        }
        let head = ScoreHead::init(d, config.head_hidden, rng);
        let decoder = OutreachDecoder::init(d, OutreachVocab::default(), DEFAULT_MAX_DRAFT_TOKENS, rng);
        Ok(Self {
            config,
            embedder,
            blocks,
            head,
            decoder: Some(decoder),
        })
    }

    /// Check every tensor against the configuration. Run on load, before serving.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        let d = self.config.d_model;
        self.embedder.validate(d)?;
        if self.blocks.len() != self.config.n_layers {
            return Err(CoreError::shape("block count", self.config.n_layers, self.blocks.len()));
        }
        for block in &self.blocks {
            block.validate(d)?;
        }
        self.head.validate(d, self.config.head_hidden)?;
        if let Some(decoder) = &self.decoder {
            decoder.validate(d)?;
        }
        Ok(())
    }

    pub fn weights_mut(&mut self) -> Vec<&mut Matrix> {
        let mut out = self.embedder.weights_mut();
        for block in &mut self.blocks {
            out.extend(block.weights_mut());
        }
        if let Some(decoder) = &mut self.decoder {
            out.extend(decoder.weights_mut());
        }
        out
    }

    /// Total trainable scalars, biases included.
    pub fn parameter_count(&self) -> usize {
        let mut clone = self.clone();
        let matrices: usize = clone.weights_mut().iter().map(|m| m.rows() * m.cols()).sum();
        let d = self.config.d_model;
        let per_block_bias: usize = self
            .blocks
            .iter()
            .map(|b| {
                let ffn = match &b.ffn {
                    FeedSublayer::Dense(f) => f.b1.len() + f.b2.len(),
                    FeedSublayer::Experts(r) => {
                        r.gate_b.len() + r.experts.iter().map(|e| e.b1.len() + e.b2.len()).sum::<usize>()
                    }
                };
                4 * d + 4 * d + ffn
            })
            .sum();
        let decoder_bias = self.decoder.as_ref().map_or(0, |dec| dec.lm_bias.len());
        matrices + per_block_bias + self.head.parameter_count() + decoder_bias
    }

    /// Integer form of every weight matrix, for deployment. Biases,
    /// normalization parameters and the score head stay float.
    pub fn quantize_weights(&self, bits: u8, granularity: Granularity) -> Result<QuantizedSnapshot> {
        let mut skeleton = self.clone();
        skeleton.config.quant_bits = bits;
        skeleton.config.quant_granularity = granularity;
        let mut tensors = Vec::new();
        for w in skeleton.weights_mut() {
            tensors.push(QuantizedTensor::quantize(w, bits, granularity)?);
            *w = Matrix::zeros(0, 0);
        }
        let bound = tensors.iter().fold(0.0_f64, |m, q| m.max(q.max_error_bound()));
        tracing::info!(bits, ?granularity, tensors = tensors.len(), max_error_bound = bound, "quantized snapshot");
        Ok(QuantizedSnapshot { skeleton, tensors })
    }

    /// Copy of this snapshot with every weight matrix passed through
    /// quantize → dequantize: exactly what a loaded quantized snapshot serves.
    pub fn quantized(&self, bits: u8, granularity: Granularity) -> Result<Self> {
        self.quantize_weights(bits, granularity)?.dequantize()
    }
}

/// Deployment form of a snapshot: the float parts with every weight matrix
/// left as an empty placeholder, plus one `QuantizedTensor` per matrix in
/// `ModelSnapshot::weights_mut` order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizedSnapshot {
    pub skeleton: ModelSnapshot,
    pub tensors: Vec<QuantizedTensor>,
}

impl QuantizedSnapshot {
    /// Rebuild the servable float snapshot and validate it.
    pub fn dequantize(&self) -> Result<ModelSnapshot> {
        let mut out = self.skeleton.clone();
        let slots = out.weights_mut();
        if slots.len() != self.tensors.len() {
            return Err(CoreError::shape("quantized tensor count", slots.len(), self.tensors.len()));
        }
        for (w, q) in slots.into_iter().zip(&self.tensors) {
            *w = q.dequantize()?;
        }
        out.validate()?;
        Ok(out)
    }
}

/// Classifier over the pooled vector: `Linear → ReLU → Linear`, one logit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreHead {
    /// `d_model × hidden`
    pub w1: Matrix,
    pub b1: Vec<f64>,
    pub w2: Vec<f64>,
    pub b2: f64,
}

impl ScoreHead {
    pub fn init(d_model: usize, hidden: usize, rng: &mut impl Rng) -> Self {
        Self {
            w1: Matrix::xavier_uniform(d_model, hidden, rng),
            b1: vec![0.0; hidden],
            w2: Matrix::xavier_uniform(hidden, 1, rng).column(0),
            b2: 0.0,
        }
    }

    pub fn validate(&self, d_model: usize, hidden: usize) -> Result<()> {
        if self.w1.shape() != (d_model, hidden) {
            return Err(CoreError::shape(
                "score head w1",
                format!("{:?}", (d_model, hidden)),
                format!("{:?}", self.w1.shape()),
            ));
        }
        if self.b1.len() != hidden {
            return Err(CoreError::shape("score head b1", hidden, self.b1.len()));
        }
        if self.w2.len() != hidden {
            return Err(CoreError::shape("score head w2", hidden, self.w2.len()));
        }
        Ok(())
    }

    pub fn logit(&self, pooled: &[f64]) -> Result<f64> {
        let hidden = Matrix::row_vector(pooled.to_vec())
            .affine(&self.w1, &self.b1)?
            .map(relu);
        Ok(dot(hidden.row(0), &self.w2) + self.b2)
    }

    pub fn parameter_count(&self) -> usize {
        self.w1.rows() * self.w1.cols() + self.b1.len() + self.w2.len() + 1
    }
}

/// One scoring call's inputs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRequest {
    #[serde(default)]
    pub profile: Option<LeadProfile>,
    pub signals: Vec<SignalRecord>,
    /// Unix seconds that signal ages are measured from.
    pub reference_time: i64,
}

/// A lead as delivered by the ingestion collaborator: raw signals with
/// ISO-8601 timestamps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeadInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile: Option<LeadProfile>,
    #[serde(default)]
    pub signals: Vec<RawSignal>,
    /// ISO-8601; the caller's clock is used when absent.
    #[serde(default)]
    pub reference_time: Option<String>,
}

impl LeadInput {
    pub fn to_request(&self, default_reference: i64) -> Result<ScoreRequest> {
        let reference_time = match &self.reference_time {
            Some(ts) => parse_iso8601(ts)?,
            None => default_reference,
        };
        let signals = self
            .signals
            .iter()
            .map(SignalRecord::from_raw)
            .collect::<Result<Vec<_>>>()?;
        Ok(ScoreRequest {
            profile: self.profile.clone(),
            signals,
            reference_time,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    High,
    Medium,
    Low,
}

impl IntentLabel {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= HIGH_INTENT_THRESHOLD {
            IntentLabel::High
        } else if percent >= MEDIUM_INTENT_THRESHOLD {
            IntentLabel::Medium
        } else {
            IntentLabel::Low
        }
    }
}

impl fmt::Display for IntentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntentLabel::High => "high",
            IntentLabel::Medium => "medium",
            IntentLabel::Low => "low",
        };
        f.write_str(s)
    }
}

/// What occupies each row of an encoded sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Start,
    Profile(ProfileToken),
    /// Index into the request's `signals`.
    Signal(usize),
}

/// Attention-derived importance of one signal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalRelevance {
    pub kind: SignalKind,
    pub timestamp: i64,
    pub age_hours: f64,
    pub decay_weight: f64,
    /// Final-layer attention from `[START]` to this signal, times sequence
    /// length: 1.0 is uniform, above 1 is attended more than average.
    pub relevance: f64,
}

#[derive(Clone, Debug)]
pub struct ScoreOutput {
    /// Sigmoid output in `(0, 1)`.
    pub score: f64,
    pub percent: f64,
    pub label: IntentLabel,
    /// Head-averaged `(L, L)` weights, one per block.
    pub attention: Vec<Matrix>,
    pub relevance: Vec<SignalRelevance>,
    pub utilization: Utilization,
    pub pooled: Vec<f64>,
}

/// Encoded input ready for the blocks.
#[derive(Clone, Debug)]
pub struct EncodedSequence {
    pub matrix: Matrix,
    pub slots: Vec<Slot>,
    pub ages: Vec<f64>,
}

#[derive(Clone, Debug)]
pub struct Draft {
    pub hook: String,
    pub body: String,
    pub tokens: Vec<usize>,
}

/// Scoring front end over a shared, read-only snapshot.
#[derive(Clone, Debug)]
pub struct LeadScout {
    snapshot: Arc<ModelSnapshot>,
    chronos: Chronos,
}

impl LeadScout {
    pub fn new(snapshot: ModelSnapshot) -> Result<Self> {
        Self::from_shared(Arc::new(snapshot))
    }

    pub fn from_shared(snapshot: Arc<ModelSnapshot>) -> Result<Self> {
        snapshot.validate()?;
        let chronos = Chronos::new(snapshot.config.decay_lambda)?;
        tracing::info!(
            d_model = snapshot.config.d_model,
            layers = snapshot.blocks.len(),
            experts = snapshot.config.n_experts,
            "model snapshot loaded"
        );
        Ok(Self { snapshot, chronos })
    }

    pub fn snapshot(&self) -> &Arc<ModelSnapshot> {
        &self.snapshot
    }

    pub fn config(&self) -> &ModelConfig {
        &self.snapshot.config
    }

    /// Build `[START]`, the profile tokens (weight 1, age 0) and the signals
    /// oldest-first, dropping the oldest signals past `max_seq_len`.
    pub fn encode(&self, request: &ScoreRequest) -> Result<EncodedSequence> {
        if request.signals.is_empty() && request.profile.is_none() {
            return Err(CoreError::EmptySequence);
        }
        let embedder = &self.snapshot.embedder;
        let mut slots = vec![Slot::Start];
        let mut rows = vec![(embedder.embed_token(FeatureToken::Start), 0.0)];

        if let Some(profile) = &request.profile {
            for token in profile.tokens() {
                slots.push(Slot::Profile(token));
                rows.push((embedder.embed_token(FeatureToken::Profile(token)), 0.0));
            }
        }

        let mut order: Vec<usize> = (0..request.signals.len()).collect();
        order.sort_by_key(|&i| request.signals[i].timestamp);
        let room = self.config().max_seq_len.saturating_sub(rows.len());
        if order.len() > room {
            tracing::debug!(dropped = order.len() - room, "sequence over max_seq_len; dropping oldest signals");
            order.drain(..order.len() - room);
        }
        for i in order {
            let record = &request.signals[i];
            slots.push(Slot::Signal(i));
            rows.push((embedder.embed_signal(record), record.age_hours(request.reference_time)));
        }

        let ages = rows.iter().map(|(_, age)| *age).collect();
        let matrix = self.chronos.encode(&rows)?;
        Ok(EncodedSequence { matrix, slots, ages })
    }

    /// Run the blocks and pool. Returns `(pooled, attention per block, utilization)`.
    fn represent(&self, encoded: &EncodedSequence) -> Result<(Vec<f64>, Vec<Matrix>, Utilization)> {
        let mut x = encoded.matrix.clone();
        let mut attention = Vec::with_capacity(self.snapshot.blocks.len());
        let mut utilization = Utilization::new(self.config().n_experts);
        for block in &self.snapshot.blocks {
            let out = block.forward(&x, None)?;
            x = out.output;
            attention.push(out.attention);
            if let Some(counts) = out.utilization {
                utilization.record(&counts);
            }
        }
        let pooled = match self.config().pooling {
            Pooling::Start => x.row(0).to_vec(),
            Pooling::Mean => x.mean_of_rows(x.rows()),
        };
        Ok((pooled, attention, utilization))
    }

    pub fn score(&self, request: &ScoreRequest) -> Result<ScoreOutput> {
        let encoded = self.encode(request)?;
        let (pooled, attention, utilization) = self.represent(&encoded)?;

        let logit = self.snapshot.head.logit(&pooled)?;
        let score = sigmoid(logit);
        let percent = 100.0 * score;

        let relevance = match attention.last() {
            Some(last) => {
                let len = encoded.slots.len() as f64;
                encoded
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(pos, slot)| match slot {
                        Slot::Signal(i) => {
                            let record = &request.signals[*i];
                            Some(SignalRelevance {
                                kind: record.kind,
                                timestamp: record.timestamp,
                                age_hours: encoded.ages[pos],
                                decay_weight: self.chronos.decay_weight(encoded.ages[pos]),
                                relevance: last.get(0, pos) * len,
                            })
                        }
                        _ => None,
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        tracing::debug!(score, len = encoded.slots.len(), "scored lead");
        Ok(ScoreOutput {
            score,
            percent,
            label: IntentLabel::from_percent(percent),
            attention,
            relevance,
            utilization,
            pooled,
        })
    }

    /// Score the lead, open with a hook for its strongest signal, and let the
    /// decoder continue the message.
    pub fn draft(&self, request: &ScoreRequest, rng: &mut impl Rng) -> Result<(ScoreOutput, Draft)> {
        let decoder = self
            .snapshot
            .decoder
            .as_ref()
            .ok_or_else(|| CoreError::InvalidConfig("snapshot has no outreach decoder".into()))?;
        let scored = self.score(request)?;

        let strongest = request
            .signals
            .iter()
            .fold(None::<&SignalRecord>, |best, s| match best {
                Some(b) if b.strength >= s.strength => Some(b),
                _ => Some(s),
            })
            .map(|s| s.kind);
        let hook = opening_hook(strongest).to_string();
        let prompt = decoder.vocab.encode(&hook);

        let sampler = self.config().sampler()?;
        let tokens = decoder.generate(&self.snapshot.blocks, &scored.pooled, &prompt, &sampler, rng)?;
        let body = decoder.vocab.decode(&tokens);
        Ok((scored, Draft { hook, body, tokens }))
    }

    /// Accuracy of this model against `quantized` on a labelled set.
    pub fn degradation(
        &self,
        quantized: &LeadScout,
        eval: &[(ScoreRequest, bool)],
        threshold: f64,
        tolerance: Option<f64>,
    ) -> Result<DegradationReport> {
        let labels: Vec<bool> = eval.iter().map(|(_, y)| *y).collect();
        let requests: Vec<ScoreRequest> = eval.iter().map(|(r, _)| r.clone()).collect();
        let float_scores = crate::batch::score_batch(self, &requests)
            .into_iter()
            .map(|r| r.map(|o| o.score))
            .collect::<Result<Vec<_>>>()?;
        let quant_scores = crate::batch::score_batch(quantized, &requests)
            .into_iter()
            .map(|r| r.map(|o| o.score))
            .collect::<Result<Vec<_>>>()?;
        DegradationReport::evaluate(&float_scores, &quant_scores, &labels, threshold, tolerance)
    }
}
