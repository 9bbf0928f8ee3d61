//! Lead Scout neural scoring core.
//!
//! Scores inbound sales leads from their timestamped signals with a small,
//! hand-built transformer: signal embedding, exponential recency decay plus
//! sinusoidal positions, masked multi-head self-attention, pre-norm blocks
//! whose feed-forward slot may route through a mixture of experts, a small
//! sigmoid score head over the `[START]` row, temperature/top-k sampling for
//! outreach drafting, and symmetric post-training quantization.
//!
//! Zero I/O: every call takes its inputs and an immutable model snapshot
//! explicitly.

pub mod attention;
pub mod batch;
pub mod block;
pub mod chronos;
pub mod config;
pub mod constants;
pub mod decode;
pub mod embed;
pub mod error;
pub mod matrix;
pub mod model;
pub mod norm;
pub mod profile;
pub mod quantize;
pub mod router;
pub mod sampler;
pub mod serde_compat;
pub mod signal;
pub mod time;
pub mod tokenizer;

pub use attention::{AttentionMask, AttentionOutput, MultiHeadAttention, scaled_dot_product_attention};
pub use batch::{BatchSummary, score_batch};
pub use block::{BlockOutput, FeedForward, FeedSublayer, TransformerBlock};
pub use chronos::{Chronos, positional_encoding};
pub use config::{ModelConfig, Pooling};
pub use decode::OutreachDecoder;
pub use embed::{Embedder, FeatureToken, cosine_similarity, euclidean_distance, nearest};
pub use error::{CoreError, Result};
pub use matrix::Matrix;
pub use model::{
    Draft, IntentLabel, LeadInput, LeadScout, ModelSnapshot, QuantizedSnapshot, ScoreHead, ScoreOutput, ScoreRequest,
    SignalRelevance,
};
pub use norm::{LayerNorm, LayerParams};
pub use profile::{LeadProfile, ProfileToken};
pub use quantize::{DegradationReport, Granularity, QuantizedTensor};
pub use router::{Router, RoutingDecision, Utilization};
pub use sampler::{Sampler, entropy};
pub use serde_compat::{CURRENT_VERSION, export_quantized, export_snapshot, import_snapshot};
pub use signal::{NumericFeature, RawSignal, SignalCategory, SignalKind, SignalRecord};
pub use tokenizer::{OutreachVocab, tokenize};

/// Alias matching the data-model name for one expert's parameters.
pub type ExpertWeights = FeedForward;
