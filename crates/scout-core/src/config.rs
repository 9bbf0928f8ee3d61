use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_HALF_LIFE_HOURS, NORM_EPSILON};
use crate::error::{CoreError, Result};
use crate::quantize::{Granularity, qmax};
use crate::sampler::Sampler;

/// How the final block's rows collapse into the vector the score head reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    /// The `[START]` row, which gathers the sequence through attention.
    #[default]
    Start,
    /// Mean over every row.
    Mean,
}

/// Architecture and inference settings for one model snapshot.
///
/// Every field has a default so partial TOML/JSON files load cleanly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    /// Hidden width of each feed-forward network.
    pub ff_hidden: usize,
    /// 0 means dense feed-forward sublayers; otherwise every block routes.
    pub n_experts: usize,
    pub top_k_experts: usize,
    pub pooling: Pooling,
    /// Hidden width of the score head (`Linear → ReLU → Linear`).
    pub head_hidden: usize,
    /// Recency decay rate per hour.
    pub decay_lambda: f64,
    pub temperature: f64,
    pub top_k_sampling: Option<usize>,
    pub quant_bits: u8,
    pub quant_granularity: Granularity,
    /// Longest sequence (including `[START]` and profile tokens) a request may
    /// produce; oldest signals are dropped beyond it.
    pub max_seq_len: usize,
    pub norm_eps: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 32,
            n_heads: 4,
            n_layers: 2,
            ff_hidden: 64,
            n_experts: 4,
            top_k_experts: 2,
            pooling: Pooling::Start,
            head_hidden: 64,
            decay_lambda: std::f64::consts::LN_2 / DEFAULT_HALF_LIFE_HOURS,
            temperature: 0.8,
            top_k_sampling: Some(10),
            quant_bits: 8,
            quant_granularity: Granularity::PerChannel,
            max_seq_len: 64,
            norm_eps: NORM_EPSILON,
        }
    }
}

impl ModelConfig {
    /// Fail fast on any inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 {
            return Err(CoreError::InvalidConfig("d_model must be > 0".into()));
        }
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(CoreError::shape(
                "d_model / n_heads",
                format!("n_heads > 0 dividing d_model = {}", self.d_model),
                format!("n_heads = {}", self.n_heads),
            ));
        }
        if self.n_layers == 0 {
            return Err(CoreError::InvalidConfig("n_layers must be > 0".into()));
        }
        if self.ff_hidden == 0 {
            return Err(CoreError::InvalidConfig("ff_hidden must be > 0".into()));
        }
        if self.head_hidden == 0 {
            return Err(CoreError::InvalidConfig("head_hidden must be > 0".into()));
        }
        if self.n_experts > 0 && (self.top_k_experts == 0 || self.top_k_experts > self.n_experts) {
            return Err(CoreError::InvalidK {
                k: self.top_k_experts,
                max: self.n_experts,
            });
        }
        if !self.decay_lambda.is_finite() || self.decay_lambda < 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "decay_lambda must be finite and >= 0, got {}",
                self.decay_lambda
            )));
        }
        self.sampler()?;
        qmax(self.quant_bits)?;
        if self.max_seq_len < 2 {
            return Err(CoreError::InvalidConfig(format!(
                "max_seq_len must be >= 2, got {}",
                self.max_seq_len
            )));
        }
        if !self.norm_eps.is_finite() || self.norm_eps <= 0.0 {
            return Err(CoreError::InvalidConfig(format!("norm_eps must be > 0, got {}", self.norm_eps)));
        }
        Ok(())
    }

    pub fn sampler(&self) -> Result<Sampler> {
        Sampler::new(self.temperature, self.top_k_sampling)
    }

    pub fn uses_experts(&self) -> bool {
        self.n_experts > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_heads_must_divide_width() {
        let cfg = ModelConfig {
            d_model: 30,
            n_heads: 4,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(CoreError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_expert_k_checked() {
        let cfg = ModelConfig {
            n_experts: 2,
            top_k_experts: 3,
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err(), CoreError::InvalidK { k: 3, max: 2 });

        let dense = ModelConfig {
            n_experts: 0,
            top_k_experts: 0,
            ..Default::default()
        };
        assert!(dense.validate().is_ok());
        assert!(!dense.uses_experts());
    }

    #[test]
    fn test_sampling_settings_checked() {
        let cold = ModelConfig {
            temperature: 0.0,
            ..Default::default()
        };
        assert_eq!(cold.validate().unwrap_err(), CoreError::InvalidTemperature(0.0));
        let bad_bits = ModelConfig {
            quant_bits: 12,
            ..Default::default()
        };
        assert!(matches!(bad_bits.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_pooling_and_head_settings() {
        let cfg: ModelConfig = serde_json::from_str(r#"{"pooling": "mean", "head_hidden": 8}"#).unwrap();
        assert_eq!(cfg.pooling, Pooling::Mean);
        assert!(cfg.validate().is_ok());
        let no_head = ModelConfig {
            head_hidden: 0,
            ..Default::default()
        };
        assert!(matches!(no_head.validate(), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: ModelConfig = serde_json::from_str(r#"{"d_model": 16, "n_heads": 2}"#).unwrap();
        assert_eq!(cfg.d_model, 16);
        assert_eq!(cfg.n_layers, ModelConfig::default().n_layers);
        assert_eq!(cfg.pooling, Pooling::Start);
        assert!(cfg.validate().is_ok());
    }
}
