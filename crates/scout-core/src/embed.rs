//! Signal embedder and vector similarity helpers.
//!
//! A signal's embedding is its kind's lookup row plus a learned projection of
//! its transformed numeric payload:
//!
//! `e = T[kind] + Σ_f transform_f(x_f) · P[f]`
//!
//! The transforms are fixed in code (`NumericFeature::transform`). Snapshots
//! carry the table they were trained against and are rejected on load if it
//! differs, so a drifted preprocessing step can't silently skew scores.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::matrix::{Matrix, dot, norm};
use crate::profile::ProfileToken;
use crate::signal::{FeatureTransform, NumericFeature, RawSignal, SignalKind, SignalRecord};

/// Categorical inputs with a row in the lookup table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FeatureToken {
    Start,
    Signal(SignalKind),
    Profile(ProfileToken),
}

impl FeatureToken {
    pub const VOCAB_SIZE: usize = 1 + SignalKind::ALL.len() + ProfileToken::COUNT;

    pub fn index(self) -> usize {
        match self {
            FeatureToken::Start => 0,
            FeatureToken::Signal(kind) => 1 + kind.index(),
            FeatureToken::Profile(token) => 1 + SignalKind::ALL.len() + token.index(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedder {
    /// `VOCAB_SIZE × d_model` lookup table.
    pub token_table: Matrix,
    /// `|NumericFeature| × d_model` projection of transformed numeric features.
    pub numeric_proj: Matrix,
    /// Transform table in force when the weights were produced.
    pub transforms: BTreeMap<NumericFeature, FeatureTransform>,
}

impl Embedder {
    pub fn init(d_model: usize, rng: &mut impl Rng) -> Self {
        Self {
            token_table: Matrix::xavier_uniform(FeatureToken::VOCAB_SIZE, d_model, rng),
            numeric_proj: Matrix::xavier_uniform(NumericFeature::ALL.len(), d_model, rng),
            transforms: NumericFeature::transform_table(),
        }
    }

    pub fn weights_mut(&mut self) -> Vec<&mut Matrix> {
        vec![&mut self.token_table, &mut self.numeric_proj]
    }

    pub fn d_model(&self) -> usize {
        self.token_table.cols()
    }

    /// Check table shapes against `d_model` and the transform table against the code.
    pub fn validate(&self, d_model: usize) -> Result<()> {
        let expected = (FeatureToken::VOCAB_SIZE, d_model);
        if self.token_table.shape() != expected {
            return Err(CoreError::shape(
                "embedder token table",
                format!("{expected:?}"),
                format!("{:?}", self.token_table.shape()),
            ));
        }
        let expected = (NumericFeature::ALL.len(), d_model);
        if self.numeric_proj.shape() != expected {
            return Err(CoreError::shape(
                "embedder numeric projection",
                format!("{expected:?}"),
                format!("{:?}", self.numeric_proj.shape()),
            ));
        }
        for feature in NumericFeature::ALL {
            let code = feature.transform();
            match self.transforms.get(&feature) {
                Some(&stored) if stored == code => {}
                other => {
                    return Err(CoreError::TransformMismatch {
                        feature: feature.as_str().to_string(),
                        expected: code.to_string(),
                        found: other.map_or("none".to_string(), |t| t.to_string()),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn embed_token(&self, token: FeatureToken) -> Vec<f64> {
        self.token_table.row(token.index()).to_vec()
    }

    pub fn embed_signal(&self, record: &SignalRecord) -> Vec<f64> {
        let mut e = self.embed_token(FeatureToken::Signal(record.kind));
        self.add_numeric(&mut e, NumericFeature::Strength, record.strength);
        for (&feature, &value) in &record.features {
            if feature != NumericFeature::Strength {
                self.add_numeric(&mut e, feature, value);
            }
        }
        e
    }

    /// Validate and embed a raw ingestion record in one step.
    pub fn embed_raw(&self, raw: &RawSignal) -> Result<Vec<f64>> {
        SignalRecord::from_raw(raw).map(|record| self.embed_signal(&record))
    }

    fn add_numeric(&self, e: &mut [f64], feature: NumericFeature, raw_value: f64) {
        let x = feature.transform().apply(raw_value);
        if x == 0.0 {
            return;
        }
        for (dst, &w) in e.iter_mut().zip(self.numeric_proj.row(feature.index())) {
            *dst += x * w;
        }
    }
}

/// `A·B / (‖A‖·‖B‖)`, clamped into `[-1, 1]`. Zero when either norm is zero.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let denom = norm(a) * norm(b);
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (dot(a, b) / denom).clamp(-1.0, 1.0)
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Index and similarity of the candidate most similar to `query`.
/// Ties keep the earlier candidate; `None` for an empty candidate set.
pub fn nearest<'a>(query: &[f64], candidates: impl IntoIterator<Item = &'a [f64]>) -> Option<(usize, f64)> {
    candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_similarity(query, c)))
        .fold(None, |best, (i, sim)| match best {
            Some((_, b)) if b >= sim => best,
            _ => Some((i, sim)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn embedder() -> Embedder {
        Embedder::init(8, &mut SmallRng::seed_from_u64(42))
    }

    #[test]
    fn test_token_indices_are_dense_and_unique() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        seen.insert(FeatureToken::Start.index());
        for kind in SignalKind::ALL {
            seen.insert(FeatureToken::Signal(kind).index());
        }
        for i in 0..ProfileToken::COUNT {
            seen.insert(1 + SignalKind::ALL.len() + i);
        }
        assert_eq!(seen.len(), FeatureToken::VOCAB_SIZE);
        assert_eq!(seen.iter().max(), Some(&(FeatureToken::VOCAB_SIZE - 1)));
    }

    #[test]
    fn test_embed_signal_dimension_and_determinism() {
        let emb = embedder();
        let rec = SignalRecord::new(SignalKind::FundingRound, 0, 0.9)
            .unwrap()
            .with_feature(NumericFeature::FundingAmount, 5_000_000.0);
        let a = emb.embed_signal(&rec);
        let b = emb.embed_signal(&rec);
        assert_eq!(a.len(), 8);
        assert_eq!(a, b);
    }

    #[test]
    fn test_numeric_transform_applied() {
        let emb = embedder();
        let base = SignalRecord::new(SignalKind::FundingRound, 0, 0.0).unwrap();
        let funded = base.clone().with_feature(NumericFeature::FundingAmount, 1_000_000.0);
        let diff: Vec<f64> = emb
            .embed_signal(&funded)
            .iter()
            .zip(emb.embed_signal(&base))
            .map(|(a, b)| a - b)
            .collect();
        let x = (1_000_000.0_f64).ln_1p();
        for (d, w) in diff.iter().zip(emb.numeric_proj.row(NumericFeature::FundingAmount.index())) {
            assert_relative_eq!(*d, x * w, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_embed_raw_unknown_kind() {
        let emb = embedder();
        let raw = RawSignal {
            kind: "telepathy".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            strength: 0.5,
            features: BTreeMap::new(),
        };
        assert!(matches!(emb.embed_raw(&raw), Err(CoreError::UnknownFeatureKind(_))));
    }

    #[test]
    fn test_validate_detects_transform_drift() {
        let mut emb = embedder();
        assert!(emb.validate(8).is_ok());
        emb.transforms
            .insert(NumericFeature::FundingAmount, FeatureTransform::Clamp01);
        assert!(matches!(
            emb.validate(8),
            Err(CoreError::TransformMismatch { feature, .. }) if feature == "funding_amount"
        ));
    }

    #[test]
    fn test_validate_detects_wrong_width() {
        assert!(matches!(embedder().validate(16), Err(CoreError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_cosine_zero_norm_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]), 0.0);
        assert_relative_eq!(cosine_similarity(&[1.0, 2.0], &[-2.0, -4.0]), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_euclidean_345() {
        assert_relative_eq!(euclidean_distance(&[0.0, 0.0, 0.0], &[3.0, 4.0, 0.0]), 5.0);
    }

    #[test]
    fn test_nearest() {
        let cands = [vec![1.0, 0.0], vec![0.7, 0.7], vec![0.0, 1.0]];
        let (idx, sim) = nearest(&[0.1, 1.0], cands.iter().map(Vec::as_slice)).unwrap();
        assert_eq!(idx, 2);
        assert!(sim > 0.99);
        assert!(nearest(&[1.0], std::iter::empty()).is_none());
    }

    proptest! {
        #[test]
        fn prop_cosine_in_range(
            a in prop::collection::vec(-1e3f64..1e3, 1..16),
            b in prop::collection::vec(-1e3f64..1e3, 1..16),
        ) {
            let s = cosine_similarity(&a, &b);
            prop_assert!((-1.0..=1.0).contains(&s));
        }

        #[test]
        fn prop_cosine_self_is_one(a in prop::collection::vec(-1e3f64..1e3, 1..16)) {
            prop_assume!(norm(&a) > 1e-6);
            prop_assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        }
    }
}
