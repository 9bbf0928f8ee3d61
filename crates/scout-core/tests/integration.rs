//! Integration tests exercising the full scoring pipeline:
//! signals → embed → chronos → blocks → pool → score, across module boundaries.

use rand::SeedableRng;
use rand::rngs::SmallRng;
use scout_core::{
    FeatureToken, Granularity, LeadInput, LeadScout, Matrix, ModelConfig, ModelSnapshot, NumericFeature, Pooling,
    ScoreRequest, SignalKind, SignalRecord, export_quantized, export_snapshot, import_snapshot, score_batch,
};

const NOW: i64 = 1_780_000_000;
const HOUR: i64 = 3600;

fn rng() -> SmallRng {
    SmallRng::seed_from_u64(42)
}

fn config() -> ModelConfig {
    ModelConfig {
        d_model: 8,
        n_heads: 2,
        n_layers: 2,
        ff_hidden: 16,
        n_experts: 0,
        max_seq_len: 16,
        ..Default::default()
    }
}

fn lead(ages_hours: [i64; 3]) -> ScoreRequest {
    ScoreRequest {
        profile: None,
        signals: vec![
            SignalRecord::new(SignalKind::FundingRound, NOW - ages_hours[0] * HOUR, 0.9)
                .unwrap()
                .with_feature(NumericFeature::FundingAmount, 8_000_000.0),
            SignalRecord::new(SignalKind::PricingPageVisit, NOW - ages_hours[1] * HOUR, 0.7)
                .unwrap()
                .with_feature(NumericFeature::PageViews, 4.0),
            SignalRecord::new(SignalKind::CompetitorEngagement, NOW - ages_hours[2] * HOUR, 0.5).unwrap(),
        ],
        reference_time: NOW,
    }
}

/// Identity blocks, mean pooling, non-negative embeddings and a head whose
/// hidden units stay active with positive weights: the score is then a
/// strictly increasing function of every signal's decay weight.
fn recency_model() -> LeadScout {
    let mut rng = rng();
    let cfg = ModelConfig {
        pooling: Pooling::Mean,
        head_hidden: 4,
        ..config()
    };
    let mut snapshot = ModelSnapshot::init(cfg, &mut rng).unwrap();
    for block in &mut snapshot.blocks {
        block.zero_sublayers();
    }
    snapshot.embedder.token_table = Matrix::uniform(FeatureToken::VOCAB_SIZE, 8, 0.0, 0.1, &mut rng);
    snapshot.embedder.numeric_proj = Matrix::uniform(NumericFeature::ALL.len(), 8, 0.0, 0.1, &mut rng);
    snapshot.head.w1 = Matrix::filled(8, 4, 0.1);
    // embeddings are non-negative and PE >= -1, so pooled · w1 > -1 and every
    // hidden unit stays on the linear side of the ReLU
    snapshot.head.b1 = vec![1.0; 4];
    snapshot.head.w2 = vec![0.1; 4];
    snapshot.head.b2 = -0.5;
    LeadScout::new(snapshot).unwrap()
}

#[test]
fn recent_signals_outscore_stale_ones() {
    let scout = recency_model();
    let fresh = scout.score(&lead([0, 5, 200])).unwrap();
    let stale = scout.score(&lead([200, 200, 200])).unwrap();
    assert!(
        fresh.score > stale.score,
        "fresh {} should beat stale {}",
        fresh.score,
        stale.score
    );
}

#[test]
fn zeroed_blocks_pass_the_encoding_through() {
    let scout = recency_model();
    let req = lead([0, 5, 200]);
    let encoded = scout.encode(&req).unwrap();
    let out = scout.score(&req).unwrap();
    let expected = encoded.matrix.mean_of_rows(encoded.matrix.rows());
    for (a, e) in out.pooled.iter().zip(&expected) {
        assert!((a - e).abs() < 1e-12);
    }

    let mut start = (**scout.snapshot()).clone();
    start.config.pooling = Pooling::Start;
    let out = LeadScout::new(start).unwrap().score(&req).unwrap();
    assert_eq!(out.pooled, encoded.matrix.row(0));
}

#[test]
fn start_row_carries_signals_through_attention() {
    // default pooling reads only [START]; signals reach it through attention
    let scout = LeadScout::new(ModelSnapshot::init(config(), &mut rng()).unwrap()).unwrap();
    let fresh = scout.score(&lead([0, 5, 200])).unwrap();
    let stale = scout.score(&lead([200, 200, 200])).unwrap();
    assert_ne!(fresh.score, stale.score);

    let mut identity = ModelSnapshot::init(config(), &mut rng()).unwrap();
    for block in &mut identity.blocks {
        block.zero_sublayers();
    }
    let identity = LeadScout::new(identity).unwrap();
    assert_eq!(
        identity.score(&lead([0, 5, 200])).unwrap().score,
        identity.score(&lead([200, 200, 200])).unwrap().score
    );
}

#[test]
fn attention_rows_are_distributions() {
    let cfg = ModelConfig {
        n_experts: 3,
        top_k_experts: 2,
        ..config()
    };
    let scout = LeadScout::new(ModelSnapshot::init(cfg, &mut rng()).unwrap()).unwrap();
    let out = scout.score(&lead([0, 5, 200])).unwrap();
    for layer in &out.attention {
        for r in 0..layer.rows() {
            let sum: f64 = layer.row(r).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }
    assert_eq!(out.relevance.len(), 3);
    assert!(out.relevance.iter().all(|r| r.relevance >= 0.0));
    assert!(out.relevance.iter().map(|r| r.relevance).sum::<f64>() > 0.0);
    assert!(out.utilization.max_share() > 0.0);
}

#[test]
fn snapshot_json_roundtrip_scores_identically() {
    let scout = LeadScout::new(ModelSnapshot::init(config(), &mut rng()).unwrap()).unwrap();
    let json = export_snapshot(scout.snapshot()).unwrap();
    let reloaded = LeadScout::new(import_snapshot(&json).unwrap()).unwrap();
    let req = lead([1, 30, 90]);
    assert_eq!(scout.score(&req).unwrap().score, reloaded.score(&req).unwrap().score);
}

#[test]
fn quantized_export_loads_as_the_served_model() {
    let scout = LeadScout::new(ModelSnapshot::init(config(), &mut rng()).unwrap()).unwrap();
    let quantized = scout.snapshot().quantize_weights(8, Granularity::PerChannel).unwrap();
    let json = export_quantized(&quantized).unwrap();

    let wire: serde_json::Value = serde_json::from_str(&json).unwrap();
    let codes = wire["quantized"][0]["codes"].as_array().unwrap();
    assert!(codes.iter().all(|c| c.as_i64().is_some_and(|c| (-127..=127).contains(&c))));
    assert_eq!(wire["snapshot"]["embedder"]["token_table"]["data"].as_array().unwrap().len(), 0);
    // integer codes take less text than the float snapshot
    assert!(json.len() < export_snapshot(scout.snapshot()).unwrap().len());

    let loaded = LeadScout::new(import_snapshot(&json).unwrap()).unwrap();
    let served = LeadScout::new(scout.snapshot().quantized(8, Granularity::PerChannel).unwrap()).unwrap();
    let req = lead([1, 30, 90]);
    assert_eq!(loaded.score(&req).unwrap().score, served.score(&req).unwrap().score);
    assert_eq!(loaded.config().quant_granularity, Granularity::PerChannel);
}

#[test]
fn quantized_model_stays_within_accuracy_tolerance() {
    let scout = LeadScout::new(ModelSnapshot::init(config(), &mut rng()).unwrap()).unwrap();
    let quantized = LeadScout::new(scout.snapshot().quantized(8, Granularity::PerChannel).unwrap()).unwrap();

    let requests: Vec<ScoreRequest> = (0..24)
        .map(|i| {
            let kinds = [SignalKind::ALL[i % 13], SignalKind::ALL[(i * 5 + 2) % 13], SignalKind::ALL[(i * 7 + 1) % 13]];
            ScoreRequest {
                profile: None,
                signals: kinds
                    .iter()
                    .enumerate()
                    .map(|(j, &k)| {
                        let age = ((i * 37 + j * 53) % 400) as i64;
                        SignalRecord::new(k, NOW - age * HOUR, ((i + j) % 10) as f64 / 10.0).unwrap()
                    })
                    .collect(),
                reference_time: NOW,
            }
        })
        .collect();

    // Labels are the float model's own decisions at the midpoint of the
    // widest gap between its scores.
    let mut scores: Vec<f64> = score_batch(&scout, &requests)
        .into_iter()
        .map(|r| r.unwrap().score)
        .collect();
    let labels_source = scores.clone();
    scores.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let (gap, threshold) = scores
        .windows(2)
        .map(|w| (w[1] - w[0], (w[0] + w[1]) / 2.0))
        .fold((0.0, 0.5), |best, cur| if cur.0 > best.0 { cur } else { best });

    let eval: Vec<(ScoreRequest, bool)> = requests
        .into_iter()
        .zip(labels_source.iter().map(|&s| s >= threshold))
        .collect();
    let report = scout.degradation(&quantized, &eval, threshold, Some(0.01)).unwrap();

    assert_eq!(report.float_accuracy, 1.0);
    assert!(report.max_score_delta < gap / 2.0, "{report:?}, gap {gap}");
    assert!(report.within_tolerance, "{report:?}");
}

#[test]
fn raw_lead_json_scores_end_to_end() {
    let lead: LeadInput = serde_json::from_str(
        r#"{
            "id": "acme-cto",
            "reference_time": "2026-03-10T12:00:00Z",
            "profile": {"months_in_role": 4, "funding_amount": 2500000, "own_views_1m": 40, "own_views_3m": 60},
            "signals": [
                {"kind": "funding_round", "timestamp": "2026-03-10T00:00:00Z", "strength": 0.9,
                 "features": {"funding_amount": 2500000}},
                {"kind": "pricing_page_visit", "timestamp": "2026-03-09T18:30:00+02:00", "strength": 0.8},
                {"kind": "competitor_engagement", "timestamp": "2026-02-01", "strength": 0.3}
            ]
        }"#,
    )
    .unwrap();
    let scout = LeadScout::new(ModelSnapshot::init(config(), &mut rng()).unwrap()).unwrap();
    let out = scout.score(&lead.to_request(0).unwrap()).unwrap();
    assert!(out.score > 0.0 && out.score < 1.0);
    assert_eq!(out.attention[0].shape(), (1 + 4 + 3, 1 + 4 + 3));
    assert_eq!(out.relevance[0].kind, SignalKind::CompetitorEngagement);
}
