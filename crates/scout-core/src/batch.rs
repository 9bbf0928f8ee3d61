//! Batch scoring: independent requests scored in parallel.
//!
//! Requests share nothing but the read-only snapshot, so each one is a
//! separate rayon task. Results come back in request order; one request
//! failing does not affect the others.

use rayon::prelude::*;

use crate::error::Result;
use crate::model::{LeadScout, ScoreOutput, ScoreRequest};
use crate::router::Utilization;

pub fn score_batch(scout: &LeadScout, requests: &[ScoreRequest]) -> Vec<Result<ScoreOutput>> {
    if requests.is_empty() {
        return Vec::new();
    }
    let results: Vec<Result<ScoreOutput>> = requests.par_iter().map(|req| scout.score(req)).collect();

    let failed = results.iter().filter(|r| r.is_err()).count();
    tracing::info!(requests = requests.len(), failed, "batch scored");
    results
}

/// Aggregate view over a scored batch.
#[derive(Clone, Debug, Default)]
pub struct BatchSummary {
    pub scored: usize,
    pub failed: usize,
    pub mean_score: f64,
    pub utilization: Utilization,
}

impl BatchSummary {
    pub fn from_results(results: &[Result<ScoreOutput>]) -> Self {
        let mut summary = BatchSummary::default();
        let mut total = 0.0;
        for result in results {
            match result {
                Ok(out) => {
                    summary.scored += 1;
                    total += out.score;
                    summary.utilization.record(&out.utilization.counts);
                }
                Err(_) => summary.failed += 1,
            }
        }
        if summary.scored > 0 {
            summary.mean_score = total / summary.scored as f64;
        }
        summary
    }
}
