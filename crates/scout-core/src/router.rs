//! Mixture-of-experts router.
//!
//! A linear gate scores every expert, softmax turns the scores into a
//! distribution, the top-k experts run, and their outputs are mixed with the
//! gate probabilities renormalized over the selected subset. Experts are a
//! fixed array of feed-forward parameter sets indexed by the gate's choice.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::block::FeedForward;
use crate::error::{CoreError, Result};
use crate::matrix::{Matrix, dot, softmax, top_k_indices};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Router {
    /// `d_model × n_experts` gate projection.
    pub gate_w: Matrix,
    pub gate_b: Vec<f64>,
    pub experts: Vec<FeedForward>,
    pub top_k: usize,
}

/// Gate output for one token.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingDecision {
    /// Softmax over all experts; sums to 1.
    pub probs: Vec<f64>,
    /// `(expert index, renormalized weight)`, strongest first; weights sum to 1.
    pub selected: Vec<(usize, f64)>,
}

#[derive(Clone, Debug)]
pub struct RoutedOutput {
    pub output: Matrix,
    pub decisions: Vec<RoutingDecision>,
    /// Tokens dispatched to each expert during this pass.
    pub utilization: Vec<usize>,
}

impl Router {
    pub fn init(d_model: usize, hidden: usize, n_experts: usize, top_k: usize, rng: &mut impl Rng) -> Result<Self> {
        check_top_k(top_k, n_experts)?;
        Ok(Self {
            gate_w: Matrix::xavier_uniform(d_model, n_experts, rng),
            gate_b: vec![0.0; n_experts],
            experts: (0..n_experts)
                .map(|_| FeedForward::init(d_model, hidden, rng))
                .collect(),
            top_k,
        })
    }

    /// Gate and expert matrices.
    pub fn weights_mut(&mut self) -> Vec<&mut Matrix> {
        let mut out = vec![&mut self.gate_w];
        for expert in &mut self.experts {
            out.extend(expert.weights_mut());
        }
        out
    }

    pub fn n_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn validate(&self, d_model: usize) -> Result<()> {
        let n = self.n_experts();
        check_top_k(self.top_k, n)?;
        if self.gate_w.shape() != (d_model, n) {
            return Err(CoreError::shape(
                "router gate",
                format!("{:?}", (d_model, n)),
                format!("{:?}", self.gate_w.shape()),
            ));
        }
        if self.gate_b.len() != n {
            return Err(CoreError::shape("router gate bias", n, self.gate_b.len()));
        }
        self.experts.iter().try_for_each(|e| e.validate(d_model))
    }

    /// Gate distribution and top-k selection for a single token.
    pub fn route(&self, x: &[f64]) -> Result<RoutingDecision> {
        if x.len() != self.gate_w.rows() {
            return Err(CoreError::shape("Router::route", self.gate_w.rows(), x.len()));
        }
        let logits: Vec<f64> = (0..self.n_experts())
            .map(|e| self.gate_b[e] + dot(x, &self.gate_w.column(e)))
            .collect();
        let probs = softmax(&logits);

        let chosen = top_k_indices(&probs, self.top_k);
        let mass: f64 = chosen.iter().map(|&e| probs[e]).sum();
        let selected = chosen
            .into_iter()
            .map(|e| {
                // softmax never yields an all-zero row, but guard the split anyway
                let w = if mass > 0.0 { probs[e] / mass } else { 1.0 / self.top_k as f64 };
                (e, w)
            })
            .collect();

        Ok(RoutingDecision { probs, selected })
    }

    /// Route every row of `x` and mix the selected experts' outputs.
    pub fn forward(&self, x: &Matrix) -> Result<RoutedOutput> {
        let d_model = x.cols();
        let mut output = Matrix::zeros(x.rows(), d_model);
        let mut decisions = Vec::with_capacity(x.rows());
        let mut utilization = vec![0; self.n_experts()];

        for r in 0..x.rows() {
            let token = Matrix::row_vector(x.row(r).to_vec());
            let decision = self.route(x.row(r))?;
            for &(e, w) in &decision.selected {
                utilization[e] += 1;
                let y = self.experts[e].forward(&token)?;
                for (dst, &v) in output.row_mut(r).iter_mut().zip(y.row(0)) {
                    *dst += w * v;
                }
            }
            decisions.push(decision);
        }

        tracing::debug!(?utilization, tokens = x.rows(), "moe routing");
        Ok(RoutedOutput {
            output,
            decisions,
            utilization,
        })
    }
}

fn check_top_k(k: usize, n_experts: usize) -> Result<()> {
    if k == 0 || k > n_experts {
        return Err(CoreError::InvalidK { k, max: n_experts });
    }
    Ok(())
}

/// Summary of expert load across one or more forward passes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Utilization {
    pub counts: Vec<usize>,
}

impl Utilization {
    pub fn new(n_experts: usize) -> Self {
        Self {
            counts: vec![0; n_experts],
        }
    }

    pub fn record(&mut self, counts: &[usize]) {
        if self.counts.len() < counts.len() {
            self.counts.resize(counts.len(), 0);
        }
        for (acc, &c) in self.counts.iter_mut().zip(counts) {
            *acc += c;
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Share of dispatches taken by the busiest expert; 0 when nothing ran.
    pub fn max_share(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        *self.counts.iter().max().unwrap_or(&0) as f64 / total as f64
    }

    /// Number of experts that received at least one token.
    pub fn active_experts(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}
