//! Symmetric post-training weight quantization.
//!
//! `s = max|W| / qmax`, `Q = clamp(round(W / s), -qmax, qmax)`, `W' = Q · s`
//! with `qmax = 2^(bits-1) - 1`. Rounding bounds the reconstruction error by
//! `s / 2` per element. Scales are either one per tensor or one per output
//! column (channel).

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_ACCURACY_TOLERANCE, EPSILON};
use crate::error::{CoreError, Result};
use crate::matrix::Matrix;

pub const MIN_BITS: u8 = 2;
pub const MAX_BITS: u8 = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    PerTensor,
    PerChannel,
}

impl std::str::FromStr for Granularity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "per_tensor" | "tensor" => Ok(Granularity::PerTensor),
            "per_channel" | "channel" => Ok(Granularity::PerChannel),
            other => Err(CoreError::InvalidConfig(format!("unknown quantization granularity {other:?}"))),
        }
    }
}

/// `2^(bits-1) - 1`, the largest representable magnitude.
pub fn qmax(bits: u8) -> Result<i32> {
    if !(MIN_BITS..=MAX_BITS).contains(&bits) {
        return Err(CoreError::InvalidConfig(format!(
            "quant_bits must be in {MIN_BITS}..={MAX_BITS}, got {bits}"
        )));
    }
    Ok((1i32 << (bits - 1)) - 1)
}

/// Integer codes plus scale factors for one weight matrix.
///
/// Codes are stored one per `i8` whatever the bit width. Deserialization
/// checks the code count, the scale count for the granularity, positive
/// finite scales and codes within `±qmax`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireQuantized", into = "WireQuantized")]
pub struct QuantizedTensor {
    rows: usize,
    cols: usize,
    bits: u8,
    granularity: Granularity,
    /// Row-major integer codes in `[-qmax, qmax]`.
    codes: Vec<i8>,
    /// One scale, or one per column for `PerChannel`.
    scales: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct WireQuantized {
    rows: usize,
    cols: usize,
    bits: u8,
    granularity: Granularity,
    codes: Vec<i8>,
    scales: Vec<f64>,
}

impl TryFrom<WireQuantized> for QuantizedTensor {
    type Error = CoreError;

    fn try_from(w: WireQuantized) -> Result<Self> {
        let qmax = qmax(w.bits)?;
        if w.codes.len() != w.rows * w.cols {
            return Err(CoreError::shape(
                "QuantizedTensor codes",
                format!("{} codes ({}x{})", w.rows * w.cols, w.rows, w.cols),
                w.codes.len(),
            ));
        }
        let expected_scales = match w.granularity {
            Granularity::PerTensor => 1,
            Granularity::PerChannel => w.cols,
        };
        if w.scales.len() != expected_scales {
            return Err(CoreError::shape(
                "QuantizedTensor scales",
                format!("{expected_scales} for {:?}", w.granularity),
                w.scales.len(),
            ));
        }
        if let Some(&s) = w.scales.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(CoreError::InvalidValue {
                field: "quantization scale".to_string(),
                value: s,
            });
        }
        if let Some(&q) = w.codes.iter().find(|q| i32::from(**q).abs() > qmax) {
            return Err(CoreError::InvalidValue {
                field: format!("{}-bit code", w.bits),
                value: f64::from(q),
            });
        }
        Ok(Self {
            rows: w.rows,
            cols: w.cols,
            bits: w.bits,
            granularity: w.granularity,
            codes: w.codes,
            scales: w.scales,
        })
    }
}

impl From<QuantizedTensor> for WireQuantized {
    fn from(q: QuantizedTensor) -> Self {
        WireQuantized {
            rows: q.rows,
            cols: q.cols,
            bits: q.bits,
            granularity: q.granularity,
            codes: q.codes,
            scales: q.scales,
        }
    }
}

impl QuantizedTensor {
    pub fn quantize(w: &Matrix, bits: u8, granularity: Granularity) -> Result<Self> {
        let qmax = qmax(bits)?;
        let scales = match granularity {
            Granularity::PerTensor => vec![scale_for(w.max_abs(), qmax)],
            Granularity::PerChannel => (0..w.cols())
                .map(|c| {
                    let peak = w.column(c).iter().fold(0.0_f64, |m, x| m.max(x.abs()));
                    scale_for(peak, qmax)
                })
                .collect(),
        };

        let mut codes = Vec::with_capacity(w.rows() * w.cols());
        for row in w.iter_rows() {
            for (c, &x) in row.iter().enumerate() {
                let s = scales[channel(granularity, c)];
                let q = (x / s).round().clamp(-qmax as f64, qmax as f64);
                codes.push(q as i8);
            }
        }

        Ok(Self {
            rows: w.rows(),
            cols: w.cols(),
            bits,
            granularity,
            codes,
            scales,
        })
    }

    pub fn dequantize(&self) -> Result<Matrix> {
        let data = self
            .codes
            .iter()
            .enumerate()
            .map(|(i, &q)| f64::from(q) * self.scale(i % self.cols.max(1)))
            .collect();
        Matrix::from_vec(self.rows, self.cols, data)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn codes(&self) -> &[i8] {
        &self.codes
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    /// Scale applied to column `col`.
    pub fn scale(&self, col: usize) -> f64 {
        self.scales[channel(self.granularity, col)]
    }

    /// Worst-case per-element reconstruction error, `max(s) / 2`.
    pub fn max_error_bound(&self) -> f64 {
        self.scales.iter().fold(0.0_f64, |m, &s| m.max(s)) / 2.0
    }

    /// Stored bytes relative to the `f64` matrix: one byte per code plus
    /// eight per scale. Codes below 8 bits are not packed, so the ratio
    /// does not shrink with `bits`.
    pub fn compression_ratio(&self) -> f64 {
        let n = self.codes.len();
        if n == 0 {
            return 1.0;
        }
        (n + 8 * self.scales.len()) as f64 / (8 * n) as f64
    }
}

fn scale_for(peak: f64, qmax: i32) -> f64 {
    if peak < EPSILON { 1.0 } else { peak / qmax as f64 }
}

fn channel(granularity: Granularity, col: usize) -> usize {
    match granularity {
        Granularity::PerTensor => 0,
        Granularity::PerChannel => col,
    }
}

/// Quantize and immediately dequantize, returning the servable float weights.
pub fn round_trip(w: &Matrix, bits: u8, granularity: Granularity) -> Result<Matrix> {
    QuantizedTensor::quantize(w, bits, granularity)?.dequantize()
}

/// Float vs quantized classification accuracy on a labelled evaluation set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DegradationReport {
    pub samples: usize,
    pub threshold: f64,
    pub float_accuracy: f64,
    pub quant_accuracy: f64,
    /// `float_accuracy - quant_accuracy`; negative when quantization helped.
    pub drop: f64,
    pub tolerance: f64,
    pub within_tolerance: bool,
    /// Largest absolute score difference across the set.
    pub max_score_delta: f64,
}

impl DegradationReport {
    /// Compare two score sets against `labels` at a decision `threshold`.
    pub fn evaluate(
        float_scores: &[f64],
        quant_scores: &[f64],
        labels: &[bool],
        threshold: f64,
        tolerance: Option<f64>,
    ) -> Result<Self> {
        let n = labels.len();
        if float_scores.len() != n || quant_scores.len() != n {
            return Err(CoreError::shape(
                "DegradationReport::evaluate",
                format!("{n} scores per model"),
                format!("{} float / {} quantized", float_scores.len(), quant_scores.len()),
            ));
        }
        if n == 0 {
            return Err(CoreError::EmptySequence);
        }
        let tolerance = tolerance.unwrap_or(DEFAULT_ACCURACY_TOLERANCE);
        let accuracy = |scores: &[f64]| {
            let hits = scores
                .iter()
                .zip(labels)
                .filter(|&(&s, &y)| (s >= threshold) == y)
                .count();
            hits as f64 / n as f64
        };
        let float_accuracy = accuracy(float_scores);
        let quant_accuracy = accuracy(quant_scores);
        let drop = float_accuracy - quant_accuracy;
        let max_score_delta = float_scores
            .iter()
            .zip(quant_scores)
            .fold(0.0_f64, |m, (a, b)| m.max((a - b).abs()));
        let within_tolerance = drop <= tolerance;

        if within_tolerance {
            tracing::info!(float_accuracy, quant_accuracy, drop, "quantization within tolerance");
        } else {
            tracing::warn!(float_accuracy, quant_accuracy, drop, tolerance, "quantization accuracy drop over tolerance");
        }

        Ok(Self {
            samples: n,
            threshold,
            float_accuracy,
            quant_accuracy,
            drop,
            tolerance,
            within_tolerance,
            max_score_delta,
        })
    }
}
