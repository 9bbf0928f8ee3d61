//! Dense row-major `f64` matrix and the handful of kernels the network needs.
//!
//! Every layer is written against this type rather than a tensor library so
//! the forward pass stays deterministic and easy to step through. Shapes are
//! checked on every binary operation and reported as `ShapeMismatch`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMatrix", into = "WireMatrix")]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

/// Serialized form; checked against `rows * cols` on the way in.
#[derive(Serialize, Deserialize)]
struct WireMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl TryFrom<WireMatrix> for Matrix {
    type Error = CoreError;

    fn try_from(w: WireMatrix) -> Result<Self> {
        Matrix::from_vec(w.rows, w.cols, w.data)
    }
}

impl From<Matrix> for WireMatrix {
    fn from(m: Matrix) -> Self {
        WireMatrix {
            rows: m.rows,
            cols: m.cols,
            data: m.data,
        }
    }
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(CoreError::shape(
                "Matrix::from_vec",
                format!("{} elements ({rows}x{cols})", rows * cols),
                data.len(),
            ));
        }
        Ok(Self { rows, cols, data })
    }

    /// Stack equal-length rows. An empty slice yields a 0x0 matrix.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(CoreError::shape(
                    "Matrix::from_rows",
                    format!("{cols} columns"),
                    format!("{} in row {i}", row.len()),
                ));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub fn row_vector(values: Vec<f64>) -> Self {
        Self {
            rows: 1,
            cols: values.len(),
            data: values,
        }
    }

    /// Xavier/Glorot uniform init: U(-a, a), a = sqrt(6 / (fan_in + fan_out)).
    pub fn xavier_uniform(rows: usize, cols: usize, rng: &mut impl Rng) -> Self {
        let bound = (6.0 / (rows + cols).max(1) as f64).sqrt();
        Self::uniform(rows, cols, -bound, bound, rng)
    }

    pub fn uniform(rows: usize, cols: usize, low: f64, high: f64, rng: &mut impl Rng) -> Self {
        let data = (0..rows * cols)
            .map(|_| low + (high - low) * rng.random::<f64>())
            .collect();
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, value: f64) {
        self.data[r * self.cols + c] = value;
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f64] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn column(&self, c: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, c)).collect()
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        // chunks_exact(0) panics; a 0-column matrix has no meaningful rows anyway
        self.data.chunks_exact(self.cols.max(1)).take(self.rows)
    }

    /// `self (m×k) · other (k×n) → (m×n)`.
    pub fn matmul(&self, other: &Matrix) -> Result<Matrix> {
        if self.cols != other.rows {
            return Err(CoreError::shape(
                "matmul",
                format!("lhs cols == rhs rows ({})", self.cols),
                format!("rhs rows {}", other.rows),
            ));
        }
        let mut out = Matrix::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            let a_row = self.row(i);
            let out_row = &mut out.data[i * other.cols..(i + 1) * other.cols];
            // i-k-j order keeps the rhs row access contiguous
            for (k, &a) in a_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let b_row = &other.data[k * other.cols..(k + 1) * other.cols];
                for (o, &b) in out_row.iter_mut().zip(b_row) {
                    *o += a * b;
                }
            }
        }
        Ok(out)
    }

    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        out
    }

    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        self.zip_with("add", other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Matrix) -> Result<Matrix> {
        self.zip_with("sub", other, |a, b| a - b)
    }

    fn zip_with(&self, op: &'static str, other: &Matrix, f: impl Fn(f64, f64) -> f64) -> Result<Matrix> {
        if self.shape() != other.shape() {
            return Err(CoreError::shape(
                op,
                format!("{:?}", self.shape()),
                format!("{:?}", other.shape()),
            ));
        }
        let data = self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect();
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }

    /// Add `bias` to every row (bias length must equal `cols`).
    pub fn add_row_broadcast(&self, bias: &[f64]) -> Result<Matrix> {
        if bias.len() != self.cols {
            return Err(CoreError::shape("add_row_broadcast", self.cols, bias.len()));
        }
        let mut out = self.clone();
        for r in 0..out.rows {
            for (x, &b) in out.row_mut(r).iter_mut().zip(bias) {
                *x += b;
            }
        }
        Ok(out)
    }

    /// `x · W + b`, the affine map every projection in the network uses.
    pub fn affine(&self, weight: &Matrix, bias: &[f64]) -> Result<Matrix> {
        self.matmul(weight)?.add_row_broadcast(bias)
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    pub fn scale(&self, factor: f64) -> Matrix {
        self.map(|x| x * factor)
    }

    /// Columns `[start, start + len)` as a new matrix.
    pub fn slice_cols(&self, start: usize, len: usize) -> Result<Matrix> {
        if start + len > self.cols {
            return Err(CoreError::shape(
                "slice_cols",
                format!("end <= {}", self.cols),
                start + len,
            ));
        }
        let mut out = Matrix::zeros(self.rows, len);
        for r in 0..self.rows {
            out.row_mut(r)
                .copy_from_slice(&self.row(r)[start..start + len]);
        }
        Ok(out)
    }

    /// Concatenate matrices with equal row counts side by side.
    pub fn hstack(parts: &[Matrix]) -> Result<Matrix> {
        let rows = parts.first().map_or(0, |m| m.rows);
        if let Some(bad) = parts.iter().find(|m| m.rows != rows) {
            return Err(CoreError::shape("hstack", format!("{rows} rows"), bad.rows));
        }
        let cols = parts.iter().map(|m| m.cols).sum();
        let mut out = Matrix::zeros(rows, cols);
        for r in 0..rows {
            let mut offset = 0;
            for part in parts {
                out.row_mut(r)[offset..offset + part.cols].copy_from_slice(part.row(r));
                offset += part.cols;
            }
        }
        Ok(out)
    }

    /// Append one row (length must equal `cols`, or any length when empty).
    pub fn push_row(&mut self, row: &[f64]) -> Result<()> {
        if self.rows == 0 && self.data.is_empty() {
            self.cols = row.len();
        } else if row.len() != self.cols {
            return Err(CoreError::shape("push_row", self.cols, row.len()));
        }
        self.data.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    /// Mean of the first `n` rows, feature by feature.
    pub fn mean_of_rows(&self, n: usize) -> Vec<f64> {
        let n = n.min(self.rows);
        let mut acc = vec![0.0; self.cols];
        if n == 0 {
            return acc;
        }
        for row in self.iter_rows().take(n) {
            for (a, &x) in acc.iter_mut().zip(row) {
                *a += x;
            }
        }
        acc.iter_mut().for_each(|a| *a /= n as f64);
        acc
    }

    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0_f64, |m, x| m.max(x.abs()))
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }
}

/// Dot product over the shorter of the two slices.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean (L2) norm.
pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// In-place numerically stable softmax.
///
/// `-∞` entries come out as exactly 0. If every entry is `-∞` the row is
/// left all-zero rather than NaN.
pub fn softmax_in_place(row: &mut [f64]) {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        row.iter_mut().for_each(|x| *x = 0.0);
        return;
    }
    let mut sum = 0.0;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    // sum >= 1 because the max element contributes exp(0)
    row.iter_mut().for_each(|x| *x /= sum);
}

pub fn softmax(row: &[f64]) -> Vec<f64> {
    let mut out = row.to_vec();
    softmax_in_place(&mut out);
    out
}

pub fn relu(x: f64) -> f64 {
    x.max(0.0)
}

/// Logistic sigmoid with the input clamped to keep `exp` finite.
pub fn sigmoid(x: f64) -> f64 {
    let x = x.clamp(-crate::constants::SIGMOID_CLAMP, crate::constants::SIGMOID_CLAMP);
    1.0 / (1.0 + (-x).exp())
}

/// Indices of the `k` largest values, largest first. Ties go to the lower index.
pub fn top_k_indices(values: &[f64], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    idx.truncate(k);
    idx
}
