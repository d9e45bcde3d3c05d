//! Data-preparation boundary. The core only relies on shapes and counts.

use anyhow::{ensure, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, values: Vec<f32>) -> Result<Self> {
        ensure!(rows * cols == values.len(), "matrix {rows}x{cols} needs {} values, got {}", rows * cols, values.len());
        Ok(Self { rows, cols, values })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        ensure!(rows.iter().all(|r| r.len() == cols), "ragged rows");
        Self::new(rows.len(), cols, rows.concat())
    }

    pub fn rows(&self) -> usize { self.rows }
    pub fn cols(&self) -> usize { self.cols }
    pub fn values(&self) -> &[f32] { &self.values }
    pub fn row(&self, i: usize) -> &[f32] { &self.values[i * self.cols..(i + 1) * self.cols] }
}

/// Ready-to-train arrays produced once per client process.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub train_features: Matrix,
    pub train_labels: Vec<f32>,
    pub test_features: Matrix,
    pub test_labels: Vec<f32>,
}

impl PreparedData {
    pub fn new(train_features: Matrix, train_labels: Vec<f32>, test_features: Matrix, test_labels: Vec<f32>) -> Result<Self> {
        ensure!(train_features.rows() == train_labels.len(), "train features/labels length mismatch");
        ensure!(test_features.rows() == test_labels.len(), "test features/labels length mismatch");
        ensure!(train_features.cols() == test_features.cols(), "train/test feature width mismatch");
        Ok(Self { train_features, train_labels, test_features, test_labels })
    }

    pub fn input_dim(&self) -> usize { self.train_features.cols() }
    pub fn train_len(&self) -> usize { self.train_labels.len() }
    pub fn test_len(&self) -> usize { self.test_labels.len() }
}

/// Produces a client's prepared data plus the fitted scaler, which stays opaque here.
pub trait DataPreparer {
    type Scaler;
    fn prepare(&self) -> Result<(PreparedData, Self::Scaler)>;
}
