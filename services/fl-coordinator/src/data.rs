//! Per-client tabular data: CSV files on disk, or synthetic partitions.

use anyhow::{ensure, Context, Result};
use fedround_core::{DataPreparer, Matrix, PreparedData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SPLIT_SEED: u64 = 42;
const TEST_FRACTION: f64 = 0.2;

/// Per-column median / interquartile-range scaling, fit on the training split.
#[derive(Debug, Clone, PartialEq)]
pub struct RobustScaler {
    pub center: Vec<f32>,
    pub scale: Vec<f32>,
}

fn quantile(sorted: &[f32], q: f64) -> f32 {
    if sorted.is_empty() { return 0.0; }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = (pos - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

impl RobustScaler {
    pub fn fit(x: &Matrix) -> Self {
        let mut center = Vec::with_capacity(x.cols());
        let mut scale = Vec::with_capacity(x.cols());
        for c in 0..x.cols() {
            let mut col: Vec<f32> = (0..x.rows()).map(|r| x.row(r)[c]).collect();
            col.sort_by(|a, b| a.total_cmp(b));
            center.push(quantile(&col, 0.5));
            let iqr = quantile(&col, 0.75) - quantile(&col, 0.25);
            scale.push(if iqr > f32::EPSILON { iqr } else { 1.0 });
        }
        Self { center, scale }
    }

    pub fn transform(&self, x: &Matrix) -> Result<Matrix> {
        ensure!(x.cols() == self.center.len(), "scaler fit on {} columns, got {}", self.center.len(), x.cols());
        let values = x.values().chunks(x.cols().max(1))
            .flat_map(|row| row.iter().zip(&self.center).zip(&self.scale).map(|((v, c), s)| (v - c) / s))
            .collect();
        Matrix::new(x.rows(), x.cols(), values)
    }
}

/// Shuffled split keeping each class's share on both sides: every class sends
/// `TEST_FRACTION` of its rows (at least one when it has two or more) to test.
pub fn stratified_split(labels: &[f32], seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: BTreeMap<bool, Vec<usize>> = BTreeMap::new();
    for (i, &y) in labels.iter().enumerate() {
        by_class.entry(y >= 0.5).or_default().push(i);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let (mut train, mut test) = (Vec::new(), Vec::new());
    for (_, mut idx) in by_class {
        idx.shuffle(&mut rng);
        let floor = if idx.len() > 1 { 1 } else { 0 };
        let n_test = ((idx.len() as f64 * TEST_FRACTION).round() as usize).clamp(floor, idx.len().saturating_sub(1));
        test.extend_from_slice(&idx[..n_test]);
        train.extend_from_slice(&idx[n_test..]);
    }
    train.shuffle(&mut rng);
    test.shuffle(&mut rng);
    (train, test)
}

/// Stratified split, then robust scaling fit on the training side only.
fn split_and_scale(rows: &[Vec<f32>], labels: &[f32]) -> Result<(PreparedData, RobustScaler)> {
    ensure!(rows.len() >= 5, "need at least 5 samples per client, got {}", rows.len());
    let (train_idx, test_idx) = stratified_split(labels, SPLIT_SEED);
    let pick = |idx: &[usize]| -> Result<(Matrix, Vec<f32>)> {
        let x: Vec<Vec<f32>> = idx.iter().map(|&i| rows[i].clone()).collect();
        Ok((Matrix::from_rows(&x)?, idx.iter().map(|&i| labels[i]).collect()))
    };
    let (train_x, train_y) = pick(&train_idx)?;
    let (test_x, test_y) = pick(&test_idx)?;

    let scaler = RobustScaler::fit(&train_x);
    let data = PreparedData::new(scaler.transform(&train_x)?, train_y, scaler.transform(&test_x)?, test_y)?;
    Ok((data, scaler))
}

/// A client's own CSV file: a header row, numeric columns, and a 0/1 label column.
#[derive(Debug, Clone)]
pub struct CsvPartition {
    pub path: PathBuf,
    pub label_column: String,
}

impl CsvPartition {
    /// `<dir>/<client_id>_data.csv`
    pub fn for_client(dir: &Path, client_id: &str, label_column: &str) -> Self {
        Self { path: dir.join(format!("{client_id}_data.csv")), label_column: label_column.to_string() }
    }

    fn read(&self) -> Result<(Vec<Vec<f32>>, Vec<f32>)> {
        let shown = self.path.display();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .with_context(|| format!("opening {shown}"))?;
        let headers = reader.headers()?.clone();
        let label_at = headers
            .iter()
            .position(|h| h == self.label_column)
            .with_context(|| format!("{shown}: no `{}` column", self.label_column))?;
        ensure!(headers.len() > 1, "{shown}: no feature columns besides `{}`", self.label_column);

        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("{shown}: malformed row {}", line + 1))?;
            let mut row = Vec::with_capacity(headers.len().saturating_sub(1));
            for (col, field) in record.iter().enumerate() {
                let value: f32 = field
                    .parse()
                    .with_context(|| format!("{shown}: row {}, column `{}`: `{field}` is not numeric", line + 1, &headers[col]))?;
                if col == label_at {
                    ensure!(value == 0.0 || value == 1.0, "{shown}: row {}: label must be 0 or 1, got {value}", line + 1);
                    labels.push(value);
                } else {
                    row.push(value);
                }
            }
            rows.push(row);
        }
        Ok((rows, labels))
    }
}

impl DataPreparer for CsvPartition {
    type Scaler = RobustScaler;

    fn prepare(&self) -> Result<(PreparedData, RobustScaler)> {
        let (rows, labels) = self.read()?;
        split_and_scale(&rows, &labels)
    }
}

/// One client's slice of a shared linearly separable problem with label noise.
/// Every client draws the same ground-truth direction from `seed`; its
/// features are shifted by the client index so partitions are not identical.
#[derive(Debug, Clone)]
pub struct SyntheticPartition {
    pub client_index: usize,
    pub samples: usize,
    pub features: usize,
    pub seed: u64,
}

impl SyntheticPartition {
    fn generate(&self) -> (Vec<Vec<f32>>, Vec<f32>) {
        let mut truth_rng = StdRng::seed_from_u64(self.seed);
        let direction: Vec<f32> = (0..self.features).map(|_| truth_rng.gen_range(-1.0..1.0)).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1 + self.client_index as u64));
        let shift = 0.25 * self.client_index as f32;
        let mut rows = Vec::with_capacity(self.samples);
        let mut labels = Vec::with_capacity(self.samples);
        for _ in 0..self.samples {
            let row: Vec<f32> = (0..self.features).map(|_| rng.gen_range(-2.0..2.0) + shift).collect();
            let margin: f32 = row.iter().zip(&direction).map(|(x, w)| (x - shift) * w).sum::<f32>() + rng.gen_range(-0.3..0.3);
            labels.push(if margin > 0.0 { 1.0 } else { 0.0 });
            rows.push(row);
        }
        (rows, labels)
    }
}

impl DataPreparer for SyntheticPartition {
    type Scaler = RobustScaler;

    fn prepare(&self) -> Result<(PreparedData, RobustScaler)> {
        ensure!(self.features > 0, "features must be positive");
        let (rows, labels) = self.generate();
        split_and_scale(&rows, &labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn partition(client_index: usize) -> SyntheticPartition {
        SyntheticPartition { client_index, samples: 100, features: 4, seed: 7 }
    }

    fn write_csv(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn patients(n: usize) -> String {
        let mut body = String::from("Age, BMI, Diagnosis\n");
        for i in 0..n {
            body.push_str(&format!("{}, {}.5, {}\n", 30 + i, 20 + i % 7, u8::from(i % 4 == 0)));
        }
        body
    }

    #[test]
    fn split_is_eighty_twenty() {
        let (data, scaler) = partition(0).prepare().unwrap();
        assert_eq!(data.train_len() + data.test_len(), 100);
        assert!((19..=21).contains(&data.test_len()), "test rows {}", data.test_len());
        assert_eq!(data.input_dim(), 4);
        assert_eq!(scaler.center.len(), 4);
    }

    #[test]
    fn split_preserves_class_balance() {
        // 30 positives, 70 negatives
        let labels: Vec<f32> = (0..100).map(|i| if i % 10 < 3 { 1.0 } else { 0.0 }).collect();
        let (train, test) = stratified_split(&labels, SPLIT_SEED);
        assert_eq!((train.len(), test.len()), (80, 20));
        assert_eq!(test.iter().filter(|&&i| labels[i] == 1.0).count(), 6);
        let mut all: Vec<usize> = train.iter().chain(&test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
        assert_eq!(stratified_split(&labels, SPLIT_SEED), (train, test));
    }

    #[test]
    fn rare_class_still_reaches_both_sides() {
        let mut labels = vec![0.0; 20];
        labels[3] = 1.0;
        labels[11] = 1.0;
        let (train, test) = stratified_split(&labels, SPLIT_SEED);
        assert_eq!(train.iter().filter(|&&i| labels[i] == 1.0).count(), 1);
        assert_eq!(test.iter().filter(|&&i| labels[i] == 1.0).count(), 1);
    }

    #[test]
    fn csv_partition_reads_label_column() {
        let dir = TempDir::new().unwrap();
        write_csv(&dir, "client1_data.csv", &patients(40));
        let p = CsvPartition::for_client(dir.path(), "client1", "Diagnosis");
        let (data, scaler) = p.prepare().unwrap();
        assert_eq!(data.input_dim(), 2);
        assert_eq!(scaler.center.len(), 2);
        assert_eq!((data.train_len(), data.test_len()), (32, 8));
        assert_eq!(data.test_labels.iter().filter(|&&y| y == 1.0).count(), 2);
    }

    #[test]
    fn csv_errors_name_the_problem() {
        let dir = TempDir::new().unwrap();
        let missing = CsvPartition { path: dir.path().join("absent.csv"), label_column: "Diagnosis".into() };
        assert!(missing.prepare().is_err());

        let path = write_csv(&dir, "nolabel.csv", "Age,BMI\n1,2\n");
        let err = CsvPartition { path, label_column: "Diagnosis".into() }.prepare().unwrap_err();
        assert!(format!("{err:#}").contains("no `Diagnosis` column"), "{err:#}");

        let path = write_csv(&dir, "text.csv", "Age,Diagnosis\n1,0\nold,1\n");
        let err = CsvPartition { path, label_column: "Diagnosis".into() }.prepare().unwrap_err();
        assert!(format!("{err:#}").contains("column `Age`"), "{err:#}");

        let path = write_csv(&dir, "labels.csv", "Age,Diagnosis\n1,2\n");
        assert!(CsvPartition { path, label_column: "Diagnosis".into() }.prepare().is_err());
    }

    #[test]
    fn preparation_is_deterministic_per_client() {
        let (a, _) = partition(1).prepare().unwrap();
        let (b, _) = partition(1).prepare().unwrap();
        let (c, _) = partition(2).prepare().unwrap();
        assert_eq!(a.train_features, b.train_features);
        assert_ne!(a.train_features, c.train_features);
    }

    #[test]
    fn scaled_training_columns_are_centered_on_median() {
        let (data, _) = partition(3).prepare().unwrap();
        let refit = RobustScaler::fit(&data.train_features);
        for (c, s) in refit.center.iter().zip(&refit.scale) {
            assert!(c.abs() < 1e-5, "median {c}");
            assert!((s - 1.0).abs() < 1e-4, "iqr {s}");
        }
    }

    #[test]
    fn constant_column_keeps_unit_scale() {
        let x = Matrix::from_rows(&[vec![3.0], vec![3.0], vec![3.0]]).unwrap();
        let scaler = RobustScaler::fit(&x);
        assert_eq!(scaler.scale, vec![1.0]);
        assert_eq!(scaler.transform(&x).unwrap().values(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn tiny_partitions_are_rejected() {
        let p = SyntheticPartition { samples: 2, ..partition(0) };
        assert!(p.prepare().is_err());
    }
}
