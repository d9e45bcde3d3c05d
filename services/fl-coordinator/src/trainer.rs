//! Logistic-regression local trainer: mini-batch SGD on log-loss.

use anyhow::{bail, ensure, Result};
use fedround_core::{LocalTrainer, Matrix, Metrics, ParameterSet, RoundConfig, ScoreOutcome, Tensor, TrainOutcome};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::scoring::classification_metrics;

const EPS: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self { Self { learning_rate: 0.1, batch_size: 32, seed: 0 } }
}

#[derive(Debug, Clone)]
pub struct LogisticTrainer {
    cfg: TrainerConfig,
}

fn sigmoid(z: f32) -> f32 { 1.0 / (1.0 + (-z).exp()) }

/// Splits `[weights, bias]`, checking both against the feature width.
fn unpack(parameters: &ParameterSet, input_dim: usize) -> Result<(&[f32], f32)> {
    let [weights, bias] = parameters.tensors() else {
        bail!("expected [weights, bias], got {} tensors", parameters.len());
    };
    ensure!(weights.len() == input_dim, "weights have {} values for {input_dim} features", weights.len());
    ensure!(bias.len() == 1, "bias must be a single value");
    Ok((weights.values(), bias.values()[0]))
}

fn predict(weights: &[f32], bias: f32, row: &[f32]) -> f32 {
    sigmoid(row.iter().zip(weights).map(|(x, w)| x * w).sum::<f32>() + bias)
}

pub fn log_loss(labels: &[f32], probabilities: &[f64]) -> f64 {
    if labels.is_empty() { return 0.0; }
    let total: f64 = labels.iter().zip(probabilities).map(|(&y, &p)| {
        let p = p.clamp(EPS, 1.0 - EPS);
        -(y as f64 * p.ln() + (1.0 - y as f64) * (1.0 - p).ln())
    }).sum();
    total / labels.len() as f64
}

impl LogisticTrainer {
    pub fn new(cfg: TrainerConfig) -> Result<Self> {
        ensure!(cfg.learning_rate > 0.0 && cfg.learning_rate.is_finite(), "learning_rate must be positive");
        ensure!(cfg.batch_size > 0, "batch_size must be positive");
        Ok(Self { cfg })
    }

    fn probabilities(&self, parameters: &ParameterSet, features: &Matrix) -> Result<Vec<f64>> {
        let (weights, bias) = unpack(parameters, features.cols())?;
        Ok((0..features.rows()).map(|r| predict(weights, bias, features.row(r)) as f64).collect())
    }
}

impl LocalTrainer for LogisticTrainer {
    fn initial_parameters(&self, input_dim: usize) -> Result<ParameterSet> {
        Ok(ParameterSet::new(vec![Tensor::vector(vec![0.0; input_dim]), Tensor::vector(vec![0.0])]))
    }

    fn train(&self, parameters: &ParameterSet, features: &Matrix, labels: &[f32], config: &RoundConfig) -> Result<TrainOutcome> {
        ensure!(features.rows() == labels.len(), "features/labels length mismatch");
        ensure!(!labels.is_empty(), "no training examples");
        let (weights, bias) = unpack(parameters, features.cols())?;
        let mut weights = weights.to_vec();
        let mut bias = bias;

        let mut rng = StdRng::seed_from_u64(self.cfg.seed ^ config.round);
        let mut order: Vec<usize> = (0..labels.len()).collect();
        let mut grad = vec![0.0f32; weights.len()];
        for _ in 0..config.local_epochs {
            order.shuffle(&mut rng);
            for batch in order.chunks(self.cfg.batch_size) {
                grad.iter_mut().for_each(|g| *g = 0.0);
                let mut grad_bias = 0.0;
                for &i in batch {
                    let row = features.row(i);
                    let err = predict(&weights, bias, row) - labels[i];
                    grad.iter_mut().zip(row).for_each(|(g, x)| *g += err * x);
                    grad_bias += err;
                }
                let step = self.cfg.learning_rate / batch.len() as f32;
                weights.iter_mut().zip(&grad).for_each(|(w, g)| *w -= step * g);
                bias -= step * grad_bias;
            }
        }
        if !weights.iter().all(|w| w.is_finite()) || !bias.is_finite() {
            bail!("training diverged");
        }

        let parameters = ParameterSet::new(vec![Tensor::vector(weights), Tensor::vector(vec![bias])]);
        let probabilities = self.probabilities(&parameters, features)?;
        let mut metrics = Metrics::new();
        metrics.insert("train_loss".into(), log_loss(labels, &probabilities));
        Ok(TrainOutcome { parameters, num_examples: labels.len(), metrics })
    }

    fn score(&self, parameters: &ParameterSet, features: &Matrix, labels: &[f32]) -> Result<ScoreOutcome> {
        ensure!(features.rows() == labels.len(), "features/labels length mismatch");
        let probabilities = self.probabilities(parameters, features)?;
        Ok(ScoreOutcome { loss: log_loss(labels, &probabilities), metrics: classification_metrics(labels, &probabilities) })
    }
}
