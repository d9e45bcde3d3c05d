//! Sample-weighted combination of client contributions.
//!
//! Every operation is a pure fold over its arguments: no state survives a
//! call, and identical inputs (in identical order) give identical outputs.

use std::collections::BTreeMap;

use crate::error::FlError;
use crate::params::{ParameterSet, Tensor};
use crate::results::{ClientId, EvalResult, FitResult, Metrics};

#[derive(Debug, Clone)]
pub struct ParameterAggregate {
    pub parameters: ParameterSet,
    pub contributors: Vec<ClientId>,
    pub num_examples: u64,
    /// Contributions left out, one `ShapeMismatch` each.
    pub excluded: Vec<FlError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationAggregate {
    pub loss: f64,
    pub metrics: Metrics,
    pub num_examples: u64,
    pub contributors: usize,
}

/// `Σ(wᵢ·vᵢ) / Σwᵢ`; zero total weight is an empty aggregation, never a silent zero.
pub fn weighted_mean(pairs: impl IntoIterator<Item = (u64, f64)>) -> Result<f64, FlError> {
    let (sum, weight) = pairs.into_iter().fold((0.0f64, 0u64), |(s, w), (wi, vi)| (s + wi as f64 * vi, w + wi));
    if weight == 0 { return Err(FlError::EmptyAggregation); }
    Ok(sum / weight as f64)
}

pub trait AggregationEngine: Send + Sync {
    /// Combines fit results into the next global parameter set. Contributions
    /// whose shapes differ from `reference` (the set broadcast this round) are
    /// excluded, the rest still aggregate.
    fn combine_parameters(&self, reference: &ParameterSet, results: &[FitResult]) -> Result<ParameterAggregate, FlError>;

    /// Per-name weighted mean over the contributors that reported that name.
    fn combine_metrics(&self, contributions: &[(u64, &Metrics)]) -> Result<Metrics, FlError>;

    fn combine_evaluation(&self, results: &[EvalResult]) -> Result<EvaluationAggregate, FlError> {
        if results.is_empty() { return Err(FlError::EmptyAggregation); }
        let loss = weighted_mean(results.iter().map(|r| (r.num_examples(), r.loss())))?;
        let contributions: Vec<(u64, &Metrics)> = results.iter().map(|r| (r.num_examples(), r.metrics())).collect();
        let metrics = self.combine_metrics(&contributions)?;
        Ok(EvaluationAggregate {
            loss,
            metrics,
            num_examples: results.iter().map(|r| r.num_examples()).sum(),
            contributors: results.len(),
        })
    }
}

/// Federated averaging.
#[derive(Debug, Clone, Copy, Default)]
pub struct FedAvg;

impl AggregationEngine for FedAvg {
    fn combine_parameters(&self, reference: &ParameterSet, results: &[FitResult]) -> Result<ParameterAggregate, FlError> {
        let mut valid: Vec<&FitResult> = Vec::with_capacity(results.len());
        let mut excluded = Vec::new();
        for r in results {
            match reference.shape_mismatch(r.parameters()) {
                None => valid.push(r),
                Some((position, expected, actual)) => excluded.push(FlError::ShapeMismatch { client: r.client_id().clone(), position, expected, actual }),
            }
        }
        if valid.is_empty() { return Err(FlError::EmptyAggregation); }

        let total: u64 = valid.iter().map(|r| r.num_examples()).sum();
        let mut tensors = Vec::with_capacity(reference.len());
        for (layer, shape) in reference.tensors().iter().map(|t| t.shape().to_vec()).enumerate() {
            let mut acc = vec![0f64; reference.tensors()[layer].len()];
            for r in &valid {
                let w = r.num_examples() as f64;
                for (a, v) in acc.iter_mut().zip(r.parameters().tensors()[layer].values()) { *a += w * *v as f64; }
            }
            let values = acc.into_iter().map(|a| (a / total as f64) as f32).collect();
            tensors.push(Tensor::new(shape, values)?);
        }

        Ok(ParameterAggregate {
            parameters: ParameterSet::new(tensors),
            contributors: valid.iter().map(|r| r.client_id().clone()).collect(),
            num_examples: total,
            excluded,
        })
    }

    fn combine_metrics(&self, contributions: &[(u64, &Metrics)]) -> Result<Metrics, FlError> {
        if contributions.is_empty() { return Err(FlError::EmptyAggregation); }
        let mut acc: BTreeMap<&str, (f64, u64)> = BTreeMap::new();
        for (weight, metrics) in contributions {
            for (name, value) in metrics.iter() {
                let slot = acc.entry(name.as_str()).or_insert((0.0, 0));
                slot.0 += *weight as f64 * value;
                slot.1 += weight;
            }
        }
        Ok(acc
            .into_iter()
            .filter(|(_, (_, w))| *w > 0)
            .map(|(name, (sum, w))| (name.to_string(), sum / w as f64))
            .collect())
    }
}
