//! Per-client protocol payloads and their construction-time validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::FlError;
use crate::params::ParameterSet;

pub type Round = u64;
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage { Fit, Evaluate }

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Stage::Fit => "fit", Stage::Evaluate => "evaluate" })
    }
}

/// Configuration attached to every fit/evaluate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundConfig {
    pub round: Round,
    pub local_epochs: u32,
}

/// Zero-padded round label used when reporting observations.
pub fn round_label(round: Round) -> String { format!("{round:02}") }

fn check_weight(client: &ClientId, weight: u64) -> Result<(), FlError> {
    if weight == 0 { return Err(FlError::InvalidWeight { client: client.clone(), weight }); }
    Ok(())
}

fn check_metrics(client: &ClientId, metrics: &Metrics) -> Result<(), FlError> {
    match metrics.iter().find(|(_, v)| !v.is_finite()) {
        Some((name, value)) => Err(FlError::InvalidMetric { client: client.clone(), name: name.clone(), value: *value }),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    client_id: ClientId,
    parameters: ParameterSet,
    num_examples: u64,
    metrics: Metrics,
}

impl FitResult {
    pub fn new(client_id: ClientId, parameters: ParameterSet, num_examples: u64, metrics: Metrics) -> Result<Self, FlError> {
        check_weight(&client_id, num_examples)?;
        check_metrics(&client_id, &metrics)?;
        Ok(Self { client_id, parameters, num_examples, metrics })
    }

    pub fn client_id(&self) -> &ClientId { &self.client_id }
    pub fn parameters(&self) -> &ParameterSet { &self.parameters }
    pub fn num_examples(&self) -> u64 { self.num_examples }
    pub fn metrics(&self) -> &Metrics { &self.metrics }
}

#[derive(Debug, Clone)]
pub struct EvalResult {
    client_id: ClientId,
    loss: f64,
    num_examples: u64,
    metrics: Metrics,
}

impl EvalResult {
    pub fn new(client_id: ClientId, loss: f64, num_examples: u64, metrics: Metrics) -> Result<Self, FlError> {
        check_weight(&client_id, num_examples)?;
        if !loss.is_finite() {
            return Err(FlError::InvalidMetric { client: client_id, name: "loss".into(), value: loss });
        }
        check_metrics(&client_id, &metrics)?;
        Ok(Self { client_id, loss, num_examples, metrics })
    }

    pub fn client_id(&self) -> &ClientId { &self.client_id }
    pub fn loss(&self) -> f64 { self.loss }
    pub fn num_examples(&self) -> u64 { self.num_examples }
    pub fn metrics(&self) -> &Metrics { &self.metrics }
}
