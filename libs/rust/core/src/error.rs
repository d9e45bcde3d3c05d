//! Error taxonomy for the round protocol.
//!
//! Per-client variants are isolated by the coordinator and recorded as that
//! client's failure; round-level variants halt the round and are surfaced.

use std::time::Duration;
use thiserror::Error;

use crate::results::{ClientId, Round, Stage};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlError {
    #[error("insufficient clients: {available} registered, {required} required")]
    InsufficientClients { available: usize, required: usize },

    #[error("round {round}: no successful clients in {stage} phase ({failures} failed)")]
    NoSuccessfulClients { round: Round, stage: Stage, failures: usize },

    #[error("client {client}: tensor {position} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch { client: ClientId, position: usize, expected: Vec<usize>, actual: Vec<usize> },

    #[error("client {client}: invalid sample weight {weight}")]
    InvalidWeight { client: ClientId, weight: u64 },

    #[error("client {client}: metric `{name}` is not finite ({value})")]
    InvalidMetric { client: ClientId, name: String, value: f64 },

    #[error("client {client}: local training failed: {message}")]
    LocalTraining { client: ClientId, message: String },

    #[error("client {client}: no response within {timeout:?}")]
    Timeout { client: ClientId, timeout: Duration },

    #[error("client {client}: transport failure: {message}")]
    Transport { client: ClientId, message: String },

    #[error("nothing to aggregate: zero valid contributions")]
    EmptyAggregation,

    #[error("tensor shape {shape:?} needs {expected} values, got {actual}")]
    InvalidTensor { shape: Vec<usize>, expected: usize, actual: usize },

    #[error("round {round} cancelled")]
    Cancelled { round: Round },
}

impl FlError {
    /// Errors that only disqualify a single client's contribution.
    pub fn is_client_scoped(&self) -> bool {
        matches!(
            self,
            FlError::ShapeMismatch { .. }
                | FlError::InvalidWeight { .. }
                | FlError::InvalidMetric { .. }
                | FlError::LocalTraining { .. }
                | FlError::Timeout { .. }
                | FlError::Transport { .. }
        )
    }

    pub fn client(&self) -> Option<&ClientId> {
        match self {
            FlError::ShapeMismatch { client, .. }
            | FlError::InvalidWeight { client, .. }
            | FlError::InvalidMetric { client, .. }
            | FlError::LocalTraining { client, .. }
            | FlError::Timeout { client, .. }
            | FlError::Transport { client, .. } => Some(client),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_scoped_classification() {
        let client = ClientId::new("c1");
        assert!(FlError::Timeout { client: client.clone(), timeout: Duration::from_millis(5) }.is_client_scoped());
        assert!(FlError::LocalTraining { client, message: "oom".into() }.is_client_scoped());
        assert!(!FlError::EmptyAggregation.is_client_scoped());
        assert!(!FlError::InsufficientClients { available: 1, required: 2 }.is_client_scoped());
    }
}
