//! Layered configuration: defaults, optional file, `FEDROUND__*` environment.

use anyhow::{ensure, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::registry::SelectionPolicy;
use crate::resilience::RetryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub num_rounds: u64,
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    pub fraction_fit: Option<f64>,
    pub fraction_evaluate: Option<f64>,
    pub sampling_seed: Option<u64>,
    pub fit_timeout_ms: u64,
    pub evaluate_timeout_ms: u64,
    pub local_epochs: u32,
    /// Draw a fresh participant set for evaluation instead of reusing the fit set.
    pub reselect_for_evaluate: bool,
    /// Retries of a round whose selection is short of clients; 0 aborts the run.
    pub insufficient_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub job_name: String,
    pub sink_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            num_rounds: 30,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            fraction_fit: None,
            fraction_evaluate: None,
            sampling_seed: None,
            fit_timeout_ms: 600_000,
            evaluate_timeout_ms: 120_000,
            local_epochs: 1,
            reselect_for_evaluate: false,
            insufficient_retries: 0,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            job_name: "fl_server".into(),
            sink_timeout_ms: 2_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_rounds > 0, "num_rounds must be positive");
        ensure!(self.min_fit_clients > 0 && self.min_evaluate_clients > 0, "client minimums must be positive");
        for f in [self.fraction_fit, self.fraction_evaluate].into_iter().flatten() {
            ensure!(f > 0.0 && f <= 1.0, "sampling fraction {f} outside (0, 1]");
        }
        ensure!(self.fit_timeout_ms > 0 && self.evaluate_timeout_ms > 0, "call timeouts must be positive");
        ensure!(self.local_epochs > 0, "local_epochs must be positive");
        ensure!(!self.job_name.is_empty(), "job_name must not be empty");
        Ok(())
    }

    pub fn fit_policy(&self) -> SelectionPolicy { SelectionPolicy { fraction: self.fraction_fit, seed: self.sampling_seed } }
    pub fn evaluate_policy(&self) -> SelectionPolicy { SelectionPolicy { fraction: self.fraction_evaluate, seed: self.sampling_seed } }
    pub fn fit_timeout(&self) -> Duration { Duration::from_millis(self.fit_timeout_ms) }
    pub fn evaluate_timeout(&self) -> Duration { Duration::from_millis(self.evaluate_timeout_ms) }
    pub fn sink_timeout(&self) -> Duration { Duration::from_millis(self.sink_timeout_ms) }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.insufficient_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }
}

/// Builds `T` from defaults, `FEDROUND_CONFIG_FILE` (if set) and
/// `FEDROUND__SECTION__KEY` environment overrides, in that precedence order.
pub fn load_config<T: DeserializeOwned>(service: &str) -> Result<T> {
    let mut builder = ::config::Config::builder().set_default("service_name", service)?;
    if let Ok(file) = std::env::var("FEDROUND_CONFIG_FILE") {
        builder = builder.add_source(::config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(::config::Environment::with_prefix("FEDROUND").separator("__").try_parsing(true));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CoordinatorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_rounds, 30);
        assert_eq!(cfg.fit_policy(), SelectionPolicy::default());
    }

    #[test]
    fn rejects_bad_fraction_and_zero_rounds() {
        let cfg = CoordinatorConfig { fraction_fit: Some(1.5), ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = CoordinatorConfig { num_rounds: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let cfg: CoordinatorConfig = serde_json::from_str(r#"{"num_rounds": 3, "fraction_fit": 0.5}"#).unwrap();
        assert_eq!(cfg.num_rounds, 3);
        assert_eq!(cfg.fraction_fit, Some(0.5));
        assert_eq!(cfg.min_fit_clients, 2);
    }
}
