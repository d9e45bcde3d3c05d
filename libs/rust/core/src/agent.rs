//! Client side of the round protocol.
//!
//! [`ClientProxy`] is what the coordinator talks to; [`ClientAgent`] is the
//! in-process implementation wrapping one [`LocalTrainer`] and its data.
//! Remote transports implement `ClientProxy` with the same contract.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::data::{Matrix, PreparedData};
use crate::error::FlError;
use crate::params::ParameterSet;
use crate::results::{round_label, ClientId, EvalResult, FitResult, Metrics, Round, RoundConfig};
use crate::sink::{report_best_effort, Labels, MetricsSink, Values};

pub struct TrainOutcome {
    pub parameters: ParameterSet,
    /// Training examples actually consumed; becomes the sample weight.
    pub num_examples: usize,
    pub metrics: Metrics,
}

pub struct ScoreOutcome {
    pub loss: f64,
    pub metrics: Metrics,
}

/// Opaque local model-update oracle. Implementations must not rely on
/// mutating the parameters they are handed.
pub trait LocalTrainer: Send + Sync + 'static {
    fn initial_parameters(&self, input_dim: usize) -> Result<ParameterSet>;
    fn train(&self, parameters: &ParameterSet, features: &Matrix, labels: &[f32], config: &RoundConfig) -> Result<TrainOutcome>;
    fn score(&self, parameters: &ParameterSet, features: &Matrix, labels: &[f32]) -> Result<ScoreOutcome>;
}

#[async_trait]
pub trait ClientProxy: Send + Sync {
    fn id(&self) -> &ClientId;
    async fn get_parameters(&self) -> Result<ParameterSet, FlError>;
    async fn fit(&self, parameters: ParameterSet, config: RoundConfig) -> Result<FitResult, FlError>;
    async fn evaluate(&self, parameters: ParameterSet, config: RoundConfig) -> Result<EvalResult, FlError>;
}

pub const CLIENT_JOB: &str = "fl_client";

pub struct ClientAgent<T: LocalTrainer> {
    id: ClientId,
    trainer: Arc<T>,
    data: Arc<PreparedData>,
    sink: Arc<dyn MetricsSink>,
    sink_timeout: std::time::Duration,
    last_logged_round: Mutex<Option<Round>>,
}

impl<T: LocalTrainer> ClientAgent<T> {
    pub fn new(id: ClientId, trainer: Arc<T>, data: Arc<PreparedData>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { id, trainer, data, sink, sink_timeout: std::time::Duration::from_secs(2), last_logged_round: Mutex::new(None) }
    }

    pub fn with_sink_timeout(mut self, timeout: std::time::Duration) -> Self { self.sink_timeout = timeout; self }

    fn training_error(&self, e: impl std::fmt::Display) -> FlError {
        FlError::LocalTraining { client: self.id.clone(), message: e.to_string() }
    }

    /// Runs `job` on the blocking pool with the trainer and data.
    async fn blocking<R, F>(&self, job: F) -> Result<R, FlError>
    where
        R: Send + 'static,
        F: FnOnce(&T, &PreparedData) -> Result<R> + Send + 'static,
    {
        let trainer = self.trainer.clone();
        let data = self.data.clone();
        match tokio::task::spawn_blocking(move || job(&trainer, &data)).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(self.training_error(format!("{e:#}"))),
            Err(join) => Err(self.training_error(join)),
        }
    }

    async fn push_client_metrics(&self, round: Round, score: &Metrics, training_secs: f64) {
        let mut labels = Labels::new();
        labels.insert("client_id".into(), self.id.to_string());
        labels.insert("round".into(), round_label(round));
        let mut values: Values = score.iter().map(|(k, v)| (format!("fl_client_{k}"), *v)).collect();
        values.insert("fl_client_training_time".into(), training_secs);
        report_best_effort(self.sink.as_ref(), self.sink_timeout, CLIENT_JOB, &labels, &values).await;
    }

    fn log_round_once(&self, round: Round, score: &Metrics) {
        let mut last = self.last_logged_round.lock();
        if *last == Some(round) { return; }
        *last = Some(round);
        let get = |k: &str| score.get(k).copied().unwrap_or(0.0);
        info!(client = %self.id, round, accuracy = get("accuracy"), f1_macro = get("f1_macro"), precision = get("precision"), recall = get("recall"), "local_round_complete");
    }
}

#[async_trait]
impl<T: LocalTrainer> ClientProxy for ClientAgent<T> {
    fn id(&self) -> &ClientId { &self.id }

    async fn get_parameters(&self) -> Result<ParameterSet, FlError> {
        self.blocking(|trainer, data| trainer.initial_parameters(data.input_dim())).await
    }

    async fn fit(&self, parameters: ParameterSet, config: RoundConfig) -> Result<FitResult, FlError> {
        debug!(client = %self.id, round = config.round, "fit_started");
        let (outcome, score, training_secs) = self.blocking(move |trainer, data| {
            let started = Instant::now();
            let outcome = trainer.train(&parameters, &data.train_features, &data.train_labels, &config)?;
            let training_secs = started.elapsed().as_secs_f64();
            let score = trainer.score(&outcome.parameters, &data.test_features, &data.test_labels)?;
            Ok((outcome, score, training_secs))
        }).await?;
        self.push_client_metrics(config.round, &score.metrics, training_secs).await;
        self.log_round_once(config.round, &score.metrics);
        FitResult::new(self.id.clone(), outcome.parameters, outcome.num_examples as u64, outcome.metrics)
    }

    async fn evaluate(&self, parameters: ParameterSet, config: RoundConfig) -> Result<EvalResult, FlError> {
        debug!(client = %self.id, round = config.round, "evaluate_started");
        let (score, examples) = self.blocking(move |trainer, data| {
            let score = trainer.score(&parameters, &data.test_features, &data.test_labels)?;
            Ok((score, data.test_len()))
        }).await?;
        EvalResult::new(self.id.clone(), score.loss, examples as u64, score.metrics)
    }
}
