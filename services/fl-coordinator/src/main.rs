//! Coordinator process hosting in-process client agents over synthetic data.

mod data;
mod scoring;
mod trainer;

use anyhow::{bail, ensure, Context, Result};
use fedround_core::{
    init_tracing, load_config, ClientAgent, ClientId, ClientRegistry, CoordinatorConfig, DataPreparer, FedAvg, MetricsSink,
    NoopSink, PushgatewaySink, RoundCoordinator,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::data::{CsvPartition, RobustScaler, SyntheticPartition};
use crate::trainer::{LogisticTrainer, TrainerConfig};

const SERVICE: &str = "fl-coordinator";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServiceConfig {
    coordinator: CoordinatorConfig,
    clients: Vec<String>,
    /// Directory holding `<client_id>_data.csv` per client; synthetic data when unset.
    dataset_dir: Option<PathBuf>,
    label_column: String,
    samples_per_client: usize,
    features: usize,
    data_seed: u64,
    /// Push metrics to a Prometheus pushgateway at this address when set.
    pushgateway_address: Option<String>,
    /// Final global parameters are written here as JSON when set.
    model_output: Option<PathBuf>,
    trainer: TrainerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            clients: vec!["client1".into(), "client2".into()],
            dataset_dir: None,
            label_column: "Diagnosis".into(),
            samples_per_client: 500,
            features: 8,
            data_seed: 7,
            pushgateway_address: None,
            model_output: None,
            trainer: TrainerConfig::default(),
        }
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<()> {
        self.coordinator.validate()?;
        ensure!(!self.clients.is_empty(), "at least one client id is required");
        ensure!(self.features > 0, "features must be positive");
        ensure!(!self.label_column.is_empty(), "label_column must not be empty");
        Ok(())
    }
}

fn build_sink(cfg: &ServiceConfig) -> Result<Arc<dyn MetricsSink>> {
    Ok(match &cfg.pushgateway_address {
        Some(addr) => {
            info!(%addr, "pushing metrics to gateway");
            Arc::new(PushgatewaySink::new(addr, cfg.coordinator.sink_timeout())?)
        }
        None => Arc::new(NoopSink),
    })
}

fn preparer(cfg: &ServiceConfig, index: usize, id: &str) -> Box<dyn DataPreparer<Scaler = RobustScaler>> {
    match &cfg.dataset_dir {
        Some(dir) => Box::new(CsvPartition::for_client(dir, id, &cfg.label_column)),
        None => Box::new(SyntheticPartition { client_index: index, samples: cfg.samples_per_client, features: cfg.features, seed: cfg.data_seed }),
    }
}

fn build_coordinator(cfg: &ServiceConfig, sink: Arc<dyn MetricsSink>) -> Result<RoundCoordinator> {
    let registry = Arc::new(ClientRegistry::new());
    let trainer = Arc::new(LogisticTrainer::new(cfg.trainer.clone())?);
    for (index, id) in cfg.clients.iter().enumerate() {
        let (data, _scaler) = preparer(cfg, index, id).prepare().with_context(|| format!("preparing data for {id}"))?;
        info!(client = %id, train = data.train_len(), test = data.test_len(), "client_data_prepared");
        let agent = ClientAgent::new(ClientId::new(id.clone()), trainer.clone(), Arc::new(data), sink.clone())
            .with_sink_timeout(cfg.coordinator.sink_timeout());
        if !registry.register(Arc::new(agent)) {
            bail!("duplicate client id `{id}`");
        }
    }
    Ok(RoundCoordinator::new(cfg.coordinator.clone(), registry, Arc::new(FedAvg), sink))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(SERVICE)?;
    let cfg: ServiceConfig = load_config(SERVICE)?;
    cfg.validate()?;
    info!(rounds = cfg.coordinator.num_rounds, clients = cfg.clients.len(), "starting federated training");

    let coordinator = build_coordinator(&cfg, build_sink(&cfg)?)?;
    let token = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling current round");
            token.cancel();
        }
    });

    let summary = coordinator.run(None).await?;
    if let Some(last) = summary.rounds.last() {
        info!(round = last.round, loss = last.evaluation.loss, accuracy = last.evaluation.metrics.get("accuracy").copied().unwrap_or_default(), "final_evaluation");
    }
    if let Some(path) = &cfg.model_output {
        std::fs::write(path, serde_json::to_vec_pretty(&summary.parameters)?).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "model_written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedround_core::{RecordingSink, RoundPhase, CLIENT_JOB};

    fn small() -> ServiceConfig {
        ServiceConfig {
            coordinator: CoordinatorConfig { num_rounds: 3, fit_timeout_ms: 10_000, evaluate_timeout_ms: 10_000, ..Default::default() },
            samples_per_client: 200,
            features: 4,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_validate() {
        ServiceConfig::default().validate().unwrap();
        let empty = ServiceConfig { clients: vec![], ..Default::default() };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn duplicate_client_ids_are_refused() {
        let cfg = ServiceConfig { clients: vec!["a".into(), "a".into()], ..small() };
        assert!(build_coordinator(&cfg, Arc::new(NoopSink)).is_err());
    }

    #[tokio::test]
    async fn clients_train_on_their_csv_files() {
        let dir = tempfile::TempDir::new().unwrap();
        for (k, id) in ["client1", "client2"].into_iter().enumerate() {
            let mut body = String::from("Glucose,BMI,Diagnosis\n");
            for i in 0..60 {
                let sick = (i + k) % 3 == 0;
                let glucose = if sick { 150 + i } else { 80 + i % 20 };
                body.push_str(&format!("{glucose},{},{}\n", 22 + i % 9, u8::from(sick)));
            }
            std::fs::write(dir.path().join(format!("{id}_data.csv")), body).unwrap();
        }
        let cfg = ServiceConfig { dataset_dir: Some(dir.path().to_path_buf()), ..small() };
        let run = build_coordinator(&cfg, Arc::new(NoopSink)).unwrap().run(None).await.unwrap();
        assert_eq!(run.parameters.shapes(), vec![vec![2], vec![1]]);
        assert_eq!(run.rounds[0].evaluation.num_examples, 2 * 12);
    }

    #[test]
    fn missing_csv_fails_startup() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = ServiceConfig { dataset_dir: Some(dir.path().to_path_buf()), ..small() };
        let err = build_coordinator(&cfg, Arc::new(NoopSink)).err().map(|e| format!("{e:#}"));
        assert!(err.is_some_and(|e| e.contains("client1")));
    }

    #[tokio::test]
    async fn federated_run_learns_and_reports() {
        let sink = Arc::new(RecordingSink::new());
        let coordinator = build_coordinator(&small(), sink.clone()).unwrap();
        let run = coordinator.run(None).await.unwrap();

        assert_eq!(run.rounds.len(), 3);
        assert_eq!(coordinator.phase(), RoundPhase::Finished);
        let first = run.rounds[0].evaluation.loss;
        let last = run.rounds[2].evaluation.loss;
        assert!(last < first, "{last} !< {first}");
        assert!(first < std::f64::consts::LN_2);
        assert!(run.rounds[2].evaluation.metrics["accuracy"] > 0.7);
        assert_eq!(run.parameters.shapes(), vec![vec![4], vec![1]]);

        assert_eq!(sink.reports_for(CLIENT_JOB).len(), 2 * 3);
        assert_eq!(sink.reports_for("fl_server").len(), 2 * 3);
    }
}
