//! Core of the federated round protocol: participant registry, round state
//! machine, weighted aggregation and the client-facing protocol contract.

pub mod agent;
pub mod aggregation;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod params;
pub mod registry;
pub mod resilience;
pub mod results;
pub mod sink;
pub mod telemetry;

pub use agent::{ClientAgent, ClientProxy, LocalTrainer, ScoreOutcome, TrainOutcome, CLIENT_JOB};
pub use aggregation::{weighted_mean, AggregationEngine, EvaluationAggregate, FedAvg, ParameterAggregate};
pub use self::config::{load_config, CoordinatorConfig};
pub use coordinator::{RoundCoordinator, RoundPhase, RoundSummary, RunSummary};
pub use data::{DataPreparer, Matrix, PreparedData};
pub use error::FlError;
pub use params::{ParameterSet, Tensor};
pub use registry::{ClientRegistry, SelectionPolicy};
pub use resilience::RetryConfig;
pub use results::{round_label, ClientId, EvalResult, FitResult, Metrics, Round, RoundConfig, Stage};
pub use sink::{report_best_effort, Labels, MetricsSink, NoopSink, PushgatewaySink, RecordingSink, Report, Values};
pub use telemetry::{init_tracing, ROUND_METRICS};
