//! Round orchestration.
//!
//! Phases: Idle -> SelectingClients -> FitPhase -> AggregatingFit ->
//! EvaluatePhase -> AggregatingEval -> RoundComplete -> (next round | Finished),
//! with Failed reachable from any phase.
//!
//! Rounds run strictly one after another. Inside a phase every selected client
//! is called concurrently with its own timeout and the phase joins on all
//! outcomes; per-client errors are recorded, never fatal on their own. The only
//! state that survives a round is the published parameter set and the count of
//! completed rounds.

use futures::stream::{FuturesUnordered, StreamExt};
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::ClientProxy;
use crate::aggregation::{AggregationEngine, EvaluationAggregate};
use crate::config::CoordinatorConfig;
use crate::error::FlError;
use crate::params::ParameterSet;
use crate::registry::{ClientRegistry, SelectionPolicy};
use crate::results::{round_label, ClientId, FitResult, Metrics, Round, RoundConfig, Stage};
use crate::sink::{report_best_effort, Labels, MetricsSink, Values};
use crate::telemetry::ROUND_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoundPhase {
    Idle,
    SelectingClients,
    FitPhase,
    AggregatingFit,
    EvaluatePhase,
    AggregatingEval,
    RoundComplete,
    Finished,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round: Round,
    /// Global parameters published by this round's fit aggregation.
    pub parameters: ParameterSet,
    pub fit_contributors: Vec<ClientId>,
    /// Failed calls plus contributions excluded at aggregation.
    pub fit_failures: Vec<(ClientId, FlError)>,
    pub fit_metrics: Metrics,
    pub fit_duration: Duration,
    pub evaluation: EvaluationAggregate,
    pub eval_failures: Vec<(ClientId, FlError)>,
    pub eval_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub rounds: Vec<RoundSummary>,
    pub parameters: ParameterSet,
}

struct CoordinatorState {
    phase: RoundPhase,
    completed: Round,
    parameters: Option<ParameterSet>,
}

struct Collected<T> {
    successes: Vec<T>,
    failures: Vec<(ClientId, FlError)>,
    cancelled: bool,
}

pub struct RoundCoordinator {
    cfg: CoordinatorConfig,
    registry: Arc<ClientRegistry>,
    engine: Arc<dyn AggregationEngine>,
    sink: Arc<dyn MetricsSink>,
    state: RwLock<CoordinatorState>,
    cancel: CancellationToken,
}

impl RoundCoordinator {
    pub fn new(cfg: CoordinatorConfig, registry: Arc<ClientRegistry>, engine: Arc<dyn AggregationEngine>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            cfg,
            registry,
            engine,
            sink,
            state: RwLock::new(CoordinatorState { phase: RoundPhase::Idle, completed: 0, parameters: None }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> RoundPhase { self.state.read().phase }
    pub fn completed_rounds(&self) -> Round { self.state.read().completed }
    pub fn parameters(&self) -> Option<ParameterSet> { self.state.read().parameters.clone() }
    pub fn registry(&self) -> &Arc<ClientRegistry> { &self.registry }

    /// Token that aborts the current round (and the run) when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken { self.cancel.clone() }
    pub fn cancel(&self) { self.cancel.cancel(); }

    fn set_phase(&self, phase: RoundPhase) {
        let mut st = self.state.write();
        if st.phase != phase {
            debug!(from = ?st.phase, to = ?phase, round = st.completed + 1, "phase_transition");
            st.phase = phase;
        }
    }

    fn fail(&self, round: Round, e: FlError) -> FlError {
        self.set_phase(RoundPhase::Failed);
        ROUND_METRICS.rounds_failed.add(1, &[]);
        error!(round, error = %e, "round_failed");
        e
    }

    /// Runs rounds until the configured budget is spent. A round-level error
    /// stops the run and is returned; no round is skipped.
    pub async fn run(&self, initial: Option<ParameterSet>) -> Result<RunSummary, FlError> {
        if let Some(p) = initial { self.state.write().parameters = Some(p); }
        let mut rounds = Vec::new();
        while self.completed_rounds() < self.cfg.num_rounds {
            rounds.push(self.run_round().await?);
        }
        self.set_phase(RoundPhase::Finished);
        let parameters = match rounds.last() {
            Some(r) => r.parameters.clone(),
            None => self.current_or_initial(self.completed_rounds()).await?,
        };
        info!(rounds = rounds.len(), "training_finished");
        Ok(RunSummary { rounds, parameters })
    }

    /// Executes the next round (completed + 1).
    pub async fn run_round(&self) -> Result<RoundSummary, FlError> {
        let round = self.completed_rounds() + 1;
        let params = self.current_or_initial(round).await?;
        match self.execute_round(round, params).await {
            Ok(summary) => {
                {
                    let mut st = self.state.write();
                    st.parameters = Some(summary.parameters.clone());
                    st.completed = round;
                }
                self.set_phase(RoundPhase::RoundComplete);
                ROUND_METRICS.rounds_completed.add(1, &[]);
                info!(
                    round,
                    loss = summary.evaluation.loss,
                    fit_clients = summary.fit_contributors.len(),
                    fit_failures = summary.fit_failures.len(),
                    eval_clients = summary.evaluation.contributors,
                    "round_complete"
                );
                Ok(summary)
            }
            Err(e) => Err(self.fail(round, e)),
        }
    }

    async fn current_or_initial(&self, round: Round) -> Result<ParameterSet, FlError> {
        if let Some(p) = self.parameters() { return Ok(p); }
        let p = self.fetch_initial_parameters().await.map_err(|e| self.fail(round, e))?;
        self.state.write().parameters = Some(p.clone());
        Ok(p)
    }

    /// Asks registered clients, in turn, for a starting parameter set.
    async fn fetch_initial_parameters(&self) -> Result<ParameterSet, FlError> {
        let clients = self.select_with_retry(0, 1, &SelectionPolicy::default()).await?;
        let timeout = self.cfg.fit_timeout();
        let mut last_err = None;
        for client in clients {
            match tokio::time::timeout(timeout, client.get_parameters()).await {
                Ok(Ok(p)) => {
                    info!(client = %client.id(), tensors = p.len(), "initial_parameters_received");
                    return Ok(p);
                }
                Ok(Err(e)) => { warn!(client = %client.id(), error = %e, "initial_parameters_failed"); last_err = Some(e); }
                Err(_) => last_err = Some(FlError::Timeout { client: client.id().clone(), timeout }),
            }
        }
        Err(last_err.unwrap_or(FlError::InsufficientClients { available: 0, required: 1 }))
    }

    async fn select_with_retry(&self, round: Round, minimum: usize, policy: &SelectionPolicy) -> Result<Vec<Arc<dyn ClientProxy>>, FlError> {
        let retry = self.cfg.retry();
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() { return Err(FlError::Cancelled { round }); }
            match self.registry.select(round, minimum, policy) {
                Ok(clients) => return Ok(clients),
                Err(e) if attempt >= retry.max_retries => return Err(e),
                Err(e) => {
                    let delay = retry.delay_for(attempt);
                    warn!(round, attempt, ?delay, error = %e, "selection_short_retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(FlError::Cancelled { round }),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Issues `call` to every client concurrently and joins on all outcomes.
    /// Cancellation drops whatever is still outstanding.
    async fn dispatch<T, F, Fut>(&self, round: Round, stage: Stage, clients: &[Arc<dyn ClientProxy>], timeout: Duration, call: F) -> Collected<T>
    where
        F: Fn(Arc<dyn ClientProxy>) -> Fut,
        Fut: Future<Output = Result<T, FlError>>,
    {
        let mut pending: FuturesUnordered<_> = clients
            .iter()
            .cloned()
            .map(|client| {
                let id = client.id().clone();
                let fut = call(client);
                async move {
                    let outcome = match tokio::time::timeout(timeout, fut).await {
                        Ok(r) => r,
                        Err(_) => Err(FlError::Timeout { client: id.clone(), timeout }),
                    };
                    (id, outcome)
                }
            })
            .collect();

        let mut collected = Collected { successes: Vec::new(), failures: Vec::new(), cancelled: false };
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!(round, %stage, outstanding = pending.len(), "phase_cancelled");
                    collected.cancelled = true;
                    break;
                }
                next = pending.next() => match next {
                    Some((_, Ok(v))) => collected.successes.push(v),
                    Some((id, Err(e))) => {
                        ROUND_METRICS.client_failures.add(1, &[KeyValue::new("stage", stage.to_string())]);
                        warn!(round, %stage, client = %id, error = %e, "client_call_failed");
                        collected.failures.push((id, e));
                    }
                    None => break,
                },
            }
        }
        collected
    }

    async fn report(&self, round: Round, values: Values) {
        let mut labels = Labels::new();
        labels.insert("round".into(), round_label(round));
        report_best_effort(self.sink.as_ref(), self.cfg.sink_timeout(), &self.cfg.job_name, &labels, &values).await;
    }

    async fn execute_round(&self, round: Round, params: ParameterSet) -> Result<RoundSummary, FlError> {
        self.set_phase(RoundPhase::SelectingClients);
        let fit_clients = self.select_with_retry(round, self.cfg.min_fit_clients, &self.cfg.fit_policy()).await?;
        let config = RoundConfig { round, local_epochs: self.cfg.local_epochs };

        // fit
        self.set_phase(RoundPhase::FitPhase);
        info!(round, participants = fit_clients.len(), "fit_phase_started");
        let started = Instant::now();
        let broadcast = params.clone();
        let fit = self
            .dispatch(round, Stage::Fit, &fit_clients, self.cfg.fit_timeout(), move |client| {
                let p = broadcast.clone();
                async move { client.fit(p, config).await }
            })
            .await;
        let fit_duration = started.elapsed();
        ROUND_METRICS.phase_duration_ms.record(fit_duration.as_secs_f64() * 1000.0, &[KeyValue::new("stage", "fit")]);
        if fit.successes.is_empty() {
            if fit.cancelled { return Err(FlError::Cancelled { round }); }
            return Err(FlError::NoSuccessfulClients { round, stage: Stage::Fit, failures: fit.failures.len() });
        }

        self.set_phase(RoundPhase::AggregatingFit);
        let mut successes: Vec<FitResult> = fit.successes;
        successes.sort_by(|a, b| a.client_id().cmp(b.client_id()));
        let agg_started = Instant::now();
        let aggregate = self.engine.combine_parameters(&params, &successes).map_err(|e| {
            if e == FlError::EmptyAggregation { warn!(round, submitted = successes.len(), "every fit contribution was excluded"); }
            e
        })?;
        let mut fit_failures = fit.failures;
        for e in aggregate.excluded {
            ROUND_METRICS.rejected_contributions.add(1, &[]);
            warn!(round, error = %e, "contribution_excluded");
            if let Some(client) = e.client().cloned() { fit_failures.push((client, e)); }
        }
        let contributions: Vec<(u64, &Metrics)> = successes
            .iter()
            .filter(|r| aggregate.contributors.contains(r.client_id()))
            .map(|r| (r.num_examples(), r.metrics()))
            .collect();
        let fit_metrics = self.engine.combine_metrics(&contributions)?;
        ROUND_METRICS.aggregation_latency_ms.record(agg_started.elapsed().as_secs_f64() * 1000.0, &[KeyValue::new("stage", "fit")]);

        // published only once the whole round succeeds, see run_round
        let parameters = aggregate.parameters;

        let mut values: Values = fit_metrics.iter().map(|(k, v)| (format!("fl_fit_{k}"), *v)).collect();
        values.insert("fl_rounds_total".into(), round as f64);
        values.insert("fl_connected_clients".into(), aggregate.contributors.len() as f64);
        values.insert("fl_round_duration_seconds".into(), fit_duration.as_secs_f64());
        self.report(round, values).await;

        if fit.cancelled {
            self.state.write().parameters = Some(parameters.clone());
            warn!(round, contributors = aggregate.contributors.len(), "cancelled after partial fit; partial aggregate retained");
            return Err(FlError::Cancelled { round });
        }

        // evaluate
        self.set_phase(RoundPhase::EvaluatePhase);
        let eval_clients = if self.cfg.reselect_for_evaluate {
            self.select_with_retry(round, self.cfg.min_evaluate_clients, &self.cfg.evaluate_policy()).await?
        } else {
            fit_clients
        };
        info!(round, participants = eval_clients.len(), "evaluate_phase_started");
        let started = Instant::now();
        let broadcast = parameters.clone();
        let eval = self
            .dispatch(round, Stage::Evaluate, &eval_clients, self.cfg.evaluate_timeout(), move |client| {
                let p = broadcast.clone();
                async move { client.evaluate(p, config).await }
            })
            .await;
        let eval_duration = started.elapsed();
        ROUND_METRICS.phase_duration_ms.record(eval_duration.as_secs_f64() * 1000.0, &[KeyValue::new("stage", "evaluate")]);
        if eval.successes.is_empty() {
            if eval.cancelled { return Err(FlError::Cancelled { round }); }
            return Err(FlError::NoSuccessfulClients { round, stage: Stage::Evaluate, failures: eval.failures.len() });
        }

        self.set_phase(RoundPhase::AggregatingEval);
        let mut results = eval.successes;
        results.sort_by(|a, b| a.client_id().cmp(b.client_id()));
        let agg_started = Instant::now();
        let evaluation = self.engine.combine_evaluation(&results)?;
        ROUND_METRICS.aggregation_latency_ms.record(agg_started.elapsed().as_secs_f64() * 1000.0, &[KeyValue::new("stage", "evaluate")]);

        let mut values: Values = evaluation.metrics.iter().map(|(k, v)| (format!("fl_{k}"), *v)).collect();
        values.insert("fl_loss".into(), evaluation.loss);
        values.insert("fl_evaluation_duration_seconds".into(), eval_duration.as_secs_f64());
        values.insert("fl_evaluation_clients".into(), evaluation.contributors as f64);
        self.report(round, values).await;

        if eval.cancelled {
            warn!(round, contributors = evaluation.contributors, "cancelled after partial evaluate");
            return Err(FlError::Cancelled { round });
        }

        Ok(RoundSummary {
            round,
            parameters,
            fit_contributors: aggregate.contributors,
            fit_failures,
            fit_metrics,
            fit_duration,
            evaluation,
            eval_failures: eval.failures,
            eval_duration,
        })
    }
}
