//! Process-local instrumentation: tracing subscriber setup and round counters.

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use tracing::info;

static ROUND_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedround_coordinator"));

pub struct RoundMetrics {
    pub rounds_completed: Counter<u64>,
    pub rounds_failed: Counter<u64>,
    pub client_failures: Counter<u64>,
    pub rejected_contributions: Counter<u64>,
    pub sink_failures: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub phase_duration_ms: Histogram<f64>,
}

pub static ROUND_METRICS: Lazy<RoundMetrics> = Lazy::new(|| RoundMetrics {
    rounds_completed: ROUND_METER.u64_counter("fedround_rounds_completed_total").with_description("Rounds that produced both fit and evaluate aggregates").build(),
    rounds_failed: ROUND_METER.u64_counter("fedround_rounds_failed_total").with_description("Rounds halted by a round-level error").build(),
    client_failures: ROUND_METER.u64_counter("fedround_client_failures_total").with_description("Client calls that errored or timed out").build(),
    rejected_contributions: ROUND_METER.u64_counter("fedround_rejected_contributions_total").with_description("Contributions excluded from aggregation").build(),
    sink_failures: ROUND_METER.u64_counter("fedround_sink_failures_total").with_description("Metrics sink pushes that failed or timed out").build(),
    aggregation_latency_ms: ROUND_METER.f64_histogram("fedround_aggregation_latency_ms").with_description("Aggregation latency ms").with_unit("ms").build(),
    phase_duration_ms: ROUND_METER.f64_histogram("fedround_phase_duration_ms").with_description("Wall-clock span of a fit or evaluate phase").with_unit("ms").build(),
});

/// Installs the fmt subscriber. `FEDROUND_JSON_LOG=1|true` switches to JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    let json = std::env::var("FEDROUND_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true);
    let res = if json {
        builder.json().flatten_event(true).with_current_span(true).try_init()
    } else {
        builder.with_line_number(true).try_init()
    };
    res.map_err(|e| anyhow!("tracing init failed: {e}"))?;
    info!(target: "fedround", %service, "tracing initialized");
    Ok(())
}
