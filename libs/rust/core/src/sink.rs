//! Best-effort observation sink (push-gateway style).
//!
//! Sink failures never reach the round state machine; callers go through
//! [`report_best_effort`], which bounds and logs every push.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, Registry, TextEncoder};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

use crate::telemetry::ROUND_METRICS;

pub type Labels = BTreeMap<String, String>;
pub type Values = BTreeMap<String, f64>;

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn report(&self, job: &str, labels: &Labels, values: &Values) -> Result<()>;
}

pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    async fn report(&self, _job: &str, _labels: &Labels, _values: &Values) -> Result<()> { Ok(()) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub job: String,
    pub labels: Labels,
    pub values: Values,
}

/// Keeps every report in memory, in arrival order.
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<Report>>,
}

impl RecordingSink {
    pub fn new() -> Self { Self::default() }
    pub fn reports(&self) -> Vec<Report> { self.reports.lock().clone() }
    pub fn reports_for(&self, job: &str) -> Vec<Report> { self.reports.lock().iter().filter(|r| r.job == job).cloned().collect() }
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn report(&self, job: &str, labels: &Labels, values: &Values) -> Result<()> {
        self.reports.lock().push(Report { job: job.to_string(), labels: labels.clone(), values: values.clone() });
        Ok(())
    }
}

/// Pushes gauges in the prometheus text format to a push gateway,
/// replacing the group identified by job + labels.
pub struct PushgatewaySink {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl PushgatewaySink {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let address = if address.contains("://") { address.to_string() } else { format!("http://{address}") };
        let base = reqwest::Url::parse(&address)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    pub fn grouping_url(&self, job: &str, labels: &Labels) -> Result<reqwest::Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| anyhow!("push gateway address `{}` cannot carry a path", self.base))?;
            segments.pop_if_empty().extend(["metrics", "job", job]);
            for (k, v) in labels { segments.push(k).push(v); }
        }
        Ok(url)
    }
}

/// Coerces an arbitrary observation name into a valid prometheus metric name.
pub fn metric_name(raw: &str) -> String {
    let mut name: String = raw.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' }).collect();
    if name.chars().next().map_or(true, |c| c.is_ascii_digit()) { name.insert(0, '_'); }
    name
}

fn encode_gauges(values: &Values) -> Result<(Vec<u8>, String)> {
    let registry = Registry::new();
    let mut seen = BTreeSet::new();
    for (name, value) in values {
        let sanitized = metric_name(name);
        // first observation in key order wins a sanitized-name collision
        if !seen.insert(sanitized.clone()) {
            warn!(observation = %name, metric = %sanitized, "duplicate metric name dropped");
            continue;
        }
        let gauge = Gauge::new(sanitized, name.clone())?;
        gauge.set(*value);
        registry.register(Box::new(gauge))?;
    }
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&registry.gather(), &mut buf)?;
    Ok((buf, encoder.format_type().to_string()))
}

#[async_trait]
impl MetricsSink for PushgatewaySink {
    async fn report(&self, job: &str, labels: &Labels, values: &Values) -> Result<()> {
        let url = self.grouping_url(job, labels)?;
        let (body, content_type) = encode_gauges(values)?;
        self.client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Pushes once, bounded by `timeout`; failures are logged and swallowed.
pub async fn report_best_effort(sink: &dyn MetricsSink, timeout: Duration, job: &str, labels: &Labels, values: &Values) -> bool {
    match tokio::time::timeout(timeout, sink.report(job, labels, values)).await {
        Ok(Ok(())) => { debug!(job, ?labels, observations = values.len(), "metrics_reported"); true }
        Ok(Err(e)) => { ROUND_METRICS.sink_failures.add(1, &[]); warn!(job, error = %e, "metrics sink report failed"); false }
        Err(_) => { ROUND_METRICS.sink_failures.add(1, &[]); warn!(job, ?timeout, "metrics sink report timed out"); false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HangingSink;

    #[async_trait]
    impl MetricsSink for HangingSink {
        async fn report(&self, _job: &str, _labels: &Labels, _values: &Values) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[test]
    fn metric_names_are_sanitized() {
        assert_eq!(metric_name("fl_accuracy"), "fl_accuracy");
        assert_eq!(metric_name("f1-macro score"), "f1_macro_score");
        assert_eq!(metric_name("1st"), "_1st");
        assert_eq!(metric_name(""), "_");
    }

    #[test]
    fn grouping_url_carries_job_and_labels() {
        let sink = PushgatewaySink::new("pushgateway:9091", Duration::from_secs(1)).unwrap();
        let mut labels = Labels::new();
        labels.insert("client_id".into(), "client 1".into());
        labels.insert("round".into(), "03".into());
        let url = sink.grouping_url("fl_client", &labels).unwrap();
        assert_eq!(url.as_str(), "http://pushgateway:9091/metrics/job/fl_client/client_id/client%201/round/03");
    }

    #[test]
    fn gauges_encode_as_text() {
        let mut values = Values::new();
        values.insert("fl_loss".into(), 0.25);
        let (body, content_type) = encode_gauges(&values).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("fl_loss 0.25"));
        assert!(content_type.starts_with("text/plain"));
    }

    #[test]
    fn colliding_names_keep_the_rest_of_the_push() {
        let mut values = Values::new();
        values.insert("fl_f1-macro".into(), 0.1);
        values.insert("fl_f1_macro".into(), 0.2);
        values.insert("fl_loss".into(), 0.25);
        let (body, _) = encode_gauges(&values).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.matches("# TYPE fl_f1_macro gauge").count(), 1);
        assert!(text.contains("fl_f1_macro 0.1"));
        assert!(text.contains("fl_loss 0.25"));
    }

    #[tokio::test]
    async fn recording_sink_keeps_reports() {
        let sink = RecordingSink::new();
        let mut values = Values::new();
        values.insert("fl_loss".into(), 0.5);
        assert!(report_best_effort(&sink, Duration::from_secs(1), "fl_server", &Labels::new(), &values).await);
        assert_eq!(sink.reports_for("fl_server").len(), 1);
        assert!(sink.reports_for("fl_client").is_empty());
    }

    #[tokio::test]
    async fn hanging_sink_is_bounded() {
        let ok = report_best_effort(&HangingSink, Duration::from_millis(10), "fl_server", &Labels::new(), &Values::new()).await;
        assert!(!ok);
    }
}
