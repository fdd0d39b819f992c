//! Span-derived RED metrics.
//!
//! The connector aggregates finished spans into a call counter and a duration
//! histogram per group (span name, status code and configured dimensions)
//! and emits the cumulative totals downstream every flush interval.

use crate::config::duration;
use crate::exporter::{Consumer, ConsumerBoxed, DeliveryError};
use crate::record::{unix_nanos_now, Batch, FlushReason, HistogramData, MetricPoint, Span};
use crate::task::BackgroundTask;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const SPAN_NAME_LABEL: &str = "span_name";
pub const STATUS_CODE_LABEL: &str = "status_code";

/// A span attribute copied onto the derived metrics as a label.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "DimensionRepr")]
pub struct Dimension {
    pub name: String,
    /// Used when the span lacks the attribute; without it the label is omitted
    pub default: Option<String>,
}

impl Dimension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DimensionRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl From<DimensionRepr> for Dimension {
    fn from(repr: DimensionRepr) -> Self {
        match repr {
            DimensionRepr::Name(name) => Self::new(name),
            DimensionRepr::Full { name, default } => Self { name, default },
        }
    }
}

/// Configuration for a `spanmetrics` stage
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpanMetricsConfig {
    /// Duration histogram boundaries
    #[serde(deserialize_with = "duration::deserialize_list")]
    pub buckets: Vec<Duration>,
    pub dimensions: Vec<Dimension>,
    /// Prefix for emitted metric names (`<namespace>_calls_total`)
    pub namespace: Option<String>,
    #[serde(deserialize_with = "duration::deserialize")]
    pub metrics_flush_interval: Duration,
}

impl Default for SpanMetricsConfig {
    fn default() -> Self {
        Self {
            buckets: [250, 500, 750, 1000, 3000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            dimensions: Vec::new(),
            namespace: None,
            metrics_flush_interval: Duration::from_secs(15),
        }
    }
}

impl SpanMetricsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err("buckets must be strictly ascending".into());
        }
        if self.metrics_flush_interval.is_zero() {
            return Err("metrics_flush_interval must be greater than zero".into());
        }
        let mut seen = HashSet::new();
        for dimension in &self.dimensions {
            if dimension.name.is_empty() {
                return Err("dimension name must not be empty".into());
            }
            if dimension.name == SPAN_NAME_LABEL || dimension.name == STATUS_CODE_LABEL {
                return Err(format!("dimension '{}' is a reserved label", dimension.name));
            }
            if !seen.insert(dimension.name.as_str()) {
                return Err(format!("dimension '{}' listed twice", dimension.name));
            }
        }
        Ok(())
    }

    /// Bucket boundaries in milliseconds.
    pub fn boundaries_ms(&self) -> Vec<f64> {
        self.buckets.iter().map(|b| nanos_to_ms(b.as_nanos() as u64)).collect()
    }
}

fn nanos_to_ms(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000.0
}

struct GroupState {
    calls: u64,
    duration: HistogramData,
}

/// Cumulative per-group state, independent of any runtime.
pub struct Aggregator {
    boundaries_ms: Vec<f64>,
    dimensions: Vec<Dimension>,
    calls_name: String,
    duration_name: String,
    groups: BTreeMap<BTreeMap<String, String>, GroupState>,
}

impl Aggregator {
    pub fn new(config: &SpanMetricsConfig) -> Self {
        let prefixed = |base: &str| match &config.namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}_{base}"),
            _ => base.to_string(),
        };
        Self {
            boundaries_ms: config.boundaries_ms(),
            dimensions: config.dimensions.clone(),
            calls_name: prefixed("calls_total"),
            duration_name: prefixed("duration"),
            groups: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, span: &Span) {
        let labels = self.labels(span);
        let boundaries = &self.boundaries_ms;
        let group = self.groups.entry(labels).or_insert_with(|| GroupState {
            calls: 0,
            duration: HistogramData::new(boundaries.clone()),
        });
        group.calls += 1;
        group.duration.record(nanos_to_ms(span.duration_nanos()));
    }

    fn labels(&self, span: &Span) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(SPAN_NAME_LABEL.to_string(), span.name.clone());
        labels.insert(STATUS_CODE_LABEL.to_string(), span.status.as_label().to_string());
        for dimension in &self.dimensions {
            let value = span
                .attributes
                .get(&dimension.name)
                .map(ToString::to_string)
                .or_else(|| dimension.default.clone());
            if let Some(value) = value {
                labels.insert(dimension.name.clone(), value);
            }
        }
        labels
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// One counter and one histogram point per group, with cumulative totals.
    pub fn snapshot(&self, timestamp: u64) -> Vec<MetricPoint> {
        let mut points = Vec::with_capacity(self.groups.len() * 2);
        for (labels, group) in &self.groups {
            points.push(
                MetricPoint::counter(&self.calls_name, group.calls as f64)
                    .with_attributes(labels.clone())
                    .with_timestamp(timestamp),
            );
            points.push(
                MetricPoint::histogram(&self.duration_name, group.duration.clone())
                    .with_attributes(labels.clone())
                    .with_timestamp(timestamp),
            );
        }
        points
    }
}

/// Connector stage turning spans into metric points.
pub struct SpanMetricsConnector {
    name: String,
    aggregator: Arc<Mutex<Aggregator>>,
    spans_received: AtomicU64,
    flush_task: BackgroundTask,
}

impl SpanMetricsConnector {
    /// Starts the connector's flush task. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        name: impl Into<String>,
        config: &SpanMetricsConfig,
        downstream: Arc<dyn ConsumerBoxed>,
    ) -> Self {
        let name = name.into();
        let aggregator = Arc::new(Mutex::new(Aggregator::new(config)));
        let emitter = Emitter {
            stage: name.clone(),
            aggregator: Arc::clone(&aggregator),
            downstream,
            sequence: 0,
        };
        let period = config.metrics_flush_interval;
        let flush_task = BackgroundTask::spawn(move |shutdown_rx| emitter.run(period, shutdown_rx));

        Self {
            name,
            aggregator,
            spans_received: AtomicU64::new(0),
            flush_task,
        }
    }

    pub fn spans_received(&self) -> u64 {
        self.spans_received.load(Ordering::Relaxed)
    }

    pub fn group_count(&self) -> usize {
        lock(&self.aggregator).group_count()
    }

    /// Stops the flush loop after a final emission.
    pub async fn shutdown(&self) {
        self.flush_task.stop(&self.name).await;
    }
}

fn lock(aggregator: &Mutex<Aggregator>) -> MutexGuard<'_, Aggregator> {
    aggregator.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Consumer for SpanMetricsConnector {
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        let mut received = 0u64;
        {
            let mut aggregator = lock(&self.aggregator);
            for span in batch.spans() {
                aggregator.record(span);
                received += 1;
            }
        }
        self.spans_received.fetch_add(received, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Emitter {
    stage: String,
    aggregator: Arc<Mutex<Aggregator>>,
    downstream: Arc<dyn ConsumerBoxed>,
    sequence: u64,
}

impl Emitter {
    async fn run(mut self, period: Duration, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,

                _ = ticker.tick() => self.emit(FlushReason::Time).await,
            }
        }

        self.emit(FlushReason::Shutdown).await;
    }

    async fn emit(&mut self, reason: FlushReason) {
        let points = lock(&self.aggregator).snapshot(unix_nanos_now());
        if points.is_empty() {
            return;
        }

        self.sequence += 1;
        let batch = Batch::new(points.into_iter().map(Into::into).collect(), reason)
            .with_sequence(self.sequence);
        tracing::debug!(stage = %self.stage, points = batch.len(), %reason, "Emitting span metrics");
        if let Err(e) = self.downstream.consume_boxed(batch).await {
            tracing::warn!(stage = %self.stage, error = %e, "Span metrics delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::testing::RecordingConsumer;
    use crate::record::SpanStatus;

    fn finished(name: &str, millis: u64, status: SpanStatus) -> Span {
        Span::new(1, 1, name)
            .with_times(1_000_000_000, 1_000_000_000 + millis * 1_000_000)
            .with_status(status)
    }

    #[test]
    fn test_600ms_span_lands_in_750_bucket() {
        let mut aggregator = Aggregator::new(&SpanMetricsConfig::default());
        aggregator.record(&finished("checkout", 600, SpanStatus::Ok));

        let points = aggregator.snapshot(42);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].name, "calls_total");
        assert_eq!(points[0].as_counter(), Some(1.0));

        let histogram = points[1].as_histogram().unwrap();
        assert_eq!(histogram.boundaries, vec![250.0, 500.0, 750.0, 1000.0, 3000.0]);
        assert_eq!(histogram.bucket_counts, vec![0, 0, 1, 1, 1, 1]);
        assert_eq!(histogram.count, 1);
        assert_eq!(histogram.sum, 600.0);
        assert_eq!(points[1].attributes[STATUS_CODE_LABEL], "STATUS_CODE_OK");
        assert_eq!(points[1].timestamp, 42);
    }

    #[test]
    fn test_histogram_point_carries_derived_series() {
        let mut aggregator = Aggregator::new(&SpanMetricsConfig::default());
        aggregator.record(&finished("checkout", 600, SpanStatus::Ok));
        aggregator.record(&finished("checkout", 100, SpanStatus::Ok));
        let points = aggregator.snapshot(42_000_000);

        // Push sinks see bucket counts, count and sum on the one point.
        let json = serde_json::to_value(&points[1]).unwrap();
        let histogram = &json["value"]["histogram"];
        assert_eq!(histogram["bucket_counts"], serde_json::json!([1, 1, 2, 2, 2, 2]));
        assert_eq!(histogram["count"], 2);
        assert_eq!(histogram["sum"], 700.0);

        // Pull exposition writes them as three series.
        let text = crate::exposition::render(&points).unwrap();
        let group = r#"span_name="checkout",status_code="STATUS_CODE_OK""#;
        for series in ["duration_bucket", "duration_count", "duration_sum"] {
            assert!(text.contains(&format!("{series}{{{group}")), "missing {series}");
        }
        assert!(text.contains(&format!(r#"duration_bucket{{{group},le="250"}} 1"#)));
        assert!(text.contains(&format!("duration_count{{{group}}} 2")));
    }

    #[test]
    fn test_groups_by_name_and_status() {
        let mut aggregator = Aggregator::new(&SpanMetricsConfig::default());
        aggregator.record(&finished("checkout", 10, SpanStatus::Ok));
        aggregator.record(&finished("checkout", 20, SpanStatus::Ok));
        aggregator.record(&finished("checkout", 30, SpanStatus::Error));
        aggregator.record(&finished("login", 30, SpanStatus::Unset));
        assert_eq!(aggregator.group_count(), 3);

        let points = aggregator.snapshot(0);
        let ok_calls = points
            .iter()
            .find(|p| {
                p.as_counter().is_some()
                    && p.attributes[SPAN_NAME_LABEL] == "checkout"
                    && p.attributes[STATUS_CODE_LABEL] == "STATUS_CODE_OK"
            })
            .unwrap();
        assert_eq!(ok_calls.as_counter(), Some(2.0));
    }

    #[test]
    fn test_dimensions_and_defaults() {
        let config = SpanMetricsConfig {
            dimensions: vec![
                Dimension::new("http.method"),
                Dimension::new("http.status_code").with_default("200"),
            ],
            namespace: Some("traces_span_metrics".into()),
            ..SpanMetricsConfig::default()
        };
        let mut aggregator = Aggregator::new(&config);
        aggregator.record(&finished("get", 5, SpanStatus::Ok).with_attribute("http.method", "GET"));
        aggregator.record(&finished("bare", 5, SpanStatus::Ok));

        let points = aggregator.snapshot(0);
        assert!(points.iter().all(|p| p.name.starts_with("traces_span_metrics_")));

        let bare = points
            .iter()
            .find(|p| p.attributes[SPAN_NAME_LABEL] == "bare")
            .unwrap();
        assert!(!bare.attributes.contains_key("http.method"));
        assert_eq!(bare.attributes["http.status_code"], "200");

        let get = points
            .iter()
            .find(|p| p.attributes[SPAN_NAME_LABEL] == "get")
            .unwrap();
        assert_eq!(get.attributes["http.method"], "GET");
    }

    #[test]
    fn test_config_validation() {
        assert!(SpanMetricsConfig::default().validate().is_ok());
        let unsorted = SpanMetricsConfig {
            buckets: vec![Duration::from_secs(1), Duration::from_millis(500)],
            ..SpanMetricsConfig::default()
        };
        assert!(unsorted.validate().is_err());
        let reserved = SpanMetricsConfig {
            dimensions: vec![Dimension::new(SPAN_NAME_LABEL)],
            ..SpanMetricsConfig::default()
        };
        assert!(reserved.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_totals_are_cumulative_across_flushes() {
        let sink = Arc::new(RecordingConsumer::new());
        let connector = SpanMetricsConnector::spawn(
            "spanmetrics",
            &SpanMetricsConfig::default(),
            sink.clone(),
        );

        let batch = Batch::new(
            vec![finished("checkout", 600, SpanStatus::Ok).into()],
            FlushReason::Size,
        );
        connector.consume(batch.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(16)).await;

        connector.consume(batch).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.reason == FlushReason::Time));
        let calls: Vec<f64> = batches
            .iter()
            .filter_map(|b| b.metrics().find_map(MetricPoint::as_counter))
            .collect();
        assert_eq!(calls, vec![1.0, 2.0]);
        assert_eq!(connector.spans_received(), 2);

        connector.shutdown().await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].reason, FlushReason::Shutdown);
    }

    #[tokio::test]
    async fn test_nothing_emitted_without_spans() {
        let sink = Arc::new(RecordingConsumer::new());
        let connector = SpanMetricsConnector::spawn(
            "spanmetrics",
            &SpanMetricsConfig::default(),
            sink.clone(),
        );
        connector.shutdown().await;
        assert!(sink.batches().is_empty());
    }
}
