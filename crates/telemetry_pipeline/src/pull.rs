//! Pull exporter: latest value per series, read by scrapers.

use crate::exporter::{Consumer, DeliveryError, ExportMetrics};
use crate::exposition;
use crate::record::{Batch, MetricPoint};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Series identity: metric name plus its label set.
pub type SeriesKey = (String, BTreeMap<String, String>);

pub type Snapshot = BTreeMap<SeriesKey, MetricPoint>;

/// Keeps the most recent point per series; nothing is accumulated or
/// retried. Spans reaching this stage are ignored and counted.
pub struct PullExporter {
    name: String,
    snapshot: watch::Sender<Snapshot>,
    spans_ignored: AtomicU64,
    metrics: ExportMetrics,
}

impl PullExporter {
    pub fn new(name: impl Into<String>) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::new());
        Self {
            name: name.into(),
            snapshot,
            spans_ignored: AtomicU64::new(0),
            metrics: ExportMetrics::default(),
        }
    }

    /// Receiver notified on every update.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Current points, ordered by series.
    pub fn points(&self) -> Vec<MetricPoint> {
        self.snapshot.borrow().values().cloned().collect()
    }

    pub fn get(&self, name: &str, labels: &BTreeMap<String, String>) -> Option<MetricPoint> {
        self.snapshot
            .borrow()
            .get(&(name.to_string(), labels.clone()))
            .cloned()
    }

    pub fn series_count(&self) -> usize {
        self.snapshot.borrow().len()
    }

    pub fn spans_ignored(&self) -> u64 {
        self.spans_ignored.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &ExportMetrics {
        &self.metrics
    }

    /// Prometheus text exposition of the current snapshot.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        exposition::render(self.snapshot.borrow().values())
    }
}

impl Consumer for PullExporter {
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        let spans = batch.spans().count() as u64;
        if spans > 0 {
            self.spans_ignored.fetch_add(spans, Ordering::Relaxed);
        }

        let mut updated = 0u64;
        self.snapshot.send_modify(|snapshot| {
            for point in batch.metrics() {
                snapshot.insert((point.name.clone(), point.attributes.clone()), point.clone());
                updated += 1;
            }
        });
        self.metrics.record_success(updated);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FlushReason, Span};

    fn calls(span_name: &str, value: f64) -> MetricPoint {
        MetricPoint::counter("calls_total", value)
            .with_attribute("span_name", span_name)
            .with_timestamp(0)
    }

    #[tokio::test]
    async fn test_latest_value_wins_per_series() {
        let exporter = PullExporter::new("metrics");
        exporter
            .consume(Batch::new(
                vec![calls("a", 1.0).into(), calls("b", 1.0).into()],
                FlushReason::Time,
            ))
            .await
            .unwrap();
        exporter
            .consume(Batch::new(vec![calls("a", 5.0).into()], FlushReason::Time))
            .await
            .unwrap();

        assert_eq!(exporter.series_count(), 2);
        let a = exporter.get("calls_total", &calls("a", 0.0).attributes).unwrap();
        assert_eq!(a.as_counter(), Some(5.0));
        let text = exporter.render().unwrap();
        assert!(text.contains("calls_total{span_name=\"a\"} 5"));
    }

    #[tokio::test]
    async fn test_spans_are_ignored() {
        let exporter = PullExporter::new("metrics");
        let mut rx = exporter.subscribe();
        exporter
            .consume(Batch::new(
                vec![Span::new(1, 1, "op").into(), calls("a", 1.0).into()],
                FlushReason::Size,
            ))
            .await
            .unwrap();

        assert_eq!(exporter.spans_ignored(), 1);
        assert_eq!(exporter.points().len(), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }
}
