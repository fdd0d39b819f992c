//! Scoped timers for instrumenting application code.
//!
//! Both timers finish on drop, so every exit path (early return, `?`,
//! panic unwinding) records exactly once.
//!
//! ```rust,ignore
//! let receiver = pipeline.receiver("ingest").unwrap();
//! let mut span = SpanTimer::root(Arc::clone(&receiver), "checkout");
//! span.set_attribute("http.method", "POST");
//! if let Err(e) = charge_card().await {
//!     span.fail();
//!     return Err(e);
//! }
//! ```

use crate::error::IngestError;
use crate::pipeline::ReceiverHandle;
use crate::record::{unix_nanos_now, AttributeValue, HistogramData, MetricPoint, Span, SpanStatus};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

fn report(result: Result<(), IngestError>, what: &str, name: &str) {
    match result {
        Ok(()) => {}
        Err(IngestError::Closed) => {
            tracing::debug!(what, name, "Pipeline closed, measurement discarded");
        }
        Err(e) => tracing::warn!(what, name, error = %e, "Failed to record measurement"),
    }
}

/// Times an operation and ingests it as a span when dropped.
pub struct SpanTimer {
    receiver: Arc<ReceiverHandle>,
    span: Option<Span>,
    started: Instant,
    failed: bool,
}

impl SpanTimer {
    pub fn start(
        receiver: Arc<ReceiverHandle>,
        trace_id: u128,
        span_id: u64,
        name: impl Into<String>,
    ) -> Self {
        let mut span = Span::new(trace_id, span_id, name);
        span.start_time = unix_nanos_now();
        Self {
            receiver,
            span: Some(span),
            started: Instant::now(),
            failed: false,
        }
    }

    /// Starts a span in a new trace with random ids.
    pub fn root(receiver: Arc<ReceiverHandle>, name: impl Into<String>) -> Self {
        let mut rng = rand::thread_rng();
        let trace_id = rng.gen_range(1..=u128::MAX);
        let span_id = rng.gen_range(1..=u64::MAX);
        Self::start(receiver, trace_id, span_id, name)
    }

    /// Starts another span in the same trace.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let span_id = rand::thread_rng().gen_range(1..=u64::MAX);
        Self::start(Arc::clone(&self.receiver), self.trace_id(), span_id, name)
    }

    pub fn trace_id(&self) -> u128 {
        self.span.as_ref().map_or(0, |s| s.trace_id)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(span) = self.span.as_mut() {
            span.set_attribute(key, value);
        }
    }

    /// Marks the span as failed; it finishes with `ERROR` status.
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for SpanTimer {
    fn drop(&mut self) {
        let Some(mut span) = self.span.take() else {
            return;
        };
        span.end_time = span.start_time + self.started.elapsed().as_nanos() as u64;
        span.status = if self.failed {
            SpanStatus::Error
        } else {
            SpanStatus::Ok
        };
        let name = span.name.clone();
        report(self.receiver.ingest_span(span), "span", &name);
    }
}

struct HistogramState {
    data: HistogramData,
    errors: u64,
}

/// A cumulative duration histogram (milliseconds) fed by [`HistogramTimer`]s.
///
/// Each observation ingests the running totals, so pull exporters always
/// hold the current cumulative value.
pub struct DurationHistogram {
    receiver: Arc<ReceiverHandle>,
    name: String,
    labels: BTreeMap<String, String>,
    state: Mutex<HistogramState>,
}

impl DurationHistogram {
    pub fn new(receiver: Arc<ReceiverHandle>, name: impl Into<String>, boundaries_ms: Vec<f64>) -> Self {
        Self {
            receiver,
            name: name.into(),
            labels: BTreeMap::new(),
            state: Mutex::new(HistogramState {
                data: HistogramData::new(boundaries_ms),
                errors: 0,
            }),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn start_timer(self: &Arc<Self>) -> HistogramTimer {
        HistogramTimer {
            histogram: Arc::clone(self),
            started: Instant::now(),
            failed: false,
        }
    }

    /// Records one observation and ingests the updated totals. Failed
    /// observations also bump an `error_count` counter.
    ///
    /// Points are ingested under the state lock, so they reach the pipeline
    /// in the order their totals were computed.
    pub fn observe(&self, millis: f64, failed: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.data.record(millis);
        let point = MetricPoint::histogram(&self.name, state.data.clone())
            .with_attributes(self.labels.clone());
        report(self.receiver.ingest_metric(point), "histogram", &self.name);

        if failed {
            state.errors += 1;
            let errors = MetricPoint::counter("error_count", state.errors as f64)
                .with_attributes(self.labels.clone())
                .with_attribute("operation", &self.name);
            report(self.receiver.ingest_metric(errors), "counter", &self.name);
        }
    }
}

/// Observes its own lifetime into a [`DurationHistogram`] when dropped.
pub struct HistogramTimer {
    histogram: Arc<DurationHistogram>,
    started: Instant,
    failed: bool,
}

impl HistogramTimer {
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let millis = self.started.elapsed().as_secs_f64() * 1_000.0;
        self.histogram.observe(millis, self.failed);
    }
}
