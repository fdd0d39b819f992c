//! Batch consumers and delivery decorators.
//!
//! Every stage that accepts batches (processors, connectors, exporters and the
//! fan-out router itself) implements [`Consumer`]. The boxed twin
//! [`ConsumerBoxed`] exists for dynamic dispatch when stages are wired at
//! runtime from a configuration document.

use crate::config::duration;
use crate::record::{Batch, Record};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Error types for batch delivery
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    /// Transport-layer error (connect, reset, DNS)
    #[error("transport error: {0}")]
    Transport(String),
    /// Destination answered with a non-success HTTP status
    #[error("destination returned HTTP {code}")]
    Status { code: u16 },
    /// Delivery attempt timed out
    #[error("delivery timed out")]
    Timeout,
    /// Batch could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Consumer refused the batch
    #[error("batch rejected: {0}")]
    Rejected(String),
    /// All delivery attempts failed
    #[error("all {attempts} delivery attempts failed, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    /// Consumer has been shut down
    #[error("consumer is closed")]
    Closed,
}

impl DeliveryError {
    /// Transient failures are worth retrying: network trouble, timeouts,
    /// throttling and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status { code } => *code == 429 || *code >= 500,
            Self::Serialization(_)
            | Self::Rejected(_)
            | Self::RetriesExhausted { .. }
            | Self::Closed => false,
        }
    }
}

/// Trait for stages that accept batches.
///
/// Uses native async fn in traits instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn ConsumerBoxed>`.
pub trait Consumer: Send + Sync {
    /// Takes ownership of a batch.
    fn consume(&self, batch: Batch) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Returns the consumer name for logs.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Consumer`] for dynamic dispatch.
pub trait ConsumerBoxed: Send + Sync {
    /// Takes ownership of a batch (boxed future for object safety).
    fn consume_boxed(
        &self,
        batch: Batch,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>>;

    /// Returns the consumer name for logs.
    fn name(&self) -> &str;
}

/// Blanket implementation: any Consumer can be used as ConsumerBoxed
impl<T: Consumer> ConsumerBoxed for T {
    fn consume_boxed(
        &self,
        batch: Batch,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + '_>> {
        Box::pin(self.consume(batch))
    }

    fn name(&self) -> &str {
        Consumer::name(self)
    }
}

/// Thread-safe delivery counters shared by exporter tasks.
#[derive(Debug, Default)]
pub struct ExportMetrics {
    /// Total records delivered
    pub records_exported: AtomicU64,
    /// Total batches delivered
    pub batches_exported: AtomicU64,
    /// Records given up on (retries exhausted, permanent errors, shutdown)
    pub records_dropped: AtomicU64,
    /// Batches that failed delivery
    pub export_errors: AtomicU64,
    /// Records currently being delivered
    pub inflight_records: AtomicU64,
}

// Relaxed everywhere: these are statistics, nothing synchronizes on them.
impl ExportMetrics {
    pub fn records_exported(&self) -> u64 {
        self.records_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn inflight_records(&self) -> u64 {
        self.inflight_records.load(Ordering::Relaxed)
    }

    pub(crate) fn record_success(&self, record_count: u64) {
        self.records_exported.fetch_add(record_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, record_count: u64) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
        self.records_dropped.fetch_add(record_count, Ordering::Relaxed);
    }

    pub(crate) fn add_inflight(&self, record_count: u64) {
        self.inflight_records.fetch_add(record_count, Ordering::Relaxed);
    }

    pub(crate) fn sub_inflight(&self, record_count: u64) {
        self.inflight_records.fetch_sub(record_count, Ordering::Relaxed);
    }

    /// Moves every in-flight record to the dropped count; returns how many.
    pub(crate) fn abandon_inflight(&self) -> u64 {
        let abandoned = self.inflight_records.swap(0, Ordering::Relaxed);
        self.records_dropped.fetch_add(abandoned, Ordering::Relaxed);
        abandoned
    }
}

// =============================================================================
// RETRY
// =============================================================================

/// Configuration for retry behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total delivery attempts including the first one (minimum 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(deserialize_with = "duration::deserialize")]
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth).
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double delay each retry).
    pub multiplier: f64,
    /// Randomize each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (0-indexed); the first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi((attempt - 1) as i32);
        let delay = Duration::from_millis(delay_ms as u64).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// A consumer wrapper that retries transient failures with exponential backoff.
///
/// Permanent failures (see [`DeliveryError::is_transient`]) are returned
/// immediately without further attempts.
pub struct RetryingExporter<E: Consumer> {
    inner: E,
    config: RetryConfig,
    /// Retry attempts made (not counting first attempts)
    total_retries: AtomicU64,
    /// Deliveries that succeeded after at least one retry
    recovered_exports: AtomicU64,
}

impl<E: Consumer> RetryingExporter<E> {
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: E) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }
}

impl<E: Consumer> Consumer for RetryingExporter<E> {
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = DeliveryError::Closed;

        for attempt in 0..max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            if attempt > 0 {
                debug_assert!(delay <= self.config.max_delay);
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    exporter = self.inner.name(),
                    error = %last_error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient delivery error"
                );
                sleep(delay).await;
            }

            match self.inner.consume(batch.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => last_error = e,
            }
        }

        Err(DeliveryError::RetriesExhausted {
            attempts: max_attempts,
            last: last_error.to_string(),
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// =============================================================================
// DEBUG EXPORTER
// =============================================================================

/// How much a [`DebugExporter`] logs per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// One line per batch
    #[default]
    Basic,
    /// One line per record
    Detailed,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    pub verbosity: Verbosity,
}

/// Exporter that writes batches to the log, for local debugging.
pub struct DebugExporter {
    name: String,
    verbosity: Verbosity,
    metrics: ExportMetrics,
}

impl DebugExporter {
    pub fn new(name: impl Into<String>, config: &DebugConfig) -> Self {
        Self {
            name: name.into(),
            verbosity: config.verbosity,
            metrics: ExportMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &ExportMetrics {
        &self.metrics
    }
}

impl Consumer for DebugExporter {
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        tracing::info!(
            exporter = %self.name,
            records = batch.len(),
            spans = batch.spans().count(),
            metrics = batch.metrics().count(),
            reason = %batch.reason,
            sequence = batch.sequence,
            "Exporting batch"
        );
        if self.verbosity == Verbosity::Detailed {
            for record in &batch.records {
                match record {
                    Record::Span(span) => {
                        let trace_id = format!("{:032x}", span.trace_id);
                        let span_id = format!("{:016x}", span.span_id);
                        tracing::info!(
                            exporter = %self.name,
                            trace_id = %trace_id,
                            span_id = %span_id,
                            name = %span.name,
                            duration_ns = span.duration_nanos(),
                            status = ?span.status,
                            "span"
                        );
                    }
                    Record::Metric(point) => {
                        let body = serde_json::to_string(point)
                            .map_err(|e| DeliveryError::Serialization(e.to_string()))?;
                        tracing::info!(exporter = %self.name, metric = %body, "metric");
                    }
                }
            }
        }
        self.metrics.record_success(batch.len() as u64);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Test doubles shared by unit tests across modules.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    /// Records every batch it receives.
    #[derive(Default)]
    pub struct RecordingConsumer {
        batches: Mutex<Vec<Batch>>,
    }

    impl RecordingConsumer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn batches(&self) -> Vec<Batch> {
            self.batches.lock().unwrap().clone()
        }

        pub fn record_count(&self) -> usize {
            self.batches.lock().unwrap().iter().map(Batch::len).sum()
        }

        pub fn records(&self) -> Vec<Record> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|b| b.records.clone())
                .collect()
        }
    }

    impl Consumer for RecordingConsumer {
        async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    /// Never completes a delivery.
    pub struct StalledConsumer;

    impl Consumer for StalledConsumer {
        async fn consume(&self, _batch: Batch) -> Result<(), DeliveryError> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    /// Fails a configurable number of times with the given error, then succeeds.
    pub struct FailingConsumer {
        failures_remaining: AtomicU32,
        attempts: AtomicU32,
        error: DeliveryError,
        pub delivered: RecordingConsumer,
    }

    impl FailingConsumer {
        pub fn new(fail_count: u32, error: DeliveryError) -> Self {
            Self {
                failures_remaining: AtomicU32::new(fail_count),
                attempts: AtomicU32::new(0),
                error,
                delivered: RecordingConsumer::new(),
            }
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::Relaxed)
        }
    }

    impl Consumer for FailingConsumer {
        async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let remaining = self.failures_remaining.load(Ordering::Relaxed);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::Relaxed);
                return Err(self.error.clone());
            }
            self.delivered.consume(batch).await
        }

        fn name(&self) -> &str {
            "failing"
        }
    }
}
