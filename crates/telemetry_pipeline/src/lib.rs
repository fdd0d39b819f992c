//! Telemetry Pipeline
//!
//! An in-process OpenTelemetry-style pipeline for spans and metric points.
//! Applications ingest records through receivers; a configurable stage graph
//! batches them, samples traces by trace id, derives RED metrics from spans
//! and delivers everything to push (HTTP), pull (scrape) or debug exporters.
//!
//! ```rust,ignore
//! let pipeline = Pipeline::build(&PipelineConfig::load("pipeline.yaml")?)?;
//! let receiver = pipeline.receiver("ingest").unwrap();
//! receiver.ingest_span(Span::new(trace_id, span_id, "checkout").with_times(start, end))?;
//! let report = pipeline.shutdown().await;
//! ```
//!
//! # Rust 2024 Edition Features
//!
//! Stages implement the native async [`Consumer`] trait (no `#[async_trait]`
//! macro); [`ConsumerBoxed`] provides the object-safe form used for wiring.

pub mod batcher;
pub mod config;
pub mod error;
pub mod exporter;
pub mod exposition;
pub mod instrument;
pub mod logging;
pub mod pipeline;
pub mod pull;
pub mod push;
pub mod record;
pub mod router;
pub mod sampler;
pub mod server;
pub mod spanmetrics;
mod task;

// Re-export main types
pub use batcher::{BatchConfig, BatchMetrics, Batcher, OverflowPolicy};
pub use config::{ConfigError, PipelineConfig, StageConfig, StageKind};
pub use error::{IngestError, ValidationError};
pub use exporter::{
    Consumer, ConsumerBoxed, DebugConfig, DebugExporter, DeliveryError, ExportMetrics, RetryConfig,
    RetryingExporter, Verbosity,
};
pub use instrument::{DurationHistogram, HistogramTimer, SpanTimer};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use pipeline::{Pipeline, ReceiverHandle, ShutdownReport, StageHandle};
pub use pull::PullExporter;
pub use push::{HttpTransport, PushConfig, PushExporter};
pub use record::{
    AttributeValue, Batch, FlushReason, HistogramData, MetricKind, MetricPoint, MetricValue, Record,
    Span, SpanStatus,
};
pub use router::{EdgeMetrics, Router};
pub use sampler::{SamplerConfig, SamplerStage, TraceIdRatioSampler};
pub use spanmetrics::{Dimension, SpanMetricsConfig, SpanMetricsConnector};
