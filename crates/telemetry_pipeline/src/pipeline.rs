//! Pipeline assembly and ordered shutdown.
//!
//! [`Pipeline::build`] validates the configuration, then creates stages from
//! the exporters backwards so every producing stage can be wired to routers
//! over already-running consumers. [`Pipeline::shutdown`] walks the graph
//! forwards: receivers close first, then each stage flushes and drains its
//! edges before the stages it feeds are stopped.

use crate::batcher::{self, Batcher};
use crate::config::{ConfigError, PipelineConfig, StageKind};
use crate::error::IngestError;
use crate::exporter::{ConsumerBoxed, DebugExporter};
use crate::pull::PullExporter;
use crate::push::PushExporter;
use crate::record::{MetricPoint, Record, Span};
use crate::router::Router;
use crate::sampler::{SamplerStage, TraceIdRatioSampler};
use crate::spanmetrics::SpanMetricsConnector;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// In-process ingest point. Cheap to share; every call validates the record
/// and hands it to each downstream batch stage.
pub struct ReceiverHandle {
    name: String,
    targets: Vec<Arc<Batcher>>,
    closed: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl ReceiverHandle {
    pub(crate) fn new(name: String, targets: Vec<Arc<Batcher>>) -> Self {
        Self {
            name,
            targets,
            closed: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Hands a record to every target without waiting. Targets take the
    /// record together or not at all, so a recoverable error can be retried
    /// without duplicating it.
    pub fn ingest(&self, record: Record) -> Result<(), IngestError> {
        self.check()?;
        self.tally(batcher::add_to_all(&self.targets, record))
    }

    /// Like [`ingest`](Self::ingest), but waits for buffer space when a
    /// target applies backpressure.
    pub async fn ingest_wait(&self, record: Record) -> Result<(), IngestError> {
        self.check()?;
        self.tally(batcher::add_to_all_wait(&self.targets, record).await)
    }

    pub fn ingest_span(&self, span: Span) -> Result<(), IngestError> {
        self.ingest(span.into())
    }

    pub fn ingest_metric(&self, point: MetricPoint) -> Result<(), IngestError> {
        self.ingest(point.into())
    }

    pub async fn ingest_span_wait(&self, span: Span) -> Result<(), IngestError> {
        self.ingest_wait(span.into()).await
    }

    pub async fn ingest_metric_wait(&self, point: MetricPoint) -> Result<(), IngestError> {
        self.ingest_wait(point.into()).await
    }

    fn check(&self) -> Result<(), IngestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestError::Closed);
        }
        Ok(())
    }

    fn tally(&self, result: Result<(), IngestError>) -> Result<(), IngestError> {
        match &result {
            Ok(()) => self.accepted.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A running stage.
pub enum StageHandle {
    Receiver(Arc<ReceiverHandle>),
    Batch(Arc<Batcher>),
    Sampler(Arc<SamplerStage>),
    SpanMetrics(Arc<SpanMetricsConnector>),
    Push(Arc<PushExporter>),
    Pull(Arc<PullExporter>),
    Debug(Arc<DebugExporter>),
}

impl StageHandle {
    /// The stage as a batch consumer; receivers only take single records.
    fn consumer(&self) -> Option<Arc<dyn ConsumerBoxed>> {
        match self {
            Self::Receiver(_) => None,
            Self::Batch(s) => Some(Arc::clone(s) as Arc<dyn ConsumerBoxed>),
            Self::Sampler(s) => Some(Arc::clone(s) as Arc<dyn ConsumerBoxed>),
            Self::SpanMetrics(s) => Some(Arc::clone(s) as Arc<dyn ConsumerBoxed>),
            Self::Push(s) => Some(Arc::clone(s) as Arc<dyn ConsumerBoxed>),
            Self::Pull(s) => Some(Arc::clone(s) as Arc<dyn ConsumerBoxed>),
            Self::Debug(s) => Some(Arc::clone(s) as Arc<dyn ConsumerBoxed>),
        }
    }

    /// Records this stage has given up on.
    fn records_dropped(&self) -> u64 {
        match self {
            Self::Batch(b) => b.metrics().records_dropped(),
            Self::Push(p) => p.metrics().records_dropped(),
            _ => 0,
        }
    }
}

/// Router from `name` to the already-built stages it outputs to.
fn connect(
    name: &str,
    outputs: &[String],
    built: &HashMap<String, StageHandle>,
    queue_size: usize,
) -> Router {
    let targets = outputs
        .iter()
        .filter_map(|to| {
            let consumer = built.get(to)?.consumer()?;
            Some((to.clone(), consumer))
        })
        .collect::<Vec<_>>();
    if targets.is_empty() {
        tracing::warn!(stage = %name, "Stage has no outputs, its data is discarded");
    }
    Router::new(name, targets, queue_size)
}

/// Totals reported once the pipeline has stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records lost to overflow, full edges, failed or abandoned exports
    pub records_dropped: u64,
    /// Records whose export was still running when the grace period ended
    pub records_abandoned: u64,
}

/// A running stage graph.
pub struct Pipeline {
    /// Stages in topological order
    stages: Vec<(String, StageHandle)>,
    routers: HashMap<String, Arc<Router>>,
    grace_period: Duration,
}

impl Pipeline {
    /// Validates `config` and starts every stage. Must be called inside a
    /// tokio runtime.
    pub fn build(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let order = config.validate()?;
        let mut built: HashMap<String, StageHandle> = HashMap::with_capacity(order.len());
        let mut routers = HashMap::new();

        for &index in order.iter().rev() {
            let stage = &config.stages[index];
            let name = stage.name.clone();
            let mut downstream = || -> Arc<dyn ConsumerBoxed> {
                let router = Arc::new(connect(&name, &stage.output, &built, config.edge_queue_size));
                routers.insert(name.clone(), Arc::clone(&router));
                router
            };

            let handle = match &stage.kind {
                StageKind::Receiver {} => {
                    let targets = stage
                        .output
                        .iter()
                        .filter_map(|to| match built.get(to) {
                            Some(StageHandle::Batch(b)) => Some(Arc::clone(b)),
                            _ => None,
                        })
                        .collect();
                    StageHandle::Receiver(Arc::new(ReceiverHandle::new(name.clone(), targets)))
                }
                StageKind::Batch(c) => {
                    StageHandle::Batch(Arc::new(Batcher::spawn(name.clone(), c.clone(), downstream())))
                }
                StageKind::ProbabilisticSampler(c) => {
                    let sampler = TraceIdRatioSampler::new(c.ratio(), c.hash_seed).map_err(|e| {
                        ConfigError::InvalidParameter {
                            stage: name.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    StageHandle::Sampler(Arc::new(SamplerStage::new(
                        name.clone(),
                        sampler,
                        downstream(),
                    )))
                }
                StageKind::Spanmetrics(c) => StageHandle::SpanMetrics(Arc::new(
                    SpanMetricsConnector::spawn(name.clone(), c, downstream()),
                )),
                StageKind::Push(c) => {
                    StageHandle::Push(Arc::new(PushExporter::from_config(name.clone(), c)?))
                }
                StageKind::Pull {} => StageHandle::Pull(Arc::new(PullExporter::new(name.clone()))),
                StageKind::Debug(c) => {
                    StageHandle::Debug(Arc::new(DebugExporter::new(name.clone(), c)))
                }
            };
            tracing::debug!(stage = %name, kind = stage.kind.type_name(), "Stage started");
            built.insert(name, handle);
        }

        let stages = order
            .iter()
            .filter_map(|&index| {
                let name = &config.stages[index].name;
                built.remove(name).map(|handle| (name.clone(), handle))
            })
            .collect::<Vec<_>>();
        tracing::info!(stages = stages.len(), "Pipeline started");

        Ok(Self {
            stages,
            routers,
            grace_period: config.shutdown_grace_period,
        })
    }

    /// Builds a pipeline from a YAML document.
    pub fn from_yaml_str(document: &str) -> Result<Self, ConfigError> {
        Self::build(&PipelineConfig::from_yaml_str(document)?)
    }

    pub fn stage(&self, name: &str) -> Option<&StageHandle> {
        self.stages.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(n, _)| n.as_str())
    }

    pub fn receiver(&self, name: &str) -> Option<Arc<ReceiverHandle>> {
        match self.stage(name)? {
            StageHandle::Receiver(r) => Some(Arc::clone(r)),
            _ => None,
        }
    }

    pub fn receivers(&self) -> Vec<Arc<ReceiverHandle>> {
        self.stages
            .iter()
            .filter_map(|(_, s)| match s {
                StageHandle::Receiver(r) => Some(Arc::clone(r)),
                _ => None,
            })
            .collect()
    }

    pub fn pull_exporters(&self) -> Vec<Arc<PullExporter>> {
        self.stages
            .iter()
            .filter_map(|(_, s)| match s {
                StageHandle::Pull(p) => Some(Arc::clone(p)),
                _ => None,
            })
            .collect()
    }

    pub fn router(&self, name: &str) -> Option<&Router> {
        self.routers.get(name).map(|r| &**r)
    }

    /// Records dropped so far anywhere in the graph.
    pub fn records_dropped(&self) -> u64 {
        let stages: u64 = self.stages.iter().map(|(_, s)| s.records_dropped()).sum();
        let edges: u64 = self.routers.values().map(|r| r.records_dropped()).sum();
        stages + edges
    }

    /// Stops the pipeline without losing buffered data: receivers close,
    /// then every stage flushes and drains its edges in topological order.
    /// Push exporters share one grace period for their in-flight sends.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!("Shutting down pipeline");
        for (_, stage) in &self.stages {
            if let StageHandle::Receiver(r) = stage {
                r.close();
            }
        }

        let mut push_deadline: Option<Instant> = None;
        let mut abandoned = 0;
        for (name, stage) in &self.stages {
            match stage {
                StageHandle::Batch(b) => b.shutdown().await,
                StageHandle::SpanMetrics(c) => c.shutdown().await,
                StageHandle::Push(p) => {
                    let deadline =
                        *push_deadline.get_or_insert_with(|| Instant::now() + self.grace_period);
                    abandoned += p
                        .shutdown(deadline.saturating_duration_since(Instant::now()))
                        .await;
                }
                StageHandle::Receiver(_)
                | StageHandle::Sampler(_)
                | StageHandle::Pull(_)
                | StageHandle::Debug(_) => {}
            }
            if let Some(router) = self.routers.get(name) {
                router.close().await;
            }
            tracing::debug!(stage = %name, "Stage stopped");
        }

        let report = ShutdownReport {
            records_dropped: self.records_dropped(),
            records_abandoned: abandoned,
        };
        tracing::info!(
            records_dropped = report.records_dropped,
            records_abandoned = report.records_abandoned,
            "Pipeline stopped"
        );
        report
    }
}
