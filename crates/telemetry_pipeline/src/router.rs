//! Fan-out from one stage to its downstream stages.
//!
//! Every edge owns a bounded queue and a worker task, so a slow or failing
//! consumer only ever fills its own queue. When an edge queue is full the
//! copy for that edge is dropped and counted; siblings are unaffected.
//! Batches a downstream stage refuses are counted as dropped on their edge,
//! so the router never reports a loss it has already accounted for.

use crate::exporter::{Consumer, ConsumerBoxed, DeliveryError};
use crate::record::Batch;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct EdgeMetrics {
    batches_sent: AtomicU64,
    batches_dropped: AtomicU64,
    records_dropped: AtomicU64,
    delivery_errors: AtomicU64,
}

impl EdgeMetrics {
    pub fn batches_sent(&self) -> u64 {
        self.batches_sent.load(Ordering::Relaxed)
    }

    /// Batches dropped because the edge queue was full or closed, or the
    /// target refused them
    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    /// Batches the target refused after dequeueing
    pub fn delivery_errors(&self) -> u64 {
        self.delivery_errors.load(Ordering::Relaxed)
    }

    fn record_drop(&self, records: usize) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(records as u64, Ordering::Relaxed);
    }
}

struct Edge {
    target: String,
    sender: RwLock<Option<mpsc::Sender<Batch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<EdgeMetrics>,
}

/// Routes each batch from one producing stage to every downstream stage.
pub struct Router {
    name: String,
    edges: Vec<Edge>,
}

impl Router {
    /// Spawns one worker per target. Must be called inside a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        targets: Vec<(String, Arc<dyn ConsumerBoxed>)>,
        queue_size: usize,
    ) -> Self {
        let name = name.into();
        let edges = targets
            .into_iter()
            .map(|(target, consumer)| {
                let (tx, rx) = mpsc::channel(queue_size.max(1));
                let metrics = Arc::new(EdgeMetrics::default());
                let worker = tokio::spawn(drain_edge(
                    format!("{name}->{target}"),
                    rx,
                    consumer,
                    Arc::clone(&metrics),
                ));
                Edge {
                    target,
                    sender: RwLock::new(Some(tx)),
                    worker: Mutex::new(Some(worker)),
                    metrics,
                }
            })
            .collect();
        Self { name, edges }
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.edges.iter().map(|e| e.target.as_str())
    }

    pub fn edge_metrics(&self, target: &str) -> Option<&EdgeMetrics> {
        self.edges
            .iter()
            .find(|e| e.target == target)
            .map(|e| e.metrics.as_ref())
    }

    /// Records dropped across all edges
    pub fn records_dropped(&self) -> u64 {
        self.edges.iter().map(|e| e.metrics.records_dropped()).sum()
    }

    /// Closes every edge queue and waits for the workers to drain them.
    pub async fn close(&self) {
        for edge in &self.edges {
            edge.sender
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        for edge in &self.edges {
            let worker = edge
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(worker) = worker
                && let Err(e) = worker.await
            {
                tracing::error!(router = %self.name, target = %edge.target, error = %e, "Edge worker failed");
            }
        }
    }

    fn enqueue(&self, edge: &Edge, batch: Batch) -> bool {
        let guard = edge.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            edge.metrics.record_drop(batch.len());
            tracing::debug!(
                router = %self.name,
                target = %edge.target,
                records = batch.len(),
                "Edge closed, dropping batch"
            );
            return false;
        };
        match sender.try_send(batch) {
            Ok(()) => {
                edge.metrics.batches_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(batch) | TrySendError::Closed(batch)) => {
                edge.metrics.record_drop(batch.len());
                tracing::warn!(
                    router = %self.name,
                    target = %edge.target,
                    records = batch.len(),
                    "Edge queue full, dropping batch"
                );
                false
            }
        }
    }
}

impl Consumer for Router {
    /// Always succeeds: every copy that cannot be enqueued is counted on its
    /// edge, so reporting it upstream as well would count it twice.
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        let Some((last, rest)) = self.edges.split_last() else {
            return Ok(());
        };
        for edge in rest {
            self.enqueue(edge, batch.clone());
        }
        self.enqueue(last, batch);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn drain_edge(
    edge: String,
    mut rx: mpsc::Receiver<Batch>,
    target: Arc<dyn ConsumerBoxed>,
    metrics: Arc<EdgeMetrics>,
) {
    while let Some(batch) = rx.recv().await {
        let records = batch.len();
        if let Err(e) = target.consume_boxed(batch).await {
            metrics.delivery_errors.fetch_add(1, Ordering::Relaxed);
            metrics.record_drop(records);
            tracing::warn!(%edge, records, error = %e, "Downstream stage refused batch");
        }
    }
    tracing::debug!(%edge, "Edge drained");
}
