//! Batcher - buffers records and cuts batches on size or age.
//!
//! Producers append under a single mutex; a background flush task per
//! batcher swaps the whole buffer out and hands it downstream, so producers
//! never wait on export I/O.
//!
//! ```rust,ignore
//! let batcher = Batcher::spawn("batch", BatchConfig::default(), exporter);
//! batcher.add(span.into())?;
//! batcher.shutdown().await;
//! ```
//!
//! A batch is cut when any of these happens:
//!
//! 1. the buffer holds `send_batch_size` records (`FlushReason::Size`)
//! 2. `timeout` has elapsed since the oldest buffered record arrived
//!    (`FlushReason::Time`)
//! 3. the batcher shuts down (`FlushReason::Shutdown`)

use crate::config::duration;
use crate::error::IngestError;
use crate::exporter::{Consumer, ConsumerBoxed, DeliveryError};
use crate::record::{Batch, FlushReason, Record};
use crate::task::BackgroundTask;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, timeout_at, Instant};

/// What happens when a record arrives at a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered record and count it as dropped
    #[default]
    DropOldest,
    /// Reject the new record; `add_wait` waits for space
    Backpressure,
}

/// Configuration for a batch stage
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Buffered records that trigger a size flush
    pub send_batch_size: usize,
    /// Upper bound on records per emitted batch; larger flushes are split
    pub send_batch_max_size: Option<usize>,
    /// Maximum age of the oldest buffered record before a time flush
    #[serde(deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
    /// Buffer capacity at which the overflow policy applies
    pub max_queue_size: usize,
    pub overflow_policy: OverflowPolicy,
    /// How long `add_wait` waits for space under backpressure
    #[serde(deserialize_with = "duration::deserialize")]
    pub backpressure_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            send_batch_size: 512,
            send_batch_max_size: None,
            timeout: Duration::from_secs(5),
            max_queue_size: 2048,
            overflow_policy: OverflowPolicy::DropOldest,
            backpressure_timeout: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.send_batch_size == 0 {
            return Err("send_batch_size must be at least 1".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be greater than zero".into());
        }
        if self.max_queue_size < self.send_batch_size {
            return Err(format!(
                "max_queue_size ({}) must be >= send_batch_size ({})",
                self.max_queue_size, self.send_batch_size
            ));
        }
        if let Some(max) = self.send_batch_max_size
            && max < self.send_batch_size
        {
            return Err(format!(
                "send_batch_max_size ({max}) must be >= send_batch_size ({})",
                self.send_batch_size
            ));
        }
        Ok(())
    }
}

/// Batcher counters (relaxed atomics, read at any time).
#[derive(Debug, Default)]
pub struct BatchMetrics {
    records_accepted: AtomicU64,
    records_dropped: AtomicU64,
    records_flushed: AtomicU64,
    size_flushes: AtomicU64,
    time_flushes: AtomicU64,
    shutdown_flushes: AtomicU64,
    delivery_errors: AtomicU64,
}

impl BatchMetrics {
    pub fn records_accepted(&self) -> u64 {
        self.records_accepted.load(Ordering::Relaxed)
    }

    /// Records evicted by the drop-oldest policy
    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub fn records_flushed(&self) -> u64 {
        self.records_flushed.load(Ordering::Relaxed)
    }

    /// Flushes triggered for `reason` (a split flush counts once)
    pub fn flushes(&self, reason: FlushReason) -> u64 {
        self.flush_counter(reason).load(Ordering::Relaxed)
    }

    /// Batches the downstream consumer refused
    pub fn delivery_errors(&self) -> u64 {
        self.delivery_errors.load(Ordering::Relaxed)
    }

    fn flush_counter(&self, reason: FlushReason) -> &AtomicU64 {
        match reason {
            FlushReason::Size => &self.size_flushes,
            FlushReason::Time => &self.time_flushes,
            FlushReason::Shutdown => &self.shutdown_flushes,
        }
    }
}

struct Buffer {
    records: VecDeque<Record>,
    /// Arrival time of the oldest unflushed record
    oldest: Option<Instant>,
    closed: bool,
}

struct Shared {
    name: String,
    config: BatchConfig,
    buffer: Mutex<Buffer>,
    /// Flush task wakeup: first record buffered or size threshold reached
    wakeup: Notify,
    /// Space freed or batcher closed
    space: Notify,
    metrics: BatchMetrics,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, record: Record) -> Result<(), (IngestError, Record)> {
        if let Err(e) = record.validate() {
            return Err((e.into(), record));
        }

        let mut buffer = self.lock();
        if let Err(e) = self.check_space(&buffer, 1) {
            return Err((e, record));
        }
        let wake = self.append(&mut buffer, std::iter::once(record));
        drop(buffer);

        if wake {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    /// Appends all of `records` or none of them.
    fn push_batch(&self, records: Vec<Record>) -> Result<(), (IngestError, Vec<Record>)> {
        if let Some(e) = records.iter().find_map(|r| r.validate().err()) {
            return Err((e.into(), records));
        }

        let mut buffer = self.lock();
        if let Err(e) = self.check_space(&buffer, records.len()) {
            return Err((e, records));
        }
        let wake = self.append(&mut buffer, records);
        drop(buffer);

        if wake {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    /// Whether `incoming` records may be appended now.
    fn check_space(&self, buffer: &Buffer, incoming: usize) -> Result<(), IngestError> {
        if buffer.closed {
            return Err(IngestError::Closed);
        }
        if self.config.overflow_policy == OverflowPolicy::Backpressure
            && buffer.records.len() + incoming > self.config.max_queue_size
        {
            return Err(IngestError::BufferOverflow {
                capacity: self.config.max_queue_size,
            });
        }
        Ok(())
    }

    /// Appends records that passed [`Self::check_space`], evicting the oldest
    /// under drop-oldest. Returns whether the flush task needs waking.
    fn append(&self, buffer: &mut Buffer, records: impl IntoIterator<Item = Record>) -> bool {
        let first = buffer.records.is_empty();
        let mut accepted = 0u64;
        for record in records {
            if buffer.records.len() >= self.config.max_queue_size {
                buffer.records.pop_front();
                self.metrics.records_dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.records.push_back(record);
            accepted += 1;
        }
        if first && accepted > 0 {
            buffer.oldest = Some(Instant::now());
        }
        self.metrics
            .records_accepted
            .fetch_add(accepted, Ordering::Relaxed);
        accepted > 0 && (first || buffer.records.len() >= self.config.send_batch_size)
    }

    fn pending(&self) -> usize {
        self.lock().records.len()
    }

    fn deadline(&self) -> Option<Instant> {
        self.lock().oldest.map(|oldest| oldest + self.config.timeout)
    }

    /// Swaps the buffer out, leaving it empty.
    fn take(&self) -> Vec<Record> {
        let records = {
            let mut buffer = self.lock();
            buffer.oldest = None;
            std::mem::take(&mut buffer.records)
        };
        self.space.notify_waiters();
        records.into()
    }

    fn close(&self) {
        self.lock().closed = true;
        self.space.notify_waiters();
    }
}

/// A batching stage with its own flush task.
pub struct Batcher {
    shared: Arc<Shared>,
    flush_task: BackgroundTask,
}

impl Batcher {
    /// Starts a batcher feeding `downstream`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(
        name: impl Into<String>,
        config: BatchConfig,
        downstream: Arc<dyn ConsumerBoxed>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            config,
            buffer: Mutex::new(Buffer {
                records: VecDeque::new(),
                oldest: None,
                closed: false,
            }),
            wakeup: Notify::new(),
            space: Notify::new(),
            metrics: BatchMetrics::default(),
        });
        let flusher = Flusher {
            shared: Arc::clone(&shared),
            downstream,
            sequence: 0,
        };
        let flush_task = BackgroundTask::spawn(|shutdown_rx| flusher.run(shutdown_rx));

        Self { shared, flush_task }
    }

    /// Appends a record without waiting.
    pub fn add(&self, record: Record) -> Result<(), IngestError> {
        self.shared.push(record).map_err(|(e, _)| e)
    }

    /// Appends a record, waiting up to `backpressure_timeout` for space when
    /// the buffer is full under the backpressure policy.
    pub async fn add_wait(&self, record: Record) -> Result<(), IngestError> {
        self.push_waiting(record, Shared::push).await
    }

    /// Retries `push` on every freed-space notification until the
    /// backpressure deadline.
    async fn push_waiting<T>(
        &self,
        item: T,
        push: impl Fn(&Shared, T) -> Result<(), (IngestError, T)>,
    ) -> Result<(), IngestError> {
        let deadline = Instant::now() + self.shared.config.backpressure_timeout;
        let mut item = item;
        loop {
            let space = self.shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match push(&self.shared, item) {
                Ok(()) => return Ok(()),
                Err((overflow @ IngestError::BufferOverflow { .. }, returned)) => {
                    if timeout_at(deadline, space).await.is_err() {
                        return Err(overflow);
                    }
                    item = returned;
                }
                Err((e, _)) => return Err(e),
            }
        }
    }

    /// Records currently buffered
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.shared.metrics
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Stops accepting records, flushes what is buffered and waits for the
    /// flush task to finish. Later calls return immediately.
    pub async fn shutdown(&self) {
        self.shared.close();
        self.flush_task.stop(&self.shared.name).await;
    }
}

/// Appends `record` to every batcher in `targets` or to none of them.
///
/// All target buffers are locked together, so an error means no target kept
/// the record and the caller may retry without creating duplicates.
pub fn add_to_all(targets: &[Arc<Batcher>], record: Record) -> Result<(), IngestError> {
    try_add_to_all(targets, record).map_err(|(_, e, _)| e)
}

/// [`add_to_all`], waiting up to the refusing batcher's
/// `backpressure_timeout` for space.
pub async fn add_to_all_wait(targets: &[Arc<Batcher>], record: Record) -> Result<(), IngestError> {
    let started = Instant::now();
    let mut record = record;
    loop {
        let mut spaces: Vec<_> = targets
            .iter()
            .map(|t| Box::pin(t.shared.space.notified()))
            .collect();
        for space in &mut spaces {
            space.as_mut().enable();
        }

        match try_add_to_all(targets, record) {
            Ok(()) => return Ok(()),
            Err((index, overflow @ IngestError::BufferOverflow { .. }, returned)) => {
                let deadline = started + targets[index].shared.config.backpressure_timeout;
                if timeout_at(deadline, spaces.swap_remove(index)).await.is_err() {
                    return Err(overflow);
                }
                record = returned;
            }
            Err((_, e, _)) => return Err(e),
        }
    }
}

/// On failure returns the index of the refusing target with the record.
fn try_add_to_all(
    targets: &[Arc<Batcher>],
    record: Record,
) -> Result<(), (usize, IngestError, Record)> {
    if let Err(e) = record.validate() {
        return Err((0, e.into(), record));
    }

    // Locks are taken in address order so producers sharing batchers cannot
    // deadlock each other.
    let mut order: Vec<usize> = (0..targets.len()).collect();
    order.sort_by_key(|&i| Arc::as_ptr(&targets[i].shared) as usize);
    let mut buffers: Vec<(usize, MutexGuard<'_, Buffer>)> = order
        .into_iter()
        .map(|i| (i, targets[i].shared.lock()))
        .collect();
    buffers.sort_by_key(|(i, _)| *i);

    for (i, buffer) in &buffers {
        if let Err(e) = targets[*i].shared.check_space(buffer, 1) {
            return Err((*i, e, record));
        }
    }

    let mut record = Some(record);
    let mut wake = Vec::new();
    let last = buffers.len().saturating_sub(1);
    for (n, (i, buffer)) in buffers.iter_mut().enumerate() {
        let copy = if n == last { record.take() } else { record.clone() };
        if let Some(copy) = copy
            && targets[*i].shared.append(buffer, std::iter::once(copy))
        {
            wake.push(*i);
        }
    }
    drop(buffers);

    for i in wake {
        targets[i].shared.wakeup.notify_one();
    }
    Ok(())
}

/// Upstream stages (connectors) feed batchers through the same consumer
/// interface as any other stage. A batch is buffered whole or refused whole.
impl Consumer for Batcher {
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        let config = &self.shared.config;
        if config.overflow_policy == OverflowPolicy::Backpressure
            && batch.len() > config.max_queue_size
        {
            return Err(DeliveryError::Rejected(format!(
                "batch of {} records exceeds buffer capacity {}",
                batch.len(),
                config.max_queue_size
            )));
        }
        self.push_waiting(batch.records, Shared::push_batch)
            .await
            .map_err(|e| match e {
                IngestError::Closed => DeliveryError::Closed,
                other => DeliveryError::Rejected(other.to_string()),
            })
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

struct Flusher {
    shared: Arc<Shared>,
    downstream: Arc<dyn ConsumerBoxed>,
    sequence: u64,
}

impl Flusher {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let batch_size = self.shared.config.send_batch_size;
        loop {
            if self.shared.pending() >= batch_size {
                self.flush(FlushReason::Size).await;
                continue;
            }

            let deadline = self.shared.deadline();
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,

                () = self.shared.wakeup.notified() => {}

                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(FlushReason::Time).await;
                }
            }
        }

        self.flush(FlushReason::Shutdown).await;
    }

    async fn flush(&mut self, reason: FlushReason) {
        let mut records = self.shared.take();
        if records.is_empty() {
            return;
        }

        let metrics = &self.shared.metrics;
        metrics.flush_counter(reason).fetch_add(1, Ordering::Relaxed);
        metrics
            .records_flushed
            .fetch_add(records.len() as u64, Ordering::Relaxed);

        let limit = self.shared.config.send_batch_max_size.unwrap_or(usize::MAX);
        while !records.is_empty() {
            let rest = records.split_off(records.len().min(limit));
            self.sequence += 1;
            let batch = Batch::new(records, reason).with_sequence(self.sequence);
            records = rest;

            let count = batch.len();
            tracing::debug!(
                stage = %self.shared.name,
                records = count,
                %reason,
                sequence = self.sequence,
                "Flushing batch"
            );
            if let Err(e) = self.downstream.consume_boxed(batch).await {
                metrics.delivery_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    stage = %self.shared.name,
                    downstream = self.downstream.name(),
                    records = count,
                    error = %e,
                    "Downstream refused batch"
                );
            }
        }
    }
}
