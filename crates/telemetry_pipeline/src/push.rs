//! HTTP push exporter.
//!
//! Batches are POSTed as JSON. Each send runs on its own shard task, bounded
//! by a semaphore of `max_shards` permits, so the upstream edge worker only
//! waits for a free shard and never for the network.

use crate::config::{duration, ConfigError};
use crate::exporter::{Consumer, DeliveryError, ExportMetrics, RetryConfig, RetryingExporter};
use crate::record::Batch;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// Configuration for a `push` stage
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushConfig {
    /// Destination URL, e.g. `http://localhost:4318/v1/traces`
    pub endpoint: String,
    /// Per-request timeout
    #[serde(deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
    /// Maximum concurrent in-flight sends
    pub max_shards: usize,
    pub retry: RetryConfig,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: Duration::from_secs(10),
            max_shards: 4,
            retry: RetryConfig::default(),
            headers: BTreeMap::new(),
        }
    }
}

impl PushConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| format!("invalid endpoint '{}': {e}", self.endpoint))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("endpoint scheme '{}' is not http(s)", url.scheme()));
        }
        if self.max_shards == 0 {
            return Err("max_shards must be at least 1".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be greater than zero".into());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".into());
        }
        if self.retry.multiplier < 1.0 {
            return Err("retry.multiplier must be >= 1".into());
        }
        Ok(())
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_builder() {
            Self::Serialization(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                code: status.as_u16(),
            }
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Sends one batch per request; no retries of its own.
pub struct HttpTransport {
    name: String,
    endpoint: reqwest::Url,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(name: impl Into<String>, config: &PushConfig) -> Result<Self, ConfigError> {
        let name = name.into();
        let startup = |reason: String| ConfigError::Startup {
            stage: name.clone(),
            reason,
        };

        let endpoint = reqwest::Url::parse(&config.endpoint).map_err(|e| startup(e.to_string()))?;
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let key = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| startup(format!("invalid header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| startup(format!("invalid header value: {e}")))?;
            headers.insert(key, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .user_agent(concat!("telemetry-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| startup(format!("failed to build HTTP client: {e}")))?;

        tracing::debug!(stage = %name, endpoint = %endpoint, "Push transport initialized");
        Ok(Self {
            name,
            endpoint,
            client,
        })
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }
}

impl Consumer for HttpTransport {
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&batch)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                code: status.as_u16(),
            })
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Push sink: retrying transport behind a bounded pool of shard tasks.
pub struct PushExporter<E: Consumer + 'static = HttpTransport> {
    name: String,
    transport: Arc<RetryingExporter<E>>,
    shards: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    metrics: Arc<ExportMetrics>,
}

impl PushExporter<HttpTransport> {
    pub fn from_config(name: impl Into<String>, config: &PushConfig) -> Result<Self, ConfigError> {
        let name = name.into();
        let transport = HttpTransport::new(name.clone(), config)?;
        Ok(Self::new(name, transport, config.retry.clone(), config.max_shards))
    }
}

impl<E: Consumer + 'static> PushExporter<E> {
    pub fn new(name: impl Into<String>, transport: E, retry: RetryConfig, max_shards: usize) -> Self {
        Self {
            name: name.into(),
            transport: Arc::new(RetryingExporter::new(transport, retry)),
            shards: Arc::new(Semaphore::new(max_shards.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            metrics: Arc::new(ExportMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &ExportMetrics {
        &self.metrics
    }

    pub fn transport(&self) -> &E {
        self.transport.inner()
    }

    /// Retry attempts made across all sends
    pub fn total_retries(&self) -> u64 {
        self.transport.total_retries()
    }

    /// Stops accepting batches and waits up to `grace` for in-flight sends.
    /// Sends still running afterwards are aborted and their records counted
    /// as dropped; returns how many records were abandoned.
    pub async fn shutdown(&self, grace: Duration) -> u64 {
        self.shards.close();
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(exporter = %self.name, error = %e, "Export task failed");
                }
            }
        })
        .await;
        if drained.is_ok() {
            return 0;
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        let abandoned = self.metrics.abandon_inflight();
        tracing::warn!(
            exporter = %self.name,
            records = abandoned,
            grace_ms = grace.as_millis() as u64,
            "Shutdown grace period elapsed, abandoning in-flight exports"
        );
        abandoned
    }
}

impl<E: Consumer + 'static> Consumer for PushExporter<E> {
    async fn consume(&self, batch: Batch) -> Result<(), DeliveryError> {
        let permit = Arc::clone(&self.shards)
            .acquire_owned()
            .await
            .map_err(|_| DeliveryError::Closed)?;

        let record_count = batch.len() as u64;
        self.metrics.add_inflight(record_count);

        let transport = Arc::clone(&self.transport);
        let metrics = Arc::clone(&self.metrics);
        let name = self.name.clone();

        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                tracing::error!(exporter = %self.name, error = %e, "Export task failed");
            }
        }
        tasks.spawn(async move {
            let result = transport.consume(batch).await;
            metrics.sub_inflight(record_count);
            match result {
                Ok(()) => metrics.record_success(record_count),
                Err(e) => {
                    metrics.record_failure(record_count);
                    tracing::warn!(
                        exporter = %name,
                        records = record_count,
                        error = %e,
                        "Dropping batch after failed delivery"
                    );
                }
            }
            drop(permit);
        });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::testing::{FailingConsumer, StalledConsumer};
    use crate::record::{FlushReason, Span};

    fn batch(records: u64) -> Batch {
        let records = (0..records).map(|i| Span::new(1, i, "op").into()).collect();
        Batch::new(records, FlushReason::Size)
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_recovered() {
        let transport = FailingConsumer::new(2, DeliveryError::Status { code: 503 });
        let exporter = PushExporter::new("push", transport, fast_retry(), 2);

        exporter.consume(batch(3)).await.unwrap();
        assert_eq!(exporter.shutdown(Duration::from_secs(5)).await, 0);

        assert_eq!(exporter.transport().attempts(), 3);
        assert_eq!(exporter.transport().delivered.batches().len(), 1);
        assert_eq!(exporter.metrics().records_exported(), 3);
        assert_eq!(exporter.metrics().records_dropped(), 0);
        assert_eq!(exporter.total_retries(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_dropped_without_retry() {
        let transport = FailingConsumer::new(1, DeliveryError::Status { code: 400 });
        let exporter = PushExporter::new("push", transport, fast_retry(), 1);

        exporter.consume(batch(4)).await.unwrap();
        exporter.shutdown(Duration::from_secs(5)).await;

        assert_eq!(exporter.transport().attempts(), 1);
        assert_eq!(exporter.metrics().records_dropped(), 4);
        assert_eq!(exporter.metrics().export_errors(), 1);
        assert_eq!(exporter.metrics().inflight_records(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_stuck_sends() {
        let exporter = PushExporter::new("push", StalledConsumer, fast_retry(), 2);

        exporter.consume(batch(2)).await.unwrap();
        exporter.consume(batch(3)).await.unwrap();
        assert_eq!(exporter.metrics().inflight_records(), 5);

        let abandoned = exporter.shutdown(Duration::from_secs(1)).await;
        assert_eq!(abandoned, 5);
        assert_eq!(exporter.metrics().records_dropped(), 5);
        assert_eq!(exporter.metrics().inflight_records(), 0);

        assert_eq!(exporter.consume(batch(1)).await, Err(DeliveryError::Closed));
    }

    #[test]
    fn test_config_validation() {
        assert!(PushConfig::new("http://localhost:4318/v1/traces").validate().is_ok());
        assert!(PushConfig::default().validate().is_err());
        assert!(PushConfig::new("ftp://example.com").validate().is_err());
        let no_shards = PushConfig {
            max_shards: 0,
            ..PushConfig::new("http://localhost:4318")
        };
        assert!(no_shards.validate().is_err());
    }
}
