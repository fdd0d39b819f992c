//! Error types for record ingestion.
//!
//! Delivery failures live next to the [`Consumer`](crate::exporter::Consumer)
//! trait and configuration failures next to the config loader.

use thiserror::Error;

/// A record that cannot enter the pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Span or metric name is empty.
    #[error("record name must not be empty")]
    EmptyName,

    /// The all-zero trace id is reserved as invalid.
    #[error("trace id must not be zero")]
    ZeroTraceId,

    /// `end_time` precedes `start_time`.
    #[error("span '{name}' ends before it starts (start={start_time}, end={end_time})")]
    NegativeDuration {
        name: String,
        start_time: u64,
        end_time: u64,
    },

    /// Status code outside `UNSET | OK | ERROR`.
    #[error("unknown status code: {0}")]
    UnknownStatus(String),

    /// Metric value or histogram shape is inconsistent.
    #[error("malformed metric '{name}': {reason}")]
    MalformedMetric { name: String, reason: String },
}

/// Errors returned to callers that hand records to the pipeline.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    /// The record failed validation and was not accepted.
    #[error("invalid record: {0}")]
    Invalid(#[from] ValidationError),

    /// The buffer is at capacity and the stage applies backpressure.
    #[error("buffer full ({capacity} records)")]
    BufferOverflow { capacity: usize },

    /// The pipeline has been shut down.
    #[error("pipeline is closed")]
    Closed,
}

impl IngestError {
    /// Returns `true` if retrying the same record later may succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BufferOverflow { .. })
    }

    /// Returns `true` if the pipeline will never accept records again.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
