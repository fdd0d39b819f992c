//! Telemetry records: spans, metric points and the batches that carry them.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// Current wall-clock time as Unix nanoseconds.
pub fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Scalar attribute value attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Span completion status, following the OTLP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    /// Status not set by the instrumentation
    #[default]
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
}

impl SpanStatus {
    /// Numeric OTLP status code.
    pub fn code(self) -> i32 {
        match self {
            Self::Unset => 0,
            Self::Ok => 1,
            Self::Error => 2,
        }
    }

    /// Label value used by span-derived metrics.
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Unset => "STATUS_CODE_UNSET",
            Self::Ok => "STATUS_CODE_OK",
            Self::Error => "STATUS_CODE_ERROR",
        }
    }
}

impl TryFrom<i32> for SpanStatus {
    type Error = ValidationError;

    fn try_from(code: i32) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(Self::Unset),
            1 => Ok(Self::Ok),
            2 => Ok(Self::Error),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

impl FromStr for SpanStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNSET" | "STATUS_CODE_UNSET" | "0" => Ok(Self::Unset),
            "OK" | "STATUS_CODE_OK" | "1" => Ok(Self::Ok),
            "ERROR" | "STATUS_CODE_ERROR" | "2" => Ok(Self::Error),
            _ => Err(ValidationError::UnknownStatus(s.to_string())),
        }
    }
}

/// A single timed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Trace identifier (128-bit, never zero)
    #[serde(with = "hex_u128")]
    pub trace_id: u128,
    /// Span identifier (64-bit)
    #[serde(with = "hex_u64")]
    pub span_id: u64,
    /// Operation name
    pub name: String,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    /// Span status
    pub status: SpanStatus,
    /// Span attributes, ordered by key
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Span {
    /// Creates a span that starts and ends now with `Unset` status.
    pub fn new(trace_id: u128, span_id: u64, name: impl Into<String>) -> Self {
        let now = unix_nanos_now();
        Self {
            trace_id,
            span_id,
            name: name.into(),
            start_time: now,
            end_time: now,
            attributes: BTreeMap::new(),
            status: SpanStatus::Unset,
        }
    }

    /// Sets explicit start and end timestamps.
    pub fn with_times(mut self, start_time: u64, end_time: u64) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    /// Sets `end_time` so the span lasts `duration`.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.end_time = self.start_time + duration.as_nanos() as u64;
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Marks the span as completed now with the given status.
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = unix_nanos_now().max(self.start_time);
        self.status = status;
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos())
    }

    /// Checks the invariants a finalized span must hold.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.trace_id == 0 {
            return Err(ValidationError::ZeroTraceId);
        }
        if self.end_time < self.start_time {
            return Err(ValidationError::NegativeDuration {
                name: self.name.clone(),
                start_time: self.start_time,
                end_time: self.end_time,
            });
        }
        Ok(())
    }
}

/// Metric kind carried by a [`MetricPoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
}

impl MetricKind {
    /// Lower-case kind name, as in `# TYPE` lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Histogram => "histogram",
        }
    }
}

/// Explicit-boundary histogram with cumulative bucket counts.
///
/// `bucket_counts[i]` counts observations `<= boundaries[i]`; the extra last
/// bucket is the implicit `+Inf` bucket and always equals `count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramData {
    pub boundaries: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

impl HistogramData {
    /// Creates an empty histogram. `boundaries` must be strictly ascending.
    pub fn new(boundaries: Vec<f64>) -> Self {
        let buckets = boundaries.len() + 1;
        Self {
            boundaries,
            bucket_counts: vec![0; buckets],
            count: 0,
            sum: 0.0,
        }
    }

    /// Records one observation into every bucket whose bound covers it.
    pub fn record(&mut self, value: f64) {
        for (bound, bucket) in self.boundaries.iter().zip(self.bucket_counts.iter_mut()) {
            if value <= *bound {
                *bucket += 1;
            }
        }
        if let Some(inf) = self.bucket_counts.last_mut() {
            *inf += 1;
        }
        self.count += 1;
        self.sum += value;
    }

    fn check(&self) -> Result<(), String> {
        if self.bucket_counts.len() != self.boundaries.len() + 1 {
            return Err(format!(
                "expected {} bucket counts for {} boundaries, got {}",
                self.boundaries.len() + 1,
                self.boundaries.len(),
                self.bucket_counts.len()
            ));
        }
        if self.boundaries.iter().any(|b| !b.is_finite()) {
            return Err("boundaries must be finite".into());
        }
        if self.boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err("boundaries must be strictly ascending".into());
        }
        if self.bucket_counts.windows(2).any(|w| w[0] > w[1]) {
            return Err("bucket counts must be cumulative".into());
        }
        if self.bucket_counts.last() != Some(&self.count) {
            return Err("+Inf bucket must equal the total count".into());
        }
        if !self.sum.is_finite() {
            return Err("sum must be finite".into());
        }
        Ok(())
    }
}

/// Value of a metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    /// Monotonic cumulative counter value
    Counter(f64),
    Histogram(HistogramData),
}

/// A single metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Observation time (Unix nanoseconds)
    pub timestamp: u64,
    pub value: MetricValue,
}

impl MetricPoint {
    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            timestamp: unix_nanos_now(),
            value: MetricValue::Counter(value),
        }
    }

    pub fn histogram(name: impl Into<String>, data: HistogramData) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            timestamp: unix_nanos_now(),
            value: MetricValue::Histogram(data),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> MetricKind {
        match self.value {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Histogram(_) => MetricKind::Histogram,
        }
    }

    pub fn as_counter(&self) -> Option<f64> {
        match self.value {
            MetricValue::Counter(v) => Some(v),
            MetricValue::Histogram(_) => None,
        }
    }

    pub fn as_histogram(&self) -> Option<&HistogramData> {
        match &self.value {
            MetricValue::Histogram(h) => Some(h),
            MetricValue::Counter(_) => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let malformed = |reason: String| ValidationError::MalformedMetric {
            name: self.name.clone(),
            reason,
        };
        match &self.value {
            MetricValue::Counter(v) if !v.is_finite() || *v < 0.0 => {
                Err(malformed(format!("counter value {v} must be finite and non-negative")))
            }
            MetricValue::Counter(_) => Ok(()),
            MetricValue::Histogram(h) => h.check().map_err(malformed),
        }
    }
}

/// Anything that flows through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Span(Span),
    Metric(MetricPoint),
}

impl Record {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Span(span) => span.validate(),
            Self::Metric(point) => point.validate(),
        }
    }

    pub fn as_span(&self) -> Option<&Span> {
        match self {
            Self::Span(span) => Some(span),
            Self::Metric(_) => None,
        }
    }

    pub fn as_metric(&self) -> Option<&MetricPoint> {
        match self {
            Self::Metric(point) => Some(point),
            Self::Span(_) => None,
        }
    }
}

impl From<Span> for Record {
    fn from(span: Span) -> Self {
        Self::Span(span)
    }
}

impl From<MetricPoint> for Record {
    fn from(point: MetricPoint) -> Self {
        Self::Metric(point)
    }
}

/// Why a batch was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Buffer reached its size threshold
    Size,
    /// Oldest buffered record reached the timeout
    Time,
    /// Forced flush during shutdown
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Size => "size",
            Self::Time => "time",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Ordered records handed from one stage to the next.
///
/// A batch is immutable once flushed; stages that filter or fan out work on
/// their own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub records: Vec<Record>,
    pub reason: FlushReason,
    /// Position of this batch in its producing stage's output, starting at 1
    pub sequence: u64,
    /// Batch creation timestamp (Unix nanoseconds)
    pub created_at: u64,
}

impl Batch {
    pub fn new(records: Vec<Record>, reason: FlushReason) -> Self {
        Self {
            records,
            reason,
            sequence: 0,
            created_at: unix_nanos_now(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Returns the number of records in the batch
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.records.iter().filter_map(Record::as_span)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &MetricPoint> {
        self.records.iter().filter_map(Record::as_metric)
    }
}

mod hex_u128 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{id:032x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        u128::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}

mod hex_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{id:016x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        u64::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}
