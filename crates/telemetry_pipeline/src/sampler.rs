//! Deterministic trace-id ratio sampling.
//!
//! The decision depends only on the trace id, the ratio and the hash seed, so
//! every span of a trace gets the same verdict on every collector that shares
//! the configuration.

use crate::exporter::{Consumer, ConsumerBoxed, DeliveryError};
use crate::record::{Batch, Record};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("sampling ratio {0} is outside [0, 1]")]
pub struct InvalidRatio(pub f64);

/// Configuration for a `probabilistic_sampler` stage
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    /// Percentage of traces kept, 0 to 100
    pub sampling_percentage: f64,
    /// Collectors sharing a seed make identical decisions
    pub hash_seed: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sampling_percentage: 100.0,
            hash_seed: 0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.sampling_percentage) {
            return Err(format!(
                "sampling_percentage {} must be within [0, 100]",
                self.sampling_percentage
            ));
        }
        Ok(())
    }

    pub fn ratio(&self) -> f64 {
        self.sampling_percentage / 100.0
    }
}

/// Keeps a trace when its hashed position in `[0, 1)` falls below `ratio`.
#[derive(Debug, Clone, Copy)]
pub struct TraceIdRatioSampler {
    ratio: f64,
    hash_seed: u32,
}

impl TraceIdRatioSampler {
    pub fn new(ratio: f64, hash_seed: u32) -> Result<Self, InvalidRatio> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(InvalidRatio(ratio));
        }
        Ok(Self { ratio, hash_seed })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn decide(&self, trace_id: u128) -> bool {
        if self.ratio <= 0.0 {
            return false;
        }
        if self.ratio >= 1.0 {
            return true;
        }
        self.position(trace_id) < self.ratio
    }

    /// Position of `trace_id` in `[0, 1)` from the top 53 bits of its hash.
    pub fn position(&self, trace_id: u128) -> f64 {
        let mut bytes = [0u8; 20];
        bytes[..4].copy_from_slice(&self.hash_seed.to_be_bytes());
        bytes[4..].copy_from_slice(&trace_id.to_be_bytes());
        let hash = fmix64(fnv1a64(&bytes));
        (hash >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// FNV alone barely moves the high bits for ids that differ only in their
// last bytes.
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Pipeline stage dropping the spans of unsampled traces.
///
/// Metric points pass through untouched. A batch left empty is not
/// forwarded.
pub struct SamplerStage {
    name: String,
    sampler: TraceIdRatioSampler,
    downstream: Arc<dyn ConsumerBoxed>,
    spans_sampled: AtomicU64,
    spans_dropped: AtomicU64,
}

impl SamplerStage {
    pub fn new(
        name: impl Into<String>,
        sampler: TraceIdRatioSampler,
        downstream: Arc<dyn ConsumerBoxed>,
    ) -> Self {
        Self {
            name: name.into(),
            sampler,
            downstream,
            spans_sampled: AtomicU64::new(0),
            spans_dropped: AtomicU64::new(0),
        }
    }

    pub fn spans_sampled(&self) -> u64 {
        self.spans_sampled.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }
}

impl Consumer for SamplerStage {
    async fn consume(&self, mut batch: Batch) -> Result<(), DeliveryError> {
        let before = batch.len();
        let mut sampled = 0u64;
        batch.records.retain(|record| match record {
            Record::Span(span) => {
                let keep = self.sampler.decide(span.trace_id);
                sampled += u64::from(keep);
                keep
            }
            Record::Metric(_) => true,
        });
        let dropped = (before - batch.len()) as u64;
        self.spans_sampled.fetch_add(sampled, Ordering::Relaxed);
        self.spans_dropped.fetch_add(dropped, Ordering::Relaxed);

        if batch.is_empty() {
            return Ok(());
        }
        self.downstream.consume_boxed(batch).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::testing::RecordingConsumer;
    use crate::record::{FlushReason, MetricPoint, Span};

    #[test]
    fn test_decisions_are_stable() {
        let a = TraceIdRatioSampler::new(0.3, 7).unwrap();
        let b = TraceIdRatioSampler::new(0.3, 7).unwrap();
        for trace_id in 1..1_000u128 {
            let first = a.decide(trace_id);
            assert_eq!(first, a.decide(trace_id));
            assert_eq!(first, b.decide(trace_id));
        }
    }

    #[test]
    fn test_ratio_bounds() {
        let none = TraceIdRatioSampler::new(0.0, 0).unwrap();
        let all = TraceIdRatioSampler::new(1.0, 0).unwrap();
        for trace_id in 1..1_000u128 {
            assert!(!none.decide(trace_id));
            assert!(all.decide(trace_id));
        }
        assert_eq!(TraceIdRatioSampler::new(1.5, 0).unwrap_err(), InvalidRatio(1.5));
        assert!(TraceIdRatioSampler::new(-0.1, 0).is_err());
    }

    #[test]
    fn test_sequential_ids_spread_evenly() {
        let sampler = TraceIdRatioSampler::new(0.25, 0).unwrap();
        let kept = (1..=10_000u128).filter(|id| sampler.decide(*id)).count();
        assert!((2_200..=2_800).contains(&kept), "kept {kept} of 10000");
    }

    #[test]
    fn test_decision_is_monotone_in_ratio() {
        let low = TraceIdRatioSampler::new(0.2, 3).unwrap();
        let high = TraceIdRatioSampler::new(0.6, 3).unwrap();
        for trace_id in 1..2_000u128 {
            if low.decide(trace_id) {
                assert!(high.decide(trace_id));
            }
        }
    }

    #[test]
    fn test_seed_changes_decisions() {
        let a = TraceIdRatioSampler::new(0.5, 1).unwrap();
        let b = TraceIdRatioSampler::new(0.5, 2).unwrap();
        let differing = (1..1_000u128)
            .filter(|id| a.decide(*id) != b.decide(*id))
            .count();
        assert!(differing > 100);
    }

    #[test]
    fn test_percentage_validation() {
        assert!(SamplerConfig::default().validate().is_ok());
        let config = SamplerConfig {
            sampling_percentage: 101.0,
            hash_seed: 0,
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_stage_filters_spans_only() {
        let sink = Arc::new(RecordingConsumer::new());
        let sampler = TraceIdRatioSampler::new(0.5, 0).unwrap();
        let stage = SamplerStage::new("sampler", sampler, sink.clone());

        let mut records: Vec<Record> = (1..=200u128)
            .map(|id| Span::new(id, 1, "op").into())
            .collect();
        records.push(MetricPoint::counter("calls_total", 1.0).into());
        stage.consume(Batch::new(records, FlushReason::Size)).await.unwrap();

        let delivered = sink.records();
        let kept_spans: Vec<_> = delivered.iter().filter_map(Record::as_span).collect();
        assert!(kept_spans.iter().all(|s| sampler.decide(s.trace_id)));
        assert_eq!(delivered.iter().filter_map(Record::as_metric).count(), 1);
        assert_eq!(stage.spans_sampled(), kept_spans.len() as u64);
        assert_eq!(stage.spans_sampled() + stage.spans_dropped(), 200);
    }

    #[tokio::test]
    async fn test_empty_result_not_forwarded() {
        let sink = Arc::new(RecordingConsumer::new());
        let sampler = TraceIdRatioSampler::new(0.0, 0).unwrap();
        let stage = SamplerStage::new("sampler", sampler, sink.clone());

        let batch = Batch::new(vec![Span::new(9, 1, "op").into()], FlushReason::Time);
        stage.consume(batch).await.unwrap();
        assert!(sink.batches().is_empty());
        assert_eq!(stage.spans_dropped(), 1);
    }
}
