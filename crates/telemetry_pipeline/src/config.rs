//! Pipeline configuration document.
//!
//! The document lists stages by name and type, each with its parameters and
//! an `output` list naming downstream stages:
//!
//! ```yaml
//! shutdown_grace_period: 5s
//! stages:
//!   - name: ingest
//!     type: receiver
//!     output: [batch]
//!   - name: batch
//!     type: batch
//!     send_batch_size: 100
//!     timeout: 5s
//!     output: [sampler, spanmetrics]
//!   - name: sampler
//!     type: probabilistic_sampler
//!     sampling_percentage: 25
//!     output: [traces]
//!   - name: spanmetrics
//!     type: spanmetrics
//!     buckets: [250ms, 500ms, 750ms, 1s, 3s]
//!     output: [metrics]
//!   - name: traces
//!     type: push
//!     endpoint: http://localhost:4318/v1/traces
//!   - name: metrics
//!     type: pull
//! ```
//!
//! [`PipelineConfig::validate`] rejects unknown references, invalid edges and
//! cycles before anything is started.

use crate::batcher::BatchConfig;
use crate::exporter::DebugConfig;
use crate::logging::LogConfig;
use crate::push::PushConfig;
use crate::sampler::SamplerConfig;
use crate::spanmetrics::SpanMetricsConfig;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Startup-time configuration failures. A pipeline never starts with one.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config document: {0}")]
    Parse(String),

    #[error("stage name must not be empty")]
    EmptyName,

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{from}' outputs to unknown stage '{to}'")]
    UnknownStage { from: String, to: String },

    #[error("invalid edge {from} -> {to}: {reason}")]
    InvalidEdge {
        from: String,
        to: String,
        reason: String,
    },

    #[error("cycle detected at edge {from} -> {to}")]
    Cycle { from: String, to: String },

    #[error("stage '{stage}': {reason}")]
    InvalidParameter { stage: String, reason: String },

    #[error("failed to start stage '{stage}': {reason}")]
    Startup { stage: String, reason: String },
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_edge_queue_size() -> usize {
    64
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub log: LogConfig,
    /// How long shutdown waits for outstanding exports
    #[serde(default = "default_grace_period", deserialize_with = "duration::deserialize")]
    pub shutdown_grace_period: Duration,
    /// Batches buffered per edge before that edge starts dropping
    #[serde(default = "default_edge_queue_size")]
    pub edge_queue_size: usize,
    pub stages: Vec<StageConfig>,
}

/// One named stage and the stages it feeds.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(flatten)]
    pub kind: StageKind,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            output: Vec::new(),
            kind,
        }
    }

    pub fn with_output<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = outputs.into_iter().map(Into::into).collect();
        self
    }
}

/// Stage type and its parameters. Keys a stage type does not know are
/// rejected at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum StageKind {
    /// In-process ingest point
    Receiver {},
    Batch(BatchConfig),
    ProbabilisticSampler(SamplerConfig),
    Spanmetrics(SpanMetricsConfig),
    /// HTTP push exporter
    Push(PushConfig),
    /// Prometheus pull snapshot
    Pull {},
    /// Log-only exporter
    Debug(DebugConfig),
}

impl StageKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Receiver {} => "receiver",
            Self::Batch(_) => "batch",
            Self::ProbabilisticSampler(_) => "probabilistic_sampler",
            Self::Spanmetrics(_) => "spanmetrics",
            Self::Push(_) => "push",
            Self::Pull {} => "pull",
            Self::Debug(_) => "debug",
        }
    }

    pub fn is_exporter(&self) -> bool {
        matches!(self, Self::Push(_) | Self::Pull {} | Self::Debug(_))
    }

    fn check(&self) -> Result<(), String> {
        match self {
            Self::Receiver {} | Self::Pull {} | Self::Debug(_) => Ok(()),
            Self::Batch(c) => c.validate(),
            Self::ProbabilisticSampler(c) => c.validate(),
            Self::Spanmetrics(c) => c.validate(),
            Self::Push(c) => c.validate(),
        }
    }
}

impl PipelineConfig {
    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self {
            log: LogConfig::default(),
            shutdown_grace_period: default_grace_period(),
            edge_queue_size: default_edge_queue_size(),
            stages,
        }
    }

    pub fn from_yaml_str(document: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&document)
    }

    /// Validates the stage graph and returns stage indices in topological
    /// order (every stage appears before the stages it feeds).
    pub fn validate(&self) -> Result<Vec<usize>, ConfigError> {
        let mut index = HashMap::with_capacity(self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if index.insert(stage.name.as_str(), i).is_some() {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
        }

        for stage in &self.stages {
            if matches!(stage.kind, StageKind::Receiver {}) && stage.output.is_empty() {
                return Err(ConfigError::InvalidParameter {
                    stage: stage.name.clone(),
                    reason: "receiver has no outputs".into(),
                });
            }
            let mut seen = HashSet::new();
            for to in &stage.output {
                let invalid = |reason: &str| ConfigError::InvalidEdge {
                    from: stage.name.clone(),
                    to: to.clone(),
                    reason: reason.to_string(),
                };
                let Some(&target) = index.get(to.as_str()) else {
                    return Err(ConfigError::UnknownStage {
                        from: stage.name.clone(),
                        to: to.clone(),
                    });
                };
                if !seen.insert(to.as_str()) {
                    return Err(invalid("target listed more than once"));
                }
                let target_kind = &self.stages[target].kind;
                if stage.kind.is_exporter() {
                    return Err(invalid("exporters are terminal and cannot have outputs"));
                }
                if matches!(target_kind, StageKind::Receiver {}) {
                    return Err(invalid("receivers cannot consume from other stages"));
                }
                if matches!(stage.kind, StageKind::Receiver {})
                    && !matches!(target_kind, StageKind::Batch(_))
                {
                    return Err(invalid("receivers may only feed batch stages"));
                }
            }
        }

        let order = self.topological_order(&index)?;

        for stage in &self.stages {
            stage
                .kind
                .check()
                .map_err(|reason| ConfigError::InvalidParameter {
                    stage: stage.name.clone(),
                    reason,
                })?;
        }
        if self.edge_queue_size == 0 {
            return Err(ConfigError::InvalidParameter {
                stage: "<pipeline>".into(),
                reason: "edge_queue_size must be at least 1".into(),
            });
        }

        Ok(order)
    }

    fn topological_order(&self, index: &HashMap<&str, usize>) -> Result<Vec<usize>, ConfigError> {
        let mut marks = vec![Mark::Unvisited; self.stages.len()];
        let mut post_order = Vec::with_capacity(self.stages.len());
        for start in 0..self.stages.len() {
            if marks[start] == Mark::Unvisited {
                self.visit(start, index, &mut marks, &mut post_order)?;
            }
        }
        post_order.reverse();
        Ok(post_order)
    }

    fn visit(
        &self,
        at: usize,
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        post_order: &mut Vec<usize>,
    ) -> Result<(), ConfigError> {
        marks[at] = Mark::Active;
        for to in &self.stages[at].output {
            let next = index[to.as_str()];
            match marks[next] {
                Mark::Active => {
                    return Err(ConfigError::Cycle {
                        from: self.stages[at].name.clone(),
                        to: to.clone(),
                    });
                }
                Mark::Unvisited => self.visit(next, index, marks, post_order)?,
                Mark::Done => {}
            }
        }
        marks[at] = Mark::Done;
        post_order.push(at);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

/// Durations written as integer milliseconds or as strings such as `250ms`,
/// `5s`, `1.5m` or `1h`.
pub mod duration {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Deserialize;
    use std::fmt;
    use std::time::Duration;

    /// Parses a duration string; a bare number means milliseconds.
    pub fn parse(input: &str) -> Result<Duration, String> {
        let s = input.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration '{input}'"))?;
        let millis = match unit.trim() {
            "" | "ms" => value,
            "us" | "µs" => value / 1_000.0,
            "s" => value * 1_000.0,
            "m" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            other => return Err(format!("unknown duration unit '{other}' in '{input}'")),
        };
        if !millis.is_finite() || millis < 0.0 {
            return Err(format!("invalid duration '{input}'"));
        }
        Ok(Duration::from_nanos((millis * 1_000_000.0).round() as u64))
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("milliseconds or a duration string such as \"5s\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_millis)
                .map_err(|_| E::custom(format!("negative duration {v}")))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            parse(&v.to_string()).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse(v).map_err(E::custom)
        }
    }

    struct Human(Duration);

    impl<'de> Deserialize<'de> for Human {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(DurationVisitor).map(Human)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    pub fn deserialize_list<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        Vec::<Human>::deserialize(deserializer).map(|list| list.into_iter().map(|h| h.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_stage(name: &str, outputs: &[&str]) -> StageConfig {
        StageConfig::new(name, StageKind::Batch(BatchConfig::default())).with_output(outputs.iter().copied())
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(duration::parse("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(duration::parse("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(duration::parse("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(duration::parse("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(duration::parse("750"), Ok(Duration::from_millis(750)));
        assert!(duration::parse("5 parsecs").is_err());
        assert!(duration::parse("fast").is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let config = PipelineConfig::new(vec![batch_stage("a", &["b"]), batch_stage("b", &["a"])]);
        match config.validate() {
            Err(ConfigError::Cycle { from, to }) => {
                assert_eq!((from.as_str(), to.as_str()), ("b", "a"));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let config = PipelineConfig::new(vec![batch_stage("a", &["a"])]);
        assert!(matches!(config.validate(), Err(ConfigError::Cycle { .. })));
    }

    #[test]
    fn test_fan_out_dag_is_ordered() {
        let config = PipelineConfig::new(vec![
            StageConfig::new("c", StageKind::Pull {}),
            StageConfig::new("b", StageKind::Pull {}),
            batch_stage("a", &["b", "c"]),
            StageConfig::new("in", StageKind::Receiver {}).with_output(["a"]),
        ]);
        let order = config.validate().unwrap();
        let position = |name: &str| {
            order
                .iter()
                .position(|&i| config.stages[i].name == name)
                .unwrap()
        };
        assert!(position("in") < position("a"));
        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let config = PipelineConfig::new(vec![batch_stage("a", &["missing"])]);
        match config.validate() {
            Err(ConfigError::UnknownStage { from, to }) => {
                assert_eq!(from, "a");
                assert_eq!(to, "missing");
            }
            other => panic!("expected unknown stage error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_edges_rejected() {
        let exporter_with_output = PipelineConfig::new(vec![
            StageConfig::new("out", StageKind::Pull {}).with_output(["b"]),
            batch_stage("b", &[]),
        ]);
        assert!(matches!(
            exporter_with_output.validate(),
            Err(ConfigError::InvalidEdge { .. })
        ));

        let receiver_to_exporter = PipelineConfig::new(vec![
            StageConfig::new("in", StageKind::Receiver {}).with_output(["out"]),
            StageConfig::new("out", StageKind::Pull {}),
        ]);
        assert!(matches!(
            receiver_to_exporter.validate(),
            Err(ConfigError::InvalidEdge { .. })
        ));

        let duplicate = PipelineConfig::new(vec![
            batch_stage("a", &["b", "b"]),
            StageConfig::new("b", StageKind::Pull {}),
        ]);
        assert!(matches!(duplicate.validate(), Err(ConfigError::InvalidEdge { .. })));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = PipelineConfig::new(vec![batch_stage("a", &[]), batch_stage("a", &[])]);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateStage(name)) if name == "a"));
    }

    #[test]
    fn test_yaml_document() {
        let config = PipelineConfig::from_yaml_str(
            r#"
shutdown_grace_period: 2s
stages:
  - name: ingest
    type: receiver
    output: [batch]
  - name: batch
    type: batch
    send_batch_size: 100
    timeout: 5s
    output: [sampler, spanmetrics]
  - name: sampler
    type: probabilistic_sampler
    sampling_percentage: 25
    hash_seed: 22
    output: [raw]
  - name: spanmetrics
    type: spanmetrics
    buckets: [250ms, 500ms, 750ms, 1s, 3s]
    dimensions: [http.method, {name: http.status_code, default: "200"}]
    output: [metrics]
  - name: raw
    type: debug
  - name: metrics
    type: pull
"#,
        )
        .unwrap();

        assert_eq!(config.shutdown_grace_period, Duration::from_secs(2));
        assert_eq!(config.stages.len(), 6);
        match &config.stages[1].kind {
            StageKind::Batch(batch) => {
                assert_eq!(batch.send_batch_size, 100);
                assert_eq!(batch.timeout, Duration::from_secs(5));
            }
            other => panic!("expected batch stage, got {:?}", other),
        }
        match &config.stages[2].kind {
            StageKind::ProbabilisticSampler(sampler) => {
                assert_eq!(sampler.sampling_percentage, 25.0);
                assert_eq!(sampler.hash_seed, 22);
            }
            other => panic!("expected sampler stage, got {:?}", other),
        }
        match &config.stages[3].kind {
            StageKind::Spanmetrics(sm) => {
                assert_eq!(sm.buckets[3], Duration::from_secs(1));
                assert_eq!(sm.dimensions.len(), 2);
                assert_eq!(sm.dimensions[1].default.as_deref(), Some("200"));
            }
            other => panic!("expected spanmetrics stage, got {:?}", other),
        }
        assert_eq!(config.validate().unwrap().len(), 6);
    }

    #[test]
    fn test_invalid_parameter_rejected() {
        let config = PipelineConfig::from_yaml_str(
            r#"
stages:
  - name: sampler
    type: probabilistic_sampler
    sampling_percentage: 150
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { stage, .. }) if stage == "sampler"
        ));
    }

    #[test]
    fn test_unknown_stage_type_rejected() {
        let result = PipelineConfig::from_yaml_str(
            r#"
stages:
  - name: x
    type: kafka
"#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_misspelled_stage_key_rejected() {
        let result = PipelineConfig::from_yaml_str(
            r#"
stages:
  - name: sample
    type: probabilistic_sampler
    sampling_precentage: 10
"#,
        );
        match result {
            Err(ConfigError::Parse(message)) => assert!(message.contains("sampling_precentage")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_keys_rejected_for_every_stage_type() {
        for stage in [
            "type: receiver\n    outputs: [b]",
            "type: pull\n    port: 9464",
            "type: batch\n    send_batch: 10",
            "type: push\n    endpoint: http://x\n    retry:\n      attempts: 3",
        ] {
            let yaml = format!("stages:\n  - name: a\n    {stage}\n");
            assert!(
                matches!(PipelineConfig::from_yaml_str(&yaml), Err(ConfigError::Parse(_))),
                "accepted: {stage}"
            );
        }

        let top_level = "edge_queue: 8\nstages: []\n";
        assert!(matches!(PipelineConfig::from_yaml_str(top_level), Err(ConfigError::Parse(_))));
    }
}
