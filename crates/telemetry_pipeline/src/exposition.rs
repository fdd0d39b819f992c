//! Prometheus text exposition (format 0.0.4).
//!
//! Points are converted into `prometheus` protobuf families and written by
//! its `TextEncoder`; no registry is involved, so the pull snapshot stays the
//! single source of values.

use crate::record::{MetricKind, MetricPoint, MetricValue};
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use std::collections::BTreeMap;

/// Content type served alongside [`render`] output.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Renders points grouped into families, one `# TYPE` header per family.
pub fn render<'a>(
    points: impl IntoIterator<Item = &'a MetricPoint>,
) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = metric_families(points);
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Groups points by sanitised name. A family takes the kind of its first
/// point; later points of another kind are skipped.
pub fn metric_families<'a>(points: impl IntoIterator<Item = &'a MetricPoint>) -> Vec<MetricFamily> {
    let mut families: BTreeMap<String, MetricFamily> = BTreeMap::new();
    for point in points {
        let name = sanitize_metric_name(&point.name);
        let family = families.entry(name).or_insert_with_key(|name| {
            let mut family = MetricFamily::default();
            family.set_name(name.clone());
            family.set_field_type(metric_type(point.kind()));
            family
        });
        if family.get_field_type() != metric_type(point.kind()) {
            tracing::warn!(
                metric = %point.name,
                kind = point.kind().as_str(),
                "Skipping point whose kind differs from its family"
            );
            continue;
        }
        family.mut_metric().push(metric(point));
    }
    families.into_values().collect()
}

fn metric_type(kind: MetricKind) -> MetricType {
    match kind {
        MetricKind::Counter => MetricType::COUNTER,
        MetricKind::Histogram => MetricType::HISTOGRAM,
    }
}

fn metric(point: &MetricPoint) -> proto::Metric {
    let mut metric = proto::Metric::default();
    for (name, value) in labels(&point.attributes) {
        let mut pair = LabelPair::default();
        pair.set_name(name);
        pair.set_value(value);
        metric.mut_label().push(pair);
    }

    match &point.value {
        MetricValue::Counter(value) => {
            let mut counter = proto::Counter::default();
            counter.set_value(*value);
            metric.set_counter(counter);
        }
        MetricValue::Histogram(data) => {
            let mut histogram = proto::Histogram::default();
            histogram.set_sample_count(data.count);
            histogram.set_sample_sum(data.sum);
            // The encoder appends the +Inf bucket itself.
            for (bound, count) in data.boundaries.iter().zip(&data.bucket_counts) {
                let mut bucket = proto::Bucket::default();
                bucket.set_upper_bound(*bound);
                bucket.set_cumulative_count(*count);
                histogram.mut_bucket().push(bucket);
            }
            metric.set_histogram(histogram);
        }
    }

    let timestamp_ms = point.timestamp / 1_000_000;
    if timestamp_ms > 0 {
        metric.set_timestamp_ms(timestamp_ms as i64);
    }
    metric
}

/// Sanitised label set. Attributes whose names collide after sanitising
/// (`http.method`, `http_method`) share one label, values joined with `;`
/// in attribute-name order.
pub fn labels(attributes: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in attributes {
        labels
            .entry(sanitize_label_name(key))
            .and_modify(|joined| {
                joined.push(';');
                joined.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }
    labels
}

/// Metric names allow `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn sanitize_metric_name(name: &str) -> String {
    sanitize(name, |c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Label names allow `[a-zA-Z_][a-zA-Z0-9_]*`; `http.method` becomes
/// `http_method`.
pub fn sanitize_label_name(name: &str) -> String {
    sanitize(name, |c| c.is_ascii_alphanumeric() || c == '_')
}

fn sanitize(name: &str, allowed: impl Fn(char) -> bool) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if allowed(c) { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::HistogramData;

    /// Value and timestamp of the sample line for `series`.
    fn sample(text: &str, series: &str) -> Option<(f64, Option<i64>)> {
        let line = text.lines().find(|line| {
            line.strip_prefix(series)
                .is_some_and(|rest| rest.starts_with(' '))
        })?;
        let mut fields = line[series.len()..].split_whitespace();
        let value = fields.next()?.parse().ok()?;
        let timestamp = fields.next().and_then(|t| t.parse().ok());
        Some((value, timestamp))
    }

    #[test]
    fn test_counter_line() {
        let point = MetricPoint::counter("calls_total", 3.0)
            .with_attribute("span_name", "checkout")
            .with_attribute("status_code", "STATUS_CODE_OK")
            .with_timestamp(1_700_000_000_123_456_789);

        let text = render([&point]).unwrap();
        assert!(text.contains("# TYPE calls_total counter\n"));
        assert_eq!(
            sample(
                &text,
                r#"calls_total{span_name="checkout",status_code="STATUS_CODE_OK"}"#
            ),
            Some((3.0, Some(1_700_000_000_123)))
        );
    }

    #[test]
    fn test_histogram_expansion() {
        let mut data = HistogramData::new(vec![250.0, 500.0, 750.0, 1000.0, 3000.0]);
        data.record(600.0);
        let point = MetricPoint::histogram("duration", data)
            .with_attribute("span_name", "checkout")
            .with_timestamp(2_000_000);

        let text = render([&point]).unwrap();
        assert!(text.contains("# TYPE duration histogram\n"));
        let bucket = |le: &str| sample(&text, &format!(r#"duration_bucket{{span_name="checkout",le="{le}"}}"#));
        assert_eq!(bucket("250"), Some((0.0, Some(2))));
        assert_eq!(bucket("500"), Some((0.0, Some(2))));
        assert_eq!(bucket("750"), Some((1.0, Some(2))));
        assert_eq!(bucket("3000"), Some((1.0, Some(2))));
        assert_eq!(bucket("+Inf"), Some((1.0, Some(2))));
        assert_eq!(sample(&text, r#"duration_count{span_name="checkout"}"#), Some((1.0, Some(2))));
        assert_eq!(sample(&text, r#"duration_sum{span_name="checkout"}"#), Some((600.0, Some(2))));
        // 6 buckets, sum, count and the TYPE header
        assert_eq!(text.lines().count(), 9);
    }

    #[test]
    fn test_one_type_header_per_family() {
        let a = MetricPoint::counter("calls_total", 1.0).with_attribute("span_name", "a");
        let b = MetricPoint::counter("calls_total", 2.0).with_attribute("span_name", "b");
        let text = render([&a, &b]).unwrap();
        assert_eq!(text.matches("# TYPE calls_total counter").count(), 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_mismatched_kind_is_skipped() {
        let counter = MetricPoint::counter("duration", 1.0).with_attribute("span_name", "a");
        let histogram = MetricPoint::histogram("duration", HistogramData::new(vec![1.0]))
            .with_attribute("span_name", "b");

        let families = metric_families([&counter, &histogram]);
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_field_type(), MetricType::COUNTER);
        assert_eq!(families[0].get_metric().len(), 1);
    }

    #[test]
    fn test_label_escaping_and_sanitizing() {
        let point = MetricPoint::counter("http.requests", 1.0)
            .with_attribute("http.route", "/a\"b\\c\nd")
            .with_timestamp(0);
        let text = render([&point]).unwrap();
        assert!(text.contains("# TYPE http_requests counter"));
        // zero timestamp is left off
        assert_eq!(
            sample(&text, r#"http_requests{http_route="/a\"b\\c\nd"}"#),
            Some((1.0, None))
        );
        assert_eq!(sanitize_label_name("2xx"), "_2xx");
        assert_eq!(sanitize_metric_name("process:cpu.seconds"), "process:cpu_seconds");
    }

    #[test]
    fn test_colliding_label_names_merge() {
        let point = MetricPoint::counter("requests_total", 4.0)
            .with_attribute("http.method", "GET")
            .with_attribute("http_method", "POST")
            .with_attribute("route", "/users")
            .with_timestamp(0);

        let text = render([&point]).unwrap();
        assert_eq!(text.matches("http_method=").count(), 1);
        assert_eq!(
            sample(&text, r#"requests_total{http_method="GET;POST",route="/users"}"#),
            Some((4.0, None))
        );
    }
}
