//! Text exposition format writer.

use std::io::Write;

use thiserror::Error;

use super::{
    LabelPair, Metric, MetricFamily, MetricType, MetricValue, is_valid_label_name,
    is_valid_metric_name,
};

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors raised while rendering a family.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("metric family has no name")]
    MissingName,

    #[error("invalid metric name '{0}'")]
    InvalidMetricName(String),

    #[error("invalid label name '{label}' in family '{family}'")]
    InvalidLabelName { family: String, label: String },

    #[error("metric family '{0}' has no metrics")]
    NoMetrics(String),

    #[error("metric in family '{family}' is a {found}, expected {expected}")]
    TypeMismatch {
        family: String,
        expected: MetricType,
        found: MetricType,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rendering options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Omit `# HELP` and `# TYPE` lines.
    pub strip_comments: bool,
}

/// Render one family to `out`.
///
/// The family is validated and rendered into a scratch buffer first, so on
/// error nothing is written to `out`.
pub fn write_family<W: Write>(
    family: &MetricFamily,
    out: &mut W,
    options: WriteOptions,
) -> Result<(), EncodeError> {
    validate(family)?;

    let mut buf = Vec::with_capacity(family.metrics.len() * 64);
    let name = &family.name;

    if !options.strip_comments {
        if let Some(help) = &family.help {
            writeln!(buf, "# HELP {} {}", name, escape_help(help))?;
        }
        writeln!(buf, "# TYPE {} {}", name, family.metric_type)?;
    }

    for metric in &family.metrics {
        write_metric(&mut buf, name, metric)?;
    }

    out.write_all(&buf)?;
    Ok(())
}

fn validate(family: &MetricFamily) -> Result<(), EncodeError> {
    if family.name.is_empty() {
        return Err(EncodeError::MissingName);
    }
    if !is_valid_metric_name(&family.name) {
        return Err(EncodeError::InvalidMetricName(family.name.clone()));
    }
    if family.metrics.is_empty() {
        return Err(EncodeError::NoMetrics(family.name.clone()));
    }

    for metric in &family.metrics {
        let found = metric.value.metric_type();
        if found != family.metric_type {
            return Err(EncodeError::TypeMismatch {
                family: family.name.clone(),
                expected: family.metric_type,
                found,
            });
        }
        if let Some(bad) = metric.labels.iter().find(|l| !is_valid_label_name(&l.name)) {
            return Err(EncodeError::InvalidLabelName {
                family: family.name.clone(),
                label: bad.name.clone(),
            });
        }
    }

    Ok(())
}

fn write_metric(buf: &mut Vec<u8>, name: &str, metric: &Metric) -> std::io::Result<()> {
    let ts = metric.timestamp_ms;
    let labels = &metric.labels;

    match &metric.value {
        MetricValue::Counter(v) | MetricValue::Gauge(v) | MetricValue::Untyped(v) => {
            write_sample(buf, name, "", labels, None, *v, ts)
        }
        MetricValue::Summary {
            count,
            sum,
            quantiles,
        } => {
            for q in quantiles {
                write_sample(
                    buf,
                    name,
                    "",
                    labels,
                    Some(("quantile", q.quantile)),
                    q.value,
                    ts,
                )?;
            }
            write_sample(buf, name, "_sum", labels, None, *sum, ts)?;
            write_sample(buf, name, "_count", labels, None, *count, ts)
        }
        MetricValue::Histogram {
            count,
            sum,
            buckets,
        } => {
            for b in buckets {
                write_sample(
                    buf,
                    name,
                    "_bucket",
                    labels,
                    Some(("le", b.upper_bound)),
                    b.cumulative_count,
                    ts,
                )?;
            }
            let has_inf = buckets
                .last()
                .is_some_and(|b| b.upper_bound == f64::INFINITY);
            if !has_inf {
                write_sample(
                    buf,
                    name,
                    "_bucket",
                    labels,
                    Some(("le", f64::INFINITY)),
                    *count,
                    ts,
                )?;
            }
            write_sample(buf, name, "_sum", labels, None, *sum, ts)?;
            write_sample(buf, name, "_count", labels, None, *count, ts)
        }
    }
}

fn write_sample(
    buf: &mut Vec<u8>,
    name: &str,
    suffix: &str,
    labels: &[LabelPair],
    extra: Option<(&str, f64)>,
    value: f64,
    timestamp_ms: Option<i64>,
) -> std::io::Result<()> {
    write!(buf, "{}{}", name, suffix)?;

    if !labels.is_empty() || extra.is_some() {
        let mut parts: Vec<String> = labels
            .iter()
            .map(|l| format!("{}=\"{}\"", l.name, escape_label_value(&l.value)))
            .collect();
        if let Some((label, bound)) = extra {
            parts.push(format!("{}=\"{}\"", label, format_value(bound)));
        }
        write!(buf, "{{{}}}", parts.join(","))?;
    }

    write!(buf, " {}", format_value(value))?;
    if let Some(ts) = timestamp_ms {
        write!(buf, " {}", ts)?;
    }
    writeln!(buf)
}

/// Escape special characters in label values.
pub fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape backslashes and newlines in HELP text.
fn escape_help(help: &str) -> String {
    let mut result = String::with_capacity(help.len());
    for c in help.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for the exposition format.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.abs() >= 1e15 {
        format!("{:e}", value)
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
