//! Metric family model for the Prometheus text exposition format.
//!
//! - [`parser`] - turns a scraped text body into [`MetricFamily`] values
//! - [`text`] - renders [`MetricFamily`] values back to text

pub mod parser;
pub mod text;

use std::fmt;
use std::str::FromStr;

pub use parser::{ParseError, parse};
pub use text::{EncodeError, WriteOptions, write_family};

/// Metric family type as it appears in a `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Gauge,
    Summary,
    Histogram,
    Untyped,
}

impl MetricType {
    /// Get the TYPE keyword for the exposition format.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Summary => "summary",
            MetricType::Histogram => "histogram",
            MetricType::Untyped => "untyped",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricType::Counter),
            "gauge" => Ok(MetricType::Gauge),
            "summary" => Ok(MetricType::Summary),
            "histogram" => Ok(MetricType::Histogram),
            "untyped" => Ok(MetricType::Untyped),
            other => Err(format!("unknown metric type '{}'", other)),
        }
    }
}

/// A single label name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelPair {
    pub name: String,
    pub value: String,
}

impl LabelPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One quantile of a summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantile {
    pub quantile: f64,
    pub value: f64,
}

/// One cumulative bucket of a histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Inclusive upper bound (`le`).
    pub upper_bound: f64,
    /// Cumulative observation count.
    pub cumulative_count: f64,
}

/// The sample payload of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Untyped(f64),
    Summary {
        count: f64,
        sum: f64,
        quantiles: Vec<Quantile>,
    },
    Histogram {
        count: f64,
        sum: f64,
        buckets: Vec<Bucket>,
    },
}

impl MetricValue {
    /// The family type this value belongs to.
    pub fn metric_type(&self) -> MetricType {
        match self {
            MetricValue::Counter(_) => MetricType::Counter,
            MetricValue::Gauge(_) => MetricType::Gauge,
            MetricValue::Untyped(_) => MetricType::Untyped,
            MetricValue::Summary { .. } => MetricType::Summary,
            MetricValue::Histogram { .. } => MetricType::Histogram,
        }
    }
}

/// A labelled metric inside a family.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub labels: Vec<LabelPair>,
    pub value: MetricValue,
    /// Optional sample timestamp in milliseconds since epoch.
    pub timestamp_ms: Option<i64>,
}

impl Metric {
    /// Create a metric without labels or timestamp.
    pub fn new(value: MetricValue) -> Self {
        Self {
            labels: Vec::new(),
            value,
            timestamp_ms: None,
        }
    }

    /// Add a label (builder style).
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push(LabelPair::new(name, value));
        self
    }

    /// Look up a label value by name.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }
}

/// A named group of same-typed metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub metric_type: MetricType,
    pub metrics: Vec<Metric>,
}

impl MetricFamily {
    /// Create an empty family.
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            help: None,
            metric_type,
            metrics: Vec::new(),
        }
    }

    /// Set the help text (builder style).
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Append a metric (builder style).
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }
}

/// Check a metric name against `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Check a label name against `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
