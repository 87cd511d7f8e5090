//! Parser for the Prometheus text exposition format (version 0.0.4).

use std::collections::HashMap;

use thiserror::Error;

use super::{
    Bucket, LabelPair, Metric, MetricFamily, MetricType, MetricValue, Quantile,
    is_valid_label_name, is_valid_metric_name,
};

/// A malformed exposition document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    /// 1-based line number of the offending line.
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// How a sample line contributes to its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleRole {
    Plain,
    Sum,
    Count,
    Bucket,
}

/// Per-family parse state.
struct FamilyState {
    family: MetricFamily,
    help_seen: bool,
    type_seen: bool,
    has_samples: bool,
    /// Label set -> metric index, for summaries and histograms.
    series: HashMap<Vec<LabelPair>, usize>,
}

impl FamilyState {
    fn new(name: &str) -> Self {
        Self {
            family: MetricFamily::new(name, MetricType::Untyped),
            help_seen: false,
            type_seen: false,
            has_samples: false,
            series: HashMap::new(),
        }
    }

    /// Find or create the summary/histogram metric for a label set.
    fn series_mut(&mut self, labels: Vec<LabelPair>) -> &mut Metric {
        let idx = match self.series.get(&labels) {
            Some(&idx) => idx,
            None => {
                let value = match self.family.metric_type {
                    MetricType::Histogram => MetricValue::Histogram {
                        count: 0.0,
                        sum: 0.0,
                        buckets: Vec::new(),
                    },
                    _ => MetricValue::Summary {
                        count: 0.0,
                        sum: 0.0,
                        quantiles: Vec::new(),
                    },
                };
                self.family.metrics.push(Metric {
                    labels: labels.clone(),
                    value,
                    timestamp_ms: None,
                });
                let idx = self.family.metrics.len() - 1;
                self.series.insert(labels, idx);
                idx
            }
        };
        &mut self.family.metrics[idx]
    }
}

/// A parsed sample line before it is attached to a family.
struct Sample {
    name: String,
    labels: Vec<LabelPair>,
    value: f64,
    timestamp_ms: Option<i64>,
}

struct Parser {
    families: Vec<FamilyState>,
    index: HashMap<String, usize>,
}

/// Parse a text exposition document into metric families.
///
/// Families are returned in order of first appearance. Families that end up
/// without any sample (HELP/TYPE only) are dropped.
pub fn parse(text: &str) -> Result<Vec<MetricFamily>, ParseError> {
    let mut parser = Parser {
        families: Vec::new(),
        index: HashMap::new(),
    };

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            parser.comment(line_no, comment)?;
        } else {
            let sample = parse_sample(line_no, line)?;
            parser.sample(line_no, sample)?;
        }
    }

    Ok(parser
        .families
        .into_iter()
        .map(|s| s.family)
        .filter(|f| !f.metrics.is_empty())
        .collect())
}

impl Parser {
    fn family_mut(&mut self, name: &str) -> &mut FamilyState {
        let idx = match self.index.get(name) {
            Some(&idx) => idx,
            None => {
                self.families.push(FamilyState::new(name));
                let idx = self.families.len() - 1;
                self.index.insert(name.to_string(), idx);
                idx
            }
        };
        &mut self.families[idx]
    }

    fn comment(&mut self, line: usize, comment: &str) -> Result<(), ParseError> {
        let comment = comment.trim_start();
        let (keyword, rest) = match comment.split_once([' ', '\t']) {
            Some((keyword, rest)) => (keyword, rest.trim_start()),
            None => (comment, ""),
        };

        match keyword {
            "HELP" => {
                let (name, help) = match rest.split_once([' ', '\t']) {
                    Some((name, help)) => (name, help),
                    None => (rest, ""),
                };
                check_metric_name(line, name)?;
                let help = unescape_help(help);

                let state = self.family_mut(name);
                if state.help_seen {
                    return Err(ParseError::new(
                        line,
                        format!("second HELP line for metric name '{}'", name),
                    ));
                }
                state.help_seen = true;
                state.family.help = Some(help);
                Ok(())
            }
            "TYPE" => {
                let mut tokens = rest.split_whitespace();
                let name = tokens.next().unwrap_or("");
                check_metric_name(line, name)?;
                let metric_type = match tokens.next() {
                    Some(t) => t
                        .parse::<MetricType>()
                        .map_err(|e| ParseError::new(line, e))?,
                    None => {
                        return Err(ParseError::new(
                            line,
                            format!("missing type for metric name '{}'", name),
                        ));
                    }
                };
                if tokens.next().is_some() {
                    return Err(ParseError::new(line, "unexpected tokens after metric type"));
                }

                let state = self.family_mut(name);
                if state.type_seen {
                    return Err(ParseError::new(
                        line,
                        format!("second TYPE line for metric name '{}'", name),
                    ));
                }
                if state.has_samples {
                    return Err(ParseError::new(
                        line,
                        format!("TYPE line for metric name '{}' after samples", name),
                    ));
                }
                state.type_seen = true;
                state.family.metric_type = metric_type;
                Ok(())
            }
            // Any other comment is ignored.
            _ => Ok(()),
        }
    }

    /// Work out which family a sample name belongs to.
    fn resolve(&self, name: &str) -> (String, SampleRole) {
        if self.index.contains_key(name) {
            return (name.to_string(), SampleRole::Plain);
        }

        for (suffix, role) in [
            ("_bucket", SampleRole::Bucket),
            ("_sum", SampleRole::Sum),
            ("_count", SampleRole::Count),
        ] {
            if let Some(base) = name.strip_suffix(suffix)
                && let Some(&idx) = self.index.get(base)
            {
                let family_type = self.families[idx].family.metric_type;
                let matches = match role {
                    SampleRole::Bucket => family_type == MetricType::Histogram,
                    _ => matches!(family_type, MetricType::Summary | MetricType::Histogram),
                };
                if matches {
                    return (base.to_string(), role);
                }
            }
        }

        (name.to_string(), SampleRole::Plain)
    }

    fn sample(&mut self, line: usize, sample: Sample) -> Result<(), ParseError> {
        let (family_name, role) = self.resolve(&sample.name);
        let state = self.family_mut(&family_name);
        state.has_samples = true;

        let Sample {
            name,
            mut labels,
            value,
            timestamp_ms,
        } = sample;

        match (state.family.metric_type, role) {
            (MetricType::Counter | MetricType::Gauge | MetricType::Untyped, _) => {
                let value = match state.family.metric_type {
                    MetricType::Counter => MetricValue::Counter(value),
                    MetricType::Gauge => MetricValue::Gauge(value),
                    _ => MetricValue::Untyped(value),
                };
                state.family.metrics.push(Metric {
                    labels,
                    value,
                    timestamp_ms,
                });
            }
            (MetricType::Summary, SampleRole::Plain) => {
                let quantile = take_bound_label(line, &mut labels, "quantile", &name)?;
                let metric = state.series_mut(labels);
                if let MetricValue::Summary { quantiles, .. } = &mut metric.value {
                    quantiles.push(Quantile { quantile, value });
                }
                metric.timestamp_ms = timestamp_ms.or(metric.timestamp_ms);
            }
            (MetricType::Histogram, SampleRole::Bucket) => {
                let upper_bound = take_bound_label(line, &mut labels, "le", &name)?;
                let metric = state.series_mut(labels);
                if let MetricValue::Histogram { buckets, .. } = &mut metric.value {
                    buckets.push(Bucket {
                        upper_bound,
                        cumulative_count: value,
                    });
                }
                metric.timestamp_ms = timestamp_ms.or(metric.timestamp_ms);
            }
            (MetricType::Summary | MetricType::Histogram, SampleRole::Sum) => {
                let metric = state.series_mut(labels);
                match &mut metric.value {
                    MetricValue::Summary { sum, .. } | MetricValue::Histogram { sum, .. } => {
                        *sum = value
                    }
                    _ => {}
                }
                metric.timestamp_ms = timestamp_ms.or(metric.timestamp_ms);
            }
            (MetricType::Summary | MetricType::Histogram, SampleRole::Count) => {
                let metric = state.series_mut(labels);
                match &mut metric.value {
                    MetricValue::Summary { count, .. } | MetricValue::Histogram { count, .. } => {
                        *count = value
                    }
                    _ => {}
                }
                metric.timestamp_ms = timestamp_ms.or(metric.timestamp_ms);
            }
            (family_type, _) => {
                return Err(ParseError::new(
                    line,
                    format!(
                        "unexpected sample '{}' for {} family '{}'",
                        name, family_type, family_name
                    ),
                ));
            }
        }

        Ok(())
    }
}

fn check_metric_name(line: usize, name: &str) -> Result<(), ParseError> {
    if name.is_empty() {
        return Err(ParseError::new(line, "missing metric name"));
    }
    if !is_valid_metric_name(name) {
        return Err(ParseError::new(
            line,
            format!("invalid metric name '{}'", name),
        ));
    }
    Ok(())
}

/// Remove the `quantile`/`le` label and parse its value.
fn take_bound_label(
    line: usize,
    labels: &mut Vec<LabelPair>,
    label: &str,
    sample: &str,
) -> Result<f64, ParseError> {
    let Some(pos) = labels.iter().position(|l| l.name == label) else {
        return Err(ParseError::new(
            line,
            format!("sample '{}' is missing the '{}' label", sample, label),
        ));
    };
    let pair = labels.remove(pos);
    parse_value(line, &pair.value)
}

fn parse_value(line: usize, token: &str) -> Result<f64, ParseError> {
    token
        .parse::<f64>()
        .map_err(|_| ParseError::new(line, format!("invalid value '{}'", token)))
}

fn unescape_help(help: &str) -> String {
    let mut result = String::with_capacity(help.len());
    let mut chars = help.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('\\') => result.push('\\'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }
    result
}

/// Character cursor over a single line.
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
    }

    fn take_while(&mut self, f: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !f(c) {
                break;
            }
            self.bump();
        }
        &self.src[start..self.pos]
    }
}

fn parse_sample(line: usize, text: &str) -> Result<Sample, ParseError> {
    let mut cursor = Cursor::new(text);

    let name = cursor.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
    if name.is_empty() {
        return Err(ParseError::new(
            line,
            format!("expected metric name, found '{}'", text),
        ));
    }
    check_metric_name(line, name)?;

    cursor.skip_ws();
    let labels = if cursor.peek() == Some('{') {
        cursor.bump();
        parse_labels(line, &mut cursor)?
    } else {
        Vec::new()
    };

    let mut tokens = cursor.rest().split_whitespace();
    let value = match tokens.next() {
        Some(token) => parse_value(line, token)?,
        None => {
            return Err(ParseError::new(
                line,
                format!("missing value for metric '{}'", name),
            ));
        }
    };
    let timestamp_ms = match tokens.next() {
        Some(token) => Some(token.parse::<i64>().map_err(|_| {
            ParseError::new(line, format!("invalid timestamp '{}'", token))
        })?),
        None => None,
    };
    if let Some(extra) = tokens.next() {
        return Err(ParseError::new(
            line,
            format!("unexpected token '{}' after sample", extra),
        ));
    }

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp_ms,
    })
}

/// Parse `name="value",...}` with the opening brace already consumed.
fn parse_labels(line: usize, cursor: &mut Cursor<'_>) -> Result<Vec<LabelPair>, ParseError> {
    let mut labels: Vec<LabelPair> = Vec::new();

    loop {
        cursor.skip_ws();
        match cursor.peek() {
            Some('}') => {
                cursor.bump();
                return Ok(labels);
            }
            None => return Err(ParseError::new(line, "unterminated label set")),
            _ => {}
        }

        let name = cursor.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_valid_label_name(name) {
            return Err(ParseError::new(
                line,
                format!("invalid label name near '{}'", cursor.rest()),
            ));
        }

        cursor.skip_ws();
        if cursor.bump() != Some('=') {
            return Err(ParseError::new(
                line,
                format!("expected '=' after label name '{}'", name),
            ));
        }
        cursor.skip_ws();
        if cursor.bump() != Some('"') {
            return Err(ParseError::new(
                line,
                format!("expected quoted value for label '{}'", name),
            ));
        }

        let mut value = String::new();
        loop {
            match cursor.bump() {
                Some('"') => break,
                Some('\\') => match cursor.bump() {
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some('n') => value.push('\n'),
                    Some(other) => {
                        return Err(ParseError::new(
                            line,
                            format!("invalid escape sequence '\\{}' in label value", other),
                        ));
                    }
                    None => return Err(ParseError::new(line, "unterminated label value")),
                },
                Some(c) => value.push(c),
                None => return Err(ParseError::new(line, "unterminated label value")),
            }
        }

        if labels.iter().any(|l| l.name == name) {
            return Err(ParseError::new(
                line,
                format!("duplicate label name '{}'", name),
            ));
        }
        labels.push(LabelPair::new(name, value));

        cursor.skip_ws();
        match cursor.bump() {
            Some(',') => continue,
            Some('}') => return Ok(labels),
            _ => {
                return Err(ParseError::new(
                    line,
                    "expected ',' or '}' after label value",
                ));
            }
        }
    }
}
