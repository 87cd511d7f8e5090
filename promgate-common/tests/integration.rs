//! Integration tests for the exposition format support.

use promgate_common::exposition::{WriteOptions, parse, write_family};
use promgate_common::{MetricType, MetricValue};

const NODE_FIXTURE: &str = include_str!("fixtures/node.prom");

fn render_all(families: &[promgate_common::MetricFamily]) -> String {
    let mut out = Vec::new();
    for family in families {
        write_family(family, &mut out, WriteOptions::default()).expect("encode failed");
    }
    String::from_utf8(out).expect("output should be UTF-8")
}

#[test]
fn test_parse_exporter_fixture() {
    let families = parse(NODE_FIXTURE).expect("fixture should parse");

    let names: Vec<&str> = families.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "go_gc_duration_seconds",
            "go_goroutines",
            "http_request_duration_seconds",
            "node_network_receive_bytes_total",
            "process_start_time_seconds",
        ]
    );

    assert_eq!(families[0].metric_type, MetricType::Summary);
    assert_eq!(families[2].metric_type, MetricType::Histogram);
    assert_eq!(families[3].metrics.len(), 2);
    assert_eq!(families[4].metric_type, MetricType::Untyped);
    assert_eq!(
        families[3].metrics[0].value,
        MetricValue::Counter(1_234_567_890.0)
    );
}

#[test]
fn test_rendered_fixture_parses_to_same_families() {
    let families = parse(NODE_FIXTURE).unwrap();
    let rendered = render_all(&families);

    // Free-form comments are not carried over
    assert!(!rendered.contains("free-form"));
    assert!(rendered.contains("# TYPE http_request_duration_seconds histogram"));
    assert!(rendered.contains(
        "http_request_duration_seconds_bucket{handler=\"/metrics\",le=\"+Inf\"} 131"
    ));

    let reparsed = parse(&rendered).expect("rendered output should parse");
    assert_eq!(reparsed, families);
}

#[test]
fn test_stripped_output_is_still_parseable() {
    let families = parse(NODE_FIXTURE).unwrap();
    let mut out = Vec::new();
    for family in &families {
        write_family(
            family,
            &mut out,
            WriteOptions {
                strip_comments: true,
            },
        )
        .unwrap();
    }
    let stripped = String::from_utf8(out).unwrap();

    assert!(stripped.lines().all(|l| !l.starts_with('#')));
    // Without TYPE lines every sample becomes its own untyped family
    let reparsed = parse(&stripped).unwrap();
    assert!(reparsed.iter().all(|f| f.metric_type == MetricType::Untyped));
    assert!(reparsed.iter().any(|f| f.name == "go_gc_duration_seconds_sum"));
}
