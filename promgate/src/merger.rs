//! Merging of per-target metric families.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use promgate_common::{LabelPair, Metric, MetricFamily};
use tracing::{debug, warn};

use crate::dispatcher::FetchResult;

/// Accumulates fetch results into one family map.
///
/// Families are keyed by name, so they come out sorted. Metrics within a
/// family keep the order in which their targets completed.
pub struct Merger {
    origin_label: Option<String>,
    families: BTreeMap<String, MetricFamily>,
    succeeded: usize,
    failed: usize,
}

/// The merged outcome of one aggregation.
#[derive(Debug, Default)]
pub struct MergedFamilies {
    /// Families by name.
    pub families: BTreeMap<String, MetricFamily>,
    /// Targets whose data was merged.
    pub succeeded: usize,
    /// Targets skipped because their fetch failed.
    pub failed: usize,
}

impl MergedFamilies {
    /// Family names in output order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    /// Look up a family by name.
    pub fn get(&self, name: &str) -> Option<&MetricFamily> {
        self.families.get(name)
    }

    /// Families in output order.
    pub fn iter(&self) -> impl Iterator<Item = &MetricFamily> {
        self.families.values()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

impl Merger {
    /// Create a merger; `origin_label` names the label stamped with the target name.
    pub fn new(origin_label: Option<&str>) -> Self {
        Self {
            origin_label: origin_label.map(str::to_string),
            families: BTreeMap::new(),
            succeeded: 0,
            failed: 0,
        }
    }

    /// Fold one fetch result in. Returns whether it contributed data.
    pub fn absorb(&mut self, result: FetchResult) -> bool {
        let FetchResult {
            name,
            url,
            elapsed,
            outcome,
        } = result;

        let families = match outcome {
            Ok(families) => families,
            Err(e) => {
                warn!(name = %name, url = %url, error = %e, "Fetch error");
                self.failed += 1;
                return false;
            }
        };

        for mut family in families {
            if let Some(label) = &self.origin_label {
                for metric in &mut family.metrics {
                    stamp_origin(metric, label, &name);
                }
            }

            match self.families.entry(family.name.clone()) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    if existing.metric_type != family.metric_type {
                        warn!(
                            family = %family.name,
                            expected = %existing.metric_type,
                            found = %family.metric_type,
                            origin = %name,
                            "Family type differs between targets"
                        );
                    }
                    if existing.help.is_none() {
                        existing.help = family.help.take();
                    }
                    existing.metrics.append(&mut family.metrics);
                }
                Entry::Vacant(entry) => {
                    entry.insert(family);
                }
            }
        }

        debug!(
            name = %name,
            url = %url,
            elapsed_secs = elapsed.as_secs_f64(),
            "Target refreshed"
        );
        self.succeeded += 1;
        true
    }

    /// Finish merging.
    pub fn finish(self) -> MergedFamilies {
        MergedFamilies {
            families: self.families,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }
}

/// Add the origin label to a metric.
///
/// A scraped label with the same name is kept as `exported_<label>`.
fn stamp_origin(metric: &mut Metric, label: &str, origin: &str) {
    if let Some(pos) = metric.labels.iter().position(|l| l.name == label) {
        let scraped = metric.labels.remove(pos);
        let exported = format!("exported_{}", label);
        if metric.label(&exported).is_none() {
            metric
                .labels
                .insert(pos, LabelPair::new(exported, scraped.value));
        }
    }
    metric.labels.push(LabelPair::new(label, origin));
}
