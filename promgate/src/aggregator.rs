//! The per-request aggregation pipeline: dispatch, merge, encode.

use tracing::debug;

use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::encoder::Encoder;
use crate::merger::Merger;

/// Counts describing one aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationSummary {
    /// Targets scraped.
    pub targets: usize,
    /// Targets whose data made it into the merge.
    pub succeeded: usize,
    /// Targets that failed to fetch or parse.
    pub failed: usize,
    /// Families written.
    pub families: usize,
    /// Families dropped at encode time.
    pub skipped_families: usize,
}

/// A rendered aggregation.
#[derive(Debug)]
pub struct Aggregation {
    /// Text exposition body.
    pub body: Vec<u8>,
    pub summary: AggregationSummary,
}

/// Scrapes a set of targets and renders the merged result.
pub struct Aggregator {
    dispatcher: Dispatcher,
    origin_label: Option<String>,
    encoder: Encoder,
}

impl Aggregator {
    pub fn new(dispatcher: Dispatcher, origin_label: Option<String>, encoder: Encoder) -> Self {
        Self {
            dispatcher,
            origin_label,
            encoder,
        }
    }

    /// Build the pipeline from gateway configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::new(
            Dispatcher::new(&config.scrape)?,
            config.origin_label.label().map(str::to_string),
            Encoder::new(config.output.strip_comments),
        ))
    }

    /// Scrape every literal and render the union of what succeeded.
    ///
    /// Results are merged as they complete. Failed targets contribute
    /// nothing. If the returned future is dropped, outstanding scrapes are
    /// aborted.
    pub async fn aggregate<S: AsRef<str>>(&self, literals: &[S]) -> Aggregation {
        let mut dispatch = self.dispatcher.dispatch(literals);
        let mut merger = Merger::new(self.origin_label.as_deref());

        while let Some(result) = dispatch.next().await {
            merger.absorb(result);
        }

        let merged = merger.finish();
        let mut body = Vec::new();
        let encoded = self.encoder.encode(&merged, &mut body);

        let summary = AggregationSummary {
            targets: literals.len(),
            succeeded: merged.succeeded,
            failed: merged.failed,
            families: encoded.encoded,
            skipped_families: encoded.skipped,
        };

        debug!(
            targets = summary.targets,
            succeeded = summary.succeeded,
            failed = summary.failed,
            families = summary.families,
            bytes = body.len(),
            "Aggregation complete"
        );

        Aggregation { body, summary }
    }
}
