//! Concurrent scrape fan-out.
//!
//! Every target of a request gets its own task. Results are handed back in
//! completion order through [`Dispatch::next`]. Dropping a [`Dispatch`]
//! aborts whatever is still in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use promgate_common::MetricFamily;
use promgate_common::exposition::{ParseError, parse};
use reqwest::header::ACCEPT;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, trace};

use crate::config::ScrapeConfig;
use crate::registry::{Target, TargetError};

/// Accept header sent to targets; asks for the text format.
const ACCEPT_TEXT: &str = "text/plain;version=0.0.4;q=0.9,*/*;q=0.1";

/// Why a single target produced no data.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    InvalidTarget(#[from] TargetError),

    #[error("failed to fetch {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} did not respond within {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("{url} responded with HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to read body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse metrics from {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },

    #[error("scrape task did not complete: {0}")]
    Task(String),
}

impl FetchError {
    /// Whether the failure was the per-target timeout firing.
    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::Request { source, .. } | FetchError::Body { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }
}

/// Outcome of scraping one target.
#[derive(Debug)]
pub struct FetchResult {
    /// Target name (origin label value).
    pub name: String,
    /// Scraped URL.
    pub url: String,
    /// Wall time spent on the request.
    pub elapsed: Duration,
    /// Parsed families or the reason there are none.
    pub outcome: Result<Vec<MetricFamily>, FetchError>,
}

/// Issues scrapes against targets.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    /// Bound on one target, from dispatch to result, permit wait included.
    timeout: Duration,
    /// Caps scrapes in flight across all requests, when configured.
    limiter: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    /// Create a dispatcher from the scrape settings.
    pub fn new(config: &ScrapeConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()?;

        let limiter = (config.max_concurrent_fetches > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_fetches)));

        Ok(Self {
            client,
            timeout: config.timeout(),
            limiter,
        })
    }

    /// Start one scrape per target literal.
    pub fn dispatch<S: AsRef<str>>(&self, literals: &[S]) -> Dispatch {
        let mut tasks = JoinSet::new();

        for literal in literals {
            let literal = literal.as_ref().to_string();
            let client = self.client.clone();
            let limiter = self.limiter.clone();
            let timeout = self.timeout;

            tasks.spawn(async move { fetch(client, limiter, timeout, literal).await });
        }

        Dispatch {
            tasks,
            remaining: literals.len(),
        }
    }
}

/// Scrapes started by [`Dispatcher::dispatch`].
pub struct Dispatch {
    tasks: JoinSet<FetchResult>,
    remaining: usize,
}

impl Dispatch {
    /// Results not yet collected.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Wait for the next scrape to finish.
    ///
    /// Returns `None` once one result per dispatched target has been returned.
    pub async fn next(&mut self) -> Option<FetchResult> {
        let joined = self.tasks.join_next().await?;
        self.remaining = self.remaining.saturating_sub(1);

        Some(joined.unwrap_or_else(task_failure))
    }
}

/// Result standing in for a scrape task that panicked or was cancelled.
fn task_failure(e: JoinError) -> FetchResult {
    error!(error = %e, "Scrape task failed");
    FetchResult {
        name: "unknown".to_string(),
        url: String::new(),
        elapsed: Duration::ZERO,
        outcome: Err(FetchError::Task(e.to_string())),
    }
}

async fn fetch(
    client: reqwest::Client,
    limiter: Option<Arc<Semaphore>>,
    timeout: Duration,
    literal: String,
) -> FetchResult {
    let target = match Target::parse(&literal) {
        Ok(target) => target,
        Err(e) => {
            return FetchResult {
                name: literal.clone(),
                url: literal,
                elapsed: Duration::ZERO,
                outcome: Err(e.into()),
            };
        }
    };

    let start = Instant::now();
    let bounded = tokio::time::timeout(timeout, async {
        // Held until the scrape finishes. The semaphore is never closed.
        let _permit = match limiter {
            Some(limiter) => limiter.acquire_owned().await.ok(),
            None => None,
        };
        scrape(&client, &target.url).await
    });
    let outcome = match bounded.await {
        Ok(outcome) => outcome,
        Err(_) => Err(FetchError::Timeout {
            url: target.url.clone(),
            timeout,
        }),
    };
    let elapsed = start.elapsed();

    trace!(
        name = %target.name,
        url = %target.url,
        elapsed_ms = elapsed.as_millis() as u64,
        ok = outcome.is_ok(),
        "Scrape finished"
    );

    FetchResult {
        name: target.name,
        url: target.url,
        elapsed,
        outcome,
    }
}

async fn scrape(client: &reqwest::Client, url: &str) -> Result<Vec<MetricFamily>, FetchError> {
    let response = client
        .get(url)
        .header(ACCEPT, ACCEPT_TEXT)
        .send()
        .await
        .map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
        });
    }

    let body = response.text().await.map_err(|source| FetchError::Body {
        url: url.to_string(),
        source,
    })?;

    parse(&body).map_err(|source| FetchError::Parse {
        url: url.to_string(),
        source,
    })
}
