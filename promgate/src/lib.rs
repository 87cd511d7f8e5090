//! Aggregating gateway for Prometheus metrics.
//!
//! On every scrape of the metrics endpoint the gateway fetches all registered
//! targets concurrently, merges their metric families and serves the result
//! as one text exposition document. Each series is tagged with the name of
//! the target it came from.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌────────┐   ┌─────────┐
//! │ Registry │──>│ Dispatcher │──>│ Merger │──>│ Encoder │──> response
//! │ snapshot │   │ (fan-out)  │   │        │   │         │
//! └──────────┘   └────────────┘   └────────┘   └─────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! promgate --targets node=http://localhost:9100/metrics,app=http://localhost:8000/metrics
//! promgate --config promgate.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::GatewayConfig`] for configuration options.

pub mod aggregator;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod http;
pub mod merger;
pub mod registry;

pub use aggregator::{Aggregation, AggregationSummary, Aggregator};
pub use config::{GatewayConfig, ListenAddr};
pub use dispatcher::{Dispatch, Dispatcher, FetchError, FetchResult};
pub use encoder::{EncodeSummary, Encoder};
pub use http::{FatalSender, HttpServer};
pub use merger::{MergedFamilies, Merger};
pub use registry::{PersistPolicy, SharedRegistry, Target, TargetRegistry};
