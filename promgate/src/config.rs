//! Configuration for the gateway.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use promgate_common::{LoggingConfig, is_valid_label_name, load_config, parse_config};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{PersistPolicy, Target};

/// Routes owned by the gateway that the metrics path may not shadow.
pub const RESERVED_PATHS: &[&str] = &["/alive", "/targets", "/register", "/unregister"];

/// Label names the writer adds itself for summaries and histograms.
pub const RESERVED_LABELS: &[&str] = &["le", "quantile"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] promgate_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Where the HTTP server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP socket address, e.g. `0.0.0.0:8080`.
    Tcp(SocketAddr),
    /// Unix domain socket path, written as `unix:/path/to/file.sock`.
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ConfigError::Validation(
                    "Unix socket path is empty".to_string(),
                ));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }

        s.parse()
            .map(ListenAddr::Tcp)
            .map_err(|_| ConfigError::Validation(format!("Invalid listen address: {}", s)))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbound scrape settings.
    #[serde(default)]
    pub scrape: ScrapeConfig,

    /// Initial target literals (`name=url` or a bare url).
    #[serde(default)]
    pub targets: Vec<String>,

    /// Origin label settings.
    #[serde(default)]
    pub origin_label: OriginLabelConfig,

    /// Dynamic registration settings.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Output rendering settings.
    #[serde(default)]
    pub output: OutputConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0:8080"), or `unix:<path>`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for the aggregated metrics endpoint (default: "/metrics").
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_path: default_metrics_path(),
        }
    }
}

/// Target scrape configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Per-target request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum number of scrapes in flight across all requests (0 = unbounded).
    #[serde(default)]
    pub max_concurrent_fetches: usize,

    /// Accept invalid TLS certificates from targets.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_concurrent_fetches: 0,
            insecure_skip_verify: false,
        }
    }
}

impl ScrapeConfig {
    /// Per-target timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Origin label configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginLabelConfig {
    /// Tag every merged metric with the target it came from.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Label name carrying the target name (default: "ae_source").
    #[serde(default = "default_label_name")]
    pub name: String,
}

fn default_true() -> bool {
    true
}

fn default_label_name() -> String {
    "ae_source".to_string()
}

impl Default for OriginLabelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_label_name(),
        }
    }
}

impl OriginLabelConfig {
    /// The label name to stamp, if labelling is enabled.
    pub fn label(&self) -> Option<&str> {
        self.enabled.then_some(self.name.as_str())
    }
}

/// Dynamic registration configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Expose `/register` and `/unregister`.
    #[serde(default)]
    pub enabled: bool,

    /// File mirroring the registered targets across restarts.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// What to do when the cache file cannot be written.
    #[serde(default)]
    pub on_persist_error: PersistPolicy,
}

/// Output rendering configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Drop HELP/TYPE comment lines from the aggregated output.
    #[serde(default)]
    pub strip_comments: bool,
}

impl GatewayConfig {
    /// Read a JSON5 file without validating it.
    ///
    /// Callers apply command-line overrides and then call [`validate`](Self::validate).
    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(load_config(path)?)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// The parsed listen address.
    pub fn listen_addr(&self) -> Result<ListenAddr, ConfigError> {
        self.server.listen.parse()
    }

    /// The cache file to use, if any.
    ///
    /// A cache is only meaningful with dynamic registration enabled.
    pub fn cache_path(&self) -> Option<&Path> {
        if self.registration.enabled {
            self.registration.cache_path.as_deref()
        } else {
            None
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        if !self.server.metrics_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if !self
            .server
            .metrics_path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/-_.~".contains(c))
        {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} may only contain letters, digits and /-_.~",
                self.server.metrics_path
            )));
        }

        if RESERVED_PATHS.contains(&self.server.metrics_path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} collides with a built-in route",
                self.server.metrics_path
            )));
        }

        if self.scrape.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "scrape timeout_ms must be > 0".to_string(),
            ));
        }

        if self.origin_label.enabled && !is_valid_label_name(&self.origin_label.name) {
            return Err(ConfigError::Validation(format!(
                "Invalid origin label name: {}",
                self.origin_label.name
            )));
        }

        if self.origin_label.enabled
            && RESERVED_LABELS.contains(&self.origin_label.name.as_str())
        {
            return Err(ConfigError::Validation(format!(
                "Origin label name {} is reserved for summaries and histograms",
                self.origin_label.name
            )));
        }

        for literal in &self.targets {
            let literal = literal.trim();
            if literal.is_empty() {
                continue;
            }
            Target::parse(literal).map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        let has_targets = self.targets.iter().any(|t| !t.trim().is_empty());
        if !has_targets && !self.registration.enabled {
            return Err(ConfigError::Validation(
                "No initial targets configured and dynamic registration is disabled".to_string(),
            ));
        }

        Ok(())
    }
}
