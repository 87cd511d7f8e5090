//! Aggregating gateway for Prometheus metrics.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio::sync::watch;
use tracing::{error, info, warn};

use promgate::{Aggregator, GatewayConfig, HttpServer, TargetRegistry};

/// Aggregating gateway for Prometheus metrics.
#[derive(Parser, Debug, Default)]
#[command(name = "promgate")]
#[command(about = "Scrape many Prometheus targets and serve their merged metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, env = "PROMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, e.g. 127.0.0.1:8080 (overrides config).
    #[arg(long, env = "SERVER_BIND")]
    listen: Option<String>,

    /// Comma separated targets, `url` or `name=url` (replaces configured targets).
    #[arg(long, env = "TARGETS", value_delimiter = ',')]
    targets: Vec<String>,

    /// Per-target scrape timeout in milliseconds.
    #[arg(long, env = "TARGETS_SCRAPE_TIMEOUT")]
    scrape_timeout_ms: Option<u64>,

    /// Maximum scrapes in flight at once (0 = unbounded).
    #[arg(long, env = "TARGETS_MAX_CONCURRENT_FETCHES")]
    max_concurrent_fetches: Option<usize>,

    /// Add a label naming the origin target to every metric.
    #[arg(long, env = "TARGETS_LABEL", action = ArgAction::Set)]
    target_label: Option<bool>,

    /// Name of the origin label.
    #[arg(long, env = "TARGETS_LABEL_NAME")]
    target_label_name: Option<String>,

    /// Enable the /register and /unregister endpoints.
    #[arg(long, env = "TARGETS_DYNAMIC_REGISTRATION")]
    dynamic_registration: bool,

    /// File mirroring registered targets across restarts.
    #[arg(long, env = "TARGETS_CACHE_PATH")]
    cache_path: Option<PathBuf>,

    /// Disable verification of target TLS certificates.
    #[arg(long, env = "INSECURE_SKIP_VERIFY")]
    insecure_skip_verify: bool,

    /// Remove HELP and TYPE lines from the aggregated output.
    #[arg(long, env = "STRIP_COMMENTS")]
    strip_comments: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Shorthand for `--log-level debug`.
    #[arg(short, long, env = "VERBOSE")]
    verbose: bool,
}

impl Args {
    /// Apply command-line values on top of the file configuration.
    fn apply(self, config: &mut GatewayConfig) {
        if let Some(listen) = self.listen {
            config.server.listen = listen;
        }

        let targets: Vec<String> = self
            .targets
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if !targets.is_empty() {
            config.targets = targets;
        }

        if let Some(timeout_ms) = self.scrape_timeout_ms {
            config.scrape.timeout_ms = timeout_ms;
        }
        if let Some(max) = self.max_concurrent_fetches {
            config.scrape.max_concurrent_fetches = max;
        }
        if self.insecure_skip_verify {
            config.scrape.insecure_skip_verify = true;
        }

        if let Some(enabled) = self.target_label {
            config.origin_label.enabled = enabled;
        }
        if let Some(name) = self.target_label_name {
            config.origin_label.name = name;
        }

        if self.dynamic_registration {
            config.registration.enabled = true;
        }
        if let Some(path) = self.cache_path {
            config.registration.cache_path = Some(path);
        }

        if self.strip_comments {
            config.output.strip_comments = true;
        }

        if let Some(level) = self.log_level {
            config.logging.level = level;
        } else if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => GatewayConfig::read_file(path)?,
        None => GatewayConfig::default(),
    };
    args.apply(&mut config);

    promgate_common::init_tracing(&config.logging)?;
    config.validate()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting promgate");

    if !config.registration.enabled && config.registration.cache_path.is_some() {
        warn!("Cache path is ignored because dynamic registration is disabled");
    }
    for literal in &config.targets {
        info!(literal = %literal.trim(), "Configured target");
    }

    let registry = Arc::new(TargetRegistry::open(
        config.targets.iter().filter(|t| !t.trim().is_empty()),
        config.cache_path().map(|p| p.to_path_buf()),
        config.registration.on_persist_error,
    )?);
    info!(targets = registry.len(), "Target registry ready");

    let aggregator = Arc::new(Aggregator::from_config(&config)?);

    let listen_addr = config.listen_addr()?;

    // Create shutdown and fatal-error signals
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = watch::channel(None::<String>);

    let http_server = HttpServer::new(
        registry.clone(),
        aggregator,
        Arc::new(fatal_tx),
        listen_addr,
        config.server.metrics_path.clone(),
        config.registration.enabled,
    );
    let mut http_task = tokio::spawn(http_server.run(shutdown_rx));

    let fatal = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received Ctrl+C, shutting down...");
            None
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM, shutting down...");
            None
        }
        _ = fatal_rx.changed() => {
            fatal_rx.borrow().clone()
        }
        result = &mut http_task => {
            return match result {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
        }
    };

    // Signal shutdown
    shutdown_tx.send_replace(true);

    if tokio::time::timeout(Duration::from_secs(5), &mut http_task)
        .await
        .is_err()
    {
        warn!("HTTP server did not stop in time");
        http_task.abort();
    }

    info!(targets = registry.len(), "Gateway stopped");

    match fatal {
        Some(reason) => {
            error!(reason = %reason, "Exiting after fatal error");
            Err(anyhow::anyhow!("Fatal error: {}", reason))
        }
        None => Ok(()),
    }
}

/// Resolve when the process receives SIGTERM.
async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
