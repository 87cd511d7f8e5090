//! HTTP surface of the gateway.

use std::sync::Arc;

use axum::extract::rejection::{FormRejection, QueryRejection};
use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use promgate_common::exposition::text::TEXT_CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::ListenAddr;
use crate::registry::{RegistryError, SharedRegistry, Target};

/// Sender half used to report an unrecoverable error to the process.
pub type FatalSender = Arc<watch::Sender<Option<String>>>;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: SharedRegistry,
    aggregator: Arc<Aggregator>,
    fatal: FatalSender,
}

/// Create the HTTP router.
///
/// `/register` and `/unregister` only exist when `registration` is set.
fn create_router(state: AppState, metrics_path: &str, registration: bool) -> Router {
    let mut router = Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/alive", get(alive_handler))
        .route("/targets", get(targets_handler));

    if registration {
        router = router
            .route("/register", post(register_handler))
            .route("/unregister", post(unregister_handler));
    }

    router.layer(CorsLayer::permissive()).with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    /// Position in this request's snapshot.
    t: Option<String>,
    /// Target name.
    target: Option<String>,
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

/// Handler for the metrics endpoint.
async fn metrics_handler(
    State(state): State<AppState>,
    query: Result<Query<MetricsQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(query)) = query else {
        return bad_request("malformed query string\n");
    };

    let snapshot = state.registry.snapshot();
    let selected = match select_targets(snapshot, &query) {
        Ok(selected) => selected,
        Err(response) => return response,
    };

    let aggregation = state.aggregator.aggregate(&selected).await;

    (
        StatusCode::OK,
        [(CONTENT_TYPE, TEXT_CONTENT_TYPE)],
        aggregation.body,
    )
        .into_response()
}

/// Narrow a snapshot down to the targets a request asked for.
fn select_targets(snapshot: Vec<String>, query: &MetricsQuery) -> Result<Vec<String>, Response> {
    let index = query.t.as_deref().filter(|t| !t.is_empty());
    let name = query.target.as_deref().filter(|t| !t.is_empty());

    match (index, name) {
        (Some(_), Some(_)) => Err(bad_request("use either t or target, not both\n")),
        (Some(raw), None) => {
            let Ok(index) = raw.parse::<usize>() else {
                return Err(bad_request(format!("invalid target index '{}'\n", raw)));
            };
            match snapshot.into_iter().nth(index) {
                Some(literal) => Ok(vec![literal]),
                None => Err(bad_request(format!("target index {} out of range\n", index))),
            }
        }
        (None, Some(name)) => {
            let selected: Vec<String> = snapshot
                .into_iter()
                .filter(|literal| Target::parse(literal).is_ok_and(|t| t.name == name))
                .collect();
            if selected.is_empty() {
                Err((StatusCode::NOT_FOUND, format!("unknown target '{}'\n", name)).into_response())
            } else {
                Ok(selected)
            }
        }
        (None, None) => Ok(snapshot),
    }
}

/// Handler for the /alive endpoint.
async fn alive_handler() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct TargetEntry {
    index: usize,
    name: String,
    url: String,
}

/// Handler for the /targets endpoint.
async fn targets_handler(State(state): State<AppState>) -> Json<Vec<TargetEntry>> {
    let entries = state
        .registry
        .snapshot()
        .into_iter()
        .enumerate()
        .filter_map(|(index, literal)| {
            Target::parse(&literal).ok().map(|t| TargetEntry {
                index,
                name: t.name,
                url: t.url,
            })
        })
        .collect();

    Json(entries)
}

#[derive(Debug, Deserialize)]
struct RegistrationForm {
    name: Option<String>,
    address: Option<String>,
    schema: Option<String>,
}

impl RegistrationForm {
    /// Build the `name=schema://address` literal.
    fn literal(&self) -> Option<String> {
        let name = self.name.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let address = self
            .address
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        let schema = self
            .schema
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("http");

        Some(format!("{}={}://{}", name, schema, address))
    }
}

#[derive(Debug, Clone, Copy)]
enum Mutation {
    Register,
    Unregister,
}

async fn register_handler(
    State(state): State<AppState>,
    form: Result<Form<RegistrationForm>, FormRejection>,
) -> Response {
    mutate(state, form, Mutation::Register).await
}

async fn unregister_handler(
    State(state): State<AppState>,
    form: Result<Form<RegistrationForm>, FormRejection>,
) -> Response {
    mutate(state, form, Mutation::Unregister).await
}

async fn mutate(
    state: AppState,
    form: Result<Form<RegistrationForm>, FormRejection>,
    mutation: Mutation,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(e) => {
            debug!(error = %e, "Rejected registration form");
            return bad_request(format!("{}\n", e.body_text()));
        }
    };

    let Some(literal) = form.literal() else {
        return bad_request("name and address are required\n");
    };

    let registry = state.registry.clone();
    let task_literal = literal.clone();
    let outcome = tokio::task::spawn_blocking(move || match mutation {
        Mutation::Register => registry.add(&task_literal),
        Mutation::Unregister => registry.remove(&task_literal),
    })
    .await;

    match outcome {
        Ok(Ok(changed)) => {
            info!(literal = %literal, ?mutation, changed, "Registry updated");
            StatusCode::OK.into_response()
        }
        Ok(Err(RegistryError::InvalidTarget(e))) => bad_request(format!("{}\n", e)),
        Ok(Err(e)) => {
            error!(literal = %literal, error = %e, "Failed to persist target registry");
            state.fatal.send_replace(Some(e.to_string()));
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            warn!(literal = %literal, error = %e, "Registry update task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    registry: SharedRegistry,
    aggregator: Arc<Aggregator>,
    fatal: FatalSender,
    listen_addr: ListenAddr,
    metrics_path: String,
    registration: bool,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        registry: SharedRegistry,
        aggregator: Arc<Aggregator>,
        fatal: FatalSender,
        listen_addr: ListenAddr,
        metrics_path: String,
        registration: bool,
    ) -> Self {
        Self {
            registry,
            aggregator,
            fatal,
            listen_addr,
            metrics_path,
            registration,
        }
    }

    fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            aggregator: self.aggregator.clone(),
            fatal: self.fatal.clone(),
        };
        create_router(state, &self.metrics_path, self.registration)
    }

    /// Bind the configured address and serve until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        match self.listen_addr.clone() {
            ListenAddr::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;
                self.serve(listener, shutdown).await
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                let listener = bind_unix(&path)?;
                self.serve_unix(listener, shutdown).await
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(path) => Err(anyhow::anyhow!(
                "Unix sockets are not supported on this platform: {}",
                path.display()
            )),
        }
    }

    /// Serve on an already bound TCP listener.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let router = self.router();
        let addr = listener.local_addr()?;
        self.log_listening(&addr.to_string());

        axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown(shutdown))
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Serve on an already bound unix socket listener.
    #[cfg(unix)]
    pub async fn serve_unix(
        self,
        listener: tokio::net::UnixListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let router = self.router();
        self.log_listening(&self.listen_addr.to_string());

        axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown(shutdown))
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }

    fn log_listening(&self, addr: &str) {
        info!(
            addr = %addr,
            path = %self.metrics_path,
            registration = self.registration,
            "HTTP server listening"
        );
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if shutdown.changed().await.is_err() {
            break;
        }
        if *shutdown.borrow() {
            break;
        }
    }
    info!("HTTP server shutting down");
}

/// Bind a unix socket, replacing a stale socket file and opening it to all users.
#[cfg(unix)]
pub fn bind_unix(path: &std::path::Path) -> anyhow::Result<tokio::net::UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to remove stale socket {}: {}",
                path.display(),
                e
            ));
        }
    }

    let listener = tokio::net::UnixListener::bind(path)
        .map_err(|e| anyhow::anyhow!("Failed to bind to unix:{}: {}", path.display(), e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;

    Ok(listener)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::ScrapeConfig;
    use crate::dispatcher::Dispatcher;
    use crate::encoder::Encoder;
    use crate::registry::{PersistPolicy, TargetRegistry};

    struct Harness {
        router: Router,
        registry: SharedRegistry,
        fatal: watch::Receiver<Option<String>>,
    }

    fn harness(registry: TargetRegistry, registration: bool) -> Harness {
        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::new(&ScrapeConfig {
            timeout_ms: 500,
            max_concurrent_fetches: 0,
            insecure_skip_verify: false,
        })
        .unwrap();
        let aggregator = Arc::new(Aggregator::new(
            dispatcher,
            Some("ae_source".to_string()),
            Encoder::new(false),
        ));
        let (fatal_tx, fatal_rx) = watch::channel(None);

        let state = AppState {
            registry: registry.clone(),
            aggregator,
            fatal: Arc::new(fatal_tx),
        };

        Harness {
            router: create_router(state, "/metrics", registration),
            registry,
            fatal: fatal_rx,
        }
    }

    async fn backend(body: &'static str) -> SocketAddr {
        let router = Router::new().route("/metrics", get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn get_request(router: &Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post_form(router: &Router, uri: &str, form: &str) -> StatusCode {
        router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(form.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_alive_endpoint() {
        let h = harness(TargetRegistry::in_memory(), false);
        let (status, body) = get_request(&h.router, "/alive").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_content_type() {
        let h = harness(TargetRegistry::in_memory(), false);

        let response = h
            .router
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            TEXT_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_metrics_index_selection() {
        let a = backend("first 1\n").await;
        let b = backend("second 2\n").await;
        let c = backend("third 3\n").await;

        let registry = TargetRegistry::in_memory();
        registry.add(&format!("a=http://{}/metrics", a)).unwrap();
        registry.add(&format!("b=http://{}/metrics", b)).unwrap();
        registry.add(&format!("c=http://{}/metrics", c)).unwrap();
        let h = harness(registry, false);

        let (status, body) = get_request(&h.router, "/metrics?t=0").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("first{ae_source=\"a\"} 1"));
        assert!(!body.contains("second"));
        assert!(!body.contains("third"));

        let (status, _) = get_request(&h.router, "/metrics?t=5").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_request(&h.router, "/metrics?t=-1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_request(&h.router, "/metrics?t=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // An empty index means no selection
        let (status, body) = get_request(&h.router, "/metrics?t=").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("first") && body.contains("second") && body.contains("third"));
    }

    #[tokio::test]
    async fn test_metrics_name_selection() {
        let a = backend("first 1\n").await;
        let b = backend("second 2\n").await;

        let registry = TargetRegistry::in_memory();
        registry.add(&format!("a=http://{}/metrics", a)).unwrap();
        registry.add(&format!("b=http://{}/metrics", b)).unwrap();
        let h = harness(registry, false);

        let (status, body) = get_request(&h.router, "/metrics?target=b").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("second{ae_source=\"b\"} 2"));
        assert!(!body.contains("first"));

        let (status, _) = get_request(&h.router, "/metrics?target=nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_request(&h.router, "/metrics?target=a&t=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_targets_listing() {
        let registry = TargetRegistry::in_memory();
        registry.add("b=http://h2:2/metrics").unwrap();
        registry.add("a=http://h1:1/metrics").unwrap();
        let h = harness(registry, false);

        let (status, body) = get_request(&h.router, "/targets").await;
        assert_eq!(status, StatusCode::OK);

        let entries: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(entries[0]["index"], 0);
        assert_eq!(entries[0]["name"], "a");
        assert_eq!(entries[0]["url"], "http://h1:1/metrics");
        assert_eq!(entries[1]["name"], "b");
    }

    #[tokio::test]
    async fn test_registration_routes_gated() {
        let h = harness(TargetRegistry::in_memory(), false);

        let status = post_form(&h.router, "/register", "name=a&address=h:1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_idempotent() {
        let h = harness(TargetRegistry::in_memory(), true);

        let form = "name=a&address=x";
        assert_eq!(post_form(&h.router, "/register", form).await, StatusCode::OK);
        assert_eq!(post_form(&h.router, "/register", form).await, StatusCode::OK);

        assert_eq!(h.registry.snapshot(), vec!["a=http://x".to_string()]);
    }

    #[tokio::test]
    async fn test_register_with_schema() {
        let h = harness(TargetRegistry::in_memory(), true);

        let status = post_form(
            &h.router,
            "/register",
            "name=secure&address=host%3A8443%2Fmetrics&schema=https",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(h.registry.contains("secure=https://host:8443/metrics"));
    }

    #[tokio::test]
    async fn test_register_missing_fields() {
        let h = harness(TargetRegistry::in_memory(), true);

        assert_eq!(
            post_form(&h.router, "/register", "name=a").await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post_form(&h.router, "/register", "address=x").await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post_form(&h.router, "/unregister", "name=&address=x").await,
            StatusCode::BAD_REQUEST
        );
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_malformed_form() {
        let h = harness(TargetRegistry::in_memory(), true);

        let status = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"name\":\"a\"}"))
                    .unwrap(),
            )
            .await
            .unwrap()
            .status();

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = TargetRegistry::in_memory();
        registry.add("a=http://x").unwrap();
        let h = harness(registry, true);

        let form = "name=a&address=x";
        assert_eq!(post_form(&h.router, "/unregister", form).await, StatusCode::OK);
        assert!(h.registry.is_empty());

        // Absent target is a no-op
        assert_eq!(post_form(&h.router, "/unregister", form).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_persist_failure_signals_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("missing").join("targets.cache");
        let h = harness(
            TargetRegistry::new(Some(cache), PersistPolicy::Fatal),
            true,
        );

        let status = post_form(&h.router, "/register", "name=a&address=x").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(h.fatal.borrow().is_some());
    }

    #[tokio::test]
    async fn test_persist_failure_tolerated_with_warn_policy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("missing").join("targets.cache");
        let h = harness(TargetRegistry::new(Some(cache), PersistPolicy::Warn), true);

        let status = post_form(&h.router, "/register", "name=a&address=x").await;

        assert_eq!(status, StatusCode::OK);
        assert!(h.fatal.borrow().is_none());
        assert!(h.registry.contains("a=http://x"));
    }
}
