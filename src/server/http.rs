//! HTTP surface: the `/ws` upgrade plus read-only JSON endpoints.

use axum::extract::{FromRef, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::metrics::{metrics_handler, STD_METRICS};
use super::ws::{now_ms, ws_handler, WsServerState};
use crate::catalog::{self, CatalogError, DriverCatalog};
use crate::config::{FleetConfig, ToolConfig};
use crate::fleet::{CommandDispatcher, ConnectionCode, DeviceRegistry};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Clone)]
pub struct AppState {
    pub ws: Arc<WsServerState>,
    pub catalog: Arc<dyn DriverCatalog>,
    pub tool: ToolConfig,
    pub started_at: Instant,
}

impl FromRef<AppState> for Arc<WsServerState> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.ws)
    }
}

impl AppState {
    pub fn from_config(config: &FleetConfig) -> Result<Self, ServerError> {
        let registry = Arc::new(DeviceRegistry::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            config.dispatch.batch_window(),
        ));
        let ws = Arc::new(WsServerState::new(
            registry,
            dispatcher,
            config.transport.clone(),
        ));
        Ok(Self {
            ws,
            catalog: Arc::from(catalog::from_config(&config.catalog)?),
            tool: config.tool.clone(),
            started_at: Instant::now(),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/drivers", get(list_drivers))
        .route("/api/drivers/{id}", get(get_driver))
        .route("/api/tool-download", get(tool_download))
        .route("/api/devices/{code}", get(list_devices))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "ts": now_ms(),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "devicesOnline": state.ws.registry.online_count(),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    STD_METRICS
        .uptime_seconds
        .set(state.started_at.elapsed().as_secs_f64());
    metrics_handler().await
}

/// Upstream failures degrade to an empty list.
async fn list_drivers(State(state): State<AppState>) -> impl IntoResponse {
    match state.catalog.list().await {
        Ok(drivers) => Json(drivers),
        Err(err) => {
            warn!(error = %err, "driver catalog unavailable");
            Json(Vec::new())
        }
    }
}

async fn get_driver(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.catalog.lookup(&id).await {
        Ok(Some(driver)) => Json(driver).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "driver not found"),
        Err(err) => {
            warn!(error = %err, driver_id = %id, "driver lookup failed");
            error_response(StatusCode::BAD_GATEWAY, "driver catalog unavailable")
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDownload {
    tool_name: String,
    tool_version: String,
    download_url: Option<String>,
    has_download: bool,
}

async fn tool_download(State(state): State<AppState>) -> Json<ToolDownload> {
    let download_url = state
        .tool
        .download_url
        .clone()
        .filter(|url| !url.trim().is_empty());
    Json(ToolDownload {
        tool_name: state.tool.name.clone(),
        tool_version: state.tool.version.clone(),
        has_download: download_url.is_some(),
        download_url,
    })
}

async fn list_devices(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    match ConnectionCode::parse(&code) {
        Ok(code) => Json(state.ws.registry.snapshot(&code)).into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Bind and serve until ctrl-c.
pub async fn run_server(config: &FleetConfig) -> Result<(), ServerError> {
    let raw = format!("{}:{}", config.server.bind, config.server.port);
    let addr: SocketAddr = raw
        .parse()
        .map_err(|_| ServerError::InvalidAddress(raw.clone()))?;
    let state = AppState::from_config(config)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener. Used by `run_server` and by tests
/// that bind port 0.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let local = listener.local_addr()?;
    info!(address = %local, "fleetlink listening");
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DriverInfo;
    use crate::fleet::{AgentLink, DeviceDescriptor};
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct FailingCatalog;

    #[async_trait::async_trait]
    impl DriverCatalog for FailingCatalog {
        async fn list(&self) -> Result<Vec<DriverInfo>, CatalogError> {
            Err(CatalogError::Status(503))
        }

        async fn lookup(&self, _driver_id: &str) -> Result<Option<DriverInfo>, CatalogError> {
            Err(CatalogError::Status(503))
        }
    }

    fn test_state() -> AppState {
        let mut config = FleetConfig::default();
        config.catalog.drivers = vec![DriverInfo {
            id: "hp-upd".to_string(),
            name: "HP Universal".to_string(),
            manufacturer: "HP".to_string(),
            models: None,
            default_model: None,
        }];
        config.tool = ToolConfig {
            name: "FleetAgent".to_string(),
            version: "2.1.0".to_string(),
            download_url: Some("https://downloads.example.test/agent.exe".to_string()),
        };
        AppState::from_config(&config).unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(build_router(test_state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["devicesOnline"], 0);
        assert!(body["ts"].is_i64());
    }

    #[tokio::test]
    async fn test_drivers_from_static_catalog() {
        let state = test_state();
        let (status, body) = get_json(build_router(state.clone()), "/api/drivers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "hp-upd");

        let (status, body) = get_json(build_router(state.clone()), "/api/drivers/hp-upd").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["manufacturer"], "HP");

        let (status, _) = get_json(build_router(state), "/api/drivers/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_catalog_failure_degrades_to_empty_list() {
        let mut state = test_state();
        state.catalog = Arc::new(FailingCatalog);
        let (status, body) = get_json(build_router(state.clone()), "/api/drivers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, _) = get_json(build_router(state), "/api/drivers/hp-upd").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_tool_download() {
        let (_, body) = get_json(build_router(test_state()), "/api/tool-download").await;
        assert_eq!(body["toolName"], "FleetAgent");
        assert_eq!(body["toolVersion"], "2.1.0");
        assert_eq!(body["hasDownload"], true);

        let mut state = test_state();
        state.tool.download_url = None;
        let (_, body) = get_json(build_router(state), "/api/tool-download").await;
        assert_eq!(body["hasDownload"], false);
        assert!(body["downloadUrl"].is_null());
    }

    #[tokio::test]
    async fn test_devices_endpoint_is_partitioned() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        for (id, code) in [("mine", "123456"), ("theirs", "654321")] {
            state
                .ws
                .registry
                .register_agent(
                    &ConnectionCode::parse(code).unwrap(),
                    DeviceDescriptor {
                        id: Some(id.to_string()),
                        ..Default::default()
                    },
                    AgentLink {
                        conn_id: id.to_string(),
                        tx: tx.clone(),
                    },
                )
                .unwrap();
        }

        let (status, body) = get_json(build_router(state.clone()), "/api/devices/123456").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["mine"]);

        let (status, _) = get_json(build_router(state), "/api/devices/abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = build_router(test_state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("fleetlink_uptime_seconds"));
    }

}
