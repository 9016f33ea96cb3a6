//! HTTP control plane. Thin shape validation around the probe engine and
//! the shared [`State`]; every route lives under `/v1`.

use crate::probe::{self, Credentials, ErrorKind, ProbeConfig};
use crate::state::{Snapshot, State};
use axum::body::Bytes;
use axum::extract::{Request, State as AxumState};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
struct AppState {
    state: Arc<State>,
    /// Flips to `true` on shutdown; also aborts in-flight probes.
    shutdown: watch::Receiver<bool>,
}

/// Body of `GET /v1/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub uptime_sec: u64,
    pub generated_at: DateTime<Utc>,
}

impl From<Snapshot> for StatusResponse {
    fn from(snapshot: Snapshot) -> Self {
        let now = Utc::now();
        let uptime_sec = snapshot
            .started_at
            .map(|t| (now - t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        Self {
            snapshot,
            uptime_sec,
            generated_at: now,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    let body = ApiError {
        error: msg.into(),
        timestamp: Utc::now(),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct AuthRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct ProbeRequest {
    #[serde(default)]
    socks_server: String,
    #[serde(default)]
    timeout_ms: i64,
    auth: Option<AuthRequest>,
    #[serde(default)]
    connect_target: String,
    #[serde(default)]
    udp_test: bool,
}

impl ProbeRequest {
    fn probe_config(self) -> ProbeConfig {
        // An auth object with both fields blank counts as no auth.
        let auth = self
            .auth
            .filter(|a| !a.username.is_empty() || !a.password.is_empty())
            .map(|a| Credentials {
                username: a.username,
                password: a.password,
            });
        ProbeConfig {
            server: self.socks_server,
            timeout: Duration::from_millis(self.timeout_ms.max(0) as u64),
            auth,
            connect_target: self.connect_target,
            udp_test: self.udp_test,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartRequest {
    #[serde(default)]
    socks_server: String,
    #[serde(default)]
    mtu: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StopRequest {}

fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &[u8]) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_json(body)
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")))
}

pub fn router(state: Arc<State>, shutdown: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/status", get(status))
        .route("/v1/probe", post(run_probe))
        .route("/v1/start", post(start))
        .route("/v1/stop", post(stop))
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(not_found)
        .layer(middleware::from_fn(log_requests))
        .with_state(AppState { state, shutdown })
}

/// Serves until `shutdown` becomes `true`.
pub async fn serve(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(state, shutdown.clone());
    let mut signal = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal.wait_for(|&v| v).await;
        })
        .await
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let res = next.run(req).await;
    info!(
        %method,
        %path,
        status = res.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "api request"
    );
    res
}

async fn method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

async fn healthz() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
    .into_response()
}

async fn status(AxumState(app): AxumState<AppState>) -> Json<StatusResponse> {
    Json(app.state.snapshot().into())
}

/// Runs a probe and stores the result whether or not it succeeded.
async fn run_probe(AxumState(app): AxumState<AppState>, body: Bytes) -> Response {
    let req: ProbeRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(res) => return res,
    };
    if req.socks_server.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "socks_server is required");
    }
    if req.timeout_ms < 0 {
        return error_response(StatusCode::BAD_REQUEST, "timeout_ms must be >= 0");
    }

    let config = req.probe_config();
    let (summary, result) = probe::probe_socks(&config, Some(app.shutdown.clone())).await;
    app.state.update_probe(summary.clone());

    match result {
        Ok(()) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) if e.kind() == ErrorKind::Input => {
            error_response(StatusCode::BAD_REQUEST, format!("probe failed: {e}"))
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, format!("probe failed: {e}")),
    }
}

async fn start(body: Bytes) -> Response {
    let req: StartRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(res) => return res,
    };
    if req.socks_server.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "socks_server is required");
    }
    // 0 selects the default MTU.
    if req.mtu < 0 || (req.mtu > 0 && !(576..=9000).contains(&req.mtu)) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "mtu must be 0 or between 576 and 9000",
        );
    }
    error_response(StatusCode::NOT_IMPLEMENTED, "start not implemented yet")
}

async fn stop(body: Bytes) -> Response {
    if let Err(res) = parse_body::<StopRequest>(&body) {
        return res;
    }
    error_response(StatusCode::NOT_IMPLEMENTED, "stop not implemented yet")
}
