//! Local control-plane HTTP surface (§10.4): Bearer-token-authenticated
//! `axum` server exposing engine status, sync errors, an SSE event stream,
//! and pause/resume/rebuild/exclude/include mutations.
//!
//! Grounded on the host's `ControlPlane` (`control.rs`): the same
//! bind-with-retry-then-fallback-to-port-0 startup sequence, the public
//! `/v1/status` + Bearer-protected routes split, the `auth_middleware`
//! shape, and the `futures_util::stream::unfold`-based SSE stream,
//! retargeted from the host's upload/subscription/discovery surface to
//! this engine's sync status/control surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::unfold;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::{EngineState, SyncEngine};

#[derive(Clone)]
pub struct ControlPlane {
    state: Arc<ControlState>,
    bound_addr: SocketAddr,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("bound_addr", &self.bound_addr)
            .finish()
    }
}

pub struct ControlPlaneStartResult {
    pub control_plane: ControlPlane,
    pub bound_addr: SocketAddr,
}

struct ControlState {
    token: String,
    engine: Arc<SyncEngine>,
    events: broadcast::Sender<SyncEventNotice>,
}

/// One SSE payload: a status transition the CLI/GUI can subscribe to.
#[derive(Clone, Serialize, Deserialize)]
struct SyncEventNotice {
    path: String,
    direction: String,
    state: String,
    #[serde(rename = "updatedAt")]
    updated_at: String,
}

impl ControlPlane {
    pub async fn start_async(addr: &str, token: Option<String>, engine: Arc<SyncEngine>) -> Result<ControlPlaneStartResult> {
        let token = token.unwrap_or_else(|| Uuid::new_v4().as_simple().to_string());
        crate::logging::info_kv("control plane starting", &[("requested_addr", addr)]);

        let requested_addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid control address '{addr}' (use a numeric IP, not a hostname)"))?;

        const MAX_BIND_RETRIES: u32 = 5;
        const RETRY_DELAY: Duration = Duration::from_millis(200);

        let mut last_error = None;
        for attempt in 1..=MAX_BIND_RETRIES {
            match tokio::net::TcpListener::bind(requested_addr).await {
                Ok(listener) => {
                    let bound = listener.local_addr()?;
                    return Self::finish_start(listener, bound, token, engine).await;
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_BIND_RETRIES {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        let primary_err = last_error.unwrap();
        let fallback_addr: SocketAddr = format!("{}:0", requested_addr.ip()).parse()?;
        let listener = tokio::net::TcpListener::bind(fallback_addr)
            .await
            .with_context(|| format!("bind control plane: requested {requested_addr} failed ({primary_err}), fallback to port 0 also failed"))?;
        let bound = listener.local_addr()?;
        crate::logging::info_kv(
            "control plane bound to fallback port",
            &[("original_request", &requested_addr.to_string()), ("actual_addr", &bound.to_string())],
        );
        Self::finish_start(listener, bound, token, engine).await
    }

    async fn finish_start(listener: tokio::net::TcpListener, bound_addr: SocketAddr, token: String, engine: Arc<SyncEngine>) -> Result<ControlPlaneStartResult> {
        let state = Arc::new(ControlState { token, engine, events: broadcast::channel(1024).0 });

        let authenticated = Router::new()
            .route("/v1/sync/errors", get(sync_errors))
            .route("/v1/sync/pause", post(sync_pause))
            .route("/v1/sync/resume", post(sync_resume))
            .route("/v1/sync/rebuild", post(sync_rebuild))
            .route("/v1/sync/exclude", post(sync_exclude))
            .route("/v1/sync/include", post(sync_include))
            .with_state(state.clone())
            .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware));

        let app = Router::new()
            .route("/v1/status", get(status))
            .route("/v1/sync/events", get(sync_events_with_query_auth))
            .with_state(state.clone())
            .merge(authenticated);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                crate::logging::error(format!("control plane server error: {e}"));
            }
            crate::logging::info("control plane server stopped".to_string());
        });

        crate::logging::info_kv("control plane started", &[("bound_addr", &bound_addr.to_string())]);
        Ok(ControlPlaneStartResult { control_plane: ControlPlane { state, bound_addr }, bound_addr })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn token(&self) -> &str {
        &self.state.token
    }

    /// Publishes a status transition to any subscribed SSE clients; called
    /// by the engine's pipelines as items change state (§4.6.3).
    pub fn notify(&self, path: &str, direction: &str, state: &str) {
        let _ = self.state.events.send(SyncEventNotice {
            path: path.to_string(),
            direction: direction.to_string(),
            state: state.to_string(),
            updated_at: Utc::now().to_rfc3339(),
        });
    }
}

async fn auth_middleware(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let expected = format!("Bearer {}", state.token);
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if value.to_str().map(|v| v == expected).unwrap_or(false) {
            return next.run(req).await;
        }
    }
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    state: &'static str,
    version: String,
    ts: String,
}

fn state_label(s: EngineState) -> &'static str {
    match s {
        EngineState::Stopped => "stopped",
        EngineState::Indexing => "indexing",
        EngineState::Running => "running",
        EngineState::Paused => "paused",
        EngineState::Rebuilding => "rebuilding",
    }
}

async fn status(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok".to_string(),
        state: state_label(state.engine.state()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ts: Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
struct SyncErrorsResponse {
    errors: Vec<SyncErrorView>,
}

#[derive(Serialize)]
struct SyncErrorView {
    path: String,
    direction: String,
    title: String,
    message: String,
    code: String,
}

async fn sync_errors(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match state.engine.list_sync_errors() {
        Ok(errors) => Json(SyncErrorsResponse {
            errors: errors
                .into_iter()
                .map(|e| SyncErrorView {
                    path: e.dbx_path_lower,
                    direction: e.direction,
                    title: e.title,
                    message: e.message,
                    code: e.code,
                })
                .collect(),
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn sync_pause(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    state.engine.pause();
    StatusCode::NO_CONTENT
}

async fn sync_resume(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    state.engine.resume();
    StatusCode::NO_CONTENT
}

async fn sync_rebuild(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    match state.engine.rebuild_index().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct PathBody {
    path: String,
}

async fn sync_exclude(State(state): State<Arc<ControlState>>, Json(body): Json<PathBody>) -> impl IntoResponse {
    match state.engine.exclude(&body.path).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn sync_include(State(state): State<Arc<ControlState>>, Json(body): Json<PathBody>) -> impl IntoResponse {
    match state.engine.include(&body.path).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct SseAuth {
    token: Option<String>,
}

/// SSE can't set an `Authorization` header, so the stream route accepts the
/// token as a query parameter instead, matching the host's
/// `sync_events_with_query_auth`.
async fn sync_events_with_query_auth(
    State(state): State<Arc<ControlState>>,
    axum::extract::Query(auth): axum::extract::Query<SseAuth>,
) -> impl IntoResponse {
    if auth.token.as_deref() != Some(state.token.as_str()) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let rx = state.events.subscribe();
    let stream = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notice) => {
                    let json = serde_json::to_string(&notice).unwrap_or_default();
                    return Some((Ok::<_, std::convert::Infallible>(Event::default().data(json)), rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_label_covers_every_variant() {
        assert_eq!(state_label(EngineState::Stopped), "stopped");
        assert_eq!(state_label(EngineState::Indexing), "indexing");
        assert_eq!(state_label(EngineState::Running), "running");
        assert_eq!(state_label(EngineState::Paused), "paused");
        assert_eq!(state_label(EngineState::Rebuilding), "rebuilding");
    }
}
