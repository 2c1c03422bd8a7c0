use crate::connect::{ConnectError, ConnectionManager};
use crate::metrics::Metrics;
use crate::session::{Credential, Host, Session};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub manager: Arc<ConnectionManager>,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverParams {
    pub range: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub host: String,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub principal: Option<String>,
    #[serde(default)]
    pub kinit_password: Option<String>,
    #[serde(default)]
    pub ssh_password: Option<String>,
}

pub fn build_router(metrics: Arc<Metrics>, manager: Arc<ConnectionManager>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/discover", get(discover_handler))
        .route("/api/connect", post(connect_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/api/sessions/:host", delete(disconnect_handler))
        .route("/api/hosts/:host/metrics", get(host_metrics_handler))
        .with_state(HttpAppState { metrics, manager })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn discover_handler(
    State(state): State<HttpAppState>,
    Query(params): Query<DiscoverParams>,
) -> Response {
    match state.manager.discover(&params.range).await {
        Ok(hosts) => Json(hosts).into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

async fn connect_handler(
    State(state): State<HttpAppState>,
    Json(request): Json<ConnectRequest>,
) -> Response {
    let credential = Credential {
        ssh_user: request.ssh_user,
        principal: request.principal,
        kinit_password: request.kinit_password,
        ssh_password: request.ssh_password,
    };

    match state
        .manager
        .connect(Host::from(request.host), credential)
        .await
    {
        Ok(session) => Json(session).into_response(),
        Err(err @ ConnectError::EmptyHost) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

async fn sessions_handler(State(state): State<HttpAppState>) -> Json<Vec<Session>> {
    Json(state.manager.registry().sessions().await)
}

async fn disconnect_handler(
    State(state): State<HttpAppState>,
    Path(host): Path<String>,
) -> StatusCode {
    if state.manager.disconnect(&Host::from(host)).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Latest published poll state for a connected host. Never triggers a fetch
/// of its own; the poller task is the only writer.
async fn host_metrics_handler(
    State(state): State<HttpAppState>,
    Path(host): Path<String>,
) -> Response {
    match state.manager.poller().latest(&Host::from(host)) {
        Some(poll_state) => Json(poll_state).into_response(),
        None => (StatusCode::NOT_FOUND, "host is not tracked").into_response(),
    }
}
