//! HTTP front-end: deploy/service routes, session routes, client streams.

use crate::config::{DEFAULT_WORKSPACE, DeployRequest};
use crate::error::GatewayError;
use crate::session::ProxySession;
use crate::session_manager::SessionManager;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{StreamExt as _, wrappers::ReceiverStream};

/// Shared application state.
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    /// Optional static API key required on every route.
    pub api_key: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/mcp", get(list_services).delete(delete_service))
        .route("/services", get(list_services))
        .route("/message", post(client_message))
        .route("/sse", get(client_stream))
        .route("/workspaces/{workspace}/sessions", post(create_session))
        .route(
            "/workspaces/{workspace}/sessions/{id}",
            delete(delete_session),
        )
        .route("/sessions/{id}", get(session_status))
        .with_state(state)
}

/// Optional API-key auth for all routes.
///
/// If `state.api_key` is set, requests must carry either
/// `Authorization: Bearer <key>` or `x-api-key: <key>`.
pub fn with_optional_api_key(router: Router, state: Arc<AppState>) -> Router {
    use axum::{
        body::Body,
        http::Request,
        middleware::{Next, from_fn_with_state},
    };

    async fn require_api_key(
        State(state): State<Arc<AppState>>,
        request: Request<Body>,
        next: Next,
    ) -> Response {
        let expected = state.api_key.as_deref().unwrap_or_default().trim();
        if expected.is_empty() {
            return next.run(request).await;
        }

        let bearer = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer ").map(str::trim));
        let api_key_header = request
            .headers()
            .get("x-api-key")
            .and_then(|h| h.to_str().ok())
            .map(str::trim);

        if bearer == Some(expected) || api_key_header == Some(expected) {
            return next.run(request).await;
        }
        (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    }

    if state.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
        return router;
    }
    router.layer(from_fn_with_state(state, require_api_key))
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::InvalidConfig(_) | GatewayError::MalformedRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::AlreadyRunning(_) | GatewayError::WrongKind(_) => StatusCode::CONFLICT,
        GatewayError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::SessionClosed => StatusCode::GONE,
        GatewayError::Spawn { .. }
        | GatewayError::PortExhausted
        | GatewayError::Unreachable(_)
        | GatewayError::Io(_)
        | GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
    }
}

fn error_json(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

// ============================================================================
// Service Routes
// ============================================================================

#[derive(Deserialize)]
struct WorkspaceQuery {
    workspace: Option<String>,
}

/// POST /deploy - Register or replace one or more backends.
async fn deploy(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WorkspaceQuery>,
    Json(request): Json<DeployRequest>,
) -> Response {
    for (name, mut config) in request.mcp_servers {
        if let Some(workspace) = &query.workspace {
            config.workspace = workspace.clone();
        }
        tracing::info!(backend = %name, "deploy requested");
        if let Err(e) = state.sessions.registry().deploy(&name, config) {
            return error_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to deploy {name}: {e}"),
            );
        }
    }
    Json(json!({ "status": "success" })).into_response()
}

#[derive(Deserialize)]
struct NameQuery {
    name: Option<String>,
}

/// DELETE /mcp?name=… - Stop and forget one backend.
async fn delete_service(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NameQuery>,
) -> Response {
    let Some(name) = query.name.filter(|n| !n.is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "missing name".to_string());
    };
    match state.sessions.registry().delete(&name) {
        Ok(()) => Json(json!({ "status": "success" })).into_response(),
        Err(e) => error_json(status_for(&e), e.to_string()),
    }
}

/// GET /mcp (or /services) - List registered backends.
async fn list_services(State(state): State<Arc<AppState>>) -> Response {
    Json(state.sessions.registry().infos()).into_response()
}

// ============================================================================
// Session Routes
// ============================================================================

#[derive(Serialize)]
struct SessionInfo {
    id: String,
    workspace_id: String,
    status: String,
    created_at: DateTime<Utc>,
    last_receive_time: DateTime<Utc>,
    is_ready: bool,
}

fn session_info(session: &ProxySession) -> SessionInfo {
    SessionInfo {
        id: session.id().to_string(),
        workspace_id: session.workspace().to_string(),
        status: session.state().to_string(),
        created_at: session.created_at(),
        last_receive_time: session.last_receive_time(),
        is_ready: session.is_ready(),
    }
}

/// POST /workspaces/:workspace/sessions - Create a session.
async fn create_session(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
) -> Response {
    let workspace = if workspace.is_empty() {
        DEFAULT_WORKSPACE.to_string()
    } else {
        workspace
    };
    let session = state.sessions.create(&workspace).await;
    (StatusCode::CREATED, Json(session_info(&session))).into_response()
}

/// DELETE /workspaces/:workspace/sessions/:id - Close a session. Idempotent.
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path((_workspace, id)): Path<(String, String)>,
) -> Response {
    state.sessions.close(&id).await;
    Json(json!({ "status": "success" })).into_response()
}

/// GET /sessions/:id - Session status.
async fn session_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.sessions.get(&id) {
        Some(session) => Json(session_info(&session)).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "Session not found".to_string()),
    }
}

// ============================================================================
// Client Data Plane
// ============================================================================

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// POST /message?sessionId=… - Client→gateway MCP request.
async fn client_message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "missing sessionId".to_string());
    };
    let Some(session) = state.sessions.get(&session_id) else {
        return error_json(StatusCode::NOT_FOUND, "session not found".to_string());
    };
    match session.send_message(&body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_json(status_for(&e), e.to_string()),
    }
}

/// GET /sse?sessionId=… - Attach the client to the session's outbound stream.
async fn client_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "missing sessionId".to_string());
    };
    let Some(session) = state.sessions.get(&session_id) else {
        return error_json(StatusCode::NOT_FOUND, "session not found".to_string());
    };
    let Some(events) = session.take_events() else {
        return error_json(
            StatusCode::CONFLICT,
            "session stream already attached".to_string(),
        );
    };

    let stream = ReceiverStream::new(events)
        .map(|e| Ok::<_, Infallible>(Event::default().event(e.event).data(e.data)));
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}
