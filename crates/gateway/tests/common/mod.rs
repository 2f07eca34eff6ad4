#![allow(dead_code)]

pub mod sse;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use mcp_gateway::config::GatewaySettings;
use mcp_gateway::http::{AppState, create_router};
use mcp_gateway::registry::ServiceRegistry;
use mcp_gateway::session_manager::SessionManager;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt as _, wrappers::UnboundedReceiverStream};

// ============================================================================
// Gateway Under Test
// ============================================================================

pub struct GatewayOptions {
    pub gc_interval: Duration,
    pub idle_timeout: Duration,
    pub max_retries: u32,
    pub shim_command: String,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(600),
            max_retries: 3,
            shim_command: "supergateway".to_string(),
        }
    }
}

pub struct TestGateway {
    pub base_url: String,
    pub sessions: Arc<SessionManager>,
    pub client: reqwest::Client,
    _config_dir: tempfile::TempDir,
}

/// Serve a full gateway (router + registry + session manager) on an ephemeral
/// port, with its config dir in a tempdir.
pub async fn spawn_gateway(options: GatewayOptions) -> anyhow::Result<TestGateway> {
    let config_dir = tempfile::tempdir()?;
    let settings = GatewaySettings {
        config_dir: config_dir.path().to_path_buf(),
        shim_command: options.shim_command,
        max_retries: options.max_retries,
        gc_interval: options.gc_interval,
        idle_timeout: options.idle_timeout,
    };

    let http = reqwest::Client::new();
    let registry = ServiceRegistry::new(settings, http.clone());
    let sessions = SessionManager::new(
        registry,
        options.gc_interval,
        options.idle_timeout,
        http.clone(),
    );
    sessions.spawn_gc_loop();

    let state = Arc::new(AppState {
        sessions: Arc::clone(&sessions),
        api_key: None,
    });
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let base_url = format!("http://{addr}");
    gateway_test_support::wait_http_ok(&format!("{base_url}/mcp"), Duration::from_secs(5)).await?;

    Ok(TestGateway {
        base_url,
        sessions,
        client: http,
        _config_dir: config_dir,
    })
}

// ============================================================================
// Mock MCP Backend
// ============================================================================

/// In-process stand-in for a `supergateway`-shimmed backend: serves `/sse`
/// (endpoint event + async responses) and `/message` (request intake).
pub struct MockBackend {
    pub base_url: String,
    /// Recorded `tools/call` request bodies, post-rewrite.
    pub calls: Arc<Mutex<Vec<Value>>>,
}

struct MockState {
    server_name: String,
    tool_name: String,
    calls: Arc<Mutex<Vec<Value>>>,
    /// Sender for the single active SSE connection.
    events: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

pub async fn spawn_mock_backend(server_name: &str, tool_name: &str) -> anyhow::Result<MockBackend> {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::new(MockState {
        server_name: server_name.to_string(),
        tool_name: tool_name.to_string(),
        calls: Arc::clone(&calls),
        events: Mutex::new(None),
    });

    let app = Router::new()
        .route("/sse", get(mock_sse))
        .route("/message", post(mock_message))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(MockBackend {
        base_url: format!("http://{addr}"),
        calls,
    })
}

async fn mock_sse(State(state): State<Arc<MockState>>) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    *state.events.lock() = Some(tx);

    let endpoint = futures::stream::once(async {
        Ok::<_, Infallible>(Event::default().event("endpoint").data("/message"))
    });
    let responses = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, Infallible>(Event::default().event("message").data(data)));
    Sse::new(endpoint.chain(responses)).into_response()
}

async fn mock_message(State(state): State<Arc<MockState>>, body: String) -> Response {
    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");

    let response = match method {
        "tools/list" => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [{
                    "name": state.tool_name,
                    "description": "a mock tool",
                    "inputSchema": { "type": "object" },
                }],
            },
        })),
        "tools/call" => {
            state.calls.lock().push(request.clone());
            Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [] },
            }))
        }
        "initialize" => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "serverInfo": { "name": state.server_name, "version": "0.1.0" },
            },
        })),
        "ping" => Some(json!({ "jsonrpc": "2.0", "id": id, "result": {} })),
        _ => None,
    };

    if let Some(response) = response
        && let Some(tx) = state.events.lock().as_ref()
    {
        let _ = tx.send(response.to_string());
    }
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
}

// ============================================================================
// HTTP Shorthands
// ============================================================================

pub async fn deploy_backend(
    gateway: &TestGateway,
    name: &str,
    config: Value,
) -> anyhow::Result<reqwest::Response> {
    Ok(gateway
        .client
        .post(format!("{}/deploy", gateway.base_url))
        .json(&json!({ "mcpServers": { name: config } }))
        .send()
        .await?)
}

pub async fn create_session(gateway: &TestGateway, workspace: &str) -> anyhow::Result<String> {
    let resp = gateway
        .client
        .post(format!(
            "{}/workspaces/{workspace}/sessions",
            gateway.base_url
        ))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 201, "create session: {}", resp.status());
    let info: Value = resp.json().await?;
    Ok(info["id"].as_str().expect("session id").to_string())
}

/// Poll `GET /sessions/:id` until the session reports ready.
pub async fn wait_session_ready(gateway: &TestGateway, id: &str) -> anyhow::Result<()> {
    let url = format!("{}/sessions/{id}", gateway.base_url);
    let start = std::time::Instant::now();
    loop {
        let resp = gateway.client.get(&url).send().await?;
        if resp.status().is_success() {
            let info: Value = resp.json().await?;
            if info["is_ready"] == true {
                return Ok(());
            }
        }
        anyhow::ensure!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for session {id} to become ready"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn send_message(
    gateway: &TestGateway,
    session_id: &str,
    body: Value,
) -> anyhow::Result<reqwest::Response> {
    Ok(gateway
        .client
        .post(format!(
            "{}/message?sessionId={session_id}",
            gateway.base_url
        ))
        .body(body.to_string())
        .send()
        .await?)
}
