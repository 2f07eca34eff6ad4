//! Per-client proxy sessions: SSE fan-in, id correlation, tool aggregation.
//!
//! A session subscribes one reader task to every backend's SSE stream,
//! rewrites message ids so concurrent backends never collide, merges
//! `tools/list` answers into a single prefixed catalog, and pushes the
//! resulting events onto a bounded, lossy outbound channel drained by the
//! HTTP front-end.

use crate::error::{GatewayError, Result};
use crate::sse::{SseDecoder, SseFrame};
use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 100;
const READY_POLLS: u32 = 3;
const READY_POLL_DELAY: Duration = Duration::from_secs(1);
const ENDPOINT_EVENT: &str = "endpoint";
const GATEWAY_SERVER_NAME: &str = "mcp-gateway";

/// One aggregated tool, exposed under a backend-prefixed name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub real_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Outbound `{event, data}` pair destined for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub event: String,
    pub data: String,
}

/// One entry of the session's message history.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMessage {
    pub backend: String,
    pub content: String,
    pub direction: &'static str,
    pub at: DateTime<Utc>,
}

/// Bookkeeping for one in-flight `tools/list` broadcast.
///
/// One record per broadcast, shared by the gateway ids issued for it, so
/// overlapping `tools/list` requests never interleave their countdowns.
#[derive(Debug)]
struct ToolsBroadcast {
    remaining: AtomicI32,
}

#[derive(Debug)]
struct PendingRequest {
    original_id: i64,
    tools_broadcast: Option<Arc<ToolsBroadcast>>,
}

/// Correlation table mapping gateway ids back to the client's original ids.
#[derive(Debug, Default)]
struct MessageIdTable {
    last_issued: i64,
    pending: HashMap<i64, PendingRequest>,
}

impl MessageIdTable {
    /// Issue a fresh gateway id: epoch millis, bumped monotonically so two
    /// requests in the same millisecond never collide.
    fn issue(&mut self, original_id: i64, tools_broadcast: Option<Arc<ToolsBroadcast>>) -> i64 {
        let mut id = Utc::now().timestamp_millis().max(self.last_issued + 1);
        while self.pending.contains_key(&id) {
            id += 1;
        }
        self.last_issued = id;
        self.pending.insert(
            id,
            PendingRequest {
                original_id,
                tools_broadcast,
            },
        );
        id
    }
}

/// A per-client fan-out conversation over every running backend.
pub struct ProxySession {
    id: String,
    workspace: String,
    created_at: DateTime<Utc>,
    last_receive: RwLock<(Instant, DateTime<Utc>)>,
    /// Backend → message endpoint discovered from its `endpoint` SSE event.
    message_urls: RwLock<HashMap<String, String>>,
    /// Number of live SSE reader tasks.
    sse_count: AtomicI32,
    ids: Mutex<MessageIdTable>,
    /// Backend → (real tool name → prefixed tool).
    tools: RwLock<HashMap<String, HashMap<String, McpTool>>>,
    history: Mutex<Vec<SessionMessage>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    readers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    done: CancellationToken,
    closed: AtomicBool,
    http: reqwest::Client,
}

impl ProxySession {
    pub fn new(id: String, workspace: String, http: reqwest::Client) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            id,
            workspace,
            created_at: Utc::now(),
            last_receive: RwLock::new((Instant::now(), Utc::now())),
            message_urls: RwLock::new(HashMap::new()),
            sse_count: AtomicI32::new(0),
            ids: Mutex::new(MessageIdTable::default()),
            tools: RwLock::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            readers: Mutex::new(Vec::new()),
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
            http,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_receive_time(&self) -> DateTime<Utc> {
        self.last_receive.read().1
    }

    pub fn idle_for(&self) -> Duration {
        self.last_receive.read().0.elapsed()
    }

    /// Ready iff every reader task that currently exists has received its
    /// `endpoint` event.
    pub fn is_ready(&self) -> bool {
        self.sse_count.load(Ordering::SeqCst) as usize == self.message_urls.read().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &'static str {
        if self.is_closed() {
            if self.sse_count.load(Ordering::SeqCst) > 0 {
                return "closing";
            }
            return "closed";
        }
        let endpoints = self.message_urls.read().len();
        if self.is_ready() {
            "ready"
        } else if endpoints == 0 {
            "subscribing"
        } else {
            "partially_ready"
        }
    }

    /// Tools discovered from one backend, keyed by real name.
    pub fn tools_for(&self, backend: &str) -> Option<HashMap<String, McpTool>> {
        self.tools.read().get(backend).cloned()
    }

    pub fn messages(&self) -> Vec<SessionMessage> {
        self.history.lock().clone()
    }

    /// Hand the outbound event stream to the front-end drain. Only one drain
    /// may attach per session.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    fn touch(&self) {
        *self.last_receive.write() = (Instant::now(), Utc::now());
    }

    fn record(&self, backend: &str, content: String, direction: &'static str) {
        self.history.lock().push(SessionMessage {
            backend: backend.to_string(),
            content,
            direction,
            at: Utc::now(),
        });
    }

    // ========================================================================
    // Subscription
    // ========================================================================

    /// Start one reader task for a backend's SSE stream. The count is bumped
    /// optimistically; the task undoes it when it exits for any reason.
    pub fn subscribe(self: &Arc<Self>, backend: &str, sse_url: &str) {
        self.sse_count.fetch_add(1, Ordering::SeqCst);
        let session = Arc::clone(self);
        let backend = backend.to_string();
        let sse_url = sse_url.to_string();
        let handle = tokio::spawn(async move {
            session.run_sse_reader(&backend, &sse_url).await;
            session.sse_count.fetch_sub(1, Ordering::SeqCst);
        });
        self.readers.lock().push(handle);
    }

    async fn run_sse_reader(&self, backend: &str, sse_url: &str) {
        tracing::info!(session = %self.id, backend, url = %sse_url, "subscribing to backend stream");
        let resp = tokio::select! {
            () = self.done.cancelled() => return,
            resp = self.http.get(sse_url).send() => match resp {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    tracing::error!(
                        session = %self.id, backend, status = %resp.status(),
                        "backend refused SSE subscription"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(session = %self.id, backend, error = %e, "failed to subscribe");
                    return;
                }
            },
        };

        // The endpoint event carries a path; message URLs are composed against
        // the stream's own origin.
        let origin = resp.url().origin().ascii_serialization();
        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = tokio::select! {
                () = self.done.cancelled() => {
                    tracing::info!(session = %self.id, backend, "closed backend stream");
                    return;
                }
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    tracing::error!(session = %self.id, backend, error = %e, "backend stream failed");
                    return;
                }
                None => {
                    tracing::info!(session = %self.id, backend, "backend stream ended");
                    return;
                }
            };
            for frame in decoder.push(&chunk) {
                self.handle_frame(backend, &origin, frame);
            }
        }
    }

    /// Process one SSE frame from a backend.
    fn handle_frame(&self, backend: &str, origin: &str, frame: SseFrame) {
        if frame.event == ENDPOINT_EVENT {
            let mut urls = self.message_urls.write();
            if !urls.contains_key(backend) {
                let url = format!("{origin}{}", frame.data);
                tracing::info!(session = %self.id, backend, url = %url, "recorded backend endpoint");
                urls.insert(backend.to_string(), url);
            }
            // Endpoint events never leave the gateway.
            return;
        }

        let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
            return;
        };
        let Some(gateway_id) = value.get("id").and_then(Value::as_i64) else {
            return;
        };
        let Some(pending) = self.ids.lock().pending.remove(&gateway_id) else {
            // Not a message this session is waiting on.
            return;
        };

        self.touch();
        tracing::debug!(session = %self.id, backend, event = %frame.event, "correlated backend event");

        // Substring-level id substitution: the payload must not be
        // re-serialized, some clients are sensitive to byte-level form.
        let mut data = frame.data.replacen(
            &format!("\"id\":{gateway_id}"),
            &format!("\"id\":{}", pending.original_id),
            1,
        );

        let tools = value
            .pointer("/result/tools")
            .and_then(Value::as_array)
            .filter(|tools| !tools.is_empty());
        if let Some(tools) = tools {
            self.record_tools(backend, tools);
            if let Some(broadcast) = &pending.tools_broadcast {
                if broadcast.remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                    // More backends pending; suppress the partial answer.
                    tracing::debug!(session = %self.id, backend, "waiting for remaining tool lists");
                    return;
                }
                let jsonrpc = value.get("jsonrpc").and_then(Value::as_str).unwrap_or("2.0");
                data = self.merged_tools_response(pending.original_id, jsonrpc);
            }
        } else if let Some(server_name) = value
            .pointer("/result/serverInfo/name")
            .and_then(Value::as_str)
        {
            // Every backend presents as the gateway.
            data = data.replacen(server_name, GATEWAY_SERVER_NAME, 1);
        }

        self.push_event(SessionEvent {
            event: frame.event,
            data,
        });
    }

    fn record_tools(&self, backend: &str, tools: &[Value]) {
        let mut by_real_name = HashMap::new();
        for tool in tools {
            match serde_json::from_value::<McpTool>(tool.clone()) {
                Ok(mut tool) => {
                    tool.real_name = tool.name.clone();
                    tool.name = format!("{backend}_{}", tool.real_name);
                    by_real_name.insert(tool.real_name.clone(), tool);
                }
                Err(e) => {
                    tracing::error!(session = %self.id, backend, error = %e, "unparseable tool entry");
                }
            }
        }
        self.tools.write().insert(backend.to_string(), by_real_name);
    }

    /// Synthesize the single merged `tools/list` answer from every backend's
    /// recorded catalog.
    fn merged_tools_response(&self, original_id: i64, jsonrpc: &str) -> String {
        let all_tools: Vec<McpTool> = {
            let tools = self.tools.read();
            let mut all: Vec<McpTool> = tools
                .values()
                .flat_map(|per_backend| per_backend.values().cloned())
                .collect();
            all.sort_by(|a, b| a.name.cmp(&b.name));
            all
        };
        tracing::debug!(session = %self.id, count = all_tools.len(), "tool aggregation complete");
        serde_json::json!({
            "jsonrpc": jsonrpc,
            "id": original_id,
            "result": { "tools": all_tools },
        })
        .to_string()
    }

    /// Best-effort push onto the bounded outbound channel; a full channel
    /// drops the event in favor of gateway liveness.
    fn push_event(&self, event: SessionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            tracing::warn!(session = %self.id, error = %e, "dropping outbound event");
        }
    }

    // ========================================================================
    // Client → backends
    // ========================================================================

    /// Fan a client MCP request out to its target backends.
    ///
    /// `tools/call` with a prefixed tool name routes to the single backend
    /// named by the prefix; everything else broadcasts to every backend with
    /// a known message endpoint. Per-backend broadcast failures are logged
    /// and skipped.
    pub async fn send_message(&self, body: &str) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::SessionClosed);
        }
        let mut request: Value = serde_json::from_str(body)
            .map_err(|e| GatewayError::MalformedRequest(e.to_string()))?;
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tracing::debug!(session = %self.id, method = %method, "client request");

        let mut polls = READY_POLLS;
        while !self.is_ready() {
            if polls == 0 {
                return Err(GatewayError::NotReady);
            }
            polls -= 1;
            tokio::time::sleep(READY_POLL_DELAY).await;
        }

        let mut target: Option<String> = None;
        if method == "tools/call" {
            let name = request
                .pointer("/params/name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::MalformedRequest("tools/call without params.name".to_string())
                })?
                .to_string();
            if let Some((backend, real_name)) = name.split_once('_') {
                target = Some(backend.to_string());
                let real_name = real_name.to_string();
                if let Some(slot) = request.pointer_mut("/params/name") {
                    *slot = Value::String(real_name);
                }
            }
        }

        let original_id = request.get("id").and_then(Value::as_i64);
        let jsonrpc = request
            .get("jsonrpc")
            .and_then(Value::as_str)
            .unwrap_or("2.0")
            .to_string();

        match target {
            Some(backend) => {
                let url = self
                    .message_urls
                    .read()
                    .get(&backend)
                    .cloned()
                    .ok_or_else(|| GatewayError::NotFound(format!("backend '{backend}'")))?;
                self.post_to_backend(&backend, &url, request, original_id, None)
                    .await?;
            }
            None => {
                let targets: Vec<(String, String)> = self
                    .message_urls
                    .read()
                    .iter()
                    .map(|(backend, url)| (backend.clone(), url.clone()))
                    .collect();
                let broadcast = (method == "tools/list" && original_id.is_some()).then(|| {
                    Arc::new(ToolsBroadcast {
                        remaining: AtomicI32::new(0),
                    })
                });
                for (backend, url) in targets {
                    if let Some(broadcast) = &broadcast {
                        broadcast.remaining.fetch_add(1, Ordering::SeqCst);
                    }
                    if let Err(e) = self
                        .post_to_backend(&backend, &url, request.clone(), original_id, broadcast.clone())
                        .await
                    {
                        tracing::error!(
                            session = %self.id, backend = %backend, error = %e,
                            "broadcast to backend failed"
                        );
                        if let Some(broadcast) = &broadcast
                            && broadcast.remaining.fetch_sub(1, Ordering::SeqCst) == 1
                            && let Some(original_id) = original_id
                        {
                            // The failing backend was the last one standing in
                            // the countdown; emit what the others reported.
                            let data = self.merged_tools_response(original_id, &jsonrpc);
                            self.push_event(SessionEvent {
                                event: "message".to_string(),
                                data,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite the request's id to a fresh gateway id, then POST it.
    async fn post_to_backend(
        &self,
        backend: &str,
        url: &str,
        mut request: Value,
        original_id: Option<i64>,
        tools_broadcast: Option<Arc<ToolsBroadcast>>,
    ) -> Result<()> {
        let gateway_id =
            original_id.map(|original| self.ids.lock().issue(original, tools_broadcast));
        if let Some(gateway_id) = gateway_id
            && let Some(slot) = request.get_mut("id")
        {
            *slot = Value::from(gateway_id);
        }

        let body = request.to_string();
        let result = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;

        let failure = match result {
            Ok(resp) if resp.status().is_success() => None,
            Ok(resp) => Some(GatewayError::Unreachable(format!(
                "backend '{backend}' answered {}",
                resp.status()
            ))),
            Err(e) => Some(e.into()),
        };
        if let Some(failure) = failure {
            if let Some(gateway_id) = gateway_id {
                self.ids.lock().pending.remove(&gateway_id);
            }
            return Err(failure);
        }

        self.record(backend, body, "send");
        Ok(())
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close the session: cancel every reader, wait for them to exit, leave
    /// the event channel for the front-end to drain. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session = %self.id, "closing session");
        self.done.cancel();
        let handles: Vec<_> = self.readers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(session = %self.id, "session closed");
    }
}
