//! Backend supervision: spawn, monitor, restart-on-exit, log capture.
//!
//! A backend is either a command spawned behind the stdio→HTTP shim on an
//! allocated port, or a remote SSE endpoint reached by URL. Both expose the
//! same `/sse` + `/message` surface to sessions.

use crate::config::{GatewaySettings, McpServerConfig};
use crate::error::{GatewayError, Result};
use crate::ports::PortAllocator;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Stopped => write!(f, "stopped"),
            BackendStatus::Starting => write!(f, "starting"),
            BackendStatus::Running => write!(f, "running"),
            BackendStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of one backend for the service listing.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub status: BackendStatus,
    pub config: McpServerConfig,
}

/// A supervised backend MCP server.
///
/// Remote (URL-only) backends are synthetically `running` from construction
/// and never transition: there is no process to supervise. Command backends
/// follow `stopped → starting → running`, with `failed` reached when the spawn
/// errors or the restart budget is exhausted.
pub struct McpBackend {
    name: String,
    config: RwLock<McpServerConfig>,
    status: RwLock<BackendStatus>,
    port: Mutex<u16>,
    retry_count: AtomicU32,
    stop_token: Mutex<Option<CancellationToken>>,
    log_sink: Mutex<Option<Arc<Mutex<File>>>>,
    ports: Arc<PortAllocator>,
    settings: GatewaySettings,
    http: reqwest::Client,
}

impl McpBackend {
    pub fn new(
        name: &str,
        config: McpServerConfig,
        ports: Arc<PortAllocator>,
        settings: GatewaySettings,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let status = if config.is_remote() {
            BackendStatus::Running
        } else {
            BackendStatus::Stopped
        };
        Arc::new(Self {
            name: name.to_string(),
            config: RwLock::new(config),
            status: RwLock::new(status),
            port: Mutex::new(0),
            retry_count: AtomicU32::new(0),
            stop_token: Mutex::new(None),
            log_sink: Mutex::new(None),
            ports,
            settings,
            http,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> BackendStatus {
        *self.status.read()
    }

    pub fn config(&self) -> McpServerConfig {
        self.config.read().clone()
    }

    pub fn port(&self) -> u16 {
        *self.port.lock()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn is_remote(&self) -> bool {
        self.config.read().is_remote()
    }

    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            name: self.name.clone(),
            status: self.status(),
            config: self.config(),
        }
    }

    /// Replace the declared config. Callers stop the backend first; a remote
    /// config establishes its synthetic `running` status here, a command
    /// config starts over from `stopped`.
    pub fn set_config(&self, config: McpServerConfig) {
        let remote = config.is_remote();
        *self.config.write() = config;
        self.retry_count.store(0, Ordering::SeqCst);
        *self.status.write() = if remote {
            BackendStatus::Running
        } else {
            BackendStatus::Stopped
        };
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the shim pipeline for a command backend.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_remote() {
            return Err(GatewayError::WrongKind(self.name.clone()));
        }
        if self.status() == BackendStatus::Running {
            return Err(GatewayError::AlreadyRunning(self.name.clone()));
        }
        *self.status.write() = BackendStatus::Starting;

        let port = {
            let mut port = self.port.lock();
            if *port == 0 {
                *port = match self.ports.allocate() {
                    Ok(p) => p,
                    Err(e) => {
                        *self.status.write() = BackendStatus::Failed;
                        return Err(e);
                    }
                };
            }
            *port
        };
        tracing::info!(backend = %self.name, port, "assigned shim port");

        let log_path = self.settings.backend_log_path(&self.name);
        let log_file = match File::create(&log_path) {
            Ok(f) => f,
            Err(e) => {
                self.release_port();
                *self.status.write() = BackendStatus::Failed;
                return Err(GatewayError::InvalidConfig(format!(
                    "failed to create log file {log_path:?}: {e}"
                )));
            }
        };

        let config = self.config.read().clone();
        let runner = format!(
            "\"{} {}\"",
            config.command.as_deref().unwrap_or_default(),
            config.args.join(" ")
        );
        let shell_line = format!(
            "{} --stdio {} --port {}",
            self.settings.shim_command, runner, port
        );
        tracing::info!(backend = %self.name, command = %shell_line, "spawning backend");

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&shell_line)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.release_port();
                drop(log_file);
                *self.status.write() = BackendStatus::Failed;
                return Err(GatewayError::Spawn {
                    name: self.name.clone(),
                    source: e,
                });
            }
        };

        let sink = Arc::new(Mutex::new(log_file));
        *self.log_sink.lock() = Some(Arc::clone(&sink));

        let token = CancellationToken::new();
        *self.stop_token.lock() = Some(token.clone());

        if let Some(stdout) = child.stdout.take() {
            self.spawn_capture(stdout, Arc::clone(&sink));
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_capture(stderr, sink);
        }
        self.spawn_monitor(child, token);

        *self.status.write() = BackendStatus::Running;
        Ok(())
    }

    /// Idempotent stop: signal the monitor to kill the child, release the
    /// port, drop the log sink. A no-op for remote backends.
    pub fn stop(&self) {
        if self.is_remote() {
            return;
        }
        if let Some(token) = self.stop_token.lock().take() {
            tracing::info!(backend = %self.name, "stopping backend");
            token.cancel();
        }
        self.log_sink.lock().take();
        self.release_port();
        *self.status.write() = BackendStatus::Stopped;
    }

    /// Stop then start. A no-op for remote backends.
    pub fn restart(self: &Arc<Self>) -> Result<()> {
        if self.is_remote() {
            return Ok(());
        }
        self.stop();
        self.start()
    }

    fn release_port(&self) {
        let port = std::mem::take(&mut *self.port.lock());
        if port != 0 {
            self.ports.release(port);
        }
    }

    // ========================================================================
    // Supervision
    // ========================================================================

    /// Mirror child output to the log file and the gateway logger. A child
    /// that prints a chunk containing `exited` is cooperatively asking to be
    /// shut down.
    fn spawn_capture(self: &Arc<Self>, stream: impl AsyncRead + Unpin + Send + 'static, sink: Arc<Mutex<File>>) {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut file = sink.lock();
                    let _ = writeln!(file, "{line}");
                }
                tracing::info!(backend = %backend.name, "{}", line);
                if line.contains("exited") {
                    tracing::warn!(
                        backend = %backend.name,
                        "child reported a terminal condition, stopping"
                    );
                    backend.stop();
                }
            }
        });
    }

    fn spawn_monitor(self: &Arc<Self>, mut child: Child, token: CancellationToken) {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    tracing::info!(backend = %backend.name, "process stopped");
                }
                status = child.wait() => {
                    if token.is_cancelled() {
                        tracing::info!(backend = %backend.name, "process stopped");
                        return;
                    }
                    match status {
                        Ok(status) => tracing::warn!(
                            backend = %backend.name, %status, "process exited unexpectedly"
                        ),
                        Err(e) => tracing::warn!(
                            backend = %backend.name, error = %e, "process wait failed"
                        ),
                    }
                    backend.handle_unexpected_exit();
                }
            }
        });
    }

    fn handle_unexpected_exit(self: &Arc<Self>) {
        let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.settings.max_retries {
            tracing::error!(
                backend = %self.name,
                retries = attempt - 1,
                "restart budget exhausted, giving up"
            );
            self.stop();
            *self.status.write() = BackendStatus::Failed;
            return;
        }
        tracing::warn!(backend = %self.name, attempt, "restarting backend");
        self.stop();
        if let Err(e) = self.start() {
            tracing::error!(backend = %self.name, error = %e, "restart failed");
            *self.status.write() = BackendStatus::Failed;
        }
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    /// Base URL of the backend's MCP surface. Empty unless `running`.
    pub fn url(&self) -> String {
        if self.status() != BackendStatus::Running {
            return String::new();
        }
        let config = self.config.read();
        if let Some(url) = config.url.as_deref()
            && !url.is_empty()
        {
            return url.to_string();
        }
        drop(config);
        let port = *self.port.lock();
        if port == 0 {
            return String::new();
        }
        format!("http://localhost:{port}")
    }

    pub fn sse_url(&self) -> String {
        let url = self.url();
        if url.is_empty() {
            return url;
        }
        format!("{url}/sse")
    }

    pub fn message_url(&self) -> String {
        let url = self.url();
        if url.is_empty() {
            return url;
        }
        format!("{url}/message")
    }

    /// POST one MCP message to the backend. Anything but a 2xx is an error.
    pub async fn send_message(&self, message: &str) -> Result<()> {
        let url = self.message_url();
        if url.is_empty() {
            return Err(GatewayError::Unreachable(format!(
                "backend '{}' is not running",
                self.name
            )));
        }
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Unreachable(format!(
                "backend '{}' answered {}",
                self.name,
                resp.status()
            )));
        }
        Ok(())
    }
}
