//! CLI arguments, runtime settings, and the persisted backend declarations.

use crate::error::{GatewayError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WORKSPACE: &str = "default";

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_SHIM_COMMAND: &str = "supergateway";
const MCP_CONFIG_FILE: &str = "mcp-servers.json";

// ============================================================================
// CLI Arguments
// ============================================================================

/// CLI arguments for the gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-gateway")]
#[command(version, about = "Multiplexing gateway for MCP servers")]
pub struct CliArgs {
    /// HTTP bind address (ip:port)
    #[arg(short = 'b', long, env = "MCP_GATEWAY_BIND", default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Directory holding the persisted backend config and per-backend logs.
    #[arg(
        short = 'c',
        long = "config-dir",
        env = "MCP_GATEWAY_CONFIG_DIR",
        default_value = "."
    )]
    pub config_dir: PathBuf,

    /// Log level. Supports tracing filter syntax.
    #[arg(
        short = 'l',
        long = "log-level",
        env = "MCP_GATEWAY_LOG",
        default_value = "info"
    )]
    pub log_level: String,

    /// Optional static API key required on every route.
    ///
    /// If set, requests must include `Authorization: Bearer <key>` or
    /// `x-api-key: <key>`.
    #[arg(long = "api-key", env = "MCP_GATEWAY_API_KEY")]
    pub api_key: Option<String>,

    /// Idle-session GC scan interval (seconds).
    #[arg(
        long = "gc-interval",
        env = "MCP_GATEWAY_GC_INTERVAL",
        default_value_t = 300
    )]
    pub gc_interval_secs: u64,

    /// Idle timeout after which a session is collected (seconds).
    #[arg(
        long = "idle-timeout",
        env = "MCP_GATEWAY_IDLE_TIMEOUT",
        default_value_t = 600
    )]
    pub idle_timeout_secs: u64,

    /// Restart attempts before a crashing backend is marked failed.
    #[arg(
        long = "max-retries",
        env = "MCP_GATEWAY_MAX_RETRIES",
        default_value_t = 3
    )]
    pub max_retries: u32,

    /// Stdio-to-HTTP shim binary used to expose command backends.
    #[arg(long = "shim-command", env = "MCP_GATEWAY_SHIM", default_value = DEFAULT_SHIM_COMMAND)]
    pub shim_command: String,
}

/// Effective gateway settings shared across components.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub config_dir: PathBuf,
    pub shim_command: String,
    pub max_retries: u32,
    pub gc_interval: Duration,
    pub idle_timeout: Duration,
}

impl GatewaySettings {
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            config_dir: cli.config_dir.clone(),
            shim_command: cli.shim_command.clone(),
            max_retries: cli.max_retries,
            gc_interval: Duration::from_secs(cli.gc_interval_secs),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
        }
    }

    pub fn mcp_config_path(&self) -> PathBuf {
        self.config_dir.join(MCP_CONFIG_FILE)
    }

    pub fn backend_log_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{name}.log"))
    }
}

// ============================================================================
// Backend Declarations
// ============================================================================

/// Declared configuration for one backend.
///
/// Exactly one of `command` / `url` must be set: a command backend is spawned
/// behind the stdio→HTTP shim, a URL backend is a remote SSE endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub workspace: String,
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

impl McpServerConfig {
    pub fn validate(&self) -> Result<()> {
        match (non_empty(&self.command), non_empty(&self.url)) {
            (true, false) | (false, true) => Ok(()),
            (true, true) => Err(GatewayError::InvalidConfig(
                "config must not contain both url and command".to_string(),
            )),
            (false, false) => Err(GatewayError::InvalidConfig(
                "config must contain url or command".to_string(),
            )),
        }
    }

    /// True for URL-only backends (no child process).
    pub fn is_remote(&self) -> bool {
        non_empty(&self.url)
    }

    /// Fill in the defaulted fields.
    pub fn normalize(&mut self) {
        if self.workspace.is_empty() {
            self.workspace = DEFAULT_WORKSPACE.to_string();
        }
    }
}

/// Deploy request body: `{ "mcpServers": { name: config } }`.
///
/// The same inner shape is persisted to `mcp-servers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

// ============================================================================
// Persistence
// ============================================================================

/// Load the persisted `name → config` map. A missing file is an empty map.
pub fn load_persisted(path: &Path) -> Result<HashMap<String, McpServerConfig>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data)
        .map_err(|e| GatewayError::InvalidConfig(format!("corrupt config at {path:?}: {e}")))
}

/// Atomically rewrite the persisted map: write a sibling temp file, then
/// rename over the target.
pub fn persist_atomic(path: &Path, servers: &HashMap<String, McpServerConfig>) -> Result<()> {
    let data = serde_json::to_vec_pretty(servers)
        .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
