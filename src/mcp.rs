//! MCP (Model Context Protocol) tool clients over stdio.
//!
//! Each configured server is spawned once, initialized, and asked for its
//! tools. Calls are JSON-RPC requests on the server's stdin; a reader thread
//! forwards every stdout line so a call can wait on its own response id while
//! still noticing cancellation.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::models::ToolCallResult;
use crate::tools::{ClientDescriptor, ToolClient, ToolClientRegistry, ToolDescriptor};

const PROTOCOL_VERSION: &str = "2024-11-05";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

// === Configuration ===

/// `mcp.json`: servers keyed by client name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpConfig {
    #[serde(default)]
    pub timeouts: McpTimeouts,
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, McpServerConfig>,
}

/// Global timeouts in seconds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[allow(clippy::struct_field_names)]
pub struct McpTimeouts {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    120
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpServerConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    #[serde(default)]
    pub connect_timeout: Option<u64>,
    #[serde(default)]
    pub read_timeout: Option<u64>,
    #[serde(default)]
    pub disabled: bool,
}

impl McpServerConfig {
    #[must_use]
    pub fn effective_connect_timeout(&self, global: &McpTimeouts) -> Duration {
        Duration::from_secs(self.connect_timeout.unwrap_or(global.connect_timeout))
    }

    #[must_use]
    pub fn effective_read_timeout(&self, global: &McpTimeouts) -> Duration {
        Duration::from_secs(self.read_timeout.unwrap_or(global.read_timeout))
    }
}

impl McpConfig {
    /// Read `path`. A missing file is an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

// === Stdio Client ===

struct Connection {
    stdin: ChildStdin,
    responses: Receiver<Value>,
}

/// One running MCP server.
pub struct McpStdioClient {
    name: String,
    child: Mutex<Child>,
    connection: Mutex<Connection>,
    next_id: AtomicU64,
    read_timeout: Duration,
    tools: Vec<ToolDescriptor>,
}

impl McpStdioClient {
    /// Spawn the server, run the initialize handshake and list its tools.
    pub fn connect(name: &str, config: &McpServerConfig, timeouts: &McpTimeouts) -> Result<Self> {
        let Some(command) = config.command.as_deref() else {
            anyhow::bail!("MCP server {name} has no command");
        };

        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server {name}"))?;
        let stdin = child.stdin.take().context("Failed to open MCP stdin")?;
        let stdout = child.stdout.take().context("Failed to open MCP stdout")?;

        let (tx, responses) = mpsc::channel();
        let reader_name = name.to_string();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(server = %reader_name, error = %err, "Ignoring non-JSON MCP output");
                    }
                }
            }
        });

        let mut client = Self {
            name: name.to_string(),
            child: Mutex::new(child),
            connection: Mutex::new(Connection { stdin, responses }),
            next_id: AtomicU64::new(1),
            read_timeout: config.effective_read_timeout(timeouts),
            tools: Vec::new(),
        };

        let connect_timeout = config.effective_connect_timeout(timeouts);
        client.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": { "name": "toolstream", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": {}
            }),
            connect_timeout,
            None,
        )?;
        client.notify("notifications/initialized")?;

        let listed = client.request("tools/list", json!({}), connect_timeout, None)?;
        client.tools = match listed.get("tools") {
            Some(tools) => serde_json::from_value(tools.clone())
                .with_context(|| format!("Invalid tools/list response from {name}"))?,
            None => Vec::new(),
        };

        tracing::info!(server = %name, tools = client.tools.len(), "Connected MCP server");
        Ok(client)
    }

    #[must_use]
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    fn notify(&self, method: &str) -> Result<()> {
        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        send_line(
            &mut connection.stdin,
            &json!({"jsonrpc": "2.0", "method": method, "params": {}}),
        )
    }

    /// Wait for exclusive use of the connection. One call at a time owns
    /// it, so a waiting call polls so it can still give up on cancellation
    /// or on its deadline, which runs from the start of the wait.
    fn acquire(
        &self,
        method: &str,
        deadline: Instant,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<MutexGuard<'_, Connection>> {
        loop {
            match self.connection.try_lock() {
                Ok(connection) => return Ok(connection),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                anyhow::bail!("MCP request {method} to {} was cancelled", self.name);
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "MCP request {method} to {} timed out after {}s waiting for the connection",
                    self.name,
                    timeout.as_secs()
                );
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Send a request and wait for the response with the same id. Other
    /// messages (notifications, late responses to abandoned calls) are skipped.
    fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let mut connection = self.acquire(method, deadline, timeout, cancel)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        send_line(
            &mut connection.stdin,
            &json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
        )?;

        let response = loop {
            match connection.responses.recv_timeout(POLL_INTERVAL) {
                Ok(value) if value.get("id").and_then(Value::as_u64) == Some(id) => break value,
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_some_and(CancellationToken::is_cancelled) {
                        anyhow::bail!("MCP request {method} to {} was cancelled", self.name);
                    }
                    if Instant::now() >= deadline {
                        anyhow::bail!(
                            "Failed to read MCP response from {}: timed out after {}s",
                            self.name,
                            timeout.as_secs()
                        );
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    anyhow::bail!(
                        "Failed to read MCP response: {} closed output before responding.",
                        self.name
                    );
                }
            }
        };

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            anyhow::bail!("MCP error from {}: {message}", self.name);
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

impl ToolClient for McpStdioClient {
    fn call_tool(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Option<ToolCallResult>> {
        let result = self.request(
            "tools/call",
            json!({"name": tool_name, "arguments": arguments}),
            self.read_timeout,
            Some(cancel),
        )?;
        if result.is_null() {
            return Ok(None);
        }
        let parsed = serde_json::from_value(result)
            .with_context(|| format!("Invalid tools/call result from {}", self.name))?;
        Ok(Some(parsed))
    }
}

impl Drop for McpStdioClient {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        let _ = child.kill();
        let _ = child.wait();
    }
}

fn send_line(stdin: &mut impl Write, payload: &Value) -> Result<()> {
    let line = serde_json::to_string(payload)?;
    stdin
        .write_all(format!("{line}\n").as_bytes())
        .context("Failed to write MCP request")?;
    stdin.flush()?;
    Ok(())
}

// === Registry ===

/// Connected MCP servers, keyed by client name.
#[derive(Default)]
pub struct McpRegistry {
    clients: BTreeMap<String, Arc<McpStdioClient>>,
}

impl McpRegistry {
    /// Load `path` and connect every enabled server. Servers that fail to
    /// start are logged and left out.
    pub fn load(path: &Path) -> Result<Self> {
        let config = McpConfig::load(path)?;
        Ok(Self::connect(&config))
    }

    #[must_use]
    pub fn connect(config: &McpConfig) -> Self {
        let mut clients = BTreeMap::new();
        for (name, server) in &config.servers {
            if server.disabled {
                tracing::debug!(server = %name, "Skipping disabled MCP server");
                continue;
            }
            if server.command.is_none() {
                tracing::warn!(server = %name, url = ?server.url, "Only stdio MCP servers are supported");
                continue;
            }
            match McpStdioClient::connect(name, server, &config.timeouts) {
                Ok(client) => {
                    clients.insert(name.clone(), Arc::new(client));
                }
                Err(err) => tracing::warn!(server = %name, error = %format!("{err:#}"), "Failed to start MCP server"),
            }
        }
        Self { clients }
    }

    #[must_use]
    pub fn server_names(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }
}

impl ToolClientRegistry for McpRegistry {
    fn find_client(&self, name: &str) -> Option<Arc<dyn ToolClient>> {
        self.clients
            .get(name)
            .map(|client| Arc::clone(client) as Arc<dyn ToolClient>)
    }

    fn list_enabled_clients(&self) -> BTreeMap<String, ClientDescriptor> {
        self.clients
            .iter()
            .map(|(name, client)| {
                (
                    name.clone(),
                    ClientDescriptor {
                        tools: client.tools().to_vec(),
                    },
                )
            })
            .collect()
    }
}
