//! Local IPC server for `session-watch-ctl` and launched clients.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Each connection speaks line-delimited
//! JSON and may hold at most one session at a time. A connection that goes
//! away while holding a session drops its lock, which the watcher then
//! reports as an abandoned session.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "status"}
//! {"command": "open_session", "machine": "vm-1", "pid": 4242}
//! {"command": "close_session"}
//! {"command": "launch", "machine": "vm-1"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: machine 'vm-9'"}
//! {"ok": false, "error": "conflict: ...", "retry": true}
//! ```
//!
//! `retry` is set when `open_session` hits a machine whose launched client
//! pid is not known yet.

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::LauncherConfig;
use crate::launcher::launch_session;
use crate::models::machine::LockState;
use crate::models::session::ResourceId;
use crate::registry::machine::MachineRegistry;
use crate::watcher::token::ClientLock;
use crate::watcher::WatcherHandle;
use crate::{AppError, Result};

/// Everything a connection needs to serve requests.
pub struct IpcState {
    /// Local socket name the server listens on.
    pub ipc_name: String,
    /// Machine registry.
    pub registry: Arc<MachineRegistry>,
    /// Watcher the registry reports to.
    pub watcher: WatcherHandle,
    /// Client launcher, if configured.
    pub launcher: Option<LauncherConfig>,
}

/// Inbound IPC request.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Target machine (for `open_session`, `launch`).
    machine: Option<String>,
    /// Client pid (for `open_session`).
    pid: Option<u32>,
}

/// Outbound IPC response.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// The same request may succeed shortly.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retry: bool,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            retry: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            retry: false,
        }
    }

    fn retry_later(message: impl Into<String>) -> Self {
        Self {
            retry: true,
            ..Self::error(message)
        }
    }
}

struct HeldSession {
    machine: ResourceId,
    session_id: String,
    lock: ClientLock,
}

/// Per-connection protocol state.
pub struct IpcConnection {
    state: Arc<IpcState>,
    held: Option<HeldSession>,
}

impl IpcConnection {
    /// Start a connection with no session held.
    #[must_use]
    pub fn new(state: Arc<IpcState>) -> Self {
        Self { state, held: None }
    }

    /// Machine of the session this connection holds, if any.
    #[must_use]
    pub fn held_machine(&self) -> Option<&ResourceId> {
        self.held.as_ref().map(|held| &held.machine)
    }

    /// Serve one request line and return the response line (without the
    /// trailing newline).
    pub fn handle_line(&mut self, line: &str) -> String {
        let response = match serde_json::from_str::<IpcRequest>(line) {
            Ok(request) => self.dispatch(&request),
            Err(err) => IpcResponse::error(format!("invalid json: {err}")),
        };

        serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_owned())
    }

    /// The peer is gone. A still-held session is abandoned.
    pub fn disconnect(mut self) {
        if let Some(held) = self.held.take() {
            warn!(
                machine = %held.machine,
                session_id = held.session_id,
                "client disconnected while holding its session"
            );
            drop(held.lock);
        }
    }

    fn dispatch(&mut self, request: &IpcRequest) -> IpcResponse {
        let span = info_span!("ipc_command", command = %request.command);
        let _guard = span.enter();

        match request.command.as_str() {
            "list" => self.handle_list(),
            "status" => self.handle_status(),
            "open_session" => self.handle_open(request),
            "close_session" => self.handle_close(),
            "launch" => self.handle_launch(request),
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }

    fn handle_list(&self) -> IpcResponse {
        let machines = self.state.registry.machines();
        match serde_json::to_value(&machines) {
            Ok(items) => IpcResponse::success(serde_json::json!({ "machines": items })),
            Err(err) => IpcResponse::error(format!("failed to list machines: {err}")),
        }
    }

    fn handle_status(&self) -> IpcResponse {
        let watcher = &self.state.watcher;
        IpcResponse::success(serde_json::json!({
            "ready": watcher.is_ready(),
            "reliable": watcher.is_reliable(),
            "stats": watcher.stats(),
        }))
    }

    fn handle_open(&mut self, request: &IpcRequest) -> IpcResponse {
        if let Some(ref held) = self.held {
            return IpcResponse::error(format!(
                "connection already holds a session on '{}'",
                held.machine
            ));
        }
        let Some(ref machine) = request.machine else {
            return IpcResponse::error("missing required 'machine' field");
        };

        let machine = ResourceId::from(machine.as_str());
        match self.state.registry.open_session(&machine, request.pid) {
            Ok(opened) => {
                let data = serde_json::json!({
                    "machine": machine,
                    "session_id": opened.session_id,
                });
                self.held = Some(HeldSession {
                    machine,
                    session_id: opened.session_id,
                    lock: opened.lock,
                });
                IpcResponse::success(data)
            }
            Err(err @ AppError::Conflict(_)) if self.awaiting_spawn_pid(&machine) => {
                IpcResponse::retry_later(err.to_string())
            }
            Err(err) => IpcResponse::error(err.to_string()),
        }
    }

    fn awaiting_spawn_pid(&self, machine: &ResourceId) -> bool {
        self.state
            .registry
            .machine(machine)
            .is_ok_and(|summary| summary.state == LockState::Spawning && summary.pid.is_none())
    }

    fn handle_close(&mut self) -> IpcResponse {
        let Some(held) = self.held.take() else {
            return IpcResponse::error("connection holds no session");
        };

        match self.state.registry.close_session(held.lock) {
            Ok(machine) => IpcResponse::success(serde_json::json!({
                "machine": machine,
                "session_id": held.session_id,
            })),
            Err(err) => IpcResponse::error(err.to_string()),
        }
    }

    fn handle_launch(&self, request: &IpcRequest) -> IpcResponse {
        let Some(ref launcher) = self.state.launcher else {
            return IpcResponse::error("no launcher configured");
        };
        let Some(ref machine) = request.machine else {
            return IpcResponse::error("missing required 'machine' field");
        };

        let machine = ResourceId::from(machine.as_str());
        match launch_session(
            &machine,
            launcher,
            &self.state.ipc_name,
            &self.state.registry,
            &self.state.watcher,
        ) {
            Ok(pid) => IpcResponse::success(serde_json::json!({
                "machine": machine,
                "pid": pid,
            })),
            Err(err) => IpcResponse::error(err.to_string()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<IpcState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let connection = IpcConnection::new(Arc::clone(&state));
                                tokio::spawn(handle_connection(stream, connection, ct.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Serve one client connection until EOF, an I/O error or shutdown.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    mut connection: IpcConnection,
    ct: CancellationToken,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                () = ct.cancelled() => break,
                read = buf_reader.read_line(&mut line) => read,
            };

            match read {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let mut response_line = connection.handle_line(trimmed);
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        connection.disconnect();
        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}
