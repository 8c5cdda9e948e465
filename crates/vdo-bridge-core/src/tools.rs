//! Tool surface
//!
//! The named operations a host invokes on bridge sessions, with their
//! input/output contracts. Every failure is classified as a validation
//! error (bad input, unknown ids) or a tool error (everything else); the
//! MCP host layer maps that split onto its result shape.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::errors::BridgeError;
use crate::session::BridgeSession;
use crate::transport::TransportFactory;
use crate::types::{Timestamp, TransferId};

/// Hard cap on events returned by one `receive` call.
pub const MAX_RECEIVE_EVENTS: usize = 500;

// ----------------------------------------------------------------------------
// Tool Errors
// ----------------------------------------------------------------------------

/// How a tool failure should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    Validation,
    Tool,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::Validation => "validation_error",
            ToolErrorKind::Tool => "tool_error",
        }
    }
}

/// A classified tool failure.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn validation<M: Into<String>>(message: M) -> Self {
        Self {
            kind: ToolErrorKind::Validation,
            message: message.into(),
        }
    }

    pub fn tool<M: Into<String>>(message: M) -> Self {
        Self {
            kind: ToolErrorKind::Tool,
            message: message.into(),
        }
    }
}

impl From<BridgeError> for ToolError {
    fn from(err: BridgeError) -> Self {
        if err.is_validation() {
            ToolError::validation(err.to_string())
        } else {
            ToolError::tool(err.to_string())
        }
    }
}

impl core::fmt::Display for ToolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

pub type ToolResult = core::result::Result<Value, ToolError>;

// ----------------------------------------------------------------------------
// Argument Helpers
// ----------------------------------------------------------------------------

fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::validation(format!("missing required field {field}")))
}

fn optional_str<'a>(args: &'a Value, field: &str) -> Option<&'a str> {
    args.get(field).and_then(Value::as_str)
}

fn optional_u64(args: &Value, field: &str) -> Option<u64> {
    args.get(field).and_then(Value::as_u64)
}

fn optional_bool(args: &Value, field: &str) -> bool {
    args.get(field).and_then(Value::as_bool).unwrap_or(false)
}

// ----------------------------------------------------------------------------
// Tool Surface
// ----------------------------------------------------------------------------

/// Session registry plus the operation dispatch a host routes tool calls to.
pub struct ToolSurface {
    factory: Arc<dyn TransportFactory>,
    sessions: std::sync::Mutex<HashMap<String, BridgeSession>>,
    server_name: String,
    server_version: String,
}

impl ToolSurface {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            sessions: std::sync::Mutex::new(HashMap::new()),
            server_name: "vdo-bridge".into(),
            server_version: env!("CARGO_PKG_VERSION").into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    fn session(&self, session_id: &str) -> Result<BridgeSession, ToolError> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| ToolError::validation(format!("unknown session {session_id}")))
    }

    fn session_from(&self, args: &Value) -> Result<BridgeSession, ToolError> {
        self.session(require_str(args, "session_id")?)
    }

    /// Dispatch one operation by name. Unknown names are validation errors.
    pub async fn dispatch(&self, name: &str, args: &Value) -> ToolResult {
        match name {
            "connect" => self.connect(args).await,
            "send" => self.send(args).await,
            "receive" => self.receive(args).await,
            "status" => self.status(args).await,
            "disconnect" => self.disconnect(args).await,
            "list_sessions" => self.list_sessions().await,
            "capabilities" => self.capabilities(),
            "sync_peers" => self.sync_peers(args).await,
            "sync_announce" => self.sync_announce(args).await,
            "file_send" => self.file_send(args).await,
            "file_resume" => self.file_resume(args).await,
            "file_transfers" => self.file_transfers(args).await,
            "file_receive" => self.file_receive(args).await,
            "file_save" => self.file_save(args).await,
            "state_set" => self.state_set(args).await,
            "state_get" => self.state_get(args).await,
            "state_sync" => self.state_sync(args).await,
            other => Err(ToolError::validation(format!("unknown tool {other}"))),
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    async fn connect(&self, args: &Value) -> ToolResult {
        let config: SessionConfig = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::validation(format!("invalid config: {e}")))?;
        let session_id = format!("sess-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let session = BridgeSession::new(session_id.clone(), config, self.factory.clone())
            .map_err(ToolError::from)?;

        // A failed first connect leaves the session reconnecting; the
        // caller still gets a usable session handle.
        if let Err(err) = session.start().await {
            tracing::warn!(session = %session_id, error = %err, "initial connect failed");
        }

        let status = session.status().await;
        let effective_config = serde_json::to_value(session.config())
            .map_err(|e| ToolError::tool(e.to_string()))?;
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .insert(session_id.clone(), session);

        Ok(json!({
            "session_id": session_id,
            "status": status["status"],
            "effective_config": effective_config,
        }))
    }

    async fn disconnect(&self, args: &Value) -> ToolResult {
        let session_id = require_str(args, "session_id")?;
        let session = {
            let mut sessions = self.sessions.lock().expect("session registry poisoned");
            sessions
                .remove(session_id)
                .ok_or_else(|| ToolError::validation(format!("unknown session {session_id}")))?
        };
        session.stop().await.map_err(ToolError::from)?;
        Ok(json!({ "ok": true, "closed_at": Timestamp::now().as_millis() }))
    }

    async fn list_sessions(&self) -> ToolResult {
        let sessions: Vec<BridgeSession> = self
            .sessions
            .lock()
            .expect("session registry poisoned")
            .values()
            .cloned()
            .collect();
        let mut list = Vec::with_capacity(sessions.len());
        for session in sessions {
            let status = session.status().await;
            list.push(json!({
                "session_id": session.id(),
                "status": status["status"],
                "room": session.config().room,
                "stream_id": session.config().stream_id,
            }));
        }
        Ok(json!({ "sessions": list }))
    }

    fn capabilities(&self) -> ToolResult {
        let session_count = self
            .sessions
            .lock()
            .expect("session registry poisoned")
            .len();
        let envelope_kinds: Vec<&'static str> = crate::envelope::EnvelopeKind::ALL
            .iter()
            .map(|kind| kind.as_str())
            .collect();
        Ok(json!({
            "server": self.server_name,
            "version": self.server_version,
            "protocol_magic": crate::envelope::ENVELOPE_MAGIC,
            "envelope_kinds": envelope_kinds,
            "features": ["messaging", "files", "state"],
            "active_sessions": session_count,
        }))
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    async fn send(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let data = args
            .get("data")
            .cloned()
            .ok_or_else(|| ToolError::validation("missing required field data"))?;
        let (ok, used_target) = session
            .send(data, args.get("target"))
            .await
            .map_err(ToolError::from)?;
        Ok(json!({ "ok": ok, "used_target": used_target }))
    }

    async fn receive(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let max_events = optional_u64(args, "max_events")
            .unwrap_or(100)
            .min(MAX_RECEIVE_EVENTS as u64) as usize;
        let wait_ms = optional_u64(args, "wait_ms").unwrap_or(0);
        let events = session.poll_events(max_events, wait_ms).await;
        Ok(json!({
            "event_count": events.len(),
            "events": events,
        }))
    }

    async fn status(&self, args: &Value) -> ToolResult {
        Ok(self.session_from(args)?.status().await)
    }

    async fn sync_peers(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        Ok(json!({ "peers": session.peer_summaries().await }))
    }

    async fn sync_announce(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        session
            .announce(args.get("target"))
            .await
            .map_err(ToolError::from)?;
        Ok(json!({ "ok": true }))
    }

    // ------------------------------------------------------------------
    // File transfer
    // ------------------------------------------------------------------

    async fn file_send(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let data_base64 = optional_str(args, "data_base64");
        let file_path = optional_str(args, "file_path");
        let name = optional_str(args, "name").map(String::from);
        let mime = optional_str(args, "mime").map(String::from);
        let chunk_bytes = optional_u64(args, "chunk_bytes");
        let ack_timeout_ms = optional_u64(args, "ack_timeout_ms");
        let max_retries = optional_u64(args, "max_retries").map(|r| r as u32);
        let transfer_id = optional_str(args, "transfer_id").map(TransferId::new);
        let target = args.get("target");

        let summary = match (data_base64, file_path) {
            (Some(_), Some(_)) => {
                return Err(ToolError::validation(
                    "provide either data_base64 or file_path, not both",
                ))
            }
            (None, None) => {
                return Err(ToolError::validation(
                    "provide data_base64 or file_path",
                ))
            }
            (Some(encoded), None) => {
                let data = BASE64
                    .decode(encoded)
                    .map_err(|e| ToolError::validation(format!("data_base64: {e}")))?;
                session
                    .send_file_bytes(
                        data,
                        target,
                        name,
                        mime,
                        chunk_bytes,
                        ack_timeout_ms,
                        max_retries,
                        transfer_id,
                    )
                    .await
                    .map_err(ToolError::from)?
            }
            (None, Some(path)) => session
                .send_file_path(
                    std::path::PathBuf::from(path),
                    target,
                    name,
                    mime,
                    chunk_bytes,
                    ack_timeout_ms,
                    max_retries,
                    transfer_id,
                )
                .await
                .map_err(ToolError::from)?,
        };
        serde_json::to_value(summary).map_err(|e| ToolError::tool(e.to_string()))
    }

    async fn file_resume(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let transfer_id = TransferId::new(require_str(args, "transfer_id")?);
        let start_seq = optional_u64(args, "start_seq");
        let summary = session
            .resume_file(&transfer_id, start_seq)
            .await
            .map_err(ToolError::from)?;
        serde_json::to_value(summary).map_err(|e| ToolError::tool(e.to_string()))
    }

    async fn file_transfers(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let direction = optional_str(args, "direction").unwrap_or("all");
        let transfers = session
            .file_transfers(direction)
            .await
            .map_err(ToolError::from)?;
        Ok(json!({
            "transfer_count": transfers.len(),
            "transfers": transfers,
        }))
    }

    async fn file_receive(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let transfer_id = TransferId::new(require_str(args, "transfer_id")?);
        let encoding = optional_str(args, "encoding").unwrap_or("base64");
        let data = session
            .read_received_file(&transfer_id)
            .await
            .map_err(ToolError::from)?;
        match encoding {
            "base64" => Ok(json!({
                "transfer_id": transfer_id,
                "encoding": "base64",
                "data_base64": BASE64.encode(&data),
                "total_bytes": data.len(),
            })),
            "utf8" => {
                let text = String::from_utf8(data)
                    .map_err(|_| ToolError::tool("payload is not valid UTF-8"))?;
                Ok(json!({
                    "transfer_id": transfer_id,
                    "encoding": "utf8",
                    "data_text": text,
                }))
            }
            "json" => {
                let value: Value = serde_json::from_slice(&data)
                    .map_err(|e| ToolError::tool(format!("payload is not valid JSON: {e}")))?;
                Ok(json!({
                    "transfer_id": transfer_id,
                    "encoding": "json",
                    "data_json": value,
                }))
            }
            other => Err(ToolError::validation(format!(
                "encoding must be base64, utf8, or json (got {other})"
            ))),
        }
    }

    async fn file_save(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let transfer_id = TransferId::new(require_str(args, "transfer_id")?);
        let output_path = require_str(args, "output_path")?;
        let overwrite = optional_bool(args, "overwrite");
        let bytes_written = session
            .save_received_file(&transfer_id, std::path::Path::new(output_path), overwrite)
            .await
            .map_err(ToolError::from)?;
        Ok(json!({
            "output_path": output_path,
            "bytes_written": bytes_written,
        }))
    }

    // ------------------------------------------------------------------
    // Replicated state
    // ------------------------------------------------------------------

    async fn state_set(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let key = require_str(args, "key")?;
        let value = args
            .get("value")
            .cloned()
            .ok_or_else(|| ToolError::validation("missing required field value"))?;
        let clock = session
            .state_set(key, value)
            .await
            .map_err(ToolError::from)?;
        Ok(json!({ "ok": true, "key": key, "clock": clock }))
    }

    async fn state_get(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let key = optional_str(args, "key");
        let include_meta = optional_bool(args, "include_meta");
        Ok(session.state_get(key, include_meta).await)
    }

    async fn state_sync(&self, args: &Value) -> ToolResult {
        let session = self.session_from(args)?;
        let mode = optional_str(args, "mode").unwrap_or("both");
        let notified = session.state_sync(mode).await.map_err(ToolError::from)?;
        Ok(json!({ "ok": true, "mode": mode, "peers_notified": notified }))
    }

    /// Stop and drop every session. Used by host shutdown paths.
    pub async fn shutdown(&self) {
        let sessions: Vec<BridgeSession> = self
            .sessions
            .lock()
            .expect("session registry poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            let _ = session.stop().await;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
