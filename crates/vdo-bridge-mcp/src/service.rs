//! MCP method dispatch
//!
//! Maps JSON-RPC methods onto the bridge tool surface. Tool failures come
//! back as successful JSON-RPC responses whose result carries `isError`;
//! JSON-RPC error codes are reserved for protocol-level problems.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vdo_bridge_core::tools::{ToolError, ToolSurface};

use crate::env::EnvDefaults;
use crate::jsonrpc::{
    JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND,
};
use crate::profile::{ToolProfile, ALL_TOOLS};

/// Protocol versions this host can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2024-11-05"];

/// Default cap on one inbound JSON-RPC message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

/// One MCP server: a tool surface, a profile, and connection bookkeeping.
pub struct McpService {
    surface: Arc<ToolSurface>,
    profile: ToolProfile,
    env: EnvDefaults,
    pub max_message_bytes: usize,
    exit_requested: AtomicBool,
}

impl McpService {
    pub fn new(surface: Arc<ToolSurface>, profile: ToolProfile, env: EnvDefaults) -> Self {
        let max_message_bytes = env.max_message_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        Self {
            surface,
            profile,
            env,
            max_message_bytes,
            exit_requested: AtomicBool::new(false),
        }
    }

    /// True once an `exit` notification arrived.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    pub fn profile(&self) -> &ToolProfile {
        &self.profile
    }

    /// Handle one request. `None` means a notification with no response.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if !request.is_valid() {
            return Some(JsonRpcResponse::failure(
                request.id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            ));
        }

        let id = request.id.clone();
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "initialize" => id.map(|id| self.initialize(id, &params)),
            "ping" => id.map(|id| JsonRpcResponse::success(id, json!({}))),
            "tools/list" => id.map(|id| self.tools_list(id)),
            "tools/call" => match id {
                Some(id) => Some(self.tools_call(id, &params).await),
                None => None,
            },
            "resources/list" => id.map(|id| JsonRpcResponse::success(id, json!({"resources": []}))),
            "prompts/list" => id.map(|id| JsonRpcResponse::success(id, json!({"prompts": []}))),
            "shutdown" => {
                self.surface.shutdown().await;
                id.map(|id| JsonRpcResponse::success(id, Value::Null))
            }
            "notifications/initialized" | "notifications/cancelled" => None,
            "exit" => {
                self.exit_requested.store(true, Ordering::SeqCst);
                None
            }
            other => {
                tracing::debug!(method = other, "method not found");
                id.map(|id| {
                    JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("unknown method {other}"))
                })
            }
        }
    }

    /// Handle a single message or a batch (processed in array order).
    /// Returns the response value, or `None` when nothing is owed.
    pub async fn handle_value(&self, value: Value) -> Option<Value> {
        match value {
            Value::Array(batch) => {
                if batch.is_empty() {
                    return Some(
                        serde_json::to_value(JsonRpcResponse::failure(
                            Value::Null,
                            INVALID_REQUEST,
                            "empty batch",
                        ))
                        .expect("response serializes"),
                    );
                }
                let mut responses = Vec::new();
                for item in batch {
                    if let Some(response) = self.handle_parsed(item).await {
                        responses.push(
                            serde_json::to_value(response).expect("response serializes"),
                        );
                    }
                }
                if responses.is_empty() {
                    None
                } else {
                    Some(Value::Array(responses))
                }
            }
            other => self
                .handle_parsed(other)
                .await
                .map(|r| serde_json::to_value(r).expect("response serializes")),
        }
    }

    async fn handle_parsed(&self, value: Value) -> Option<JsonRpcResponse> {
        let id = value.get("id").cloned();
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => self.handle(request).await,
            Err(err) => Some(JsonRpcResponse::failure(
                id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                format!("invalid request: {err}"),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Methods
    // ------------------------------------------------------------------

    fn initialize(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let requested = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let negotiated = SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .find(|v| **v == requested)
            .copied()
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);

        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": negotiated,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": self.surface.server_name(),
                    "version": self.surface.server_version(),
                },
            }),
        )
    }

    fn tools_list(&self, id: Value) -> JsonRpcResponse {
        let tools: Vec<Value> = self
            .profile
            .listed_tools()
            .into_iter()
            .map(tool_spec)
            .collect();
        JsonRpcResponse::success(id, json!({ "tools": tools }))
    }

    async fn tools_call(&self, id: Value, params: &Value) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::failure(id, INVALID_REQUEST, "tools/call needs a name");
        };
        let mut arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        if !ALL_TOOLS.contains(&name) {
            return tool_error_response(
                id,
                name,
                &ToolError::validation(format!("unknown tool {name}")),
            );
        }
        if !self.profile.allows(name) {
            return tool_error_response(
                id,
                name,
                &ToolError::validation(format!(
                    "tool {name} is disabled by profile {}",
                    self.profile.name()
                )),
            );
        }

        let op = name.strip_prefix("vdo_").unwrap_or(name);
        if op == "connect" {
            self.env.apply_connect_defaults(&mut arguments);
        }

        match self.surface.dispatch(op, &arguments).await {
            Ok(mut payload) => {
                // The message cap and active profile live at the host layer,
                // not in the transport-agnostic surface.
                if name == "vdo_capabilities" {
                    if let Some(map) = payload.as_object_mut() {
                        map.insert("max_message_bytes".into(), json!(self.max_message_bytes));
                        map.insert("profile".into(), json!(self.profile.name()));
                    }
                }
                tool_success_response(id, payload)
            }
            Err(err) => tool_error_response(id, name, &err),
        }
    }
}

// ----------------------------------------------------------------------------
// Tool Result Shaping
// ----------------------------------------------------------------------------

fn tool_success_response(id: Value, payload: Value) -> JsonRpcResponse {
    let text = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".into());
    JsonRpcResponse::success(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": payload,
            "isError": false,
        }),
    )
}

fn tool_error_response(id: Value, tool: &str, err: &ToolError) -> JsonRpcResponse {
    let payload = json!({
        "ok": false,
        "error": {
            "type": err.kind.as_str(),
            "message": err.message,
            "tool": tool,
        },
    });
    let text = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".into());
    JsonRpcResponse::success(
        id,
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": payload,
            "isError": true,
        }),
    )
}

/// Catch-all internal error response for transport layers.
pub fn internal_error(id: Value, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse::failure(id, INTERNAL_ERROR, message)
}

// ----------------------------------------------------------------------------
// Tool Catalog
// ----------------------------------------------------------------------------

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn tool_spec(name: &'static str) -> Value {
    let (description, input_schema) = match name {
        "vdo_connect" => (
            "Join a room through the signalling service and start a bridge session.",
            schema(
                json!({
                    "room": {"type": "string"},
                    "stream_id": {"type": "string"},
                    "target_stream_id": {"type": "string"},
                    "password": {"type": "string"},
                    "label": {"type": "string"},
                    "join_token": {"type": "string"},
                    "join_token_secret": {"type": "string"},
                    "enforce_join_token": {"type": "boolean"},
                    "allow_peer_stream_ids": {"type": "array", "items": {"type": "string"}},
                    "require_session_mac": {"type": "boolean"},
                    "heartbeat_ms": {"type": "integer"},
                    "reconnect_ms": {"type": "integer"},
                    "max_reconnect_ms": {"type": "integer"},
                    "file_chunk_bytes": {"type": "integer"},
                    "file_max_bytes": {"type": "integer"},
                    "file_ack_timeout_ms": {"type": "integer"},
                    "file_max_retries": {"type": "integer"},
                    "spool_dir": {"type": "string"},
                    "spool_threshold_bytes": {"type": "integer"},
                    "keep_spool_files": {"type": "boolean"},
                    "state_max_keys": {"type": "integer"},
                    "state_max_snapshot_entries": {"type": "integer"},
                    "event_queue_cap": {"type": "integer"},
                    "token_ttl_secs": {"type": "integer"},
                    "file_completed_cap": {"type": "integer"},
                    "endpoint": {"type": "string"},
                }),
                &["room", "stream_id"],
            ),
        ),
        "vdo_send" => (
            "Send an application payload to a peer over the data channel.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "data": {},
                    "target": {},
                }),
                &["session_id", "data"],
            ),
        ),
        "vdo_receive" => (
            "Poll queued session events, optionally waiting for the first one.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "max_events": {"type": "integer", "maximum": 500},
                    "wait_ms": {"type": "integer", "maximum": 30000},
                }),
                &["session_id"],
            ),
        ),
        "vdo_status" => (
            "Live session status snapshot including the peer list.",
            schema(json!({"session_id": {"type": "string"}}), &["session_id"]),
        ),
        "vdo_disconnect" => (
            "Stop a session and remove it.",
            schema(json!({"session_id": {"type": "string"}}), &["session_id"]),
        ),
        "vdo_list_sessions" => ("List active sessions.", schema(json!({}), &[])),
        "vdo_capabilities" => ("Static and dynamic server info.", schema(json!({}), &[])),
        "vdo_sync_peers" => (
            "Peer records with handshake and auth state.",
            schema(json!({"session_id": {"type": "string"}}), &["session_id"]),
        ),
        "vdo_sync_announce" => (
            "Re-announce capabilities to one peer or the whole room.",
            schema(
                json!({"session_id": {"type": "string"}, "target": {}}),
                &["session_id"],
            ),
        ),
        "vdo_file_send" => (
            "Send a payload as a chunked, integrity-checked file transfer.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "data_base64": {"type": "string"},
                    "file_path": {"type": "string"},
                    "name": {"type": "string"},
                    "mime": {"type": "string"},
                    "target": {},
                    "chunk_bytes": {"type": "integer"},
                    "ack_timeout_ms": {"type": "integer"},
                    "max_retries": {"type": "integer"},
                    "transfer_id": {"type": "string"},
                }),
                &["session_id"],
            ),
        ),
        "vdo_file_resume" => (
            "Resume an outgoing transfer from the receiver's position.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "transfer_id": {"type": "string"},
                    "start_seq": {"type": "integer"},
                }),
                &["session_id", "transfer_id"],
            ),
        ),
        "vdo_file_transfers" => (
            "List transfers for a session.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "direction": {"type": "string", "enum": ["incoming", "outgoing", "all"]},
                }),
                &["session_id"],
            ),
        ),
        "vdo_file_receive" => (
            "Read a completed incoming transfer's payload.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "transfer_id": {"type": "string"},
                    "encoding": {"type": "string", "enum": ["base64", "utf8", "json"]},
                }),
                &["session_id", "transfer_id"],
            ),
        ),
        "vdo_file_save" => (
            "Write a completed incoming transfer to disk.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "transfer_id": {"type": "string"},
                    "output_path": {"type": "string"},
                    "overwrite": {"type": "boolean"},
                }),
                &["session_id", "transfer_id", "output_path"],
            ),
        ),
        "vdo_state_set" => (
            "Write a key into the replicated room state.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "key": {"type": "string"},
                    "value": {},
                }),
                &["session_id", "key", "value"],
            ),
        ),
        "vdo_state_get" => (
            "Read one key or the whole replicated store.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "key": {"type": "string"},
                    "include_meta": {"type": "boolean"},
                }),
                &["session_id"],
            ),
        ),
        "vdo_state_sync" => (
            "Exchange state snapshots with peers.",
            schema(
                json!({
                    "session_id": {"type": "string"},
                    "mode": {"type": "string", "enum": ["send", "request", "both"]},
                }),
                &["session_id"],
            ),
        ),
        other => {
            tracing::debug!(tool = other, "no dedicated schema");
            ("Bridge tool.", schema(json!({}), &[]))
        }
    };
    json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vdo_bridge_harness::{fake_transport_factory, SignalHub};

    fn service(profile: ToolProfile) -> McpService {
        let hub = SignalHub::new();
        McpService::new(
            Arc::new(ToolSurface::new(fake_transport_factory(&hub))),
            profile,
            EnvDefaults::default(),
        )
    }

    fn request(method: &str, id: Option<i64>, params: Value) -> JsonRpcRequest {
        serde_json::from_value(match id {
            Some(id) => json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
            None => json!({"jsonrpc": "2.0", "method": method, "params": params}),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let service = service(ToolProfile::full());
        let response = service
            .handle(request(
                "initialize",
                Some(1),
                json!({"protocolVersion": "2024-11-05"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["protocolVersion"], "2024-11-05");

        let response = service
            .handle(request(
                "initialize",
                Some(2),
                json!({"protocolVersion": "1999-01-01"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.result.unwrap()["protocolVersion"], "2025-06-18");
    }

    #[tokio::test]
    async fn test_ping_and_unknown_method() {
        let service = service(ToolProfile::full());
        let pong = service.handle(request("ping", Some(1), json!({}))).await.unwrap();
        assert!(pong.error.is_none());

        let missing = service
            .handle(request("no/such", Some(2), json!({})))
            .await
            .unwrap();
        assert_eq!(missing.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notifications_produce_no_response() {
        let service = service(ToolProfile::full());
        assert!(service
            .handle(request("notifications/initialized", None, json!({})))
            .await
            .is_none());
        assert!(service.handle(request("exit", None, json!({}))).await.is_none());
        assert!(service.exit_requested());
    }

    #[tokio::test]
    async fn test_tools_list_respects_profile() {
        let service = service(ToolProfile::messaging());
        let response = service.handle(request("tools/list", Some(1), json!({}))).await.unwrap();
        let tools = response.result.unwrap()["tools"].clone();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"vdo_send"));
        assert!(!names.contains(&"vdo_file_send"));
    }

    #[tokio::test]
    async fn test_profile_disabled_tool_call() {
        let service = service(ToolProfile::messaging());
        let response = service
            .handle(request(
                "tools/call",
                Some(1),
                json!({"name": "vdo_file_send", "arguments": {}}),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let error = &result["structuredContent"]["error"];
        assert_eq!(error["type"], "validation_error");
        assert!(error["message"].as_str().unwrap().contains("messaging"));
    }

    #[tokio::test]
    async fn test_capabilities_reports_protocol_and_host_limits() {
        let service = service(ToolProfile::messaging());
        let response = service
            .handle(request(
                "tools/call",
                Some(1),
                json!({"name": "vdo_capabilities", "arguments": {}}),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], false);
        let payload = &result["structuredContent"];
        assert_eq!(payload["protocol_magic"], "vdo_mcp_bridge_v1");
        assert_eq!(payload["envelope_kinds"].as_array().unwrap().len(), 17);
        assert!(payload["envelope_kinds"]
            .as_array()
            .unwrap()
            .contains(&json!("file.resume_state")));
        assert_eq!(
            payload["max_message_bytes"],
            json!(DEFAULT_MAX_MESSAGE_BYTES)
        );
        assert_eq!(payload["profile"], "messaging");
    }

    #[tokio::test]
    async fn test_tool_call_validation_error_shape() {
        let service = service(ToolProfile::full());
        let response = service
            .handle(request(
                "tools/call",
                Some(1),
                json!({"name": "vdo_status", "arguments": {"session_id": "nope"}}),
            ))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["error"]["type"], "validation_error");
        assert_eq!(result["structuredContent"]["error"]["tool"], "vdo_status");
        assert_eq!(result["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn test_batch_in_order_and_notification_only() {
        let service = service(ToolProfile::full());
        let batch = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "ping"},
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "id": 2, "method": "tools/list"},
        ]);
        let responses = service.handle_value(batch).await.unwrap();
        let responses = responses.as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[1]["id"], 2);

        let only_notes = json!([
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
        ]);
        assert!(service.handle_value(only_notes).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_jsonrpc_version() {
        let service = service(ToolProfile::full());
        let response = service
            .handle_value(json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], INVALID_REQUEST);
    }
}
