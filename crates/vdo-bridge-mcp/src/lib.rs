//! vdo-bridge MCP host
//!
//! Hosts the bridge tool surface behind the Model Context Protocol:
//! JSON-RPC over stdio (newline-delimited or `Content-Length`-framed,
//! autodetected) and over streamable HTTP. Tool profiles restrict what a
//! server exposes; environment variables supply process-wide defaults.

pub mod env;
pub mod http;
pub mod jsonrpc;
pub mod profile;
pub mod service;
pub mod stdio;

pub use env::{EnvDefaults, HttpSettings};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use profile::ToolProfile;
pub use service::{McpService, SUPPORTED_PROTOCOL_VERSIONS};
