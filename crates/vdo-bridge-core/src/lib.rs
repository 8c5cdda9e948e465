//! vdo-bridge core engine
//!
//! This crate is the headless engine of the bridge: it exposes peer-to-peer
//! data channels as a set of structured tool calls, with no knowledge of any
//! particular host transport. It can be driven from an MCP server, an HTTP
//! host, or a test harness without changes.
//!
//! ## Architecture Overview
//!
//! - **Session**: the [`session`] module owns the per-session state machine:
//!   connect/reconnect lifecycle, heartbeats, inbound routing, and the
//!   single-critical-section concurrency model.
//! - **Protocol engines**: [`peer`] (handshake, admission, key agreement),
//!   [`file_transfer`] (chunked transfers with integrity, retry, resume, and
//!   spooling), and [`state`] (last-writer-wins replicated store).
//! - **Wire format**: the [`envelope`] module defines the JSON envelope and
//!   the canonical form the session MAC covers; [`crypto`] and [`token`]
//!   supply the X25519/HMAC primitives underneath.
//! - **Surfaces**: [`events`] is the bounded queue hosts poll; [`tools`] is
//!   the operation set hosts dispatch into; [`transport`] is the seam a
//!   network adapter implements.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vdo_bridge_core::{SessionConfig, ToolSurface};
//! use vdo_bridge_core::transport::{PeerTransport, TransportFactory};
//!
//! # fn factory() -> Arc<dyn TransportFactory> { unimplemented!() }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let surface = ToolSurface::new(factory());
//! let result = surface
//!     .dispatch("connect", &serde_json::json!({
//!         "room": "ops-room",
//!         "stream_id": "agent_a",
//!     }))
//!     .await;
//! # let _ = result; Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod file_transfer;
pub mod peer;
pub mod session;
pub mod state;
pub mod token;
pub mod tools;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{SessionConfig, SharedSessionConfig};
pub use errors::{BridgeError, Result};
pub use events::{BridgeEvent, EventQueue, QueuedEvent};
pub use session::{BridgeSession, SessionStatus};
pub use tools::{ToolError, ToolErrorKind, ToolResult, ToolSurface};
pub use transport::{DataPayload, PeerTransport, TransportEvent, TransportFactory};
pub use types::{PeerUuid, StreamId, Timestamp, TransferId};
