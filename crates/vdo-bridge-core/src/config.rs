//! Session configuration
//!
//! One [`SessionConfig`] per bridge session, immutable after creation. The
//! struct is deserialized straight from the `connect` tool input, so every
//! field carries a serde default and unknown fields are rejected there as
//! validation errors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::types::StreamId;

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

const DEFAULT_HEARTBEAT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_MS: u64 = 1_000;
const DEFAULT_MAX_RECONNECT_MS: u64 = 30_000;
const DEFAULT_TOKEN_TTL_SECS: u64 = 600;
const DEFAULT_FILE_CHUNK_BYTES: u64 = 16 * 1024;
const DEFAULT_FILE_MAX_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_FILE_ACK_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FILE_MAX_RETRIES: u32 = 5;
const DEFAULT_FILE_COMPLETED_CAP: usize = 32;
const DEFAULT_SPOOL_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024;
const DEFAULT_STATE_MAX_KEYS: usize = 512;
const DEFAULT_STATE_MAX_SNAPSHOT_ENTRIES: usize = 256;
const DEFAULT_EVENT_QUEUE_CAP: usize = 2_000;

fn default_heartbeat_ms() -> u64 {
    DEFAULT_HEARTBEAT_MS
}
fn default_reconnect_ms() -> u64 {
    DEFAULT_RECONNECT_MS
}
fn default_max_reconnect_ms() -> u64 {
    DEFAULT_MAX_RECONNECT_MS
}
fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}
fn default_file_chunk_bytes() -> u64 {
    DEFAULT_FILE_CHUNK_BYTES
}
fn default_file_max_bytes() -> u64 {
    DEFAULT_FILE_MAX_BYTES
}
fn default_file_ack_timeout_ms() -> u64 {
    DEFAULT_FILE_ACK_TIMEOUT_MS
}
fn default_file_max_retries() -> u32 {
    DEFAULT_FILE_MAX_RETRIES
}
fn default_file_completed_cap() -> usize {
    DEFAULT_FILE_COMPLETED_CAP
}
fn default_spool_threshold_bytes() -> u64 {
    DEFAULT_SPOOL_THRESHOLD_BYTES
}
fn default_state_max_keys() -> usize {
    DEFAULT_STATE_MAX_KEYS
}
fn default_state_max_snapshot_entries() -> usize {
    DEFAULT_STATE_MAX_SNAPSHOT_ENTRIES
}
fn default_event_queue_cap() -> usize {
    DEFAULT_EVENT_QUEUE_CAP
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Immutable configuration for a single bridge session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Signalling endpoint (websocket URL for real transports; an arbitrary
    /// label for in-process ones).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Room to join.
    pub room: String,

    /// Stream id this session announces itself under.
    pub stream_id: StreamId,

    /// Optional remote stream to view on start.
    #[serde(default)]
    pub target_stream_id: Option<StreamId>,

    /// Optional signalling room password.
    #[serde(default)]
    pub password: Option<String>,

    /// Human-readable label announced alongside the stream id.
    #[serde(default)]
    pub label: Option<String>,

    /// Heartbeat interval.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Initial reconnect backoff.
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_ms: u64,

    /// Reconnect backoff ceiling.
    #[serde(default = "default_max_reconnect_ms")]
    pub max_reconnect_ms: u64,

    /// Pre-minted join token sent verbatim in `sync.hello`.
    #[serde(default)]
    pub join_token: Option<String>,

    /// HMAC secret used to mint and verify join tokens.
    #[serde(default)]
    pub join_token_secret: Option<String>,

    /// Minted-token lifetime in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Reject peers whose hello carries no valid token even when no secret
    /// is configured locally.
    #[serde(default)]
    pub enforce_join_token: bool,

    /// When non-empty, only these stream ids are admitted.
    #[serde(default)]
    pub allow_peer_stream_ids: Vec<StreamId>,

    /// Require a valid session MAC on every non-sync envelope.
    #[serde(default)]
    pub require_session_mac: bool,

    /// File chunk size on the wire.
    #[serde(default = "default_file_chunk_bytes")]
    pub file_chunk_bytes: u64,

    /// Largest accepted/offered payload.
    #[serde(default = "default_file_max_bytes")]
    pub file_max_bytes: u64,

    /// Per-chunk ACK timeout.
    #[serde(default = "default_file_ack_timeout_ms")]
    pub file_ack_timeout_ms: u64,

    /// Per-sequence retry bound before an outgoing transfer fails.
    #[serde(default = "default_file_max_retries")]
    pub file_max_retries: u32,

    /// How many completed transfers to retain before LRU eviction.
    #[serde(default = "default_file_completed_cap")]
    pub file_completed_cap: usize,

    /// Directory for spool files; a per-session temp dir when unset.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,

    /// Incoming transfers at or above this size spool to disk.
    #[serde(default = "default_spool_threshold_bytes")]
    pub spool_threshold_bytes: u64,

    /// Keep spool files on cleanup instead of deleting them.
    #[serde(default)]
    pub keep_spool_files: bool,

    /// Cap on distinct keys in the replicated state store.
    #[serde(default = "default_state_max_keys")]
    pub state_max_keys: usize,

    /// Cap on entries included in one state snapshot.
    #[serde(default = "default_state_max_snapshot_entries")]
    pub state_max_snapshot_entries: usize,

    /// Event queue capacity (drop-oldest beyond this).
    #[serde(default = "default_event_queue_cap")]
    pub event_queue_cap: usize,
}

impl SessionConfig {
    /// Minimal config for a room + stream id, defaults everywhere else.
    pub fn new<R: Into<String>, S: Into<String>>(room: R, stream_id: S) -> Self {
        serde_json::from_value(serde_json::json!({
            "room": room.into(),
            "stream_id": stream_id.into(),
        }))
        .expect("minimal config deserializes")
    }

    /// Fast timers for deterministic tests.
    pub fn testing<R: Into<String>, S: Into<String>>(room: R, stream_id: S) -> Self {
        let mut config = Self::new(room, stream_id);
        config.heartbeat_ms = 50;
        config.reconnect_ms = 10;
        config.max_reconnect_ms = 100;
        config.file_ack_timeout_ms = 250;
        config
    }

    /// Validate invariants the serde layer cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.room.is_empty() {
            return Err("room must not be empty".into());
        }
        if self.stream_id.is_empty() {
            return Err("stream_id must not be empty".into());
        }
        if self.heartbeat_ms == 0 {
            return Err("heartbeat_ms must be greater than 0".into());
        }
        if self.reconnect_ms == 0 {
            return Err("reconnect_ms must be greater than 0".into());
        }
        if self.max_reconnect_ms < self.reconnect_ms {
            return Err("max_reconnect_ms must be >= reconnect_ms".into());
        }
        if self.file_chunk_bytes == 0 {
            return Err("file_chunk_bytes must be greater than 0".into());
        }
        if self.file_max_bytes == 0 {
            return Err("file_max_bytes must be greater than 0".into());
        }
        if self.event_queue_cap == 0 {
            return Err("event_queue_cap must be greater than 0".into());
        }
        if self.state_max_keys == 0 {
            return Err("state_max_keys must be greater than 0".into());
        }
        Ok(())
    }

    /// Whether join tokens are verified for admission.
    pub fn token_verification_active(&self) -> bool {
        self.join_token_secret.is_some() || self.enforce_join_token
    }
}

/// Arc-wrapped config shared across session tasks.
pub type SharedSessionConfig = Arc<SessionConfig>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
