//! Wire envelope for bridge-protocol messages
//!
//! Every bridge-protocol message travels inside a data-channel payload as a
//! JSON object tagged with [`ENVELOPE_MAGIC`]. Payload shape depends on the
//! [`EnvelopeKind`]; each kind has a typed payload struct with a thin
//! serde_json conversion layer. Anything that does not carry the magic is
//! opaque application data and never enters the protocol engines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};
use crate::types::{StreamId, Timestamp, TransferId};

/// Magic marker identifying a bridge-protocol envelope on the wire.
pub const ENVELOPE_MAGIC: &str = "vdo_mcp_bridge_v1";

// ----------------------------------------------------------------------------
// Envelope Kind
// ----------------------------------------------------------------------------

/// Discriminator for the 17 bridge-protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "sync.hello")]
    SyncHello,
    #[serde(rename = "sync.hello_ack")]
    SyncHelloAck,
    #[serde(rename = "sync.heartbeat")]
    SyncHeartbeat,
    #[serde(rename = "sync.reject")]
    SyncReject,
    #[serde(rename = "file.offer")]
    FileOffer,
    #[serde(rename = "file.accept")]
    FileAccept,
    #[serde(rename = "file.chunk")]
    FileChunk,
    #[serde(rename = "file.ack")]
    FileAck,
    #[serde(rename = "file.nack")]
    FileNack,
    #[serde(rename = "file.complete")]
    FileComplete,
    #[serde(rename = "file.complete_ack")]
    FileCompleteAck,
    #[serde(rename = "file.resume_req")]
    FileResumeReq,
    #[serde(rename = "file.resume_state")]
    FileResumeState,
    #[serde(rename = "file.cancel")]
    FileCancel,
    #[serde(rename = "state.patch")]
    StatePatch,
    #[serde(rename = "state.snapshot_req")]
    StateSnapshotReq,
    #[serde(rename = "state.snapshot")]
    StateSnapshot,
}

impl EnvelopeKind {
    /// Every wire kind, in protocol declaration order.
    pub const ALL: [EnvelopeKind; 17] = [
        EnvelopeKind::SyncHello,
        EnvelopeKind::SyncHelloAck,
        EnvelopeKind::SyncHeartbeat,
        EnvelopeKind::SyncReject,
        EnvelopeKind::FileOffer,
        EnvelopeKind::FileAccept,
        EnvelopeKind::FileChunk,
        EnvelopeKind::FileAck,
        EnvelopeKind::FileNack,
        EnvelopeKind::FileComplete,
        EnvelopeKind::FileCompleteAck,
        EnvelopeKind::FileResumeReq,
        EnvelopeKind::FileResumeState,
        EnvelopeKind::FileCancel,
        EnvelopeKind::StatePatch,
        EnvelopeKind::StateSnapshotReq,
        EnvelopeKind::StateSnapshot,
    ];

    /// Sync-family envelopes establish the session and are exempt from the
    /// session-MAC gate.
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            EnvelopeKind::SyncHello
                | EnvelopeKind::SyncHelloAck
                | EnvelopeKind::SyncHeartbeat
                | EnvelopeKind::SyncReject
        )
    }

    /// Wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::SyncHello => "sync.hello",
            EnvelopeKind::SyncHelloAck => "sync.hello_ack",
            EnvelopeKind::SyncHeartbeat => "sync.heartbeat",
            EnvelopeKind::SyncReject => "sync.reject",
            EnvelopeKind::FileOffer => "file.offer",
            EnvelopeKind::FileAccept => "file.accept",
            EnvelopeKind::FileChunk => "file.chunk",
            EnvelopeKind::FileAck => "file.ack",
            EnvelopeKind::FileNack => "file.nack",
            EnvelopeKind::FileComplete => "file.complete",
            EnvelopeKind::FileCompleteAck => "file.complete_ack",
            EnvelopeKind::FileResumeReq => "file.resume_req",
            EnvelopeKind::FileResumeState => "file.resume_state",
            EnvelopeKind::FileCancel => "file.cancel",
            EnvelopeKind::StatePatch => "state.patch",
            EnvelopeKind::StateSnapshotReq => "state.snapshot_req",
            EnvelopeKind::StateSnapshot => "state.snapshot",
        }
    }
}

impl core::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// A bridge-protocol message as it appears inside a data-channel payload.
///
/// Field declaration order matters: the MAC canonical form serializes the
/// subset `{kind, ts, nonce, room, from_stream_id, payload}` in exactly this
/// order (see [`Envelope::mac_canonical_bytes`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub magic: String,
    pub kind: EnvelopeKind,
    pub ts: u64,
    pub nonce: String,
    pub room: String,
    pub from_stream_id: StreamId,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// The MAC'd subset of an envelope in its fixed canonical field order.
///
/// Struct serialization emits fields in declaration order; object keys
/// nested inside `payload` serialize lexicographically (serde_json's map is
/// ordered). Any deviation here breaks interoperability with deployed peers.
#[derive(Serialize)]
struct MacView<'a> {
    kind: EnvelopeKind,
    ts: u64,
    nonce: &'a str,
    room: &'a str,
    from_stream_id: &'a StreamId,
    payload: &'a Value,
}

impl Envelope {
    /// Build a new envelope with a fresh nonce and the current time.
    pub fn new(kind: EnvelopeKind, room: &str, from: &StreamId, payload: Value) -> Self {
        Self {
            magic: ENVELOPE_MAGIC.to_string(),
            kind,
            ts: Timestamp::now().as_millis(),
            nonce: uuid::Uuid::new_v4().to_string(),
            room: room.to_string(),
            from_stream_id: from.clone(),
            payload,
            mac: None,
        }
    }

    /// Canonical bytes the session MAC is computed over.
    pub fn mac_canonical_bytes(&self) -> Vec<u8> {
        let view = MacView {
            kind: self.kind,
            ts: self.ts,
            nonce: &self.nonce,
            room: &self.room,
            from_stream_id: &self.from_stream_id,
            payload: &self.payload,
        };
        serde_json::to_vec(&view).expect("canonical envelope view serializes")
    }

    /// True when a structured data-channel payload looks like a bridge
    /// envelope (magic marker plus a string kind).
    pub fn is_bridge_envelope(value: &Value) -> bool {
        value.get("magic").and_then(Value::as_str) == Some(ENVELOPE_MAGIC)
            && value.get("kind").map(Value::is_string).unwrap_or(false)
    }

    /// Parse a structured payload into an envelope.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| {
            ProtocolError::MalformedEnvelope {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Serialize to the structured payload handed to the transport.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("envelope serializes")
    }

    /// Decode the payload into a typed payload struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProtocolError::MalformedEnvelope {
                reason: format!("{} payload: {}", self.kind, e),
            }
            .into()
        })
    }
}

// ----------------------------------------------------------------------------
// Outbound Envelope
// ----------------------------------------------------------------------------

/// An envelope a protocol engine wants sent to a specific peer. The session
/// applies the session MAC where a shared key exists and hands it to the
/// transport.
#[derive(Debug)]
pub struct OutboundEnvelope {
    pub to: crate::types::PeerUuid,
    pub kind: EnvelopeKind,
    pub payload: Value,
}

impl OutboundEnvelope {
    pub fn new<P: Serialize>(to: &crate::types::PeerUuid, kind: EnvelopeKind, payload: &P) -> Self {
        Self {
            to: to.clone(),
            kind,
            payload: serde_json::to_value(payload).expect("payload serializes"),
        }
    }
}

// ----------------------------------------------------------------------------
// Typed Payloads: sync.*
// ----------------------------------------------------------------------------

/// `sync.hello` / `sync.hello_ack` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Advertised capability set, e.g. `["messaging", "files", "state"]`.
    pub capabilities: Vec<String>,
    /// X25519 public key, base64 of the DER/SPKI encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Join token proving admission rights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Session label, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// `sync.reject` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayload {
    pub reason: String,
}

/// `sync.heartbeat` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Count of peers the sender currently sees as connected.
    pub peer_count: usize,
}

// ----------------------------------------------------------------------------
// Typed Payloads: file.*
// ----------------------------------------------------------------------------

/// `file.offer` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOfferPayload {
    pub transfer_id: TransferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub chunk_bytes: u64,
    /// SHA-256 of the whole payload, lowercase hex.
    pub file_hash: String,
}

/// `file.accept` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAcceptPayload {
    pub transfer_id: TransferId,
    /// First sequence the receiver is missing.
    pub next_seq: u64,
}

/// `file.chunk` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunkPayload {
    pub transfer_id: TransferId,
    pub seq: u64,
    pub data_base64: String,
    /// SHA-256 of the raw chunk bytes, lowercase hex.
    pub chunk_hash: String,
}

/// `file.ack` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAckPayload {
    pub transfer_id: TransferId,
    pub seq: u64,
    pub next_seq: u64,
    pub received_bytes: u64,
}

/// `file.nack` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNackPayload {
    pub transfer_id: TransferId,
    pub expected_seq: u64,
    pub reason: String,
}

/// `file.complete` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCompletePayload {
    pub transfer_id: TransferId,
    pub total_bytes: u64,
    pub file_hash: String,
}

/// `file.complete_ack` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCompleteAckPayload {
    pub transfer_id: TransferId,
    pub file_hash: String,
    pub total_bytes: u64,
}

/// `file.resume_req` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResumeReqPayload {
    pub transfer_id: TransferId,
}

/// `file.resume_state` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResumeStatePayload {
    pub transfer_id: TransferId,
    pub next_seq: u64,
    pub status: String,
}

/// `file.cancel` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCancelPayload {
    pub transfer_id: TransferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ----------------------------------------------------------------------------
// Typed Payloads: state.*
// ----------------------------------------------------------------------------

/// `state.patch` payload: one replicated entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePatchPayload {
    pub key: String,
    pub value: Value,
    pub actor: StreamId,
    pub clock: u64,
    pub updated_at: u64,
}

/// `state.snapshot_req` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshotReqPayload {}

// (The `state.snapshot` payload is crate::state::StateSnapshot.)

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        let mut env = Envelope::new(
            EnvelopeKind::FileAck,
            "room1",
            &StreamId::new("agent_a"),
            serde_json::json!({"transfer_id": "t1", "seq": 0, "next_seq": 1, "received_bytes": 5}),
        );
        env.ts = 1234;
        env.nonce = "n-1".into();
        env
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&EnvelopeKind::SyncHelloAck).unwrap(),
            "\"sync.hello_ack\""
        );
        let kind: EnvelopeKind = serde_json::from_str("\"file.resume_req\"").unwrap();
        assert_eq!(kind, EnvelopeKind::FileResumeReq);
    }

    #[test]
    fn test_all_covers_every_kind() {
        // Each wire name serde-roundtrips and appears exactly once.
        let mut seen = std::collections::BTreeSet::new();
        for kind in EnvelopeKind::ALL {
            let encoded = serde_json::to_string(&kind).unwrap();
            let back: EnvelopeKind = serde_json::from_str(&encoded).unwrap();
            assert_eq!(back, kind);
            assert!(seen.insert(kind.as_str()), "duplicate kind {kind}");
        }
        assert_eq!(seen.len(), 17);
    }

    #[test]
    fn test_sync_kinds_exempt_from_mac() {
        assert!(EnvelopeKind::SyncHello.is_sync());
        assert!(EnvelopeKind::SyncReject.is_sync());
        assert!(!EnvelopeKind::FileChunk.is_sync());
        assert!(!EnvelopeKind::StatePatch.is_sync());
    }

    #[test]
    fn test_envelope_detection() {
        let env = sample();
        assert!(Envelope::is_bridge_envelope(&env.to_value()));
        assert!(!Envelope::is_bridge_envelope(
            &serde_json::json!({"type": "demo.message", "id": "m1"})
        ));
        assert!(!Envelope::is_bridge_envelope(
            &serde_json::json!({"magic": "other", "kind": "file.ack"})
        ));
    }

    #[test]
    fn test_roundtrip_preserves_mac_field() {
        let mut env = sample();
        env.mac = Some("aa".repeat(32));
        let back = Envelope::from_value(env.to_value()).unwrap();
        assert_eq!(back.mac, env.mac);
        assert_eq!(back.kind, EnvelopeKind::FileAck);
    }

    #[test]
    fn test_mac_canonical_field_order() {
        let env = sample();
        let canon = String::from_utf8(env.mac_canonical_bytes()).unwrap();
        // Top-level field order is fixed regardless of the mac field.
        assert!(canon.starts_with("{\"kind\":\"file.ack\",\"ts\":1234,\"nonce\":\"n-1\",\"room\":\"room1\",\"from_stream_id\":\"agent_a\",\"payload\":"));
        // The mac itself never feeds back into the canonical bytes.
        let mut with_mac = env.clone();
        with_mac.mac = Some("00".repeat(32));
        assert_eq!(with_mac.mac_canonical_bytes(), env.mac_canonical_bytes());
    }

    #[test]
    fn test_typed_payload_decoding() {
        let env = sample();
        let ack: FileAckPayload = env.payload_as().unwrap();
        assert_eq!(ack.seq, 0);
        assert_eq!(ack.next_seq, 1);

        let bad: Result<FileChunkPayload> = env.payload_as();
        assert!(bad.is_err());
    }
}
