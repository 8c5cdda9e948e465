//! Peer records and the handshake engine
//!
//! One [`PeerRecord`] per remote uuid, created on first observation and kept
//! for the session lifetime. The [`HandshakeEngine`] owns admission policy:
//! allowlist, join-token validation, capability exchange, and X25519 key
//! agreement. Derived shared keys live only inside the record and are never
//! serialized.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::SharedSessionConfig;
use crate::crypto::{public_key_from_spki_base64, SessionKeyPair};
use crate::envelope::{Envelope, EnvelopeKind, HelloPayload, OutboundEnvelope, RejectPayload};
use crate::events::BridgeEvent;
use crate::token::{self, TokenPayload};
use crate::types::{PeerUuid, StreamId, Timestamp};

/// Rejection reason for peers outside the allowlist.
pub const REASON_NOT_ALLOWED: &str = "peer not on allowlist";
/// Rejection reason for failed token validation.
pub const REASON_BAD_TOKEN: &str = "invalid join token";

// ----------------------------------------------------------------------------
// Handshake State
// ----------------------------------------------------------------------------

/// Where a peer sits in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    /// Seen via signalling, no `sync.hello` yet.
    Discovered,
    /// A hello arrived and is being processed.
    HelloReceived,
    /// Admission complete; protocol traffic flows.
    Ready,
    /// Refused admission; stays rejected until a valid hello arrives.
    Rejected,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::Discovered => "discovered",
            HandshakeState::HelloReceived => "hello_received",
            HandshakeState::Ready => "ready",
            HandshakeState::Rejected => "rejected",
        }
    }
}

// ----------------------------------------------------------------------------
// Peer Record
// ----------------------------------------------------------------------------

/// Everything the session knows about one remote peer.
#[derive(Debug)]
pub struct PeerRecord {
    pub uuid: PeerUuid,
    pub stream_id: Option<StreamId>,
    pub connected: bool,
    pub last_seen: Timestamp,
    pub last_heartbeat: Option<Timestamp>,
    pub handshake_state: HandshakeState,
    pub auth_ok: bool,
    pub rejected_reason: Option<String>,
    pub capabilities: Vec<String>,
    /// X25519-derived shared key; in-memory only.
    pub shared_key: Option<[u8; 32]>,
    pub token_payload: Option<TokenPayload>,
}

impl PeerRecord {
    /// New record for a peer observed for the first time.
    pub fn discovered(uuid: PeerUuid, stream_id: Option<StreamId>) -> Self {
        Self {
            uuid,
            stream_id,
            connected: true,
            last_seen: Timestamp::now(),
            last_heartbeat: None,
            handshake_state: HandshakeState::Discovered,
            auth_ok: false,
            rejected_reason: None,
            capabilities: Vec::new(),
            shared_key: None,
            token_payload: None,
        }
    }

    pub fn shared_key_ready(&self) -> bool {
        self.shared_key.is_some()
    }

    pub fn touch(&mut self) {
        self.last_seen = Timestamp::now();
    }

    /// Serializable view; never exposes the shared key.
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            uuid: self.uuid.clone(),
            stream_id: self.stream_id.clone(),
            connected: self.connected,
            handshake_state: self.handshake_state,
            auth_ok: self.auth_ok,
            rejected_reason: self.rejected_reason.clone(),
            shared_key_ready: self.shared_key_ready(),
            capabilities: self.capabilities.clone(),
            last_seen: self.last_seen.as_millis(),
            last_heartbeat: self.last_heartbeat.map(|t| t.as_millis()),
        }
    }
}

/// Public view of a peer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub uuid: PeerUuid,
    pub stream_id: Option<StreamId>,
    pub connected: bool,
    pub handshake_state: HandshakeState,
    pub auth_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_reason: Option<String>,
    pub shared_key_ready: bool,
    pub capabilities: Vec<String>,
    pub last_seen: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<u64>,
}

/// Per-session peer registry keyed by signalling uuid.
pub type PeerMap = HashMap<PeerUuid, PeerRecord>;

// ----------------------------------------------------------------------------
// Admission Outcome
// ----------------------------------------------------------------------------

/// Result of processing one sync envelope.
#[derive(Debug, Default)]
pub struct AdmissionOutcome {
    pub replies: Vec<OutboundEnvelope>,
    pub events: Vec<BridgeEvent>,
    /// Ask the session to request a state snapshot from this peer.
    pub request_snapshot: Option<PeerUuid>,
}

// ----------------------------------------------------------------------------
// Handshake Engine
// ----------------------------------------------------------------------------

/// Admission policy and key agreement for one session.
pub struct HandshakeEngine {
    config: SharedSessionConfig,
    keypair: SessionKeyPair,
    capabilities: Vec<String>,
}

impl HandshakeEngine {
    pub fn new(config: SharedSessionConfig, keypair: SessionKeyPair) -> Self {
        Self {
            config,
            keypair,
            capabilities: vec![
                "messaging".to_string(),
                "files".to_string(),
                "state".to_string(),
            ],
        }
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Build the `sync.hello` payload: capabilities, public key, and a join
    /// token (configured verbatim, or freshly minted from the secret).
    pub fn build_hello(&self) -> HelloPayload {
        let token = if let Some(token) = &self.config.join_token {
            Some(token.clone())
        } else {
            self.config.join_token_secret.as_ref().map(|secret| {
                token::mint_token(
                    secret,
                    &self.config.room,
                    &self.config.stream_id,
                    self.config.token_ttl_secs,
                )
            })
        };

        HelloPayload {
            capabilities: self.capabilities.clone(),
            public_key: Some(self.keypair.public_key_spki_base64()),
            token,
            label: self.config.label.clone(),
        }
    }

    /// Process an inbound `sync.hello` or `sync.hello_ack`.
    pub fn process_hello(
        &self,
        peers: &mut PeerMap,
        from: &PeerUuid,
        envelope: &Envelope,
    ) -> AdmissionOutcome {
        let mut outcome = AdmissionOutcome::default();
        let is_ack = envelope.kind == EnvelopeKind::SyncHelloAck;
        let hello: HelloPayload = match envelope.payload_as() {
            Ok(hello) => hello,
            Err(err) => {
                tracing::debug!(peer = %from, error = %err, "dropping malformed hello");
                return outcome;
            }
        };
        let stream_id = envelope.from_stream_id.clone();

        let record = peers
            .entry(from.clone())
            .or_insert_with(|| PeerRecord::discovered(from.clone(), Some(stream_id.clone())));
        record.stream_id = Some(stream_id.clone());
        record.touch();

        // 1. Allowlist gate.
        let allowlist = &self.config.allow_peer_stream_ids;
        if !allowlist.is_empty() && !allowlist.contains(&stream_id) {
            record.handshake_state = HandshakeState::Rejected;
            record.auth_ok = false;
            record.rejected_reason = Some(REASON_NOT_ALLOWED.to_string());
            outcome.replies.push(OutboundEnvelope {
                to: from.clone(),
                kind: EnvelopeKind::SyncReject,
                payload: serde_json::to_value(RejectPayload {
                    reason: REASON_NOT_ALLOWED.to_string(),
                })
                .expect("reject payload serializes"),
            });
            outcome.events.push(BridgeEvent::SyncPeerRejected {
                uuid: from.clone(),
                stream_id: Some(stream_id),
                reason: REASON_NOT_ALLOWED.to_string(),
            });
            return outcome;
        }

        // 2. Join-token validation.
        let mut auth_ok = false;
        if self.config.token_verification_active() {
            let verdict = match (&self.config.join_token_secret, &hello.token) {
                (Some(secret), Some(token)) => {
                    token::verify_token(secret, token, &self.config.room, Some(&stream_id))
                        .map(Some)
                        .map_err(|e| e.to_string())
                }
                (Some(_), None) => Err("no token presented".to_string()),
                // Enforcement without a local secret can only check presence.
                (None, Some(_)) => Ok(None),
                (None, None) => Err("no token presented".to_string()),
            };
            match verdict {
                Ok(payload) => {
                    auth_ok = payload.is_some();
                    record.token_payload = payload;
                }
                Err(reason) => {
                    if self.config.enforce_join_token {
                        record.handshake_state = HandshakeState::Rejected;
                        record.auth_ok = false;
                        record.rejected_reason = Some(REASON_BAD_TOKEN.to_string());
                        outcome.replies.push(OutboundEnvelope {
                            to: from.clone(),
                            kind: EnvelopeKind::SyncReject,
                            payload: serde_json::to_value(RejectPayload {
                                reason: REASON_BAD_TOKEN.to_string(),
                            })
                            .expect("reject payload serializes"),
                        });
                        outcome.events.push(BridgeEvent::SyncPeerRejected {
                            uuid: from.clone(),
                            stream_id: Some(stream_id),
                            reason: format!("{REASON_BAD_TOKEN}: {reason}"),
                        });
                        return outcome;
                    }
                    tracing::debug!(peer = %from, %reason, "token invalid, admitting unauthenticated");
                }
            }
        }

        // 3. Capabilities and key agreement.
        record.capabilities = hello.capabilities.clone();
        if let Some(encoded) = &hello.public_key {
            match public_key_from_spki_base64(encoded) {
                Ok(remote_pub) => {
                    record.shared_key = Some(self.keypair.derive_shared_key(&remote_pub));
                }
                Err(err) => {
                    tracing::debug!(peer = %from, error = %err, "ignoring undecodable public key");
                }
            }
        }

        record.auth_ok = auth_ok;
        record.rejected_reason = None;
        record.handshake_state = if is_ack {
            HandshakeState::Ready
        } else {
            HandshakeState::HelloReceived
        };

        // 4. Answer a hello with a hello_ack (the session MACs it once the
        //    shared key is in the record).
        if !is_ack {
            outcome.replies.push(OutboundEnvelope {
                to: from.clone(),
                kind: EnvelopeKind::SyncHelloAck,
                payload: serde_json::to_value(self.build_hello())
                    .expect("hello payload serializes"),
            });
            record.handshake_state = HandshakeState::Ready;
        }

        // 5. Surface the update and pull the peer's state snapshot.
        outcome.events.push(BridgeEvent::SyncPeerUpdated {
            uuid: from.clone(),
            stream_id: record.stream_id.clone(),
            handshake_state: record.handshake_state.as_str().to_string(),
            auth_ok: record.auth_ok,
        });
        outcome.request_snapshot = Some(from.clone());
        outcome
    }

    /// Process an inbound `sync.reject` aimed at us.
    pub fn process_reject(
        &self,
        peers: &mut PeerMap,
        from: &PeerUuid,
        envelope: &Envelope,
    ) -> AdmissionOutcome {
        let mut outcome = AdmissionOutcome::default();
        let reason = envelope
            .payload_as::<RejectPayload>()
            .map(|p| p.reason)
            .unwrap_or_else(|_| "rejected".to_string());
        if let Some(record) = peers.get_mut(from) {
            record.touch();
            outcome.events.push(BridgeEvent::SyncPeerRejected {
                uuid: from.clone(),
                stream_id: record.stream_id.clone(),
                reason,
            });
        }
        outcome
    }

    /// Record a `sync.heartbeat` arrival.
    pub fn process_heartbeat(&self, peers: &mut PeerMap, from: &PeerUuid, envelope: &Envelope) {
        if let Some(record) = peers.get_mut(from) {
            record.stream_id.get_or_insert(envelope.from_stream_id.clone());
            record.last_heartbeat = Some(Timestamp::now());
            record.touch();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
