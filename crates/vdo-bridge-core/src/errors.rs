//! Error types for the bridge engine
//!
//! Specific error enums for each subsystem, unified under [`BridgeError`].
//! The tool surface classifies every failure as either a validation error
//! (bad input, unknown ids) or a tool error (everything else); the
//! [`BridgeError::is_validation`] helper drives that split.

use crate::types::{PeerUuid, StreamId, TransferId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Transport and signalling failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Signalling connect failed: {reason}")]
    ConnectFailed { reason: String },
    #[error("Transport send failed: {reason}")]
    SendFailed { reason: String },
    #[error("No open data channel to peer {peer}")]
    NoOpenChannel { peer: PeerUuid },
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Transport shut down: {reason}")]
    Shutdown { reason: String },
}

/// Handshake, token, and envelope authentication failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Join token invalid: {reason}")]
    TokenInvalid { reason: String },
    #[error("Join token expired")]
    TokenExpired,
    #[error("Peer stream id {stream_id} not on allowlist")]
    PeerNotAllowed { stream_id: StreamId },
    #[error("Envelope MAC verification failed for peer {peer}")]
    MacMismatch { peer: PeerUuid },
    #[error("Envelope missing required MAC from peer {peer}")]
    MacMissing { peer: PeerUuid },
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    #[error("No shared key established with peer {peer}")]
    NoSharedKey { peer: PeerUuid },
}

/// File transfer protocol failures.
#[derive(Debug, thiserror::Error)]
pub enum FileTransferError {
    #[error("Unknown transfer {transfer_id}")]
    UnknownTransfer { transfer_id: TransferId },
    #[error("Transfer {transfer_id} is {status}, expected {expected}")]
    WrongStatus {
        transfer_id: TransferId,
        status: String,
        expected: String,
    },
    #[error("Payload is empty")]
    EmptyPayload,
    #[error("Payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: u64, max: u64 },
    #[error("Chunk sequence {seq} out of range (total {total})")]
    SeqOutOfRange { seq: u64, total: u64 },
    #[error("Chunk {seq} hash mismatch")]
    ChunkHashMismatch { seq: u64 },
    #[error("File hash mismatch after reassembly")]
    FileHashMismatch,
    #[error("Timed out waiting for {what} after {timeout_ms}ms")]
    AckTimeout { what: String, timeout_ms: u64 },
    #[error("Transfer {transfer_id} failed after {retries} retries: {reason}")]
    RetriesExhausted {
        transfer_id: TransferId,
        retries: u32,
        reason: String,
    },
    #[error("Spool I/O error: {0}")]
    Spool(#[from] std::io::Error),
}

/// Replicated state store failures.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state_key_limit_reached: at most {max} keys")]
    KeyLimitReached { max: usize },
    #[error("State key must be a non-empty string")]
    EmptyKey,
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Top-level error type for the bridge engine.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("File transfer error: {0}")]
    FileTransfer(#[from] FileTransferError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Unknown session {session_id}")]
    UnknownSession { session_id: String },

    #[error("Ambiguous target: {connected} peers connected, pass an explicit target")]
    AmbiguousTarget { connected: usize },

    #[error("Session is {state}: {reason}")]
    SessionState { state: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create an invalid-input error with a message.
    pub fn invalid_input<T: Into<String>>(reason: T) -> Self {
        BridgeError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason.
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        BridgeError::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether this error should surface as a `validation_error` on the tool
    /// surface rather than a `tool_error`.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidInput { .. }
                | BridgeError::Configuration { .. }
                | BridgeError::UnknownSession { .. }
                | BridgeError::AmbiguousTarget { .. }
                | BridgeError::FileTransfer(FileTransferError::UnknownTransfer { .. })
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(BridgeError::invalid_input("missing field").is_validation());
        assert!(BridgeError::UnknownSession {
            session_id: "s1".into()
        }
        .is_validation());
        assert!(BridgeError::FileTransfer(FileTransferError::UnknownTransfer {
            transfer_id: TransferId::new("t1"),
        })
        .is_validation());
        assert!(!BridgeError::Transport(TransportError::NotConnected).is_validation());
        assert!(!BridgeError::FileTransfer(FileTransferError::FileHashMismatch).is_validation());
    }

    #[test]
    fn test_error_display_carries_context() {
        let err = BridgeError::FileTransfer(FileTransferError::AckTimeout {
            what: "file.accept".into(),
            timeout_ms: 1000,
        });
        let text = err.to_string();
        assert!(text.contains("file.accept"));
        assert!(text.contains("1000"));
    }
}
