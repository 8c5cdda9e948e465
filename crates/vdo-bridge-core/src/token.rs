//! Join tokens
//!
//! A join token is a signed blob proving admission rights to a room/stream:
//! `base64url(payload) "." base64url(HMAC-SHA256(secret, base64url(payload)))`
//! where the payload is the JSON object `{room, stream_id, exp, nonce}`.
//! Verification recomputes the HMAC with a constant-time compare before
//! parsing the payload.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, hmac_sha256};
use crate::errors::{ProtocolError, Result};
use crate::types::{StreamId, Timestamp};

// ----------------------------------------------------------------------------
// Token Payload
// ----------------------------------------------------------------------------

/// Claims carried inside a join token.
///
/// Field order matters: minting serializes the struct directly, so the
/// payload keys appear as `{room, stream_id, exp, nonce}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub room: String,
    pub stream_id: StreamId,
    /// Expiry as milliseconds since the Unix epoch.
    pub exp: u64,
    pub nonce: String,
}

// ----------------------------------------------------------------------------
// Mint / Verify
// ----------------------------------------------------------------------------

/// Mint a join token for `room`/`stream_id` valid for `ttl_secs`.
pub fn mint_token(secret: &str, room: &str, stream_id: &StreamId, ttl_secs: u64) -> String {
    let payload = TokenPayload {
        room: room.to_string(),
        stream_id: stream_id.clone(),
        exp: (Timestamp::now() + ttl_secs * 1_000).as_millis(),
        nonce: uuid::Uuid::new_v4().to_string(),
    };
    let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).expect("payload serializes"));
    let sig = URL_SAFE_NO_PAD.encode(hmac_sha256(secret.as_bytes(), body.as_bytes()));
    format!("{body}.{sig}")
}

/// Verify a join token against the shared secret and the expected room.
///
/// `expected_stream` is checked only when the token carries a stream id
/// (tokens minted without one admit any stream).
pub fn verify_token(
    secret: &str,
    token: &str,
    expected_room: &str,
    expected_stream: Option<&StreamId>,
) -> Result<TokenPayload> {
    let (body, sig) = token.split_once('.').ok_or_else(|| invalid("not a signed token"))?;

    let presented = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|_| invalid("signature is not base64url"))?;
    let expected = hmac_sha256(secret.as_bytes(), body.as_bytes());
    if !constant_time_eq(&presented, &expected) {
        return Err(invalid("signature mismatch").into());
    }

    let raw = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|_| invalid("payload is not base64url"))?;
    let payload: TokenPayload =
        serde_json::from_slice(&raw).map_err(|_| invalid("payload is not valid JSON"))?;

    if payload.room != expected_room {
        return Err(invalid("room mismatch").into());
    }
    if let Some(stream) = expected_stream {
        if !payload.stream_id.is_empty() && &payload.stream_id != stream {
            return Err(invalid("stream id mismatch").into());
        }
    }
    if payload.exp <= Timestamp::now().as_millis() {
        return Err(ProtocolError::TokenExpired.into());
    }

    Ok(payload)
}

fn invalid(reason: &str) -> ProtocolError {
    ProtocolError::TokenInvalid {
        reason: reason.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_verify_roundtrip() {
        let stream = StreamId::new("agent_a");
        let token = mint_token("s3cret", "room1", &stream, 60);
        let payload = verify_token("s3cret", &token, "room1", Some(&stream)).unwrap();
        assert_eq!(payload.room, "room1");
        assert_eq!(payload.stream_id, stream);
        assert!(payload.exp > Timestamp::now().as_millis());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let stream = StreamId::new("agent_a");
        let token = mint_token("s3cret", "room1", &stream, 60);
        assert!(verify_token("other", &token, "room1", Some(&stream)).is_err());
    }

    #[test]
    fn test_room_and_stream_binding() {
        let stream = StreamId::new("agent_a");
        let token = mint_token("s3cret", "room1", &stream, 60);
        assert!(verify_token("s3cret", &token, "room2", Some(&stream)).is_err());
        assert!(verify_token("s3cret", &token, "room1", Some(&StreamId::new("intruder"))).is_err());
        // A verifier that does not pin a stream accepts any token stream.
        assert!(verify_token("s3cret", &token, "room1", None).is_ok());
    }

    #[test]
    fn test_expired_token() {
        let stream = StreamId::new("agent_a");
        let token = mint_token("s3cret", "room1", &stream, 0);
        let err = verify_token("s3cret", &token, "room1", Some(&stream)).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_garbage_tokens_rejected() {
        let stream = StreamId::new("agent_a");
        for bad in ["", "nodot", "a.b", "!!.!!"] {
            assert!(verify_token("s3cret", bad, "room1", Some(&stream)).is_err());
        }
    }

    #[test]
    fn test_tampered_body_rejected() {
        let stream = StreamId::new("agent_a");
        let token = mint_token("s3cret", "room1", &stream, 60);
        let (body, sig) = token.split_once('.').unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(body).unwrap();
        raw[0] ^= 0x01;
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(raw), sig);
        assert!(verify_token("s3cret", &forged, "room1", Some(&stream)).is_err());
    }
}
