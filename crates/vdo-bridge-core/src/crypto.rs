//! Cryptographic primitives for the bridge protocol
//!
//! X25519 key agreement for the per-peer shared key, HMAC-SHA256 session
//! MACs over the canonical envelope form, and SHA-256 content hashing used
//! by the file-transfer engine.

use curve25519_dalek::constants::X25519_BASEPOINT;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use hmac::{Hmac, Mac};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::envelope::Envelope;
use crate::errors::{ProtocolError, Result};
use crate::types::PeerUuid;

type HmacSha256 = Hmac<Sha256>;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// DER/SPKI prefix for an X25519 public key (RFC 8410): a fixed 12-byte
/// header followed by the raw 32-byte key.
const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

// ----------------------------------------------------------------------------
// Session Key Pair (X25519)
// ----------------------------------------------------------------------------

/// X25519 key pair used for the per-peer shared-key agreement.
pub struct SessionKeyPair {
    private_key: [u8; 32],
    public_key: [u8; 32],
}

impl core::fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

impl SessionKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self::generate_with_rng(&mut rng)
    }

    /// Generate a key pair with a custom RNG (deterministic in tests).
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut private_key = [0u8; 32];
        rng.fill_bytes(&mut private_key);
        Self::from_bytes(&private_key)
    }

    /// Create from raw private key bytes.
    pub fn from_bytes(private_key: &[u8; 32]) -> Self {
        let scalar = Scalar::from_bytes_mod_order(*private_key);
        let point = scalar * X25519_BASEPOINT;

        Self {
            private_key: *private_key,
            public_key: point.to_bytes(),
        }
    }

    /// Raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key
    }

    /// Public key as base64 of the DER/SPKI encoding, the form carried in
    /// `sync.hello`.
    pub fn public_key_spki_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let mut der = Vec::with_capacity(X25519_SPKI_PREFIX.len() + 32);
        der.extend_from_slice(&X25519_SPKI_PREFIX);
        der.extend_from_slice(&self.public_key);
        STANDARD.encode(der)
    }

    /// Derive the shared key with a remote public key.
    pub fn derive_shared_key(&self, remote_public: &[u8; 32]) -> [u8; 32] {
        let scalar = Scalar::from_bytes_mod_order(self.private_key);
        let shared = scalar * MontgomeryPoint(*remote_public);
        shared.to_bytes()
    }
}

/// Parse a base64 DER/SPKI X25519 public key back to its raw 32 bytes.
pub fn public_key_from_spki_base64(encoded: &str) -> Result<[u8; 32]> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let der = STANDARD.decode(encoded).map_err(|e| {
        ProtocolError::MalformedEnvelope {
            reason: format!("public key base64: {e}"),
        }
    })?;
    if der.len() != X25519_SPKI_PREFIX.len() + 32 || der[..12] != X25519_SPKI_PREFIX {
        return Err(ProtocolError::MalformedEnvelope {
            reason: "public key is not an X25519 SPKI".into(),
        }
        .into());
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&der[12..]);
    Ok(key)
}

// ----------------------------------------------------------------------------
// HMAC Helpers
// ----------------------------------------------------------------------------

/// HMAC-SHA256 over `data` with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time equality for MAC/token comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

// ----------------------------------------------------------------------------
// Session MAC
// ----------------------------------------------------------------------------

/// Compute the session MAC for an envelope: lowercase hex of HMAC-SHA256
/// over the canonical envelope subset.
pub fn sign_envelope_mac(shared_key: &[u8; 32], envelope: &Envelope) -> String {
    hex::encode(hmac_sha256(shared_key, &envelope.mac_canonical_bytes()))
}

/// Verify an envelope MAC against a peer's shared key.
///
/// Rules: a MAC on the envelope must match the shared key; an absent MAC is
/// rejected only when `require_mac` is set.
pub fn verify_envelope_mac(
    shared_key: Option<&[u8; 32]>,
    envelope: &Envelope,
    require_mac: bool,
    peer: &PeerUuid,
) -> Result<()> {
    match (&envelope.mac, shared_key) {
        (Some(mac), Some(key)) => {
            let expected = sign_envelope_mac(key, envelope);
            if constant_time_eq(mac.as_bytes(), expected.as_bytes()) {
                Ok(())
            } else {
                Err(ProtocolError::MacMismatch { peer: peer.clone() }.into())
            }
        }
        (Some(_), None) => Err(ProtocolError::NoSharedKey { peer: peer.clone() }.into()),
        (None, _) if require_mac => Err(ProtocolError::MacMissing { peer: peer.clone() }.into()),
        (None, _) => Ok(()),
    }
}

// ----------------------------------------------------------------------------
// Content Hashing
// ----------------------------------------------------------------------------

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Incremental SHA-256 for streaming whole-file hashes.
pub struct StreamingHash {
    hasher: Sha256,
}

impl StreamingHash {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for StreamingHash {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::types::StreamId;

    fn envelope() -> Envelope {
        Envelope::new(
            EnvelopeKind::StatePatch,
            "room1",
            &StreamId::new("agent_a"),
            serde_json::json!({"key": "k", "value": 1, "actor": "agent_a", "clock": 1, "updated_at": 0}),
        )
    }

    #[test]
    fn test_shared_key_agreement() {
        let a = SessionKeyPair::from_bytes(&[7u8; 32]);
        let b = SessionKeyPair::from_bytes(&[9u8; 32]);
        let ab = a.derive_shared_key(&b.public_key_bytes());
        let ba = b.derive_shared_key(&a.public_key_bytes());
        assert_eq!(ab, ba);
        assert_ne!(ab, [0u8; 32]);
    }

    #[test]
    fn test_spki_roundtrip() {
        let pair = SessionKeyPair::from_bytes(&[3u8; 32]);
        let encoded = pair.public_key_spki_base64();
        let raw = public_key_from_spki_base64(&encoded).unwrap();
        assert_eq!(raw, pair.public_key_bytes());

        assert!(public_key_from_spki_base64("not base64 %%").is_err());
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        assert!(public_key_from_spki_base64(&STANDARD.encode([0u8; 10])).is_err());
    }

    #[test]
    fn test_mac_sign_and_verify() {
        let key = [42u8; 32];
        let peer = PeerUuid::new("p1");
        let mut env = envelope();
        env.mac = Some(sign_envelope_mac(&key, &env));

        assert!(verify_envelope_mac(Some(&key), &env, true, &peer).is_ok());

        // Wrong key fails.
        let wrong = [1u8; 32];
        assert!(verify_envelope_mac(Some(&wrong), &env, true, &peer).is_err());

        // Tampering with the payload invalidates the MAC.
        let mut tampered = env.clone();
        tampered.payload = serde_json::json!({"key": "k2"});
        assert!(verify_envelope_mac(Some(&key), &tampered, true, &peer).is_err());
    }

    #[test]
    fn test_missing_mac_policy() {
        let peer = PeerUuid::new("p1");
        let env = envelope();
        // Unenforced: absent MAC passes.
        assert!(verify_envelope_mac(None, &env, false, &peer).is_ok());
        assert!(verify_envelope_mac(Some(&[1u8; 32]), &env, false, &peer).is_ok());
        // Enforced: absent MAC is rejected.
        assert!(verify_envelope_mac(Some(&[1u8; 32]), &env, true, &peer).is_err());
    }

    #[test]
    fn test_mac_present_without_shared_key() {
        let peer = PeerUuid::new("p1");
        let mut env = envelope();
        env.mac = Some("00".repeat(32));
        assert!(verify_envelope_mac(None, &env, false, &peer).is_err());
    }

    #[test]
    fn test_streaming_hash_matches_oneshot() {
        let data = b"spool-data-".repeat(100);
        let mut streaming = StreamingHash::new();
        for chunk in data.chunks(17) {
            streaming.update(chunk);
        }
        assert_eq!(streaming.finalize_hex(), sha256_hex(&data));
    }
}
