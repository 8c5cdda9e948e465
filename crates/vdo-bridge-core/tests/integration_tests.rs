//! End-to-end scenarios over the in-process harness
//!
//! Every test runs real sessions against the deterministic signalling hub:
//! no sockets, no sleep-based synchronization beyond bounded polling.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use std::future::Future;
use std::time::Duration;

use vdo_bridge_core::envelope::{Envelope, EnvelopeKind};
use vdo_bridge_core::peer::HandshakeState;
use vdo_bridge_core::session::BridgeSession;
use vdo_bridge_core::transport::{transport_event_channel, DataPayload, PeerTransport};
use vdo_bridge_core::types::StreamId;
use vdo_bridge_core::{BridgeEvent, SessionConfig};
use vdo_bridge_harness::{start_session, FakeTransport, SignalHub};

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn test_config(room: &str, stream: &str) -> SessionConfig {
    let mut config = SessionConfig::testing(room, stream);
    // Keep heartbeat chatter out of short scenario windows.
    config.heartbeat_ms = 60_000;
    config.file_ack_timeout_ms = 100;
    config.file_max_retries = 2;
    config
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_ready_peer(session: &BridgeSession, stream: &str) {
    let stream = StreamId::new(stream);
    wait_until(&format!("peer {} ready", stream), || async {
        session.peer_summaries().await.iter().any(|p| {
            p.stream_id.as_ref() == Some(&stream)
                && p.handshake_state == HandshakeState::Ready
                && p.shared_key_ready
        })
    })
    .await;
}

async fn connected_pair(hub: &SignalHub, room: &str) -> (BridgeSession, BridgeSession) {
    let a = start_session(hub, "a", test_config(room, "agent_a"))
        .await
        .unwrap();
    let mut config_b = test_config(room, "agent_b");
    config_b.target_stream_id = Some(StreamId::new("agent_a"));
    let b = start_session(hub, "b", config_b).await.unwrap();
    wait_for_ready_peer(&a, "agent_b").await;
    wait_for_ready_peer(&b, "agent_a").await;
    (a, b)
}

// ----------------------------------------------------------------------------
// Scenario 1: message echo
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_message_echo() {
    let hub = SignalHub::new();
    let (a, b) = connected_pair(&hub, "room-echo").await;

    let (ok, used) = a
        .send(
            json!({"type": "demo.message", "id": "m1", "text": "hi"}),
            Some(&json!("agent_b")),
        )
        .await
        .unwrap();
    assert!(ok);
    assert!(used.is_some());

    let mut seen = false;
    for _ in 0..50 {
        for event in b.poll_events(100, 200).await {
            if let BridgeEvent::DataReceived {
                data: Some(data), ..
            } = &event.event
            {
                if data["id"] == "m1" {
                    assert_eq!(data["type"], "demo.message");
                    assert_eq!(data["text"], "hi");
                    seen = true;
                }
            }
        }
        if seen {
            break;
        }
    }
    assert!(seen, "b never observed the echoed message");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ----------------------------------------------------------------------------
// Scenario 2: small file
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_small_file_transfer() {
    let hub = SignalHub::new();
    let (a, b) = connected_pair(&hub, "room-file").await;

    let payload = b"hello file transfer".to_vec();
    let summary = a
        .send_file_bytes(
            payload.clone(),
            Some(&json!("agent_b")),
            Some("hello.txt".into()),
            Some("text/plain".into()),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(summary.status, "completed");
    assert_eq!(summary.total_bytes, 19);

    let incoming = b.file_transfers("incoming").await.unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].status, "completed");
    assert_eq!(incoming[0].name.as_deref(), Some("hello.txt"));
    assert_eq!(incoming[0].mime.as_deref(), Some("text/plain"));

    let received = b.read_received_file(&incoming[0].transfer_id).await.unwrap();
    assert_eq!(String::from_utf8(received).unwrap(), "hello file transfer");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ----------------------------------------------------------------------------
// Scenario 3: spooled large file
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_spooled_large_file() {
    let hub = SignalHub::new();
    let spool_dir = tempfile::tempdir().unwrap();

    let a = start_session(&hub, "a", test_config("room-spool", "agent_a"))
        .await
        .unwrap();
    let mut config_b = test_config("room-spool", "agent_b");
    config_b.spool_threshold_bytes = 1024;
    config_b.keep_spool_files = true;
    config_b.spool_dir = Some(spool_dir.path().to_path_buf());
    let b = start_session(&hub, "b", config_b).await.unwrap();
    wait_for_ready_peer(&a, "agent_b").await;
    wait_for_ready_peer(&b, "agent_a").await;

    let payload: Vec<u8> = b"spool-data-".repeat(4000);
    assert_eq!(payload.len(), 44_000);
    let summary = a
        .send_file_bytes(
            payload.clone(),
            Some(&json!("agent_b")),
            Some("spool.bin".into()),
            None,
            Some(2048),
            None,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(summary.status, "completed");

    let incoming = b.file_transfers("incoming").await.unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].spooled, Some(true));
    let spool_path = incoming[0].spool_path.as_ref().unwrap();
    assert!(spool_path.starts_with(&spool_dir.path().to_string_lossy().into_owned()));

    let out = spool_dir.path().join("saved-copy.bin");
    let written = b
        .save_received_file(&incoming[0].transfer_id, &out, false)
        .await
        .unwrap();
    assert_eq!(written, 44_000);
    assert_eq!(std::fs::read(&out).unwrap(), payload);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    // keep_spool_files: the spool survives session stop.
    assert!(std::path::Path::new(spool_path).exists());
}

// ----------------------------------------------------------------------------
// Scenario 4: corruption retry
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_corrupted_chunk_retry() {
    let hub = SignalHub::new();
    let (a, b) = connected_pair(&hub, "room-corrupt").await;
    hub.corrupt_chunk_once("agent_a", "agent_b", 1);

    let payload: Vec<u8> = (0u8..=255).cycle().take(5 * 64).collect();
    let summary = a
        .send_file_bytes(
            payload.clone(),
            Some(&json!("agent_b")),
            None,
            None,
            Some(64),
            None,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(summary.status, "completed");
    assert!(summary.retries_total >= 1, "expected at least one retry");

    let incoming = b.file_transfers("incoming").await.unwrap();
    let received = b.read_received_file(&incoming[0].transfer_id).await.unwrap();
    assert_eq!(received, payload);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ----------------------------------------------------------------------------
// Scenario 5: resume after dropped ACKs
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_resume_after_dropped_acks() {
    let hub = SignalHub::new();
    let (a, b) = connected_pair(&hub, "room-resume").await;

    // ACKs from b back to a vanish: the first attempt must fail.
    let fault = hub.drop_acks("agent_b", "agent_a");
    let payload: Vec<u8> = b"resume-payload-".repeat(40);
    let err = a
        .send_file_bytes(
            payload.clone(),
            Some(&json!("agent_b")),
            None,
            None,
            Some(64),
            None,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("retries") || err.to_string().contains("Timed out"));

    let outgoing = a.file_transfers("outgoing").await.unwrap();
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].status, "failed");
    let transfer_id = outgoing[0].transfer_id.clone();

    // Clear the fault; resume completes and the payload matches.
    fault.store(false, std::sync::atomic::Ordering::SeqCst);
    let summary = a.resume_file(&transfer_id, None).await.unwrap();
    assert_eq!(summary.status, "completed");

    let incoming = b.file_transfers("incoming").await.unwrap();
    let received = b.read_received_file(&incoming[0].transfer_id).await.unwrap();
    assert_eq!(received, payload);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ----------------------------------------------------------------------------
// Scenario 6: CRDT convergence across three agents
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_state_convergence() {
    let hub = SignalHub::new();
    let a = start_session(&hub, "a", test_config("room-state", "agent_a"))
        .await
        .unwrap();
    let b = start_session(&hub, "b", test_config("room-state", "agent_b"))
        .await
        .unwrap();
    let c = start_session(&hub, "c", test_config("room-state", "agent_c"))
        .await
        .unwrap();
    wait_for_ready_peer(&a, "agent_b").await;
    wait_for_ready_peer(&a, "agent_c").await;
    wait_for_ready_peer(&b, "agent_a").await;
    wait_for_ready_peer(&c, "agent_a").await;

    a.state_set("mission", json!("alpha")).await.unwrap();
    for session in [&b, &c] {
        wait_until("mission=alpha replicated", || async {
            session.state_get(Some("mission"), false).await["value"] == json!("alpha")
        })
        .await;
    }

    // agent_b's overwrite carries a later clock and wins everywhere.
    b.state_set("mission", json!("bravo")).await.unwrap();
    wait_until("mission=bravo on a", || async {
        a.state_get(Some("mission"), false).await["value"] == json!("bravo")
    })
    .await;

    // A full snapshot push from a must leave c on the winning value.
    a.state_sync("send").await.unwrap();
    wait_until("mission=bravo on c", || async {
        c.state_get(Some("mission"), false).await["value"] == json!("bravo")
    })
    .await;

    for session in [a, b, c] {
        session.stop().await.unwrap();
    }
}

// ----------------------------------------------------------------------------
// Scenario 7: allowlist and join tokens
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_allowlist_and_tokens() {
    let hub = SignalHub::new();

    let mut config_a = test_config("room-secure", "secure_a");
    config_a.allow_peer_stream_ids = vec![StreamId::new("secure_b")];
    config_a.join_token_secret = Some("s3cret".into());
    let a = start_session(&hub, "a", config_a).await.unwrap();

    let mut config_b = test_config("room-secure", "secure_b");
    config_b.join_token_secret = Some("s3cret".into());
    let b = start_session(&hub, "b", config_b).await.unwrap();

    let mut config_x = test_config("room-secure", "intruder");
    config_x.join_token_secret = Some("s3cret".into());
    let intruder = start_session(&hub, "x", config_x).await.unwrap();

    wait_until("a classified both peers", || async {
        let peers = a.peer_summaries().await;
        let b_ok = peers.iter().any(|p| {
            p.stream_id.as_ref() == Some(&StreamId::new("secure_b"))
                && p.handshake_state == HandshakeState::Ready
                && p.auth_ok
        });
        let x_rejected = peers.iter().any(|p| {
            p.stream_id.as_ref() == Some(&StreamId::new("intruder"))
                && p.handshake_state == HandshakeState::Rejected
        });
        b_ok && x_rejected
    })
    .await;

    let peers = a.peer_summaries().await;
    let rejected = peers
        .iter()
        .find(|p| p.stream_id.as_ref() == Some(&StreamId::new("intruder")))
        .unwrap();
    assert_eq!(rejected.rejected_reason.as_deref(), Some("peer not on allowlist"));

    for session in [a, b, intruder] {
        session.stop().await.unwrap();
    }
}

// ----------------------------------------------------------------------------
// Reconnect
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_reconnect_after_signalling_drop() {
    let hub = SignalHub::new();
    let (a, b) = connected_pair(&hub, "room-reconnect").await;

    hub.kick("agent_a").await;
    wait_until("a reconnected and handshook b again", || async {
        let status = a.status().await;
        status["status"] == "connected"
            && status["reconnect_count"].as_u64().unwrap_or(0) >= 1
            && a.peer_summaries().await.iter().any(|p| {
                p.stream_id.as_ref() == Some(&StreamId::new("agent_b"))
                    && p.handshake_state == HandshakeState::Ready
            })
    })
    .await;

    // Data still flows after the rebuild.
    let (ok, _) = a
        .send(json!({"type": "demo.after", "id": "m2"}), Some(&json!("agent_b")))
        .await
        .unwrap();
    assert!(ok);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ----------------------------------------------------------------------------
// Session MAC enforcement
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_unmacced_envelope_dropped_when_required() {
    let hub = SignalHub::new();
    let mut config_b = test_config("room-mac", "agent_b");
    config_b.require_session_mac = true;
    let b = start_session(&hub, "b", config_b).await.unwrap();

    // A bare transport (no bridge session, no handshake) injects an
    // unauthenticated state patch.
    let raw = FakeTransport::new(hub.clone());
    let (sender, mut receiver) = transport_event_channel();
    raw.attach_events(sender);
    raw.connect().await.unwrap();
    raw.join_room("room-mac", None).await.unwrap();
    raw.announce(&StreamId::new("forger"), None).await.unwrap();
    tokio::spawn(async move { while receiver.recv().await.is_some() {} });

    wait_until("b sees the forger", || async {
        b.peer_summaries().await.iter().any(|p| p.connected)
    })
    .await;

    let envelope = Envelope::new(
        EnvelopeKind::StatePatch,
        "room-mac",
        &StreamId::new("forger"),
        json!({"key": "owned", "value": true, "actor": "forger", "clock": 9, "updated_at": 0}),
    );
    raw.send_data(&DataPayload::Structured(envelope.to_value()), None)
        .await
        .unwrap();

    wait_until("b flagged the forged envelope", || async {
        b.poll_events(100, 50).await.iter().any(|e| {
            matches!(e.event, BridgeEvent::ProtocolAuthFailed { .. })
        })
    })
    .await;
    assert_eq!(
        b.state_get(Some("owned"), false).await["value"],
        serde_json::Value::Null
    );

    b.stop().await.unwrap();
}

// ----------------------------------------------------------------------------
// Spool cleanup on stop
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_spool_removed_on_stop() {
    let hub = SignalHub::new();
    let spool_dir = tempfile::tempdir().unwrap();

    let a = start_session(&hub, "a", test_config("room-clean", "agent_a"))
        .await
        .unwrap();
    let mut config_b = test_config("room-clean", "agent_b");
    config_b.spool_threshold_bytes = 16;
    config_b.spool_dir = Some(spool_dir.path().to_path_buf());
    let b = start_session(&hub, "b", config_b).await.unwrap();
    wait_for_ready_peer(&a, "agent_b").await;
    wait_for_ready_peer(&b, "agent_a").await;

    let payload = vec![7u8; 4096];
    a.send_file_bytes(
        payload,
        Some(&json!("agent_b")),
        None,
        None,
        Some(512),
        None,
        None,
        None,
    )
    .await
    .unwrap();

    let incoming = b.file_transfers("incoming").await.unwrap();
    let spool_path = incoming[0].spool_path.clone().unwrap();
    assert!(std::path::Path::new(&spool_path).exists());

    b.stop().await.unwrap();
    assert!(
        !std::path::Path::new(&spool_path).exists(),
        "spool file must be removed on stop"
    );
    a.stop().await.unwrap();
}

// ----------------------------------------------------------------------------
// Binary payloads surface as base64
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_binary_data_surfaces_base64() {
    let hub = SignalHub::new();
    let (a, b) = connected_pair(&hub, "room-binary").await;

    // Raw bytes injected at the transport level on a's side.
    let bytes = vec![0u8, 159, 146, 150];
    let transport = FakeTransport::new(hub.clone());
    let (sender, mut receiver) = transport_event_channel();
    transport.attach_events(sender);
    transport.connect().await.unwrap();
    transport.join_room("room-binary", None).await.unwrap();
    transport
        .announce(&StreamId::new("binary_peer"), None)
        .await
        .unwrap();
    tokio::spawn(async move { while receiver.recv().await.is_some() {} });
    transport
        .send_data(&DataPayload::Binary(bytes.clone()), None)
        .await
        .unwrap();

    let expected = BASE64.encode(&bytes);
    wait_until("binary payload surfaced", || async {
        b.poll_events(100, 50).await.iter().any(|e| {
            matches!(
                &e.event,
                BridgeEvent::DataReceived {
                    data_base64: Some(encoded),
                    ..
                } if encoded == &expected
            )
        })
    })
    .await;

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
