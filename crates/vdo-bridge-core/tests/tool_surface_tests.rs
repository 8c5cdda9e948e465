//! Tool-surface contract tests over the in-process harness
//!
//! Drives two agents purely through `ToolSurface::dispatch`, the same path
//! an MCP host uses.

use serde_json::json;
use std::time::Duration;

use vdo_bridge_core::tools::{ToolErrorKind, ToolSurface};
use vdo_bridge_harness::{fake_transport_factory, SignalHub};

async fn connect(surface: &ToolSurface, room: &str, stream: &str) -> String {
    let result = surface
        .dispatch(
            "connect",
            &json!({
                "room": room,
                "stream_id": stream,
                "heartbeat_ms": 60_000u64,
                "file_ack_timeout_ms": 200u64,
            }),
        )
        .await
        .unwrap();
    result["session_id"].as_str().unwrap().to_string()
}

async fn wait_for_peer(surface: &ToolSurface, session_id: &str, stream: &str) {
    for _ in 0..500 {
        let peers = surface
            .dispatch("sync_peers", &json!({ "session_id": session_id }))
            .await
            .unwrap();
        let ready = peers["peers"].as_array().unwrap().iter().any(|p| {
            p["stream_id"] == json!(stream) && p["handshake_state"] == json!("ready")
        });
        if ready {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer {stream} never became ready on {session_id}");
}

#[tokio::test]
async fn test_connect_send_receive_roundtrip() {
    let hub = SignalHub::new();
    let surface_a = ToolSurface::new(fake_transport_factory(&hub));
    let surface_b = ToolSurface::new(fake_transport_factory(&hub));

    let sess_a = connect(&surface_a, "tools-room", "agent_a").await;
    let sess_b = connect(&surface_b, "tools-room", "agent_b").await;
    wait_for_peer(&surface_a, &sess_a, "agent_b").await;
    wait_for_peer(&surface_b, &sess_b, "agent_a").await;

    let sent = surface_a
        .dispatch(
            "send",
            &json!({
                "session_id": sess_a,
                "data": {"type": "demo.message", "id": "m1", "text": "hi"},
                "target": "agent_b",
            }),
        )
        .await
        .unwrap();
    assert_eq!(sent["ok"], json!(true));

    let mut found = false;
    for _ in 0..50 {
        let received = surface_b
            .dispatch(
                "receive",
                &json!({ "session_id": sess_b, "max_events": 50, "wait_ms": 200 }),
            )
            .await
            .unwrap();
        for event in received["events"].as_array().unwrap() {
            if event["type"] == json!("data_received") && event["data"]["id"] == json!("m1") {
                found = true;
            }
        }
        if found {
            break;
        }
    }
    assert!(found);

    // Status includes a live peer list.
    let status = surface_a
        .dispatch("status", &json!({ "session_id": sess_a }))
        .await
        .unwrap();
    assert_eq!(status["status"], json!("connected"));
    assert_eq!(status["peers"].as_array().unwrap().len(), 1);

    surface_a
        .dispatch("disconnect", &json!({ "session_id": sess_a }))
        .await
        .unwrap();
    surface_b
        .dispatch("disconnect", &json!({ "session_id": sess_b }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_file_send_receive_base64_roundtrip() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let hub = SignalHub::new();
    let surface_a = ToolSurface::new(fake_transport_factory(&hub));
    let surface_b = ToolSurface::new(fake_transport_factory(&hub));
    let sess_a = connect(&surface_a, "tools-file", "agent_a").await;
    let sess_b = connect(&surface_b, "tools-file", "agent_b").await;
    wait_for_peer(&surface_a, &sess_a, "agent_b").await;
    wait_for_peer(&surface_b, &sess_b, "agent_a").await;

    let payload: Vec<u8> = (0u8..=255).collect();
    let summary = surface_a
        .dispatch(
            "file_send",
            &json!({
                "session_id": sess_a,
                "data_base64": BASE64.encode(&payload),
                "name": "bytes.bin",
                "target": "agent_b",
                "chunk_bytes": 64u64,
            }),
        )
        .await
        .unwrap();
    assert_eq!(summary["status"], json!("completed"));
    assert_eq!(summary["total_chunks"], json!(4));

    let transfers = surface_b
        .dispatch(
            "file_transfers",
            &json!({ "session_id": sess_b, "direction": "incoming" }),
        )
        .await
        .unwrap();
    assert_eq!(transfers["transfer_count"], json!(1));
    let transfer_id = transfers["transfers"][0]["transfer_id"].as_str().unwrap();

    let received = surface_b
        .dispatch(
            "file_receive",
            &json!({
                "session_id": sess_b,
                "transfer_id": transfer_id,
                "encoding": "base64",
            }),
        )
        .await
        .unwrap();
    assert_eq!(received["data_base64"], json!(BASE64.encode(&payload)));

    surface_a
        .dispatch("disconnect", &json!({ "session_id": sess_a }))
        .await
        .unwrap();
    surface_b
        .dispatch("disconnect", &json!({ "session_id": sess_b }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_state_tools_roundtrip() {
    let hub = SignalHub::new();
    let surface = ToolSurface::new(fake_transport_factory(&hub));
    let sess_a = connect(&surface, "tools-state", "agent_a").await;
    let sess_b = connect(&surface, "tools-state", "agent_b").await;
    wait_for_peer(&surface, &sess_a, "agent_b").await;

    let set = surface
        .dispatch(
            "state_set",
            &json!({ "session_id": sess_a, "key": "mission", "value": "alpha" }),
        )
        .await
        .unwrap();
    assert_eq!(set["clock"], json!(1));

    let got = surface
        .dispatch(
            "state_get",
            &json!({ "session_id": sess_a, "key": "mission" }),
        )
        .await
        .unwrap();
    assert_eq!(got["value"], json!("alpha"));

    for _ in 0..500 {
        let got = surface
            .dispatch(
                "state_get",
                &json!({ "session_id": sess_b, "key": "mission" }),
            )
            .await
            .unwrap();
        if got["value"] == json!("alpha") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let meta = surface
        .dispatch(
            "state_get",
            &json!({ "session_id": sess_b, "include_meta": true }),
        )
        .await
        .unwrap();
    assert!(meta["entries"].as_array().unwrap().len() <= 1);

    surface.shutdown().await;
}

#[tokio::test]
async fn test_validation_errors() {
    let hub = SignalHub::new();
    let surface = ToolSurface::new(fake_transport_factory(&hub));

    // Unknown tool.
    let err = surface.dispatch("vdo_nonsense", &json!({})).await.unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Validation);

    // Unknown session.
    let err = surface
        .dispatch("status", &json!({ "session_id": "sess-missing" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Validation);

    // Bad config on connect.
    let err = surface
        .dispatch("connect", &json!({ "room": "r" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Validation);

    // Unsupported config field is rejected, not silently dropped.
    let err = surface
        .dispatch(
            "connect",
            &json!({ "room": "r", "stream_id": "a", "bogus": 1 }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Validation);

    // file_send needs exactly one payload source.
    let sess = connect(&surface, "tools-validate", "agent_a").await;
    let err = surface
        .dispatch(
            "file_send",
            &json!({
                "session_id": sess,
                "data_base64": "aGk=",
                "file_path": "/tmp/x",
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Validation);

    // Unknown transfer id.
    let err = surface
        .dispatch(
            "file_receive",
            &json!({ "session_id": sess, "transfer_id": "missing" }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Validation);

    surface.shutdown().await;
}
