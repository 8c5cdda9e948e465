//! Bridge session
//!
//! One [`BridgeSession`] per room membership. The session owns its transport,
//! peer map, protocol engines, event queue, and timers. All mutable state
//! sits behind a single async mutex, making the session its own critical
//! section; I/O (sends, spool writes, protocol-bus waits) happens outside
//! the lock so inbound dispatch and the file-transfer sender can interleave
//! without ever mutating concurrently.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::config::{SessionConfig, SharedSessionConfig};
use crate::crypto::{sign_envelope_mac, verify_envelope_mac, SessionKeyPair};
use crate::envelope::{
    Envelope, EnvelopeKind, FileAcceptPayload, FileAckPayload, FileCompletePayload,
    FileNackPayload, FileResumeReqPayload, FileResumeStatePayload, HeartbeatPayload,
    OutboundEnvelope, StatePatchPayload, StateSnapshotReqPayload,
};
use crate::errors::{BridgeError, FileTransferError, Result, TransportError};
use crate::events::{BridgeEvent, EventQueue, ProtocolEvent, ProtocolEventBus, QueuedEvent};
use crate::file_transfer::{
    ChunkSource, FileStepOutcome, FileTransferEngine, OutgoingStatus, TransferSummary,
};
use crate::peer::{AdmissionOutcome, HandshakeEngine, PeerMap, PeerRecord, PeerSummary};
use crate::state::{ApplyOutcome, StateEngine, StateSnapshot};
use crate::transport::{
    transport_event_channel, DataPayload, PeerTransport, TransportEvent, TransportEventReceiver,
    TransportFactory,
};
use crate::types::{PeerUuid, StreamId, Timestamp, TransferId};

/// Size of the protocol-event ring the ACK waiters scan.
const PROTOCOL_BUS_CAP: usize = 1024;

// ----------------------------------------------------------------------------
// Session Status
// ----------------------------------------------------------------------------

/// Lifecycle of a bridge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Starting,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Starting => "starting",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Stopped => "stopped",
        }
    }
}

// ----------------------------------------------------------------------------
// Session State (behind the session mutex)
// ----------------------------------------------------------------------------

struct SessionState {
    status: SessionStatus,
    last_error: Option<String>,
    peers: PeerMap,
    files: FileTransferEngine,
    store: StateEngine,
}

// ----------------------------------------------------------------------------
// Send Target
// ----------------------------------------------------------------------------

/// Parsed form of a `send` target argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTarget {
    pub uuid: Option<PeerUuid>,
    pub stream_id: Option<StreamId>,
    /// Skip the open-channel check and let the transport use any path.
    pub fallback: bool,
}

impl SendTarget {
    /// Parse the tool-level target value: a uuid/stream-id string, an object
    /// with `uuid`/`stream_id`/`fallback`, or null.
    pub fn parse(value: Option<&Value>) -> Result<Option<SendTarget>> {
        let Some(value) = value else { return Ok(None) };
        match value {
            Value::Null => Ok(None),
            Value::String(s) if !s.is_empty() => Ok(Some(SendTarget {
                uuid: Some(PeerUuid::new(s.clone())),
                stream_id: Some(StreamId::new(s.clone())),
                fallback: false,
            })),
            Value::Object(map) => {
                let uuid = map
                    .get("uuid")
                    .and_then(Value::as_str)
                    .map(PeerUuid::new);
                let stream_id = map
                    .get("stream_id")
                    .and_then(Value::as_str)
                    .map(StreamId::new);
                if uuid.is_none() && stream_id.is_none() {
                    return Err(BridgeError::invalid_input(
                        "target object needs a uuid or stream_id",
                    ));
                }
                Ok(Some(SendTarget {
                    uuid,
                    stream_id,
                    fallback: map
                        .get("fallback")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }))
            }
            _ => Err(BridgeError::invalid_input(
                "target must be a string, an object, or null",
            )),
        }
    }
}

/// Resolve a parsed target against the peer map. `None` means "the sole
/// connected peer" and is ambiguous when several are connected.
fn resolve_target(peers: &PeerMap, target: Option<&SendTarget>) -> Result<(PeerUuid, bool)> {
    match target {
        None => {
            let connected: Vec<&PeerRecord> =
                peers.values().filter(|p| p.connected).collect();
            match connected.len() {
                0 => Err(TransportError::NotConnected.into()),
                1 => Ok((connected[0].uuid.clone(), false)),
                n => Err(BridgeError::AmbiguousTarget { connected: n }),
            }
        }
        Some(target) => {
            if let Some(uuid) = &target.uuid {
                if peers.contains_key(uuid) {
                    return Ok((uuid.clone(), target.fallback));
                }
            }
            if let Some(stream_id) = &target.stream_id {
                // A reconnect can leave a stale record under the same stream
                // id; prefer the connected, most recently seen one.
                if let Some(record) = peers
                    .values()
                    .filter(|p| p.stream_id.as_ref() == Some(stream_id))
                    .max_by_key(|p| (p.connected, p.last_seen))
                {
                    return Ok((record.uuid.clone(), target.fallback));
                }
            }
            Err(BridgeError::invalid_input(format!(
                "target {:?} does not match any known peer",
                target
                    .uuid
                    .as_ref()
                    .map(|u| u.as_str())
                    .or(target.stream_id.as_ref().map(|s| s.as_str()))
                    .unwrap_or("<none>")
            )))
        }
    }
}

// ----------------------------------------------------------------------------
// Bridge Session
// ----------------------------------------------------------------------------

struct SessionInner {
    id: String,
    config: SharedSessionConfig,
    factory: Arc<dyn TransportFactory>,
    handshake: HandshakeEngine,
    state: AsyncMutex<SessionState>,
    events: EventQueue,
    bus: ProtocolEventBus,
    transport: std::sync::Mutex<Option<Arc<dyn PeerTransport>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    reconnect_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    reconnect_count: AtomicU32,
    stopped: AtomicBool,
    started_at: Timestamp,
}

/// Cloneable handle to one bridge session.
#[derive(Clone)]
pub struct BridgeSession {
    inner: Arc<SessionInner>,
}

impl BridgeSession {
    /// Create a session in the `idle` state.
    pub fn new(
        id: String,
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| BridgeError::Configuration { reason })?;
        let config: SharedSessionConfig = Arc::new(config);
        let keypair = SessionKeyPair::generate();
        let handshake = HandshakeEngine::new(config.clone(), keypair);

        let state = SessionState {
            status: SessionStatus::Idle,
            last_error: None,
            peers: PeerMap::new(),
            files: FileTransferEngine::new(config.clone(), id.clone()),
            store: StateEngine::new(
                config.room.clone(),
                config.stream_id.clone(),
                config.state_max_keys,
                config.state_max_snapshot_entries,
            ),
        };

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                events: EventQueue::new(config.event_queue_cap),
                bus: ProtocolEventBus::new(PROTOCOL_BUS_CAP),
                config,
                factory,
                handshake,
                state: AsyncMutex::new(state),
                transport: std::sync::Mutex::new(None),
                tasks: std::sync::Mutex::new(Vec::new()),
                reconnect_task: std::sync::Mutex::new(None),
                reconnect_count: AtomicU32::new(0),
                stopped: AtomicBool::new(false),
                started_at: Timestamp::now(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect, join the room, announce, and start the heartbeat. A failed
    /// first attempt emits `connect_error` and arms the reconnect timer; the
    /// session stays alive either way.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.status != SessionStatus::Idle {
                return Err(BridgeError::SessionState {
                    state: state.status.as_str().into(),
                    reason: "start is only valid from idle".into(),
                });
            }
            state.status = SessionStatus::Starting;
        }

        let result = Self::attempt_connect(&self.inner).await;
        if let Err(err) = &result {
            let mut state = self.inner.state.lock().await;
            state.status = SessionStatus::Reconnecting;
            state.last_error = Some(err.to_string());
            drop(state);
            self.inner.events.push(BridgeEvent::ConnectError {
                error: err.to_string(),
            });
            Self::schedule_reconnect(&self.inner);
        }

        // The heartbeat runs for the session lifetime regardless of the
        // first attempt's outcome.
        let heartbeat = tokio::spawn(Self::heartbeat_loop(self.inner.clone()));
        self.inner
            .tasks
            .lock()
            .expect("task list poisoned")
            .push(heartbeat);

        result
    }

    /// Tear everything down. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for task in self.inner.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        if let Some(task) = self
            .inner
            .reconnect_task
            .lock()
            .expect("reconnect slot poisoned")
            .take()
        {
            task.abort();
        }

        let transport = self
            .inner
            .transport
            .lock()
            .expect("transport slot poisoned")
            .take();
        if let Some(transport) = transport {
            let _ = transport.disconnect().await;
        }

        {
            let mut state = self.inner.state.lock().await;
            state.files.cleanup().await;
            state.status = SessionStatus::Stopped;
        }
        self.inner.events.push(BridgeEvent::Stopped);
        tracing::info!(session = %self.inner.id, "session stopped");
        Ok(())
    }

    async fn attempt_connect(inner: &Arc<SessionInner>) -> Result<()> {
        // Replace any previous transport; reconnects rebuild from scratch.
        let previous = inner
            .transport
            .lock()
            .expect("transport slot poisoned")
            .take();
        if let Some(previous) = previous {
            let _ = previous.disconnect().await;
        }

        let transport: Arc<dyn PeerTransport> = Arc::from(inner.factory.create());
        let (sender, receiver) = transport_event_channel();
        transport.attach_events(sender);

        {
            let mut state = inner.state.lock().await;
            state.status = SessionStatus::Connecting;
            // Handshake state is rebuilt with the transport.
            state.peers.clear();
        }

        let config = &inner.config;
        transport.connect().await?;
        transport
            .join_room(&config.room, config.password.as_deref())
            .await?;
        transport
            .announce(&config.stream_id, config.label.as_deref())
            .await?;
        if let Some(target) = &config.target_stream_id {
            transport.view(target, config.label.as_deref()).await?;
        }

        *inner.transport.lock().expect("transport slot poisoned") = Some(transport);

        let dispatcher = tokio::spawn(Self::dispatch_loop(inner.clone(), receiver));
        inner
            .tasks
            .lock()
            .expect("task list poisoned")
            .push(dispatcher);

        {
            let mut state = inner.state.lock().await;
            state.status = SessionStatus::Connected;
            state.last_error = None;
        }
        inner.events.push(BridgeEvent::Ready {
            room: config.room.clone(),
            stream_id: config.stream_id.clone(),
        });

        // Announce ourselves to whoever is already in the room.
        Self::broadcast_hello(inner).await;
        tracing::info!(session = %inner.id, room = %config.room, "session connected");
        Ok(())
    }

    /// Arm the reconnect timer. A single timer is outstanding at any time.
    fn schedule_reconnect(inner: &Arc<SessionInner>) {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = inner
            .reconnect_task
            .lock()
            .expect("reconnect slot poisoned");
        if slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let inner = inner.clone();
        *slot = Some(tokio::spawn(async move {
            let mut delay = inner.config.reconnect_ms;
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                let attempt = inner.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
                inner.events.push(BridgeEvent::Reconnecting {
                    attempt,
                    delay_ms: delay,
                });
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                match Self::attempt_connect(&inner).await {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::warn!(session = %inner.id, error = %err, "reconnect failed");
                        {
                            let mut state = inner.state.lock().await;
                            state.status = SessionStatus::Reconnecting;
                            state.last_error = Some(err.to_string());
                        }
                        inner.events.push(BridgeEvent::ConnectError {
                            error: err.to_string(),
                        });
                        delay = (delay * 2).min(inner.config.max_reconnect_ms);
                    }
                }
            }
        }));
    }

    // ------------------------------------------------------------------
    // Transport event dispatch
    // ------------------------------------------------------------------

    async fn dispatch_loop(inner: Arc<SessionInner>, mut receiver: TransportEventReceiver) {
        while let Some(event) = receiver.recv().await {
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            Self::handle_transport_event(&inner, event).await;
        }
    }

    async fn handle_transport_event(inner: &Arc<SessionInner>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {}
            TransportEvent::Disconnected { reason } => {
                {
                    let mut state = inner.state.lock().await;
                    state.status = SessionStatus::Reconnecting;
                    state.last_error = reason.clone();
                }
                inner.events.push(BridgeEvent::Disconnected { reason });
                Self::schedule_reconnect(inner);
            }
            TransportEvent::ConnectionFailed { detail } => {
                {
                    let mut state = inner.state.lock().await;
                    state.status = SessionStatus::Reconnecting;
                    state.last_error = Some(detail.clone());
                }
                inner
                    .events
                    .push(BridgeEvent::ConnectError { error: detail });
                Self::schedule_reconnect(inner);
            }
            TransportEvent::Error { detail } => {
                tracing::warn!(session = %inner.id, %detail, "transport error");
            }
            TransportEvent::PeerConnected { uuid, stream_id } => {
                {
                    let mut state = inner.state.lock().await;
                    let record = state
                        .peers
                        .entry(uuid.clone())
                        .or_insert_with(|| PeerRecord::discovered(uuid.clone(), stream_id.clone()));
                    record.connected = true;
                    if stream_id.is_some() {
                        record.stream_id = stream_id.clone();
                    }
                    record.touch();
                }
                inner.events.push(BridgeEvent::PeerJoined {
                    uuid: uuid.clone(),
                    stream_id,
                });
                Self::send_hello(inner, &uuid).await;
            }
            TransportEvent::PeerDisconnected { uuid, stream_id } => {
                {
                    let mut state = inner.state.lock().await;
                    if let Some(record) = state.peers.get_mut(&uuid) {
                        record.connected = false;
                        record.touch();
                    }
                }
                inner.events.push(BridgeEvent::PeerLeft { uuid, stream_id });
            }
            TransportEvent::DataChannelOpen { uuid, .. } => {
                inner
                    .events
                    .push(BridgeEvent::DataChannelOpen { uuid: uuid.clone() });
                Self::send_hello(inner, &uuid).await;
            }
            TransportEvent::DataChannelClose { uuid, .. } => {
                inner.events.push(BridgeEvent::DataChannelClose { uuid });
            }
            TransportEvent::DataReceived {
                uuid,
                stream_id,
                data,
                fallback: _,
            } => match data {
                DataPayload::Binary(bytes) => {
                    inner.events.push(BridgeEvent::DataReceived {
                        from_uuid: uuid,
                        from_stream_id: stream_id,
                        data: None,
                        data_base64: Some(BASE64.encode(bytes)),
                    });
                }
                DataPayload::Structured(value) => {
                    if Envelope::is_bridge_envelope(&value) {
                        match Envelope::from_value(value) {
                            Ok(envelope) => {
                                Self::route_envelope(inner, &uuid, envelope).await;
                            }
                            Err(err) => {
                                tracing::debug!(session = %inner.id, error = %err, "dropping malformed envelope");
                            }
                        }
                    } else {
                        inner.events.push(BridgeEvent::DataReceived {
                            from_uuid: uuid,
                            from_stream_id: stream_id,
                            data: Some(value),
                            data_base64: None,
                        });
                    }
                }
            },
        }
    }

    async fn route_envelope(inner: &Arc<SessionInner>, from: &PeerUuid, envelope: Envelope) {
        // MAC gate for everything outside the sync family.
        if !envelope.kind.is_sync() {
            let verdict = {
                let mut state = inner.state.lock().await;
                let record = state
                    .peers
                    .entry(from.clone())
                    .or_insert_with(|| PeerRecord::discovered(from.clone(), None));
                record.touch();
                if record.handshake_state == crate::peer::HandshakeState::Rejected {
                    Err(BridgeError::Protocol(
                        crate::errors::ProtocolError::MacMissing { peer: from.clone() },
                    ))
                } else {
                    verify_envelope_mac(
                        record.shared_key.as_ref(),
                        &envelope,
                        inner.config.require_session_mac,
                        from,
                    )
                }
            };
            if let Err(err) = verdict {
                inner.events.push(BridgeEvent::ProtocolAuthFailed {
                    uuid: from.clone(),
                    reason: err.to_string(),
                });
                tracing::debug!(session = %inner.id, peer = %from, error = %err, "dropping unauthenticated envelope");
                return;
            }
        }

        match envelope.kind {
            EnvelopeKind::SyncHello | EnvelopeKind::SyncHelloAck => {
                let outcome = {
                    let mut state = inner.state.lock().await;
                    inner.handshake.process_hello(&mut state.peers, from, &envelope)
                };
                Self::apply_admission(inner, outcome).await;
            }
            EnvelopeKind::SyncHeartbeat => {
                let mut state = inner.state.lock().await;
                inner
                    .handshake
                    .process_heartbeat(&mut state.peers, from, &envelope);
            }
            EnvelopeKind::SyncReject => {
                let outcome = {
                    let mut state = inner.state.lock().await;
                    inner.handshake.process_reject(&mut state.peers, from, &envelope)
                };
                Self::apply_admission(inner, outcome).await;
            }
            EnvelopeKind::FileOffer => {
                let stream_id = Some(envelope.from_stream_id.clone());
                let outcome = match envelope.payload_as() {
                    Ok(offer) => {
                        let mut state = inner.state.lock().await;
                        state.files.handle_offer(from, stream_id, offer).await
                    }
                    Err(err) => {
                        tracing::debug!(session = %inner.id, error = %err, "bad file.offer");
                        return;
                    }
                };
                Self::apply_file_outcome(inner, outcome).await;
            }
            EnvelopeKind::FileChunk => {
                let outcome = match envelope.payload_as() {
                    Ok(chunk) => {
                        let mut state = inner.state.lock().await;
                        state.files.handle_chunk(from, chunk).await
                    }
                    Err(err) => {
                        tracing::debug!(session = %inner.id, error = %err, "bad file.chunk");
                        return;
                    }
                };
                Self::apply_file_outcome(inner, outcome).await;
            }
            EnvelopeKind::FileComplete => {
                let outcome = match envelope.payload_as() {
                    Ok(complete) => {
                        let mut state = inner.state.lock().await;
                        state.files.handle_complete(from, complete).await
                    }
                    Err(err) => {
                        tracing::debug!(session = %inner.id, error = %err, "bad file.complete");
                        return;
                    }
                };
                Self::apply_file_outcome(inner, outcome).await;
            }
            EnvelopeKind::FileResumeReq => {
                if let Ok(req) = envelope.payload_as() {
                    let outcome = {
                        let mut state = inner.state.lock().await;
                        state.files.handle_resume_req(from, req)
                    };
                    Self::apply_file_outcome(inner, Ok(outcome)).await;
                }
            }
            EnvelopeKind::FileCancel => {
                if let Ok(cancel) = envelope.payload_as() {
                    let outcome = {
                        let mut state = inner.state.lock().await;
                        state.files.handle_cancel(from, cancel).await
                    };
                    Self::apply_file_outcome(inner, Ok(outcome)).await;
                }
            }
            EnvelopeKind::FileAccept
            | EnvelopeKind::FileAck
            | EnvelopeKind::FileNack
            | EnvelopeKind::FileResumeState
            | EnvelopeKind::FileCompleteAck => {
                // Sender-side notifications: resolve in-process waiters.
                inner
                    .bus
                    .publish(from.clone(), envelope.kind, envelope.payload);
            }
            EnvelopeKind::StatePatch => {
                if let Ok(patch) = envelope.payload_as::<StatePatchPayload>() {
                    let applied = {
                        let mut state = inner.state.lock().await;
                        state.store.apply_patch(patch.clone())
                    };
                    match applied {
                        Ok(ApplyOutcome::Applied) => {
                            inner.events.push(BridgeEvent::StateUpdated {
                                key: patch.key,
                                source: "remote".into(),
                                actor: patch.actor,
                                clock: patch.clock,
                            });
                        }
                        Ok(ApplyOutcome::Ignored) => {}
                        Err(err) => {
                            tracing::debug!(session = %inner.id, error = %err, "state patch rejected");
                        }
                    }
                }
            }
            EnvelopeKind::StateSnapshotReq => {
                let snapshot = {
                    let state = inner.state.lock().await;
                    state.store.snapshot()
                };
                Self::send_outbound(
                    inner,
                    OutboundEnvelope::new(from, EnvelopeKind::StateSnapshot, &snapshot),
                )
                .await;
            }
            EnvelopeKind::StateSnapshot => {
                if let Ok(snapshot) = envelope.payload_as::<StateSnapshot>() {
                    let applied = {
                        let mut state = inner.state.lock().await;
                        state.store.apply_snapshot(snapshot)
                    };
                    for entry in applied {
                        inner.events.push(BridgeEvent::StateUpdated {
                            key: entry.key,
                            source: "remote".into(),
                            actor: entry.actor,
                            clock: entry.clock,
                        });
                    }
                }
            }
        }
    }

    async fn apply_admission(inner: &Arc<SessionInner>, outcome: AdmissionOutcome) {
        for event in outcome.events {
            inner.events.push(event);
        }
        for reply in outcome.replies {
            Self::send_outbound(inner, reply).await;
        }
        if let Some(peer) = outcome.request_snapshot {
            Self::send_outbound(
                inner,
                OutboundEnvelope::new(&peer, EnvelopeKind::StateSnapshotReq, &StateSnapshotReqPayload {}),
            )
            .await;
        }
    }

    async fn apply_file_outcome(inner: &Arc<SessionInner>, outcome: Result<FileStepOutcome>) {
        match outcome {
            Ok(outcome) => {
                for event in outcome.events {
                    inner.events.push(event);
                }
                for reply in outcome.replies {
                    Self::send_outbound(inner, reply).await;
                }
            }
            Err(err) => {
                tracing::warn!(session = %inner.id, error = %err, "file protocol step failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound plumbing
    // ------------------------------------------------------------------

    fn current_transport(inner: &Arc<SessionInner>) -> Option<Arc<dyn PeerTransport>> {
        inner
            .transport
            .lock()
            .expect("transport slot poisoned")
            .clone()
    }

    /// MAC (where a shared key exists) and send one envelope to one peer.
    async fn send_outbound(inner: &Arc<SessionInner>, outbound: OutboundEnvelope) {
        let Some(transport) = Self::current_transport(inner) else {
            tracing::debug!(session = %inner.id, kind = %outbound.kind, "no transport for outbound envelope");
            return;
        };
        let mut envelope = Envelope::new(
            outbound.kind,
            &inner.config.room,
            &inner.config.stream_id,
            outbound.payload,
        );
        let shared_key = {
            let state = inner.state.lock().await;
            state.peers.get(&outbound.to).and_then(|p| p.shared_key)
        };
        if let Some(key) = shared_key {
            envelope.mac = Some(sign_envelope_mac(&key, &envelope));
        }
        if let Err(err) = transport
            .send_data(
                &DataPayload::Structured(envelope.to_value()),
                Some(&outbound.to),
            )
            .await
        {
            tracing::debug!(session = %inner.id, peer = %outbound.to, kind = %outbound.kind, error = %err, "envelope send failed");
        }
    }

    /// Send `sync.hello` to one peer.
    async fn send_hello(inner: &Arc<SessionInner>, to: &PeerUuid) {
        let hello = inner.handshake.build_hello();
        Self::send_outbound(
            inner,
            OutboundEnvelope::new(to, EnvelopeKind::SyncHello, &hello),
        )
        .await;
    }

    /// Broadcast `sync.hello` to the room.
    async fn broadcast_hello(inner: &Arc<SessionInner>) {
        let Some(transport) = Self::current_transport(inner) else {
            return;
        };
        let hello = inner.handshake.build_hello();
        let envelope = Envelope::new(
            EnvelopeKind::SyncHello,
            &inner.config.room,
            &inner.config.stream_id,
            serde_json::to_value(&hello).expect("hello serializes"),
        );
        let _ = transport
            .send_data(&DataPayload::Structured(envelope.to_value()), None)
            .await;
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn heartbeat_loop(inner: Arc<SessionInner>) {
        let interval = Duration::from_millis(inner.config.heartbeat_ms);
        let mut tick: u64 = 0;
        loop {
            tokio::time::sleep(interval).await;
            if inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            tick += 1;
            let Some(transport) = Self::current_transport(&inner) else {
                continue;
            };

            let connected: Vec<PeerUuid> = {
                let state = inner.state.lock().await;
                state
                    .peers
                    .values()
                    .filter(|p| p.connected)
                    .map(|p| p.uuid.clone())
                    .collect()
            };

            if transport.has_open_data_channel(None) {
                let keepalive = serde_json::json!({
                    "type": "keepalive",
                    "ts": Timestamp::now().as_millis(),
                });
                let _ = transport
                    .send_data(&DataPayload::Structured(keepalive), None)
                    .await;

                let heartbeat = Envelope::new(
                    EnvelopeKind::SyncHeartbeat,
                    &inner.config.room,
                    &inner.config.stream_id,
                    serde_json::to_value(HeartbeatPayload {
                        peer_count: connected.len(),
                    })
                    .expect("heartbeat serializes"),
                );
                let _ = transport
                    .send_data(&DataPayload::Structured(heartbeat.to_value()), None)
                    .await;
            }

            for uuid in &connected {
                let _ = transport.send_ping(uuid).await;
            }

            // Every fourth tick, refresh capability advertisement.
            if tick % 4 == 0 {
                Self::broadcast_hello(&inner).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send an application payload. Returns `(ok, used_target)`; refusals
    /// emit `send_rejected` and transport exceptions emit `send_error`, both
    /// with `ok = false`. Target-shape problems are validation errors.
    pub async fn send(
        &self,
        data: Value,
        target: Option<&Value>,
    ) -> Result<(bool, Option<PeerUuid>)> {
        let inner = &self.inner;
        let target = SendTarget::parse(target)?;

        let resolved = {
            let state = inner.state.lock().await;
            resolve_target(&state.peers, target.as_ref())
        };
        let (uuid, fallback) = match resolved {
            Ok(resolved) => resolved,
            Err(err @ BridgeError::AmbiguousTarget { .. })
            | Err(err @ BridgeError::InvalidInput { .. }) => return Err(err),
            Err(err) => {
                inner.events.push(BridgeEvent::SendRejected {
                    reason: err.to_string(),
                });
                return Ok((false, None));
            }
        };

        let Some(transport) = Self::current_transport(inner) else {
            inner.events.push(BridgeEvent::SendRejected {
                reason: "transport not connected".into(),
            });
            return Ok((false, Some(uuid)));
        };
        if !fallback && !transport.has_open_data_channel(Some(&uuid)) {
            inner.events.push(BridgeEvent::SendRejected {
                reason: format!("no open data channel to {uuid}"),
            });
            return Ok((false, Some(uuid)));
        }

        match transport
            .send_data(&DataPayload::Structured(data), Some(&uuid))
            .await
        {
            Ok(()) => Ok((true, Some(uuid))),
            Err(err) => {
                inner.events.push(BridgeEvent::SendError {
                    error: err.to_string(),
                });
                Ok((false, Some(uuid)))
            }
        }
    }

    /// Poll the event queue.
    pub async fn poll_events(&self, max: usize, wait_ms: u64) -> Vec<QueuedEvent> {
        self.inner.events.poll(max, wait_ms).await
    }

    /// Live status snapshot plus peer list.
    pub async fn status(&self) -> Value {
        let state = self.inner.state.lock().await;
        let peers: Vec<PeerSummary> = state.peers.values().map(PeerRecord::summary).collect();
        serde_json::json!({
            "session_id": self.inner.id,
            "status": state.status.as_str(),
            "room": self.inner.config.room,
            "stream_id": self.inner.config.stream_id,
            "label": self.inner.config.label,
            "reconnect_count": self.inner.reconnect_count.load(Ordering::SeqCst),
            "last_error": state.last_error,
            "queued_events": self.inner.events.len(),
            "state_keys": state.store.len(),
            "uptime_ms": Timestamp::now().millis_since(self.inner.started_at),
            "peers": peers,
        })
    }

    /// Peer summaries only.
    pub async fn peer_summaries(&self) -> Vec<PeerSummary> {
        let state = self.inner.state.lock().await;
        state.peers.values().map(PeerRecord::summary).collect()
    }

    /// Re-announce capabilities: to one peer, or to the whole room.
    pub async fn announce(&self, target: Option<&Value>) -> Result<()> {
        let target = SendTarget::parse(target)?;
        match target {
            Some(target) => {
                let uuid = {
                    let state = self.inner.state.lock().await;
                    resolve_target(&state.peers, Some(&target))?.0
                };
                Self::send_hello(&self.inner, &uuid).await;
            }
            None => Self::broadcast_hello(&self.inner).await,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // File transfer (sender side)
    // ------------------------------------------------------------------

    /// Register and run an outgoing transfer from in-memory bytes.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_file_bytes(
        &self,
        data: Vec<u8>,
        target: Option<&Value>,
        name: Option<String>,
        mime: Option<String>,
        chunk_bytes: Option<u64>,
        ack_timeout_ms: Option<u64>,
        max_retries: Option<u32>,
        transfer_id: Option<TransferId>,
    ) -> Result<TransferSummary> {
        let uuid = self.resolve_file_target(target).await?;
        let id = {
            let mut state = self.inner.state.lock().await;
            state.files.prepare_outgoing_memory(
                transfer_id,
                data,
                uuid,
                name,
                mime,
                chunk_bytes,
                ack_timeout_ms,
                max_retries,
            )?
        };
        self.run_outgoing(&id, None).await
    }

    /// Register and run an outgoing transfer streamed from a file path.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_file_path(
        &self,
        path: std::path::PathBuf,
        target: Option<&Value>,
        name: Option<String>,
        mime: Option<String>,
        chunk_bytes: Option<u64>,
        ack_timeout_ms: Option<u64>,
        max_retries: Option<u32>,
        transfer_id: Option<TransferId>,
    ) -> Result<TransferSummary> {
        let uuid = self.resolve_file_target(target).await?;
        let id = {
            let mut state = self.inner.state.lock().await;
            state
                .files
                .prepare_outgoing_path(
                    transfer_id,
                    path,
                    uuid,
                    name,
                    mime,
                    chunk_bytes,
                    ack_timeout_ms,
                    max_retries,
                )
                .await?
        };
        self.run_outgoing(&id, None).await
    }

    /// Re-run the transfer state machine for an existing outgoing transfer.
    pub async fn resume_file(
        &self,
        transfer_id: &TransferId,
        start_seq: Option<u64>,
    ) -> Result<TransferSummary> {
        {
            let state = self.inner.state.lock().await;
            if state.files.outgoing(transfer_id).is_none() {
                return Err(FileTransferError::UnknownTransfer {
                    transfer_id: transfer_id.clone(),
                }
                .into());
            }
        }
        self.run_outgoing(transfer_id, start_seq).await
    }

    async fn resolve_file_target(&self, target: Option<&Value>) -> Result<PeerUuid> {
        let target = SendTarget::parse(target)?;
        let state = self.inner.state.lock().await;
        resolve_target(&state.peers, target.as_ref()).map(|(uuid, _)| uuid)
    }

    /// The sender state machine: offer, strictly-sequential chunks with
    /// bounded retries, resume probes on silence, then complete.
    async fn run_outgoing(
        &self,
        id: &TransferId,
        start_seq: Option<u64>,
    ) -> Result<TransferSummary> {
        let inner = &self.inner;

        let (target, total_bytes, total_chunks, chunk_bytes, ack_timeout_ms, max_retries, source, offer) = {
            let mut state = inner.state.lock().await;
            let transfer = state
                .files
                .outgoing_mut(id)
                .ok_or_else(|| FileTransferError::UnknownTransfer {
                    transfer_id: id.clone(),
                })?;
            transfer.status = OutgoingStatus::Offered;
            transfer.last_error = None;
            transfer.touch();
            (
                transfer.target.clone(),
                transfer.total_bytes,
                transfer.total_chunks,
                transfer.chunk_bytes,
                transfer.ack_timeout_ms,
                transfer.max_retries,
                transfer.source.clone(),
                transfer.offer_payload(),
            )
        };

        let ack_timeout = Duration::from_millis(ack_timeout_ms);
        let mut source = ChunkSource::open(&source).await?;

        let result: Result<()> = async {
            // Offer and wait for the receiver's position.
            let cursor = inner.bus.cursor();
            Self::send_outbound(inner, OutboundEnvelope::new(&target, EnvelopeKind::FileOffer, &offer))
                .await;
            let accept_timeout = Duration::from_millis(ack_timeout_ms.max(1_000));
            let accept = inner
                .bus
                .wait_for(cursor, accept_timeout, |ev| {
                    Self::event_matches(ev, EnvelopeKind::FileAccept, id)
                })
                .await
                .ok_or(FileTransferError::AckTimeout {
                    what: "file.accept".into(),
                    timeout_ms: accept_timeout.as_millis() as u64,
                })?;
            let accept: FileAcceptPayload = serde_json::from_value(accept.payload)
                .map_err(BridgeError::Serialization)?;

            let mut seq = start_seq.unwrap_or(accept.next_seq).min(total_chunks);
            {
                let mut state = inner.state.lock().await;
                if let Some(transfer) = state.files.outgoing_mut(id) {
                    transfer.status = OutgoingStatus::Transferring;
                    transfer.next_seq = seq;
                    transfer.touch();
                }
            }

            while seq < total_chunks {
                if inner.stopped.load(Ordering::SeqCst) {
                    return Err(BridgeError::SessionState {
                        state: "stopped".into(),
                        reason: "transfer interrupted".into(),
                    });
                }

                let data = source.read_chunk(total_bytes, chunk_bytes, seq).await?;
                let chunk_hash = {
                    let state = inner.state.lock().await;
                    state
                        .files
                        .outgoing(id)
                        .map(|t| t.chunk_hashes[seq as usize].clone())
                        .ok_or_else(|| FileTransferError::UnknownTransfer {
                            transfer_id: id.clone(),
                        })?
                };

                let cursor = inner.bus.cursor();
                Self::send_outbound(
                    inner,
                    OutboundEnvelope::new(
                        &target,
                        EnvelopeKind::FileChunk,
                        &crate::envelope::FileChunkPayload {
                            transfer_id: id.clone(),
                            seq,
                            data_base64: BASE64.encode(&data),
                            chunk_hash,
                        },
                    ),
                )
                .await;

                let reply = inner
                    .bus
                    .wait_for(cursor, ack_timeout, |ev| {
                        (Self::event_matches(ev, EnvelopeKind::FileAck, id)
                            && ev.payload.get("seq").and_then(Value::as_u64) == Some(seq))
                            || Self::event_matches(ev, EnvelopeKind::FileNack, id)
                    })
                    .await;

                match reply {
                    Some(ev) if ev.kind == EnvelopeKind::FileAck => {
                        let ack: FileAckPayload = serde_json::from_value(ev.payload)
                            .map_err(BridgeError::Serialization)?;
                        let mut state = inner.state.lock().await;
                        let transfer = state.files.outgoing_mut(id).ok_or_else(|| {
                            FileTransferError::UnknownTransfer {
                                transfer_id: id.clone(),
                            }
                        })?;
                        transfer.acked[seq as usize] = true;
                        seq = (seq + 1).max(ack.next_seq);
                        transfer.next_seq = seq;
                        transfer.touch();
                    }
                    Some(ev) => {
                        let nack: FileNackPayload = serde_json::from_value(ev.payload)
                            .map_err(BridgeError::Serialization)?;
                        let retries = {
                            let mut state = inner.state.lock().await;
                            let transfer = state.files.outgoing_mut(id).ok_or_else(|| {
                                FileTransferError::UnknownTransfer {
                                    transfer_id: id.clone(),
                                }
                            })?;
                            transfer.retries_total += 1;
                            let count = transfer
                                .retries_for_seq
                                .entry(nack.expected_seq)
                                .or_insert(0);
                            *count += 1;
                            *count
                        };
                        if retries > max_retries {
                            return Err(FileTransferError::RetriesExhausted {
                                transfer_id: id.clone(),
                                retries,
                                reason: nack.reason,
                            }
                            .into());
                        }
                        seq = nack.expected_seq;
                    }
                    None => {
                        // Silence: count a retry and probe the receiver.
                        let retries = {
                            let mut state = inner.state.lock().await;
                            let transfer = state.files.outgoing_mut(id).ok_or_else(|| {
                                FileTransferError::UnknownTransfer {
                                    transfer_id: id.clone(),
                                }
                            })?;
                            transfer.retries_total += 1;
                            let count = transfer.retries_for_seq.entry(seq).or_insert(0);
                            *count += 1;
                            *count
                        };
                        if retries > max_retries {
                            return Err(FileTransferError::RetriesExhausted {
                                transfer_id: id.clone(),
                                retries,
                                reason: format!("no ack for seq {seq}"),
                            }
                            .into());
                        }

                        let cursor = inner.bus.cursor();
                        Self::send_outbound(
                            inner,
                            OutboundEnvelope::new(
                                &target,
                                EnvelopeKind::FileResumeReq,
                                &FileResumeReqPayload {
                                    transfer_id: id.clone(),
                                },
                            ),
                        )
                        .await;
                        if let Some(ev) = inner
                            .bus
                            .wait_for(cursor, ack_timeout, |ev| {
                                Self::event_matches(ev, EnvelopeKind::FileResumeState, id)
                            })
                            .await
                        {
                            let resume: FileResumeStatePayload =
                                serde_json::from_value(ev.payload)
                                    .map_err(BridgeError::Serialization)?;
                            seq = resume.next_seq.min(total_chunks);
                        }
                    }
                }
            }

            // Complete handshake; a lost ack gets one resume probe.
            let cursor = inner.bus.cursor();
            let file_hash = offer.file_hash.clone();
            Self::send_outbound(
                inner,
                OutboundEnvelope::new(
                    &target,
                    EnvelopeKind::FileComplete,
                    &FileCompletePayload {
                        transfer_id: id.clone(),
                        total_bytes,
                        file_hash,
                    },
                ),
            )
            .await;
            let complete_timeout = Duration::from_millis(ack_timeout_ms.saturating_mul(2));
            let acked = inner
                .bus
                .wait_for(cursor, complete_timeout, |ev| {
                    Self::event_matches(ev, EnvelopeKind::FileCompleteAck, id)
                })
                .await
                .is_some();

            if !acked {
                let cursor = inner.bus.cursor();
                Self::send_outbound(
                    inner,
                    OutboundEnvelope::new(
                        &target,
                        EnvelopeKind::FileResumeReq,
                        &FileResumeReqPayload {
                            transfer_id: id.clone(),
                        },
                    ),
                )
                .await;
                let resume = inner
                    .bus
                    .wait_for(cursor, complete_timeout, |ev| {
                        Self::event_matches(ev, EnvelopeKind::FileResumeState, id)
                    })
                    .await;
                let confirmed = resume
                    .and_then(|ev| serde_json::from_value::<FileResumeStatePayload>(ev.payload).ok())
                    .map(|resume| resume.next_seq >= total_chunks)
                    .unwrap_or(false);
                if !confirmed {
                    return Err(FileTransferError::AckTimeout {
                        what: "file.complete_ack".into(),
                        timeout_ms: complete_timeout.as_millis() as u64,
                    }
                    .into());
                }
            }
            Ok(())
        }
        .await;

        let mut state = inner.state.lock().await;
        match result {
            Ok(()) => {
                state.files.complete_outgoing(id);
                let summary = state
                    .files
                    .outgoing(id)
                    .map(|t| t.summary())
                    .ok_or_else(|| FileTransferError::UnknownTransfer {
                        transfer_id: id.clone(),
                    })?;
                drop(state);
                tracing::info!(session = %inner.id, transfer = %id, "outgoing transfer completed");
                Ok(summary)
            }
            Err(err) => {
                state.files.fail_outgoing(id, err.to_string());
                drop(state);
                inner.events.push(BridgeEvent::FileTransferFailed {
                    transfer_id: id.clone(),
                    error: err.to_string(),
                });
                tracing::warn!(session = %inner.id, transfer = %id, error = %err, "outgoing transfer failed");
                Err(err)
            }
        }
    }

    fn event_matches(ev: &ProtocolEvent, kind: EnvelopeKind, id: &TransferId) -> bool {
        ev.kind == kind
            && ev.payload.get("transfer_id").and_then(Value::as_str) == Some(id.as_str())
    }

    // ------------------------------------------------------------------
    // File transfer (reads)
    // ------------------------------------------------------------------

    /// Transfer summaries for the requested direction.
    pub async fn file_transfers(&self, direction: &str) -> Result<Vec<TransferSummary>> {
        if !matches!(direction, "incoming" | "outgoing" | "all") {
            return Err(BridgeError::invalid_input(
                "direction must be incoming, outgoing, or all",
            ));
        }
        let state = self.inner.state.lock().await;
        Ok(state.files.summaries(direction))
    }

    /// Read a completed incoming transfer's payload.
    pub async fn read_received_file(&self, transfer_id: &TransferId) -> Result<Vec<u8>> {
        let state = self.inner.state.lock().await;
        state.files.read_completed(transfer_id).await
    }

    /// Save a completed incoming transfer to disk.
    pub async fn save_received_file(
        &self,
        transfer_id: &TransferId,
        output_path: &std::path::Path,
        overwrite: bool,
    ) -> Result<u64> {
        let state = self.inner.state.lock().await;
        state
            .files
            .save_completed(transfer_id, output_path, overwrite)
            .await
    }

    // ------------------------------------------------------------------
    // Replicated state
    // ------------------------------------------------------------------

    /// Local write, replicated to every connected peer.
    pub async fn state_set(&self, key: &str, value: Value) -> Result<u64> {
        let (patch, peers) = {
            let mut state = self.inner.state.lock().await;
            let patch = state.store.set(key, value)?;
            let peers: Vec<PeerUuid> = state
                .peers
                .values()
                .filter(|p| p.connected)
                .map(|p| p.uuid.clone())
                .collect();
            (patch, peers)
        };
        self.inner.events.push(BridgeEvent::StateUpdated {
            key: patch.key.clone(),
            source: "local".into(),
            actor: patch.actor.clone(),
            clock: patch.clock,
        });
        for peer in peers {
            Self::send_outbound(
                &self.inner,
                OutboundEnvelope::new(&peer, EnvelopeKind::StatePatch, &patch),
            )
            .await;
        }
        Ok(patch.clock)
    }

    /// Read one key, or the whole store with metadata.
    pub async fn state_get(&self, key: Option<&str>, include_meta: bool) -> Value {
        let state = self.inner.state.lock().await;
        match key {
            Some(key) => {
                let entry = state.store.get_entry(key);
                match (entry, include_meta) {
                    (Some(entry), true) => serde_json::json!({ "key": key, "entry": entry }),
                    (Some(entry), false) => {
                        serde_json::json!({ "key": key, "value": entry.value })
                    }
                    (None, _) => serde_json::json!({ "key": key, "value": Value::Null }),
                }
            }
            None => {
                let (entries, clocks) = state.store.read_all();
                serde_json::json!({
                    "entries": entries,
                    "actor_clock": clocks,
                    "local_clock": state.store.local_clock(),
                })
            }
        }
    }

    /// Push our snapshot to peers, request theirs, or both.
    pub async fn state_sync(&self, mode: &str) -> Result<usize> {
        if !matches!(mode, "send" | "request" | "both") {
            return Err(BridgeError::invalid_input(
                "mode must be send, request, or both",
            ));
        }
        let (snapshot, peers) = {
            let state = self.inner.state.lock().await;
            let peers: Vec<PeerUuid> = state
                .peers
                .values()
                .filter(|p| p.connected)
                .map(|p| p.uuid.clone())
                .collect();
            (state.store.snapshot(), peers)
        };
        for peer in &peers {
            if mode == "send" || mode == "both" {
                Self::send_outbound(
                    &self.inner,
                    OutboundEnvelope::new(peer, EnvelopeKind::StateSnapshot, &snapshot),
                )
                .await;
            }
            if mode == "request" || mode == "both" {
                Self::send_outbound(
                    &self.inner,
                    OutboundEnvelope::new(peer, EnvelopeKind::StateSnapshotReq, &StateSnapshotReqPayload {}),
                )
                .await;
            }
        }
        Ok(peers.len())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(uuid: &str, stream: &str, connected: bool) -> PeerRecord {
        let mut record = PeerRecord::discovered(PeerUuid::new(uuid), Some(StreamId::new(stream)));
        record.connected = connected;
        record
    }

    fn peers(records: Vec<PeerRecord>) -> PeerMap {
        records.into_iter().map(|r| (r.uuid.clone(), r)).collect()
    }

    #[test]
    fn test_parse_target_shapes() {
        assert_eq!(SendTarget::parse(None).unwrap(), None);
        assert_eq!(SendTarget::parse(Some(&Value::Null)).unwrap(), None);

        let parsed = SendTarget::parse(Some(&serde_json::json!("agent_b")))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.stream_id, Some(StreamId::new("agent_b")));
        assert!(!parsed.fallback);

        let parsed = SendTarget::parse(Some(
            &serde_json::json!({"uuid": "u-1", "fallback": true}),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(parsed.uuid, Some(PeerUuid::new("u-1")));
        assert!(parsed.fallback);

        assert!(SendTarget::parse(Some(&serde_json::json!(42))).is_err());
        assert!(SendTarget::parse(Some(&serde_json::json!({"fallback": true}))).is_err());
    }

    #[test]
    fn test_resolve_sole_peer() {
        let map = peers(vec![peer("u-1", "agent_b", true)]);
        let (uuid, fallback) = resolve_target(&map, None).unwrap();
        assert_eq!(uuid, PeerUuid::new("u-1"));
        assert!(!fallback);
    }

    #[test]
    fn test_resolve_ambiguous() {
        let map = peers(vec![
            peer("u-1", "agent_b", true),
            peer("u-2", "agent_c", true),
        ]);
        match resolve_target(&map, None) {
            Err(BridgeError::AmbiguousTarget { connected }) => assert_eq!(connected, 2),
            other => panic!("expected ambiguous target, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_by_stream_id_and_uuid() {
        let map = peers(vec![
            peer("u-1", "agent_b", true),
            peer("u-2", "agent_c", false),
        ]);
        let target = SendTarget::parse(Some(&serde_json::json!("agent_c")))
            .unwrap()
            .unwrap();
        assert_eq!(
            resolve_target(&map, Some(&target)).unwrap().0,
            PeerUuid::new("u-2")
        );

        let target = SendTarget::parse(Some(&serde_json::json!("u-1")))
            .unwrap()
            .unwrap();
        assert_eq!(
            resolve_target(&map, Some(&target)).unwrap().0,
            PeerUuid::new("u-1")
        );

        let target = SendTarget::parse(Some(&serde_json::json!("nobody")))
            .unwrap()
            .unwrap();
        assert!(resolve_target(&map, Some(&target)).is_err());
    }

    #[test]
    fn test_resolve_no_peers() {
        let map = PeerMap::new();
        assert!(matches!(
            resolve_target(&map, None),
            Err(BridgeError::Transport(TransportError::NotConnected))
        ));
    }

    #[test]
    fn test_session_status_strings() {
        assert_eq!(SessionStatus::Reconnecting.as_str(), "reconnecting");
        assert_eq!(SessionStatus::Stopped.as_str(), "stopped");
    }
}
