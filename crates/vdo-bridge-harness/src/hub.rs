//! In-process signalling hub
//!
//! One [`SignalHub`] hosts any number of named rooms. Members register at
//! join time, become visible to the room at announce time, and exchange
//! data-channel payloads through the hub with deterministic in-send-order
//! delivery. Fault rules are keyed by directed stream-id pairs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vdo_bridge_core::envelope::Envelope;
use vdo_bridge_core::transport::{DataPayload, TransportEvent, TransportEventSender};
use vdo_bridge_core::types::{PeerUuid, StreamId};

/// Shared on/off handle for a fault rule. Store `false` to clear the fault.
pub type FaultSwitch = Arc<AtomicBool>;

// ----------------------------------------------------------------------------
// Hub State
// ----------------------------------------------------------------------------

struct Member {
    uuid: PeerUuid,
    stream_id: Option<StreamId>,
    events: TransportEventSender,
}

struct Room {
    members: HashMap<PeerUuid, Member>,
}

enum FaultKind {
    /// Drop acknowledgment envelopes (`file.ack`, `file.resume_state`,
    /// `file.complete_ack`) while the switch is on.
    DropAcks(FaultSwitch),
    /// Corrupt the data of one specific `file.chunk`, once.
    CorruptChunkOnce { seq: u64, done: AtomicBool },
}

struct FaultRule {
    from: StreamId,
    to: StreamId,
    kind: FaultKind,
}

struct HubInner {
    rooms: Mutex<HashMap<String, Room>>,
    memberships: Mutex<HashMap<PeerUuid, String>>,
    faults: Mutex<Vec<FaultRule>>,
    next_uuid: AtomicU64,
}

/// Deterministic in-process signalling service.
#[derive(Clone)]
pub struct SignalHub {
    inner: Arc<HubInner>,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                memberships: Mutex::new(HashMap::new()),
                faults: Mutex::new(Vec::new()),
                next_uuid: AtomicU64::new(1),
            }),
        }
    }

    /// Allocate the uuid the "signalling layer" assigns to a new member.
    pub(crate) fn allocate_uuid(&self) -> PeerUuid {
        let n = self.inner.next_uuid.fetch_add(1, Ordering::SeqCst);
        PeerUuid::new(format!("peer-{n}"))
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Drop ACK-family envelopes flowing `from` → `to` until the returned
    /// switch is stored `false`.
    pub fn drop_acks(&self, from: &str, to: &str) -> FaultSwitch {
        let switch: FaultSwitch = Arc::new(AtomicBool::new(true));
        self.inner.faults.lock().expect("faults poisoned").push(FaultRule {
            from: StreamId::new(from),
            to: StreamId::new(to),
            kind: FaultKind::DropAcks(switch.clone()),
        });
        switch
    }

    /// Corrupt the payload of chunk `seq` flowing `from` → `to`, one time.
    pub fn corrupt_chunk_once(&self, from: &str, to: &str, seq: u64) {
        self.inner.faults.lock().expect("faults poisoned").push(FaultRule {
            from: StreamId::new(from),
            to: StreamId::new(to),
            kind: FaultKind::CorruptChunkOnce {
                seq,
                done: AtomicBool::new(false),
            },
        });
    }

    /// Simulate a signalling drop for one member: it sees `disconnected`,
    /// the room sees it leave.
    pub async fn kick(&self, stream_id: &str) {
        let stream = StreamId::new(stream_id);
        let mut kicked: Option<(PeerUuid, TransportEventSender)> = None;
        let mut others: Vec<(TransportEventSender, PeerUuid, Option<StreamId>)> = Vec::new();
        {
            let mut rooms = self.inner.rooms.lock().expect("rooms poisoned");
            let mut memberships = self
                .inner
                .memberships
                .lock()
                .expect("memberships poisoned");
            for room in rooms.values_mut() {
                let target = room
                    .members
                    .values()
                    .find(|m| m.stream_id.as_ref() == Some(&stream))
                    .map(|m| m.uuid.clone());
                if let Some(uuid) = target {
                    let member = room.members.remove(&uuid).expect("member exists");
                    memberships.remove(&uuid);
                    for other in room.members.values() {
                        others.push((
                            other.events.clone(),
                            member.uuid.clone(),
                            member.stream_id.clone(),
                        ));
                    }
                    kicked = Some((member.uuid, member.events));
                    break;
                }
            }
        }
        if let Some((uuid, events)) = kicked {
            for (sender, left_uuid, left_stream) in others {
                let _ = sender
                    .send(TransportEvent::PeerDisconnected {
                        uuid: left_uuid.clone(),
                        stream_id: left_stream.clone(),
                    })
                    .await;
            }
            let _ = events
                .send(TransportEvent::Disconnected {
                    reason: Some("kicked by hub".into()),
                })
                .await;
            tracing::debug!(peer = %uuid, "hub kicked member");
        }
    }

    // ------------------------------------------------------------------
    // Membership (called by FakeTransport)
    // ------------------------------------------------------------------

    pub(crate) fn join(&self, room: &str, uuid: &PeerUuid, events: TransportEventSender) {
        let mut rooms = self.inner.rooms.lock().expect("rooms poisoned");
        let entry = rooms.entry(room.to_string()).or_insert_with(|| Room {
            members: HashMap::new(),
        });
        entry.members.insert(
            uuid.clone(),
            Member {
                uuid: uuid.clone(),
                stream_id: None,
                events,
            },
        );
        self.inner
            .memberships
            .lock()
            .expect("memberships poisoned")
            .insert(uuid.clone(), room.to_string());
    }

    /// Mark a member announced and open data channels both ways with every
    /// previously announced member.
    pub(crate) async fn announce(&self, uuid: &PeerUuid, stream_id: &StreamId) {
        let mut introductions: Vec<(TransportEventSender, PeerUuid, Option<StreamId>)> = Vec::new();
        let mut own_sender: Option<TransportEventSender> = None;
        {
            let room_name = match self
                .inner
                .memberships
                .lock()
                .expect("memberships poisoned")
                .get(uuid)
            {
                Some(room) => room.clone(),
                None => return,
            };
            let mut rooms = self.inner.rooms.lock().expect("rooms poisoned");
            let Some(room) = rooms.get_mut(&room_name) else { return };
            if let Some(member) = room.members.get_mut(uuid) {
                member.stream_id = Some(stream_id.clone());
                own_sender = Some(member.events.clone());
            }
            for other in room.members.values() {
                if &other.uuid != uuid && other.stream_id.is_some() {
                    introductions.push((
                        other.events.clone(),
                        other.uuid.clone(),
                        other.stream_id.clone(),
                    ));
                }
            }
        }

        // Both sides observe the connection and an open data channel.
        for (other_sender, other_uuid, other_stream) in introductions {
            let _ = other_sender
                .send(TransportEvent::PeerConnected {
                    uuid: uuid.clone(),
                    stream_id: Some(stream_id.clone()),
                })
                .await;
            let _ = other_sender
                .send(TransportEvent::DataChannelOpen {
                    uuid: uuid.clone(),
                    stream_id: Some(stream_id.clone()),
                })
                .await;
            if let Some(own) = &own_sender {
                let _ = own
                    .send(TransportEvent::PeerConnected {
                        uuid: other_uuid.clone(),
                        stream_id: other_stream.clone(),
                    })
                    .await;
                let _ = own
                    .send(TransportEvent::DataChannelOpen {
                        uuid: other_uuid,
                        stream_id: other_stream,
                    })
                    .await;
            }
        }
    }

    pub(crate) async fn leave(&self, uuid: &PeerUuid) {
        let mut notifications: Vec<(TransportEventSender, PeerUuid, Option<StreamId>)> = Vec::new();
        {
            let room_name = match self
                .inner
                .memberships
                .lock()
                .expect("memberships poisoned")
                .remove(uuid)
            {
                Some(room) => room,
                None => return,
            };
            let mut rooms = self.inner.rooms.lock().expect("rooms poisoned");
            if let Some(room) = rooms.get_mut(&room_name) {
                if let Some(member) = room.members.remove(uuid) {
                    for other in room.members.values() {
                        notifications.push((
                            other.events.clone(),
                            member.uuid.clone(),
                            member.stream_id.clone(),
                        ));
                    }
                }
                if room.members.is_empty() {
                    rooms.remove(&room_name);
                }
            }
        }
        for (sender, left_uuid, left_stream) in notifications {
            let _ = sender
                .send(TransportEvent::PeerDisconnected {
                    uuid: left_uuid,
                    stream_id: left_stream,
                })
                .await;
        }
    }

    /// Whether `uuid` (or anyone, when `None`) has an open channel with the
    /// member `asker`. Channels are open between announced members.
    pub(crate) fn channel_open(&self, asker: &PeerUuid, uuid: Option<&PeerUuid>) -> bool {
        let memberships = self.inner.memberships.lock().expect("memberships poisoned");
        let Some(room_name) = memberships.get(asker) else {
            return false;
        };
        let rooms = self.inner.rooms.lock().expect("rooms poisoned");
        let Some(room) = rooms.get(room_name) else {
            return false;
        };
        let self_announced = room
            .members
            .get(asker)
            .map(|m| m.stream_id.is_some())
            .unwrap_or(false);
        if !self_announced {
            return false;
        }
        match uuid {
            Some(uuid) => room
                .members
                .get(uuid)
                .map(|m| m.stream_id.is_some())
                .unwrap_or(false),
            None => room
                .members
                .values()
                .any(|m| &m.uuid != asker && m.stream_id.is_some()),
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Deliver a payload from `from` to `target` (or to every other room
    /// member when `None`), applying fault rules on the way.
    pub(crate) async fn route(
        &self,
        from: &PeerUuid,
        payload: &DataPayload,
        target: Option<&PeerUuid>,
    ) {
        let mut deliveries: Vec<(TransportEventSender, StreamId)> = Vec::new();
        let from_stream;
        {
            let memberships = self.inner.memberships.lock().expect("memberships poisoned");
            let Some(room_name) = memberships.get(from) else {
                return;
            };
            let rooms = self.inner.rooms.lock().expect("rooms poisoned");
            let Some(room) = rooms.get(room_name) else {
                return;
            };
            let Some(sender) = room.members.get(from) else {
                return;
            };
            let Some(sender_stream) = sender.stream_id.clone() else {
                return;
            };
            from_stream = sender_stream;
            for member in room.members.values() {
                if &member.uuid == from {
                    continue;
                }
                if let Some(target) = target {
                    if &member.uuid != target {
                        continue;
                    }
                }
                if let Some(to_stream) = member.stream_id.clone() {
                    deliveries.push((member.events.clone(), to_stream));
                }
            }
        }

        for (sender, to_stream) in deliveries {
            let Some(delivered) = self.apply_faults(&from_stream, &to_stream, payload) else {
                continue;
            };
            let _ = sender
                .send(TransportEvent::DataReceived {
                    uuid: from.clone(),
                    stream_id: Some(from_stream.clone()),
                    data: delivered,
                    fallback: false,
                })
                .await;
        }
    }

    /// Apply fault rules for the directed link; `None` means "dropped".
    fn apply_faults(
        &self,
        from: &StreamId,
        to: &StreamId,
        payload: &DataPayload,
    ) -> Option<DataPayload> {
        let envelope_kind = payload
            .as_structured()
            .filter(|v| Envelope::is_bridge_envelope(v))
            .and_then(|v| v.get("kind"))
            .and_then(Value::as_str)
            .map(String::from);

        let faults = self.inner.faults.lock().expect("faults poisoned");
        for rule in faults.iter() {
            if &rule.from != from || &rule.to != to {
                continue;
            }
            match (&rule.kind, envelope_kind.as_deref()) {
                (FaultKind::DropAcks(switch), Some(kind))
                    if switch.load(Ordering::SeqCst)
                        && matches!(
                            kind,
                            "file.ack" | "file.resume_state" | "file.complete_ack"
                        ) =>
                {
                    tracing::debug!(%from, %to, kind, "fault: dropping ack envelope");
                    return None;
                }
                (FaultKind::CorruptChunkOnce { seq, done }, Some("file.chunk")) => {
                    let value = payload.as_structured().expect("structured envelope");
                    let chunk_seq = value
                        .get("payload")
                        .and_then(|p| p.get("seq"))
                        .and_then(Value::as_u64);
                    if chunk_seq == Some(*seq)
                        && !done.swap(true, Ordering::SeqCst)
                    {
                        let mut corrupted = value.clone();
                        if let Some(data_field) = corrupted
                            .get_mut("payload")
                            .and_then(|p| p.get_mut("data_base64"))
                        {
                            if let Some(encoded) = data_field.as_str() {
                                if let Ok(mut raw) = BASE64.decode(encoded) {
                                    if let Some(first) = raw.first_mut() {
                                        *first ^= 0xff;
                                    }
                                    *data_field = Value::String(BASE64.encode(raw));
                                }
                            }
                        }
                        tracing::debug!(%from, %to, seq, "fault: corrupted chunk in flight");
                        return Some(DataPayload::Structured(corrupted));
                    }
                }
                _ => {}
            }
        }
        Some(payload.clone())
    }
}
