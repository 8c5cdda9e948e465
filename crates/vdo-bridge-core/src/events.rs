//! Session events and protocol-event plumbing
//!
//! Two queues live here. The [`EventQueue`] is the bounded, drop-oldest FIFO
//! of user-visible [`BridgeEvent`]s that the `receive` tool polls. The
//! [`ProtocolEventBus`] is internal: the file-transfer sender parks on it
//! waiting for ACK/NACK envelopes, using a monotonic cursor captured before
//! the send so a fast reply can never be lost to a late subscription.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::envelope::EnvelopeKind;
use crate::types::{PeerUuid, StreamId, Timestamp, TransferId};

/// Poll waits are capped regardless of what the caller asks for.
pub const MAX_POLL_WAIT_MS: u64 = 30_000;

// ----------------------------------------------------------------------------
// Bridge Events
// ----------------------------------------------------------------------------

/// User-visible session events, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Session connected, joined its room, and announced itself.
    Ready { room: String, stream_id: StreamId },
    /// Session start or reconnect attempt failed.
    ConnectError { error: String },
    /// Signalling layer dropped the connection.
    Disconnected { reason: Option<String> },
    /// Reconnect timer armed.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Session stopped; terminal.
    Stopped,
    /// A peer appeared in the room.
    PeerJoined {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
    },
    /// A peer left the room.
    PeerLeft {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
    },
    DataChannelOpen { uuid: PeerUuid },
    DataChannelClose { uuid: PeerUuid },
    /// Non-protocol data from a peer. Structured payloads surface in `data`;
    /// binary payloads surface base64-encoded in `data_base64`.
    DataReceived {
        from_uuid: PeerUuid,
        from_stream_id: Option<StreamId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data_base64: Option<String>,
    },
    /// `send` refused before reaching the transport.
    SendRejected { reason: String },
    /// The transport raised while sending.
    SendError { error: String },
    /// A peer's handshake record changed.
    SyncPeerUpdated {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
        handshake_state: String,
        auth_ok: bool,
    },
    /// A peer was refused admission.
    SyncPeerRejected {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
        reason: String,
    },
    /// An envelope failed MAC or token verification and was dropped.
    ProtocolAuthFailed { uuid: PeerUuid, reason: String },
    /// An incoming transfer was offered and accepted for receiving.
    FileOfferReceived {
        transfer_id: TransferId,
        from_uuid: PeerUuid,
        name: Option<String>,
        mime: Option<String>,
        total_bytes: u64,
        total_chunks: u64,
    },
    /// An incoming transfer finalized successfully.
    FileReceived {
        transfer_id: TransferId,
        from_uuid: PeerUuid,
        name: Option<String>,
        total_bytes: u64,
        file_hash: String,
        spooled: bool,
    },
    FileTransferCancelled {
        transfer_id: TransferId,
        reason: Option<String>,
    },
    /// An outgoing transfer gave up.
    FileTransferFailed {
        transfer_id: TransferId,
        error: String,
    },
    /// A replicated state entry was applied.
    StateUpdated {
        key: String,
        source: String,
        actor: StreamId,
        clock: u64,
    },
}

/// A [`BridgeEvent`] as it sits in the queue, stamped with arrival time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub ts: u64,
    #[serde(flatten)]
    pub event: BridgeEvent,
}

// ----------------------------------------------------------------------------
// Event Queue
// ----------------------------------------------------------------------------

/// Bounded FIFO of user-visible events with drop-oldest overflow.
pub struct EventQueue {
    inner: Mutex<VecDeque<QueuedEvent>>,
    notify: Notify,
    cap: usize,
}

impl EventQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap: cap.max(1),
        }
    }

    /// Append an event, dropping the oldest entries when over capacity.
    pub fn push(&self, event: BridgeEvent) {
        {
            let mut queue = self.inner.lock().expect("event queue poisoned");
            queue.push_back(QueuedEvent {
                ts: Timestamp::now().as_millis(),
                event,
            });
            while queue.len() > self.cap {
                queue.pop_front();
            }
        }
        self.notify.notify_waiters();
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self, max: usize) -> Vec<QueuedEvent> {
        let mut queue = self.inner.lock().expect("event queue poisoned");
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Return up to `max` events. With `wait_ms == 0` this never suspends;
    /// otherwise it waits (capped at [`MAX_POLL_WAIT_MS`]) until at least one
    /// event arrives or the deadline passes.
    pub async fn poll(&self, max: usize, wait_ms: u64) -> Vec<QueuedEvent> {
        let max = max.max(1);
        let drained = self.drain(max);
        if !drained.is_empty() || wait_ms == 0 {
            return drained;
        }

        let wait = Duration::from_millis(wait_ms.min(MAX_POLL_WAIT_MS));
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let drained = self.drain(max);
            if !drained.is_empty() {
                return drained;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.drain(max);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Protocol Event Bus
// ----------------------------------------------------------------------------

/// An inbound protocol envelope published for in-process waiters.
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    pub cursor: u64,
    pub from: PeerUuid,
    pub kind: EnvelopeKind,
    pub payload: Value,
}

struct BusInner {
    next_cursor: u64,
    ring: VecDeque<ProtocolEvent>,
}

/// Cursor-based bus the file-transfer sender uses to await ACK/NACK
/// envelopes.
///
/// A waiter captures [`ProtocolEventBus::cursor`] *before* sending its
/// request, then waits for a matching event with a greater cursor; an ACK
/// that lands between send and wait is found in the ring rather than lost.
/// Matching scans in cursor order, so waits resolve in arrival FIFO.
pub struct ProtocolEventBus {
    inner: Mutex<BusInner>,
    notify: Notify,
    cap: usize,
}

impl ProtocolEventBus {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_cursor: 0,
                ring: VecDeque::new(),
            }),
            notify: Notify::new(),
            cap: cap.max(16),
        }
    }

    /// Current cursor; events published later compare strictly greater.
    pub fn cursor(&self) -> u64 {
        self.inner.lock().expect("protocol bus poisoned").next_cursor
    }

    /// Publish an inbound protocol envelope.
    pub fn publish(&self, from: PeerUuid, kind: EnvelopeKind, payload: Value) {
        {
            let mut inner = self.inner.lock().expect("protocol bus poisoned");
            inner.next_cursor += 1;
            let cursor = inner.next_cursor;
            inner.ring.push_back(ProtocolEvent {
                cursor,
                from,
                kind,
                payload,
            });
            while inner.ring.len() > self.cap {
                inner.ring.pop_front();
            }
        }
        self.notify.notify_waiters();
    }

    fn find_after<F>(&self, after: u64, pred: &F) -> Option<ProtocolEvent>
    where
        F: Fn(&ProtocolEvent) -> bool,
    {
        let inner = self.inner.lock().expect("protocol bus poisoned");
        inner
            .ring
            .iter()
            .find(|ev| ev.cursor > after && pred(ev))
            .cloned()
    }

    /// Wait up to `timeout` for an event with cursor greater than `after`
    /// that satisfies `pred`. Returns `None` on timeout.
    pub async fn wait_for<F>(&self, after: u64, timeout: Duration, pred: F) -> Option<ProtocolEvent>
    where
        F: Fn(&ProtocolEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(ev) = self.find_after(after, &pred) {
                return Some(ev);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.find_after(after, &pred);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn stopped() -> BridgeEvent {
        BridgeEvent::Stopped
    }

    #[tokio::test]
    async fn test_queue_drop_oldest() {
        let queue = EventQueue::new(3);
        for i in 0..5u32 {
            queue.push(BridgeEvent::Reconnecting {
                attempt: i,
                delay_ms: 0,
            });
        }
        assert_eq!(queue.len(), 3);
        let events = queue.poll(10, 0).await;
        let attempts: Vec<u32> = events
            .iter()
            .map(|e| match &e.event {
                BridgeEvent::Reconnecting { attempt, .. } => *attempt,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        // Oldest entries were dropped; order of survivors is preserved.
        assert_eq!(attempts, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_poll_zero_wait_never_blocks() {
        let queue = EventQueue::new(10);
        let start = std::time::Instant::now();
        let events = queue.poll(10, 0).await;
        assert!(events.is_empty());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_push() {
        let queue = Arc::new(EventQueue::new(10));
        let poller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.poll(10, 5_000).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(stopped());
        let events = poller.await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let queue = EventQueue::new(10);
        let start = std::time::Instant::now();
        let events = queue.poll(10, 30).await;
        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_poll_respects_max() {
        let queue = EventQueue::new(10);
        for _ in 0..5 {
            queue.push(stopped());
        }
        assert_eq!(queue.poll(2, 0).await.len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_event_serialization_shape() {
        let queue = EventQueue::new(10);
        queue.push(BridgeEvent::DataReceived {
            from_uuid: PeerUuid::new("u1"),
            from_stream_id: Some(StreamId::new("agent_a")),
            data: Some(serde_json::json!({"type": "demo.message", "id": "m1"})),
            data_base64: None,
        });
        let events = queue.poll(1, 0).await;
        let value = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(value["type"], "data_received");
        assert_eq!(value["data"]["id"], "m1");
        assert!(value.get("ts").is_some());
        assert!(value.get("data_base64").is_none());
    }

    #[tokio::test]
    async fn test_bus_no_lost_wakeup() {
        let bus = ProtocolEventBus::new(64);
        let before = bus.cursor();
        // Event arrives before the waiter subscribes.
        bus.publish(
            PeerUuid::new("u1"),
            EnvelopeKind::FileAck,
            serde_json::json!({"seq": 0}),
        );
        let found = bus
            .wait_for(before, Duration::from_millis(100), |ev| {
                ev.kind == EnvelopeKind::FileAck
            })
            .await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_bus_cursor_excludes_earlier_events() {
        let bus = ProtocolEventBus::new(64);
        bus.publish(
            PeerUuid::new("u1"),
            EnvelopeKind::FileAck,
            serde_json::json!({"seq": 0}),
        );
        let after = bus.cursor();
        let found = bus
            .wait_for(after, Duration::from_millis(30), |ev| {
                ev.kind == EnvelopeKind::FileAck
            })
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_bus_fifo_of_arrival() {
        let bus = ProtocolEventBus::new(64);
        let before = bus.cursor();
        bus.publish(PeerUuid::new("u1"), EnvelopeKind::FileAck, serde_json::json!({"seq": 1}));
        bus.publish(PeerUuid::new("u1"), EnvelopeKind::FileAck, serde_json::json!({"seq": 2}));
        let first = bus
            .wait_for(before, Duration::from_millis(100), |ev| {
                ev.kind == EnvelopeKind::FileAck
            })
            .await
            .unwrap();
        assert_eq!(first.payload["seq"], 1);
    }
}
