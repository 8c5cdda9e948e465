//! Peer transport abstraction
//!
//! [`PeerTransport`] is the seam between a bridge session and whatever moves
//! bytes between peers: a real WebRTC SDK adapter in production, the
//! in-process hub from `vdo-bridge-harness` in tests and loopback mode.
//! Concrete implementations live outside this crate.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::types::{PeerUuid, StreamId};

// ----------------------------------------------------------------------------
// Data Payload
// ----------------------------------------------------------------------------

/// What a data channel carries: raw bytes, or an already-decoded structured
/// object with string keys.
#[derive(Debug, Clone)]
pub enum DataPayload {
    Binary(Vec<u8>),
    Structured(Value),
}

impl DataPayload {
    pub fn structured(value: Value) -> Self {
        DataPayload::Structured(value)
    }

    /// The structured object, if this payload is one.
    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            DataPayload::Structured(value) => Some(value),
            DataPayload::Binary(_) => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Asynchronous events a transport surfaces to its owning session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Signalling channel established.
    Connected,
    /// Signalling channel lost.
    Disconnected { reason: Option<String> },
    /// Connection attempt failed outright.
    ConnectionFailed { detail: String },
    /// Transport-internal error worth surfacing.
    Error { detail: String },
    PeerConnected {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
    },
    PeerDisconnected {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
    },
    DataChannelOpen {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
    },
    DataChannelClose {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
    },
    DataReceived {
        uuid: PeerUuid,
        stream_id: Option<StreamId>,
        data: DataPayload,
        /// Delivered over a fallback path rather than an open channel.
        fallback: bool,
    },
}

/// Sender half handed to a transport at attach time.
pub type TransportEventSender = mpsc::Sender<TransportEvent>;
/// Receiver half consumed by the session dispatcher.
pub type TransportEventReceiver = mpsc::Receiver<TransportEvent>;

/// Buffer size for the transport event channel.
pub const TRANSPORT_EVENT_BUFFER: usize = 256;

/// Create the transport event channel pair.
pub fn transport_event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::channel(TRANSPORT_EVENT_BUFFER)
}

// ----------------------------------------------------------------------------
// Peer Transport Trait
// ----------------------------------------------------------------------------

/// Adapter over a peer-to-peer SDK.
///
/// A session drives the transport through the connect/join/announce/view
/// sequence on start, and receives [`TransportEvent`]s through the channel
/// attached beforehand. All methods take `&self`: implementations manage
/// their own interior state and must tolerate `disconnect` being called more
/// than once.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach the event channel. Called exactly once, before `connect`.
    fn attach_events(&self, events: TransportEventSender);

    /// Open the signalling channel.
    async fn connect(&self) -> Result<()>;

    /// Join a named room, optionally password-protected.
    async fn join_room(&self, room: &str, password: Option<&str>) -> Result<()>;

    /// Announce the local stream to the room.
    async fn announce(&self, stream_id: &StreamId, label: Option<&str>) -> Result<()>;

    /// Request to view a remote stream (data-only; no media).
    async fn view(&self, target_stream_id: &StreamId, label: Option<&str>) -> Result<()>;

    /// Tear down; idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Send a payload to one peer, or broadcast when `target` is `None`.
    async fn send_data(&self, payload: &DataPayload, target: Option<&PeerUuid>) -> Result<()>;

    /// Best-effort transport-level ping.
    async fn send_ping(&self, uuid: &PeerUuid) -> Result<()>;

    /// True iff at least one data channel to `uuid` (or to any peer when
    /// `None`) is open.
    fn has_open_data_channel(&self, uuid: Option<&PeerUuid>) -> bool;
}

/// Builds a fresh transport for each connection attempt; reconnects rebuild
/// the transport from scratch rather than reusing a torn-down one.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn PeerTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Box<dyn PeerTransport> + Send + Sync,
{
    fn create(&self) -> Box<dyn PeerTransport> {
        self()
    }
}
