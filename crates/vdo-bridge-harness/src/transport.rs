//! Fake peer transport
//!
//! Implements the bridge's `PeerTransport` contract against a [`SignalHub`].
//! Every transport instance gets a hub-assigned uuid on creation; join,
//! announce, and data delivery go straight through the hub with no timers
//! or sockets involved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use vdo_bridge_core::errors::{Result, TransportError};
use vdo_bridge_core::transport::{
    DataPayload, PeerTransport, TransportEvent, TransportEventSender,
};
use vdo_bridge_core::types::{PeerUuid, StreamId};

use crate::hub::SignalHub;

/// In-process transport bound to a [`SignalHub`].
pub struct FakeTransport {
    hub: SignalHub,
    uuid: PeerUuid,
    events: Mutex<Option<TransportEventSender>>,
    connected: AtomicBool,
    joined: AtomicBool,
}

impl FakeTransport {
    pub fn new(hub: SignalHub) -> Self {
        let uuid = hub.allocate_uuid();
        Self {
            hub,
            uuid,
            events: Mutex::new(None),
            connected: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        }
    }

    /// The uuid the hub assigned to this transport.
    pub fn uuid(&self) -> &PeerUuid {
        &self.uuid
    }

    fn event_sender(&self) -> Option<TransportEventSender> {
        self.events.lock().expect("event slot poisoned").clone()
    }
}

#[async_trait::async_trait]
impl PeerTransport for FakeTransport {
    fn attach_events(&self, events: TransportEventSender) {
        *self.events.lock().expect("event slot poisoned") = Some(events);
    }

    async fn connect(&self) -> Result<()> {
        if self.event_sender().is_none() {
            return Err(TransportError::ConnectFailed {
                reason: "no event channel attached".into(),
            }
            .into());
        }
        self.connected.store(true, Ordering::SeqCst);
        if let Some(sender) = self.event_sender() {
            let _ = sender.send(TransportEvent::Connected).await;
        }
        Ok(())
    }

    async fn join_room(&self, room: &str, _password: Option<&str>) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected.into());
        }
        let sender = self.event_sender().ok_or(TransportError::NotConnected)?;
        self.hub.join(room, &self.uuid, sender);
        self.joined.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn announce(&self, stream_id: &StreamId, _label: Option<&str>) -> Result<()> {
        if !self.joined.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected.into());
        }
        self.hub.announce(&self.uuid, stream_id).await;
        Ok(())
    }

    async fn view(&self, _target_stream_id: &StreamId, _label: Option<&str>) -> Result<()> {
        // Channels open at announce time in-process; viewing is implicit.
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.joined.store(false, Ordering::SeqCst);
            self.hub.leave(&self.uuid).await;
        }
        Ok(())
    }

    async fn send_data(&self, payload: &DataPayload, target: Option<&PeerUuid>) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected.into());
        }
        self.hub.route(&self.uuid, payload, target).await;
        Ok(())
    }

    async fn send_ping(&self, _uuid: &PeerUuid) -> Result<()> {
        Ok(())
    }

    fn has_open_data_channel(&self, uuid: Option<&PeerUuid>) -> bool {
        self.connected.load(Ordering::SeqCst) && self.hub.channel_open(&self.uuid, uuid)
    }
}
