//! vdo-bridge harness
//!
//! Deterministic in-process stand-in for the signalling service and the
//! data-channel layer. [`SignalHub`] plays the signalling room; every
//! [`FakeTransport`] created against it implements the bridge's
//! `PeerTransport` contract with in-order, latency-free delivery plus
//! targeted fault injection (dropped ACK envelopes, one-shot chunk
//! corruption). Used by the core crate's scenario tests and by loopback
//! mode in the MCP host.

pub mod hub;
pub mod transport;

pub use hub::{FaultSwitch, SignalHub};
pub use transport::FakeTransport;

use std::sync::Arc;
use vdo_bridge_core::session::BridgeSession;
use vdo_bridge_core::transport::{PeerTransport, TransportFactory};
use vdo_bridge_core::{Result, SessionConfig};

/// Transport factory producing fresh [`FakeTransport`]s on the given hub.
pub fn fake_transport_factory(hub: &SignalHub) -> Arc<dyn TransportFactory> {
    let hub = hub.clone();
    Arc::new(move || -> Box<dyn PeerTransport> { Box::new(FakeTransport::new(hub.clone())) })
}

/// Create and start a session wired to the hub.
pub async fn start_session(hub: &SignalHub, id: &str, config: SessionConfig) -> Result<BridgeSession> {
    let session = BridgeSession::new(id.to_string(), config, fake_transport_factory(hub))?;
    session.start().await?;
    Ok(session)
}
