//! Envelope opening and protocol dispatch.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::DeviceBridge;
use crate::crypto::SymmetricKey;
use crate::procedures::{self, Protocol};
use crate::ProtocolError;

/// Per-protocol handlers of a relay.
///
/// Every method receives the full decrypted packet, tag included, and the
/// bridge it arrived on.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn on_n2n(&self, packet: &[u8], sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError>;
    async fn on_s2g(&self, packet: &[u8], sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError>;
    async fn on_g2a(&self, packet: &[u8], sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError>;
    async fn on_g2r(&self, packet: &[u8], sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError>;
}

/// Holds the deployment's broadcast key.
#[derive(Debug, Clone)]
pub struct Distributor {
    broadcast_key: SymmetricKey,
}

impl Distributor {
    pub fn new(broadcast_key: SymmetricKey) -> Self {
        Self { broadcast_key }
    }

    /// Apply the envelope layer to an outgoing packet.
    pub fn wrap(&self, packet: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        procedures::compose_envelope(packet, &self.broadcast_key)
    }

    /// Open `envelope` and hand it to the matching handler.
    pub async fn try_dispatch<H>(
        &self,
        handler: &H,
        envelope: &[u8],
        sender: &Arc<DeviceBridge>,
    ) -> Result<(), ProtocolError>
    where
        H: ProtocolHandler + ?Sized,
    {
        if envelope.is_empty() {
            return Err(ProtocolError::Parse("empty envelope".into()));
        }
        let packet = procedures::open_envelope(envelope, &self.broadcast_key)?;
        match procedures::protocol_of(&packet)? {
            Protocol::N2N => handler.on_n2n(&packet, sender).await,
            Protocol::S2G => handler.on_s2g(&packet, sender).await,
            Protocol::G2A => handler.on_g2a(&packet, sender).await,
            Protocol::G2R => handler.on_g2r(&packet, sender).await,
        }
    }

    /// Like [`try_dispatch`](Self::try_dispatch), but failures end here:
    /// one log event tagged with the sender, then the packet is dropped.
    pub async fn dispatch<H>(&self, handler: &H, envelope: &[u8], sender: &Arc<DeviceBridge>)
    where
        H: ProtocolHandler + ?Sized,
    {
        if let Err(e) = self.try_dispatch(handler, envelope, sender).await {
            e.report("dropped packet", Some(sender.did()));
        }
    }
}
