//! Gateway-side connectors and the binder route back to peripherals.

use std::sync::Weak;

use async_trait::async_trait;
use relaymesh_transport::{BinderSink, Connector, TransportError, TypeHash};

use crate::gate::GateRelay;
use crate::identifiers::RouteId;
use crate::ProtocolError;

/// A running connector instance.
pub struct ConnectorBridge {
    type_hash: TypeHash,
    name: String,
    connector: Box<dyn Connector>,
}

impl std::fmt::Debug for ConnectorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorBridge")
            .field("type_hash", &format_args!("{:08x}", self.type_hash))
            .field("name", &self.name)
            .finish()
    }
}

impl ConnectorBridge {
    pub(crate) fn new(type_hash: TypeHash, name: String, connector: Box<dyn Connector>) -> Self {
        Self {
            type_hash,
            name,
            connector,
        }
    }

    pub fn type_hash(&self) -> TypeHash {
        self.type_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Output of the peripheral at `binder`.
    pub async fn deliver(&self, binder: RouteId, data: &[u8]) -> Result<(), ProtocolError> {
        self.connector
            .on_command_from_binder(&binder.to_string(), data)
            .await?;
        Ok(())
    }

    pub async fn run_command(&self, command: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.connector.run_command(command).await?)
    }
}

/// [`BinderSink`] handed to connectors: resolves a binder through the
/// Gateway, locally or as a G2A `DeliverToBinder`.
pub(crate) struct GatewaySink {
    gate: Weak<GateRelay>,
}

impl GatewaySink {
    pub(crate) fn new(gate: Weak<GateRelay>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl BinderSink for GatewaySink {
    async fn post_to_peripheral(&self, binder: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let gate = self.gate.upgrade().ok_or(TransportError::Closed)?;
        let binder: RouteId = binder
            .parse()
            .map_err(|e: ProtocolError| TransportError::Send(e.to_string()))?;
        gate.post_to_peripheral(binder, data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}
