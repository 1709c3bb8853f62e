//! Contracts implemented by pluggable interfaces.
//!
//! A relay drives two kinds of devices: a [`Channel`] moves opaque bytes
//! between relays, a [`Peripheral`] executes work on the relay's host and
//! talks to a Gateway-side [`Connector`]. All calls are made from the
//! owning device task, except `send` which may come from any task but is
//! serialized by the caller.

use std::sync::Arc;

use async_trait::async_trait;

use crate::TransportError;

/// Byte transport between two relays.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Push one chunk. Returns how many bytes the carrier accepted, which may
    /// be fewer than `data.len()`.
    async fn send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Drain whatever the carrier has buffered since the last call.
    async fn receive(&self) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Device-specific command. Most channels have none.
    async fn run_command(&self, _command: &[u8]) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported)
    }
}

/// Task executor bound to a Connector on the Gateway.
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Input coming from the connector.
    async fn on_command_from_connector(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Output waiting for the connector. Empty when there is nothing to report.
    async fn on_receive_from_peripheral(&self) -> Result<Vec<u8>, TransportError>;

    async fn run_command(&self, _command: &[u8]) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported)
    }
}

/// Route back to a peripheral, handed to connectors.
///
/// `binder` is the text form of the peripheral's route id (`"agent:device"`).
#[async_trait]
pub trait BinderSink: Send + Sync {
    async fn post_to_peripheral(&self, binder: &str, data: Vec<u8>) -> Result<(), TransportError>;
}

/// Gateway-side endpoint that talks to every peripheral of one type.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Output of the peripheral identified by `binder`.
    async fn on_command_from_binder(&self, binder: &str, data: &[u8]) -> Result<(), TransportError>;

    async fn run_command(&self, _command: &[u8]) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported)
    }
}

/// A constructed device, ready to be attached to a relay.
pub enum Device {
    Channel(Box<dyn Channel>),
    Peripheral(Box<dyn Peripheral>),
}

impl Device {
    pub fn is_channel(&self) -> bool {
        matches!(self, Device::Channel(_))
    }

    pub async fn run_command(&self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        match self {
            Device::Channel(c) => c.run_command(command).await,
            Device::Peripheral(p) => p.run_command(command).await,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Channel(_) => f.write_str("Device::Channel"),
            Device::Peripheral(_) => f.write_str("Device::Peripheral"),
        }
    }
}

/// Shared handle passed to connector builders.
pub type SharedBinderSink = Arc<dyn BinderSink>;
