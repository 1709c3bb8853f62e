//! relaymesh protocol layer.
//!
//! An encrypted multi-hop overlay on top of `relaymesh-transport`: relays
//! attach devices, wrap every packet in a broadcast-key envelope, dispatch
//! by protocol tag and forward along per-relay routing tables towards a
//! single trusted Gateway.
//!
//! Crypto: X25519 + Ed25519 + XChaCha20-Poly1305, HKDF-SHA256 derivations.
//! Wire format: little-endian fixed fields, u32 length-prefixed blobs.

pub mod api_bridge;
pub mod bridge;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod distributor;
pub mod error;
pub mod gate;
pub mod host;
pub mod identifiers;
pub mod node;
pub mod operator;
pub mod procedures;
pub mod relay;

pub use api_bridge::ApiBridge;
pub use bridge::{BridgeOwner, ChannelIds, DeviceBridge, Jitter, NegotiationRole};
pub use config::{GatewayConfig, GatewayKeys, InitialDevice, JitterConfig, NodeConfig};
pub use connector::ConnectorBridge;
pub use distributor::{Distributor, ProtocolHandler};
pub use error::ProtocolError;
pub use gate::{AgentRecord, DeviceRecord, GateRelay};
pub use host::HostInfo;
pub use identifiers::{AgentId, BuildId, DeviceId, RouteId};
pub use node::NodeRelay;
pub use operator::{CommandSpec, DeviceArgument, OperatorAction};
pub use procedures::Protocol;
pub use relay::{RelayCore, Route};
