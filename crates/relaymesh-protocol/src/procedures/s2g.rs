//! Relay-to-Gateway procedures.
//!
//! Layout: `[S2G] seal_gateway([procedure:u8][sender RouteId][timestamp:i32][fields])`.
//! Intermediate relays cannot read anything past the tag; they forward the
//! packet to their Gateway return channel unchanged.

use relaymesh_transport::{ByteReader, ByteWriter, TypeHash};

use super::{with_tag, Protocol};
use crate::crypto::{self, PrivateKey, PublicKey};
use crate::identifiers::{DeviceId, RouteId};
use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum S2GProcedure {
    InitializeRoute = 0,
    AddDeviceResponse = 1,
    DeliverToBinder = 2,
    NewNegotiatedChannelNotification = 3,
    Notification = 4,
}

impl TryFrom<u8> for S2GProcedure {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(S2GProcedure::InitializeRoute),
            1 => Ok(S2GProcedure::AddDeviceResponse),
            2 => Ok(S2GProcedure::DeliverToBinder),
            3 => Ok(S2GProcedure::NewNegotiatedChannelNotification),
            4 => Ok(S2GProcedure::Notification),
            other => Err(ProtocolError::Parse(format!("unknown S2G procedure {other}"))),
        }
    }
}

const FLAG_CHANNEL: u8 = 1;
const FLAG_NEGOTIATION: u8 = 1 << 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S2GMessage {
    /// A deeper relay joined through the sender.
    InitializeRoute {
        child: RouteId,
        /// Sender's device the child arrived on.
        child_side_device: DeviceId,
        /// The child's sealed join request, untouched.
        blob: Vec<u8>,
    },
    AddDeviceResponse {
        device: DeviceId,
        type_hash: TypeHash,
        is_channel: bool,
        is_negotiation: bool,
    },
    /// Peripheral output for its connector.
    DeliverToBinder {
        peripheral: DeviceId,
        connector: TypeHash,
        data: Vec<u8>,
    },
    NewNegotiatedChannelNotification {
        device: DeviceId,
        negotiator: DeviceId,
        input_id: String,
        output_id: String,
    },
    /// Free-form notification; an empty blob answers a ping.
    Notification { blob: Vec<u8> },
}

impl S2GMessage {
    pub fn procedure(&self) -> S2GProcedure {
        match self {
            S2GMessage::InitializeRoute { .. } => S2GProcedure::InitializeRoute,
            S2GMessage::AddDeviceResponse { .. } => S2GProcedure::AddDeviceResponse,
            S2GMessage::DeliverToBinder { .. } => S2GProcedure::DeliverToBinder,
            S2GMessage::NewNegotiatedChannelNotification { .. } => {
                S2GProcedure::NewNegotiatedChannelNotification
            }
            S2GMessage::Notification { .. } => S2GProcedure::Notification,
        }
    }

    fn write_fields(&self, w: &mut ByteWriter) {
        match self {
            S2GMessage::InitializeRoute {
                child,
                child_side_device,
                blob,
            } => {
                child.write_to(w);
                child_side_device.write_to(w);
                w.write_raw(blob);
            }
            S2GMessage::AddDeviceResponse {
                device,
                type_hash,
                is_channel,
                is_negotiation,
            } => {
                let mut flags = 0;
                if *is_channel {
                    flags |= FLAG_CHANNEL;
                }
                if *is_negotiation {
                    flags |= FLAG_NEGOTIATION;
                }
                device.write_to(w);
                w.write_u32(*type_hash).write_u8(flags);
            }
            S2GMessage::DeliverToBinder {
                peripheral,
                connector,
                data,
            } => {
                peripheral.write_to(w);
                w.write_u32(*connector).write_raw(data);
            }
            S2GMessage::NewNegotiatedChannelNotification {
                device,
                negotiator,
                input_id,
                output_id,
            } => {
                device.write_to(w);
                negotiator.write_to(w);
                w.write_str(input_id).write_str(output_id);
            }
            S2GMessage::Notification { blob } => {
                w.write_bytes(blob);
            }
        }
    }

    fn read_fields(procedure: S2GProcedure, r: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        Ok(match procedure {
            S2GProcedure::InitializeRoute => S2GMessage::InitializeRoute {
                child: RouteId::read_from(r)?,
                child_side_device: DeviceId::read_from(r)?,
                blob: r.rest().to_vec(),
            },
            S2GProcedure::AddDeviceResponse => {
                let device = DeviceId::read_from(r)?;
                let type_hash = r.read_u32()?;
                let flags = r.read_u8()?;
                S2GMessage::AddDeviceResponse {
                    device,
                    type_hash,
                    is_channel: flags & FLAG_CHANNEL != 0,
                    is_negotiation: flags & FLAG_NEGOTIATION != 0,
                }
            }
            S2GProcedure::DeliverToBinder => S2GMessage::DeliverToBinder {
                peripheral: DeviceId::read_from(r)?,
                connector: r.read_u32()?,
                data: r.rest().to_vec(),
            },
            S2GProcedure::NewNegotiatedChannelNotification => {
                S2GMessage::NewNegotiatedChannelNotification {
                    device: DeviceId::read_from(r)?,
                    negotiator: DeviceId::read_from(r)?,
                    input_id: r.read_string()?,
                    output_id: r.read_string()?,
                }
            }
            S2GProcedure::Notification => S2GMessage::Notification {
                blob: r.read_bytes()?.to_vec(),
            },
        })
    }
}

/// One S2G query as seen by the Gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S2GQuery {
    pub sender: RouteId,
    pub timestamp: i32,
    pub message: S2GMessage,
}

impl S2GQuery {
    pub fn new(sender: RouteId, timestamp: i32, message: S2GMessage) -> Self {
        Self {
            sender,
            timestamp,
            message,
        }
    }

    /// Full packet, tag included, sealed for `gateway`.
    pub fn compose(&self, gateway: &PublicKey) -> Result<Vec<u8>, ProtocolError> {
        let mut inner = ByteWriter::new();
        inner.write_u8(self.message.procedure() as u8);
        self.sender.write_to(&mut inner);
        inner.write_i32(self.timestamp);
        self.message.write_fields(&mut inner);
        let sealed = crypto::seal(&inner.into_vec(), gateway)?;

        let mut w = with_tag(Protocol::S2G, sealed.len());
        w.write_raw(&sealed);
        Ok(w.into_vec())
    }

    /// Open a packet, tag included, with the Gateway's keys.
    pub fn open(
        packet: &[u8],
        gateway_public: &PublicKey,
        gateway_private: &PrivateKey,
    ) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(packet);
        let tag = r.read_u8()?;
        if tag != Protocol::S2G as u8 {
            return Err(ProtocolError::Parse(format!("expected S2G tag, got {tag}")));
        }
        let plain = crypto::open_sealed(r.rest(), gateway_public, gateway_private)?;
        let mut r = ByteReader::new(&plain);
        let procedure = S2GProcedure::try_from(r.read_u8()?)?;
        let sender = RouteId::read_from(&mut r)?;
        let timestamp = r.read_i32()?;
        let message = S2GMessage::read_fields(procedure, &mut r)?;
        Ok(Self {
            sender,
            timestamp,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::AgentId;

    fn keys() -> (PrivateKey, PublicKey) {
        crypto::generate_encryption_keys()
    }

    fn sender() -> RouteId {
        RouteId::new(AgentId::new(0xa), DeviceId::new(1))
    }

    #[test]
    fn every_message_opens_at_gateway() {
        let (private, public) = keys();
        let messages = vec![
            S2GMessage::InitializeRoute {
                child: RouteId::new(AgentId::new(0xb), DeviceId::new(0)),
                child_side_device: DeviceId::new(3),
                blob: vec![1, 2, 3],
            },
            S2GMessage::AddDeviceResponse {
                device: DeviceId::new(4),
                type_hash: 0xdead,
                is_channel: true,
                is_negotiation: true,
            },
            S2GMessage::DeliverToBinder {
                peripheral: DeviceId::new(5),
                connector: 9,
                data: b"output".to_vec(),
            },
            S2GMessage::NewNegotiatedChannelNotification {
                device: DeviceId::new(6),
                negotiator: DeviceId::new(0),
                input_id: "in".into(),
                output_id: "out".into(),
            },
            S2GMessage::Notification { blob: Vec::new() },
        ];
        for message in messages {
            let query = S2GQuery::new(sender(), 42, message);
            let packet = query.compose(&public).unwrap();
            assert_eq!(packet[0], Protocol::S2G as u8);
            assert_eq!(S2GQuery::open(&packet, &public, &private).unwrap(), query);
        }
    }

    #[test]
    fn wrapper_hides_child_blob_from_broadcast_key() {
        let (_, public) = keys();
        let broadcast = crypto::generate_symmetric_key();
        let query = S2GQuery::new(
            sender(),
            0,
            S2GMessage::InitializeRoute {
                child: RouteId::NULL,
                child_side_device: DeviceId::new(1),
                blob: b"sealed child request".to_vec(),
            },
        );
        let packet = query.compose(&public).unwrap();
        assert!(crypto::decrypt_anonymously(&packet[1..], &broadcast).is_err());
    }

    #[test]
    fn relay_keys_cannot_open() {
        let (_, public) = keys();
        let (relay_private, relay_public) = keys();
        let packet = S2GQuery::new(sender(), 0, S2GMessage::Notification { blob: vec![7] })
            .compose(&public)
            .unwrap();
        assert!(matches!(
            S2GQuery::open(&packet, &relay_public, &relay_private),
            Err(ProtocolError::Integrity(_))
        ));
    }
}
