//! Gateway-originated procedures.
//!
//! - G2A: `[G2A] sign([receiver RouteId] box_gateway→agent([procedure:u8][body]))`
//! - G2R: `[G2R] sign([receiver RouteId][procedure:u8][body])`
//!
//! Any relay can check the signature against the Gateway's public signature
//! and read the receiver; only the receiver can open a G2A body.

use relaymesh_transport::{ByteReader, ByteWriter};

use super::{with_tag, Protocol};
use crate::crypto::{self, PrivateKey, PrivateSignature, PublicKey, PublicSignature};
use crate::identifiers::{DeviceId, RouteId};
use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum G2XProcedure {
    RunCommandOnAgent = 0,
    AddRoute = 1,
    RunCommandOnDevice = 2,
    DeliverToBinder = 3,
}

impl TryFrom<u8> for G2XProcedure {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(G2XProcedure::RunCommandOnAgent),
            1 => Ok(G2XProcedure::AddRoute),
            2 => Ok(G2XProcedure::RunCommandOnDevice),
            3 => Ok(G2XProcedure::DeliverToBinder),
            other => Err(ProtocolError::Parse(format!("unknown G2X procedure {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum G2XMessage {
    /// `command` is `[command id:u16][arguments]`.
    RunCommandOnAgent { command: Vec<u8> },
    /// Reach `route` through `direction` (on the receiver) or through the
    /// route toward the receiver (on every hop before it).
    AddRoute { route: RouteId, direction: DeviceId },
    RunCommandOnDevice { device: DeviceId, command: Vec<u8> },
    /// Connector input for a peripheral.
    DeliverToBinder { device: DeviceId, data: Vec<u8> },
}

impl G2XMessage {
    pub fn procedure(&self) -> G2XProcedure {
        match self {
            G2XMessage::RunCommandOnAgent { .. } => G2XProcedure::RunCommandOnAgent,
            G2XMessage::AddRoute { .. } => G2XProcedure::AddRoute,
            G2XMessage::RunCommandOnDevice { .. } => G2XProcedure::RunCommandOnDevice,
            G2XMessage::DeliverToBinder { .. } => G2XProcedure::DeliverToBinder,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u8(self.procedure() as u8);
        match self {
            G2XMessage::RunCommandOnAgent { command } => {
                w.write_raw(command);
            }
            G2XMessage::AddRoute { route, direction } => {
                route.write_to(&mut w);
                direction.write_to(&mut w);
            }
            G2XMessage::RunCommandOnDevice { device, command } => {
                device.write_to(&mut w);
                w.write_raw(command);
            }
            G2XMessage::DeliverToBinder { device, data } => {
                device.write_to(&mut w);
                w.write_raw(data);
            }
        }
        w.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(bytes);
        Ok(match G2XProcedure::try_from(r.read_u8()?)? {
            G2XProcedure::RunCommandOnAgent => G2XMessage::RunCommandOnAgent {
                command: r.rest().to_vec(),
            },
            G2XProcedure::AddRoute => G2XMessage::AddRoute {
                route: RouteId::read_from(&mut r)?,
                direction: DeviceId::read_from(&mut r)?,
            },
            G2XProcedure::RunCommandOnDevice => G2XMessage::RunCommandOnDevice {
                device: DeviceId::read_from(&mut r)?,
                command: r.rest().to_vec(),
            },
            G2XProcedure::DeliverToBinder => G2XMessage::DeliverToBinder {
                device: DeviceId::read_from(&mut r)?,
                data: r.rest().to_vec(),
            },
        })
    }
}

fn signed_packet(protocol: Protocol, inner: Vec<u8>, signature: &PrivateSignature) -> Vec<u8> {
    let signed = crypto::sign_message(&inner, signature);
    let mut w = with_tag(protocol, signed.len());
    w.write_raw(&signed);
    w.into_vec()
}

/// G2A packet for the agent owning `agent_key`.
pub fn compose_g2a(
    receiver: RouteId,
    message: &G2XMessage,
    signature: &PrivateSignature,
    agent_key: &PublicKey,
    gateway_private: &PrivateKey,
) -> Result<Vec<u8>, ProtocolError> {
    let boxed = crypto::encrypt_and_authenticate(&message.encode(), agent_key, gateway_private)?;
    let mut inner = ByteWriter::with_capacity(RouteId::BINARY_SIZE + boxed.len());
    receiver.write_to(&mut inner);
    inner.write_raw(&boxed);
    Ok(signed_packet(Protocol::G2A, inner.into_vec(), signature))
}

/// G2R packet, readable by every relay on the route.
pub fn compose_g2r(receiver: RouteId, message: &G2XMessage, signature: &PrivateSignature) -> Vec<u8> {
    let encoded = message.encode();
    let mut inner = ByteWriter::with_capacity(RouteId::BINARY_SIZE + encoded.len());
    receiver.write_to(&mut inner);
    inner.write_raw(&encoded);
    signed_packet(Protocol::G2R, inner.into_vec(), signature)
}

/// Verified G2A/G2R packet: the receiver plus the still opaque remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedG2X {
    pub protocol: Protocol,
    pub receiver: RouteId,
    pub payload: Vec<u8>,
}

impl VerifiedG2X {
    /// Check the Gateway signature of a full packet, tag included.
    pub fn verify(packet: &[u8], gateway: &PublicSignature) -> Result<Self, ProtocolError> {
        let protocol = super::protocol_of(packet)?;
        if !matches!(protocol, Protocol::G2A | Protocol::G2R) {
            return Err(ProtocolError::Parse(format!(
                "expected G2A or G2R, got {protocol:?}"
            )));
        }
        let verified = crypto::verify_message(&packet[1..], gateway)?;
        let mut r = ByteReader::new(&verified);
        let receiver = RouteId::read_from(&mut r)?;
        Ok(Self {
            protocol,
            receiver,
            payload: r.rest().to_vec(),
        })
    }

    /// Decode the payload of a G2R packet.
    pub fn message(&self) -> Result<G2XMessage, ProtocolError> {
        G2XMessage::decode(&self.payload)
    }

    /// Open the payload of a G2A packet addressed to us.
    pub fn open(
        &self,
        gateway_key: &PublicKey,
        own_private: &PrivateKey,
    ) -> Result<G2XMessage, ProtocolError> {
        let plain = crypto::decrypt_and_authenticate(&self.payload, gateway_key, own_private)?;
        G2XMessage::decode(&plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::AgentId;

    struct Gateway {
        signature: PrivateSignature,
        public_signature: PublicSignature,
    }

    fn gateway() -> Gateway {
        let (signature, public_signature) = crypto::generate_signature_keys();
        Gateway {
            signature,
            public_signature,
        }
    }

    fn receiver() -> RouteId {
        RouteId::new(AgentId::new(0x77), DeviceId::new(1))
    }

    #[test]
    fn g2a_opens_only_for_receiver() {
        let gw = gateway();
        let (agent_private, agent_public) = crypto::generate_encryption_keys();
        let message = G2XMessage::RunCommandOnDevice {
            device: DeviceId::new(3),
            command: vec![0xff, 0xff],
        };
        let packet = compose_g2a(
            receiver(),
            &message,
            &gw.signature,
            &agent_public,
            &gw.signature.to_encryption_key(),
        )
        .unwrap();

        let verified = VerifiedG2X::verify(&packet, &gw.public_signature).unwrap();
        assert_eq!(verified.protocol, Protocol::G2A);
        assert_eq!(verified.receiver, receiver());
        let gateway_key = gw.public_signature.to_encryption_key().unwrap();
        assert_eq!(verified.open(&gateway_key, &agent_private).unwrap(), message);

        let (other_private, _) = crypto::generate_encryption_keys();
        assert!(verified.open(&gateway_key, &other_private).is_err());
    }

    #[test]
    fn g2r_is_readable_on_every_hop() {
        let gw = gateway();
        let message = G2XMessage::AddRoute {
            route: RouteId::new(AgentId::new(0x99), DeviceId::new(0)),
            direction: DeviceId::new(4),
        };
        let packet = compose_g2r(receiver(), &message, &gw.signature);
        let verified = VerifiedG2X::verify(&packet, &gw.public_signature).unwrap();
        assert_eq!(verified.protocol, Protocol::G2R);
        assert_eq!(verified.message().unwrap(), message);
    }

    #[test]
    fn forged_packet_fails_verification() {
        let gw = gateway();
        let impostor = gateway();
        let message = G2XMessage::RunCommandOnAgent {
            command: vec![0xff, 0xff],
        };
        let packet = compose_g2r(receiver(), &message, &impostor.signature);
        assert!(matches!(
            VerifiedG2X::verify(&packet, &gw.public_signature),
            Err(ProtocolError::Integrity(_))
        ));
    }

    #[test]
    fn message_encoding_roundtrip() {
        let messages = [
            G2XMessage::RunCommandOnAgent { command: vec![1, 0] },
            G2XMessage::DeliverToBinder {
                device: DeviceId::new(2),
                data: b"input".to_vec(),
            },
        ];
        for m in messages {
            assert_eq!(G2XMessage::decode(&m.encode()).unwrap(), m);
        }
    }
}
