//! Typed protocol messages.
//!
//! Every packet a relay handles is `[protocol tag:u8][body]`, wrapped on the
//! wire by the broadcast-key envelope (see [`compose_envelope`]). The body
//! layout depends on the protocol:
//!
//! - [`n2n`]: neighbour to neighbour, plaintext header, optional sealed blob
//! - [`s2g`]: relay to Gateway, sealed to the Gateway's public key
//! - [`g2x`]: Gateway to agent (G2A, signed + authenticated box) or to every
//!   relay on the way (G2R, signed only)

pub mod command;
pub mod g2x;
pub mod n2n;
pub mod s2g;

use crate::crypto::{self, SymmetricKey};
use crate::ProtocolError;

/// Protocol tag, the first plaintext byte of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    /// Neighbour to neighbour.
    N2N = 0,
    /// Relay to Gateway.
    S2G = 1,
    /// Gateway to a single agent.
    G2A = 2,
    /// Gateway to every relay on the route.
    G2R = 3,
}

impl TryFrom<u8> for Protocol {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Protocol::N2N),
            1 => Ok(Protocol::S2G),
            2 => Ok(Protocol::G2A),
            3 => Ok(Protocol::G2R),
            other => Err(ProtocolError::Parse(format!("unknown protocol tag {other}"))),
        }
    }
}

/// Read the tag of a decrypted packet.
pub fn protocol_of(packet: &[u8]) -> Result<Protocol, ProtocolError> {
    let tag = packet
        .first()
        .ok_or_else(|| ProtocolError::Parse("empty packet".into()))?;
    Protocol::try_from(*tag)
}

/// Apply the broadcast-key layer to a composed packet.
pub fn compose_envelope(packet: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, ProtocolError> {
    crypto::encrypt_anonymously(packet, key)
}

/// Remove the broadcast-key layer.
pub fn open_envelope(envelope: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, ProtocolError> {
    crypto::decrypt_anonymously(envelope, key)
}

pub(crate) fn with_tag(protocol: Protocol, capacity: usize) -> relaymesh_transport::ByteWriter {
    let mut w = relaymesh_transport::ByteWriter::with_capacity(capacity + 1);
    w.write_u8(protocol as u8);
    w
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_tags_are_stable() {
        assert_eq!(Protocol::N2N as u8, 0);
        assert_eq!(Protocol::S2G as u8, 1);
        assert_eq!(Protocol::G2A as u8, 2);
        assert_eq!(Protocol::G2R as u8, 3);
        assert!(Protocol::try_from(4).is_err());
    }

    #[test]
    fn empty_packet_has_no_protocol() {
        assert!(matches!(protocol_of(&[]), Err(ProtocolError::Parse(_))));
    }

    #[test]
    fn envelope_hides_tag() {
        let key = crypto::generate_symmetric_key();
        let env = compose_envelope(&[Protocol::G2R as u8, 9, 9], &key).unwrap();
        let packet = open_envelope(&env, &key).unwrap();
        assert_eq!(protocol_of(&packet).unwrap(), Protocol::G2R);
    }
}
