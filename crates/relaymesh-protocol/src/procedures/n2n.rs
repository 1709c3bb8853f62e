//! Neighbour-to-neighbour procedures: join and channel negotiation.
//!
//! Layout: `[N2N][sender RouteId][procedure:u8][query]`.

use relaymesh_transport::{ByteReader, ByteWriter, TypeHash};

use super::{with_tag, Protocol};
use crate::crypto::{self, PrivateKey, PublicKey};
use crate::host::HostInfo;
use crate::identifiers::{BuildId, RouteId};
use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum N2NProcedure {
    InitializeRoute = 0,
    ChannelIdExchangeStep1 = 2,
    ChannelIdExchangeStep2 = 3,
}

impl TryFrom<u8> for N2NProcedure {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(N2NProcedure::InitializeRoute),
            2 => Ok(N2NProcedure::ChannelIdExchangeStep1),
            3 => Ok(N2NProcedure::ChannelIdExchangeStep2),
            other => Err(ProtocolError::Parse(format!("unknown N2N procedure {other}"))),
        }
    }
}

/// Parsed N2N header plus the procedure-specific query bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N2NQuery<'a> {
    pub sender: RouteId,
    pub procedure: N2NProcedure,
    pub query: &'a [u8],
}

impl<'a> N2NQuery<'a> {
    pub fn parse(packet: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(packet);
        let tag = r.read_u8()?;
        if tag != Protocol::N2N as u8 {
            return Err(ProtocolError::Parse(format!("expected N2N tag, got {tag}")));
        }
        let sender = RouteId::read_from(&mut r)?;
        let procedure = N2NProcedure::try_from(r.read_u8()?)?;
        Ok(Self {
            sender,
            procedure,
            query: r.rest(),
        })
    }

    /// Identifier carried by either channel-id exchange step.
    pub fn channel_id(&self) -> Result<String, ProtocolError> {
        Ok(ByteReader::new(self.query).read_string()?)
    }
}

fn compose(sender: RouteId, procedure: N2NProcedure, query: &[u8]) -> Vec<u8> {
    let mut w = with_tag(Protocol::N2N, RouteId::BINARY_SIZE + 1 + query.len());
    sender.write_to(&mut w);
    w.write_u8(procedure as u8).write_raw(query);
    w.into_vec()
}

/// Join request, readable only by the Gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub build_id: BuildId,
    /// Key the Gateway uses to box commands for the joining agent.
    pub public_key: PublicKey,
    /// Type of the channel the agent joined over.
    pub type_hash: TypeHash,
    pub last_seen: i32,
    pub host_info: HostInfo,
}

impl JoinRequest {
    pub fn seal(&self, gateway: &PublicKey) -> Result<Vec<u8>, ProtocolError> {
        let mut w = ByteWriter::new();
        self.build_id.write_to(&mut w);
        w.write_bytes(self.public_key.as_bytes())
            .write_u32(self.type_hash)
            .write_i32(self.last_seen)
            .write_bytes(&self.host_info.to_bytes()?);
        crypto::seal(&w.into_vec(), gateway)
    }

    pub fn open(
        blob: &[u8],
        gateway_public: &PublicKey,
        gateway_private: &PrivateKey,
    ) -> Result<Self, ProtocolError> {
        let plain = crypto::open_sealed(blob, gateway_public, gateway_private)?;
        let mut r = ByteReader::new(&plain);
        Ok(Self {
            build_id: BuildId::read_from(&mut r)?,
            public_key: PublicKey::from_slice(r.read_bytes()?)?,
            type_hash: r.read_u32()?,
            last_seen: r.read_i32()?,
            host_info: HostInfo::from_bytes(r.read_bytes()?)?,
        })
    }
}

/// `InitializeRoute` carrying an already sealed [`JoinRequest`].
pub fn initialize_route(sender: RouteId, sealed_request: &[u8]) -> Vec<u8> {
    compose(sender, N2NProcedure::InitializeRoute, sealed_request)
}

pub fn channel_id_exchange_step1(sender: RouteId, output_id: &str) -> Vec<u8> {
    let mut q = ByteWriter::new();
    q.write_str(output_id);
    compose(sender, N2NProcedure::ChannelIdExchangeStep1, &q.into_vec())
}

pub fn channel_id_exchange_step2(sender: RouteId, input_id: &str) -> Vec<u8> {
    let mut q = ByteWriter::new();
    q.write_str(input_id);
    compose(sender, N2NProcedure::ChannelIdExchangeStep2, &q.into_vec())
}
