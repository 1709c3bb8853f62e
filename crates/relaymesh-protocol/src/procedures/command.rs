//! Remote commands run on a relay or on one of its devices.
//!
//! A command is `[id:u16][arguments]`. Relay-level ids grow down from
//! `0xFFFF`; `0` is `AddDevice`. Anything a relay does not recognise on a
//! device is passed to the device's own `run_command` untouched.

use relaymesh_transport::{ByteReader, ByteWriter, TypeHash};

use crate::identifiers::{DeviceId, RouteId};
use crate::ProtocolError;

/// Smallest accepted jitter bound, in seconds.
pub const MIN_JITTER_SECONDS: f32 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    AddDevice = 0,
    Close = 0xFFFF,
    UpdateJitter = 0xFFFE,
    CreateRoute = 0xFFFD,
    RemoveRoute = 0xFFFC,
    SetGrc = 0xFFFB,
    Ping = 0xFFFA,
    ClearNetwork = 0xFFF9,
}

impl TryFrom<u16> for Command {
    type Error = ProtocolError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Command::AddDevice),
            0xFFFF => Ok(Command::Close),
            0xFFFE => Ok(Command::UpdateJitter),
            0xFFFD => Ok(Command::CreateRoute),
            0xFFFC => Ok(Command::RemoveRoute),
            0xFFFB => Ok(Command::SetGrc),
            0xFFFA => Ok(Command::Ping),
            0xFFF9 => Ok(Command::ClearNetwork),
            other => Err(ProtocolError::Parse(format!("unknown command {other:#06x}"))),
        }
    }
}

/// Split a command into its raw id and argument bytes.
pub fn split(command: &[u8]) -> Result<(u16, &[u8]), ProtocolError> {
    let mut r = ByteReader::new(command);
    let id = r.read_u16()?;
    Ok((id, r.rest()))
}

fn with_id(command: Command) -> ByteWriter {
    let mut w = ByteWriter::new();
    w.write_u16(command as u16);
    w
}

// ── Builders ──

pub fn add_device(device: DeviceId, is_negotiation: bool, type_hash: TypeHash, args: &[u8]) -> Vec<u8> {
    let mut w = with_id(Command::AddDevice);
    device.write_to(&mut w);
    w.write_bool(is_negotiation).write_u32(type_hash).write_raw(args);
    w.into_vec()
}

pub fn close() -> Vec<u8> {
    with_id(Command::Close).into_vec()
}

pub fn update_jitter(min: f32, max: f32) -> Vec<u8> {
    let mut w = with_id(Command::UpdateJitter);
    w.write_f32(min).write_f32(max);
    w.into_vec()
}

pub fn create_route(route: RouteId, device: DeviceId, is_neighbour: bool) -> Vec<u8> {
    let mut w = with_id(Command::CreateRoute);
    w.write_str(&route.to_string())
        .write_str(&device.to_string())
        .write_bool(is_neighbour);
    w.into_vec()
}

pub fn remove_route(route: RouteId) -> Vec<u8> {
    let mut w = with_id(Command::RemoveRoute);
    w.write_str(&route.to_string());
    w.into_vec()
}

pub fn set_grc(device: DeviceId) -> Vec<u8> {
    let mut w = with_id(Command::SetGrc);
    w.write_str(&device.to_string());
    w.into_vec()
}

pub fn ping() -> Vec<u8> {
    with_id(Command::Ping).into_vec()
}

pub fn clear_network() -> Vec<u8> {
    with_id(Command::ClearNetwork).into_vec()
}

// ── Parsed arguments ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddDeviceArgs {
    pub device: DeviceId,
    pub is_negotiation: bool,
    pub type_hash: TypeHash,
    pub args: Vec<u8>,
}

impl AddDeviceArgs {
    pub fn parse(args: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(args);
        Ok(Self {
            device: DeviceId::read_from(&mut r)?,
            is_negotiation: r.read_bool()?,
            type_hash: r.read_u32()?,
            args: r.rest().to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterArgs {
    pub min: f32,
    pub max: f32,
}

impl JitterArgs {
    pub fn parse(args: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(args);
        let min = r.read_f32()?;
        let max = r.read_f32()?;
        if !(min >= MIN_JITTER_SECONDS && min <= max) {
            return Err(ProtocolError::Parse(format!(
                "invalid jitter [{min}, {max}]"
            )));
        }
        Ok(Self { min, max })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateRouteArgs {
    pub route: RouteId,
    pub device: DeviceId,
    pub is_neighbour: bool,
}

impl CreateRouteArgs {
    pub fn parse(args: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(args);
        let route = r.read_string()?.parse()?;
        let device = r.read_string()?.parse()?;
        // Older senders omit the flag.
        let is_neighbour = if r.is_empty() { false } else { r.read_bool()? };
        Ok(Self {
            route,
            device,
            is_neighbour,
        })
    }
}

pub fn parse_route(args: &[u8]) -> Result<RouteId, ProtocolError> {
    ByteReader::new(args).read_string()?.parse()
}

pub fn parse_device(args: &[u8]) -> Result<DeviceId, ProtocolError> {
    ByteReader::new(args).read_string()?.parse()
}
