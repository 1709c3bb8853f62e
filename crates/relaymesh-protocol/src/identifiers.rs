//! Fixed-width identifiers.
//!
//! Text form is zero-padded lowercase hex, binary form little-endian.
//! Zero is the distinguished "unset" value.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use relaymesh_transport::{ByteReader, ByteWriter};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $int:ty, $write:ident, $read:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name($int);

        impl $name {
            /// The "unset" value.
            pub const NULL: Self = Self(0);
            /// Encoded size in bytes.
            pub const BINARY_SIZE: usize = std::mem::size_of::<$int>();

            pub const fn new(value: $int) -> Self {
                Self(value)
            }

            pub const fn value(self) -> $int {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            pub fn write_to(self, writer: &mut ByteWriter) {
                writer.$write(self.0);
            }

            pub fn read_from(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
                Ok(Self(reader.$read()?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:0width$x}", self.0, width = Self::BINARY_SIZE * 2)
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() || s.len() > Self::BINARY_SIZE * 2 {
                    return Err(ProtocolError::Parse(format!(
                        "invalid {} text: {s:?}",
                        stringify!($name)
                    )));
                }
                <$int>::from_str_radix(s, 16).map(Self).map_err(|e| {
                    ProtocolError::Parse(format!("invalid {} text {s:?}: {e}", stringify!($name)))
                })
            }
        }

        impl From<$int> for $name {
            fn from(v: $int) -> Self {
                Self(v)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

identifier!(
    /// Per-relay device identifier.
    DeviceId, u16, write_u16, read_u16
);
identifier!(
    /// Network-wide relay identifier.
    AgentId, u64, write_u64, read_u64
);
identifier!(
    /// Identifier of the build a relay was produced from.
    BuildId, u32, write_u32, read_u32
);

impl AgentId {
    /// Random, never null.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        loop {
            let v: u64 = rng.random();
            if v != 0 {
                return Self(v);
            }
        }
    }
}

impl BuildId {
    /// Random, never null.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        loop {
            let v: u32 = rng.random();
            if v != 0 {
                return Self(v);
            }
        }
    }
}

/// Destination agent plus the device on that agent.
///
/// Used both as a routing-table key and as the final address of a message.
/// Text form is `"<agent>:<device>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RouteId {
    agent: AgentId,
    device: DeviceId,
}

impl RouteId {
    pub const NULL: Self = Self {
        agent: AgentId::NULL,
        device: DeviceId::NULL,
    };
    pub const BINARY_SIZE: usize = AgentId::BINARY_SIZE + DeviceId::BINARY_SIZE;

    pub const fn new(agent: AgentId, device: DeviceId) -> Self {
        Self { agent, device }
    }

    pub const fn agent(self) -> AgentId {
        self.agent
    }

    pub const fn device(self) -> DeviceId {
        self.device
    }

    pub const fn is_null(self) -> bool {
        self.agent.is_null() && self.device.is_null()
    }

    pub fn write_to(self, writer: &mut ByteWriter) {
        self.agent.write_to(writer);
        self.device.write_to(writer);
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> Result<Self, ProtocolError> {
        let agent = AgentId::read_from(reader)?;
        let device = DeviceId::read_from(reader)?;
        Ok(Self { agent, device })
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(Self::BINARY_SIZE);
        self.write_to(&mut w);
        w.into_vec()
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.agent, self.device)
    }
}

impl FromStr for RouteId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (agent, device) = s
            .split_once(':')
            .ok_or_else(|| ProtocolError::Parse(format!("invalid RouteId text: {s:?}")))?;
        Ok(Self {
            agent: agent.parse()?,
            device: device.parse()?,
        })
    }
}

impl Serialize for RouteId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RouteId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Random alphanumeric string, used for freshly negotiated channel identifiers.
pub fn random_identifier(len: usize) -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Seconds since the Unix epoch, truncated to the wire width.
pub fn timestamp_now() -> i32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0)
}
