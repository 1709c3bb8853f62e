//! relaymesh transport layer.
//!
//! Everything a relay needs to move bytes without knowing what they mean:
//! the binary codec, chunk fragmentation ([`QualityOfService`]), the
//! [`Channel`] / [`Peripheral`] / [`Connector`] contracts, the explicit
//! [`InterfaceRegistry`] and an in-process [`MemoryChannel`].
//!
//! # Quick start
//!
//! ```rust
//! use relaymesh_transport::{Channel, MemoryChannel, MemoryHub};
//!
//! # async fn example() -> Result<(), relaymesh_transport::TransportError> {
//! let hub = MemoryHub::new();
//! let left = MemoryChannel::new(hub.clone(), "l", "r");
//! let right = MemoryChannel::new(hub.clone(), "r", "l");
//!
//! left.send(b"hello").await?;
//! assert_eq!(right.receive().await?, vec![b"hello".to_vec()]);
//! # Ok(())
//! # }
//! ```

mod codec;
mod device;
mod error;
mod framing;
mod memory;
pub mod qos;
mod registry;

pub use codec::{ByteReader, ByteWriter};
pub use device::{BinderSink, Channel, Connector, Device, Peripheral, SharedBinderSink};
pub use error::TransportError;
pub use framing::{read_framed, write_framed, DEFAULT_MAX_FRAME_SIZE};
pub use memory::{MemoryChannel, MemoryHub, MEMORY_CHANNEL};
pub use qos::{PacketSplitter, QualityOfService};
pub use registry::{InterfaceKind, InterfaceRegistry};

/// Identifier of an interface type, derived from its registered name.
pub type TypeHash = u32;

/// FNV-1a hash of an interface name.
///
/// Stable across builds and platforms, so hashes can be embedded in
/// configuration and sent over the wire.
pub const fn type_hash(name: &str) -> TypeHash {
    let bytes = name.as_bytes();
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_hash_matches_fnv1a_vectors() {
        assert_eq!(type_hash(""), 0x811c_9dc5);
        assert_eq!(type_hash("a"), 0xe40c_292c);
        assert_eq!(type_hash("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn type_hash_is_const() {
        const H: TypeHash = type_hash(MEMORY_CHANNEL);
        assert_eq!(H, type_hash("MemoryChannel"));
    }
}
