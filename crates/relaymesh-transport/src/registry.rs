//! Explicit interface registry.
//!
//! Maps a type hash to a constructor plus capability metadata. Populated by
//! the embedding binary at startup and handed to each relay, so there is no
//! process-wide factory and no dependency on initialization order.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{json, Value};

use crate::device::{Channel, Connector, Device, Peripheral, SharedBinderSink};
use crate::{type_hash, TransportError, TypeHash};

pub type ChannelBuilder =
    Box<dyn Fn(&[u8]) -> Result<Box<dyn Channel>, TransportError> + Send + Sync>;
pub type PeripheralBuilder =
    Box<dyn Fn(&[u8]) -> Result<Box<dyn Peripheral>, TransportError> + Send + Sync>;
pub type ConnectorBuilder = Box<
    dyn Fn(&[u8], SharedBinderSink) -> Result<Box<dyn Connector>, TransportError> + Send + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Channel,
    Peripheral,
    Connector,
}

impl InterfaceKind {
    fn section(self) -> &'static str {
        match self {
            InterfaceKind::Channel => "channels",
            InterfaceKind::Peripheral => "peripherals",
            InterfaceKind::Connector => "connectors",
        }
    }
}

enum Builder {
    Channel(ChannelBuilder),
    Peripheral {
        build: PeripheralBuilder,
        connector: TypeHash,
    },
    Connector(ConnectorBuilder),
}

struct Entry {
    name: String,
    capability: Value,
    builder: Builder,
}

impl Entry {
    fn kind(&self) -> InterfaceKind {
        match self.builder {
            Builder::Channel(_) => InterfaceKind::Channel,
            Builder::Peripheral { .. } => InterfaceKind::Peripheral,
            Builder::Connector(_) => InterfaceKind::Connector,
        }
    }
}

/// Type hash → constructor table.
///
/// ```rust
/// use relaymesh_transport::{InterfaceRegistry, MemoryHub};
///
/// let hub = MemoryHub::new();
/// let mut registry = InterfaceRegistry::new();
/// let hash = hub.register(&mut registry);
/// assert!(registry.contains(hash));
/// ```
#[derive(Default)]
pub struct InterfaceRegistry {
    entries: BTreeMap<TypeHash, Entry>,
}

impl fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(h, e)| (h, &e.name)))
            .finish()
    }
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: &str, capability: Value, builder: Builder) -> TypeHash {
        let hash = type_hash(name);
        if let Some(old) = self.entries.get(&hash) {
            tracing::warn!(name, previous = %old.name, "replacing registered interface");
        }
        self.entries.insert(
            hash,
            Entry {
                name: name.to_string(),
                capability,
                builder,
            },
        );
        hash
    }

    pub fn register_channel<F>(&mut self, name: &str, capability: Value, build: F) -> TypeHash
    where
        F: Fn(&[u8]) -> Result<Box<dyn Channel>, TransportError> + Send + Sync + 'static,
    {
        self.insert(name, capability, Builder::Channel(Box::new(build)))
    }

    /// Register a peripheral together with the name of its closure connector.
    pub fn register_peripheral<F>(
        &mut self,
        name: &str,
        connector_name: &str,
        capability: Value,
        build: F,
    ) -> TypeHash
    where
        F: Fn(&[u8]) -> Result<Box<dyn Peripheral>, TransportError> + Send + Sync + 'static,
    {
        self.insert(
            name,
            capability,
            Builder::Peripheral {
                build: Box::new(build),
                connector: type_hash(connector_name),
            },
        )
    }

    pub fn register_connector<F>(&mut self, name: &str, capability: Value, build: F) -> TypeHash
    where
        F: Fn(&[u8], SharedBinderSink) -> Result<Box<dyn Connector>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(name, capability, Builder::Connector(Box::new(build)))
    }

    pub fn contains(&self, hash: TypeHash) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn kind(&self, hash: TypeHash) -> Option<InterfaceKind> {
        self.entries.get(&hash).map(Entry::kind)
    }

    pub fn name(&self, hash: TypeHash) -> Option<&str> {
        self.entries.get(&hash).map(|e| e.name.as_str())
    }

    /// Connector a peripheral type posts its output to.
    pub fn closure_connector(&self, peripheral: TypeHash) -> Option<TypeHash> {
        match self.entries.get(&peripheral)?.builder {
            Builder::Peripheral { connector, .. } => Some(connector),
            _ => None,
        }
    }

    /// Construct a channel or peripheral.
    pub fn build_device(&self, hash: TypeHash, args: &[u8]) -> Result<Device, TransportError> {
        let entry = self
            .entries
            .get(&hash)
            .ok_or(TransportError::UnknownInterface { hash })?;
        match &entry.builder {
            Builder::Channel(build) => Ok(Device::Channel(build(args)?)),
            Builder::Peripheral { build, .. } => Ok(Device::Peripheral(build(args)?)),
            Builder::Connector(_) => Err(TransportError::Construction(format!(
                "{} is a connector, not a device",
                entry.name
            ))),
        }
    }

    pub fn build_connector(
        &self,
        hash: TypeHash,
        args: &[u8],
        sink: SharedBinderSink,
    ) -> Result<Box<dyn Connector>, TransportError> {
        let entry = self
            .entries
            .get(&hash)
            .ok_or(TransportError::UnknownInterface { hash })?;
        match &entry.builder {
            Builder::Connector(build) => build(args, sink),
            _ => Err(TransportError::Construction(format!(
                "{} is not a connector",
                entry.name
            ))),
        }
    }

    /// Capability descriptor of every registered interface, grouped by kind.
    pub fn capability(&self) -> Value {
        let mut out = json!({ "channels": [], "peripherals": [], "connectors": [] });
        for (hash, entry) in &self.entries {
            let mut item = json!({ "type": hash, "name": entry.name });
            if let (Some(item), Some(extra)) = (item.as_object_mut(), entry.capability.as_object())
            {
                for (k, v) in extra {
                    item.insert(k.clone(), v.clone());
                }
            }
            if let Some(list) = out[entry.kind().section()].as_array_mut() {
                list.push(item);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Nop;

    #[async_trait]
    impl Peripheral for Nop {
        async fn on_command_from_connector(&self, _data: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        async fn on_receive_from_peripheral(&self) -> Result<Vec<u8>, TransportError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn unknown_hash_is_reported() {
        let registry = InterfaceRegistry::new();
        let err = registry.build_device(42, &[]).unwrap_err();
        assert!(matches!(err, TransportError::UnknownInterface { hash: 42 }));
    }

    #[test]
    fn peripheral_knows_its_connector() {
        let mut registry = InterfaceRegistry::new();
        let hash = registry.register_peripheral("Echo", "EchoConnector", json!({}), |_| {
            Ok(Box::new(Nop) as Box<dyn Peripheral>)
        });
        assert_eq!(registry.kind(hash), Some(InterfaceKind::Peripheral));
        assert_eq!(
            registry.closure_connector(hash),
            Some(type_hash("EchoConnector"))
        );
        assert!(!registry.build_device(hash, &[]).unwrap().is_channel());
    }

    #[test]
    fn capability_groups_by_kind() {
        let mut registry = InterfaceRegistry::new();
        registry.register_peripheral("Echo", "EchoConnector", json!({"help": "echo"}), |_| {
            Ok(Box::new(Nop) as Box<dyn Peripheral>)
        });
        let cap = registry.capability();
        assert_eq!(cap["peripherals"][0]["name"], "Echo");
        assert_eq!(cap["peripherals"][0]["help"], "echo");
        assert_eq!(cap["peripherals"][0]["type"], type_hash("Echo"));
        assert!(cap["channels"].as_array().unwrap().is_empty());
    }
}
