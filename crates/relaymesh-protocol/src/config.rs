//! Relay configuration.
//!
//! [`GatewayConfig`] is read from a JSON file by the gateway daemon,
//! [`GatewayKeys`] lives in its own file next to it, and [`NodeConfig`] is
//! what a node is built with. All of them use the builder style:
//!
//! ```rust
//! use relaymesh_protocol::config::GatewayConfig;
//!
//! let config = GatewayConfig::new()
//!     .name("edge")
//!     .api_bridge_address("127.0.0.1:0");
//! assert_eq!(config.name, "edge");
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use relaymesh_transport::{ByteReader, ByteWriter, TypeHash};
use serde::{Deserialize, Serialize};

use crate::bridge::Jitter;
use crate::crypto::{self, PrivateSignature, PublicSignature, SymmetricKey};
use crate::identifiers::{AgentId, BuildId};
use crate::ProtocolError;

/// Environment variable overriding [`GatewayConfig::api_bridge_address`].
pub const API_BRIDGE_ENV: &str = "RELAYMESH_API_BRIDGE";

const DEFAULT_API_BRIDGE_ADDRESS: &str = "127.0.0.1:7410";

/// A chunk must carry at least one payload byte after its header.
fn check_chunk_limit(limit: Option<usize>) -> Result<Option<usize>, ProtocolError> {
    match limit {
        Some(0) => Err(ProtocolError::Config(
            "chunk_limit must allow at least one payload byte".into(),
        )),
        other => Ok(other),
    }
}

/// Poll interval bounds in milliseconds, as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl JitterConfig {
    pub fn to_jitter(self) -> Result<Jitter, ProtocolError> {
        Jitter::new(
            Duration::from_millis(self.min_ms),
            Duration::from_millis(self.max_ms),
        )
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the operator API bridge listens on.
    pub api_bridge_address: String,
    pub build_id: BuildId,
    /// Fixed agent id; random when absent.
    pub agent_id: Option<AgentId>,
    pub name: String,
    /// Key file, relative to the config file when not absolute.
    pub keys_file: PathBuf,
    pub default_jitter: Option<JitterConfig>,
    /// Cap on the payload of one chunk, on top of what channels accept.
    pub chunk_limit: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_bridge_address: DEFAULT_API_BRIDGE_ADDRESS.to_string(),
            build_id: BuildId::new(1),
            agent_id: None,
            name: "gateway".to_string(),
            keys_file: PathBuf::from("gateway-keys.json"),
            default_jitter: None,
            chunk_limit: None,
        }
    }
}

impl GatewayConfig {
    /// Defaults, then the `RELAYMESH_API_BRIDGE` override.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&text)
            .map_err(|e| ProtocolError::Config(format!("{}: {e}", path.display())))?;
        if config.keys_file.is_relative() {
            if let Some(dir) = path.parent() {
                config.keys_file = dir.join(&config.keys_file);
            }
        }
        config.apply_env();
        config.jitter()?;
        config.checked_chunk_limit()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(address) = std::env::var(API_BRIDGE_ENV) {
            if !address.is_empty() {
                self.api_bridge_address = address;
            }
        }
    }

    pub fn api_bridge_address(mut self, address: impl Into<String>) -> Self {
        self.api_bridge_address = address.into();
        self
    }

    pub fn build_id(mut self, build_id: BuildId) -> Self {
        self.build_id = build_id;
        self
    }

    pub fn agent_id(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn keys_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.keys_file = path.into();
        self
    }

    pub fn default_jitter(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.default_jitter = Some(JitterConfig { min_ms, max_ms });
        self
    }

    pub fn chunk_limit(mut self, bytes: usize) -> Self {
        self.chunk_limit = Some(bytes);
        self
    }

    /// Validated poll interval for newly attached devices.
    pub fn jitter(&self) -> Result<Jitter, ProtocolError> {
        self.default_jitter
            .map(JitterConfig::to_jitter)
            .unwrap_or(Ok(Jitter::DEFAULT))
    }

    /// Payload cap per chunk, rejected when it leaves no room for payload.
    pub fn checked_chunk_limit(&self) -> Result<Option<usize>, ProtocolError> {
        check_chunk_limit(self.chunk_limit)
    }
}

/// The Gateway's long-lived secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayKeys {
    pub signature: PrivateSignature,
    pub public_signature: PublicSignature,
    pub broadcast_key: SymmetricKey,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    private_signature: String,
    public_signature: String,
    broadcast_key: String,
}

impl GatewayKeys {
    pub fn generate() -> Self {
        let (signature, public_signature) = crypto::generate_signature_keys();
        Self {
            signature,
            public_signature,
            broadcast_key: crypto::generate_symmetric_key(),
        }
    }

    /// Load `path`, or generate fresh keys and write them there if it does
    /// not exist. A present but unreadable file is an error.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text)
                .map_err(|e| ProtocolError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keys = Self::generate();
                keys.save(path)?;
                tracing::info!(path = %path.display(), "generated gateway keys");
                Ok(keys)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string_pretty(&KeyFile {
            private_signature: self.signature.to_hex(),
            public_signature: self.public_signature.to_hex(),
            broadcast_key: self.broadcast_key.to_hex(),
        })?)
    }

    fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let file: KeyFile = serde_json::from_str(text)?;
        let keys = Self {
            signature: PrivateSignature::from_hex(&file.private_signature)?,
            public_signature: PublicSignature::from_hex(&file.public_signature)?,
            broadcast_key: SymmetricKey::from_hex(&file.broadcast_key)?,
        };
        if keys.signature.public_signature() != keys.public_signature {
            return Err(ProtocolError::Config(
                "public signature does not match private signature".into(),
            ));
        }
        Ok(keys)
    }
}

// ── Node ────────────────────────────────────────────────────────────

/// A device a node attaches at startup.
///
/// Encoded as `{is_negotiation:bool, type_hash:u32, args}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialDevice {
    pub is_negotiation: bool,
    pub type_hash: TypeHash,
    pub args: Vec<u8>,
}

impl InitialDevice {
    pub fn channel(type_hash: TypeHash, args: Vec<u8>) -> Self {
        Self {
            is_negotiation: false,
            type_hash,
            args,
        }
    }

    /// `args` start with the shared negotiation identifier.
    pub fn negotiation(type_hash: TypeHash, args: Vec<u8>) -> Self {
        Self {
            is_negotiation: true,
            type_hash,
            args,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(5 + self.args.len());
        w.write_bool(self.is_negotiation)
            .write_u32(self.type_hash)
            .write_raw(&self.args);
        w.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            is_negotiation: r.read_bool()?,
            type_hash: r.read_u32()?,
            args: r.rest().to_vec(),
        })
    }
}

/// Everything a node is built with.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub(crate) build_id: BuildId,
    pub(crate) agent_id: AgentId,
    pub(crate) gateway_signature: PublicSignature,
    pub(crate) broadcast_key: SymmetricKey,
    pub(crate) initial_devices: Vec<InitialDevice>,
    pub(crate) default_jitter: Jitter,
    pub(crate) adopt_negotiated_channel: bool,
    pub(crate) chunk_limit: Option<usize>,
}

impl NodeConfig {
    /// A node of a deployment identified by its Gateway's public signature
    /// and broadcast key. Random agent id, default jitter.
    pub fn new(gateway_signature: PublicSignature, broadcast_key: SymmetricKey) -> Self {
        Self {
            build_id: BuildId::new(1),
            agent_id: AgentId::random(),
            gateway_signature,
            broadcast_key,
            initial_devices: Vec::new(),
            default_jitter: Jitter::DEFAULT,
            adopt_negotiated_channel: true,
            chunk_limit: None,
        }
    }

    /// Node config matching an existing Gateway's keys.
    pub fn for_gateway(keys: &GatewayKeys) -> Self {
        Self::new(keys.public_signature.clone(), keys.broadcast_key.clone())
    }

    pub fn build_id(mut self, build_id: BuildId) -> Self {
        self.build_id = build_id;
        self
    }

    pub fn agent_id(mut self, agent_id: AgentId) -> Self {
        self.agent_id = agent_id;
        self
    }

    /// Append a startup device. The first one decides how the node joins.
    pub fn initial_device(mut self, device: InitialDevice) -> Self {
        self.initial_devices.push(device);
        self
    }

    pub fn default_jitter(mut self, jitter: Jitter) -> Self {
        self.default_jitter = jitter;
        self
    }

    /// Whether a freshly negotiated channel replaces the current Gateway
    /// return channel (default: `true`).
    pub fn adopt_negotiated_channel(mut self, adopt: bool) -> Self {
        self.adopt_negotiated_channel = adopt;
        self
    }

    pub fn chunk_limit(mut self, bytes: usize) -> Self {
        self.chunk_limit = Some(bytes);
        self
    }

    pub fn agent(&self) -> AgentId {
        self.agent_id
    }

    pub(crate) fn checked_chunk_limit(&self) -> Result<Option<usize>, ProtocolError> {
        check_chunk_limit(self.chunk_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_fills_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{ "name": "edge", "build_id": "0000002a" }"#).unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.build_id, BuildId::new(0x2a));
        assert_eq!(config.api_bridge_address, DEFAULT_API_BRIDGE_ADDRESS);
        assert_eq!(config.jitter().unwrap(), Jitter::DEFAULT);
    }

    #[test]
    fn gateway_config_rejects_bad_jitter() {
        let config = GatewayConfig::default().default_jitter(5, 10);
        assert!(matches!(config.jitter(), Err(ProtocolError::Config(_))));
    }

    #[test]
    fn zero_chunk_limit_fails_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{ "chunk_limit": 0 }"#).unwrap();
        assert!(matches!(GatewayConfig::load(&path), Err(ProtocolError::Config(_))));

        std::fs::write(&path, r#"{ "chunk_limit": 1 }"#).unwrap();
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.checked_chunk_limit().unwrap(), Some(1));
    }

    #[test]
    fn load_resolves_keys_file_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, r#"{ "keys_file": "keys.json" }"#).unwrap();
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.keys_file, dir.path().join("keys.json"));
    }

    #[test]
    fn malformed_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(GatewayConfig::load(&path), Err(ProtocolError::Config(_))));
    }

    #[test]
    fn keys_are_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("gateway.json");
        let first = GatewayKeys::load_or_generate(&path).unwrap();
        let second = GatewayKeys::load_or_generate(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_key_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, r#"{ "private_signature": "00" }"#).unwrap();
        assert!(matches!(
            GatewayKeys::load_or_generate(&path),
            Err(ProtocolError::Config(_))
        ));
    }

    #[test]
    fn mismatched_key_pair_is_rejected() {
        let a = GatewayKeys::generate();
        let b = GatewayKeys::generate();
        let text = serde_json::to_string(&KeyFile {
            private_signature: a.signature.to_hex(),
            public_signature: b.public_signature.to_hex(),
            broadcast_key: a.broadcast_key.to_hex(),
        })
        .unwrap();
        assert!(GatewayKeys::from_json(&text).is_err());
    }

    #[test]
    fn initial_device_encoding() {
        let device = InitialDevice::negotiation(0x1234, vec![1, 2, 3]);
        let bytes = device.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(InitialDevice::decode(&bytes).unwrap(), device);
    }

    #[test]
    fn node_config_defaults() {
        let keys = GatewayKeys::generate();
        let config = NodeConfig::for_gateway(&keys);
        assert!(config.adopt_negotiated_channel);
        assert!(!config.agent().is_null());
        assert!(config.initial_devices.is_empty());
    }
}
