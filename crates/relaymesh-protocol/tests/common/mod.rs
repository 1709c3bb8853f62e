//! Shared fixtures: a memory-channel registry, a Gateway and node builders.

#![allow(dead_code, unused_macros)]

use std::sync::Arc;
use std::time::Duration;

use relaymesh_protocol::{
    AgentId, GateRelay, GatewayConfig, GatewayKeys, InitialDevice, Jitter, NodeConfig, NodeRelay,
};
use relaymesh_transport::{ByteWriter, InterfaceRegistry, MemoryHub, TypeHash};

/// Poll `$cond` until it holds, failing the test after five seconds.
macro_rules! wait_until {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }};
}

pub const GATEWAY: AgentId = AgentId::new(0x6a7e);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

pub fn fast_jitter() -> Jitter {
    Jitter::new(Duration::from_millis(30), Duration::from_millis(35)).unwrap()
}

/// Memory channel arguments `{inbound, outbound}`.
pub fn link(inbound: &str, outbound: &str) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_str(inbound).write_str(outbound);
    w.into_vec()
}

/// Negotiation arguments `{seed}` for a memory channel.
pub fn seed(seed: &str) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_str(seed);
    w.into_vec()
}

pub struct Mesh {
    pub hub: MemoryHub,
    pub memory: TypeHash,
    pub keys: GatewayKeys,
    pub registry: Arc<InterfaceRegistry>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::with_registry(InterfaceRegistry::new())
    }

    /// Add the memory channel to a registry the test already filled.
    pub fn with_registry(mut registry: InterfaceRegistry) -> Self {
        let hub = MemoryHub::new();
        let memory = hub.register(&mut registry);
        Self {
            hub,
            memory,
            keys: GatewayKeys::generate(),
            registry: Arc::new(registry),
        }
    }

    pub fn gateway(&self) -> Arc<GateRelay> {
        let config = GatewayConfig::default()
            .agent_id(GATEWAY)
            .default_jitter(30, 35)
            .name("test-gateway");
        GateRelay::new(&config, &self.keys, self.registry.clone()).unwrap()
    }

    pub fn node_config(&self, agent: AgentId) -> NodeConfig {
        NodeConfig::for_gateway(&self.keys)
            .agent_id(agent)
            .default_jitter(fast_jitter())
    }

    /// Node joining over a plain memory channel.
    pub async fn node(&self, agent: AgentId, inbound: &str, outbound: &str) -> Arc<NodeRelay> {
        let config = self
            .node_config(agent)
            .initial_device(InitialDevice::channel(self.memory, link(inbound, outbound)));
        NodeRelay::start(config, self.registry.clone()).await.unwrap()
    }
}
