//! The root relay.
//!
//! The Gateway is the only relay that can open S2G packets and join
//! requests (both are sealed to the box key derived from its signature),
//! the only one that signs G2A/G2R traffic, and the one the operator talks
//! to. It keeps a registry of every agent that joined, runs connectors for
//! peripherals and resolves binders back to them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use relaymesh_transport::{InterfaceKind, InterfaceRegistry, TypeHash};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::bridge::{BridgeOwner, DeviceBridge, NegotiationRole};
use crate::config::{GatewayConfig, GatewayKeys};
use crate::connector::{ConnectorBridge, GatewaySink};
use crate::crypto::{PrivateKey, PrivateSignature, PublicKey, PublicSignature};
use crate::distributor::ProtocolHandler;
use crate::host::HostInfo;
use crate::identifiers::{AgentId, BuildId, DeviceId, RouteId};
use crate::procedures::command::{self, AddDeviceArgs, Command};
use crate::procedures::g2x::{self, G2XMessage};
use crate::procedures::n2n::{self, JoinRequest, N2NProcedure, N2NQuery};
use crate::procedures::s2g::{S2GMessage, S2GQuery};
use crate::relay::{CoreSettings, RelayCore, Route};
use crate::ProtocolError;

// ── Agent registry ──────────────────────────────────────────────────

/// What the Gateway knows about one device of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRecord {
    pub type_hash: TypeHash,
    pub is_channel: bool,
    pub is_negotiation: bool,
    /// Negotiation device that produced this channel.
    pub negotiator: Option<DeviceId>,
    pub input_id: Option<String>,
    pub output_id: Option<String>,
}

impl DeviceRecord {
    fn channel(type_hash: TypeHash) -> Self {
        Self {
            type_hash,
            is_channel: true,
            is_negotiation: false,
            negotiator: None,
            input_id: None,
            output_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentRecord {
    pub agent: AgentId,
    pub build_id: BuildId,
    #[serde(skip)]
    pub public_key: PublicKey,
    pub banned: bool,
    pub last_seen: i32,
    pub host_info: HostInfo,
    /// Address G2A traffic for this agent is sent to.
    pub route: RouteId,
    /// Relay the agent joined through, `None` for neighbours.
    pub parent: Option<RouteId>,
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
}

// ── GateRelay ───────────────────────────────────────────────────────

pub struct GateRelay {
    core: RelayCore,
    name: String,
    signature: PrivateSignature,
    public_signature: PublicSignature,
    private_key: PrivateKey,
    public_key: PublicKey,
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    connectors: RwLock<HashMap<TypeHash, Arc<ConnectorBridge>>>,
    me: Weak<GateRelay>,
}

impl std::fmt::Debug for GateRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateRelay")
            .field("name", &self.name)
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl GateRelay {
    pub fn new(
        config: &GatewayConfig,
        keys: &GatewayKeys,
        registry: Arc<InterfaceRegistry>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let settings = CoreSettings {
            agent_id: config.agent_id.unwrap_or_else(AgentId::random),
            build_id: config.build_id,
            broadcast_key: keys.broadcast_key.clone(),
            default_jitter: config.jitter()?,
            chunk_limit: config.checked_chunk_limit()?,
        };
        let public_key = keys.public_signature.to_encryption_key()?;
        let gate = Arc::new_cyclic(|me: &Weak<GateRelay>| GateRelay {
            core: RelayCore::new(settings, registry, me.clone()),
            name: config.name.clone(),
            signature: keys.signature.clone(),
            public_signature: keys.public_signature.clone(),
            private_key: keys.signature.to_encryption_key(),
            public_key,
            agents: RwLock::new(HashMap::new()),
            connectors: RwLock::new(HashMap::new()),
            me: me.clone(),
        });
        tracing::info!(gateway = %gate.name, agent = %gate.agent_id(), "gateway started");
        Ok(gate)
    }

    pub fn core(&self) -> &RelayCore {
        &self.core
    }

    pub fn agent_id(&self) -> AgentId {
        self.core.agent_id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_signature(&self) -> &PublicSignature {
        &self.public_signature
    }

    /// Attach a local device. Negotiation devices answer joiners.
    pub async fn add_device(
        &self,
        type_hash: TypeHash,
        is_negotiation: bool,
        args: &[u8],
    ) -> Result<Arc<DeviceBridge>, ProtocolError> {
        let role = if is_negotiation {
            NegotiationRole::Server
        } else {
            NegotiationRole::None
        };
        self.core.add_device(None, type_hash, role, args).await
    }

    pub async fn shutdown(&self) {
        self.connectors.write().await.clear();
        self.core.shutdown().await;
    }

    pub async fn join(&self) {
        self.core.join().await;
    }

    // ── Agents ──

    pub async fn agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by_key(|a| a.agent);
        agents
    }

    pub async fn agent(&self, agent: AgentId) -> Option<AgentRecord> {
        self.agents.read().await.get(&agent).cloned()
    }

    pub async fn is_agent_banned(&self, agent: AgentId) -> bool {
        self.agents
            .read()
            .await
            .get(&agent)
            .is_some_and(|a| a.banned)
    }

    pub async fn ban_agent(&self, agent: AgentId, banned: bool) -> Result<(), ProtocolError> {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(&agent)
            .ok_or_else(|| ProtocolError::routing(format!("unknown agent {agent}")))?;
        record.banned = banned;
        tracing::info!(agent = %agent, banned, "agent ban updated");
        Ok(())
    }

    async fn register_agent(&self, route: RouteId, request: JoinRequest, parent: Option<RouteId>) {
        let mut agents = self.agents.write().await;
        let banned = agents.get(&route.agent()).is_some_and(|a| a.banned);
        let mut devices = BTreeMap::new();
        devices.insert(route.device(), DeviceRecord::channel(request.type_hash));
        agents.insert(
            route.agent(),
            AgentRecord {
                agent: route.agent(),
                build_id: request.build_id,
                public_key: request.public_key,
                banned,
                last_seen: request.last_seen,
                host_info: request.host_info,
                route,
                parent,
                devices,
            },
        );
        tracing::info!(
            agent = %route.agent(),
            route = %route,
            parent = ?parent.map(|p| p.to_string()),
            "agent joined"
        );
    }

    async fn refuse_banned(&self, agent: AgentId) -> Result<(), ProtocolError> {
        if self.is_agent_banned(agent).await {
            return Err(ProtocolError::routing(format!("agent {agent} is banned")));
        }
        Ok(())
    }

    // ── Connectors ──

    /// Start the connector registered as `type_hash`. One instance per type.
    pub async fn turn_on_connector(&self, type_hash: TypeHash, args: &[u8]) -> Result<(), ProtocolError> {
        let registry = self.core.registry();
        if registry.kind(type_hash) != Some(InterfaceKind::Connector) {
            return Err(ProtocolError::Construction(format!(
                "{type_hash:08x} is not a registered connector"
            )));
        }
        let mut connectors = self.connectors.write().await;
        if connectors.contains_key(&type_hash) {
            return Err(ProtocolError::Construction(format!(
                "connector {type_hash:08x} is already running"
            )));
        }
        let sink = Arc::new(GatewaySink::new(self.me.clone()));
        let connector = registry.build_connector(type_hash, args, sink)?;
        let name = registry.name(type_hash).unwrap_or_default().to_string();
        tracing::info!(connector = %name, "connector started");
        connectors.insert(
            type_hash,
            Arc::new(ConnectorBridge::new(type_hash, name, connector)),
        );
        Ok(())
    }

    pub async fn turn_off_connector(&self, type_hash: TypeHash) -> Result<(), ProtocolError> {
        let removed = self
            .connectors
            .write()
            .await
            .remove(&type_hash)
            .ok_or_else(|| ProtocolError::routing(format!("connector {type_hash:08x} is not running")))?;
        tracing::info!(connector = %removed.name(), "connector stopped");
        Ok(())
    }

    pub async fn connector(&self, type_hash: TypeHash) -> Result<Arc<ConnectorBridge>, ProtocolError> {
        self.connectors
            .read()
            .await
            .get(&type_hash)
            .cloned()
            .ok_or_else(|| ProtocolError::routing(format!("connector {type_hash:08x} is not running")))
    }

    /// Forward an operator command to a running connector.
    pub async fn run_command_on_connector(
        &self,
        type_hash: TypeHash,
        command: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let connector = self.connector(type_hash).await?;
        tracing::debug!(connector = %connector.name(), len = command.len(), "connector command");
        connector.run_command(command).await
    }

    pub async fn connector_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .connectors
            .read()
            .await
            .values()
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }

    // ── Operator commands ──

    /// G2A `message` to `agent` along its route.
    async fn send_g2a(&self, agent: AgentId, message: G2XMessage) -> Result<(), ProtocolError> {
        let agent_key = {
            let agents = self.agents.read().await;
            let record = agents
                .get(&agent)
                .ok_or_else(|| ProtocolError::routing(format!("unknown agent {agent}")))?;
            if record.banned {
                return Err(ProtocolError::routing(format!("agent {agent} is banned")));
            }
            record.public_key.clone()
        };
        let route = self
            .core
            .find_route_by_agent(agent)
            .await
            .ok_or_else(|| ProtocolError::routing(format!("no route to agent {agent}")))?;
        let packet = g2x::compose_g2a(
            route.id,
            &message,
            &self.signature,
            &agent_key,
            &self.private_key,
        )?;
        self.core.lock_and_send(route.outgoing_device, &packet).await
    }

    /// Run `command` on `agent`, or on the Gateway itself for its own id.
    ///
    /// A remote `AddDevice` is only acknowledged later, by the agent's
    /// `AddDeviceResponse`.
    pub async fn run_command_on_agent(&self, agent: AgentId, command: Vec<u8>) -> Result<(), ProtocolError> {
        if agent == self.agent_id() {
            return self.run_gateway_command(&command).await;
        }
        self.send_g2a(agent, G2XMessage::RunCommandOnAgent { command })
            .await
    }

    /// Run `command` on one device. Local devices answer immediately; remote
    /// ones answer nothing.
    pub async fn run_command_on_device(
        &self,
        agent: AgentId,
        device: DeviceId,
        command: Vec<u8>,
    ) -> Result<Vec<u8>, ProtocolError> {
        if agent == self.agent_id() {
            return self.core.find_device(device).await?.run_command(&command).await;
        }
        self.send_g2a(agent, G2XMessage::RunCommandOnDevice { device, command })
            .await?;
        Ok(Vec::new())
    }

    /// Connector input for the peripheral at `binder`.
    pub async fn post_to_peripheral(&self, binder: RouteId, data: Vec<u8>) -> Result<(), ProtocolError> {
        if binder.agent() == self.agent_id() {
            let bridge = self.core.find_device(binder.device()).await?;
            return bridge.on_command_from_connector(&data).await;
        }
        self.send_g2a(
            binder.agent(),
            G2XMessage::DeliverToBinder {
                device: binder.device(),
                data,
            },
        )
        .await
    }

    /// Commands addressed to the Gateway itself.
    pub async fn run_gateway_command(&self, command: &[u8]) -> Result<(), ProtocolError> {
        let (id, args) = command::split(command)?;
        match Command::try_from(id)? {
            Command::AddDevice => {
                let add = AddDeviceArgs::parse(args)?;
                let role = if add.is_negotiation {
                    NegotiationRole::Server
                } else {
                    NegotiationRole::None
                };
                self.core
                    .add_device(Some(add.device), add.type_hash, role, &add.args)
                    .await
                    .map(|_| ())
            }
            Command::Close => {
                self.connectors.write().await.clear();
                self.core.close().await;
                Ok(())
            }
            Command::ClearNetwork => {
                self.connectors.write().await.clear();
                self.core.close().await;
                self.core.remove_all_routes().await;
                tracing::info!(gateway = %self.name, "network cleared");
                Ok(())
            }
            Command::CreateRoute => self.core.create_route(args).await,
            Command::RemoveRoute => self
                .core
                .remove_route(command::parse_route(args)?)
                .await
                .map(|_| ()),
            Command::Ping => {
                tracing::info!(gateway = %self.name, "ping");
                Ok(())
            }
            other @ (Command::SetGrc | Command::UpdateJitter) => Err(ProtocolError::violation(
                format!("{other:?} is not a gateway command"),
            )),
        }
    }

    // ── S2G ──

    async fn handle_s2g(&self, query: S2GQuery, sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        let agent = query.sender.agent();
        match query.message {
            S2GMessage::InitializeRoute {
                child,
                child_side_device,
                blob,
            } => {
                let request = JoinRequest::open(&blob, &self.public_key, &self.private_key)?;
                self.refuse_banned(child.agent()).await?;
                self.core
                    .add_route(Route::new(child, sender.did(), false))
                    .await;
                self.register_agent(child, request, Some(query.sender)).await;
                let add_route = G2XMessage::AddRoute {
                    route: child,
                    direction: child_side_device,
                };
                let packet = g2x::compose_g2r(query.sender, &add_route, &self.signature);
                self.core.send_on(sender, &packet).await
            }
            S2GMessage::AddDeviceResponse {
                device,
                type_hash,
                is_channel,
                is_negotiation,
            } => {
                self.update_agent(agent, |record| {
                    record.devices.insert(
                        device,
                        DeviceRecord {
                            type_hash,
                            is_channel,
                            is_negotiation,
                            negotiator: None,
                            input_id: None,
                            output_id: None,
                        },
                    );
                    Ok(())
                })
                .await?;
                tracing::info!(agent = %agent, device = %device, "agent attached device");
                Ok(())
            }
            S2GMessage::DeliverToBinder {
                peripheral,
                connector,
                data,
            } => {
                let connector = self.connector(connector).await?;
                connector
                    .deliver(RouteId::new(agent, peripheral), &data)
                    .await
            }
            S2GMessage::NewNegotiatedChannelNotification {
                device,
                negotiator,
                input_id,
                output_id,
            } => {
                self.update_agent(agent, |record| {
                    let type_hash = record
                        .devices
                        .get(&negotiator)
                        .map(|d| d.type_hash)
                        .ok_or_else(|| {
                            ProtocolError::routing(format!("unknown negotiator {negotiator}"))
                        })?;
                    record.devices.insert(
                        device,
                        DeviceRecord {
                            type_hash,
                            is_channel: true,
                            is_negotiation: false,
                            negotiator: Some(negotiator),
                            input_id: Some(input_id),
                            output_id: Some(output_id),
                        },
                    );
                    Ok(())
                })
                .await?;
                tracing::info!(agent = %agent, device = %device, "agent negotiated channel");
                Ok(())
            }
            S2GMessage::Notification { blob } => {
                if blob.is_empty() {
                    tracing::info!(agent = %agent, "pong");
                } else {
                    tracing::info!(agent = %agent, len = blob.len(), "agent notification");
                }
                Ok(())
            }
        }
    }

    async fn update_agent<F>(&self, agent: AgentId, update: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut AgentRecord) -> Result<(), ProtocolError>,
    {
        let mut agents = self.agents.write().await;
        let record = agents
            .get_mut(&agent)
            .ok_or_else(|| ProtocolError::routing(format!("unknown agent {agent}")))?;
        update(record)
    }
}

#[async_trait]
impl ProtocolHandler for GateRelay {
    async fn on_n2n(&self, packet: &[u8], sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        let query = N2NQuery::parse(packet)?;
        self.refuse_banned(query.sender.agent()).await?;
        match query.procedure {
            N2NProcedure::InitializeRoute => {
                let request = JoinRequest::open(query.query, &self.public_key, &self.private_key)?;
                self.core
                    .add_route(Route::new(query.sender, sender.did(), true))
                    .await;
                self.register_agent(query.sender, request, None).await;
                Ok(())
            }
            N2NProcedure::ChannelIdExchangeStep1 => {
                let received = query.channel_id()?;
                let bridge = self.core.answer_negotiation(sender, &received).await?;
                let Some(ids) = bridge.channel_ids() else {
                    return Err(ProtocolError::Construction(
                        "negotiated channel without identifiers".into(),
                    ));
                };
                let step2 = n2n::channel_id_exchange_step2(self.core.route_id(bridge.did()), &ids.input);
                tracing::info!(device = %bridge.did(), peer = %query.sender, "answered channel negotiation");
                self.core.send_on(&bridge, &step2).await
            }
            N2NProcedure::ChannelIdExchangeStep2 => Err(ProtocolError::violation(
                "the gateway never starts a negotiation",
            )),
        }
    }

    async fn on_s2g(&self, packet: &[u8], sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        let query = S2GQuery::open(packet, &self.public_key, &self.private_key)?;
        let agent = query.sender.agent();
        let timestamp = query.timestamp;
        self.update_agent(agent, |record| {
            if record.banned {
                return Err(ProtocolError::routing(format!("agent {agent} is banned")));
            }
            record.last_seen = timestamp;
            Ok(())
        })
        .await?;
        self.handle_s2g(query, sender).await
    }

    async fn on_g2a(&self, _packet: &[u8], _sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        Err(ProtocolError::violation("G2A received by the gateway"))
    }

    async fn on_g2r(&self, _packet: &[u8], _sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        Err(ProtocolError::violation("G2R received by the gateway"))
    }
}

#[async_trait]
impl BridgeOwner for GateRelay {
    async fn on_packet(&self, packet: Vec<u8>, bridge: Arc<DeviceBridge>) {
        self.core.distributor().dispatch(self, &packet, &bridge).await;
    }

    async fn on_peripheral_output(&self, data: Vec<u8>, bridge: Arc<DeviceBridge>) {
        let result = async {
            let hash = self
                .core
                .registry()
                .closure_connector(bridge.type_hash())
                .ok_or_else(|| {
                    ProtocolError::Construction(format!(
                        "peripheral {:08x} has no connector",
                        bridge.type_hash()
                    ))
                })?;
            let connector = self.connector(hash).await?;
            connector
                .deliver(self.core.route_id(bridge.did()), &data)
                .await
        }
        .await;
        if let Err(e) = result {
            e.report("peripheral output dropped", Some(bridge.did()));
        }
    }

    async fn detach_device(&self, did: DeviceId) -> Result<(), ProtocolError> {
        self.core.detach(did).await.map(|_| ())
    }
}
