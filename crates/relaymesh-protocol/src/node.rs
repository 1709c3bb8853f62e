//! Non-root relay.
//!
//! A node keeps one Gateway return channel (GRC), the first plain channel it
//! attaches unless the Gateway reassigns it. It joins the mesh over that
//! channel (or negotiates one first), wraps joins of deeper nodes for the
//! Gateway, forwards everything not addressed to itself and executes the
//! commands the Gateway sends it.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use relaymesh_transport::InterfaceRegistry;
use tokio::sync::RwLock;

use crate::bridge::{BridgeOwner, DeviceBridge, NegotiationRole};
use crate::config::NodeConfig;
use crate::crypto::{self, PrivateKey, PublicKey, PublicSignature};
use crate::distributor::ProtocolHandler;
use crate::host::HostInfo;
use crate::identifiers::{timestamp_now, AgentId, DeviceId, RouteId};
use crate::procedures::command::{self, AddDeviceArgs, Command};
use crate::procedures::g2x::{G2XMessage, VerifiedG2X};
use crate::procedures::n2n::{self, JoinRequest, N2NProcedure, N2NQuery};
use crate::procedures::s2g::{S2GMessage, S2GQuery};
use crate::relay::{CoreSettings, RelayCore, Route};
use crate::ProtocolError;

pub struct NodeRelay {
    core: RelayCore,
    gateway_signature: PublicSignature,
    /// Box key derived from the Gateway's signature.
    gateway_key: PublicKey,
    private_key: PrivateKey,
    public_key: PublicKey,
    adopt_negotiated_channel: bool,
    grc: RwLock<Option<DeviceId>>,
}

impl std::fmt::Debug for NodeRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRelay").field("core", &self.core).finish()
    }
}

impl NodeRelay {
    /// Build the relay, attach the configured devices and start joining.
    ///
    /// The first initial device decides how: a negotiation device starts the
    /// channel-id exchange, a plain channel sends the join request directly.
    pub async fn start(
        config: NodeConfig,
        registry: Arc<InterfaceRegistry>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let gateway_key = config.gateway_signature.to_encryption_key()?;
        let (private_key, public_key) = crypto::generate_encryption_keys();
        let settings = CoreSettings {
            agent_id: config.agent_id,
            build_id: config.build_id,
            broadcast_key: config.broadcast_key.clone(),
            default_jitter: config.default_jitter,
            chunk_limit: config.checked_chunk_limit()?,
        };
        let node = Arc::new_cyclic(|me: &Weak<NodeRelay>| NodeRelay {
            core: RelayCore::new(settings, registry, me.clone()),
            gateway_signature: config.gateway_signature.clone(),
            gateway_key,
            private_key,
            public_key,
            adopt_negotiated_channel: config.adopt_negotiated_channel,
            grc: RwLock::new(None),
        });

        let mut first = None;
        for initial in &config.initial_devices {
            let role = if initial.is_negotiation {
                NegotiationRole::Client
            } else {
                NegotiationRole::None
            };
            let bridge = node
                .core
                .add_device(None, initial.type_hash, role, &initial.args)
                .await?;
            node.track_grc(&bridge).await;
            first.get_or_insert(bridge);
        }

        tracing::info!(agent = %node.agent_id(), devices = config.initial_devices.len(), "node started");
        let joined = match first {
            Some(bridge) if bridge.is_negotiation() => node.negotiate_channel(&bridge).await,
            Some(_) => node.initialize_route().await,
            None => {
                tracing::warn!(agent = %node.agent_id(), "node started without devices");
                Ok(())
            }
        };
        if let Err(e) = joined {
            node.shutdown().await;
            return Err(e);
        }
        Ok(node)
    }

    pub fn core(&self) -> &RelayCore {
        &self.core
    }

    pub fn agent_id(&self) -> AgentId {
        self.core.agent_id()
    }

    /// Key the Gateway boxes commands for this node with.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub async fn grc(&self) -> Option<Arc<DeviceBridge>> {
        let did = (*self.grc.read().await)?;
        self.core.find_device(did).await.ok()
    }

    async fn grc_bridge(&self) -> Result<Arc<DeviceBridge>, ProtocolError> {
        self.grc()
            .await
            .ok_or_else(|| ProtocolError::routing("no gateway return channel"))
    }

    /// Make `did` the Gateway return channel.
    pub async fn set_grc(&self, did: DeviceId) -> Result<(), ProtocolError> {
        let bridge = self.core.find_device(did).await?;
        if !bridge.is_channel() {
            return Err(ProtocolError::Construction(format!("device {did} is not a channel")));
        }
        *self.grc.write().await = Some(did);
        tracing::info!(agent = %self.agent_id(), device = %did, "gateway return channel set");
        Ok(())
    }

    /// The first plain channel becomes the GRC.
    async fn track_grc(&self, bridge: &DeviceBridge) {
        if !bridge.is_channel() || bridge.is_negotiation() {
            return;
        }
        let mut grc = self.grc.write().await;
        if grc.is_none() {
            *grc = Some(bridge.did());
            tracing::info!(agent = %self.agent_id(), device = %bridge.did(), "gateway return channel set");
        }
    }

    pub async fn shutdown(&self) {
        *self.grc.write().await = None;
        self.core.shutdown().await;
    }

    pub async fn join(&self) {
        self.core.join().await;
    }

    // ── Originated traffic ──

    /// Send the sealed join request over the GRC.
    pub async fn initialize_route(&self) -> Result<(), ProtocolError> {
        let grc = self.grc_bridge().await?;
        let request = JoinRequest {
            build_id: self.core.build_id(),
            public_key: self.public_key.clone(),
            type_hash: grc.type_hash(),
            last_seen: timestamp_now(),
            host_info: HostInfo::gather(),
        };
        let sealed = request.seal(&self.gateway_key)?;
        let packet = n2n::initialize_route(self.core.route_id(grc.did()), &sealed);
        tracing::info!(agent = %self.agent_id(), device = %grc.did(), "sending join request");
        self.core.send_on(&grc, &packet).await
    }

    /// Step1: announce our input identifier over the negotiation device.
    async fn negotiate_channel(&self, bridge: &DeviceBridge) -> Result<(), ProtocolError> {
        let ids = bridge
            .channel_ids()
            .ok_or_else(|| ProtocolError::Construction("negotiation device without identifiers".into()))?;
        let packet = n2n::channel_id_exchange_step1(self.core.route_id(bridge.did()), &ids.input);
        tracing::info!(agent = %self.agent_id(), device = %bridge.did(), "starting channel negotiation");
        self.core.send_on(bridge, &packet).await
    }

    /// Seal `message` for the Gateway and send it over the GRC.
    pub async fn send_to_gateway(&self, message: S2GMessage) -> Result<(), ProtocolError> {
        let grc = self.grc_bridge().await?;
        let query = S2GQuery::new(self.core.route_id(grc.did()), timestamp_now(), message);
        let packet = query.compose(&self.gateway_key)?;
        self.core.send_on(&grc, &packet).await
    }

    // ── Gateway commands ──

    async fn run_agent_command(&self, command: &[u8]) -> Result<(), ProtocolError> {
        let (id, args) = command::split(command)?;
        match Command::try_from(id)? {
            Command::AddDevice => {
                let add = AddDeviceArgs::parse(args)?;
                let role = if add.is_negotiation {
                    NegotiationRole::Server
                } else {
                    NegotiationRole::None
                };
                let bridge = self
                    .core
                    .add_device(Some(add.device), add.type_hash, role, &add.args)
                    .await?;
                self.track_grc(&bridge).await;
                self.send_to_gateway(S2GMessage::AddDeviceResponse {
                    device: bridge.did(),
                    type_hash: bridge.type_hash(),
                    is_channel: bridge.is_channel(),
                    is_negotiation: bridge.is_negotiation(),
                })
                .await
            }
            Command::Close => {
                tracing::info!(agent = %self.agent_id(), "closing on gateway request");
                *self.grc.write().await = None;
                self.core.close().await;
                Ok(())
            }
            Command::CreateRoute => self.core.create_route(args).await,
            Command::RemoveRoute => self
                .core
                .remove_route(command::parse_route(args)?)
                .await
                .map(|_| ()),
            Command::SetGrc => self.set_grc(command::parse_device(args)?).await,
            Command::Ping => {
                self.send_to_gateway(S2GMessage::Notification { blob: Vec::new() })
                    .await
            }
            other @ (Command::UpdateJitter | Command::ClearNetwork) => Err(
                ProtocolError::violation(format!("{other:?} is not a node command")),
            ),
        }
    }

    /// Record how to reach `route`, announced to `receiver`.
    ///
    /// On the receiver itself the route leaves through `direction`; on every
    /// hop before it, through the route toward the receiver.
    async fn apply_add_route(
        &self,
        receiver: RouteId,
        route: RouteId,
        direction: DeviceId,
    ) -> Result<(), ProtocolError> {
        if receiver.agent() == self.agent_id() {
            self.core.find_device(direction).await?;
            self.core.add_route(Route::new(route, direction, true)).await;
        } else {
            let toward = self
                .core
                .find_route(receiver)
                .await
                .ok_or_else(|| ProtocolError::routing(format!("no route to {receiver}")))?;
            self.core
                .add_route(Route::new(route, toward.outgoing_device, false))
                .await;
        }
        Ok(())
    }

    async fn handle_g2x(&self, message: G2XMessage) -> Result<(), ProtocolError> {
        match message {
            G2XMessage::RunCommandOnAgent { command } => self.run_agent_command(&command).await,
            G2XMessage::AddRoute { route, direction } => {
                let me = self.core.route_id(DeviceId::NULL);
                self.apply_add_route(me, route, direction).await
            }
            G2XMessage::RunCommandOnDevice { device, command } => {
                let bridge = self.core.find_device(device).await?;
                let response = bridge.run_command(&command).await?;
                tracing::debug!(device = %device, response = response.len(), "device command done");
                Ok(())
            }
            G2XMessage::DeliverToBinder { device, data } => {
                let bridge = self.core.find_device(device).await?;
                bridge.on_command_from_connector(&data).await
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for NodeRelay {
    async fn on_n2n(&self, packet: &[u8], sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        let query = N2NQuery::parse(packet)?;
        match query.procedure {
            N2NProcedure::InitializeRoute => {
                tracing::info!(
                    agent = %self.agent_id(),
                    child = %query.sender,
                    device = %sender.did(),
                    "relaying join request"
                );
                self.send_to_gateway(S2GMessage::InitializeRoute {
                    child: query.sender,
                    child_side_device: sender.did(),
                    blob: query.query.to_vec(),
                })
                .await
            }
            N2NProcedure::ChannelIdExchangeStep1 => {
                let received = query.channel_id()?;
                let bridge = self.core.answer_negotiation(sender, &received).await?;
                let Some(ids) = bridge.channel_ids() else {
                    return Err(ProtocolError::Construction(
                        "negotiated channel without identifiers".into(),
                    ));
                };
                let (input, output) = (ids.input.clone(), ids.output.clone());
                let step2 = n2n::channel_id_exchange_step2(self.core.route_id(bridge.did()), &input);
                self.core.send_on(&bridge, &step2).await?;
                self.send_to_gateway(S2GMessage::NewNegotiatedChannelNotification {
                    device: bridge.did(),
                    negotiator: sender.did(),
                    input_id: input,
                    output_id: output,
                })
                .await
            }
            N2NProcedure::ChannelIdExchangeStep2 => {
                let received = query.channel_id()?;
                let bridge = self.core.finish_negotiation(sender, &received).await?;
                tracing::info!(agent = %self.agent_id(), device = %bridge.did(), "channel negotiated");
                let has_grc = self.grc().await.is_some();
                if self.adopt_negotiated_channel || !has_grc {
                    self.set_grc(bridge.did()).await?;
                    self.initialize_route().await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn on_s2g(&self, packet: &[u8], sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        let grc = self.grc_bridge().await?;
        if grc.did() == sender.did() {
            return Err(ProtocolError::violation("S2G received from the gateway return channel"));
        }
        if self.core.find_route_by_outgoing(sender.did()).await.is_none() {
            return Err(ProtocolError::violation(format!(
                "S2G from device {}, which no route uses",
                sender.did()
            )));
        }
        self.core.send_on(&grc, packet).await
    }

    async fn on_g2a(&self, packet: &[u8], _sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        let verified = VerifiedG2X::verify(packet, &self.gateway_signature)?;
        if verified.receiver.agent() != self.agent_id() {
            return self.core.forward(verified.receiver, packet).await;
        }
        let message = verified.open(&self.gateway_key, &self.private_key)?;
        self.handle_g2x(message).await
    }

    async fn on_g2r(&self, packet: &[u8], _sender: &Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        let verified = VerifiedG2X::verify(packet, &self.gateway_signature)?;
        match verified.message()? {
            G2XMessage::AddRoute { route, direction } => {
                self.apply_add_route(verified.receiver, route, direction)
                    .await?;
            }
            other => {
                return Err(ProtocolError::violation(format!(
                    "{:?} is not a G2R procedure",
                    other.procedure()
                )))
            }
        }
        if verified.receiver.agent() != self.agent_id() {
            self.core.forward(verified.receiver, packet).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BridgeOwner for NodeRelay {
    async fn on_packet(&self, packet: Vec<u8>, bridge: Arc<DeviceBridge>) {
        self.core.distributor().dispatch(self, &packet, &bridge).await;
    }

    async fn on_peripheral_output(&self, data: Vec<u8>, bridge: Arc<DeviceBridge>) {
        let result = match self.core.registry().closure_connector(bridge.type_hash()) {
            Some(connector) => {
                self.send_to_gateway(S2GMessage::DeliverToBinder {
                    peripheral: bridge.did(),
                    connector,
                    data,
                })
                .await
            }
            None => Err(ProtocolError::Construction(format!(
                "peripheral {:08x} has no connector",
                bridge.type_hash()
            ))),
        };
        if let Err(e) = result {
            e.report("peripheral output dropped", Some(bridge.did()));
        }
    }

    async fn detach_device(&self, did: DeviceId) -> Result<(), ProtocolError> {
        self.core.detach(did).await?;
        let mut grc = self.grc.write().await;
        if *grc == Some(did) {
            *grc = None;
            tracing::warn!(agent = %self.agent_id(), device = %did, "gateway return channel detached");
        }
        Ok(())
    }
}
