//! State shared by every relay: attached devices and the routing table.
//!
//! Routes reference devices by id. A route can outlive its device; looking
//! it up then fails with a routing error instead of reaching a dead bridge.
//! Neither map's lock is held while a handler or a send is awaited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use relaymesh_transport::{ByteReader, InterfaceRegistry, TypeHash};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::{BridgeOwner, BridgeParts, ChannelIds, DeviceBridge, Jitter, NegotiationRole};
use crate::crypto::SymmetricKey;
use crate::distributor::Distributor;
use crate::identifiers::{random_identifier, AgentId, BuildId, DeviceId, RouteId};
use crate::procedures::command::CreateRouteArgs;
use crate::ProtocolError;

/// One routing-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Route {
    pub id: RouteId,
    pub outgoing_device: DeviceId,
    pub is_neighbour: bool,
}

impl Route {
    pub fn new(id: RouteId, outgoing_device: DeviceId, is_neighbour: bool) -> Self {
        Self {
            id,
            outgoing_device,
            is_neighbour,
        }
    }
}

pub struct RelayCore {
    agent_id: AgentId,
    build_id: BuildId,
    distributor: Distributor,
    registry: Arc<InterfaceRegistry>,
    devices: RwLock<HashMap<DeviceId, Arc<DeviceBridge>>>,
    routes: RwLock<HashMap<RouteId, Route>>,
    last_device_id: AtomicU16,
    default_jitter: Jitter,
    chunk_limit: Option<usize>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    owner: Weak<dyn BridgeOwner>,
}

impl std::fmt::Debug for RelayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCore")
            .field("agent_id", &self.agent_id)
            .field("build_id", &self.build_id)
            .finish_non_exhaustive()
    }
}

/// Construction settings of a [`RelayCore`].
pub(crate) struct CoreSettings {
    pub agent_id: AgentId,
    pub build_id: BuildId,
    pub broadcast_key: SymmetricKey,
    pub default_jitter: Jitter,
    pub chunk_limit: Option<usize>,
}

impl RelayCore {
    pub(crate) fn new(
        settings: CoreSettings,
        registry: Arc<InterfaceRegistry>,
        owner: Weak<dyn BridgeOwner>,
    ) -> Self {
        Self {
            agent_id: settings.agent_id,
            build_id: settings.build_id,
            distributor: Distributor::new(settings.broadcast_key),
            registry,
            devices: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            last_device_id: AtomicU16::new(0),
            default_jitter: settings.default_jitter,
            chunk_limit: settings.chunk_limit,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            owner,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn registry(&self) -> &Arc<InterfaceRegistry> {
        &self.registry
    }

    /// This relay's address for a local device.
    pub fn route_id(&self, did: DeviceId) -> RouteId {
        RouteId::new(self.agent_id, did)
    }

    // ── Devices ──

    /// Next free, non-null device id.
    pub async fn next_device_id(&self) -> Result<DeviceId, ProtocolError> {
        let devices = self.devices.read().await;
        for _ in 0..=u16::MAX {
            let id = self
                .last_device_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            let did = DeviceId::new(id);
            if !did.is_null() && !devices.contains_key(&did) {
                return Ok(did);
            }
        }
        Err(ProtocolError::Construction("no free device id".into()))
    }

    /// Build a device through the registry and attach it.
    ///
    /// `did` of `None` (or null) allocates one. Negotiation roles rewrite `args` from
    /// `{seed, parameters}` to `{input, output, parameters}`: a client listens
    /// on a fresh identifier and writes to the seed, a server the reverse.
    pub async fn add_device(
        &self,
        did: Option<DeviceId>,
        type_hash: TypeHash,
        role: NegotiationRole,
        args: &[u8],
    ) -> Result<Arc<DeviceBridge>, ProtocolError> {
        let (args, ids) = match role {
            NegotiationRole::None => (args.to_vec(), None),
            NegotiationRole::Client | NegotiationRole::Server => {
                let ids = negotiation_ids(args, role)?;
                (ids.to_args(), Some(ids))
            }
        };
        self.build_and_attach(did, type_hash, role, args, ids).await
    }

    /// Attach the permanent channel produced by a negotiation.
    pub async fn add_negotiated_channel(
        &self,
        type_hash: TypeHash,
        ids: ChannelIds,
    ) -> Result<Arc<DeviceBridge>, ProtocolError> {
        let args = ids.to_args();
        self.build_and_attach(None, type_hash, NegotiationRole::None, args, Some(ids))
            .await
    }

    async fn build_and_attach(
        &self,
        did: Option<DeviceId>,
        type_hash: TypeHash,
        role: NegotiationRole,
        args: Vec<u8>,
        ids: Option<ChannelIds>,
    ) -> Result<Arc<DeviceBridge>, ProtocolError> {
        let did = match did.filter(|d| !d.is_null()) {
            Some(did) => did,
            None => self.next_device_id().await?,
        };
        if self.devices.read().await.contains_key(&did) {
            return Err(ProtocolError::Construction(format!("device {did} already attached")));
        }
        let device = self.registry.build_device(type_hash, &args)?;
        let bridge = Arc::new(DeviceBridge::new(
            BridgeParts {
                did,
                type_hash,
                device,
                args,
                role,
                ids,
                jitter: self.default_jitter,
                chunk_limit: self.chunk_limit,
            },
            self.shutdown.child_token(),
            self.owner.clone(),
        ));
        self.attach(Arc::clone(&bridge)).await?;
        Ok(bridge)
    }

    async fn attach(&self, bridge: Arc<DeviceBridge>) -> Result<(), ProtocolError> {
        let did = bridge.did();
        {
            let mut devices = self.devices.write().await;
            if devices.contains_key(&did) {
                return Err(ProtocolError::Construction(format!("device {did} already attached")));
            }
            devices.insert(did, Arc::clone(&bridge));
        }
        tracing::info!(
            agent = %self.agent_id,
            device = %did,
            kind = self.registry.name(bridge.type_hash()).unwrap_or("?"),
            negotiation = bridge.is_negotiation(),
            "device attached"
        );
        self.tasks.spawn(bridge.run());
        Ok(())
    }

    /// Deregister a device and stop its loop. Routes through it go stale.
    pub async fn detach(&self, did: DeviceId) -> Result<Arc<DeviceBridge>, ProtocolError> {
        let bridge = self
            .devices
            .write()
            .await
            .remove(&did)
            .ok_or_else(|| ProtocolError::routing(format!("no device {did}")))?;
        bridge.close();
        tracing::info!(agent = %self.agent_id, device = %did, "device detached");
        Ok(bridge)
    }

    pub async fn find_device(&self, did: DeviceId) -> Result<Arc<DeviceBridge>, ProtocolError> {
        self.devices
            .read()
            .await
            .get(&did)
            .cloned()
            .ok_or_else(|| ProtocolError::routing(format!("no device {did}")))
    }

    /// Snapshot of every attached device, ordered by id.
    pub async fn devices(&self) -> Vec<Arc<DeviceBridge>> {
        let mut devices: Vec<_> = self.devices.read().await.values().cloned().collect();
        devices.sort_by_key(|b| b.did());
        devices
    }

    /// Detach every device.
    pub async fn close(&self) {
        let drained: Vec<_> = self.devices.write().await.drain().collect();
        for (did, bridge) in drained {
            bridge.close();
            tracing::debug!(agent = %self.agent_id, device = %did, "device detached on close");
        }
    }

    /// Close, then stop accepting device tasks.
    pub async fn shutdown(&self) {
        self.close().await;
        self.shutdown.cancel();
        self.tasks.close();
    }

    /// Wait for every device loop to finish. Call after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    // ── Routes ──

    pub async fn add_route(&self, route: Route) {
        tracing::debug!(
            agent = %self.agent_id,
            route = %route.id,
            device = %route.outgoing_device,
            neighbour = route.is_neighbour,
            "route added"
        );
        self.routes.write().await.insert(route.id, route);
    }

    /// `CreateRoute` arguments; the outgoing device must be attached.
    pub async fn create_route(&self, args: &[u8]) -> Result<(), ProtocolError> {
        let args = CreateRouteArgs::parse(args)?;
        self.find_device(args.device).await?;
        self.add_route(Route::new(args.route, args.device, args.is_neighbour))
            .await;
        Ok(())
    }

    pub async fn remove_route(&self, id: RouteId) -> Result<Route, ProtocolError> {
        self.routes
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| ProtocolError::routing(format!("no route to {id}")))
    }

    pub async fn remove_all_routes(&self) {
        self.routes.write().await.clear();
    }

    pub async fn find_route(&self, id: RouteId) -> Option<Route> {
        self.routes.read().await.get(&id).copied()
    }

    /// Any route whose destination is `agent`.
    pub async fn find_route_by_agent(&self, agent: AgentId) -> Option<Route> {
        self.routes
            .read()
            .await
            .values()
            .find(|r| r.id.agent() == agent)
            .copied()
    }

    /// Any route leaving through `did`.
    pub async fn find_route_by_outgoing(&self, did: DeviceId) -> Option<Route> {
        self.routes
            .read()
            .await
            .values()
            .find(|r| r.outgoing_device == did)
            .copied()
    }

    pub async fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<_> = self.routes.read().await.values().copied().collect();
        routes.sort_by_key(|r| r.id);
        routes
    }

    /// Bridge a packet for `id` leaves through.
    pub async fn resolve(&self, id: RouteId) -> Result<Arc<DeviceBridge>, ProtocolError> {
        let route = self
            .find_route(id)
            .await
            .ok_or_else(|| ProtocolError::routing(format!("no route to {id}")))?;
        self.find_device(route.outgoing_device).await.map_err(|_| {
            ProtocolError::routing(format!(
                "route to {id} uses detached device {}",
                route.outgoing_device
            ))
        })
    }

    // ── Sending ──

    /// Envelope `packet` and send it on `bridge`.
    pub async fn send_on(&self, bridge: &DeviceBridge, packet: &[u8]) -> Result<(), ProtocolError> {
        let envelope = self.distributor.wrap(packet)?;
        bridge.send(envelope).await
    }

    /// Envelope `packet` and send it on device `did`.
    pub async fn lock_and_send(&self, did: DeviceId, packet: &[u8]) -> Result<(), ProtocolError> {
        let bridge = self.find_device(did).await?;
        self.send_on(&bridge, packet).await
    }

    /// Forward `packet` along the route to `id`, unchanged.
    pub async fn forward(&self, id: RouteId, packet: &[u8]) -> Result<(), ProtocolError> {
        let bridge = self.resolve(id).await?;
        tracing::trace!(route = %id, device = %bridge.did(), "forwarding");
        self.send_on(&bridge, packet).await
    }

    // ── Negotiation ──

    /// Answer Step1 received on negotiation server `sender`: attach a
    /// permanent channel writing to `received` and listening on a fresh
    /// identifier of the same length.
    pub async fn answer_negotiation(
        &self,
        sender: &DeviceBridge,
        received: &str,
    ) -> Result<Arc<DeviceBridge>, ProtocolError> {
        let ids = match (sender.negotiation_role(), sender.channel_ids()) {
            (NegotiationRole::Server, Some(ids)) => ids,
            _ => {
                return Err(ProtocolError::violation(format!(
                    "Step1 on device {}, which does not answer negotiations",
                    sender.did()
                )))
            }
        };
        if received.is_empty() {
            return Err(ProtocolError::Parse("empty channel identifier".into()));
        }
        let negotiated = ChannelIds {
            input: random_identifier(received.len()),
            output: received.to_string(),
            parameters: ids.parameters.clone(),
        };
        self.add_negotiated_channel(sender.type_hash(), negotiated)
            .await
    }

    /// Finish the exchange on negotiation client `sender`: detach it and
    /// attach the mirrored permanent channel.
    pub async fn finish_negotiation(
        &self,
        sender: &DeviceBridge,
        received: &str,
    ) -> Result<Arc<DeviceBridge>, ProtocolError> {
        let ids = match (sender.negotiation_role(), sender.channel_ids()) {
            (NegotiationRole::Client, Some(ids)) => ids,
            _ => {
                return Err(ProtocolError::violation(format!(
                    "Step2 on device {}, which did not start a negotiation",
                    sender.did()
                )))
            }
        };
        if received.is_empty() {
            return Err(ProtocolError::Parse("empty channel identifier".into()));
        }
        let negotiated = ChannelIds {
            input: ids.input.clone(),
            output: received.to_string(),
            parameters: ids.parameters.clone(),
        };
        self.detach(sender.did()).await?;
        self.add_negotiated_channel(sender.type_hash(), negotiated)
            .await
    }
}

fn negotiation_ids(args: &[u8], role: NegotiationRole) -> Result<ChannelIds, ProtocolError> {
    let mut r = ByteReader::new(args);
    let seed = r
        .read_string()
        .map_err(|e| ProtocolError::Construction(format!("negotiation arguments: {e}")))?;
    if seed.is_empty() {
        return Err(ProtocolError::Construction("empty negotiation identifier".into()));
    }
    let generated = random_identifier(seed.len());
    let (input, output) = match role {
        NegotiationRole::Client => (generated, seed),
        _ => (seed, generated),
    };
    Ok(ChannelIds {
        input,
        output,
        parameters: r.rest().to_vec(),
    })
}
