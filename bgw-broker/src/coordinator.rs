use bgwp_node::{DeviceAddress, DeviceData, GatewayMessage, NodeConfig, NodeId, NodeMessage, Timestamp};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender, WeakUnboundedSender},
        oneshot,
    },
    time::Duration,
};

use crate::{
    cloud::{CloudError, CloudRegistrar, DeviceHandle, Telemetry},
    registry::{ClaimId, ConnectionState, DeviceRegistry, DeviceSnapshot, Owner, RegistryError},
    router::TelemetryRouter,
    session::{NodeSession, SessionSnapshot, SessionTable},
    transport::NodeChannel,
    ConnectionId,
};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Coordinator task has exited")]
    Closed,
    #[error("Registry Error")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// How long a device may sit in `PendingConnect` before the claim is
    /// abandoned
    pub pending_connect_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            pending_connect_timeout: Duration::from_secs(crate::DEFAULT_PENDING_CONNECT_TIMEOUT),
        }
    }
}

pub(crate) enum CoordinatorEvent {
    Inbound {
        connection_id: ConnectionId,
        message: NodeMessage,
    },
    NodeDisconnected(ConnectionId),
    RegistrationComplete {
        address: DeviceAddress,
        claim: ClaimId,
        result: Result<Arc<dyn DeviceHandle>, CloudError>,
    },
    ConnectTimeout {
        address: DeviceAddress,
        claim: ClaimId,
    },
    Query(Query),
}

pub(crate) enum Query {
    Device(DeviceAddress, oneshot::Sender<Option<DeviceSnapshot>>),
    Devices(oneshot::Sender<Vec<DeviceSnapshot>>),
    Sessions(oneshot::Sender<Vec<SessionSnapshot>>),
}

/// Cheap, cloneable entry point into the coordinator task. Everything sent
/// through one handle is processed in send order.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: UnboundedSender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub fn dispatch(
        &self,
        connection_id: ConnectionId,
        message: NodeMessage,
    ) -> Result<(), CoordinatorError> {
        self.sender
            .send(CoordinatorEvent::Inbound {
                connection_id,
                message,
            })
            .map_err(|_| CoordinatorError::Closed)
    }

    pub fn node_disconnected(&self, connection_id: ConnectionId) -> Result<(), CoordinatorError> {
        self.sender
            .send(CoordinatorEvent::NodeDisconnected(connection_id))
            .map_err(|_| CoordinatorError::Closed)
    }

    pub async fn device(
        &self,
        address: DeviceAddress,
    ) -> Result<Option<DeviceSnapshot>, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::Device(address, tx))?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }

    pub async fn devices(&self) -> Result<Vec<DeviceSnapshot>, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::Devices(tx))?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::Sessions(tx))?;
        rx.await.map_err(|_| CoordinatorError::Closed)
    }

    fn query(&self, query: Query) -> Result<(), CoordinatorError> {
        self.sender
            .send(CoordinatorEvent::Query(query))
            .map_err(|_| CoordinatorError::Closed)
    }
}

/// Start a coordinator on its own task. The task runs until every
/// [`CoordinatorHandle`] has been dropped.
pub fn spawn_coordinator(
    registrar: Arc<dyn CloudRegistrar>,
    channel: Arc<dyn NodeChannel>,
    settings: CoordinatorSettings,
) -> (CoordinatorHandle, tokio::task::JoinHandle<()>) {
    let (sender, receiver) = unbounded_channel();
    let coordinator = ConnectionCoordinator::new(registrar, channel, settings, sender.downgrade());
    let task = tokio::spawn(coordinator.run(receiver));
    (CoordinatorHandle { sender }, task)
}

/// Owner of all device and session state. Decides which node serves which
/// device and tells nodes when to connect or disconnect.
///
/// Event handlers never await: every registry mutation happens inside one
/// synchronous call, so handlers are atomic with respect to each other.
/// The slow parts (cloud registration, connect timeouts, telemetry
/// publishing) run on spawned tasks that report back through the same
/// queue, tagged with the [`ClaimId`] they were started for.
pub struct ConnectionCoordinator {
    registry: DeviceRegistry,
    sessions: SessionTable,
    registrar: Arc<dyn CloudRegistrar>,
    channel: Arc<dyn NodeChannel>,
    router: TelemetryRouter,
    settings: CoordinatorSettings,
    internal: WeakUnboundedSender<CoordinatorEvent>,
}

impl ConnectionCoordinator {
    fn new(
        registrar: Arc<dyn CloudRegistrar>,
        channel: Arc<dyn NodeChannel>,
        settings: CoordinatorSettings,
        internal: WeakUnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            sessions: SessionTable::new(),
            registrar,
            channel,
            router: TelemetryRouter::new(),
            settings,
            internal,
        }
    }

    async fn run(mut self, mut receiver: UnboundedReceiver<CoordinatorEvent>) {
        log::info!("Connection coordinator started");
        while let Some(event) = receiver.recv().await {
            self.handle(event);
        }
        log::warn!("Connection coordinator exiting event loop");
    }

    fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Inbound {
                connection_id,
                message,
            } => self.on_message(connection_id, message),
            CoordinatorEvent::NodeDisconnected(connection_id) => {
                self.on_node_disconnected(connection_id)
            }
            CoordinatorEvent::RegistrationComplete {
                address,
                claim,
                result,
            } => self.on_registration_complete(&address, claim, result),
            CoordinatorEvent::ConnectTimeout { address, claim } => {
                self.on_connect_timeout(&address, claim)
            }
            CoordinatorEvent::Query(query) => self.answer(query),
        }
    }

    fn on_message(&mut self, connection_id: ConnectionId, message: NodeMessage) {
        match message.device_address() {
            Some(address) => log::trace!("connection {connection_id:}: {} {address:}", message.kind()),
            None => log::trace!("connection {connection_id:}: {}", message.kind()),
        }
        match message {
            NodeMessage::Register {
                node_id,
                config_data,
            } => self.on_register(connection_id, node_id, config_data),
            NodeMessage::Discovered {
                device_address,
                distance,
                timestamp,
            } => self.on_device_discovered(connection_id, device_address, distance, timestamp),
            NodeMessage::DeviceStatus {
                device_address,
                distance,
                timestamp,
                data,
            } => self.on_device_status(connection_id, device_address, distance, timestamp, data),
            NodeMessage::DeviceOutOfRange {
                device_address,
                timestamp,
            } => self.on_device_out_of_range(connection_id, device_address, timestamp),
            NodeMessage::DeviceConnected {
                device_address,
                timestamp,
            } => self.on_device_connected(connection_id, device_address, timestamp),
            NodeMessage::DeviceDisconnected { device_address } => {
                self.on_device_disconnected_message(connection_id, device_address)
            }
        }
    }

    /// Lookup used by the telemetry path; the handle outlives any claim
    pub fn cloud_handle(&self, address: &DeviceAddress) -> Option<Arc<dyn DeviceHandle>> {
        self.registry.cloud_handle(address)
    }

    fn on_register(
        &mut self,
        connection_id: ConnectionId,
        node_id: Option<NodeId>,
        config: NodeConfig,
    ) {
        let Some(node_id) = node_id.filter(|id| !id.is_empty()) else {
            log::warn!("connection {connection_id:}: register without a node id");
            self.protocol_error(connection_id, "register message is missing nodeId".to_string());
            return;
        };

        let same_identity = self
            .sessions
            .get(connection_id)
            .map(|s| s.node_id() == &node_id);

        match same_identity {
            Some(true) => {
                log::info!("Node {node_id:} refreshed its registration on connection {connection_id:}");
                if let Some(session) = self.sessions.get_mut(connection_id) {
                    session.set_config(config);
                }
                return;
            }
            Some(false) => {
                log::warn!("connection {connection_id:} changed identity to {node_id:}, releasing its devices");
                for address in self.registry.owned_by_connection(connection_id) {
                    self.release(&address, Some(connection_id));
                }
            }
            None => {}
        }

        log::info!("Node {node_id:} registered on connection {connection_id:}");
        self.sessions
            .insert(NodeSession::new(connection_id, node_id, config));
    }

    fn on_device_discovered(
        &mut self,
        connection_id: ConnectionId,
        address: DeviceAddress,
        distance: f64,
        timestamp: Timestamp,
    ) {
        let Some(node_id) = self.registered_node(connection_id, "discovered") else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(connection_id) {
            session.mark_in_range(&address, timestamp, distance);
        }

        let record = self.registry.get_or_create(&address);
        let state = record.state();
        let owner = record.owner().cloned();
        self.registry.touch(&address, timestamp);

        match owner {
            None => self.claim(connection_id, node_id, &address),
            Some(owner) if owner.node_id == node_id => match state {
                ConnectionState::Discovered => {
                    log::debug!("{address:}: registration for {node_id:} already in flight");
                }
                ConnectionState::PendingConnect | ConnectionState::Connected => {
                    // The node thinks the device is free while we think it
                    // is serving it; start over from a clean claim
                    log::warn!(
                        "{address:}: {node_id:} re-announced while {state:?}, resetting claim"
                    );
                    self.release(&address, None);
                    self.claim(connection_id, node_id, &address);
                }
                ConnectionState::Idle => {
                    log::error!("{address:}: idle record still owned by {node_id:}");
                }
            },
            Some(owner) => {
                log::debug!(
                    "{address:}: owned by {}, ignoring claim from {node_id:}",
                    owner.node_id
                );
            }
        }
    }

    fn claim(&mut self, connection_id: ConnectionId, node_id: NodeId, address: &DeviceAddress) {
        let owner = Owner {
            node_id: node_id.clone(),
            connection_id,
        };
        let claim = match self.registry.claim(address, owner) {
            Ok(claim) => claim,
            Err(e) => {
                log::error!("Unable to claim {address:} for {node_id:}: {e:}");
                return;
            }
        };
        log::info!("{address:} claimed by {node_id:} (claim {claim:})");

        if self.registry.cloud_handle(address).is_some() {
            // registered earlier in this process
            self.connect_owner(address, claim);
            return;
        }
        match self.registry.begin_registration(address) {
            Ok(true) => self.spawn_registration(address.clone(), claim),
            Ok(false) => log::debug!("{address:}: claim {claim:} waits on the registration in flight"),
            Err(e) => log::error!("{address:}: {e:}"),
        }
    }

    fn spawn_registration(&self, address: DeviceAddress, claim: ClaimId) {
        let registrar = self.registrar.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = registrar.register(&address).await;
            if let Some(sender) = internal.upgrade() {
                sender
                    .send(CoordinatorEvent::RegistrationComplete {
                        address,
                        claim,
                        result,
                    })
                    .ok();
            }
        });
    }

    fn on_registration_complete(
        &mut self,
        address: &DeviceAddress,
        claim: ClaimId,
        result: Result<Arc<dyn DeviceHandle>, CloudError>,
    ) {
        if let Err(e) = self.registry.finish_registration(address) {
            log::error!("Registration completed for {address:}: {e:}");
            return;
        }
        let Some(record) = self.registry.get(address) else {
            return;
        };
        // a record in Discovered is always waiting on this registration,
        // possibly for a newer claim than the one that started it
        let current = record.state() == ConnectionState::Discovered;
        let waiting = record.claim();

        match result {
            Ok(handle) => {
                match self.registry.set_cloud_handle(address, handle) {
                    Ok(true) => log::debug!("{address:}: cloud handle stored"),
                    Ok(false) => log::debug!("{address:}: cloud handle already present"),
                    Err(e) => log::error!("{address:}: unable to store cloud handle {e:}"),
                }
                if !current {
                    log::debug!("{address:}: registration started for claim {claim:} completed, nobody waiting");
                    return;
                }
                self.connect_owner(address, waiting);
            }
            Err(e) => {
                if !current {
                    log::debug!("{address:}: registration started for claim {claim:} failed, nobody waiting: {e:}");
                    return;
                }
                log::warn!("Cloud registration failed for {address:}: {e:}, releasing claim");
                self.release(address, None);
            }
        }
    }

    fn connect_owner(&mut self, address: &DeviceAddress, claim: ClaimId) {
        if let Err(e) = self
            .registry
            .transition(address, ConnectionState::PendingConnect)
        {
            log::error!("{address:}: {e:}");
            return;
        }
        let Some(owner) = self.registry.get(address).and_then(|r| r.owner().cloned()) else {
            log::error!("{address:}: pending connect without an owner");
            return;
        };

        let directive = GatewayMessage::ConnectDevice {
            device_address: address.clone(),
        };
        if self.send(owner.connection_id, directive) {
            log::info!("Asked {} to connect to {address:}", owner.node_id);
            self.schedule_connect_timeout(address.clone(), claim);
        } else {
            self.release(address, None);
        }
        self.verify(address);
    }

    fn schedule_connect_timeout(&self, address: DeviceAddress, claim: ClaimId) {
        let internal = self.internal.clone();
        let timeout = self.settings.pending_connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(sender) = internal.upgrade() {
                sender
                    .send(CoordinatorEvent::ConnectTimeout { address, claim })
                    .ok();
            }
        });
    }

    fn on_connect_timeout(&mut self, address: &DeviceAddress, claim: ClaimId) {
        let Some(record) = self.registry.get(address) else {
            return;
        };
        if record.claim() != claim || record.state() != ConnectionState::PendingConnect {
            return;
        }
        let target = record.owner().map(|o| o.connection_id);
        log::warn!(
            "{address:}: no connect confirmation within {:?}, releasing",
            self.settings.pending_connect_timeout
        );
        self.release(address, target);
    }

    fn on_device_connected(
        &mut self,
        connection_id: ConnectionId,
        address: DeviceAddress,
        timestamp: Timestamp,
    ) {
        let Some(node_id) = self.registered_node(connection_id, "deviceConnected") else {
            return;
        };
        let Some(record) = self.registry.get(&address) else {
            self.unknown_device(connection_id, &address);
            return;
        };

        if record.state() != ConnectionState::PendingConnect || !record.is_owned_by(&node_id) {
            log::debug!(
                "{address:}: dropping connect confirmation from {node_id:} in state {:?}",
                record.state()
            );
            return;
        }

        if let Err(e) = self
            .registry
            .transition(&address, ConnectionState::Connected)
        {
            log::error!("{address:}: {e:}");
            return;
        }
        self.registry.touch(&address, timestamp);
        if let Some(session) = self.sessions.get_mut(connection_id) {
            session.mark_connected(&address, timestamp);
        }
        match self.cloud_handle(&address) {
            Some(handle) => self.router.activate(handle),
            None => log::error!("{address:}: connected device has no cloud handle"),
        }
        log::info!("{address:} connected via {node_id:}");
        self.verify(&address);
    }

    fn on_device_status(
        &mut self,
        connection_id: ConnectionId,
        address: DeviceAddress,
        distance: f64,
        timestamp: Timestamp,
        data: DeviceData,
    ) {
        let Some(node_id) = self.registered_node(connection_id, "deviceStatus") else {
            return;
        };
        let Some(record) = self.registry.get(&address) else {
            self.unknown_device(connection_id, &address);
            return;
        };
        let serving = record.state() == ConnectionState::Connected && record.is_owned_by(&node_id);

        self.registry.touch(&address, timestamp);
        if let Some(session) = self.sessions.get_mut(connection_id) {
            session.mark_status(&address, timestamp, distance, data.battery_level);
        }

        if !serving {
            log::trace!("{address:}: status from {node_id:} not forwarded, not the serving node");
            return;
        }

        match self.cloud_handle(&address) {
            Some(handle) => self.router.forward(
                handle,
                Telemetry {
                    address,
                    node_id,
                    distance,
                    timestamp,
                    data,
                },
            ),
            None => log::error!("{address:}: connected device has no cloud handle"),
        }
    }

    fn on_device_out_of_range(
        &mut self,
        connection_id: ConnectionId,
        address: DeviceAddress,
        timestamp: Timestamp,
    ) {
        let Some(node_id) = self.registered_node(connection_id, "deviceOutOfRange") else {
            return;
        };
        let Some(record) = self.registry.get(&address) else {
            self.unknown_device(connection_id, &address);
            return;
        };
        let owned = record.is_owned_by(&node_id);

        self.registry.touch(&address, timestamp);
        if let Some(session) = self.sessions.get_mut(connection_id) {
            session.mark_out_of_range(&address, timestamp);
        }

        if owned {
            log::info!("{address:} left the range of {node_id:}");
            self.release(&address, Some(connection_id));
        } else {
            log::info!("{address:} left the range of {node_id:}, which does not own it");
        }
    }

    fn on_device_disconnected_message(&mut self, connection_id: ConnectionId, address: DeviceAddress) {
        let Some(node_id) = self.registered_node(connection_id, "deviceDisconnected") else {
            return;
        };
        let Some(record) = self.registry.get(&address) else {
            self.unknown_device(connection_id, &address);
            return;
        };

        if record.is_owned_by(&node_id) {
            log::info!("{address:} disconnected from {node_id:}");
            self.release(&address, Some(connection_id));
        } else {
            log::debug!("{address:}: disconnect notice from non-owner {node_id:}");
        }
        // next discovery from this node starts a fresh cycle
        if let Some(session) = self.sessions.get_mut(connection_id) {
            session.forget(&address);
        }
    }

    fn on_node_disconnected(&mut self, connection_id: ConnectionId) {
        let Some(session) = self.sessions.remove(connection_id) else {
            log::debug!("connection {connection_id:} already cleaned up");
            return;
        };

        let owned = self.registry.owned_by_connection(connection_id);
        for address in &owned {
            self.release(address, None);
        }
        if let Err(e) = self.registry.check_all() {
            log::error!("Registry invariant violated after disconnect cascade: {e:}");
        }
        log::info!(
            "Node {} on connection {connection_id:} disconnected, released {} device(s)",
            session.node_id(),
            owned.len()
        );
    }

    /// Return a device to `Idle`, stop its cloud-side timers and optionally
    /// tell `notify` to drop the physical connection. Only a node that was
    /// sent `ConnectDevice` is told to disconnect.
    fn release(&mut self, address: &DeviceAddress, notify: Option<ConnectionId>) -> Option<Owner> {
        let handle = self.registry.cloud_handle(address);
        let directed = self.registry.get(address).is_some_and(|r| {
            matches!(
                r.state(),
                ConnectionState::PendingConnect | ConnectionState::Connected
            )
        });
        let owner = match self.registry.release(address) {
            Ok(Some(owner)) => owner,
            Ok(None) => return None,
            Err(e) => {
                log::error!("Unable to release {address:}: {e:}");
                return None;
            }
        };

        if let Some(session) = self.sessions.get_mut(owner.connection_id) {
            session.mark_released(address);
        }
        if let Some(handle) = handle {
            self.router.release(handle);
        }
        if let Some(connection_id) = notify.filter(|_| directed) {
            self.send(
                connection_id,
                GatewayMessage::DisconnectDevice {
                    device_address: address.clone(),
                },
            );
        }
        log::info!("{address:} released by {}", owner.node_id);
        self.verify(address);
        Some(owner)
    }

    fn registered_node(&self, connection_id: ConnectionId, kind: &str) -> Option<NodeId> {
        match self.sessions.get(connection_id) {
            Some(session) => Some(session.node_id().clone()),
            None => {
                log::warn!("connection {connection_id:}: {kind} before registration");
                self.protocol_error(connection_id, format!("{kind} sent before register"));
                None
            }
        }
    }

    fn unknown_device(&self, connection_id: ConnectionId, address: &DeviceAddress) {
        log::warn!("connection {connection_id:}: unknown device {address:}");
        self.protocol_error(connection_id, format!("unknown device {address}"));
    }

    fn protocol_error(&self, connection_id: ConnectionId, description: String) {
        self.send(
            connection_id,
            GatewayMessage::error("protocol error", description),
        );
    }

    fn send(&self, connection_id: ConnectionId, message: GatewayMessage) -> bool {
        match self.channel.send(connection_id, message) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failure to send to connection {connection_id:}: {e:}");
                false
            }
        }
    }

    fn verify(&self, address: &DeviceAddress) {
        if let Err(e) = self.registry.check(address) {
            log::error!("Registry invariant violated: {e:}");
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Device(address, reply) => {
                reply.send(self.registry.snapshot(&address)).ok();
            }
            Query::Devices(reply) => {
                reply.send(self.registry.snapshots()).ok();
            }
            Query::Sessions(reply) => {
                reply.send(self.sessions.snapshots()).ok();
            }
        }
    }
}
