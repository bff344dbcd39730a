use actix::{prelude::*, Actor, Addr};
use bgwp_node::DeviceAddress;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::Duration,
};

use crate::{
    cloud::{CloudEvent, LocalRegistrar},
    coordinator::{spawn_coordinator, CoordinatorError, CoordinatorHandle, CoordinatorSettings},
    registry::DeviceSnapshot,
    session::SessionSnapshot,
    transport::{ConnectionTable, NodeListener, TransportError},
    ClientId,
};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Transport Error")]
    Transport(#[from] TransportError),
    #[error("Coordinator Error")]
    Coordinator(#[from] CoordinatorError),
    #[error("Invalid listen address")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("ActorError")]
    ActorError,
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub listen: SocketAddr,
    pub node_idle_timeout: Duration,
    pub pending_connect_timeout: Duration,
    pub presence_interval: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7420)),
            node_idle_timeout: Duration::from_secs(crate::DEFAULT_NODE_TIMEOUT),
            pending_connect_timeout: Duration::from_secs(crate::DEFAULT_PENDING_CONNECT_TIMEOUT),
            presence_interval: Duration::from_secs(crate::DEFAULT_PRESENCE_INTERVAL),
        }
    }
}

impl GatewayOptions {
    pub fn with_listen(mut self, listen: &str) -> Result<Self, BrokerError> {
        self.listen = listen.parse()?;
        Ok(self)
    }

    pub fn default_listen() -> &'static str {
        crate::DEFAULT_LISTEN_ADDR
    }
}

enum ClientApi {
    Subscribe {
        id: ClientId,
        cloud_events: UnboundedSender<CloudEvent>,
    },
    Unsubscribe {
        id: ClientId,
    },
}

/// Fans cloud events out to subscribed clients
struct Gateway {
    cloud_events: UnboundedReceiver<CloudEvent>,
    subscribers: HashMap<ClientId, UnboundedSender<CloudEvent>>,
    subscription_receiver: UnboundedReceiver<ClientApi>,
}

impl Gateway {
    async fn event_loop(&mut self) {
        loop {
            tokio::select! {
                Some(event) = self.cloud_events.recv() => {
                    log::trace!("cloud event {event:?}");
                    self.subscribers.iter().for_each(|(key, val)| {
                        val.send(event.clone()).map_err(|e| {
                            log::error!("Failure to send to client event \
                                receiver {e:} for client ID {key:}");
                        }).ok();
                    });
                }
                Some(msg) = self.subscription_receiver.recv() => {
                    match msg {
                        ClientApi::Subscribe { id, cloud_events } => {
                            self.subscribers.insert(id, cloud_events);
                            log::debug!("Subscribed client ID {id:}");
                        }
                        ClientApi::Unsubscribe { id } => {
                            if self.subscribers.remove(&id).is_none() {
                                log::warn!("Removing non-existent subscriber ID {id:}");
                            } else {
                                log::debug!("Unsubscribed client ID {id:}");
                            }
                        }
                    }
                }
                else => break,
            };
        }
    }
}

/// The [`GatewayHandle`] gives clients subscription to [`CloudEvent`]s
/// and read access to gateway state. Dropping the last address stops the
/// gateway's background tasks.
pub struct GatewayHandle {
    api: UnboundedSender<ClientApi>,
    coordinator: CoordinatorHandle,
    local_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Public client API for instantiating the gateway: binds the node
/// listener, starts the coordinator with a [`LocalRegistrar`], and returns
/// the actor handle. Must be called from within an actix system.
pub async fn gateway(options: GatewayOptions) -> Result<Addr<GatewayHandle>, BrokerError> {
    let (cloud_tx, cloud_rx) = unbounded_channel();
    let registrar = Arc::new(LocalRegistrar::new(cloud_tx, options.presence_interval));
    let table = Arc::new(ConnectionTable::new());

    let (coordinator, coordinator_task) = spawn_coordinator(
        registrar,
        table.clone(),
        CoordinatorSettings {
            pending_connect_timeout: options.pending_connect_timeout,
        },
    );

    let listener = NodeListener::bind(
        options.listen,
        table,
        coordinator.clone(),
        options.node_idle_timeout,
    )
    .await?;
    let local_addr = listener.local_addr()?;
    let listener_task = tokio::spawn(listener.run());

    let (api, subscription_receiver) = unbounded_channel();
    let mut gateway = Gateway {
        cloud_events: cloud_rx,
        subscribers: HashMap::new(),
        subscription_receiver,
    };
    let fanout_task = tokio::spawn(async move {
        gateway.event_loop().await;
        log::warn!("Gateway exiting event loop");
    });

    log::info!("Gateway listening for nodes on {local_addr:}");

    Ok(GatewayHandle {
        api,
        coordinator,
        local_addr,
        tasks: vec![listener_task, fanout_task, coordinator_task],
    }
    .start())
}

impl Actor for GatewayHandle {
    type Context = Context<Self>;
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Message)]
#[rtype(result = "ClientSubscribeResponse")]
pub struct ClientSubscribe {
    pub id: ClientId,
    pub cloud_events: UnboundedSender<CloudEvent>,
}
type ClientSubscribeResponse = Result<(), BrokerError>;

impl Handler<ClientSubscribe> for GatewayHandle {
    type Result = ClientSubscribeResponse;

    fn handle(&mut self, msg: ClientSubscribe, _ctx: &mut Self::Context) -> Self::Result {
        self.api
            .send(ClientApi::Subscribe {
                id: msg.id,
                cloud_events: msg.cloud_events,
            })
            .map_err(|e| {
                log::error!("Error sending sub to actor {e:}");
                BrokerError::ActorError
            })?;
        Ok(())
    }
}

#[derive(Message)]
#[rtype(result = "ClientUnsubscribeResponse")]
pub struct ClientUnsubscribe {
    pub id: ClientId,
}

type ClientUnsubscribeResponse = Result<(), BrokerError>;

impl Handler<ClientUnsubscribe> for GatewayHandle {
    type Result = ClientUnsubscribeResponse;

    fn handle(&mut self, msg: ClientUnsubscribe, _ctx: &mut Self::Context) -> Self::Result {
        self.api
            .send(ClientApi::Unsubscribe { id: msg.id })
            .map_err(|e| {
                log::error!("Error sending unsub to actor {e:}");
                BrokerError::ActorError
            })?;
        Ok(())
    }
}

/// Snapshot of every device record the gateway has seen
#[derive(Message)]
#[rtype(result = "Result<Vec<DeviceSnapshot>, BrokerError>")]
pub struct ListDevices;

impl Handler<ListDevices> for GatewayHandle {
    type Result = ResponseFuture<Result<Vec<DeviceSnapshot>, BrokerError>>;

    fn handle(&mut self, _msg: ListDevices, _ctx: &mut Self::Context) -> Self::Result {
        let coordinator = self.coordinator.clone();
        Box::pin(async move { Ok(coordinator.devices().await?) })
    }
}

/// Snapshot of every registered node session
#[derive(Message)]
#[rtype(result = "Result<Vec<SessionSnapshot>, BrokerError>")]
pub struct ListNodes;

impl Handler<ListNodes> for GatewayHandle {
    type Result = ResponseFuture<Result<Vec<SessionSnapshot>, BrokerError>>;

    fn handle(&mut self, _msg: ListNodes, _ctx: &mut Self::Context) -> Self::Result {
        let coordinator = self.coordinator.clone();
        Box::pin(async move { Ok(coordinator.sessions().await?) })
    }
}

#[derive(Message)]
#[rtype(result = "Result<Option<DeviceSnapshot>, BrokerError>")]
pub struct LookupDevice(pub DeviceAddress);

impl Handler<LookupDevice> for GatewayHandle {
    type Result = ResponseFuture<Result<Option<DeviceSnapshot>, BrokerError>>;

    fn handle(&mut self, msg: LookupDevice, _ctx: &mut Self::Context) -> Self::Result {
        let coordinator = self.coordinator.clone();
        Box::pin(async move { Ok(coordinator.device(msg.0).await?) })
    }
}

/// Address the node listener actually bound, useful with port 0
#[derive(Message)]
#[rtype(result = "SocketAddr")]
pub struct LocalAddr;

impl Handler<LocalAddr> for GatewayHandle {
    type Result = MessageResult<LocalAddr>;

    fn handle(&mut self, _msg: LocalAddr, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.local_addr)
    }
}
