//! The `bgw-broker` crate is the gateway layer of the BLE wearable system.
//! Reader nodes scattered around a site each see some subset of the
//! wearable sensors; the gateway decides which node is responsible for
//! each sensor, brokers the physical BLE connect / disconnect, and relays
//! sensor telemetry to the cloud side.
//!
//! The crate is composed of the following pieces:
//! 1. [`DeviceRegistry`]: one [`DeviceRecord`] per physical device address,
//!    tracking the owning node and where the device is in its claim cycle
//!    ([`ConnectionState`])
//! 2. [`SessionTable`]: one [`NodeSession`] per registered node connection,
//!    holding that node's view of the devices it reports on
//! 3. [`ConnectionCoordinator`]: the state machine that consumes node and
//!    device events and is the only writer of the two tables above. It runs
//!    as a single task fed through a [`CoordinatorHandle`]:
//!    a. First claimant wins: a device owned by one node is never handed
//!       to another until it is released (out of range, explicit
//!       disconnect, connect timeout, or the owner's connection dropping)
//!    b. Cloud registration happens once per address per process, the
//!       resulting [`DeviceHandle`] is kept for every later claim
//! 4. [`TelemetryRouter`]: forwards status reports from the serving node to
//!    the device's cloud handle
//! 5. The node transport ([`NodeListener`], [`ConnectionTable`]): newline
//!    delimited JSON over TCP, one volatile [`ConnectionId`] per socket
//!
//! The top-level [`gateway`] function wires all of this together with the
//! bundled [`LocalRegistrar`] and returns an actor handle clients use to
//! subscribe to [`CloudEvent`]s and inspect gateway state.
//!
//! # Examples
//! ```no_run
//! #[actix::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = bgw_broker::gateway(bgw_broker::GatewayOptions::default())
//!         .await
//!         .map_err(|e| {
//!             log::error!("Error creating gateway & handle {e:}");
//!             e
//!         })?;
//!
//!     let (cloud_tx, mut cloud_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//!     // The provided client ID must be unique for each subscriber
//!     handle
//!         .send(bgw_broker::ClientSubscribe {
//!             id: 0,
//!             cloud_events: cloud_tx,
//!         })
//!         .await??;
//!
//!     while let Some(event) = cloud_rx.recv().await {
//!         log::info!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

mod broker;
mod cloud;
mod coordinator;
mod registry;
mod router;
mod session;
mod transport;

pub use broker::{
    gateway, BrokerError, ClientSubscribe, ClientUnsubscribe, GatewayHandle, GatewayOptions,
    ListDevices, ListNodes, LocalAddr, LookupDevice,
};
pub use cloud::{
    AlertKind, CloudError, CloudEvent, CloudRegistrar, DeviceHandle, LocalDeviceHandle,
    LocalRegistrar, Telemetry,
};
pub use coordinator::{
    spawn_coordinator, ConnectionCoordinator, CoordinatorError, CoordinatorHandle,
    CoordinatorSettings,
};
pub use registry::{
    ClaimId, ConnectionState, DeviceRecord, DeviceRegistry, DeviceSnapshot, Owner, RegistryError,
};
pub use router::TelemetryRouter;
pub use session::{DeviceView, NodeSession, SessionSnapshot, SessionTable};
pub use transport::{ConnectionTable, NodeChannel, NodeListener, TransportError};

/// Volatile id of one node socket; a reconnecting node gets a new one
pub type ConnectionId = u64;

/// [`ClientId`] is used with subscribing to gateway events
pub type ClientId = u32;

// Seconds without any frame before a node connection is considered dead
const DEFAULT_NODE_TIMEOUT: u64 = 100;

// Seconds a device may wait in PendingConnect for the node's confirmation
const DEFAULT_PENDING_CONNECT_TIMEOUT: u64 = 30;

// Seconds between presence heartbeats of a served device
const DEFAULT_PRESENCE_INTERVAL: u64 = 60;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7420";
