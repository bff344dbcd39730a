//! The cloud side of the gateway, as seen by the coordinator: a registrar
//! that turns a device address into a [`DeviceHandle`], and the handle
//! used to push telemetry for that device.
//!
//! [`LocalRegistrar`] is the bundled implementation. Instead of talking to
//! a remote device-management service it publishes [`CloudEvent`]s on a
//! channel that the gateway fans out to subscribers.

use async_trait::async_trait;
use bgwp_node::{DeviceAddress, DeviceData, NodeId, Timestamp};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use thiserror::Error;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle, time::Duration};

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Registration rejected: {0}")]
    Rejected(String),
    #[error("Cloud event sink closed")]
    SinkClosed,
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// One status report, tagged with the node that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub address: DeviceAddress,
    pub node_id: NodeId,
    pub distance: f64,
    pub timestamp: Timestamp,
    pub data: DeviceData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    Hazard,
}

/// Everything a [`LocalRegistrar`] and its handles report upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CloudEvent {
    Registered {
        address: DeviceAddress,
    },
    Telemetry(Telemetry),
    Alert {
        address: DeviceAddress,
        node_id: NodeId,
        timestamp: Timestamp,
        kind: AlertKind,
    },
    Presence {
        address: DeviceAddress,
        node_id: Option<NodeId>,
        at: DateTime<Local>,
    },
    Released {
        address: DeviceAddress,
    },
}

/// Registration sink. Must be idempotent per address: registering the
/// same address twice yields the same device on the cloud side.
#[async_trait]
pub trait CloudRegistrar: Send + Sync {
    async fn register(&self, address: &DeviceAddress) -> Result<Arc<dyn DeviceHandle>, CloudError>;
}

#[async_trait]
pub trait DeviceHandle: Send + Sync + Debug {
    fn address(&self) -> &DeviceAddress;

    async fn publish(&self, telemetry: Telemetry) -> Result<(), CloudError>;

    /// Called when a node confirms the connection, before any telemetry of
    /// that serving cycle
    fn activate(&self) {}

    /// Called whenever the device stops being served by a node. Stops any
    /// timers tied to the handle; the handle itself stays valid.
    fn cleanup(&self);
}

pub struct LocalRegistrar {
    handles: Mutex<HashMap<DeviceAddress, Arc<LocalDeviceHandle>>>,
    sink: UnboundedSender<CloudEvent>,
    presence_interval: Duration,
}

impl LocalRegistrar {
    pub fn new(sink: UnboundedSender<CloudEvent>, presence_interval: Duration) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            sink,
            presence_interval,
        }
    }
}

#[async_trait]
impl CloudRegistrar for LocalRegistrar {
    async fn register(&self, address: &DeviceAddress) -> Result<Arc<dyn DeviceHandle>, CloudError> {
        let mut handles = self.handles.lock().map_err(|_| CloudError::LockPoisoned)?;
        if let Some(handle) = handles.get(address) {
            log::debug!("{address:} already registered, reusing handle");
            return Ok(handle.clone());
        }

        let handle = Arc::new(LocalDeviceHandle::new(
            address.clone(),
            self.sink.clone(),
            self.presence_interval,
        ));
        handles.insert(address.clone(), handle.clone());
        self.sink
            .send(CloudEvent::Registered {
                address: address.clone(),
            })
            .map_err(|_| CloudError::SinkClosed)?;
        log::info!("Registered cloud device for {address:}");
        Ok(handle)
    }
}

/// Per-device handle of the [`LocalRegistrar`]. While a device is being
/// served it emits a presence heartbeat every `presence_interval`.
#[derive(Debug)]
pub struct LocalDeviceHandle {
    address: DeviceAddress,
    sink: UnboundedSender<CloudEvent>,
    presence_interval: Duration,
    last_node: Arc<Mutex<Option<NodeId>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    // cleared by cleanup, set again by activate
    serving: AtomicBool,
}

impl LocalDeviceHandle {
    fn new(
        address: DeviceAddress,
        sink: UnboundedSender<CloudEvent>,
        presence_interval: Duration,
    ) -> Self {
        Self {
            address,
            sink,
            presence_interval,
            last_node: Arc::new(Mutex::new(None)),
            heartbeat: Mutex::new(None),
            serving: AtomicBool::new(true),
        }
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .map(|h| h.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    fn ensure_heartbeat(&self) -> Result<(), CloudError> {
        if !self.serving.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut heartbeat = self.heartbeat.lock().map_err(|_| CloudError::LockPoisoned)?;
        if heartbeat.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let address = self.address.clone();
        let sink = self.sink.clone();
        let last_node = self.last_node.clone();
        let interval = self.presence_interval;
        *heartbeat = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            // first tick completes immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                let node_id = last_node.lock().ok().and_then(|node| (*node).clone());
                let presence = CloudEvent::Presence {
                    address: address.clone(),
                    node_id,
                    at: Local::now(),
                };
                if sink.send(presence).is_err() {
                    log::warn!("Cloud sink closed, stopping presence heartbeat for {address:}");
                    break;
                }
            }
        }));
        Ok(())
    }
}

#[async_trait]
impl DeviceHandle for LocalDeviceHandle {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    async fn publish(&self, telemetry: Telemetry) -> Result<(), CloudError> {
        {
            let mut last = self.last_node.lock().map_err(|_| CloudError::LockPoisoned)?;
            *last = Some(telemetry.node_id.clone());
        }
        self.ensure_heartbeat()?;

        if telemetry.data.hazardous == Some(true) {
            log::warn!(
                "Hazard reported for {} via node {}",
                telemetry.address,
                telemetry.node_id
            );
            self.sink
                .send(CloudEvent::Alert {
                    address: telemetry.address.clone(),
                    node_id: telemetry.node_id.clone(),
                    timestamp: telemetry.timestamp,
                    kind: AlertKind::Hazard,
                })
                .map_err(|_| CloudError::SinkClosed)?;
        }

        self.sink
            .send(CloudEvent::Telemetry(telemetry))
            .map_err(|_| CloudError::SinkClosed)
    }

    fn activate(&self) {
        self.serving.store(true, Ordering::SeqCst);
    }

    fn cleanup(&self) {
        self.serving.store(false, Ordering::SeqCst);
        if let Ok(mut heartbeat) = self.heartbeat.lock() {
            if let Some(task) = heartbeat.take() {
                task.abort();
            }
        }
        if let Ok(mut last) = self.last_node.lock() {
            *last = None;
        }
        self.sink
            .send(CloudEvent::Released {
                address: self.address.clone(),
            })
            .map_err(|e| log::error!("Failure to send release for {}: {e:}", self.address))
            .ok();
    }
}

impl Drop for LocalDeviceHandle {
    fn drop(&mut self) {
        if let Ok(mut heartbeat) = self.heartbeat.lock() {
            if let Some(task) = heartbeat.take() {
                task.abort();
            }
        }
    }
}
