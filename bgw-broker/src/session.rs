use bgwp_node::{DeviceAddress, NodeConfig, NodeId, Timestamp};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;

use crate::ConnectionId;

/// What one node currently believes about one device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub last_seen_at: Option<Timestamp>,
    pub last_distance: Option<f64>,
    pub in_range: bool,
    pub connected: bool,
    pub battery_level: Option<u8>,
}

impl DeviceView {
    fn seen(&mut self, ts: Timestamp, distance: Option<f64>) {
        self.last_seen_at = Some(self.last_seen_at.map_or(ts, |prev| prev.max(ts)));
        if distance.is_some() {
            self.last_distance = distance;
        }
    }
}

/// A registered reader node on one live connection
#[derive(Debug, Clone)]
pub struct NodeSession {
    connection_id: ConnectionId,
    node_id: NodeId,
    config: NodeConfig,
    registered_at: DateTime<Local>,
    devices: HashMap<DeviceAddress, DeviceView>,
}

impl NodeSession {
    pub fn new(connection_id: ConnectionId, node_id: NodeId, config: NodeConfig) -> Self {
        Self {
            connection_id,
            node_id,
            config,
            registered_at: Local::now(),
            devices: HashMap::new(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: NodeConfig) {
        self.config = config;
    }

    pub fn view(&self, address: &DeviceAddress) -> Option<&DeviceView> {
        self.devices.get(address)
    }

    pub fn mark_in_range(&mut self, address: &DeviceAddress, ts: Timestamp, distance: f64) {
        let view = self.devices.entry(address.clone()).or_default();
        view.seen(ts, Some(distance));
        view.in_range = true;
    }

    pub fn mark_status(
        &mut self,
        address: &DeviceAddress,
        ts: Timestamp,
        distance: f64,
        battery_level: Option<u8>,
    ) {
        let view = self.devices.entry(address.clone()).or_default();
        view.seen(ts, Some(distance));
        view.in_range = true;
        if battery_level.is_some() {
            view.battery_level = battery_level;
        }
    }

    pub fn mark_connected(&mut self, address: &DeviceAddress, ts: Timestamp) {
        let view = self.devices.entry(address.clone()).or_default();
        view.seen(ts, None);
        view.in_range = true;
        view.connected = true;
    }

    pub fn mark_out_of_range(&mut self, address: &DeviceAddress, ts: Timestamp) {
        let view = self.devices.entry(address.clone()).or_default();
        view.seen(ts, None);
        view.in_range = false;
        view.connected = false;
    }

    /// The gateway no longer considers this node connected to the device
    pub fn mark_released(&mut self, address: &DeviceAddress) {
        if let Some(view) = self.devices.get_mut(address) {
            view.connected = false;
        }
    }

    /// Drop the device from this node's view entirely
    pub fn forget(&mut self, address: &DeviceAddress) -> Option<DeviceView> {
        self.devices.remove(address)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let mut devices: Vec<_> = self
            .devices
            .iter()
            .map(|(a, v)| (a.clone(), v.clone()))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        SessionSnapshot {
            connection_id: self.connection_id,
            node_id: self.node_id.clone(),
            config: self.config.clone(),
            registered_at: self.registered_at,
            devices,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub node_id: NodeId,
    pub config: NodeConfig,
    pub registered_at: DateTime<Local>,
    pub devices: Vec<(DeviceAddress, DeviceView)>,
}

/// Live sessions, keyed by the volatile connection id. A node id may
/// briefly appear on two connections while a reconnect races the old
/// socket's teardown.
#[derive(Debug, Default)]
pub struct SessionTable {
    by_connection: HashMap<ConnectionId, NodeSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }

    /// Insert or replace the session for a connection, returning the one
    /// it replaced
    pub fn insert(&mut self, session: NodeSession) -> Option<NodeSession> {
        if let Some(other) = self
            .by_connection
            .values()
            .find(|s| s.node_id == session.node_id && s.connection_id != session.connection_id)
        {
            log::info!(
                "Node {} registered on connection {} while connection {} is still open",
                session.node_id,
                session.connection_id,
                other.connection_id
            );
        }
        self.by_connection.insert(session.connection_id, session)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&NodeSession> {
        self.by_connection.get(&connection_id)
    }

    pub fn get_mut(&mut self, connection_id: ConnectionId) -> Option<&mut NodeSession> {
        self.by_connection.get_mut(&connection_id)
    }

    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<NodeSession> {
        self.by_connection.remove(&connection_id)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<_> = self.by_connection.values().map(NodeSession::snapshot).collect();
        all.sort_by_key(|s| s.connection_id);
        all
    }
}
