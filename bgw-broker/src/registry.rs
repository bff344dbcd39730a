use bgwp_node::{DeviceAddress, NodeId, Timestamp};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

use crate::{cloud::DeviceHandle, ConnectionId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceAddress),
    #[error("Illegal transition {from:?} -> {to:?} for {address}")]
    IllegalTransition {
        address: DeviceAddress,
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("Device {address} already owned by {owner}")]
    AlreadyOwned { address: DeviceAddress, owner: NodeId },
    #[error("Inconsistent record for {0}: {1}")]
    Inconsistent(DeviceAddress, &'static str),
}

/// Where a physical device is in its claim cycle. Every state other than
/// `Idle` has exactly one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Idle,
    /// Claimed by a node, cloud registration in flight
    Discovered,
    /// Owner has been told to connect, waiting for its confirmation
    PendingConnect,
    Connected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Discovered)
                | (Discovered, PendingConnect)
                | (PendingConnect, Connected)
                | (Discovered, Idle)
                | (PendingConnect, Idle)
                | (Connected, Idle)
        )
    }
}

/// The node (and the specific connection of that node) holding a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub node_id: NodeId,
    pub connection_id: ConnectionId,
}

/// Identifies one claim cycle; async completions carry it so results for
/// a cycle that has since been released are recognised as stale
pub type ClaimId = u64;

#[derive(Debug)]
pub struct DeviceRecord {
    address: DeviceAddress,
    owner: Option<Owner>,
    state: ConnectionState,
    cloud_handle: Option<Arc<dyn DeviceHandle>>,
    last_seen_at: Option<Timestamp>,
    claim: ClaimId,
    // a registrar call for this address has not returned yet
    registering: bool,
}

impl DeviceRecord {
    fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            owner: None,
            state: ConnectionState::Idle,
            cloud_handle: None,
            last_seen_at: None,
            claim: 0,
            registering: false,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn claim(&self) -> ClaimId {
        self.claim
    }

    pub fn cloud_handle(&self) -> Option<Arc<dyn DeviceHandle>> {
        self.cloud_handle.clone()
    }

    pub fn is_registering(&self) -> bool {
        self.registering
    }

    pub fn last_seen_at(&self) -> Option<Timestamp> {
        self.last_seen_at
    }

    pub fn is_owned_by(&self, node_id: &NodeId) -> bool {
        self.owner.as_ref().is_some_and(|o| &o.node_id == node_id)
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            address: self.address.clone(),
            owner: self.owner.as_ref().map(|o| o.node_id.clone()),
            connection_id: self.owner.as_ref().map(|o| o.connection_id),
            state: self.state,
            registered: self.cloud_handle.is_some(),
            registering: self.registering,
            last_seen_at: self.last_seen_at,
        }
    }
}

/// Read-only copy of a [`DeviceRecord`] handed out to queries
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub address: DeviceAddress,
    pub owner: Option<NodeId>,
    pub connection_id: Option<ConnectionId>,
    pub state: ConnectionState,
    pub registered: bool,
    pub registering: bool,
    pub last_seen_at: Option<Timestamp>,
}

/// Global per-address bookkeeping. Records are created on first discovery
/// and never removed, so a device coming back reuses its cloud handle.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceAddress, DeviceRecord>,
    next_claim: ClaimId,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&DeviceRecord> {
        self.devices.get(address)
    }

    pub fn get_or_create(&mut self, address: &DeviceAddress) -> &DeviceRecord {
        self.devices.entry(address.clone()).or_insert_with(|| {
            log::debug!("New device record for {address:}");
            DeviceRecord::new(address.clone())
        })
    }

    fn record_mut(&mut self, address: &DeviceAddress) -> Result<&mut DeviceRecord, RegistryError> {
        self.devices
            .get_mut(address)
            .ok_or_else(|| RegistryError::UnknownDevice(address.clone()))
    }

    pub fn touch(&mut self, address: &DeviceAddress, ts: Timestamp) {
        if let Some(record) = self.devices.get_mut(address) {
            record.last_seen_at = Some(record.last_seen_at.map_or(ts, |prev| prev.max(ts)));
        }
    }

    /// Hand an idle device to `owner`, moving it to `Discovered`. Fails if
    /// anyone (including `owner`) already holds it.
    pub fn claim(&mut self, address: &DeviceAddress, owner: Owner) -> Result<ClaimId, RegistryError> {
        self.next_claim += 1;
        let claim = self.next_claim;

        let record = self.record_mut(address)?;
        if let Some(current) = &record.owner {
            return Err(RegistryError::AlreadyOwned {
                address: address.clone(),
                owner: current.node_id.clone(),
            });
        }
        Self::apply(record, ConnectionState::Discovered)?;
        record.owner = Some(owner);
        record.claim = claim;
        Ok(claim)
    }

    /// Single transition function for the claim cycle. Moving to `Idle`
    /// drops the owner; the cloud handle is always kept.
    pub fn transition(
        &mut self,
        address: &DeviceAddress,
        next: ConnectionState,
    ) -> Result<(), RegistryError> {
        let record = self.record_mut(address)?;
        Self::apply(record, next)?;
        if next == ConnectionState::Idle {
            record.owner = None;
        }
        Ok(())
    }

    fn apply(record: &mut DeviceRecord, next: ConnectionState) -> Result<(), RegistryError> {
        if !record.state.can_transition_to(next) {
            return Err(RegistryError::IllegalTransition {
                address: record.address.clone(),
                from: record.state,
                to: next,
            });
        }
        log::trace!("{}: {:?} -> {:?}", record.address, record.state, next);
        record.state = next;
        Ok(())
    }

    /// Return a device to `Idle`, yielding the previous owner. Releasing an
    /// idle device is a no-op.
    pub fn release(&mut self, address: &DeviceAddress) -> Result<Option<Owner>, RegistryError> {
        let record = self.record_mut(address)?;
        if record.state == ConnectionState::Idle {
            return Ok(None);
        }
        let owner = record.owner.take();
        Self::apply(record, ConnectionState::Idle)?;
        Ok(owner)
    }

    /// Remember the cloud handle for an address. The first handle wins;
    /// returns false if one was already recorded.
    pub fn set_cloud_handle(
        &mut self,
        address: &DeviceAddress,
        handle: Arc<dyn DeviceHandle>,
    ) -> Result<bool, RegistryError> {
        let record = self.record_mut(address)?;
        if record.cloud_handle.is_some() {
            return Ok(false);
        }
        record.cloud_handle = Some(handle);
        Ok(true)
    }

    /// Mark a registrar call as started for the address. Returns false if
    /// one is already in flight, in which case its result serves every
    /// claim made in the meantime.
    pub fn begin_registration(&mut self, address: &DeviceAddress) -> Result<bool, RegistryError> {
        let record = self.record_mut(address)?;
        if record.registering {
            return Ok(false);
        }
        record.registering = true;
        Ok(true)
    }

    pub fn finish_registration(&mut self, address: &DeviceAddress) -> Result<(), RegistryError> {
        self.record_mut(address)?.registering = false;
        Ok(())
    }

    pub fn cloud_handle(&self, address: &DeviceAddress) -> Option<Arc<dyn DeviceHandle>> {
        self.devices.get(address).and_then(|r| r.cloud_handle())
    }

    pub fn owned_by_connection(&self, connection_id: ConnectionId) -> Vec<DeviceAddress> {
        self.devices
            .values()
            .filter(|r| {
                r.owner
                    .as_ref()
                    .is_some_and(|o| o.connection_id == connection_id)
            })
            .map(|r| r.address.clone())
            .collect()
    }

    /// A record has an owner exactly when it is not idle
    pub fn check(&self, address: &DeviceAddress) -> Result<(), RegistryError> {
        let record = self
            .devices
            .get(address)
            .ok_or_else(|| RegistryError::UnknownDevice(address.clone()))?;
        match (record.state, &record.owner) {
            (ConnectionState::Idle, Some(_)) => Err(RegistryError::Inconsistent(
                address.clone(),
                "idle device still has an owner",
            )),
            (ConnectionState::Idle, None) => Ok(()),
            (_, None) => Err(RegistryError::Inconsistent(
                address.clone(),
                "claimed device has no owner",
            )),
            (_, Some(_)) => Ok(()),
        }
    }

    pub fn check_all(&self) -> Result<(), RegistryError> {
        self.devices.keys().try_for_each(|a| self.check(a))
    }

    pub fn snapshot(&self, address: &DeviceAddress) -> Option<DeviceSnapshot> {
        self.devices.get(address).map(DeviceRecord::snapshot)
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<_> = self.devices.values().map(DeviceRecord::snapshot).collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }
}
