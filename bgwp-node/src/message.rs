use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DeviceAddress, NodeId, Timestamp};

/// Registration payload a reader sends along with its [`NodeId`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Maximum distance (metres) at which the reader reports a device as
    /// in range; the reader filters on this, the gateway only records it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sensor fields carried by a [`NodeMessage::DeviceStatus`]. Anything the
/// gateway does not interpret is kept in `extra` and forwarded as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hazardous: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Messages a reader node sends to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum NodeMessage {
    Register {
        // Optional on the wire so a missing id can be answered with an
        // error instead of failing the decode
        #[serde(default)]
        node_id: Option<NodeId>,
        #[serde(default)]
        config_data: NodeConfig,
    },
    Discovered {
        device_address: DeviceAddress,
        distance: f64,
        timestamp: Timestamp,
    },
    DeviceStatus {
        device_address: DeviceAddress,
        distance: f64,
        timestamp: Timestamp,
        #[serde(default)]
        data: DeviceData,
    },
    DeviceOutOfRange {
        device_address: DeviceAddress,
        timestamp: Timestamp,
    },
    DeviceConnected {
        device_address: DeviceAddress,
        timestamp: Timestamp,
    },
    DeviceDisconnected {
        device_address: DeviceAddress,
    },
}

impl NodeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeMessage::Register { .. } => "register",
            NodeMessage::Discovered { .. } => "discovered",
            NodeMessage::DeviceStatus { .. } => "deviceStatus",
            NodeMessage::DeviceOutOfRange { .. } => "deviceOutOfRange",
            NodeMessage::DeviceConnected { .. } => "deviceConnected",
            NodeMessage::DeviceDisconnected { .. } => "deviceDisconnected",
        }
    }

    pub fn device_address(&self) -> Option<&DeviceAddress> {
        match self {
            NodeMessage::Register { .. } => None,
            NodeMessage::Discovered { device_address, .. }
            | NodeMessage::DeviceStatus { device_address, .. }
            | NodeMessage::DeviceOutOfRange { device_address, .. }
            | NodeMessage::DeviceConnected { device_address, .. }
            | NodeMessage::DeviceDisconnected { device_address } => Some(device_address),
        }
    }
}

/// Messages the gateway sends to a reader node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum GatewayMessage {
    ConnectDevice {
        device_address: DeviceAddress,
    },
    DisconnectDevice {
        device_address: DeviceAddress,
    },
    Error {
        error_text: String,
        description: String,
    },
}

impl GatewayMessage {
    pub fn error(error_text: impl Into<String>, description: impl Into<String>) -> Self {
        GatewayMessage::Error {
            error_text: error_text.into(),
            description: description.into(),
        }
    }
}
