use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Presence state of a service identifier as seen by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
}

impl DeviceStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, DeviceStatus::Connected)
    }
}

/// Body of a status report sent to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub identifier: String,
    pub status: DeviceStatus,
}

/// Reply of the remote service to a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    #[serde(default)]
    pub message: String,
}

/// Successful reply of the allocation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub identifier: String,
}

/// Error body returned by the gateway API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code, e.g. "no_capacity"
    pub error: String,
    pub message: String,
}

/// A device the gateway currently considers connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceView {
    /// Hardware address reported by the radio
    pub address: String,

    /// Service identifier the device connected with
    pub identifier: String,

    /// When the connect transition was emitted
    pub connected_at: DateTime<Utc>,

    /// Last time the device was detected
    pub last_seen: DateTime<Utc>,
}
