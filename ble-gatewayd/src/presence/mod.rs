pub mod digest;
pub mod queue;
pub mod tracker;

use std::future::Future;
use shared::types::DeviceStatus;

pub use queue::ReportQueue;
pub use tracker::{PresenceTracker, TrackerSettings};

/// A connect or disconnect the tracker committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub address: String,
    pub identifier: String,
    pub status: DeviceStatus,
}

impl Transition {
    pub fn connected(address: &str, identifier: &str) -> Self {
        Self {
            address: address.to_string(),
            identifier: identifier.to_string(),
            status: DeviceStatus::Connected,
        }
    }

    pub fn disconnected(address: &str, identifier: &str) -> Self {
        Self {
            address: address.to_string(),
            identifier: identifier.to_string(),
            status: DeviceStatus::Disconnected,
        }
    }
}

/// Receives every committed transition exactly once, in commit order.
/// Delivery is best-effort: implementations swallow their own failures.
/// The tracker awaits `report` on the scan path, so a sink that talks to the
/// network belongs behind a `ReportQueue`.
pub trait StatusSink: Send + Sync {
    fn report(&self, transition: &Transition) -> impl Future<Output = ()> + Send;
}
