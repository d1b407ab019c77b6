#[cfg(feature = "bluetooth")]
pub mod btle;
pub mod replay;

use std::future::Future;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One sighting of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    /// Hardware address as formatted by the driver
    pub address: String,

    /// Advertised local name; empty means the detection is ignored
    #[serde(default)]
    pub name: String,

    /// Signal strength in dBm
    pub rssi: i16,

    pub outcome: Outcome,
}

/// What happened when the gateway tried to look inside the peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Connected and discovered these service identifiers
    Services(Vec<String>),
    ConnectFailed(String),
    DiscoveryFailed(String),
}

impl Detection {
    pub fn services(address: &str, name: &str, rssi: i16, services: &[&str]) -> Self {
        Self {
            address: address.to_string(),
            name: name.to_string(),
            rssi,
            outcome: Outcome::Services(services.iter().map(|s| s.to_string()).collect()),
        }
    }
}

/// Pulled once per scan cycle; hands back every detection made during that
/// cycle. The tracker never talks to a radio directly, so a real adapter and
/// recorded cycles drive it the same way.
pub trait DetectionSource: Send {
    /// Detections made during one scan cycle. Must return within a bounded time.
    fn next_batch(&mut self) -> impl Future<Output = Result<Vec<Detection>>> + Send;
}

/// The source selected at startup.
pub enum RadioSource {
    Replay(replay::ReplaySource),
    #[cfg(feature = "bluetooth")]
    Btle(btle::BtleSource),
}

impl DetectionSource for RadioSource {
    async fn next_batch(&mut self) -> Result<Vec<Detection>> {
        match self {
            RadioSource::Replay(source) => source.next_batch().await,
            #[cfg(feature = "bluetooth")]
            RadioSource::Btle(source) => source.next_batch().await,
        }
    }
}
