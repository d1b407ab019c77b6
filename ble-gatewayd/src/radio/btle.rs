use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;
use anyhow::{Context, Result, anyhow, bail};
use btleplug::api::{Central as _, CentralEvent, Manager as _, Peripheral as _, PeripheralId, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{Stream, StreamExt};
use crate::config::RadioConfig;
use super::{Detection, DetectionSource, Outcome};

/// Peripherals inspected at the same time within one cycle
const INSPECT_CONCURRENCY: usize = 4;

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Detection source backed by the first BLE adapter on the host.
///
/// Each cycle listens for advertisements for `scan_window`, then connects to
/// every named peripheral that advertised, lists its services and disconnects.
pub struct BtleSource {
    adapter: Adapter,
    events: EventStream,
    scan_window: Duration,
    connect_timeout: Duration,
}

impl BtleSource {
    pub async fn new(config: &RadioConfig) -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to create Bluetooth manager")?;

        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        let info = adapter.adapter_info().await.unwrap_or_default();
        tracing::info!("Using Bluetooth adapter {}", info);

        let events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;

        adapter
            .start_scan(ScanFilter::default())
            .await
            .context("Failed to start BLE scan")?;

        Ok(Self {
            adapter,
            events,
            scan_window: Duration::from_secs(config.scan_window_secs.max(1)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
        })
    }

    /// Ids of peripherals that advertised during the scan window
    async fn collect_advertisers(&mut self) -> Result<HashSet<PeripheralId>> {
        let deadline = tokio::time::Instant::now() + self.scan_window;
        let mut seen = HashSet::new();

        loop {
            match tokio::time::timeout_at(deadline, self.events.next()).await {
                Ok(Some(CentralEvent::DeviceDiscovered(id)))
                | Ok(Some(CentralEvent::DeviceUpdated(id))) => {
                    seen.insert(id);
                }
                Ok(Some(_)) => {}
                Ok(None) => bail!("Adapter event stream closed"),
                Err(_) => break,
            }
        }

        Ok(seen)
    }
}

impl DetectionSource for BtleSource {
    async fn next_batch(&mut self) -> Result<Vec<Detection>> {
        let ids = self.collect_advertisers().await?;

        let mut peripherals = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.adapter.peripheral(id).await {
                Ok(peripheral) => peripherals.push(peripheral),
                Err(e) => tracing::debug!("Peripheral {:?} vanished: {}", id, e),
            }
        }

        let connect_timeout = self.connect_timeout;
        let detections: Vec<Detection> = futures::stream::iter(peripherals)
            .map(|peripheral| async move { inspect(peripheral, connect_timeout).await })
            .buffer_unordered(INSPECT_CONCURRENCY)
            .filter_map(|detection| async move { detection })
            .collect()
            .await;

        Ok(detections)
    }
}

async fn inspect(peripheral: Peripheral, connect_timeout: Duration) -> Option<Detection> {
    let props = match peripheral.properties().await {
        Ok(Some(props)) => props,
        Ok(None) => return None,
        Err(e) => {
            tracing::debug!("Failed to read properties of {}: {}", peripheral.address(), e);
            return None;
        }
    };

    let rssi = props.rssi?;
    let name = props.local_name.unwrap_or_default();
    let address = props.address.to_string();

    // Unnamed devices are never tracked, so don't spend a connection on them
    if name.is_empty() {
        return None;
    }

    let outcome = match tokio::time::timeout(connect_timeout, peripheral.connect()).await {
        Err(_) => Outcome::ConnectFailed(format!("timed out after {:?}", connect_timeout)),
        Ok(Err(e)) => Outcome::ConnectFailed(e.to_string()),
        Ok(Ok(())) => {
            let outcome =
                match tokio::time::timeout(connect_timeout, peripheral.discover_services()).await {
                    Err(_) => {
                        Outcome::DiscoveryFailed(format!("timed out after {:?}", connect_timeout))
                    }
                    Ok(Err(e)) => Outcome::DiscoveryFailed(e.to_string()),
                    Ok(Ok(())) => Outcome::Services(
                        peripheral
                            .services()
                            .iter()
                            .map(|service| service.uuid.to_string())
                            .collect(),
                    ),
                };

            if let Err(e) = peripheral.disconnect().await {
                tracing::debug!("Failed to disconnect from {}: {}", address, e);
            }
            outcome
        }
    };

    Some(Detection {
        address,
        name,
        rssi,
        outcome,
    })
}
