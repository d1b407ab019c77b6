use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use crate::presence::{PresenceTracker, StatusSink};
use crate::radio::DetectionSource;
use crate::registry::ActivationLookup;

/// What one scan cycle did, for logging
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub detections: usize,
    pub transitions: usize,
    pub timed_out: usize,
}

/// Scan loop: sweep timeouts, then pull and process one batch of detections,
/// every `scan_interval` until cancelled
pub async fn run<L, S, D>(
    tracker: Arc<PresenceTracker<L, S>>,
    mut source: D,
    scan_interval: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    L: ActivationLookup,
    S: StatusSink,
    D: DetectionSource,
{
    let mut interval = tokio::time::interval(scan_interval);
    // A slow cycle pushes the next one back instead of bunching them up
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tracing::debug!("Starting scan cycle to refresh device states");
                let summary = run_cycle(&tracker, &mut source).await;
                if summary.transitions > 0 || summary.timed_out > 0 {
                    tracing::info!(
                        "Scan cycle: {} detections, {} transitions, {} timed out",
                        summary.detections,
                        summary.transitions,
                        summary.timed_out
                    );
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Scan loop shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// One scan cycle. Timeouts are checked before the fresh detection pass.
pub async fn run_cycle<L, S, D>(tracker: &PresenceTracker<L, S>, source: &mut D) -> CycleSummary
where
    L: ActivationLookup,
    S: StatusSink,
    D: DetectionSource,
{
    let mut summary = CycleSummary {
        timed_out: tracker.sweep_timeouts(Instant::now()).await.len(),
        ..CycleSummary::default()
    };

    let batch = match source.next_batch().await {
        Ok(batch) => batch,
        Err(e) => {
            tracing::error!("Error scanning for devices: {:#}", e);
            return summary;
        }
    };

    summary.detections = batch.len();
    for detection in &batch {
        summary.transitions += tracker.on_detection(detection, Instant::now()).await.len();
    }
    summary
}
