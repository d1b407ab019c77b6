use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use shared::types::PresenceView;
use crate::config::PresenceConfig;
use crate::radio::{Detection, Outcome};
use crate::registry::ActivationLookup;
use super::digest::compute_digest;
use super::{StatusSink, Transition};

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub rssi_threshold: i16,
    pub detection_timeout: Duration,
    pub generic_service: String,
}

impl From<&PresenceConfig> for TrackerSettings {
    fn from(config: &PresenceConfig) -> Self {
        Self {
            rssi_threshold: config.rssi_threshold,
            detection_timeout: config.detection_timeout(),
            generic_service: config.generic_service.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    identifier: String,
    last_seen: Instant,
    connected_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl PresenceEntry {
    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_seen_at = Utc::now();
    }
}

/// Why an address is being disconnected; only used for logging.
#[derive(Debug)]
enum DisconnectCause {
    WeakSignal(i16),
    ConnectFailed(String),
    DiscoveryFailed(String),
    Deactivated(String),
}

#[derive(Debug)]
enum Verdict {
    Connect(String),
    Disconnect(DisconnectCause),
}

/// Presence state machine.
///
/// Turns the noisy detection stream into connect/disconnect transitions. An
/// address has an entry in the map exactly while it is connected, so a connect
/// is only emitted when the entry is created and a disconnect only when it is
/// removed. Both happen under the map lock; the transitions collected there are
/// handed to the status sink after the lock is released, in commit order.
pub struct PresenceTracker<L, S> {
    settings: TrackerSettings,
    entries: Mutex<HashMap<String, PresenceEntry>>,
    registry: L,
    sink: S,
    digest_tx: watch::Sender<String>,
}

impl<L: ActivationLookup, S: StatusSink> PresenceTracker<L, S> {
    pub fn new(settings: TrackerSettings, registry: L, sink: S) -> Self {
        let (digest_tx, _) = watch::channel(compute_digest(Vec::new()));
        Self {
            settings,
            entries: Mutex::new(HashMap::new()),
            registry,
            sink,
            digest_tx,
        }
    }

    /// Receiver of the presence digest, updated whenever the set of present
    /// devices changes
    pub fn subscribe_digest(&self) -> watch::Receiver<String> {
        self.digest_tx.subscribe()
    }

    /// Process one detection and report the transitions it caused.
    pub async fn on_detection(&self, detection: &Detection, now: Instant) -> Vec<Transition> {
        if detection.name.is_empty() {
            tracing::trace!("Ignoring unnamed device {}", detection.address);
            return Vec::new();
        }

        // Registry lookups happen before the lock is taken
        let verdicts = self.resolve(detection).await;

        let transitions = {
            let mut entries = self.lock_entries();

            // Any detection counts as liveness, even one that fails below
            if let Some(entry) = entries.get_mut(&detection.address) {
                entry.touch(now);
            }

            let mut transitions = Vec::new();
            for verdict in verdicts {
                let transition = match verdict {
                    Verdict::Connect(identifier) => {
                        connect(&mut entries, &detection.address, identifier, now)
                    }
                    Verdict::Disconnect(cause) => {
                        disconnect(&mut entries, &detection.address, &cause)
                    }
                };
                transitions.extend(transition);
            }

            if !transitions.is_empty() {
                self.publish_digest(&entries);
            }
            transitions
        };

        self.deliver(&transitions).await;
        transitions
    }

    /// Evict every device not detected for longer than the detection timeout.
    pub async fn sweep_timeouts(&self, now: Instant) -> Vec<Transition> {
        let timeout = self.settings.detection_timeout;

        let transitions = {
            let mut entries = self.lock_entries();

            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > timeout)
                .map(|(address, _)| address.clone())
                .collect();

            let mut transitions = Vec::with_capacity(expired.len());
            for address in expired {
                if let Some(entry) = entries.remove(&address) {
                    tracing::info!(
                        "Device {} ({}) timed out (no signal for {:?})",
                        entry.identifier,
                        address,
                        timeout
                    );
                    transitions.push(Transition::disconnected(&address, &entry.identifier));
                }
            }

            if !transitions.is_empty() {
                self.publish_digest(&entries);
            }
            transitions
        };

        self.deliver(&transitions).await;
        transitions
    }

    /// Currently connected devices, sorted by address
    pub fn snapshot(&self) -> Vec<PresenceView> {
        let entries = self.lock_entries();
        let mut views: Vec<PresenceView> = entries
            .iter()
            .map(|(address, entry)| PresenceView {
                address: address.clone(),
                identifier: entry.identifier.clone(),
                connected_at: entry.connected_at,
                last_seen: entry.last_seen_at,
            })
            .collect();
        views.sort_by(|a, b| a.address.cmp(&b.address));
        views
    }

    #[cfg(test)]
    pub fn is_tracked(&self, address: &str) -> bool {
        self.lock_entries().contains_key(address)
    }

    async fn resolve(&self, detection: &Detection) -> Vec<Verdict> {
        let identifiers = match &detection.outcome {
            Outcome::ConnectFailed(reason) => {
                return vec![Verdict::Disconnect(DisconnectCause::ConnectFailed(reason.clone()))];
            }
            Outcome::DiscoveryFailed(reason) => {
                return vec![Verdict::Disconnect(DisconnectCause::DiscoveryFailed(reason.clone()))];
            }
            Outcome::Services(identifiers) => identifiers,
        };

        let mut verdicts = Vec::new();
        for identifier in identifiers {
            if identifier.eq_ignore_ascii_case(&self.settings.generic_service) {
                continue;
            }

            if detection.rssi <= self.settings.rssi_threshold {
                verdicts.push(Verdict::Disconnect(DisconnectCause::WeakSignal(detection.rssi)));
                continue;
            }

            match self.registry.is_active(identifier).await {
                Ok(true) => {
                    tracing::debug!(
                        "Device address: {}, identifier: {}, RSSI: {}",
                        detection.address,
                        identifier,
                        detection.rssi
                    );
                    verdicts.push(Verdict::Connect(identifier.clone()));
                }
                Ok(false) => {
                    tracing::debug!("Identifier {} is not active", identifier);
                    verdicts.push(Verdict::Disconnect(DisconnectCause::Deactivated(
                        identifier.clone(),
                    )));
                }
                Err(e) => {
                    // Neither active nor inactive is known; decide on a later detection
                    tracing::warn!(
                        "Skipping {} on {}: activation lookup failed: {}",
                        identifier,
                        detection.address,
                        e
                    );
                }
            }
        }
        verdicts
    }

    async fn deliver(&self, transitions: &[Transition]) {
        for transition in transitions {
            self.sink.report(transition).await;
        }
    }

    fn publish_digest(&self, entries: &HashMap<String, PresenceEntry>) {
        let digest = compute_digest(
            entries
                .iter()
                .map(|(address, entry)| (address.as_str(), entry.identifier.as_str())),
        );
        self.digest_tx.send_replace(digest);
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, PresenceEntry>> {
        // The map stays consistent across a panic: every mutation is a single insert or remove
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn connect(
    entries: &mut HashMap<String, PresenceEntry>,
    address: &str,
    identifier: String,
    now: Instant,
) -> Option<Transition> {
    if entries.contains_key(address) {
        return None;
    }

    tracing::info!("Device {} ({}) connected", identifier, address);
    let transition = Transition::connected(address, &identifier);
    let wall = Utc::now();
    entries.insert(
        address.to_string(),
        PresenceEntry {
            identifier,
            last_seen: now,
            connected_at: wall,
            last_seen_at: wall,
        },
    );
    Some(transition)
}

fn disconnect(
    entries: &mut HashMap<String, PresenceEntry>,
    address: &str,
    cause: &DisconnectCause,
) -> Option<Transition> {
    let entry = entries.remove(address)?;

    match cause {
        DisconnectCause::WeakSignal(rssi) => tracing::info!(
            "Device {} ({}) disconnected: RSSI {} out of range",
            entry.identifier,
            address,
            rssi
        ),
        DisconnectCause::ConnectFailed(reason) => tracing::info!(
            "Device {} ({}) disconnected: connection failed: {}",
            entry.identifier,
            address,
            reason
        ),
        DisconnectCause::DiscoveryFailed(reason) => tracing::info!(
            "Device {} ({}) disconnected: service discovery failed: {}",
            entry.identifier,
            address,
            reason
        ),
        DisconnectCause::Deactivated(identifier) => tracing::info!(
            "Device {} ({}) disconnected: identifier {} is not active",
            entry.identifier,
            address,
            identifier
        ),
    }

    Some(Transition::disconnected(address, &entry.identifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use shared::types::DeviceStatus;
    use crate::presence::ReportQueue;
    use crate::registry::RegistryError;

    const THRESHOLD: i16 = -90;
    const GENERIC: &str = shared::protocol::GENERIC_ATTRIBUTE_SERVICE;

    #[derive(Default)]
    struct FakeRegistry {
        active: HashSet<String>,
        failing: HashSet<String>,
    }

    impl FakeRegistry {
        fn with_active(identifiers: &[&str]) -> Self {
            Self {
                active: identifiers.iter().map(|s| s.to_string()).collect(),
                failing: HashSet::new(),
            }
        }
    }

    impl ActivationLookup for FakeRegistry {
        async fn is_active(&self, identifier: &str) -> Result<bool, RegistryError> {
            if self.failing.contains(identifier) {
                return Err(RegistryError::Closed);
            }
            Ok(self.active.contains(identifier))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        reports: Arc<Mutex<Vec<Transition>>>,
    }

    impl RecordingSink {
        fn reports(&self) -> Vec<Transition> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl StatusSink for RecordingSink {
        async fn report(&self, transition: &Transition) {
            self.reports.lock().unwrap().push(transition.clone());
        }
    }

    fn settings() -> TrackerSettings {
        TrackerSettings {
            rssi_threshold: THRESHOLD,
            detection_timeout: Duration::from_secs(30),
            generic_service: GENERIC.to_string(),
        }
    }

    fn tracker(
        registry: FakeRegistry,
    ) -> (PresenceTracker<FakeRegistry, RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        (PresenceTracker::new(settings(), registry, sink.clone()), sink)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn test_repeated_detection_connects_once() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&["svc1"]));
        let t0 = Instant::now();
        let detection = Detection::services("X", "tag", -50, &["svc1"]);

        let first = tracker.on_detection(&detection, t0).await;
        assert_eq!(first, vec![Transition::connected("X", "svc1")]);

        for i in 1..5 {
            assert!(tracker.on_detection(&detection, t0 + secs(i)).await.is_empty());
        }

        assert_eq!(sink.reports(), vec![Transition::connected("X", "svc1")]);
    }

    #[tokio::test]
    async fn test_redetection_refreshes_liveness() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&["svc1"]));
        let t0 = Instant::now();
        let detection = Detection::services("X", "tag", -50, &["svc1"]);

        tracker.on_detection(&detection, t0).await;
        tracker.on_detection(&detection, t0 + secs(20)).await;

        // 40s after connect but only 20s after the refresh
        assert!(tracker.sweep_timeouts(t0 + secs(40)).await.is_empty());
        assert!(tracker.is_tracked("X"));

        let evicted = tracker.sweep_timeouts(t0 + secs(51)).await;
        assert_eq!(evicted, vec![Transition::disconnected("X", "svc1")]);
        assert_eq!(sink.reports().len(), 2);
    }

    #[tokio::test]
    async fn test_weak_signal_disconnects_tracked_device() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&["svc1"]));
        let t0 = Instant::now();

        tracker
            .on_detection(&Detection::services("X", "tag", -50, &["svc1"]), t0)
            .await;
        let transitions = tracker
            .on_detection(&Detection::services("X", "tag", -95, &["svc1"]), t0 + secs(3))
            .await;

        assert_eq!(transitions, vec![Transition::disconnected("X", "svc1")]);
        assert!(!tracker.is_tracked("X"));
        assert_eq!(sink.reports().len(), 2);
    }

    #[tokio::test]
    async fn test_weak_signal_for_absent_device_is_noop() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&["svc1"]));

        let transitions = tracker
            .on_detection(&Detection::services("X", "tag", -95, &["svc1"]), Instant::now())
            .await;

        assert!(transitions.is_empty());
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let (tracker, _sink) = tracker(FakeRegistry::with_active(&["svc1"]));

        let at_threshold = tracker
            .on_detection(&Detection::services("X", "tag", THRESHOLD, &["svc1"]), Instant::now())
            .await;
        assert!(at_threshold.is_empty());

        let above = tracker
            .on_detection(
                &Detection::services("X", "tag", THRESHOLD + 1, &["svc1"]),
                Instant::now(),
            )
            .await;
        assert_eq!(above, vec![Transition::connected("X", "svc1")]);
    }

    #[tokio::test]
    async fn test_timeout_evicts_exactly_once() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&["svc1"]));
        let t0 = Instant::now();

        tracker
            .on_detection(&Detection::services("X", "tag", -50, &["svc1"]), t0)
            .await;

        assert!(tracker.sweep_timeouts(t0 + secs(30)).await.is_empty());
        assert_eq!(
            tracker.sweep_timeouts(t0 + secs(31)).await,
            vec![Transition::disconnected("X", "svc1")]
        );
        assert!(tracker.sweep_timeouts(t0 + secs(61)).await.is_empty());

        let statuses: Vec<DeviceStatus> = sink.reports().iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![DeviceStatus::Connected, DeviceStatus::Disconnected]);
    }

    #[tokio::test]
    async fn test_sweep_only_evicts_stale_entries() {
        let (tracker, _sink) = tracker(FakeRegistry::with_active(&["svc1", "svc2"]));
        let t0 = Instant::now();

        tracker
            .on_detection(&Detection::services("A", "a", -50, &["svc1"]), t0)
            .await;
        tracker
            .on_detection(&Detection::services("B", "b", -50, &["svc2"]), t0 + secs(20))
            .await;

        let evicted = tracker.sweep_timeouts(t0 + secs(35)).await;
        assert_eq!(evicted, vec![Transition::disconnected("A", "svc1")]);
        assert!(tracker.is_tracked("B"));
    }

    #[tokio::test]
    async fn test_inactive_identifier_evicts_device() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&["svc1"]));
        let t0 = Instant::now();

        tracker
            .on_detection(&Detection::services("X", "tag", -50, &["svc1"]), t0)
            .await;
        let transitions = tracker
            .on_detection(&Detection::services("X", "tag", -50, &["svc-retired"]), t0 + secs(3))
            .await;

        assert_eq!(transitions, vec![Transition::disconnected("X", "svc1")]);
        assert_eq!(sink.reports().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_identifier_never_connects() {
        let (tracker, sink) = tracker(FakeRegistry::default());

        let transitions = tracker
            .on_detection(&Detection::services("X", "tag", -40, &["svc1"]), Instant::now())
            .await;

        assert!(transitions.is_empty());
        assert!(!tracker.is_tracked("X"));
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_connection_failures_disconnect() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&["svc1", "svc2"]));
        let t0 = Instant::now();

        tracker
            .on_detection(&Detection::services("A", "a", -50, &["svc1"]), t0)
            .await;
        tracker
            .on_detection(&Detection::services("B", "b", -50, &["svc2"]), t0)
            .await;

        let connect_failed = Detection {
            address: "A".to_string(),
            name: "a".to_string(),
            rssi: -50,
            outcome: Outcome::ConnectFailed("timed out".to_string()),
        };
        let discovery_failed = Detection {
            address: "B".to_string(),
            name: "b".to_string(),
            rssi: -50,
            outcome: Outcome::DiscoveryFailed("gatt error".to_string()),
        };

        assert_eq!(
            tracker.on_detection(&connect_failed, t0 + secs(3)).await,
            vec![Transition::disconnected("A", "svc1")]
        );
        assert_eq!(
            tracker.on_detection(&discovery_failed, t0 + secs(3)).await,
            vec![Transition::disconnected("B", "svc2")]
        );
        // Already gone
        assert!(tracker.on_detection(&connect_failed, t0 + secs(6)).await.is_empty());
        assert_eq!(sink.reports().len(), 4);
    }

    #[tokio::test]
    async fn test_unnamed_and_empty_detections_are_ignored() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&["svc1"]));
        let t0 = Instant::now();

        let unnamed = Detection::services("X", "", -50, &["svc1"]);
        assert!(tracker.on_detection(&unnamed, t0).await.is_empty());

        let no_services = Detection::services("X", "tag", -50, &[]);
        assert!(tracker.on_detection(&no_services, t0).await.is_empty());

        assert!(!tracker.is_tracked("X"));
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_unnamed_detection_does_not_refresh_liveness() {
        let (tracker, _sink) = tracker(FakeRegistry::with_active(&["svc1"]));
        let t0 = Instant::now();

        tracker
            .on_detection(&Detection::services("X", "tag", -50, &["svc1"]), t0)
            .await;
        tracker
            .on_detection(&Detection::services("X", "", -50, &["svc1"]), t0 + secs(20))
            .await;

        assert_eq!(tracker.sweep_timeouts(t0 + secs(31)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_generic_service_is_filtered() {
        let (tracker, sink) = tracker(FakeRegistry::with_active(&[GENERIC]));
        let upper = GENERIC.to_uppercase();

        let transitions = tracker
            .on_detection(
                &Detection::services("X", "tag", -50, &[GENERIC, upper.as_str()]),
                Instant::now(),
            )
            .await;

        assert!(transitions.is_empty());
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_generic_service_alongside_real_one() {
        let (tracker, _sink) = tracker(FakeRegistry::with_active(&["svc1"]));

        let transitions = tracker
            .on_detection(
                &Detection::services("X", "tag", -50, &[GENERIC, "svc1"]),
                Instant::now(),
            )
            .await;

        assert_eq!(transitions, vec![Transition::connected("X", "svc1")]);
    }

    #[tokio::test]
    async fn test_first_active_identifier_wins() {
        let (tracker, _sink) = tracker(FakeRegistry::with_active(&["svc1", "svc2"]));

        let transitions = tracker
            .on_detection(
                &Detection::services("X", "tag", -50, &["svc1", "svc2"]),
                Instant::now(),
            )
            .await;

        assert_eq!(transitions, vec![Transition::connected("X", "svc1")]);
        assert_eq!(tracker.snapshot()[0].identifier, "svc1");
    }

    #[tokio::test]
    async fn test_store_failure_skips_decision() {
        let mut registry = FakeRegistry::with_active(&["svc1"]);
        registry.failing.insert("svc1".to_string());
        let (tracker, sink) = tracker(registry);

        // Not treated as active
        let transitions = tracker
            .on_detection(&Detection::services("X", "tag", -50, &["svc1"]), Instant::now())
            .await;

        assert!(transitions.is_empty());
        assert!(!tracker.is_tracked("X"));
        assert!(sink.reports().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_does_not_evict() {
        let mut registry = FakeRegistry::with_active(&["svc1"]);
        registry.failing.insert("svc2".to_string());
        let (tracker, sink) = tracker(registry);
        let t0 = Instant::now();

        tracker
            .on_detection(&Detection::services("X", "tag", -50, &["svc1"]), t0)
            .await;

        // Not treated as inactive either
        let transitions = tracker
            .on_detection(&Detection::services("X", "tag", -50, &["svc2"]), t0 + secs(3))
            .await;

        assert!(transitions.is_empty());
        assert!(tracker.is_tracked("X"));
        assert_eq!(sink.reports(), vec![Transition::connected("X", "svc1")]);
    }

    #[tokio::test]
    async fn test_snapshot_and_digest_follow_membership() {
        let (tracker, _sink) = tracker(FakeRegistry::with_active(&["svc1", "svc2"]));
        let digest_rx = tracker.subscribe_digest();
        let empty = digest_rx.borrow().clone();
        let t0 = Instant::now();

        tracker
            .on_detection(&Detection::services("B", "b", -50, &["svc2"]), t0)
            .await;
        tracker
            .on_detection(&Detection::services("A", "a", -50, &["svc1"]), t0)
            .await;
        let two = digest_rx.borrow().clone();
        assert_ne!(empty, two);

        let snapshot = tracker.snapshot();
        let addresses: Vec<&str> = snapshot.iter().map(|v| v.address.as_str()).collect();
        assert_eq!(addresses, vec!["A", "B"]);

        // Liveness refresh leaves the digest alone
        tracker
            .on_detection(&Detection::services("A", "a", -50, &["svc1"]), t0 + secs(5))
            .await;
        assert_eq!(*digest_rx.borrow(), two);

        tracker.sweep_timeouts(t0 + secs(40)).await;
        assert_eq!(*digest_rx.borrow(), empty);
        assert!(tracker.snapshot().is_empty());
    }

    struct StalledSink;

    impl StatusSink for StalledSink {
        async fn report(&self, _transition: &Transition) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    #[tokio::test]
    async fn test_queued_stalled_sink_does_not_delay_state() {
        let (reports, _drain) = ReportQueue::spawn(StalledSink);
        let tracker = PresenceTracker::new(
            settings(),
            FakeRegistry::with_active(&["svc1", "svc2"]),
            reports,
        );
        let t0 = Instant::now();

        let committed = tokio::time::timeout(secs(1), async {
            let first = tracker
                .on_detection(&Detection::services("X", "tag", -50, &["svc1"]), t0)
                .await;
            let second = tracker
                .on_detection(&Detection::services("Y", "tag", -50, &["svc2"]), t0)
                .await;
            let gone = tracker.sweep_timeouts(t0 + secs(31)).await;
            (first, second, gone)
        })
        .await
        .expect("tracker waited on the status sink");

        assert_eq!(committed.0, vec![Transition::connected("X", "svc1")]);
        assert_eq!(committed.1, vec![Transition::connected("Y", "svc2")]);
        assert_eq!(committed.2.len(), 2);
        assert!(tracker.snapshot().is_empty());
    }
}
