use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use anyhow::{Context, Result};
use shared::protocol::GENERIC_ATTRIBUTE_SERVICE;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Detections at or below this RSSI count as out of range
    #[serde(default = "default_rssi_threshold")]
    pub rssi_threshold: i16,
    #[serde(default = "default_detection_timeout")]
    pub detection_timeout_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Service identifier that is never treated as presence information
    #[serde(default = "default_generic_service")]
    pub generic_service: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Identifiers inserted as inactive at startup when missing
    #[serde(default)]
    pub seed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReporterConfig {
    /// Base URL of the remote status service, path prefix allowed. Reports are
    /// only logged when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_report_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RadioConfig {
    /// Recorded scan cycles to replay instead of driving a real adapter
    #[serde(default)]
    pub replay_path: Option<PathBuf>,
    /// Bound on each connect and each service discovery attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// How long each cycle listens for advertisements before probing
    #[serde(default = "default_scan_window")]
    pub scan_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_rssi_threshold() -> i16 {
    -90
}

fn default_detection_timeout() -> u64 {
    30
}

fn default_scan_interval() -> u64 {
    3
}

fn default_generic_service() -> String {
    GENERIC_ATTRIBUTE_SERVICE.to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/ble-gateway/ble.db")
}

fn default_report_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_scan_window() -> u64 {
    2
}

fn default_listen() -> String {
    "[::]:50052".to_string()
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            rssi_threshold: default_rssi_threshold(),
            detection_timeout_secs: default_detection_timeout(),
            scan_interval_secs: default_scan_interval(),
            generic_service: default_generic_service(),
        }
    }
}

impl PresenceConfig {
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_secs(self.detection_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            seed: Vec::new(),
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_report_timeout(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            replay_path: None,
            connect_timeout_secs: default_connect_timeout(),
            scan_window_secs: default_scan_window(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
