/// Generic Attribute service UUID. Every GATT server exposes it, so it says
/// nothing about which device is present.
pub const GENERIC_ATTRIBUTE_SERVICE: &str = "00001801-0000-1000-8000-00805f9b34fb";

/// Allocation endpoint exposed by the gateway
pub const CLAIM_PATH: &str = "/v1/identifiers/claim";

/// Read-only gateway endpoints
pub const PRESENCE_PATH: &str = "/v1/presence";
pub const PRESENCE_HASH_PATH: &str = "/v1/presence/hash";
pub const CONFIG_PATH: &str = "/v1/config";

/// Status endpoint the gateway reports transitions to, relative to the remote base URL
pub const STATUS_REPORT_PATH: &str = "/v1/devices/status";

/// Machine-readable error codes returned by the allocation endpoint
pub const ERR_NO_CAPACITY: &str = "no_capacity";
pub const ERR_REGISTRY_UNAVAILABLE: &str = "registry_unavailable";
