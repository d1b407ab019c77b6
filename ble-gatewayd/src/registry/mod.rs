pub mod db;
pub mod handle;

use thiserror::Error;

pub use db::RegistryDb;
pub use handle::RegistryHandle;

/// Failures of the activation registry.
///
/// `NoCapacity` is an expected outcome of a claim; the other variants mean the
/// store could not answer and the caller should try again later.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No inactive identifier available")]
    NoCapacity,

    #[error("Activation store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Activation store thread is not running")]
    Closed,
}

impl RegistryError {
    /// The store could not answer; the same request may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Closed)
    }
}

/// Active/inactive record counts, logged at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub active: u64,
    pub inactive: u64,
}

/// Read side of the registry as seen by the presence tracker.
pub trait ActivationLookup: Send + Sync {
    fn is_active(
        &self,
        identifier: &str,
    ) -> impl std::future::Future<Output = Result<bool, RegistryError>> + Send;
}
