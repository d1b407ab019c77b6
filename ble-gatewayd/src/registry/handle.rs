use std::thread;
use tokio::sync::{mpsc, oneshot};
use super::{ActivationLookup, RegistryCounts, RegistryDb, RegistryError};

/// Commands sent to the registry thread
pub enum RegistryCommand {
    IsActive(String, oneshot::Sender<Result<bool, RegistryError>>),
    ClaimOne(oneshot::Sender<Result<String, RegistryError>>),
    Seed(Vec<String>, oneshot::Sender<Result<usize, RegistryError>>),
    Counts(oneshot::Sender<Result<RegistryCounts, RegistryError>>),
    Shutdown,
}

/// Handle to the activation registry. Cheap to clone; every clone talks to the
/// same store thread, which owns the only in-process connection.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry thread around an opened database
    pub fn spawn(mut db: RegistryDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    RegistryCommand::IsActive(identifier, reply) => {
                        let _ = reply.send(db.is_active(&identifier));
                    }
                    RegistryCommand::ClaimOne(reply) => {
                        let result = db.claim_one_inactive();
                        match &result {
                            Ok(identifier) => tracing::info!("Claimed identifier {}", identifier),
                            Err(RegistryError::NoCapacity) => {
                                tracing::warn!("Claim requested but no inactive identifier is left")
                            }
                            Err(e) => tracing::error!("Claim failed: {}", e),
                        }
                        let _ = reply.send(result);
                    }
                    RegistryCommand::Seed(identifiers, reply) => {
                        let _ = reply.send(db.seed(&identifiers));
                    }
                    RegistryCommand::Counts(reply) => {
                        let _ = reply.send(db.counts());
                    }
                    RegistryCommand::Shutdown => {
                        tracing::info!("Registry thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    pub async fn is_active(&self, identifier: &str) -> Result<bool, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::IsActive(identifier.to_string(), reply)).await?;
        rx.await.map_err(|_| RegistryError::Closed)?
    }

    /// Atomically claim one inactive identifier
    pub async fn claim_one_inactive(&self) -> Result<String, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::ClaimOne(reply)).await?;
        rx.await.map_err(|_| RegistryError::Closed)?
    }

    /// Insert missing identifiers as inactive
    pub async fn seed(&self, identifiers: Vec<String>) -> Result<usize, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Seed(identifiers, reply)).await?;
        rx.await.map_err(|_| RegistryError::Closed)?
    }

    pub async fn counts(&self) -> Result<RegistryCounts, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Counts(reply)).await?;
        rx.await.map_err(|_| RegistryError::Closed)?
    }

    /// Shutdown the registry thread
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Shutdown).await
    }

    async fn send(&self, cmd: RegistryCommand) -> Result<(), RegistryError> {
        self.tx.send(cmd).await.map_err(|_| RegistryError::Closed)
    }
}

impl ActivationLookup for RegistryHandle {
    async fn is_active(&self, identifier: &str) -> Result<bool, RegistryError> {
        RegistryHandle::is_active(self, identifier).await
    }
}
