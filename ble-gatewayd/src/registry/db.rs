use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use super::{RegistryCounts, RegistryError};

/// How long a writer waits for another connection's write lock before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RegistryDb {
    conn: Connection,
}

impl RegistryDb {
    /// Open or create the activation database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;

        // WAL lets lookups proceed while another connection holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        // Same layout as the devices table provisioned for earlier gateways
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                uuid      TEXT PRIMARY KEY,
                is_active INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_devices_active ON devices(is_active);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Whether the identifier may connect. Unknown identifiers are never active.
    pub fn is_active(&self, identifier: &str) -> Result<bool, RegistryError> {
        let flag: Option<i64> = self
            .conn
            .query_row(
                "SELECT is_active FROM devices WHERE uuid = ?1",
                params![identifier],
                |row| row.get(0),
            )
            .optional()?;

        Ok(flag.is_some_and(|f| f != 0))
    }

    /// Flip one inactive identifier to active and return it.
    ///
    /// The write lock is taken up front so the select-and-flip cannot interleave
    /// with a claim from another connection; the `is_active = 0` guard on the
    /// update keeps it correct even without the transaction.
    pub fn claim_one_inactive(&mut self) -> Result<String, RegistryError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed: Option<String> = tx
            .query_row(
                r#"
                UPDATE devices SET is_active = 1
                WHERE uuid = (
                    SELECT uuid FROM devices WHERE is_active = 0 ORDER BY uuid LIMIT 1
                )
                AND is_active = 0
                RETURNING uuid
                "#,
                [],
                |row| row.get(0),
            )
            .optional()?;

        tx.commit()?;

        claimed.ok_or(RegistryError::NoCapacity)
    }

    /// Insert identifiers as inactive, leaving existing rows untouched.
    /// Returns the number of new rows.
    pub fn seed<S: AsRef<str>>(&mut self, identifiers: &[S]) -> Result<usize, RegistryError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO devices (uuid, is_active) VALUES (?1, 0)")?;
            for identifier in identifiers {
                inserted += stmt.execute(params![identifier.as_ref()])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn counts(&self) -> Result<RegistryCounts, RegistryError> {
        let (active, inactive): (i64, i64) = self.conn.query_row(
            "SELECT COALESCE(SUM(is_active != 0), 0), COALESCE(SUM(is_active = 0), 0) FROM devices",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(RegistryCounts {
            active: active as u64,
            inactive: inactive as u64,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_active(&self, identifier: &str, active: bool) -> Result<(), RegistryError> {
        self.conn.execute(
            "INSERT INTO devices (uuid, is_active) VALUES (?1, ?2)
             ON CONFLICT(uuid) DO UPDATE SET is_active = excluded.is_active",
            params![identifier, active as i32],
        )?;
        Ok(())
    }
}
