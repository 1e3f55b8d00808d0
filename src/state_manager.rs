// src/state_manager.rs

use crate::config::HOST_OVERRIDE_RESET;
use crate::models::{DownloadState, ItemStatus};
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

/// Bumped whenever `DownloadState` changes shape; older rows are ignored.
const SCHEMA_VERSION: i64 = 1;

const HOST_OVERRIDE_KEY: &str = "host_override";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persists the last completed download state and operator settings to an
/// SQLite database file.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
    path: PathBuf,
}

impl StateManager {
    /// Opens (or creates) the database file. A file that is not a usable
    /// database is discarded and recreated.
    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        match Self::try_open(db_path).await {
            Ok(manager) => Ok(manager),
            Err(e) => {
                warn!(path = %db_path.display(), error = %e, "state database unusable, recreating");
                match tokio::fs::remove_file(db_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Self::try_open(db_path).await
            }
        }
    }

    async fn try_open(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self {
            conn,
            path: db_path.to_path_buf(),
        };
        manager.setup_database().await?;
        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS download_state (
                        id              INTEGER PRIMARY KEY CHECK (id = 0),
                        version         INTEGER NOT NULL,
                        state_data      TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS settings (
                        key             TEXT PRIMARY KEY,
                        value           TEXT NOT NULL
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Overwrites the saved download state.
    pub async fn save(&self, state: &DownloadState) -> Result<(), StateError> {
        let state_data = serde_json::to_string(state)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO download_state (id, version, state_data) VALUES (0, ?1, ?2)",
                    params![SCHEMA_VERSION, state_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Loads the saved download state. Anything unreadable counts as "nothing saved".
    pub async fn load(&self) -> Option<DownloadState> {
        let row = self
            .conn
            .call(|conn| {
                let row = conn
                    .query_row(
                        "SELECT version, state_data FROM download_state WHERE id = 0",
                        [],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await;

        let (version, state_data) = match row {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "failed to read saved download state");
                return None;
            }
        };
        if version != SCHEMA_VERSION {
            debug!(version, "ignoring saved download state from another schema");
            return None;
        }
        match serde_json::from_str::<DownloadState>(&state_data) {
            Ok(state) if state.items.iter().any(|item| item.status == ItemStatus::Downloading) => {
                debug!("ignoring saved download state with unfinished items");
                None
            }
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "saved download state is corrupt");
                None
            }
        }
    }

    /// Removes the saved download state.
    pub async fn delete(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM download_state", [])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// The operator's host override, if one is stored.
    pub async fn host_override(&self) -> Result<Option<String>, StateError> {
        let value = self
            .conn
            .call(|conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM settings WHERE key = ?1",
                        params![HOST_OVERRIDE_KEY],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }

    /// Stores a host override; `None`, an empty value or `default` clears it.
    pub async fn set_host_override(&self, host: Option<&str>) -> Result<(), StateError> {
        let host = host
            .map(str::trim)
            .filter(|h| !h.is_empty() && *h != HOST_OVERRIDE_RESET)
            .map(str::to_owned);
        self.conn
            .call(move |conn| {
                match host {
                    Some(host) => conn.execute(
                        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                        params![HOST_OVERRIDE_KEY, host],
                    )?,
                    None => conn.execute(
                        "DELETE FROM settings WHERE key = ?1",
                        params![HOST_OVERRIDE_KEY],
                    )?,
                };
                Ok(())
            })
            .await?;
        Ok(())
    }
}
