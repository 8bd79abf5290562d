//! Shared database types and utilities.
//!
//! Provides `DatabaseError`, the `SQLite` pool setup used by the daemon's
//! store, and the millisecond clock every persisted timestamp uses.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// Database errors raised by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("cannot create database directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open database {location}: {source}")]
    Open {
        location: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stored value is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where a store keeps its data.
#[derive(Debug, Clone, Copy)]
pub enum StoreLocation<'a> {
    File(&'a Path),
    /// Private to one process; gone when the pool closes.
    Memory,
}

impl StoreLocation<'_> {
    fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory => ":memory:".to_string(),
        }
    }
}

/// Writers wait this long for a lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a `SQLite` pool at `location`, creating the file and its parent
/// directory as needed.
///
/// File stores use WAL so history reads never block the queue's writes. The
/// in-memory store pins a single connection for the pool's lifetime, since
/// each connection would otherwise see its own empty database.
pub async fn connect(location: StoreLocation<'_>) -> Result<Pool<Sqlite>, DatabaseError> {
    let open_err = |source| DatabaseError::Open {
        location: location.describe(),
        source,
    };

    let (options, pool_options) = match location {
        StoreLocation::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| DatabaseError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
            (options, SqlitePoolOptions::new().max_connections(4))
        }
        StoreLocation::Memory => {
            let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(open_err)?;
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        }
    };

    let pool = pool_options
        .connect_with(options.busy_timeout(BUSY_TIMEOUT))
        .await
        .map_err(open_err)?;

    info!(location = %location.describe(), "Database opened");
    Ok(pool)
}

/// Returns the current time in milliseconds since the Unix epoch.
///
/// Queue ordering and history durations need sub-second resolution.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
