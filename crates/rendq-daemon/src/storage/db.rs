//! Database connection and initialization.

use std::path::Path;

use rendq_core::db::{StoreLocation, connect};
use sqlx::{Pool, Sqlite};
use tracing::{error, info};

pub use rendq_core::db::DatabaseError;

/// Queue and history store, migrated on open.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(connect(StoreLocation::File(path)).await?).await
    }

    /// Open the database at `path`, or an in-memory one if there is no path
    /// or it cannot be opened. The daemon keeps running either way; state
    /// is then lost on exit.
    pub async fn open_or_in_memory(path: Option<&Path>) -> Result<Self, DatabaseError> {
        match path {
            Some(path) => match Self::open(path).await {
                Ok(db) => return Ok(db),
                Err(e) => error!(
                    path = %path.display(),
                    error = %e,
                    "Cannot open database, falling back to in-memory store"
                ),
            },
            None => error!("No database path available, falling back to in-memory store"),
        }
        Self::open_in_memory().await
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(connect(StoreLocation::Memory).await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database migrations complete");
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
