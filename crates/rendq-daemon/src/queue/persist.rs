//! Queue persistence on top of the key-value store.

use rendq_core::QueueSettings;
use rendq_core::db::unix_timestamp_millis;
use tracing::{error, info, warn};

use crate::storage::{Database, DatabaseError};

use super::types::{Job, JobStatus};

/// Key holding the JSON job collection.
pub const ITEMS_KEY: &str = "queue.items";
/// Key holding the JSON queue settings.
pub const SETTINGS_KEY: &str = "queue.settings";

/// Reads and writes the queue's durable state.
#[derive(Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Load jobs and settings.
    ///
    /// Unreadable state is logged and replaced by an empty queue or
    /// `default_settings`. Jobs stored as running are restored as pending.
    pub async fn load(&self, default_settings: &QueueSettings) -> (Vec<Job>, QueueSettings) {
        let mut jobs: Vec<Job> = match self.db.kv_get_json(ITEMS_KEY, Vec::new()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to load queue items, starting with an empty queue");
                Vec::new()
            }
        };
        let settings = match self
            .db
            .kv_get_json(SETTINGS_KEY, default_settings.clone())
            .await
        {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "Failed to load queue settings, using defaults");
                default_settings.clone()
            }
        };

        let now = unix_timestamp_millis();
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
            warn!(job_id = %job.id, "Job was running at last shutdown, restoring as pending");
            job.status = JobStatus::Pending;
            job.reset_run_state();
            job.updated_at = now;
        }

        info!(jobs = jobs.len(), "Queue state loaded");
        (jobs, settings)
    }

    /// Write jobs and settings.
    pub async fn save(&self, jobs: &[Job], settings: &QueueSettings) -> Result<(), DatabaseError> {
        self.db.kv_set_json(ITEMS_KEY, &jobs).await?;
        self.db.kv_set_json(SETTINGS_KEY, settings).await
    }
}
