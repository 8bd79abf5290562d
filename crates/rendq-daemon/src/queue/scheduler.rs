//! Queue scheduler.
//!
//! [`QueueScheduler`] owns the job collection and:
//! - resolves eligibility (dependencies, schedule time) and picks the next job
//!   by priority and age
//! - drives up to `maxConcurrent` render sessions from one polling loop
//! - maps session outcomes to job status and writes history records
//! - persists jobs and settings through a coalescing flush task

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rendq_core::config::Config;
use rendq_core::db::unix_timestamp_millis;
use rendq_core::progress::ProgressSnapshot;
use rendq_core::{QueueSettings, SettingsUpdate};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::session::{EventHub, RenderJob, RenderSession, SessionOutcome};
use crate::storage::{Database, HistoryRecord, HistoryStatus};
use crate::supervisor::ProcessSupervisor;

use super::persist::QueueStore;
use super::selection::{promote_due, select_next, validate_dependency};
use super::types::{Job, JobSpec, JobStatus, JobUpdate, QueueError, QueueEvent};

/// Scheduler timing and defaults.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Delay between a mutation and the flush that persists it.
    pub persist_delay: Duration,
    /// History records kept after pruning.
    pub history_limit: u32,
    /// Engine executable for commands assembled from parameters.
    pub blender_bin: String,
    /// Settings used when none are stored.
    pub initial_settings: QueueSettings,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            persist_delay: Duration::from_millis(500),
            history_limit: 200,
            blender_bin: "blender".to_string(),
            initial_settings: QueueSettings::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.daemon.poll_interval_ms.max(1)),
            persist_delay: Duration::from_millis(config.daemon.persist_delay_ms),
            history_limit: config.daemon.history_limit,
            blender_bin: config.daemon.blender_bin.to_string_lossy().into_owned(),
            initial_settings: config.queue.clone(),
        }
    }
}

struct RunningJob {
    process_id: String,
    progress: watch::Receiver<ProgressSnapshot>,
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<Job>,
    settings: QueueSettings,
    processing: bool,
    /// Job ID -> its live session.
    running: HashMap<String, RunningJob>,
}

impl QueueState {
    fn position(&self, job_id: &str) -> Result<usize, QueueError> {
        self.jobs
            .iter()
            .position(|j| j.id == job_id)
            .ok_or_else(|| QueueError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Index of a job that has not started yet.
    fn editable(&self, job_id: &str) -> Result<usize, QueueError> {
        let idx = self.position(job_id)?;
        let status = self.jobs[idx].status;
        if status.is_editable() {
            Ok(idx)
        } else {
            Err(QueueError::NotEditable {
                job_id: job_id.to_string(),
                status,
            })
        }
    }

    /// Copy of `job` carrying its live progress if it is running.
    fn view(&self, job: &Job) -> Job {
        let mut job = job.clone();
        if let Some(running) = self.running.get(&job.id) {
            job.progress = running.progress.borrow().clone();
        }
        job
    }

    fn running_capacity(&self) -> usize {
        usize::try_from(self.settings.max_concurrent.max(1)).unwrap_or(usize::MAX)
    }
}

/// How a run ended, as decided by the scheduler.
enum RunEnd {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// A terminal transition, published once the state lock is released.
struct Concluded {
    job: Job,
    record: HistoryRecord,
    cancelled: bool,
}

/// Render queue scheduler.
pub struct QueueScheduler {
    state: Mutex<QueueState>,
    supervisor: Arc<ProcessSupervisor>,
    hub: Arc<EventHub>,
    store: QueueStore,
    config: SchedulerConfig,
    /// Wakes the dispatch loop before the next tick.
    wake: Notify,
    /// Wakes the flush task.
    persist: Notify,
    dirty: AtomicBool,
}

impl QueueScheduler {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        hub: Arc<EventHub>,
        db: Database,
        config: SchedulerConfig,
    ) -> Self {
        let state = QueueState {
            settings: config.initial_settings.clone(),
            ..QueueState::default()
        };
        Self {
            state: Mutex::new(state),
            supervisor,
            hub,
            store: QueueStore::new(db),
            config,
            wake: Notify::new(),
            persist: Notify::new(),
            dirty: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore persisted jobs and settings. Starts processing if `autoStart`
    /// is set.
    pub async fn load(&self) {
        let (jobs, settings) = self.store.load(&self.config.initial_settings).await;
        let mut state = self.state.lock().await;
        state.jobs = jobs;
        state.settings = settings;
        state.running.clear();
        if state.settings.auto_start {
            self.set_processing(&mut state, true);
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Spawn the dispatch loop and the flush task. Both exit when `shutdown`
    /// flips.
    pub fn spawn(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).dispatch_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).persist_loop(shutdown.clone())),
        ]
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "Queue scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            self.evaluate().await;
        }
        info!("Queue scheduler stopped");
    }

    async fn persist_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                () = self.persist.notified() => {}
                _ = shutdown.changed() => break,
            }
            tokio::time::sleep(self.config.persist_delay).await;
            if self.dirty.load(Ordering::SeqCst) {
                // Failures are logged and retried on the next mutation.
                let _ = self.flush().await;
            }
        }
    }

    /// Write jobs and settings to storage now.
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.dirty.store(false, Ordering::SeqCst);
        let (jobs, settings) = {
            let state = self.state.lock().await;
            let jobs: Vec<Job> = state.jobs.iter().map(|j| state.view(j)).collect();
            (jobs, state.settings.clone())
        };

        if let Err(e) = self.store.save(&jobs, &settings).await {
            error!(error = %e, "Failed to persist queue state");
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        debug!(jobs = jobs.len(), "Queue state persisted");
        Ok(())
    }

    /// Stop processing, terminate running renders and flush.
    ///
    /// Interrupted jobs are left pending, not held, and get no history record.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        // Detach the sessions first so their cancelled outcomes are ignored.
        let process_ids: Vec<String> = {
            let now = unix_timestamp_millis();
            let mut state = self.state.lock().await;
            self.set_processing(&mut state, false);
            let QueueState { jobs, running, .. } = &mut *state;
            for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
                job.status = JobStatus::Pending;
                job.reset_run_state();
                job.updated_at = now;
            }
            running.drain().map(|(_, r)| r.process_id).collect()
        };
        info!(running = process_ids.len(), "Shutting down queue");

        for process_id in &process_ids {
            self.supervisor.stop(process_id).await;
        }

        self.flush().await
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// One scheduling pass: promote due jobs, then fill free slots.
    pub async fn evaluate(self: &Arc<Self>) {
        let now = unix_timestamp_millis();
        let mut concluded = Vec::new();
        let mut changed = false;

        {
            let mut state = self.state.lock().await;
            for idx in promote_due(&mut state.jobs, now) {
                let job = state.jobs[idx].clone();
                debug!(job_id = %job.id, "Scheduled job is due");
                self.hub.publish(QueueEvent::JobUpdated { job: Box::new(job) });
                changed = true;
            }

            while state.processing && state.running.len() < state.running_capacity() {
                let Some(idx) = select_next(&state.jobs, now) else {
                    break;
                };
                changed = true;
                if let Some(failed) = self.dispatch(&mut state, idx, now).await {
                    concluded.push(failed);
                }
            }
        }

        for c in concluded {
            self.publish_concluded(c).await;
        }
        if changed {
            self.mark_dirty();
        }
    }

    /// Start the job at `idx`. Returns the failure transition if it could not
    /// be spawned.
    async fn dispatch(
        self: &Arc<Self>,
        state: &mut QueueState,
        idx: usize,
        now: i64,
    ) -> Option<Concluded> {
        let render = {
            let job = &state.jobs[idx];
            RenderJob {
                job_id: job.id.clone(),
                command: job.command.clone(),
                frame_range: job.frame_range,
            }
        };
        let job_id = render.job_id.clone();
        info!(job_id, command = %render.command, "Dispatching job");

        match RenderSession::launch(&self.supervisor, Arc::clone(&self.hub), render).await {
            Ok(session) => {
                let progress = session.progress();
                let job = &mut state.jobs[idx];
                job.reset_run_state();
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                job.updated_at = now;
                let snapshot = job.clone();

                state.running.insert(
                    job_id,
                    RunningJob {
                        process_id: session.handle().id.clone(),
                        progress,
                    },
                );
                self.hub.publish(QueueEvent::JobUpdated {
                    job: Box::new(snapshot),
                });

                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = session.run().await;
                    scheduler.finish_session(outcome).await;
                });
                None
            }
            Err(e) => {
                let job = &mut state.jobs[idx];
                job.reset_run_state();
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                job.started_at = Some(now);
                job.finished_at = Some(now);
                job.updated_at = now;
                let record = history_record(job, HistoryStatus::Failed, now);
                Some(Concluded {
                    job: job.clone(),
                    record,
                    cancelled: false,
                })
            }
        }
    }

    async fn finish_session(&self, outcome: SessionOutcome) {
        let end = if outcome.cancelled {
            RunEnd::Cancelled
        } else if let Some(message) = outcome.failure_message() {
            RunEnd::Failed(message)
        } else {
            RunEnd::Succeeded
        };

        let concluded = {
            let mut state = self.state.lock().await;
            conclude(
                &mut state,
                &outcome.job_id,
                &outcome.process_id,
                end,
                Some(outcome.snapshot),
                outcome.finished_at,
            )
        };

        match concluded {
            Some(c) => self.publish_concluded(c).await,
            None => debug!(job_id = %outcome.job_id, "Ignoring outcome of a superseded session"),
        }
    }

    async fn publish_concluded(&self, concluded: Concluded) {
        let Concluded {
            job,
            record,
            cancelled,
        } = concluded;
        info!(
            job_id = %job.id,
            status = %job.status,
            cancelled,
            error = ?job.error,
            "Job finished"
        );

        self.hub.publish(QueueEvent::JobFinished {
            job_id: job.id.clone(),
            status: job.status,
            cancelled,
            error: job.error.clone(),
        });
        self.hub.publish(QueueEvent::JobUpdated { job: Box::new(job) });

        let db = self.store.database();
        match db.insert_history(&record).await {
            Ok(()) => {
                if let Err(e) = db.prune_history(self.config.history_limit).await {
                    warn!(error = %e, "Failed to prune render history");
                }
                self.hub.publish(QueueEvent::HistoryRecorded {
                    record: Box::new(record),
                });
            }
            Err(e) => error!(job_id = %record.job_id, error = %e, "Failed to record history"),
        }

        self.changed();
    }

    // =========================================================================
    // Processing control and settings
    // =========================================================================

    /// Begin dispatching. Returns whether the state changed.
    pub async fn start_processing(&self) -> bool {
        let changed = self.set_processing(&mut *self.state.lock().await, true);
        self.wake.notify_one();
        changed
    }

    /// Stop dispatching new jobs. Running jobs continue.
    pub async fn stop_processing(&self) -> bool {
        self.set_processing(&mut *self.state.lock().await, false)
    }

    fn set_processing(&self, state: &mut QueueState, processing: bool) -> bool {
        if state.processing == processing {
            return false;
        }
        state.processing = processing;
        info!(processing, "Queue processing changed");
        self.hub
            .publish(QueueEvent::ProcessingChanged { processing });
        true
    }

    pub async fn is_processing(&self) -> bool {
        self.state.lock().await.processing
    }

    /// Apply a partial settings update. A lower `maxConcurrent` only limits
    /// future dispatches.
    pub async fn update_settings(&self, update: SettingsUpdate) -> QueueSettings {
        let settings = {
            let mut state = self.state.lock().await;
            state.settings.apply(update);
            state.settings.clone()
        };
        info!(?settings, "Queue settings updated");
        self.hub.publish(QueueEvent::SettingsChanged {
            settings: settings.clone(),
        });
        self.changed();
        settings
    }

    pub async fn settings(&self) -> QueueSettings {
        self.state.lock().await.settings.clone()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// All jobs in collection order, with live progress for running ones.
    pub async fn jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        state.jobs.iter().map(|j| state.view(j)).collect()
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .map(|j| state.view(j))
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    /// Whether anything is running, scheduled, or ready to dispatch.
    pub async fn has_work(&self) -> bool {
        let state = self.state.lock().await;
        !state.running.is_empty()
            || state.jobs.iter().any(|j| j.status == JobStatus::Scheduled)
            || select_next(&state.jobs, unix_timestamp_millis()).is_some()
    }

    /// History records, newest first.
    pub async fn history(&self, limit: u32, offset: u32) -> Result<Vec<HistoryRecord>, QueueError> {
        Ok(self.store.database().list_history(limit, offset).await?)
    }

    pub async fn history_entry(&self, id: &str) -> Result<HistoryRecord, QueueError> {
        Ok(self.store.database().get_history(id).await?)
    }

    /// Every recorded run of one job, newest first.
    pub async fn job_history(&self, job_id: &str) -> Result<Vec<HistoryRecord>, QueueError> {
        Ok(self.store.database().list_job_history(job_id).await?)
    }

    /// Returns whether the record existed.
    pub async fn delete_history(&self, id: &str) -> Result<bool, QueueError> {
        Ok(self.store.database().delete_history(id).await?)
    }

    /// Returns how many records were removed.
    pub async fn clear_history(&self) -> Result<u64, QueueError> {
        let removed = self.store.database().clear_history().await?;
        info!(removed, "Render history cleared");
        Ok(removed)
    }

    // =========================================================================
    // Job mutations
    // =========================================================================

    /// Add a job. Its command is assembled from the parameters when no
    /// explicit command is given.
    pub async fn add_job(&self, spec: JobSpec) -> Result<Job, QueueError> {
        let now = unix_timestamp_millis();
        let mut state = self.state.lock().await;

        let command = match (spec.command.as_deref(), spec.parameters.as_ref()) {
            (Some(command), _) if !command.trim().is_empty() => command.to_string(),
            (_, Some(parameters)) => parameters.assemble(
                &self.config.blender_bin,
                state.settings.default_output_path.as_deref(),
            ),
            _ => {
                return Err(QueueError::InvalidJob {
                    reason: "a job needs a command or render parameters".to_string(),
                });
            }
        };
        if let Some(unknown) = spec
            .dependencies
            .iter()
            .find(|dep| !state.jobs.iter().any(|j| &j.id == *dep))
        {
            return Err(QueueError::InvalidDependency {
                job_id: "(new job)".to_string(),
                reason: format!("unknown job '{unknown}'"),
            });
        }

        let name = spec.display_name(&command);
        let frame_range = Job::resolve_frame_range(&command, spec.parameters.as_ref());
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            command,
            priority: spec.priority.unwrap_or(state.settings.default_priority),
            dependencies: spec.dependencies,
            scheduled_at: spec.scheduled_at,
            status: if spec.scheduled_at.is_some() {
                JobStatus::Scheduled
            } else {
                JobStatus::Pending
            },
            held: false,
            frame_range,
            progress: ProgressSnapshot::for_range(frame_range),
            parameters: spec.parameters,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };

        state.jobs.push(job.clone());
        info!(job_id = %job.id, name = %job.name, priority = job.priority, "Job added");
        self.hub.publish(QueueEvent::JobAdded {
            job: Box::new(job.clone()),
        });
        if state.settings.auto_start {
            self.set_processing(&mut state, true);
        }
        drop(state);

        self.changed();
        Ok(job)
    }

    /// Remove a job that is not running. Other jobs stop depending on it.
    pub async fn remove_job(&self, job_id: &str) -> Result<Job, QueueError> {
        let mut state = self.state.lock().await;
        let idx = state.position(job_id)?;
        if state.running.contains_key(job_id) || state.jobs[idx].status == JobStatus::Running {
            return Err(QueueError::JobRunning {
                job_id: job_id.to_string(),
            });
        }

        let removed = state.jobs.remove(idx);
        let now = unix_timestamp_millis();
        for job in &mut state.jobs {
            if job.dependencies.remove(job_id) {
                job.updated_at = now;
                self.hub.publish(QueueEvent::JobUpdated {
                    job: Box::new(job.clone()),
                });
            }
        }
        drop(state);

        info!(job_id, "Job removed");
        self.hub.publish(QueueEvent::JobRemoved {
            job_id: job_id.to_string(),
        });
        self.changed();
        Ok(removed)
    }

    /// Apply a partial update to a job that has not started. Editing a held
    /// job releases it.
    pub async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<Job, QueueError> {
        let mut state = self.state.lock().await;
        let idx = state.editable(job_id)?;

        if update.command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(QueueError::InvalidJob {
                reason: "command cannot be empty".to_string(),
            });
        }
        if let Some(deps) = &update.dependencies {
            let mut candidate = state.jobs.clone();
            candidate[idx].dependencies.clear();
            for dep in deps {
                validate_dependency(&candidate, job_id, dep).map_err(|reason| {
                    QueueError::InvalidDependency {
                        job_id: job_id.to_string(),
                        reason,
                    }
                })?;
                candidate[idx].dependencies.insert(dep.clone());
            }
        }

        let default_output_path = state.settings.default_output_path.clone();
        let job = &mut state.jobs[idx];
        if let Some(name) = update.name {
            job.name = name;
        }
        let reassemble = update.command.is_some() || update.parameters.is_some();
        if let Some(parameters) = update.parameters {
            if update.command.is_none() {
                job.command =
                    parameters.assemble(&self.config.blender_bin, default_output_path.as_deref());
            }
            job.parameters = Some(parameters);
        }
        if let Some(command) = update.command {
            job.command = command;
        }
        if reassemble {
            job.frame_range = Job::resolve_frame_range(&job.command, job.parameters.as_ref());
            job.progress = ProgressSnapshot::for_range(job.frame_range);
        }
        if let Some(priority) = update.priority {
            job.priority = priority;
        }
        if let Some(deps) = update.dependencies {
            job.dependencies = deps;
        }
        if let Some(scheduled_at) = update.scheduled_at {
            set_schedule(job, scheduled_at);
        }
        job.held = false;
        job.updated_at = unix_timestamp_millis();
        let job = job.clone();
        drop(state);

        debug!(job_id, "Job updated");
        self.publish_updated(&job);
        Ok(job)
    }

    pub async fn set_priority(&self, job_id: &str, priority: i32) -> Result<Job, QueueError> {
        self.update_job(
            job_id,
            JobUpdate {
                priority: Some(priority),
                ..JobUpdate::default()
            },
        )
        .await
    }

    /// Make `job_id` wait for `dependency` to complete.
    pub async fn add_dependency(&self, job_id: &str, dependency: &str) -> Result<Job, QueueError> {
        let mut state = self.state.lock().await;
        let idx = state.editable(job_id)?;
        validate_dependency(&state.jobs, job_id, dependency).map_err(|reason| {
            QueueError::InvalidDependency {
                job_id: job_id.to_string(),
                reason,
            }
        })?;

        let job = &mut state.jobs[idx];
        job.dependencies.insert(dependency.to_string());
        job.updated_at = unix_timestamp_millis();
        let job = job.clone();
        drop(state);

        debug!(job_id, dependency, "Dependency added");
        self.publish_updated(&job);
        Ok(job)
    }

    /// Returns whether the dependency was present.
    pub async fn remove_dependency(&self, job_id: &str, dependency: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let idx = state.editable(job_id)?;
        let job = &mut state.jobs[idx];
        if !job.dependencies.remove(dependency) {
            return Ok(false);
        }
        job.updated_at = unix_timestamp_millis();
        let job = job.clone();
        drop(state);

        debug!(job_id, dependency, "Dependency removed");
        self.publish_updated(&job);
        Ok(true)
    }

    /// Hold a job until `at` (Unix milliseconds).
    pub async fn schedule_job(&self, job_id: &str, at: i64) -> Result<Job, QueueError> {
        self.update_job(
            job_id,
            JobUpdate {
                scheduled_at: Some(Some(at)),
                ..JobUpdate::default()
            },
        )
        .await
    }

    /// Drop a job's schedule time, making it pending again.
    pub async fn cancel_schedule(&self, job_id: &str) -> Result<Job, QueueError> {
        self.update_job(
            job_id,
            JobUpdate {
                scheduled_at: Some(None),
                ..JobUpdate::default()
            },
        )
        .await
    }

    /// Stop a running job and return it to pending.
    ///
    /// The job is held so it is not picked up again at once; other jobs keep
    /// dispatching. Returns `false` if the job was not running, or if its
    /// process had already exited, in which case the exit code decides.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let process_id = {
            let state = self.state.lock().await;
            state.position(job_id)?;
            let Some(running) = state.running.get(job_id) else {
                return Ok(false);
            };
            running.process_id.clone()
        };

        info!(job_id, process_id, "Cancelling job");
        if !self.supervisor.stop(&process_id).await {
            debug!(job_id, process_id, "Process already exited, leaving the outcome to its exit code");
            return Ok(false);
        }

        // The session may have concluded the cancellation already.
        let concluded = {
            let mut state = self.state.lock().await;
            conclude(
                &mut state,
                job_id,
                &process_id,
                RunEnd::Cancelled,
                None,
                unix_timestamp_millis(),
            )
        };
        if let Some(c) = concluded {
            self.publish_concluded(c).await;
        }
        Ok(true)
    }

    /// Let a held job be dispatched again. Returns whether it was held.
    pub async fn release_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let idx = state.position(job_id)?;
        let job = &mut state.jobs[idx];
        if !job.held {
            return Ok(false);
        }
        job.held = false;
        job.updated_at = unix_timestamp_millis();
        let job = job.clone();
        drop(state);

        info!(job_id, "Job released");
        self.publish_updated(&job);
        Ok(true)
    }

    /// Return a failed job to pending.
    pub async fn retry_job(&self, job_id: &str) -> Result<Job, QueueError> {
        let mut state = self.state.lock().await;
        let idx = state.position(job_id)?;
        let job = &mut state.jobs[idx];
        if job.status != JobStatus::Failed {
            return Err(QueueError::NotRetryable {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        job.reset_run_state();
        job.status = if job.scheduled_at.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Pending
        };
        job.updated_at = unix_timestamp_millis();
        let job = job.clone();
        drop(state);

        info!(job_id, "Job queued for retry");
        self.publish_updated(&job);
        Ok(job)
    }

    /// Drop completed and failed jobs. Returns how many were removed.
    pub async fn clear_finished(&self) -> usize {
        let mut state = self.state.lock().await;
        let (finished, kept): (Vec<Job>, Vec<Job>) = std::mem::take(&mut state.jobs)
            .into_iter()
            .partition(|j| j.status.is_finished());
        state.jobs = kept;
        for job in &mut state.jobs {
            job.dependencies
                .retain(|dep| !finished.iter().any(|f| &f.id == dep));
        }
        drop(state);

        for job in &finished {
            self.hub.publish(QueueEvent::JobRemoved {
                job_id: job.id.clone(),
            });
        }
        if !finished.is_empty() {
            info!(removed = finished.len(), "Cleared finished jobs");
            self.changed();
        }
        finished.len()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn publish_updated(&self, job: &Job) {
        self.hub.publish(QueueEvent::JobUpdated {
            job: Box::new(job.clone()),
        });
        self.changed();
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.persist.notify_one();
    }

    /// Persist soon and re-evaluate now.
    fn changed(&self) {
        self.mark_dirty();
        self.wake.notify_one();
    }
}

fn set_schedule(job: &mut Job, scheduled_at: Option<i64>) {
    job.scheduled_at = scheduled_at;
    job.status = if scheduled_at.is_some() {
        JobStatus::Scheduled
    } else {
        JobStatus::Pending
    };
}

/// Apply the end of the run `process_id` to its job.
///
/// Returns `None` when that run is no longer the job's current one.
fn conclude(
    state: &mut QueueState,
    job_id: &str,
    process_id: &str,
    end: RunEnd,
    snapshot: Option<ProgressSnapshot>,
    now: i64,
) -> Option<Concluded> {
    if state
        .running
        .get(job_id)
        .is_none_or(|r| r.process_id != process_id)
    {
        return None;
    }
    let running = state.running.remove(job_id)?;
    let job = state.jobs.iter_mut().find(|j| j.id == job_id)?;

    job.progress = snapshot.unwrap_or_else(|| running.progress.borrow().clone());
    job.finished_at = Some(now);
    job.updated_at = now;

    let (status, cancelled) = match end {
        RunEnd::Succeeded => {
            job.status = JobStatus::Completed;
            job.error = None;
            job.progress.progress = 100.0;
            (HistoryStatus::Completed, false)
        }
        RunEnd::Failed(message) => {
            job.status = JobStatus::Failed;
            job.error = Some(message);
            (HistoryStatus::Failed, false)
        }
        RunEnd::Cancelled => {
            job.error = None;
            (HistoryStatus::Cancelled, true)
        }
    };

    let record = history_record(job, status, now);
    if cancelled {
        job.status = JobStatus::Pending;
        job.held = true;
        job.reset_run_state();
    }

    Some(Concluded {
        job: job.clone(),
        record,
        cancelled,
    })
}

fn history_record(job: &Job, status: HistoryStatus, end_time: i64) -> HistoryRecord {
    let start_time = job.started_at.unwrap_or(end_time);
    HistoryRecord {
        id: uuid::Uuid::new_v4().to_string(),
        job_id: job.id.clone(),
        name: job.name.clone(),
        command: job.command.clone(),
        status: status.to_string(),
        start_time,
        end_time,
        duration_ms: (end_time - start_time).max(0),
        progress: job.progress.progress,
        current_frame: job.progress.current_frame,
        total_frames: job.progress.total_frames(),
        current_sample: i64::from(job.progress.current_sample),
        total_samples: i64::from(job.progress.total_samples),
        peak_memory: job.progress.peak_memory,
        error: job.error.clone(),
        parameters: job
            .parameters
            .as_ref()
            .and_then(|p| serde_json::to_string(p).ok()),
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::collections::BTreeSet;

    use tokio::sync::broadcast;

    use super::*;
    use crate::supervisor::SupervisorConfig;

    struct Harness {
        scheduler: Arc<QueueScheduler>,
        hub: Arc<EventHub>,
        db: Database,
        shutdown: watch::Sender<bool>,
    }

    impl Harness {
        async fn new(max_concurrent: u32) -> Self {
            Self::with_db(Database::open_in_memory().await.unwrap(), max_concurrent)
        }

        fn with_db(db: Database, max_concurrent: u32) -> Self {
            let hub = Arc::new(EventHub::with_defaults());
            let supervisor = Arc::new(ProcessSupervisor::new(SupervisorConfig {
                terminate_timeout: Duration::from_millis(300),
                kill_timeout: Duration::from_secs(3),
                drain_timeout: Duration::from_millis(300),
            }));
            let config = SchedulerConfig {
                poll_interval: Duration::from_millis(50),
                persist_delay: Duration::from_millis(10),
                history_limit: 50,
                blender_bin: "blender".to_string(),
                initial_settings: QueueSettings {
                    max_concurrent,
                    ..QueueSettings::default()
                },
            };
            let scheduler = Arc::new(QueueScheduler::new(
                supervisor,
                Arc::clone(&hub),
                db.clone(),
                config,
            ));
            let (shutdown, rx) = watch::channel(false);
            scheduler.spawn(&rx);
            Self {
                scheduler,
                hub,
                db,
                shutdown,
            }
        }

        async fn add(&self, command: &str, priority: i32, deps: &[&str]) -> Job {
            self.scheduler
                .add_job(JobSpec {
                    command: Some(command.to_string()),
                    priority: Some(priority),
                    dependencies: deps.iter().map(ToString::to_string).collect(),
                    ..JobSpec::default()
                })
                .await
                .unwrap()
        }

        async fn wait_for(&self, what: &str, pred: impl Fn(&[Job]) -> bool) {
            for _ in 0..500 {
                if pred(&self.scheduler.jobs().await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("timed out waiting for {what}: {:?}", self.scheduler.jobs().await);
        }

        async fn status(&self, job_id: &str) -> JobStatus {
            self.scheduler.job(job_id).await.unwrap().status
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = self.shutdown.send(true);
        }
    }

    fn all_finished(jobs: &[Job]) -> bool {
        jobs.iter().all(|j| j.status.is_finished())
    }

    /// Job IDs in the order they were dispatched.
    fn start_order(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<String> {
        let mut order = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let QueueEvent::JobUpdated { job } = event
                && job.status == JobStatus::Running
            {
                order.push(job.id);
            }
        }
        order
    }

    #[tokio::test]
    async fn dispatches_by_priority_then_age() {
        let h = Harness::new(1).await;
        let mut rx = h.hub.subscribe();
        let low = h.add("true", 3, &[]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let older = h.add("true", 5, &[]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = h.add("true", 5, &[]).await;

        h.scheduler.start_processing().await;
        h.wait_for("all jobs finished", all_finished).await;

        assert_eq!(start_order(&mut rx), vec![older.id, newer.id, low.id]);
    }

    #[tokio::test]
    async fn dependencies_run_first() {
        let h = Harness::new(2).await;
        let mut rx = h.hub.subscribe();
        let base = h.add("sh -c 'sleep 0.2'", 0, &[]).await;
        let dependent = h.add("true", 10, &[&base.id]).await;

        h.scheduler.start_processing().await;
        h.wait_for("all jobs finished", all_finished).await;

        assert_eq!(start_order(&mut rx), vec![base.id.clone(), dependent.id.clone()]);
        let base = h.scheduler.job(&base.id).await.unwrap();
        let dependent = h.scheduler.job(&dependent.id).await.unwrap();
        assert!(dependent.started_at >= base.finished_at);
    }

    #[tokio::test]
    async fn running_count_never_exceeds_max_concurrent() {
        let h = Harness::new(2).await;
        for _ in 0..4 {
            h.add("sleep 0.3", 0, &[]).await;
        }
        h.scheduler.start_processing().await;

        let mut peak = 0;
        for _ in 0..200 {
            let running = h
                .scheduler
                .jobs()
                .await
                .iter()
                .filter(|j| j.status == JobStatus::Running)
                .count();
            assert!(running <= 2, "{running} jobs running");
            peak = peak.max(running);
            if all_finished(&h.scheduler.jobs().await) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(peak, 2);
        h.wait_for("all jobs finished", all_finished).await;
    }

    #[tokio::test]
    async fn exit_codes_map_to_status() {
        let h = Harness::new(3).await;
        let ok = h
            .add(r#"sh -c "echo 'Fra:1 Mem:12M (Peak 40M) | Sample 8/8'""#, 0, &[])
            .await;
        let bad = h.add("sh -c 'exit 3'", 0, &[]).await;
        let crashed = h
            .add(r#"sh -c "echo 'Error: Cannot render, no camera' >&2; exit 1""#, 0, &[])
            .await;

        h.scheduler.start_processing().await;
        h.wait_for("all jobs finished", all_finished).await;

        let ok = h.scheduler.job(&ok.id).await.unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert!((ok.progress.peak_memory - 40.0).abs() < f64::EPSILON);

        let bad = h.scheduler.job(&bad.id).await.unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("exited with code 3"));

        let crashed = h.scheduler.job(&crashed.id).await.unwrap();
        assert_eq!(
            crashed.error.as_deref(),
            Some("Error: Cannot render, no camera")
        );

        // History is written just after the status transition.
        let mut history = Vec::new();
        for _ in 0..100 {
            history = h.scheduler.history(10, 0).await.unwrap();
            if history.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(history.len(), 3);
        assert!(history.iter().any(|r| r.status() == Some(HistoryStatus::Completed)));
    }

    #[tokio::test]
    async fn spawn_failure_fails_job_and_moves_on() {
        let h = Harness::new(1).await;
        let missing = h.add("/no/such/blender -b a.blend", 5, &[]).await;
        let next = h.add("true", 0, &[]).await;

        h.scheduler.start_processing().await;
        h.wait_for("all jobs finished", all_finished).await;

        assert_eq!(h.status(&missing.id).await, JobStatus::Failed);
        assert_eq!(h.status(&next.id).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_holds_the_job_and_keeps_processing() {
        let h = Harness::new(1).await;
        let job = h.add("sleep 30", 0, &[]).await;
        h.scheduler.start_processing().await;
        h.wait_for("job running", |jobs| jobs[0].status == JobStatus::Running)
            .await;

        assert!(h.scheduler.cancel_job(&job.id).await.unwrap());
        let cancelled = h.scheduler.job(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Pending);
        assert!(cancelled.held);
        assert!(h.scheduler.is_processing().await);
        assert_eq!(h.scheduler.running_count().await, 0);

        // Not running any more.
        assert!(!h.scheduler.cancel_job(&job.id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.status(&job.id).await, JobStatus::Pending);
        let history = h.scheduler.history(10, 0).await.unwrap();
        assert_eq!(history[0].status(), Some(HistoryStatus::Cancelled));
    }

    #[tokio::test]
    async fn other_jobs_dispatch_after_a_cancel() {
        let h = Harness::new(1).await;
        let slow = h.add("sleep 30", 5, &[]).await;
        let next = h.add("true", 0, &[]).await;
        h.scheduler.start_processing().await;
        h.wait_for("slow job running", |jobs| {
            jobs.iter()
                .any(|j| j.id == slow.id && j.status == JobStatus::Running)
        })
        .await;

        assert!(h.scheduler.cancel_job(&slow.id).await.unwrap());
        h.wait_for("second job completed", |jobs| {
            jobs.iter()
                .any(|j| j.id == next.id && j.status == JobStatus::Completed)
        })
        .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.status(&slow.id).await, JobStatus::Pending);
        assert_eq!(h.scheduler.running_count().await, 0);
    }

    #[tokio::test]
    async fn quit_marker_then_nonzero_exit_fails_the_job() {
        let h = Harness::new(1).await;
        let job = h
            .add(r#"sh -c "echo 'Blender quit'; exit 3""#, 0, &[])
            .await;
        h.scheduler.start_processing().await;
        h.wait_for("job failed", |jobs| jobs[0].status == JobStatus::Failed)
            .await;

        let job = h.scheduler.job(&job.id).await.unwrap();
        assert_eq!(job.error.as_deref(), Some("exited with code 3"));
        assert!(!job.held);
    }

    #[tokio::test]
    async fn released_job_is_dispatched_again() {
        let h = Harness::new(1).await;
        let job = h.add("sleep 30", 0, &[]).await;
        h.scheduler.start_processing().await;
        h.wait_for("job running", |jobs| jobs[0].status == JobStatus::Running)
            .await;
        assert!(h.scheduler.cancel_job(&job.id).await.unwrap());

        // Editing releases the hold.
        h.scheduler.set_priority(&job.id, 3).await.unwrap();
        assert!(!h.scheduler.job(&job.id).await.unwrap().held);
        h.wait_for("job running again", |jobs| {
            jobs[0].status == JobStatus::Running
        })
        .await;
        assert!(h.scheduler.cancel_job(&job.id).await.unwrap());

        assert!(h.scheduler.release_job(&job.id).await.unwrap());
        assert!(!h.scheduler.release_job(&job.id).await.unwrap());
        h.wait_for("job running after release", |jobs| {
            jobs[0].status == JobStatus::Running
        })
        .await;
        h.scheduler.shutdown().await.unwrap();

        let job = h.scheduler.job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.held);
        assert!(matches!(
            h.scheduler.release_job("missing").await,
            Err(QueueError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn history_can_be_inspected_and_cleared() {
        let h = Harness::new(1).await;
        let job = h.add("true", 0, &[]).await;
        let other = h.add("false", 0, &[]).await;
        h.scheduler.start_processing().await;
        h.wait_for("both finished", |jobs| {
            jobs.iter().all(|j| j.status.is_finished())
        })
        .await;

        let mut history = Vec::new();
        for _ in 0..100 {
            history = h.scheduler.history(10, 0).await.unwrap();
            if history.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(history.len(), 2);

        let runs = h.scheduler.job_history(&job.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status(), Some(HistoryStatus::Completed));
        let entry = h.scheduler.history_entry(&runs[0].id).await.unwrap();
        assert_eq!(entry.job_id, job.id);

        assert!(h.scheduler.delete_history(&entry.id).await.unwrap());
        assert!(!h.scheduler.delete_history(&entry.id).await.unwrap());
        assert!(h.scheduler.job_history(&job.id).await.unwrap().is_empty());
        assert!(h.scheduler.history_entry(&entry.id).await.is_err());

        assert_eq!(h.scheduler.clear_history().await.unwrap(), 1);
        assert!(h.scheduler.job_history(&other.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn running_jobs_cannot_be_edited_or_removed() {
        let h = Harness::new(1).await;
        let job = h.add("sleep 30", 0, &[]).await;
        h.scheduler.start_processing().await;
        h.wait_for("job running", |jobs| jobs[0].status == JobStatus::Running)
            .await;

        assert!(matches!(
            h.scheduler.set_priority(&job.id, 9).await,
            Err(QueueError::NotEditable { .. })
        ));
        assert!(matches!(
            h.scheduler.remove_job(&job.id).await,
            Err(QueueError::JobRunning { .. })
        ));
        h.scheduler.shutdown().await.unwrap();
        assert_eq!(h.status(&job.id).await, JobStatus::Pending);
    }

    #[tokio::test]
    async fn dependency_mutations_are_validated() {
        let h = Harness::new(1).await;
        let a = h.add("true", 0, &[]).await;
        let b = h.add("true", 0, &[&a.id]).await;

        assert!(matches!(
            h.scheduler.add_dependency(&a.id, &b.id).await,
            Err(QueueError::InvalidDependency { .. })
        ));
        assert!(h.scheduler.add_dependency(&a.id, &a.id).await.is_err());
        assert!(h.scheduler.add_dependency(&a.id, "ghost").await.is_err());
        assert!(h
            .scheduler
            .update_job(
                &a.id,
                JobUpdate {
                    dependencies: Some(BTreeSet::from([b.id.clone()])),
                    ..JobUpdate::default()
                },
            )
            .await
            .is_err());

        assert!(h.scheduler.remove_dependency(&b.id, &a.id).await.unwrap());
        assert!(!h.scheduler.remove_dependency(&b.id, &a.id).await.unwrap());
        h.scheduler.add_dependency(&b.id, &a.id).await.unwrap();

        h.scheduler.remove_job(&a.id).await.unwrap();
        assert!(h.scheduler.job(&b.id).await.unwrap().dependencies.is_empty());
    }

    #[tokio::test]
    async fn schedule_and_cancel_schedule() {
        let h = Harness::new(1).await;
        let job = h.add("true", 0, &[]).await;
        let future = unix_timestamp_millis() + 60_000;

        let scheduled = h.scheduler.schedule_job(&job.id, future).await.unwrap();
        assert_eq!(scheduled.status, JobStatus::Scheduled);
        h.scheduler.start_processing().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.status(&job.id).await, JobStatus::Scheduled);

        let pending = h.scheduler.cancel_schedule(&job.id).await.unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        h.wait_for("job completed", all_finished).await;
    }

    #[tokio::test]
    async fn due_schedule_is_promoted_and_run() {
        let h = Harness::new(1).await;
        let job = h
            .scheduler
            .add_job(JobSpec {
                scheduled_at: Some(unix_timestamp_millis() + 100),
                ..JobSpec::from_command("true")
            })
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        h.scheduler.start_processing().await;
        h.wait_for("scheduled job completed", all_finished).await;
    }

    #[tokio::test]
    async fn retry_and_clear_finished() {
        let h = Harness::new(1).await;
        let failing = h.add("false", 0, &[]).await;
        let ok = h.add("true", 0, &[]).await;
        h.scheduler.start_processing().await;
        h.wait_for("all jobs finished", all_finished).await;

        assert!(matches!(
            h.scheduler.retry_job(&ok.id).await,
            Err(QueueError::NotRetryable { .. })
        ));
        h.scheduler.stop_processing().await;
        let retried = h.scheduler.retry_job(&failing.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.error, None);

        assert_eq!(h.scheduler.clear_finished().await, 1);
        assert_eq!(h.scheduler.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn add_job_from_parameters_uses_settings() {
        let h = Harness::new(1).await;
        h.scheduler
            .update_settings(SettingsUpdate {
                default_priority: Some(4),
                default_output_path: Some(Some("/out/frame_####".to_string())),
                ..SettingsUpdate::default()
            })
            .await;

        let job = h
            .scheduler
            .add_job(JobSpec::from_parameters(rendq_core::RenderParameters {
                blend_file: "/shots/intro.blend".to_string(),
                output_path: None,
                scene: None,
                engine: None,
                format: None,
                frame_start: 1,
                frame_end: 24,
                threads: None,
                extra_args: Vec::new(),
            }))
            .await
            .unwrap();

        assert_eq!(job.name, "intro");
        assert_eq!(job.priority, 4);
        assert!(job.command.contains("/out/frame_####"));
        assert_eq!(job.frame_range, rendq_core::FrameRange::new(1, 24));

        assert!(matches!(
            h.scheduler.add_job(JobSpec::default()).await,
            Err(QueueError::InvalidJob { .. })
        ));
    }

    #[tokio::test]
    async fn auto_start_begins_processing_on_add() {
        let h = Harness::new(1).await;
        h.scheduler
            .update_settings(SettingsUpdate {
                auto_start: Some(true),
                max_concurrent: Some(0),
                ..SettingsUpdate::default()
            })
            .await;
        assert_eq!(h.scheduler.settings().await.max_concurrent, 1);

        h.add("true", 0, &[]).await;
        assert!(h.scheduler.is_processing().await);
        h.wait_for("job completed", all_finished).await;
    }

    #[tokio::test]
    async fn state_round_trips_through_storage() {
        let db = Database::open_in_memory().await.unwrap();
        let first = Harness::with_db(db.clone(), 1);
        let a = first.add("blender -b a.blend -f 1", 2, &[]).await;
        first.add("blender -b b.blend -s 1 -e 9 -a", 7, &[&a.id]).await;
        first.scheduler.schedule_job(&a.id, 4_102_444_800_000).await.unwrap();
        first
            .scheduler
            .update_settings(SettingsUpdate {
                max_concurrent: Some(3),
                ..SettingsUpdate::default()
            })
            .await;
        first.scheduler.flush().await.unwrap();
        let jobs = first.scheduler.jobs().await;
        let settings = first.scheduler.settings().await;
        drop(first);

        let second = Harness::with_db(db, 1);
        second.scheduler.load().await;
        assert_eq!(second.scheduler.jobs().await, jobs);
        assert_eq!(second.scheduler.settings().await, settings);
    }

    #[tokio::test]
    async fn storage_failure_keeps_scheduler_running() {
        let h = Harness::new(1).await;
        h.db.pool().close().await;

        assert!(h.scheduler.flush().await.is_err());
        h.scheduler.load().await;
        let job = h.add("true", 0, &[]).await;
        h.scheduler.start_processing().await;
        h.wait_for("job completed", all_finished).await;
        assert_eq!(h.status(&job.id).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn flush_task_persists_mutations() {
        let h = Harness::new(1).await;
        let job = h.add("true", 0, &[]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored: Vec<Job> = h
            .db
            .kv_get_json(super::super::persist::ITEMS_KEY, Vec::new())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, job.id);
    }
}
