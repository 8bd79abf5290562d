//! Render process lifecycle manager.
//!
//! Spawns one engine process per render attempt, streams its output as lines
//! and terminates its process tree on request.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use rendq_core::command::split_command;
use rendq_core::db::unix_timestamp_millis;
use rendq_core::progress::OutputStream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lines::LineBuffer;
use super::terminate::{PlatformTerminator, Termination, Terminator, wait_exited};

/// Read chunk size for engine output pipes.
const READ_CHUNK: usize = 8192;

/// Event delivered on a process's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One complete line of output.
    Line { stream: OutputStream, text: String },
    /// The process could not be started.
    Error { message: String },
    /// The process exited. `code` is `None` when it died by signal.
    Exit { code: Option<i32>, cancelled: bool },
}

/// Handle to a running render process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Unique identifier for this spawn.
    pub id: String,
    /// OS process ID.
    pub pid: Option<u32>,
    /// Job this process renders.
    pub job_id: String,
    /// Spawn time, Unix milliseconds.
    pub started_at: i64,
}

/// Timing knobs for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Wait between the polite stop request and the forced kill.
    pub terminate_timeout: Duration,
    /// Wait for the exit to be observed after a forced kill.
    pub kill_timeout: Duration,
    /// How long output readers may keep draining after the process exited.
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            terminate_timeout: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl SupervisorConfig {
    /// Default timings with the given grace period.
    pub fn with_terminate_timeout(terminate_timeout: Duration) -> Self {
        Self {
            terminate_timeout,
            ..Self::default()
        }
    }
}

/// Run states shared by `stop` and the monitor. Transitions happen by
/// compare-exchange so a process is either stopped or exited on its own,
/// never both.
const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const EXITED: u8 = 2;

struct ProcessEntry {
    handle: ProcessHandle,
    run_state: Arc<AtomicU8>,
    exited: watch::Receiver<bool>,
}

/// Process supervisor for render engine processes.
pub struct ProcessSupervisor {
    /// Active processes keyed by process ID.
    processes: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    terminator: PlatformTerminator,
    drain_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            terminator: PlatformTerminator::new(config.terminate_timeout, config.kill_timeout),
            drain_timeout: config.drain_timeout,
        }
    }

    /// Spawn `command` for `job_id`, delivering its events on `events`.
    ///
    /// On failure an [`ProcessEvent::Error`] is sent before the error is
    /// returned, and nothing is registered.
    pub async fn start(
        &self,
        job_id: &str,
        command: &str,
        events: mpsc::Sender<ProcessEvent>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let argv = match split_command(command) {
            Ok(argv) => argv,
            Err(e) => {
                let err = SupervisorError::InvalidCommand {
                    reason: e.to_string(),
                };
                report_start_failure(&events, job_id, &err).await;
                return Err(err);
            }
        };
        let Some((program, args)) = argv.split_first() else {
            let err = SupervisorError::InvalidCommand {
                reason: "empty command".to_string(),
            };
            report_start_failure(&events, job_id, &err).await;
            return Err(err);
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so the whole tree can be signalled at once.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(job_id, program, args = args.len(), "Spawning render process");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = SupervisorError::SpawnFailed {
                    program: program.clone(),
                    reason: e.to_string(),
                };
                report_start_failure(&events, job_id, &err).await;
                return Err(err);
            }
        };

        let process_id = uuid::Uuid::new_v4().to_string();
        let handle = ProcessHandle {
            id: process_id.clone(),
            pid: child.id(),
            job_id: job_id.to_string(),
            started_at: unix_timestamp_millis(),
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(
                stdout,
                OutputStream::Stdout,
                events.clone(),
                process_id.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(
                stderr,
                OutputStream::Stderr,
                events.clone(),
                process_id.clone(),
            )));
        }

        let run_state = Arc::new(AtomicU8::new(RUNNING));
        let (exited_tx, exited_rx) = watch::channel(false);

        // Registered before the monitor starts so its removal always follows.
        self.processes.write().await.insert(
            process_id.clone(),
            ProcessEntry {
                handle: handle.clone(),
                run_state: Arc::clone(&run_state),
                exited: exited_rx,
            },
        );

        tokio::spawn(monitor(
            child,
            readers,
            ExitReport {
                process_id,
                processes: Arc::clone(&self.processes),
                run_state,
                exited: exited_tx,
                events,
                drain_timeout: self.drain_timeout,
            },
        ));

        info!(job_id, process_id = %handle.id, pid = ?handle.pid, "Render process started");
        Ok(handle)
    }

    /// Terminate a process and its children.
    ///
    /// Returns `false` when the process is unknown, has already exited (even
    /// if its output is still draining), or is already being stopped. Only a
    /// `true` return marks the exit as cancelled. Waits until the exit is
    /// observed or the termination timeouts elapse.
    pub async fn stop(&self, process_id: &str) -> bool {
        let (pid, mut exited) = {
            let processes = self.processes.read().await;
            let Some(entry) = processes.get(process_id) else {
                debug!(process_id, "Stop requested for unknown process");
                return false;
            };
            if let Err(state) = entry.run_state.compare_exchange(
                RUNNING,
                STOPPING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                if state == EXITED {
                    debug!(process_id, "Stop requested after exit, output still draining");
                } else {
                    debug!(process_id, "Stop already in progress");
                }
                return false;
            }
            (entry.handle.pid, entry.exited.clone())
        };

        info!(process_id, ?pid, "Stopping render process");
        let Some(pid) = pid else {
            // Already reaped; the monitor is finishing up.
            wait_exited(&mut exited, self.drain_timeout).await;
            return true;
        };

        match self.terminator.terminate(pid, exited).await {
            Termination::Graceful => info!(process_id, pid, "Render process stopped"),
            Termination::Forced => warn!(process_id, pid, "Render process killed"),
            Termination::Unconfirmed => {
                error!(process_id, pid, "Render process did not confirm exit after kill");
            }
        }
        true
    }

    /// Stop every running process. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.processes.read().await.keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop(&id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Get count of active processes.
    pub async fn active_count(&self) -> usize {
        self.processes.read().await.len()
    }

    /// Handle of an active process.
    pub async fn handle(&self, process_id: &str) -> Option<ProcessHandle> {
        self.processes
            .read()
            .await
            .get(process_id)
            .map(|entry| entry.handle.clone())
    }

    /// Whether the process is still running.
    pub async fn is_running(&self, process_id: &str) -> bool {
        self.processes.read().await.contains_key(process_id)
    }
}

async fn report_start_failure(
    events: &mpsc::Sender<ProcessEvent>,
    job_id: &str,
    err: &SupervisorError,
) {
    error!(job_id, error = %err, "Failed to start render process");
    let _ = events
        .send(ProcessEvent::Error {
            message: err.to_string(),
        })
        .await;
}

/// Forward complete lines from `reader` until EOF.
async fn pump_lines<R>(
    mut reader: R,
    stream: OutputStream,
    events: mpsc::Sender<ProcessEvent>,
    process_id: String,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut lines = LineBuffer::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(process_id, stream = stream.as_str(), error = %e, "Output read failed");
                break;
            }
        };
        for text in lines.push(&buf[..n]) {
            if events.send(ProcessEvent::Line { stream, text }).await.is_err() {
                debug!(process_id, "Event channel closed");
                return;
            }
        }
    }

    if let Some(text) = lines.finish() {
        let _ = events.send(ProcessEvent::Line { stream, text }).await;
    }
    debug!(process_id, stream = stream.as_str(), "Output reader finished");
}

/// State the monitor needs to publish an exit.
struct ExitReport {
    process_id: String,
    processes: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    run_state: Arc<AtomicU8>,
    exited: watch::Sender<bool>,
    events: mpsc::Sender<ProcessEvent>,
    drain_timeout: Duration,
}

/// Own the child until it exits, then publish the exit after its output.
async fn monitor(mut child: Child, readers: Vec<JoinHandle<()>>, exit: ExitReport) {
    let process_id = exit.process_id;
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            error!(process_id, error = %e, "Failed to wait for render process");
            None
        }
    };

    // Decided at exit, before draining: a stop arriving later is refused.
    let cancelled = exit.run_state.swap(EXITED, Ordering::SeqCst) == STOPPING;

    // A grandchild may still hold the pipes open; don't wait on it forever.
    for mut reader in readers {
        if tokio::time::timeout(exit.drain_timeout, &mut reader)
            .await
            .is_err()
        {
            warn!(process_id, "Output still open after exit, abandoning reader");
            reader.abort();
        }
    }

    exit.processes.write().await.remove(&process_id);
    exit.exited.send_replace(true);

    info!(process_id, exit_code = ?code, cancelled, "Render process exited");
    let _ = exit.events.send(ProcessEvent::Exit { code, cancelled }).await;
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },
}
