//! One render execution: a supervised process paired with a progress parser.

use std::sync::Arc;

use rendq_core::FrameRange;
use rendq_core::db::unix_timestamp_millis;
use rendq_core::progress::{OutputStream, ProgressEvent, ProgressParser, ProgressSnapshot};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::supervisor::{ProcessEvent, ProcessHandle, ProcessSupervisor, SupervisorError};

use super::hub::{EventHub, SessionTicket};
use super::types::{SessionEvent, SessionOutcome};

/// Buffered process events per session.
const EVENT_BUFFER: usize = 256;

/// What a session needs to know about the job it renders.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub job_id: String,
    pub command: String,
    pub frame_range: FrameRange,
}

/// A running render. Consumed by [`run`](Self::run).
pub struct RenderSession {
    job_id: String,
    ticket: SessionTicket,
    handle: ProcessHandle,
    parser: ParseState,
    events: mpsc::Receiver<ProcessEvent>,
    hub: Arc<EventHub>,
}

struct ParseState {
    parser: ProgressParser,
    progress_tx: watch::Sender<ProgressSnapshot>,
    last_critical: Option<String>,
}

impl RenderSession {
    /// Open the job's hub session and start its process.
    ///
    /// The hub session is closed again if the process fails to start.
    pub async fn launch(
        supervisor: &ProcessSupervisor,
        hub: Arc<EventHub>,
        job: RenderJob,
    ) -> Result<Self, SupervisorError> {
        let ticket = hub.open_session(&job.job_id).await;

        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let handle = match supervisor.start(&job.job_id, &job.command, tx).await {
            Ok(handle) => handle,
            Err(e) => {
                hub.publish_session(
                    &ticket,
                    SessionEvent::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                hub.close_session(&ticket).await;
                return Err(e);
            }
        };

        let parser = ProgressParser::new(job.frame_range);
        let (progress_tx, _) = watch::channel(parser.snapshot().clone());
        Ok(Self {
            job_id: job.job_id,
            ticket,
            handle,
            parser: ParseState {
                parser,
                progress_tx,
                last_critical: None,
            },
            events,
            hub,
        })
    }

    pub const fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Live view of the session's progress snapshot.
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.parser.progress_tx.subscribe()
    }

    /// Drive the session until the process exits.
    ///
    /// The hub session is closed on every path out of this function.
    pub async fn run(mut self) -> SessionOutcome {
        let mut exit = None;
        while let Some(event) = self.events.recv().await {
            match event {
                ProcessEvent::Line { stream, text } => self.on_line(stream, text).await,
                ProcessEvent::Error { message } => {
                    warn!(job_id = %self.job_id, %message, "Render process error");
                    self.hub
                        .publish_session(&self.ticket, SessionEvent::Error { message })
                        .await;
                }
                ProcessEvent::Exit { code, cancelled } => {
                    exit = Some((code, cancelled));
                    break;
                }
            }
        }

        let (exit_code, cancelled) = exit.unwrap_or_else(|| {
            warn!(job_id = %self.job_id, "Event channel closed without exit status");
            (None, false)
        });

        self.hub
            .publish_session(
                &self.ticket,
                SessionEvent::Complete {
                    exit_code,
                    cancelled,
                },
            )
            .await;
        self.hub.close_session(&self.ticket).await;

        info!(
            job_id = %self.job_id,
            process_id = %self.handle.id,
            exit_code = ?exit_code,
            cancelled,
            "Render session finished"
        );

        SessionOutcome {
            job_id: self.job_id,
            process_id: self.handle.id,
            exit_code,
            cancelled,
            last_critical: self.parser.last_critical,
            snapshot: self.parser.parser.snapshot().clone(),
            started_at: self.handle.started_at,
            finished_at: unix_timestamp_millis(),
        }
    }

    async fn on_line(&mut self, stream: OutputStream, text: String) {
        debug!(job_id = %self.job_id, stream = stream.as_str(), "{}", text);
        let events = self.parser.parser.feed(&text, stream);
        self.hub
            .publish_session(&self.ticket, SessionEvent::Log { stream, line: text })
            .await;

        let mut progressed = false;
        for event in events {
            match event {
                ProgressEvent::Progress(_) => progressed = true,
                ProgressEvent::Critical(message) => {
                    warn!(job_id = %self.job_id, %message, "Critical render output");
                    self.parser.last_critical = Some(message.clone());
                    self.hub
                        .publish_session(&self.ticket, SessionEvent::Critical { message })
                        .await;
                }
                // Already forwarded as a log line.
                ProgressEvent::Noise(_) => {}
                ProgressEvent::EngineQuit => {
                    debug!(job_id = %self.job_id, "Engine reported quit");
                }
            }
        }

        if progressed {
            let snapshot = self.parser.parser.snapshot().clone();
            self.parser.progress_tx.send_replace(snapshot.clone());
            self.hub
                .publish_session(&self.ticket, SessionEvent::Progress { snapshot })
                .await;
        }
    }
}
