//! Event hub for render session and queue fan-out.
//!
//! Each running job has its own broadcast channel that exists only while its
//! session runs. Every session event is also mirrored onto the queue-wide
//! channel together with job lifecycle events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use crate::queue::QueueEvent;

use super::types::{HubConfig, HubError, SessionEvent, SessionMessage};

/// Proof of one `open_session` call.
///
/// A job may be dispatched again while its previous session is still winding
/// down; the generation keeps the old session from publishing into, or
/// closing, the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    job_id: String,
    generation: u64,
}

impl SessionTicket {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

struct HubSession {
    generation: u64,
    event_tx: broadcast::Sender<SessionMessage>,
    sequence: u64,
}

impl HubSession {
    fn new(generation: u64, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self {
            generation,
            event_tx,
            sequence: 0,
        }
    }

    const fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Fan-out point between render sessions and their listeners.
pub struct EventHub {
    sessions: Arc<RwLock<HashMap<String, HubSession>>>,
    generations: AtomicU64,
    queue_tx: broadcast::Sender<QueueEvent>,
    config: HubConfig,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        let (queue_tx, _) = broadcast::channel(config.queue_capacity);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            generations: AtomicU64::new(0),
            queue_tx,
            config,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    /// Register the session channel for `job_id`, replacing a stale one.
    pub async fn open_session(&self, job_id: &str) -> SessionTicket {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = self
            .sessions
            .write()
            .await
            .insert(
                job_id.to_string(),
                HubSession::new(generation, self.config.session_capacity),
            )
            .is_some();
        if replaced {
            debug!(job_id, "Replaced stale session channel");
        }
        info!(job_id, generation, "Session opened");
        SessionTicket {
            job_id: job_id.to_string(),
            generation,
        }
    }

    /// Drop the ticket's session channel. Subscribers see the channel close
    /// after draining what was already sent.
    ///
    /// Returns `false` if the channel is gone or belongs to a newer session.
    pub async fn close_session(&self, ticket: &SessionTicket) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&ticket.job_id)
            .is_none_or(|s| s.generation != ticket.generation)
        {
            return false;
        }
        sessions.remove(&ticket.job_id);
        drop(sessions);
        info!(job_id = %ticket.job_id, generation = ticket.generation, "Session closed");
        true
    }

    /// Subscribe to a running job's session events.
    pub async fn subscribe_session(
        &self,
        job_id: &str,
    ) -> Result<broadcast::Receiver<SessionMessage>, HubError> {
        self.sessions
            .read()
            .await
            .get(job_id)
            .map(|session| session.event_tx.subscribe())
            .ok_or_else(|| HubError::SessionNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Publish an event on the ticket's session channel and the queue channel.
    ///
    /// Events for a closed or superseded session are dropped.
    pub async fn publish_session(&self, ticket: &SessionTicket, event: SessionEvent) {
        let job_id = ticket.job_id.as_str();
        let message = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions
                .get_mut(job_id)
                .filter(|s| s.generation == ticket.generation)
            else {
                debug!(job_id, "Dropping event for closed session");
                return;
            };
            let message = SessionMessage {
                job_id: job_id.to_string(),
                sequence: session.next_sequence(),
                event,
            };
            if session.event_tx.send(message.clone()).is_err() {
                debug!(job_id, "No session subscribers");
            }
            message
        };
        self.publish(QueueEvent::Session(message));
    }

    /// Subscribe to all queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue_tx.subscribe()
    }

    /// Publish a queue-wide event.
    pub fn publish(&self, event: QueueEvent) {
        // No receivers is normal when nothing is listening.
        let _ = self.queue_tx.send(event);
    }

    pub async fn has_session(&self, job_id: &str) -> bool {
        self.sessions.read().await.contains_key(job_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
