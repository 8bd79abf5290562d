#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the render queue.
//!
//! Drives the scheduler, sessions and supervisor together against a fake
//! engine script that prints Blender-style console output, with state kept in
//! an on-disk database.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use rendq_core::progress::OutputStream;
use rendq_core::{QueueSettings, RenderParameters};
use rendq_daemon::queue::{Job, JobSpec, JobStatus, QueueEvent, QueueScheduler, SchedulerConfig};
use rendq_daemon::session::{EventHub, SessionEvent};
use rendq_daemon::storage::{Database, HistoryStatus};
use rendq_daemon::supervisor::{ProcessSupervisor, SupervisorConfig};

const FAKE_BLENDER: &str = r#"#!/bin/sh
echo "Blender 4.1.0 (hash 000000000000 built 2024-03-25 20:42:48)"
echo "Read blend: \"$3\""
for f in 1 2 3; do
  echo "Fra:$f Mem:256.00M (Peak 512.00M) | Time:00:00.10 | Syncing Cube"
  echo "Fra:$f Mem:300.5M (Peak 1.5G) | Time:00:00.20 | Sample 64/128"
  echo "Fra:$f Mem:310.0M (Peak 1.5G) | Time:00:00.30 | Compositing | Tile 1-1"
  echo "Saved: '/tmp/rendq_out_000$f.png'"
done
echo "Warning: unable to open font" >&2
echo ""
echo "Blender quit"
"#;

struct Daemon {
    scheduler: Arc<QueueScheduler>,
    hub: Arc<EventHub>,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    async fn start(db_path: &Path, blender_bin: &Path) -> Self {
        let db = Database::open(db_path).await.unwrap();
        let hub = Arc::new(EventHub::with_defaults());
        let supervisor = Arc::new(ProcessSupervisor::new(SupervisorConfig::with_terminate_timeout(
            Duration::from_millis(300),
        )));
        let scheduler = Arc::new(QueueScheduler::new(
            supervisor,
            Arc::clone(&hub),
            db,
            SchedulerConfig {
                poll_interval: Duration::from_millis(50),
                persist_delay: Duration::from_millis(10),
                history_limit: 10,
                blender_bin: blender_bin.to_string_lossy().into_owned(),
                initial_settings: QueueSettings::default(),
            },
        ));
        scheduler.load().await;

        let (shutdown, rx) = watch::channel(false);
        scheduler.spawn(&rx);
        Self {
            scheduler,
            hub,
            shutdown,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.scheduler.shutdown().await.unwrap();
    }

    async fn wait_for(&self, what: &str, pred: impl Fn(&Job) -> bool, job_id: &str) -> Job {
        for _ in 0..500 {
            if let Some(job) = self.scheduler.job(job_id).await
                && pred(&job)
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }
}

fn write_fake_blender(dir: &Path) -> PathBuf {
    let path = dir.join("blender");
    std::fs::write(&path, FAKE_BLENDER).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn parameters() -> RenderParameters {
    RenderParameters {
        blend_file: "/projects/shot_010.blend".to_string(),
        output_path: Some("/tmp/rendq_out_####".to_string()),
        scene: None,
        engine: Some("CYCLES".to_string()),
        format: Some("PNG".to_string()),
        frame_start: 1,
        frame_end: 3,
        threads: None,
        extra_args: Vec::new(),
    }
}

async fn session_events(
    rx: &mut broadcast::Receiver<QueueEvent>,
    job_id: &str,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("queue event")
            .expect("queue channel open");
        match event {
            QueueEvent::Session(message) if message.job_id == job_id => {
                let done = matches!(message.event, SessionEvent::Complete { .. });
                events.push(message.event);
                if done {
                    return events;
                }
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn renders_fake_blender_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let blender = write_fake_blender(dir.path());
    let daemon = Daemon::start(&dir.path().join("queue.db"), &blender).await;
    let mut rx = daemon.hub.subscribe();

    let job = daemon
        .scheduler
        .add_job(JobSpec::from_parameters(parameters()))
        .await
        .unwrap();
    assert_eq!(job.name, "shot_010");
    assert!(job.command.starts_with(&*blender.to_string_lossy()));

    daemon.scheduler.start_processing().await;
    let events = session_events(&mut rx, &job.id).await;

    let last_progress = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress { snapshot } => Some(snapshot.clone()),
            _ => None,
        })
        .last()
        .expect("progress events");
    assert_eq!(last_progress.current_frame, 3);
    assert!((last_progress.progress - 100.0).abs() < f64::EPSILON);
    assert!((last_progress.peak_memory - 1536.0).abs() < f64::EPSILON);
    assert_eq!(last_progress.total_samples, 128);
    assert_eq!(
        last_progress.last_output.as_deref(),
        Some("/tmp/rendq_out_0003.png")
    );

    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Log { stream: OutputStream::Stderr, line } if line.contains("unable to open font")
    )));
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Critical { .. })));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Complete {
            exit_code: Some(0),
            cancelled: false
        })
    );

    let job = daemon
        .wait_for("completion", |j| j.status == JobStatus::Completed, &job.id)
        .await;
    assert!(job.finished_at.is_some());
    assert!(daemon.hub.subscribe_session(&job.id).await.is_err());

    let mut history = Vec::new();
    for _ in 0..100 {
        history = daemon.scheduler.history(10, 0).await.unwrap();
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status(), Some(HistoryStatus::Completed));
    assert_eq!(history[0].total_frames, 3);
    assert_eq!(history[0].parameters(), Some(parameters()));

    daemon.stop().await;
}

#[tokio::test]
async fn cancelled_render_survives_restart_as_pending() {
    let dir = tempfile::TempDir::new().unwrap();
    let blender = write_fake_blender(dir.path());
    let db_path = dir.path().join("queue.db");

    let daemon = Daemon::start(&db_path, &blender).await;
    let slow = daemon
        .scheduler
        .add_job(JobSpec {
            name: Some("slow".to_string()),
            priority: Some(1),
            ..JobSpec::from_command("sh -c 'echo Fra:1; sleep 30'")
        })
        .await
        .unwrap();
    let follower = daemon
        .scheduler
        .add_job(JobSpec {
            dependencies: [slow.id.clone()].into(),
            ..JobSpec::from_command("true")
        })
        .await
        .unwrap();

    daemon.scheduler.start_processing().await;
    daemon
        .wait_for("dispatch", |j| j.status == JobStatus::Running, &slow.id)
        .await;
    let mut session = daemon.hub.subscribe_session(&slow.id).await.unwrap();

    assert!(daemon.scheduler.cancel_job(&slow.id).await.unwrap());
    assert_eq!(
        daemon.scheduler.job(&slow.id).await.unwrap().status,
        JobStatus::Pending
    );
    assert_eq!(
        daemon.scheduler.job(&follower.id).await.unwrap().status,
        JobStatus::Pending
    );

    // The session channel closes once the cancelled session has finished.
    let mut saw_complete = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(10), session.recv())
            .await
            .unwrap()
        {
            Ok(message) => {
                if let SessionEvent::Complete { cancelled, .. } = message.event {
                    assert!(cancelled);
                    saw_complete = true;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    assert!(saw_complete);

    daemon.stop().await;

    let restarted = Daemon::start(&db_path, &blender).await;
    let jobs = restarted.scheduler.jobs().await;
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
    assert!(jobs[1].dependencies.contains(&slow.id));
    assert!(jobs[0].held);
    assert!(!jobs[1].held);
    assert!(!restarted.scheduler.is_processing().await);
    restarted.stop().await;
}
