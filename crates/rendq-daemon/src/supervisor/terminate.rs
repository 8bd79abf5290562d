//! Platform-specific process tree termination.
//!
//! The render engine may start helper processes of its own, so stopping a
//! render means stopping the whole tree. [`Terminator`] hides how that is done:
//!
//! - Unix: the engine is spawned as a process-group leader; the group gets
//!   SIGTERM, then SIGKILL once the grace period runs out.
//! - Windows: `taskkill /T /F` kills the tree in one step.
//!
//! Callers only ever use [`PlatformTerminator`].

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited after the polite request.
    Graceful,
    /// The process had to be killed.
    Forced,
    /// No exit was observed within the backend's time limits.
    Unconfirmed,
}

/// Stops a process and every process it spawned.
pub trait Terminator: Send + Sync + 'static {
    /// Terminate the tree rooted at `pid`.
    ///
    /// `exited` flips to `true` once the supervisor has reaped the process.
    /// Resolves once that is observed or the backend's timeouts elapse.
    fn terminate(
        &self,
        pid: u32,
        exited: watch::Receiver<bool>,
    ) -> impl Future<Output = Termination> + Send;
}

/// Wait until `exited` reports `true`, at most `timeout`.
pub(crate) async fn wait_exited(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    // A dropped sender means the monitor task is gone, which only happens after exit.
    tokio::time::timeout(timeout, exited.wait_for(|done| *done))
        .await
        .is_ok()
}

#[cfg(unix)]
pub use unix::SignalEscalation as PlatformTerminator;
#[cfg(windows)]
pub use windows::TreeKill as PlatformTerminator;

#[cfg(unix)]
mod unix {
    use std::time::Duration;

    use tokio::sync::watch;
    use tracing::{debug, warn};

    use super::{Termination, Terminator, wait_exited};

    /// SIGTERM to the process group, then SIGKILL after a grace period.
    #[derive(Debug, Clone)]
    pub struct SignalEscalation {
        grace: Duration,
        confirm: Duration,
    }

    impl SignalEscalation {
        /// `grace` is the wait between SIGTERM and SIGKILL, `confirm` the
        /// wait for the exit to be observed after SIGKILL.
        pub const fn new(grace: Duration, confirm: Duration) -> Self {
            Self { grace, confirm }
        }
    }

    impl Terminator for SignalEscalation {
        async fn terminate(&self, pid: u32, mut exited: watch::Receiver<bool>) -> Termination {
            if let Err(e) = signal_group(pid, libc::SIGTERM) {
                warn!(pid, error = %e, "Failed to send SIGTERM to process group");
            }
            if wait_exited(&mut exited, self.grace).await {
                return Termination::Graceful;
            }

            warn!(pid, grace_ms = self.grace.as_millis(), "Process group still alive, sending SIGKILL");
            if let Err(e) = signal_group(pid, libc::SIGKILL) {
                warn!(pid, error = %e, "Failed to send SIGKILL to process group");
            }
            if wait_exited(&mut exited, self.confirm).await {
                Termination::Forced
            } else {
                Termination::Unconfirmed
            }
        }
    }

    /// Signal every process in the group led by `pid`.
    ///
    /// A group that no longer exists counts as success.
    fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = pid as libc::pid_t;
        // SAFETY: kill(2) takes plain integers and touches no memory. A negative
        // pid addresses the process group we created at spawn time.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(-pgid, signal) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, signal, "Process group already gone");
            return Ok(());
        }
        Err(err)
    }
}

#[cfg(windows)]
mod windows {
    use std::process::Stdio;
    use std::time::Duration;

    use tokio::process::Command;
    use tokio::sync::watch;
    use tracing::warn;

    use super::{Termination, Terminator, wait_exited};

    /// Recursive tree kill via `taskkill /T /F`.
    #[derive(Debug, Clone)]
    pub struct TreeKill {
        grace: Duration,
        confirm: Duration,
    }

    impl TreeKill {
        pub const fn new(grace: Duration, confirm: Duration) -> Self {
            Self { grace, confirm }
        }
    }

    impl Terminator for TreeKill {
        async fn terminate(&self, pid: u32, mut exited: watch::Receiver<bool>) -> Termination {
            let status = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(s) if s.success() => {}
                Ok(s) => warn!(pid, status = ?s.code(), "taskkill reported failure"),
                Err(e) => warn!(pid, error = %e, "Failed to run taskkill"),
            }

            if wait_exited(&mut exited, self.grace + self.confirm).await {
                Termination::Forced
            } else {
                Termination::Unconfirmed
            }
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::process::Stdio;

    use tokio::process::Command;

    use super::*;

    /// Spawn `script` under `sh` as a group leader and report its exit on a watch channel.
    fn spawn_group(script: &str) -> (u32, watch::Receiver<bool>) {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = child.wait().await;
            tx.send_replace(true);
        });
        (pid, rx)
    }

    #[tokio::test]
    async fn sigterm_stops_cooperative_process() {
        let (pid, exited) = spawn_group("sleep 30");
        let terminator =
            PlatformTerminator::new(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(terminator.terminate(pid, exited).await, Termination::Graceful);
    }

    #[tokio::test]
    async fn escalates_when_sigterm_is_ignored() {
        let (pid, exited) = spawn_group("trap '' TERM; while true; do sleep 1; done");
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let terminator =
            PlatformTerminator::new(Duration::from_millis(300), Duration::from_secs(3));
        assert_eq!(terminator.terminate(pid, exited).await, Termination::Forced);
    }

    #[tokio::test]
    async fn already_exited_group_is_not_an_error() {
        let (pid, mut exited) = spawn_group("exit 0");
        assert!(wait_exited(&mut exited, Duration::from_secs(5)).await);
        let terminator =
            PlatformTerminator::new(Duration::from_millis(100), Duration::from_millis(100));
        assert_eq!(terminator.terminate(pid, exited).await, Termination::Graceful);
    }
}
