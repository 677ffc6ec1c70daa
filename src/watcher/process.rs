//! Process probes and the watcher-owned handles used for spawning clients.
//!
//! On Linux a child's exit is observed with `waitid(WNOWAIT)` so the exit
//! status stays collectable by the reaper. Processes that are not our
//! children (or platforms without `waitid`) fall back to a signal-0
//! liveness probe.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::models::session::ProcessExit;
use crate::watcher::stats::WatcherStats;
use crate::watcher::token::{WaitOutcome, Waitable};
use crate::{AppError, Result};

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The pid refers to an existing process (possibly a zombie).
    Running,
    /// No process with this pid exists.
    Gone,
    /// The probe itself failed.
    Unknown,
}

/// Check whether a process exists without affecting it.
#[cfg(unix)]
#[must_use]
pub fn liveness(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let Some(pid) = to_nix_pid(pid) else {
        return Liveness::Unknown;
    };

    match kill(pid, None::<Signal>) {
        // EPERM: the process exists but belongs to someone else.
        Ok(()) | Err(Errno::EPERM) => Liveness::Running,
        Err(Errno::ESRCH) => Liveness::Gone,
        Err(err) => {
            debug!(pid = pid.as_raw(), %err, "liveness probe failed");
            Liveness::Unknown
        }
    }
}

/// Check whether a process exists without affecting it.
#[cfg(not(unix))]
#[must_use]
pub fn liveness(_pid: u32) -> Liveness {
    Liveness::Unknown
}

/// Convert a pid into the form `nix` expects. Pid 0 and values beyond
/// `i32::MAX` would address process groups, so they are refused.
#[cfg(unix)]
pub(crate) fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(nix::unistd::Pid::from_raw(raw)),
        _ => None,
    }
}

/// What a non-consuming exit peek found.
#[derive(Debug)]
enum Peek {
    Running,
    Exited(ProcessExit),
    Unavailable,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peek_exit(pid: u32) -> Peek {
    use nix::errno::Errno;
    use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};

    let Some(nix_pid) = to_nix_pid(pid) else {
        return Peek::Unavailable;
    };

    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    match waitid(Id::Pid(nix_pid), flags) {
        Ok(WaitStatus::Exited(_, code)) => Peek::Exited(ProcessExit::Exited { code }),
        Ok(WaitStatus::Signaled(_, signal, _)) => Peek::Exited(ProcessExit::Signaled {
            signal: signal as i32,
        }),
        // Still alive, stopped, or interrupted: look again next poll.
        Ok(_) | Err(Errno::EINTR) => Peek::Running,
        Err(Errno::ECHILD) => Peek::Unavailable,
        Err(err) => {
            debug!(pid, %err, "waitid peek failed");
            Peek::Unavailable
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peek_exit(_pid: u32) -> Peek {
    Peek::Unavailable
}

/// Watcher-owned handle on a spawning client process.
///
/// Counted in [`WatcherStats`] while open; dropping it closes it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    poll: Duration,
    stats: Arc<WatcherStats>,
    collected: Option<ProcessExit>,
}

impl ProcessHandle {
    /// Open a handle on `pid`, probing it every `poll` while waited on.
    ///
    /// A process that is already gone still yields a handle; its wait
    /// resolves immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the process cannot be probed on this
    /// platform or the probe fails for a reason other than absence.
    pub fn open(pid: u32, poll: Duration, stats: Arc<WatcherStats>) -> Result<Self> {
        match liveness(pid) {
            Liveness::Running | Liveness::Gone => {
                stats.handle_opened();
                Ok(Self {
                    pid,
                    poll,
                    stats,
                    collected: None,
                })
            }
            Liveness::Unknown => Err(AppError::Process(format!(
                "cannot open a wait handle on pid {pid}"
            ))),
        }
    }

    /// Handle on a process whose exit status was already collected. Its
    /// wait resolves immediately with `exit`.
    #[must_use]
    pub fn collected(pid: u32, exit: ProcessExit, stats: Arc<WatcherStats>) -> Self {
        stats.handle_opened();
        Self {
            pid,
            poll: Duration::ZERO,
            stats,
            collected: Some(exit),
        }
    }

    /// The watched pid.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check.
    #[must_use]
    pub fn try_exit(&self) -> Option<ProcessExit> {
        if self.collected.is_some() {
            return self.collected;
        }
        match peek_exit(self.pid) {
            Peek::Exited(exit) => return Some(exit),
            Peek::Running => return None,
            Peek::Unavailable => {}
        }

        match liveness(self.pid) {
            Liveness::Running => None,
            Liveness::Gone => Some(ProcessExit::Unknown),
            Liveness::Unknown => {
                if self.stats.mark_unreliable() {
                    warn!(pid = self.pid, "lost track of spawning process; watcher is unreliable");
                }
                None
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stats.handle_closed();
    }
}

impl Waitable for ProcessHandle {
    fn wait(&self) -> BoxFuture<'_, WaitOutcome> {
        Box::pin(async move {
            loop {
                if let Some(exit) = self.try_exit() {
                    return WaitOutcome::ProcessExited(exit);
                }
                tokio::time::sleep(self.poll).await;
            }
        })
    }
}
