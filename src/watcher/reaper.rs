//! Exit-status harvesting for detached helper processes.
//!
//! Helpers launched for a session are not waited on by whoever spawned
//! them. Their pids are queued here and collected once per coordinator
//! cycle so they never linger as zombies.
//!
//! Collected statuses are remembered for the grace period so a spawning
//! client reaped before the watcher looked at it still reports how it
//! exited.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::models::session::ProcessExit;
use crate::watcher::process::{liveness, Liveness};

/// Result of a single non-blocking wait on a queued pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitResult {
    Exited(ProcessExit),
    StillRunning,
    Interrupted,
    NotChild,
    Failed,
}

/// Queue of pids whose exit status has not been collected yet.
#[derive(Debug)]
pub struct ProcessReaper {
    queue: BTreeMap<u32, Instant>,
    collected: BTreeMap<u32, (ProcessExit, Instant)>,
    grace: Duration,
}

impl ProcessReaper {
    /// Create an empty reaper. Pids that are not our children are dropped
    /// after `grace` even if they are still running.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            queue: BTreeMap::new(),
            collected: BTreeMap::new(),
            grace,
        }
    }

    /// Queue `pid`. Returns `false` for pid 0 or a pid already queued.
    pub fn enqueue(&mut self, pid: u32) -> bool {
        if pid == 0 || self.queue.contains_key(&pid) {
            return false;
        }
        self.queue.insert(pid, Instant::now());
        debug!(pid, "process queued for reaping");
        true
    }

    /// Number of queued pids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether `pid` is queued.
    #[must_use]
    pub fn contains(&self, pid: u32) -> bool {
        self.queue.contains_key(&pid)
    }

    /// Exit status collected for `pid` within the grace period.
    #[must_use]
    pub fn collected_exit(&self, pid: u32) -> Option<ProcessExit> {
        self.collected.get(&pid).map(|&(exit, _)| exit)
    }

    /// Collect every queued pid that has exited. Returns how many exit
    /// statuses were collected.
    pub fn reap(&mut self) -> usize {
        let grace = self.grace;
        self.collected
            .retain(|_, (_, collected_at)| collected_at.elapsed() < grace);
        if self.queue.is_empty() {
            return 0;
        }

        let mut reaped = 0;
        let mut collected = Vec::new();

        self.queue.retain(|&pid, queued_at| match try_wait(pid) {
            WaitResult::Exited(exit) => {
                if exit.is_success() {
                    info!(pid, %exit, "helper process reaped");
                } else {
                    warn!(pid, %exit, "helper process reaped");
                }
                reaped += 1;
                collected.push((pid, exit));
                false
            }
            WaitResult::StillRunning | WaitResult::Interrupted => true,
            WaitResult::NotChild => match liveness(pid) {
                Liveness::Running if queued_at.elapsed() < grace => true,
                Liveness::Running => {
                    warn!(pid, "process is not our child and outlived its grace period; dropped");
                    false
                }
                Liveness::Gone => {
                    debug!(pid, "process is not our child and has exited; dropped");
                    false
                }
                Liveness::Unknown => {
                    warn!(pid, "cannot probe queued process; dropped");
                    false
                }
            },
            WaitResult::Failed => false,
        });

        let now = Instant::now();
        for (pid, exit) in collected {
            self.collected.insert(pid, (exit, now));
        }
        reaped
    }
}

#[cfg(unix)]
fn try_wait(pid: u32) -> WaitResult {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    let Some(nix_pid) = crate::watcher::process::to_nix_pid(pid) else {
        return WaitResult::NotChild;
    };

    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => WaitResult::Exited(ProcessExit::Exited { code }),
        Ok(WaitStatus::Signaled(_, signal, _)) => WaitResult::Exited(ProcessExit::Signaled {
            signal: signal as i32,
        }),
        Ok(_) => WaitResult::StillRunning,
        Err(Errno::EINTR) => WaitResult::Interrupted,
        Err(Errno::ECHILD) => WaitResult::NotChild,
        Err(err) => {
            warn!(pid, %err, "waitpid failed; process dropped from reap queue");
            WaitResult::Failed
        }
    }
}

#[cfg(not(unix))]
fn try_wait(_pid: u32) -> WaitResult {
    WaitResult::NotChild
}
