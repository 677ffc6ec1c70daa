//! Helper process launcher.
//!
//! Launches the configured client for a machine and hands its pid to the
//! watcher. The launched client learns which machine to lock from
//! `SESSION_WATCHER_MACHINE` and where the daemon listens from
//! `SESSION_WATCHER_IPC`. Stdin is null, so a client must not wait on it;
//! `session-watch-ctl open` reads both variables and holds its session until
//! it is sent SIGTERM or SIGINT.
//!
//! The child is detached: it is never waited on here. The watcher's reaper
//! collects its exit status.

use std::process::{Command, Stdio};

use tracing::{info, info_span, warn};

use crate::config::LauncherConfig;
use crate::models::session::ResourceId;
use crate::registry::machine::MachineRegistry;
use crate::watcher::WatcherHandle;
use crate::{AppError, Result};

/// Environment variable carrying the machine id.
pub const MACHINE_ENV: &str = "SESSION_WATCHER_MACHINE";

/// Environment variable carrying the daemon's IPC name.
pub const IPC_ENV: &str = "SESSION_WATCHER_IPC";

/// Launch a client for `machine` and watch it while it spawns.
///
/// Returns the launched pid.
///
/// # Errors
///
/// Returns the registry's error if the machine cannot enter the spawning
/// state, or `AppError::Process` if the process fails to start (the
/// spawning state is cancelled in that case).
pub fn launch_session(
    machine: &ResourceId,
    config: &LauncherConfig,
    ipc_name: &str,
    registry: &MachineRegistry,
    watcher: &WatcherHandle,
) -> Result<u32> {
    let span = info_span!("launch_session", machine = %machine);
    let _guard = span.enter();

    registry.begin_spawn(machine)?;

    let spawned = Command::new(&config.command)
        .args(&config.args)
        .env(MACHINE_ENV, machine.as_str())
        .env(IPC_ENV, ipc_name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn();

    let child = match spawned {
        Ok(child) => child,
        Err(err) => {
            if let Err(cancel_err) = registry.cancel_spawn(machine) {
                warn!(%cancel_err, "failed to cancel spawn after launch failure");
            }
            return Err(AppError::Process(format!(
                "failed to launch '{}': {err}",
                config.command
            )));
        }
    };

    let pid = child.id();
    // Dropping `Child` neither kills nor waits; the reaper owns the pid now.
    drop(child);

    watcher.add_process(pid);
    registry.set_spawn_pid(machine, pid)?;
    watcher.update();

    info!(pid, command = config.command, "client process launched");
    Ok(pid)
}
