//! Global configuration parsing and validation.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Tuning knobs for the session watcher.
///
/// Every field has a default so the whole `[watcher]` table may be omitted.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatcherConfig {
    /// Maximum number of watched entries per shard. Shard 0 carries the
    /// update signal in addition to this many entries.
    #[serde(default = "default_shard_capacity")]
    pub shard_capacity: usize,
    /// Wait durations in milliseconds, slowest first. An `update()` jumps to
    /// the last (fastest) entry; idle cycles step back towards the first.
    #[serde(default = "default_poll_steps_ms")]
    pub poll_steps_ms: Vec<u64>,
    /// Fixed wait used while a spawned client's pid is not yet known.
    #[serde(default = "default_spawn_race_poll_ms")]
    pub spawn_race_poll_ms: u64,
    /// Interval between exit probes of a spawning helper process.
    #[serde(default = "default_process_poll_ms")]
    pub process_poll_ms: u64,
    /// How long a queued pid that is not our child may linger in the reap
    /// queue while it keeps running.
    #[serde(default = "default_reap_grace_seconds")]
    pub reap_grace_seconds: u64,
    /// Upper bound for joining subworkers during shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Runtime worker threads backing the subworker pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_shard_capacity() -> usize {
    63
}

fn default_poll_steps_ms() -> Vec<u64> {
    vec![500, 200, 100, 50, 20, 5]
}

fn default_spawn_race_poll_ms() -> u64 {
    100
}

fn default_process_poll_ms() -> u64 {
    50
}

fn default_reap_grace_seconds() -> u64 {
    30
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

fn default_worker_threads() -> usize {
    2
}

fn default_ipc_name() -> String {
    "session-watcher".into()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            shard_capacity: default_shard_capacity(),
            poll_steps_ms: default_poll_steps_ms(),
            spawn_race_poll_ms: default_spawn_race_poll_ms(),
            process_poll_ms: default_process_poll_ms(),
            reap_grace_seconds: default_reap_grace_seconds(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl WatcherConfig {
    /// Poll table as durations, slowest first.
    #[must_use]
    pub fn poll_steps(&self) -> Vec<Duration> {
        self.poll_steps_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    /// Wait used while a spawning pid is unresolved.
    #[must_use]
    pub fn spawn_race_poll(&self) -> Duration {
        Duration::from_millis(self.spawn_race_poll_ms)
    }

    /// Probe interval for spawning helper processes.
    #[must_use]
    pub fn process_poll(&self) -> Duration {
        Duration::from_millis(self.process_poll_ms)
    }

    /// Grace period for foreign pids in the reap queue.
    #[must_use]
    pub fn reap_grace(&self) -> Duration {
        Duration::from_secs(self.reap_grace_seconds)
    }

    /// Bound on subworker joins at shutdown.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Check invariants the watcher relies on.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.shard_capacity == 0 {
            return Err(AppError::Config(
                "watcher.shard_capacity must be greater than zero".into(),
            ));
        }

        if self.poll_steps_ms.is_empty() {
            return Err(AppError::Config(
                "watcher.poll_steps_ms must not be empty".into(),
            ));
        }

        if self.poll_steps_ms.contains(&0) {
            return Err(AppError::Config(
                "watcher.poll_steps_ms entries must be greater than zero".into(),
            ));
        }

        if self.poll_steps_ms.windows(2).any(|pair| pair[0] <= pair[1]) {
            return Err(AppError::Config(
                "watcher.poll_steps_ms must be strictly decreasing (slowest first)".into(),
            ));
        }

        if self.spawn_race_poll_ms == 0 || self.process_poll_ms == 0 {
            return Err(AppError::Config(
                "watcher poll intervals must be greater than zero".into(),
            ));
        }

        if self.worker_threads == 0 {
            return Err(AppError::Config(
                "watcher.worker_threads must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Helper process launched for `launch` requests.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LauncherConfig {
    /// Executable to spawn.
    pub command: String,
    /// Fixed arguments. The machine id travels in the environment.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Machines registered at startup.
    #[serde(default)]
    pub machines: Vec<String>,
    /// Session watcher tuning.
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Helper launcher; `launch` requests fail when absent.
    #[serde(default)]
    pub launcher: Option<LauncherConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for machine in &self.machines {
            if machine.trim().is_empty() {
                return Err(AppError::Config("machine names must not be empty".into()));
            }
            if !seen.insert(machine.as_str()) {
                return Err(AppError::Config(format!(
                    "machine '{machine}' is listed more than once"
                )));
            }
        }

        if let Some(ref launcher) = self.launcher {
            if launcher.command.trim().is_empty() {
                return Err(AppError::Config(
                    "launcher.command must not be empty".into(),
                ));
            }
        }

        self.watcher.validate()
    }
}
