//! Counters published by the watcher for status queries and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Live counters shared between the coordinator thread and callers.
#[derive(Debug, Default)]
pub struct WatcherStats {
    running: AtomicBool,
    unreliable: AtomicBool,
    scans: AtomicU64,
    cycles: AtomicU64,
    shards: AtomicUsize,
    subworkers: AtomicUsize,
    watched_sessions: AtomicUsize,
    watched_spawning: AtomicUsize,
    queued_processes: AtomicUsize,
    reaped_total: AtomicU64,
    open_handles: AtomicUsize,
    released_total: AtomicU64,
    abandoned_total: AtomicU64,
    spawn_exits_total: AtomicU64,
}

/// Copy of [`WatcherStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StatsSnapshot {
    /// Coordinator loop is running.
    pub running: bool,
    /// Some entry could not be watched.
    pub unreliable: bool,
    /// Completed registry rescans.
    pub scans: u64,
    /// Completed wait cycles.
    pub cycles: u64,
    /// Shards in the current watch set.
    pub shards: usize,
    /// Subworkers alive (excluding the coordinator's own shard).
    pub subworkers: usize,
    /// Session tokens in the current watch set.
    pub watched_sessions: usize,
    /// Spawning processes in the current watch set.
    pub watched_spawning: usize,
    /// Pids waiting in the reap queue.
    pub queued_processes: usize,
    /// Processes whose exit status was collected.
    pub reaped_total: u64,
    /// Watcher-owned process handles currently open.
    pub open_handles: usize,
    /// Orderly releases reported to the registry.
    pub released_total: u64,
    /// Abandonments reported to the registry.
    pub abandoned_total: u64,
    /// Spawn results reported to the registry.
    pub spawn_exits_total: u64,
}

impl WatcherStats {
    /// Take a snapshot of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            running: self.running.load(Ordering::SeqCst),
            unreliable: self.unreliable.load(Ordering::SeqCst),
            scans: self.scans.load(Ordering::SeqCst),
            cycles: self.cycles.load(Ordering::SeqCst),
            shards: self.shards.load(Ordering::SeqCst),
            subworkers: self.subworkers.load(Ordering::SeqCst),
            watched_sessions: self.watched_sessions.load(Ordering::SeqCst),
            watched_spawning: self.watched_spawning.load(Ordering::SeqCst),
            queued_processes: self.queued_processes.load(Ordering::SeqCst),
            reaped_total: self.reaped_total.load(Ordering::SeqCst),
            open_handles: self.open_handles.load(Ordering::SeqCst),
            released_total: self.released_total.load(Ordering::SeqCst),
            abandoned_total: self.abandoned_total.load(Ordering::SeqCst),
            spawn_exits_total: self.spawn_exits_total.load(Ordering::SeqCst),
        }
    }

    /// Whether every entry the watcher was asked to watch is being watched.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        !self.unreliable.load(Ordering::SeqCst)
    }

    /// Whether the coordinator loop is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Returns `true` when this call flipped the flag.
    pub(crate) fn mark_unreliable(&self) -> bool {
        !self.unreliable.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn record_scan(&self, sessions: usize, spawning: usize, shards: usize) {
        self.watched_sessions.store(sessions, Ordering::SeqCst);
        self.watched_spawning.store(spawning, Ordering::SeqCst);
        self.shards.store(shards, Ordering::SeqCst);
        self.scans.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn set_subworkers(&self, count: usize) {
        self.subworkers.store(count, Ordering::SeqCst);
    }

    pub(crate) fn record_reap(&self, reaped: usize, still_queued: usize) {
        self.reaped_total
            .fetch_add(u64::try_from(reaped).unwrap_or(u64::MAX), Ordering::SeqCst);
        self.queued_processes.store(still_queued, Ordering::SeqCst);
    }

    pub(crate) fn handle_opened(&self) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn handle_closed(&self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_released(&self) {
        self.released_total.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned_total.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_spawn_exit(&self) {
        self.spawn_exits_total.fetch_add(1, Ordering::SeqCst);
    }
}
