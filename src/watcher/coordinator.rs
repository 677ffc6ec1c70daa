//! The watcher's main loop.
//!
//! The coordinator alternates between rescanning the registry and waiting
//! on the resulting watch set. Shard 0 (update signal plus the first
//! entries) is waited on by the coordinator itself; the remaining shards go
//! to the subworker pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatcherConfig;
use crate::models::session::{ResourceId, SessionSignal};
use crate::registry::{RegistryView, SessionRegistry};
use crate::watcher::process::ProcessHandle;
use crate::watcher::reaper::ProcessReaper;
use crate::watcher::shard::{wait_shard, ShardReport, SubworkerPool};
use crate::watcher::token::WaitOutcome;
use crate::watcher::watch_set::{WatchEntry, WatchSet};
use crate::watcher::Shared;

pub(crate) struct Coordinator<R: SessionRegistry> {
    registry: Arc<R>,
    config: WatcherConfig,
    shared: Arc<Shared>,
    pool: SubworkerPool,
    reaper: ProcessReaper,
    reap_rx: mpsc::UnboundedReceiver<u32>,
    reported_tokens: HashSet<u64>,
    reported_spawns: HashSet<(ResourceId, u32)>,
}

impl<R: SessionRegistry> Coordinator<R> {
    pub(crate) fn new(
        registry: Arc<R>,
        config: WatcherConfig,
        shared: Arc<Shared>,
        reap_rx: mpsc::UnboundedReceiver<u32>,
    ) -> Self {
        let pool = SubworkerPool::new(shared.cancel.child_token(), Arc::clone(&shared.stats));
        let reaper = ProcessReaper::new(config.reap_grace());
        Self {
            registry,
            config,
            shared,
            pool,
            reaper,
            reap_rx,
            reported_tokens: HashSet::new(),
            reported_spawns: HashSet::new(),
        }
    }

    /// Run until cancelled or the registry stops serving.
    pub(crate) async fn run(mut self) {
        let cancel = self.shared.cancel.clone();
        info!(
            shard_capacity = self.config.shard_capacity,
            "session watcher running"
        );

        while !cancel.is_cancelled() && self.registry.is_valid() {
            // Read the generation first so an update racing the rescan
            // still wakes the next wait.
            let seen = self.shared.signal.generation();
            let set = self.rescan();

            let timeout = if set.has_pid_race() {
                self.config.spawn_race_poll()
            } else {
                self.shared.adaptive.current()
            };

            self.pool.ensure(set.shard_count());
            let reports = self.wait_all(&set, seen, timeout, &cancel).await;
            self.shared.stats.record_cycle();

            let update_requested = reports.iter().any(|report| report.update_requested);
            let signaled = reports.iter().any(|report| !report.signaled.is_empty());
            if signaled {
                self.shared.adaptive.reset();
            } else if !update_requested {
                self.shared.adaptive.back_off();
            }

            self.classify(&set, &reports);
            drop(set);
            self.reap();
        }

        if !cancel.is_cancelled() {
            info!("registry is no longer valid; session watcher stopping");
        }
        self.teardown().await;
    }

    /// Rebuild the watch set from one registry view.
    fn rescan(&mut self) -> WatchSet {
        let (sessions, spawning) = {
            let view = self.registry.read();
            (
                view.enumerate_open_sessions(),
                view.enumerate_spawning_sessions(),
            )
        };

        let present_tokens: HashSet<u64> =
            sessions.iter().map(|session| session.token.id()).collect();
        self.reported_tokens.retain(|id| present_tokens.contains(id));

        let present_spawns: HashSet<(ResourceId, u32)> = spawning
            .iter()
            .filter_map(|spawn| spawn.pid.map(|pid| (spawn.resource.clone(), pid)))
            .collect();
        self.reported_spawns.retain(|key| present_spawns.contains(key));

        let mut entries = Vec::with_capacity(sessions.len() + spawning.len());
        for session in sessions {
            if self.reported_tokens.contains(&session.token.id()) {
                continue;
            }
            entries.push(WatchEntry::Session {
                resource: session.resource,
                token: session.token,
            });
        }

        let mut pid_race = false;
        for spawn in spawning {
            let Some(pid) = spawn.pid else {
                debug!(resource = %spawn.resource, "spawning pid not known yet");
                pid_race = true;
                continue;
            };
            if self.reported_spawns.contains(&(spawn.resource.clone(), pid)) {
                continue;
            }

            let opened = match self.reaper.collected_exit(pid) {
                Some(exit) => Ok(ProcessHandle::collected(
                    pid,
                    exit,
                    Arc::clone(&self.shared.stats),
                )),
                None => ProcessHandle::open(
                    pid,
                    self.config.process_poll(),
                    Arc::clone(&self.shared.stats),
                ),
            };
            match opened {
                Ok(handle) => entries.push(WatchEntry::Spawning {
                    resource: spawn.resource,
                    handle: Arc::new(handle),
                }),
                Err(err) => {
                    if self.shared.stats.mark_unreliable() {
                        warn!(resource = %spawn.resource, pid, %err, "cannot watch spawning process; watcher is unreliable");
                    } else {
                        debug!(resource = %spawn.resource, pid, %err, "cannot watch spawning process");
                    }
                }
            }
        }

        let set = WatchSet::partition(entries, self.config.shard_capacity).with_pid_race(pid_race);
        self.shared.stats.record_scan(
            set.session_count(),
            set.spawning_count(),
            set.shard_count(),
        );
        debug!(
            entries = set.len(),
            shards = set.shard_count(),
            pid_race,
            "watch set rebuilt"
        );
        set
    }

    /// Wait on every shard for one cycle and collect their reports.
    async fn wait_all(
        &self,
        set: &WatchSet,
        seen: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Vec<ShardReport> {
        let wake = cancel.child_token();
        let replies = self.pool.dispatch(set, timeout, &wake).await;

        let (own, others) = tokio::join!(
            wait_shard(
                0,
                set.shard(0),
                Some((&self.shared.signal, seen)),
                timeout,
                &wake,
            ),
            join_all(replies),
        );

        let mut reports = Vec::with_capacity(others.len() + 1);
        reports.push(own);
        // A dropped reply means the subworker was torn down mid-cycle.
        reports.extend(others.into_iter().filter_map(std::result::Result::ok));
        reports
    }

    /// Report every signaled entry to the registry, each at most once.
    fn classify(&mut self, set: &WatchSet, reports: &[ShardReport]) {
        for report in reports {
            for &(slot, outcome) in &report.signaled {
                let Some(entry) = set.entry_at(report.shard, slot) else {
                    continue;
                };

                match entry {
                    WatchEntry::Session { resource, token } => {
                        let Some(signal) = outcome.session_signal() else {
                            continue;
                        };
                        if !self.reported_tokens.insert(token.id()) {
                            continue;
                        }

                        match signal {
                            SessionSignal::OrderlyRelease => {
                                info!(%resource, token_id = token.id(), "session released");
                                self.shared.stats.record_released();
                            }
                            SessionSignal::Abandoned => {
                                warn!(%resource, token_id = token.id(), "session abandoned by its client");
                                self.shared.stats.record_abandoned();
                            }
                        }
                        self.registry.notify_session_token_signaled(resource, signal);
                    }
                    WatchEntry::Spawning { resource, handle } => {
                        let WaitOutcome::ProcessExited(exit) = outcome else {
                            continue;
                        };
                        if !self
                            .reported_spawns
                            .insert((resource.clone(), handle.pid()))
                        {
                            continue;
                        }

                        warn!(%resource, pid = handle.pid(), %exit, "spawning process exited before locking its session");
                        self.shared.stats.record_spawn_exit();
                        self.registry.notify_spawn_result(resource, exit);
                    }
                }
            }
        }
    }

    /// Drain newly added pids and collect any that have exited.
    fn reap(&mut self) {
        while let Ok(pid) = self.reap_rx.try_recv() {
            self.reaper.enqueue(pid);
        }
        let reaped = self.reaper.reap();
        self.shared.stats.record_reap(reaped, self.reaper.len());
    }

    async fn teardown(mut self) {
        self.pool.shutdown(self.config.shutdown_timeout()).await;
        self.reap();
        self.shared.stats.set_running(false);
        info!(
            still_queued = self.reaper.len(),
            "session watcher stopped"
        );
    }
}
