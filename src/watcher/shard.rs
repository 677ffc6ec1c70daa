//! Shard waits and the subworker pool that runs them.
//!
//! Each cycle the coordinator waits on shard 0 itself and hands every other
//! shard to a long-lived subworker task through its task channel. A shard
//! that wakes for any reason other than its timeout cancels the cycle's
//! wake token so the remaining shards return promptly and the next rescan
//! sees every shard at once.

use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::watcher::signal::UpdateSignal;
use crate::watcher::stats::WatcherStats;
use crate::watcher::token::WaitOutcome;
use crate::watcher::watch_set::{WatchEntry, WatchSet};

/// What one shard observed during a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardReport {
    /// Shard index.
    pub shard: usize,
    /// Slot 0 of shard 0 (the update signal) fired.
    pub update_requested: bool,
    /// Signaled slots with their reasons.
    pub signaled: Vec<(usize, WaitOutcome)>,
    /// The wait ran out its timeout.
    pub timed_out: bool,
}

impl ShardReport {
    fn new(shard: usize) -> Self {
        Self {
            shard,
            ..Self::default()
        }
    }

    /// Whether this shard woke for a reason other than its timeout or
    /// another shard's wake.
    #[must_use]
    pub fn woke_cycle(&self) -> bool {
        self.update_requested || !self.signaled.is_empty()
    }
}

/// Wait on one shard until an entry is signaled, the update signal is
/// raised past `update.1`, the cycle's `wake` token is cancelled, or
/// `timeout` elapses.
///
/// Entries occupy slots starting at [`WatchSet::first_slot`]. Every entry
/// that is already signaled when the first one fires is reported in the
/// same pass.
pub async fn wait_shard(
    shard: usize,
    entries: &[WatchEntry],
    update: Option<(&UpdateSignal, u64)>,
    timeout: Duration,
    wake: &CancellationToken,
) -> ShardReport {
    let first_slot = WatchSet::first_slot(shard);
    let mut pending: FuturesUnordered<_> = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let slot = index + first_slot;
            entry.waitable().wait().map(move |outcome| (slot, outcome))
        })
        .collect();

    let update_raised = async {
        match update {
            Some((signal, seen)) => signal.raised_since(seen).await,
            None => std::future::pending::<()>().await,
        }
    };

    let mut report = ShardReport::new(shard);

    tokio::select! {
        biased;
        Some((slot, outcome)) = pending.next(), if !pending.is_empty() => {
            report.signaled.push((slot, outcome));
            while let Some(Some((slot, outcome))) = pending.next().now_or_never() {
                report.signaled.push((slot, outcome));
            }
        }
        () = update_raised => {
            report.update_requested = true;
        }
        () = wake.cancelled() => {}
        () = tokio::time::sleep(timeout) => {
            report.timed_out = true;
        }
    }

    if report.woke_cycle() {
        wake.cancel();
    }

    report
}

/// A unit of work for one subworker: wait on `entries` for this cycle.
struct ShardTask {
    shard: usize,
    entries: Vec<WatchEntry>,
    timeout: Duration,
    wake: CancellationToken,
    reply: oneshot::Sender<ShardReport>,
}

struct Subworker {
    tasks: mpsc::Sender<ShardTask>,
    join: JoinHandle<()>,
}

/// Long-lived subworkers for shards 1 and up.
///
/// The pool only grows; surplus subworkers wait on an empty shard until
/// shutdown.
pub(crate) struct SubworkerPool {
    workers: Vec<Subworker>,
    cancel: CancellationToken,
    stats: std::sync::Arc<WatcherStats>,
}

impl SubworkerPool {
    pub(crate) fn new(cancel: CancellationToken, stats: std::sync::Arc<WatcherStats>) -> Self {
        Self {
            workers: Vec::new(),
            cancel,
            stats,
        }
    }

    /// Make sure every shard beyond shard 0 has a subworker.
    pub(crate) fn ensure(&mut self, shard_count: usize) {
        let wanted = shard_count.saturating_sub(1);
        while self.workers.len() < wanted {
            let shard = self.workers.len() + 1;
            let (tasks, rx) = mpsc::channel(1);
            let join = tokio::spawn(
                run_subworker(rx, self.cancel.clone())
                    .instrument(info_span!("subworker", shard)),
            );
            debug!(shard, "subworker started");
            self.workers.push(Subworker { tasks, join });
        }
        self.stats.set_subworkers(self.workers.len());
    }

    /// Hand every subworker its shard for this cycle and return the reply
    /// receivers. Subworkers past the last shard get an empty shard.
    pub(crate) async fn dispatch(
        &self,
        set: &WatchSet,
        timeout: Duration,
        wake: &CancellationToken,
    ) -> Vec<oneshot::Receiver<ShardReport>> {
        let mut replies = Vec::with_capacity(self.workers.len());

        for (index, worker) in self.workers.iter().enumerate() {
            let shard = index + 1;
            let (reply, rx) = oneshot::channel();
            let task = ShardTask {
                shard,
                entries: set.shard(shard).to_vec(),
                timeout,
                wake: wake.clone(),
                reply,
            };

            if worker.tasks.send(task).await.is_err() {
                warn!(shard, "subworker is gone; shard skipped this cycle");
                continue;
            }
            replies.push(rx);
        }

        replies
    }

    /// Stop every subworker, waiting at most `timeout` for each.
    pub(crate) async fn shutdown(&mut self, timeout: Duration) {
        self.cancel.cancel();

        for (index, worker) in self.workers.drain(..).enumerate() {
            let Subworker { tasks, mut join } = worker;
            drop(tasks);

            match tokio::time::timeout(timeout, &mut join).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(shard = index + 1, %err, "subworker task failed"),
                Err(_) => {
                    warn!(shard = index + 1, "subworker did not stop in time; aborting");
                    join.abort();
                }
            }
        }

        self.stats.set_subworkers(0);
    }
}

async fn run_subworker(mut tasks: mpsc::Receiver<ShardTask>, cancel: CancellationToken) {
    loop {
        let task = tokio::select! {
            () = cancel.cancelled() => break,
            task = tasks.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let report = wait_shard(task.shard, &task.entries, None, task.timeout, &task.wake).await;
        // The coordinator stops listening only when it is shutting down.
        let _ = task.reply.send(report);
    }

    debug!("subworker retired");
}
