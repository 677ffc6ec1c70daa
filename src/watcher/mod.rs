//! Client/session liveness watcher.
//!
//! [`Watcher::start`] launches a dedicated `session-watcher` thread running
//! its own tokio runtime. The thread's coordinator rebuilds a watch set
//! from the registry, waits on it in shards and reports orderly releases,
//! abandoned sessions and failed spawns back to the registry. Other
//! components talk to it through cloneable [`WatcherHandle`]s.

pub mod adaptive;
mod coordinator;
pub mod process;
pub mod reaper;
pub mod shard;
pub mod signal;
pub mod stats;
pub mod token;
pub mod watch_set;

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::registry::SessionRegistry;
use crate::{AppError, Result};

use self::adaptive::AdaptiveTimeout;
use self::coordinator::Coordinator;
use self::signal::UpdateSignal;
use self::stats::{StatsSnapshot, WatcherStats};

/// State shared between the coordinator thread and every handle.
pub(crate) struct Shared {
    pub(crate) signal: UpdateSignal,
    pub(crate) adaptive: AdaptiveTimeout,
    pub(crate) stats: Arc<WatcherStats>,
    pub(crate) cancel: CancellationToken,
    pub(crate) reap_tx: mpsc::UnboundedSender<u32>,
}

/// Cloneable, non-blocking access to a running watcher.
///
/// A default handle is detached: every call is a no-op and it reports not
/// ready.
#[derive(Clone, Default)]
pub struct WatcherHandle {
    shared: Option<Arc<Shared>>,
}

impl WatcherHandle {
    /// Request a rescan as soon as possible. Concurrent calls coalesce.
    pub fn update(&self) {
        if let Some(shared) = &self.shared {
            shared.adaptive.reset();
            shared.signal.raise();
        }
    }

    /// Queue `pid` for exit-status collection.
    pub fn add_process(&self, pid: u32) {
        if let Some(shared) = &self.shared {
            if shared.reap_tx.send(pid).is_err() {
                debug!(pid, "watcher stopped; process not queued");
            }
        }
    }

    /// Whether the coordinator loop is running.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.stats.is_running() && !shared.cancel.is_cancelled())
    }

    /// Whether every entry handed to the watcher is actually being watched.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.stats.is_reliable())
    }

    /// Current counters; all zero for a detached handle.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared
            .as_ref()
            .map(|shared| shared.stats.snapshot())
            .unwrap_or_default()
    }
}

impl Debug for WatcherHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("attached", &self.shared.is_some())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Owner of the watcher thread.
///
/// Dropping the watcher shuts it down.
pub struct Watcher {
    handle: WatcherHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Start watching `registry` on a dedicated thread.
    ///
    /// Returns once the coordinator's runtime is up.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotReady` if the configuration is invalid or the
    /// thread or its runtime cannot be created. Any partially started
    /// thread is joined before returning.
    pub fn start<R: SessionRegistry>(registry: Arc<R>, config: WatcherConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| AppError::NotReady(err.to_string()))?;

        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            signal: UpdateSignal::new(),
            adaptive: AdaptiveTimeout::new(config.poll_steps()),
            stats: Arc::new(WatcherStats::default()),
            cancel: CancellationToken::new(),
            reap_tx,
        });

        let worker_threads = config.worker_threads;
        let coordinator = Coordinator::new(registry, config, Arc::clone(&shared), reap_rx);
        let stats = Arc::clone(&shared.stats);
        // `start` may run inside a runtime, where tokio's blocking receive panics.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

        let thread = std::thread::Builder::new()
            .name("session-watcher".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(worker_threads)
                    .thread_name("session-watcher-worker")
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(format!("failed to build watcher runtime: {err}")));
                        return;
                    }
                };

                runtime.block_on(async move {
                    stats.set_running(true);
                    let _ = ready_tx.send(Ok(()));
                    coordinator.run().await;
                });
            })
            .map_err(|err| AppError::NotReady(format!("failed to spawn watcher thread: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(worker_threads, "session watcher started");
                Ok(Self {
                    handle: WatcherHandle {
                        shared: Some(shared),
                    },
                    thread: Mutex::new(Some(thread)),
                })
            }
            Ok(Err(msg)) => {
                let _ = thread.join();
                Err(AppError::NotReady(msg))
            }
            Err(_) => {
                let _ = thread.join();
                Err(AppError::NotReady(
                    "watcher thread exited during startup".into(),
                ))
            }
        }
    }

    /// A watcher that never runs. Every operation is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            handle: WatcherHandle::default(),
            thread: Mutex::new(None),
        }
    }

    /// A cloneable handle for other components.
    #[must_use]
    pub fn handle(&self) -> WatcherHandle {
        self.handle.clone()
    }

    /// See [`WatcherHandle::is_ready`].
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    /// See [`WatcherHandle::is_reliable`].
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.handle.is_reliable()
    }

    /// See [`WatcherHandle::update`].
    pub fn update(&self) {
        self.handle.update();
    }

    /// See [`WatcherHandle::add_process`].
    pub fn add_process(&self, pid: u32) {
        self.handle.add_process(pid);
    }

    /// See [`WatcherHandle::stats`].
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    /// Stop the coordinator and join its thread. Safe to call repeatedly.
    ///
    /// Blocks the calling thread until the coordinator has retired its
    /// subworkers; call it from a blocking context inside async code.
    pub fn shutdown(&self) {
        if let Some(shared) = &self.handle.shared {
            shared.cancel.cancel();
        }

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("session watcher thread panicked");
            } else {
                debug!("session watcher thread joined");
            }
        }
    }
}

impl Debug for Watcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if self.handle.shared.is_some() && self.handle.is_ready() {
            warn!("session watcher dropped without shutdown; stopping it now");
        }
        self.shutdown();
    }
}
