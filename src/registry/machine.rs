//! In-memory registry of machines and the sessions that lock them.
//!
//! Every committed mutation emits a [`RegistryEvent`] and pokes the
//! attached watcher after the registry lock has been released.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::models::machine::{LockState, MachineSummary, RegistryEvent};
use crate::models::session::{ProcessExit, ResourceId, SessionSignal};
use crate::registry::{OpenSession, RegistryView, SessionRegistry, SpawningSession};
use crate::watcher::token::{ClientLock, SessionToken, TokenState};
use crate::watcher::WatcherHandle;
use crate::{AppError, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct SessionRecord {
    session_id: String,
    token: SessionToken,
    client_pid: Option<u32>,
}

#[derive(Debug)]
enum MachineState {
    Unlocked,
    Spawning { pid: Option<u32> },
    Locked(SessionRecord),
}

#[derive(Debug)]
struct MachineEntry {
    state: MachineState,
    since: DateTime<Utc>,
    last_session_crashed: bool,
    last_spawn_failure: Option<ProcessExit>,
}

impl MachineEntry {
    fn new() -> Self {
        Self {
            state: MachineState::Unlocked,
            since: Utc::now(),
            last_session_crashed: false,
            last_spawn_failure: None,
        }
    }

    fn transition(&mut self, state: MachineState) {
        self.state = state;
        self.since = Utc::now();
    }

    fn summary(&self, id: &ResourceId) -> MachineSummary {
        let (state, session_id, pid) = match &self.state {
            MachineState::Unlocked => (LockState::Unlocked, None, None),
            MachineState::Spawning { pid } => (LockState::Spawning, None, *pid),
            MachineState::Locked(record) => (
                LockState::Locked,
                Some(record.session_id.clone()),
                record.client_pid,
            ),
        };
        MachineSummary {
            id: id.clone(),
            state,
            session_id,
            pid,
            since: self.since,
            last_session_crashed: self.last_session_crashed,
            last_spawn_failure: self.last_spawn_failure,
        }
    }
}

/// A successfully opened session: its identifier and the client's lock.
#[derive(Debug)]
pub struct OpenedSession {
    /// Session identifier (UUID v4).
    pub session_id: String,
    /// The lock the client holds for the session's lifetime.
    pub lock: ClientLock,
}

/// Machine registry backing the daemon.
pub struct MachineRegistry {
    machines: RwLock<BTreeMap<ResourceId, MachineEntry>>,
    events: broadcast::Sender<RegistryEvent>,
    watcher: RwLock<Option<WatcherHandle>>,
    tearing_down: AtomicBool,
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineRegistry {
    /// Create an empty registry with no watcher attached.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            machines: RwLock::new(BTreeMap::new()),
            events,
            watcher: RwLock::new(None),
            tearing_down: AtomicBool::new(false),
        }
    }

    /// Attach the watcher that must hear about every mutation.
    pub fn set_watcher(&self, handle: WatcherHandle) {
        *self
            .watcher
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.poke_watcher();
    }

    /// Receive every registry event from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Stop serving; the watcher exits at its next cycle.
    pub fn begin_teardown(&self) {
        if !self.tearing_down.swap(true, Ordering::SeqCst) {
            info!("machine registry tearing down");
            self.poke_watcher();
        }
    }

    /// Register a machine. Registering a known machine is a no-op.
    ///
    /// Returns `true` if the machine is new.
    pub fn register_machine(&self, id: impl Into<ResourceId>) -> bool {
        let id = id.into();
        let mut machines = self.write_machines();
        if machines.contains_key(&id) {
            return false;
        }
        debug!(machine = %id, "machine registered");
        machines.insert(id, MachineEntry::new());
        true
    }

    /// Summaries of every machine, ordered by id.
    #[must_use]
    pub fn machines(&self) -> Vec<MachineSummary> {
        self.read_machines()
            .iter()
            .map(|(id, entry)| entry.summary(id))
            .collect()
    }

    /// Summary of one machine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown machine.
    pub fn machine(&self, id: &ResourceId) -> Result<MachineSummary> {
        self.read_machines()
            .get(id)
            .map(|entry| entry.summary(id))
            .ok_or_else(|| AppError::NotFound(format!("machine '{id}'")))
    }

    /// Lock `id` for a new client session.
    ///
    /// A machine in the spawning state only accepts the client whose pid
    /// was launched for it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown machine and
    /// `AppError::Conflict` when it is locked or reserved for another
    /// process.
    pub fn open_session(&self, id: &ResourceId, client_pid: Option<u32>) -> Result<OpenedSession> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (token, lock) = SessionToken::create();

        {
            let mut machines = self.write_machines();
            let entry = machines
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("machine '{id}'")))?;

            match &entry.state {
                MachineState::Unlocked => {}
                MachineState::Locked(record) => {
                    return Err(AppError::Conflict(format!(
                        "machine '{id}' is locked by session {}",
                        record.session_id
                    )));
                }
                MachineState::Spawning { pid: Some(pid) } if client_pid == Some(*pid) => {}
                MachineState::Spawning { pid: Some(pid) } => {
                    return Err(AppError::Conflict(format!(
                        "machine '{id}' is reserved for spawned process {pid}"
                    )));
                }
                MachineState::Spawning { pid: None } => {
                    return Err(AppError::Conflict(format!(
                        "machine '{id}' is being spawned; retry shortly"
                    )));
                }
            }

            entry.last_session_crashed = false;
            entry.transition(MachineState::Locked(SessionRecord {
                session_id: session_id.clone(),
                token,
                client_pid,
            }));
        }

        info!(machine = %id, session_id, ?client_pid, "session opened");
        self.emit(RegistryEvent::SessionOpened {
            machine: id.clone(),
            session_id: session_id.clone(),
            pid: client_pid,
        });
        self.poke_watcher();

        Ok(OpenedSession { session_id, lock })
    }

    /// End the session held by `lock` in an orderly fashion and unlock its
    /// machine immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no machine is locked by this lock.
    /// The lock is released either way.
    pub fn close_session(&self, lock: ClientLock) -> Result<ResourceId> {
        let token_id = lock.token_id();
        let closed = {
            let mut machines = self.write_machines();
            machines.iter_mut().find_map(|(id, entry)| {
                let session_id = match &entry.state {
                    MachineState::Locked(record) if record.token.id() == token_id => {
                        record.session_id.clone()
                    }
                    _ => return None,
                };
                entry.transition(MachineState::Unlocked);
                Some((id.clone(), session_id))
            })
        };
        lock.release();

        let Some((machine, session_id)) = closed else {
            return Err(AppError::NotFound(format!(
                "no machine is locked by token {token_id}"
            )));
        };

        info!(%machine, session_id, "session closed");
        self.emit(RegistryEvent::SessionClosed {
            machine: machine.clone(),
            session_id,
        });
        self.poke_watcher();
        Ok(machine)
    }

    /// Reserve `id` for a client process that is about to be launched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown machine and
    /// `AppError::Conflict` unless it is unlocked.
    pub fn begin_spawn(&self, id: &ResourceId) -> Result<()> {
        {
            let mut machines = self.write_machines();
            let entry = machines
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("machine '{id}'")))?;
            if !matches!(entry.state, MachineState::Unlocked) {
                return Err(AppError::Conflict(format!(
                    "machine '{id}' is not unlocked"
                )));
            }
            entry.last_spawn_failure = None;
            entry.transition(MachineState::Spawning { pid: None });
        }

        info!(machine = %id, "spawn started");
        self.emit(RegistryEvent::SpawnStarted { machine: id.clone() });
        self.poke_watcher();
        Ok(())
    }

    /// Record the pid of the process launched for `id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown machine and
    /// `AppError::Registry` if it is not spawning.
    pub fn set_spawn_pid(&self, id: &ResourceId, pid: u32) -> Result<()> {
        {
            let mut machines = self.write_machines();
            let entry = machines
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("machine '{id}'")))?;
            match &mut entry.state {
                MachineState::Spawning { pid: slot } => *slot = Some(pid),
                _ => {
                    return Err(AppError::Registry(format!(
                        "machine '{id}' is not spawning"
                    )));
                }
            }
        }

        debug!(machine = %id, pid, "spawn pid recorded");
        self.poke_watcher();
        Ok(())
    }

    /// Abandon a spawn that never got a process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown machine and
    /// `AppError::Registry` if it is not spawning.
    pub fn cancel_spawn(&self, id: &ResourceId) -> Result<()> {
        {
            let mut machines = self.write_machines();
            let entry = machines
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("machine '{id}'")))?;
            if !matches!(entry.state, MachineState::Spawning { .. }) {
                return Err(AppError::Registry(format!(
                    "machine '{id}' is not spawning"
                )));
            }
            entry.transition(MachineState::Unlocked);
        }

        info!(machine = %id, "spawn cancelled");
        self.poke_watcher();
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn poke_watcher(&self) {
        let watcher = self
            .watcher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(watcher) = watcher {
            watcher.update();
        }
    }

    fn read_machines(&self) -> RwLockReadGuard<'_, BTreeMap<ResourceId, MachineEntry>> {
        self.machines.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_machines(&self) -> RwLockWriteGuard<'_, BTreeMap<ResourceId, MachineEntry>> {
        self.machines.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read view over [`MachineRegistry`], holding its read lock.
pub struct MachineView<'a> {
    machines: RwLockReadGuard<'a, BTreeMap<ResourceId, MachineEntry>>,
}

impl RegistryView for MachineView<'_> {
    fn enumerate_open_sessions(&self) -> Vec<OpenSession> {
        self.machines
            .iter()
            .filter_map(|(id, entry)| match &entry.state {
                MachineState::Locked(record) => Some(OpenSession {
                    resource: id.clone(),
                    token: record.token.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    fn enumerate_spawning_sessions(&self) -> Vec<SpawningSession> {
        self.machines
            .iter()
            .filter_map(|(id, entry)| match entry.state {
                MachineState::Spawning { pid } => Some(SpawningSession {
                    resource: id.clone(),
                    pid,
                }),
                _ => None,
            })
            .collect()
    }
}

impl SessionRegistry for MachineRegistry {
    type View<'a> = MachineView<'a>;

    fn read(&self) -> Self::View<'_> {
        MachineView {
            machines: self.read_machines(),
        }
    }

    fn notify_session_token_signaled(&self, resource: &ResourceId, signal: SessionSignal) {
        let ended = {
            let mut machines = self.write_machines();
            let Some(entry) = machines.get_mut(resource) else {
                debug!(machine = %resource, "signal for unknown machine ignored");
                return;
            };
            let expected = match signal {
                SessionSignal::OrderlyRelease => TokenState::ReleasedOrderly,
                SessionSignal::Abandoned => TokenState::Abandoned,
            };
            let session_id = match &entry.state {
                // Any other state belongs to a newer session than the one signaled.
                MachineState::Locked(record) if record.token.state() == expected => {
                    record.session_id.clone()
                }
                _ => {
                    debug!(machine = %resource, ?signal, "stale session signal ignored");
                    return;
                }
            };
            entry.last_session_crashed = signal == SessionSignal::Abandoned;
            entry.transition(MachineState::Unlocked);
            session_id
        };

        let machine = resource.clone();
        match signal {
            SessionSignal::OrderlyRelease => {
                info!(%machine, session_id = ended, "session released; machine unlocked");
                self.emit(RegistryEvent::SessionClosed {
                    machine,
                    session_id: ended,
                });
            }
            SessionSignal::Abandoned => {
                warn!(%machine, session_id = ended, "session crashed; machine unlocked");
                self.emit(RegistryEvent::SessionCrashed {
                    machine,
                    session_id: ended,
                });
            }
        }
        self.poke_watcher();
    }

    fn notify_spawn_result(&self, resource: &ResourceId, exit: ProcessExit) {
        {
            let mut machines = self.write_machines();
            let Some(entry) = machines.get_mut(resource) else {
                return;
            };
            if !matches!(entry.state, MachineState::Spawning { .. }) {
                debug!(machine = %resource, %exit, "spawn result after spawn finished ignored");
                return;
            }
            entry.last_spawn_failure = Some(exit);
            entry.transition(MachineState::Unlocked);
        }

        warn!(machine = %resource, %exit, "spawn failed; machine unlocked");
        self.emit(RegistryEvent::SpawnFailed {
            machine: resource.clone(),
            exit,
        });
        self.poke_watcher();
    }

    fn is_valid(&self) -> bool {
        !self.tearing_down.load(Ordering::SeqCst)
    }
}
