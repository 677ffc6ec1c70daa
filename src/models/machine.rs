//! Machine lock state as reported by the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::session::{ProcessExit, ResourceId};

/// Coarse lock state of a machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// No session holds the machine.
    Unlocked,
    /// A client process was launched and has not locked the machine yet.
    Spawning,
    /// A client session holds the machine.
    Locked,
}

/// Point-in-time view of one machine for listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MachineSummary {
    /// Machine identifier.
    pub id: ResourceId,
    /// Current lock state.
    pub state: LockState,
    /// Session identifier while locked.
    pub session_id: Option<String>,
    /// Client pid while locked (if the client reported one) or spawned pid
    /// while spawning.
    pub pid: Option<u32>,
    /// When the current state was entered.
    pub since: DateTime<Utc>,
    /// Whether the previous session ended by abandonment.
    pub last_session_crashed: bool,
    /// Exit of the last failed spawn, if any.
    pub last_spawn_failure: Option<ProcessExit>,
}

/// Registry state change broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A client locked a machine.
    SessionOpened {
        /// Machine identifier.
        machine: ResourceId,
        /// New session identifier.
        session_id: String,
        /// Client pid, if reported.
        pid: Option<u32>,
    },
    /// A session ended with an orderly release.
    SessionClosed {
        /// Machine identifier.
        machine: ResourceId,
        /// Ended session identifier.
        session_id: String,
    },
    /// A session's client went away while holding the lock.
    SessionCrashed {
        /// Machine identifier.
        machine: ResourceId,
        /// Abandoned session identifier.
        session_id: String,
    },
    /// A client process is being launched for a machine.
    SpawnStarted {
        /// Machine identifier.
        machine: ResourceId,
    },
    /// The launched client exited before locking its machine.
    SpawnFailed {
        /// Machine identifier.
        machine: ResourceId,
        /// How the client process ended.
        exit: ProcessExit,
    },
}
