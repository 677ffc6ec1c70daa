//! Registry interface consumed by the session watcher.
//!
//! The watcher never owns sessions. Each cycle it takes one read view of
//! the registry, copies out what it needs to wait on, drops the view and
//! only then waits. Callbacks into the registry are made with no watcher
//! state borrowed.

pub mod machine;

use crate::models::session::{ProcessExit, ResourceId, SessionSignal};
use crate::watcher::token::SessionToken;

/// An open session as seen by one rescan.
#[derive(Debug, Clone)]
pub struct OpenSession {
    /// Locked resource.
    pub resource: ResourceId,
    /// The session's token.
    pub token: SessionToken,
}

/// A session whose client process was launched but has not locked yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawningSession {
    /// Resource being spawned.
    pub resource: ResourceId,
    /// Launched pid, `None` while it is not yet known.
    pub pid: Option<u32>,
}

/// Consistent read snapshot of a registry.
///
/// Both enumerations must observe the same registry state.
pub trait RegistryView {
    /// Every session currently holding a resource.
    fn enumerate_open_sessions(&self) -> Vec<OpenSession>;

    /// Every resource in the spawning state.
    fn enumerate_spawning_sessions(&self) -> Vec<SpawningSession>;
}

/// The object registry the watcher reports into.
pub trait SessionRegistry: Send + Sync + 'static {
    /// Read view holding the registry's read lock while alive.
    type View<'a>: RegistryView
    where
        Self: 'a;

    /// Take a read view.
    fn read(&self) -> Self::View<'_>;

    /// A session's token left the live state.
    fn notify_session_token_signaled(&self, resource: &ResourceId, signal: SessionSignal);

    /// A spawning client process exited before locking its resource.
    fn notify_spawn_result(&self, resource: &ResourceId, exit: ProcessExit);

    /// Whether the registry is still serving. The watcher stops once this
    /// turns false.
    fn is_valid(&self) -> bool {
        true
    }
}
