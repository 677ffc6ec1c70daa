//! Session tokens and the waitable capability the watcher multiplexes over.
//!
//! A [`SessionToken`] is created together with its [`ClientLock`]. The
//! registry keeps the token inside the session object; the client (an IPC
//! connection, an in-process user) keeps the lock. Releasing the lock marks
//! the token `ReleasedOrderly`; dropping it without a release marks it
//! `Abandoned`. The first transition out of `Live` wins and is final.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::debug;

use crate::models::session::{ProcessExit, SessionSignal};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Held by a live client.
    Live,
    /// Released by its client.
    ReleasedOrderly,
    /// Its client went away while holding it.
    Abandoned,
}

/// Why a watched object became signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Session token released by its owner.
    OrderlyRelease,
    /// Session token abandoned by a dead owner.
    Abandoned,
    /// Spawning helper process exited.
    ProcessExited(ProcessExit),
}

impl WaitOutcome {
    /// The session-level meaning of a token outcome.
    #[must_use]
    pub fn session_signal(self) -> Option<SessionSignal> {
        match self {
            Self::OrderlyRelease => Some(SessionSignal::OrderlyRelease),
            Self::Abandoned => Some(SessionSignal::Abandoned),
            Self::ProcessExited(_) => None,
        }
    }
}

/// Something a shard can wait on.
///
/// `wait` resolves once the object is signaled and must be cancel-safe:
/// shards drop pending waits whenever a cycle ends.
pub trait Waitable: Send + Sync {
    /// Resolve with the reason once the object is signaled.
    fn wait(&self) -> BoxFuture<'_, WaitOutcome>;
}

struct TokenInner {
    id: u64,
    state: watch::Sender<TokenState>,
}

impl TokenInner {
    fn leave_live(&self, next: TokenState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TokenState::Live {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

/// Waitable handle for one client session.
#[derive(Clone)]
pub struct SessionToken {
    inner: Arc<TokenInner>,
}

impl SessionToken {
    /// Create a live token and the lock its client holds.
    #[must_use]
    pub fn create() -> (Self, ClientLock) {
        let (state, _) = watch::channel(TokenState::Live);
        let inner = Arc::new(TokenInner {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            state,
        });
        let lock = ClientLock {
            inner: Arc::clone(&inner),
            released: false,
        };
        (Self { inner }, lock)
    }

    /// Process-unique token identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TokenState {
        *self.inner.state.borrow()
    }

    /// Whether the owning client still holds the token.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == TokenState::Live
    }
}

impl Debug for SessionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Waitable for SessionToken {
    fn wait(&self) -> BoxFuture<'_, WaitOutcome> {
        Box::pin(async move {
            let mut rx = self.inner.state.subscribe();
            let state = rx
                .wait_for(|state| *state != TokenState::Live)
                .await
                .map(|state| *state)
                .unwrap_or(TokenState::Abandoned);
            match state {
                TokenState::ReleasedOrderly => WaitOutcome::OrderlyRelease,
                TokenState::Live | TokenState::Abandoned => WaitOutcome::Abandoned,
            }
        })
    }
}

/// The client's side of a session token.
///
/// Dropping the lock without calling [`release`](Self::release) abandons
/// the token, which is what a crashed client looks like to the watcher.
pub struct ClientLock {
    inner: Arc<TokenInner>,
    released: bool,
}

impl ClientLock {
    /// A waitable handle for the token this lock holds.
    #[must_use]
    pub fn token(&self) -> SessionToken {
        SessionToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Identifier of the held token.
    #[must_use]
    pub fn token_id(&self) -> u64 {
        self.inner.id
    }

    /// Release the token in an orderly fashion.
    ///
    /// Returns `false` if the token had already left the live state.
    pub fn release(mut self) -> bool {
        self.released = true;
        let changed = self.inner.leave_live(TokenState::ReleasedOrderly);
        if changed {
            debug!(token_id = self.inner.id, "session token released");
        }
        changed
    }
}

impl Debug for ClientLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLock")
            .field("token_id", &self.inner.id)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ClientLock {
    fn drop(&mut self) {
        if !self.released && self.inner.leave_live(TokenState::Abandoned) {
            debug!(token_id = self.inner.id, "session token abandoned");
        }
    }
}
