//! Session identity and termination vocabulary shared by the watcher and
//! the registry.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifier of a managed resource (a machine) a session can lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Wrap a resource name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the underlying name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How a session token left the live state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionSignal {
    /// The client released its lock deliberately.
    OrderlyRelease,
    /// The client went away while still holding the lock.
    Abandoned,
}

/// Exit classification of a watched or reaped process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessExit {
    /// Process called `exit` with the given code.
    Exited {
        /// Exit code.
        code: i32,
    },
    /// Process was terminated by a signal.
    Signaled {
        /// Signal number.
        signal: i32,
    },
    /// Process is gone but its status could not be collected.
    Unknown,
}

impl ProcessExit {
    /// Whether the process exited with status zero.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

impl Display for ProcessExit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code: 0 } => f.write_str("exited normally (code 0)"),
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled { signal } => write!(f, "terminated by signal {signal}"),
            Self::Unknown => f.write_str("status unknown"),
        }
    }
}
