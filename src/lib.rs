#![forbid(unsafe_code)]

//! Session liveness watching for a resource management daemon.
//!
//! Out-of-process clients lock managed machines through sessions. The
//! [`watcher`] notices when a client releases its session, when it dies
//! while holding one, and when a launched client exits before locking its
//! machine, and reports each of these to the [`registry`].

pub mod config;
pub mod errors;
pub mod ipc;
pub mod launcher;
pub mod models;
pub mod registry;
pub mod watcher;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
