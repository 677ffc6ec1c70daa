//! Local IPC layer for `session-watch-ctl` and launched clients.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands.

pub mod server;
