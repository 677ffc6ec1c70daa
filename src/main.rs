#![forbid(unsafe_code)]

//! `session-watchd` — resource management daemon with a session liveness
//! watcher.
//!
//! Bootstraps configuration, registers the configured machines, starts the
//! session watcher and serves the IPC socket for `session-watch-ctl` and
//! launched clients.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use session_watcher::config::GlobalConfig;
use session_watcher::ipc::server::{spawn_ipc_server, IpcState};
use session_watcher::registry::machine::MachineRegistry;
use session_watcher::watcher::Watcher;
use session_watcher::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "session-watchd", about = "Session liveness watcher daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("session-watchd bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(machines = config.machines.len(), "configuration loaded");

    // ── Build the registry ──────────────────────────────
    let registry = Arc::new(MachineRegistry::new());
    for machine in &config.machines {
        registry.register_machine(machine.as_str());
    }

    // ── Start the session watcher ───────────────────────
    let watcher = match Watcher::start(Arc::clone(&registry), config.watcher.clone()) {
        Ok(watcher) => watcher,
        Err(err) => {
            error!(%err, "session watcher failed to start; continuing without it");
            Watcher::disabled()
        }
    };
    registry.set_watcher(watcher.handle());

    // ── Start IPC server ────────────────────────────────
    let ct = CancellationToken::new();
    let state = Arc::new(IpcState {
        ipc_name: config.ipc_name.clone(),
        registry: Arc::clone(&registry),
        watcher: watcher.handle(),
        launcher: config.launcher.clone(),
    });
    let ipc_handle = spawn_ipc_server(state, ct.clone())?;

    info!(ready = watcher.is_ready(), "session-watchd ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    registry.begin_teardown();
    ct.cancel();
    if let Err(err) = ipc_handle.await {
        warn!(%err, "ipc server task failed");
    }

    // Joining the watcher thread blocks.
    let stats = tokio::task::spawn_blocking(move || {
        watcher.shutdown();
        watcher.stats()
    })
    .await
    .map_err(|err| AppError::NotReady(format!("watcher shutdown task failed: {err}")))?;

    info!(
        reaped = stats.reaped_total,
        abandoned = stats.abandoned_total,
        "session-watchd shut down"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
