#![forbid(unsafe_code)]

//! `session-watch-ctl` — local CLI companion for `session-watchd`.
//!
//! Connects to the IPC socket and sends JSON commands to the daemon. The
//! `open` command doubles as a minimal session client: it holds the lock
//! until Enter is pressed, and killing it instead abandons the session.
//!
//! `open` also works as the daemon's launched client. The launcher exports
//! `SESSION_WATCHER_MACHINE` and `SESSION_WATCHER_IPC`, which stand in for
//! the machine argument and `--ipc-name`. Without a terminal on stdin the
//! session is held until SIGTERM or SIGINT, then released.

use std::io::{BufRead, BufReader, IsTerminal, Write};
use std::time::Duration;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

type CtlResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Attempts at `open_session` while the daemon still learns our pid.
const OPEN_ATTEMPTS: u32 = 50;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(
    name = "session-watch-ctl",
    about = "Local CLI for session-watchd",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the daemon's `ipc_name` config).
    #[arg(long, env = "SESSION_WATCHER_IPC", default_value = "session-watcher")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List machines and their lock state.
    List,

    /// Show watcher readiness and counters.
    Status,

    /// Lock a machine and hold the session until Enter is pressed.
    Open {
        /// Machine identifier.
        #[arg(env = "SESSION_WATCHER_MACHINE")]
        machine: String,
    },

    /// Launch the configured client for a machine.
    Launch {
        /// Machine identifier.
        machine: String,
    },
}

fn main() {
    let args = Cli::parse();

    let outcome = match &args.command {
        Command::List => one_shot(&args.ipc_name, &serde_json::json!({ "command": "list" })),
        Command::Status => one_shot(&args.ipc_name, &serde_json::json!({ "command": "status" })),
        Command::Launch { machine } => one_shot(
            &args.ipc_name,
            &serde_json::json!({ "command": "launch", "machine": machine }),
        ),
        Command::Open { machine } => hold_session(&args.ipc_name, machine),
    };

    if let Err(err) = outcome {
        eprintln!("Failed to talk to daemon: {err}");
        eprintln!("Is session-watchd running with ipc_name '{}'?", args.ipc_name);
        std::process::exit(1);
    }
}

/// Send one command and print its result.
fn one_shot(ipc_name: &str, request: &serde_json::Value) -> CtlResult<()> {
    let mut stream = connect(ipc_name)?;
    let response = send_ipc_command(&mut stream, request)?;
    print_response(&response);
    Ok(())
}

/// Open a session and keep the connection until told to release it.
fn hold_session(ipc_name: &str, machine: &str) -> CtlResult<()> {
    let mut stream = connect(ipc_name)?;
    let request = serde_json::json!({
        "command": "open_session",
        "machine": machine,
        "pid": std::process::id(),
    });

    let mut attempt = 1;
    let opened = loop {
        let response = send_ipc_command(&mut stream, &request)?;
        let retry = response
            .get("retry")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !retry || attempt >= OPEN_ATTEMPTS {
            break response;
        }
        attempt += 1;
        std::thread::sleep(OPEN_RETRY_DELAY);
    };
    print_response(&opened);

    if std::io::stdin().is_terminal() {
        eprintln!("Session held on '{machine}'. Press Enter to release it.");
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
    } else {
        eprintln!("Session held on '{machine}' until terminated.");
        wait_for_termination()?;
    }

    let closed = send_ipc_command(&mut stream, &serde_json::json!({ "command": "close_session" }))?;
    print_response(&closed);
    Ok(())
}

#[cfg(unix)]
fn wait_for_termination() -> CtlResult<()> {
    use nix::sys::signal::{SigSet, Signal};

    let mut signals = SigSet::empty();
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGINT);
    signals.thread_block()?;
    let signal = signals.wait()?;
    eprintln!("Received {signal}; releasing session.");
    Ok(())
}

#[cfg(not(unix))]
fn wait_for_termination() -> CtlResult<()> {
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(())
}

fn connect(ipc_name: &str) -> CtlResult<Stream> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    Ok(Stream::connect(name)?)
}

/// Send a JSON command on `stream` and read the response line.
fn send_ipc_command(stream: &mut Stream, request: &serde_json::Value) -> CtlResult<serde_json::Value> {
    // Send request as a single JSON line.
    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    // The daemon answers each request with exactly one line.
    let mut reader = BufReader::new(&*stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}

/// Print `data` on success; print the error and exit non-zero otherwise.
fn print_response(response: &serde_json::Value) {
    let Some(obj) = response.as_object() else {
        println!("{response}");
        return;
    };

    let ok = obj
        .get("ok")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if ok {
        if let Some(data) = obj.get("data") {
            println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
        } else {
            println!("OK");
        }
    } else {
        let err_msg = obj
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error");
        eprintln!("Error: {err_msg}");
        std::process::exit(1);
    }
}
