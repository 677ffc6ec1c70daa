//! Unit tests for process probes and watcher-owned process handles.

#![cfg(unix)]

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use session_watcher::models::session::ProcessExit;
use session_watcher::watcher::process::{liveness, Liveness, ProcessHandle};
use session_watcher::watcher::reaper::ProcessReaper;
use session_watcher::watcher::stats::WatcherStats;
use session_watcher::watcher::token::{WaitOutcome, Waitable};

#[test]
fn own_process_is_running() {
    assert_eq!(liveness(std::process::id()), Liveness::Running);
}

#[test]
fn pid_zero_cannot_be_probed() {
    assert_eq!(liveness(0), Liveness::Unknown);
}

#[test]
fn handles_are_counted_while_open() {
    let stats = Arc::new(WatcherStats::default());
    let handle = ProcessHandle::open(std::process::id(), Duration::from_millis(10), Arc::clone(&stats))
        .expect("own pid can be watched");
    assert_eq!(stats.snapshot().open_handles, 1);
    assert_eq!(handle.pid(), std::process::id());
    assert!(handle.try_exit().is_none());

    drop(handle);
    assert_eq!(stats.snapshot().open_handles, 0);
}

#[test]
fn unprobeable_pid_is_rejected() {
    let stats = Arc::new(WatcherStats::default());
    assert!(ProcessHandle::open(0, Duration::from_millis(10), Arc::clone(&stats)).is_err());
    assert_eq!(stats.snapshot().open_handles, 0);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn wait_reports_exit_code_and_leaves_status_for_reaper() {
    let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
    let pid = child.id();
    drop(child);

    let stats = Arc::new(WatcherStats::default());
    let handle = ProcessHandle::open(pid, Duration::from_millis(5), Arc::clone(&stats)).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("exit should be observed");
    assert_eq!(outcome, WaitOutcome::ProcessExited(ProcessExit::Exited { code: 3 }));

    // Observing the exit must not consume it.
    let mut reaper = ProcessReaper::new(Duration::from_secs(5));
    reaper.enqueue(pid);
    assert_eq!(reaper.reap(), 1);
    assert!(reaper.is_empty());
}

#[tokio::test]
async fn wait_keeps_pending_while_process_runs() {
    let mut child = Command::new("sleep").arg("5").spawn().unwrap();

    let stats = Arc::new(WatcherStats::default());
    let handle = ProcessHandle::open(child.id(), Duration::from_millis(5), stats).unwrap();
    let result = tokio::time::timeout(Duration::from_millis(60), handle.wait()).await;
    assert!(result.is_err(), "running process must not resolve");

    child.kill().unwrap();
    child.wait().unwrap();
}

#[tokio::test]
async fn collected_handle_resolves_with_its_status() {
    let stats = Arc::new(WatcherStats::default());
    let exit = ProcessExit::Signaled { signal: 9 };
    let handle = ProcessHandle::collected(4242, exit, Arc::clone(&stats));
    assert_eq!(stats.snapshot().open_handles, 1);
    assert_eq!(handle.try_exit(), Some(exit));

    let outcome = tokio::time::timeout(Duration::from_millis(100), handle.wait())
        .await
        .expect("collected status resolves at once");
    assert_eq!(outcome, WaitOutcome::ProcessExited(exit));

    drop(handle);
    assert_eq!(stats.snapshot().open_handles, 0);
}
