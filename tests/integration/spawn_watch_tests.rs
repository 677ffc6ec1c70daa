//! Integration tests for spawning-process watching.

#![cfg(unix)]

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use session_watcher::config::WatcherConfig;
use session_watcher::models::session::{ProcessExit, ResourceId};
use session_watcher::watcher::Watcher;

use super::test_helpers::{fast_config, wait_until, FakeRegistry};

#[cfg(target_os = "linux")]
#[tokio::test]
async fn spawning_process_exit_is_reported_once() {
    let child = Command::new("sh").args(["-c", "sleep 0.05; exit 4"]).spawn().unwrap();
    let pid = child.id();
    drop(child);

    let registry = Arc::new(FakeRegistry::default());
    registry.add_spawning("vm-1", Some(pid));
    let watcher = Watcher::start(Arc::clone(&registry), fast_config()).unwrap();

    assert!(wait_until(Duration::from_secs(2), || !registry.spawn_results().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let results = registry.spawn_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, ResourceId::from("vm-1"));
    assert_eq!(results[0].1, ProcessExit::Exited { code: 4 });
    assert_eq!(watcher.stats().spawn_exits_total, 1);

    // The watcher's peek leaves the status for the reaper.
    watcher.add_process(pid);
    watcher.update();
    assert!(wait_until(Duration::from_secs(2), || watcher.stats().reaped_total == 1).await);
    assert!(wait_until(Duration::from_secs(1), || watcher.stats().open_handles == 0).await);

    watcher.shutdown();
}

#[tokio::test]
async fn unresolved_pid_uses_race_poll() {
    let registry = Arc::new(FakeRegistry::default());
    let config = WatcherConfig {
        poll_steps_ms: vec![10_000],
        spawn_race_poll_ms: 20,
        ..fast_config()
    };

    registry.add_spawning("vm-1", None);
    let watcher = Watcher::start(Arc::clone(&registry), config).unwrap();
    assert!(wait_until(Duration::from_secs(1), || watcher.stats().scans >= 2).await);

    let child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    drop(child);
    watcher.add_process(pid);

    // No update: only the short race poll can notice the pid.
    registry.set_spawning_pid("vm-1", pid);

    assert!(wait_until(Duration::from_secs(2), || registry.spawn_results().len() == 1).await);

    watcher.shutdown();
}

#[tokio::test]
async fn exit_reaped_before_pid_is_known_keeps_its_status() {
    let registry = Arc::new(FakeRegistry::default());
    registry.add_spawning("vm-1", None);
    let watcher = Watcher::start(Arc::clone(&registry), fast_config()).unwrap();

    let child = Command::new("sh").args(["-c", "exit 5"]).spawn().unwrap();
    let pid = child.id();
    drop(child);
    watcher.add_process(pid);
    watcher.update();
    assert!(wait_until(Duration::from_secs(2), || watcher.stats().reaped_total == 1).await);

    registry.set_spawning_pid("vm-1", pid);
    watcher.update();

    assert!(wait_until(Duration::from_secs(2), || registry.spawn_results().len() == 1).await);
    assert_eq!(
        registry.spawn_results()[0],
        (ResourceId::from("vm-1"), ProcessExit::Exited { code: 5 })
    );
    assert!(wait_until(Duration::from_secs(1), || watcher.stats().open_handles == 0).await);

    watcher.shutdown();
}
