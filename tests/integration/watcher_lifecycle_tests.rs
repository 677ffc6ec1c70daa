//! Integration tests for watcher startup, shutdown and basic reporting.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use session_watcher::config::WatcherConfig;
use session_watcher::models::session::SessionSignal;
use session_watcher::watcher::Watcher;
use session_watcher::AppError;

use super::test_helpers::{fast_config, wait_until, FakeRegistry};

#[tokio::test]
async fn start_reports_ready_and_cycles() {
    let registry = Arc::new(FakeRegistry::default());
    let watcher = Watcher::start(Arc::clone(&registry), fast_config()).expect("watcher starts");

    assert!(watcher.is_ready());
    assert!(watcher.is_reliable());
    assert!(wait_until(Duration::from_secs(2), || watcher.stats().cycles >= 2).await);

    let stats = watcher.stats();
    assert!(stats.running);
    assert_eq!(stats.shards, 1);
    assert_eq!(stats.subworkers, 0);

    watcher.shutdown();
}

#[tokio::test]
async fn invalid_config_is_not_ready() {
    let registry = Arc::new(FakeRegistry::default());
    let config = WatcherConfig {
        shard_capacity: 0,
        ..WatcherConfig::default()
    };

    let err = Watcher::start(registry, config).unwrap_err();
    assert!(matches!(err, AppError::NotReady(_)));
}

#[tokio::test]
async fn disabled_watcher_is_inert() {
    let watcher = Watcher::disabled();
    let handle = watcher.handle();

    handle.update();
    handle.add_process(12345);
    assert!(!watcher.is_ready());
    assert!(!watcher.is_reliable());
    assert_eq!(watcher.stats().cycles, 0);

    watcher.shutdown();
    watcher.shutdown();
}

#[tokio::test]
async fn orderly_release_is_reported_once_and_never_as_abandoned() {
    let registry = Arc::new(FakeRegistry::default());
    let watcher = Watcher::start(Arc::clone(&registry), fast_config()).unwrap();

    let lock = registry.add_session("vm-1");
    watcher.update();
    assert!(wait_until(Duration::from_secs(2), || watcher.stats().watched_sessions == 1).await);

    assert!(lock.release());
    assert!(wait_until(Duration::from_secs(2), || !registry.signals().is_empty()).await);

    // Give the watcher a few more cycles to misbehave.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let signals = registry.signals();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].1, SessionSignal::OrderlyRelease);
    assert_eq!(watcher.stats().released_total, 1);
    assert_eq!(watcher.stats().abandoned_total, 0);

    watcher.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_closes_handles_and_is_idempotent() {
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();

    let registry = Arc::new(FakeRegistry::default());
    registry.add_spawning("vm-1", Some(child.id()));
    let _held = registry.add_session("vm-2");
    let watcher = Watcher::start(Arc::clone(&registry), fast_config()).unwrap();

    assert!(wait_until(Duration::from_secs(2), || watcher.stats().open_handles == 1).await);

    watcher.shutdown();
    let stats = watcher.stats();
    assert!(!watcher.is_ready());
    assert!(!stats.running);
    assert_eq!(stats.open_handles, 0);
    assert_eq!(stats.subworkers, 0);

    watcher.shutdown();
    assert!(!watcher.is_ready());

    child.kill().unwrap();
    child.wait().unwrap();
}

#[tokio::test]
async fn invalid_registry_stops_the_loop() {
    let registry = Arc::new(FakeRegistry::default());
    let watcher = Watcher::start(Arc::clone(&registry), fast_config()).unwrap();

    registry.invalidate();
    watcher.update();

    assert!(wait_until(Duration::from_secs(2), || !watcher.is_ready()).await);
    watcher.shutdown();
}

#[tokio::test]
async fn drop_shuts_the_watcher_down() {
    let registry = Arc::new(FakeRegistry::default());
    let watcher = Watcher::start(Arc::clone(&registry), fast_config()).unwrap();
    let handle = watcher.handle();

    drop(watcher);

    assert!(!handle.is_ready());
    assert!(!handle.stats().running);
}
