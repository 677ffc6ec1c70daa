//! Unit tests for the process reaper queue.

#![cfg(unix)]

use std::process::Command;
use std::time::Duration;

use session_watcher::models::session::ProcessExit;
use session_watcher::watcher::reaper::ProcessReaper;

/// Poll `reap` until `done` or the deadline passes.
fn reap_until(reaper: &mut ProcessReaper, done: impl Fn(&ProcessReaper) -> bool) -> usize {
    let mut reaped = 0;
    for _ in 0..100 {
        reaped += reaper.reap();
        if done(reaper) {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    reaped
}

#[test]
fn exited_child_is_reaped_once() {
    let child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    drop(child);

    let mut reaper = ProcessReaper::new(Duration::from_secs(5));
    assert!(reaper.enqueue(pid));
    assert!(!reaper.enqueue(pid));

    let reaped = reap_until(&mut reaper, ProcessReaper::is_empty);
    assert_eq!(reaped, 1);
    assert!(!reaper.contains(pid));
    assert_eq!(reaper.reap(), 0);
}

#[test]
fn failing_child_is_reaped_too() {
    let child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
    let pid = child.id();
    drop(child);

    let mut reaper = ProcessReaper::new(Duration::from_secs(5));
    reaper.enqueue(pid);
    assert_eq!(reap_until(&mut reaper, ProcessReaper::is_empty), 1);
}

#[test]
fn running_child_stays_queued_once() {
    let mut child = Command::new("sleep").arg("5").spawn().unwrap();
    let pid = child.id();

    let mut reaper = ProcessReaper::new(Duration::from_secs(5));
    reaper.enqueue(pid);
    assert_eq!(reaper.reap(), 0);
    assert_eq!(reaper.reap(), 0);
    assert_eq!(reaper.len(), 1);
    assert!(reaper.contains(pid));

    child.kill().unwrap();
    assert_eq!(reap_until(&mut reaper, ProcessReaper::is_empty), 1);
    // Status already collected; the std handle finds no child.
    assert!(child.try_wait().is_err());
}

#[test]
fn foreign_live_pid_is_dropped_after_grace() {
    // Our own pid is never our child.
    let mut reaper = ProcessReaper::new(Duration::from_millis(30));
    reaper.enqueue(std::process::id());

    assert_eq!(reaper.reap(), 0);
    assert!(reaper.contains(std::process::id()), "kept while inside grace");

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(reaper.reap(), 0);
    assert!(reaper.is_empty(), "dropped once grace has passed");
}

#[test]
fn collected_status_is_remembered_for_the_grace_period() {
    let child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
    let pid = child.id();
    drop(child);

    let mut reaper = ProcessReaper::new(Duration::from_millis(200));
    assert_eq!(reaper.collected_exit(pid), None);
    reaper.enqueue(pid);
    assert_eq!(reap_until(&mut reaper, ProcessReaper::is_empty), 1);
    assert_eq!(reaper.collected_exit(pid), Some(ProcessExit::Exited { code: 7 }));

    std::thread::sleep(Duration::from_millis(250));
    reaper.reap();
    assert_eq!(reaper.collected_exit(pid), None);
}
