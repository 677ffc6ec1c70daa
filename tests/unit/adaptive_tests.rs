//! Unit tests for the adaptive wait timeout table.

use std::time::Duration;

use session_watcher::watcher::adaptive::AdaptiveTimeout;

fn steps() -> Vec<Duration> {
    [500, 200, 100, 50]
        .into_iter()
        .map(Duration::from_millis)
        .collect()
}

#[test]
fn starts_on_slowest_step() {
    let timeout = AdaptiveTimeout::new(steps());
    assert_eq!(timeout.index(), 0);
    assert_eq!(timeout.current(), Duration::from_millis(500));
}

#[test]
fn reset_jumps_to_fastest_step() {
    let timeout = AdaptiveTimeout::new(steps());
    timeout.reset();
    assert_eq!(timeout.index(), 3);
    assert_eq!(timeout.current(), Duration::from_millis(50));
}

#[test]
fn back_off_walks_towards_slowest_and_stops() {
    let timeout = AdaptiveTimeout::new(steps());
    timeout.reset();

    let mut seen = vec![timeout.current()];
    for _ in 0..6 {
        timeout.back_off();
        seen.push(timeout.current());
    }

    let expected: Vec<Duration> = [50, 100, 200, 500, 500, 500, 500]
        .into_iter()
        .map(Duration::from_millis)
        .collect();
    assert_eq!(seen, expected);
    assert_eq!(timeout.index(), 0, "counter must not underflow");
}

#[test]
fn repeated_resets_stay_on_fastest_step() {
    let timeout = AdaptiveTimeout::new(steps());
    timeout.reset();
    timeout.reset();
    assert_eq!(timeout.index(), timeout.fastest_index());
}

#[test]
fn empty_table_falls_back_to_single_step() {
    let timeout = AdaptiveTimeout::new(Vec::new());
    assert_eq!(timeout.current(), Duration::from_millis(500));
    timeout.reset();
    timeout.back_off();
    assert_eq!(timeout.current(), Duration::from_millis(500));
}
