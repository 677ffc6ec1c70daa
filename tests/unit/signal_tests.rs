//! Unit tests for the coalescing update signal.

use std::time::Duration;

use session_watcher::watcher::signal::UpdateSignal;

#[tokio::test]
async fn raise_after_seen_generation_wakes_waiter() {
    let signal = UpdateSignal::new();
    let seen = signal.generation();

    let waiter = {
        let signal = signal.clone();
        tokio::spawn(async move { signal.raised_since(seen).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    signal.raise();

    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should wake")
        .expect("waiter task should not panic");
}

#[tokio::test]
async fn raise_before_wait_is_not_lost() {
    let signal = UpdateSignal::new();
    let seen = signal.generation();
    signal.raise();

    tokio::time::timeout(Duration::from_millis(100), signal.raised_since(seen))
        .await
        .expect("an earlier raise must still be observed");
}

#[tokio::test]
async fn unraised_signal_keeps_waiting() {
    let signal = UpdateSignal::new();
    let seen = signal.generation();

    let result = tokio::time::timeout(Duration::from_millis(50), signal.raised_since(seen)).await;
    assert!(result.is_err(), "no raise means no wake");
}

#[test]
fn concurrent_raises_coalesce_into_generations() {
    let signal = UpdateSignal::default();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let signal = signal.clone();
            std::thread::spawn(move || signal.raise())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(signal.generation(), 8);
}
