//! Unit tests for session tokens and client locks.

use std::time::Duration;

use session_watcher::models::session::SessionSignal;
use session_watcher::watcher::token::{SessionToken, TokenState, WaitOutcome, Waitable};

#[test]
fn new_token_is_live() {
    let (token, lock) = SessionToken::create();
    assert!(token.is_live());
    assert_eq!(token.id(), lock.token_id());
}

#[test]
fn tokens_get_distinct_ids() {
    let (first, _lock_a) = SessionToken::create();
    let (second, _lock_b) = SessionToken::create();
    assert_ne!(first.id(), second.id());
}

#[test]
fn release_marks_orderly() {
    let (token, lock) = SessionToken::create();
    assert!(lock.release());
    assert_eq!(token.state(), TokenState::ReleasedOrderly);
}

#[test]
fn dropping_lock_abandons_token() {
    let (token, lock) = SessionToken::create();
    drop(lock);
    assert_eq!(token.state(), TokenState::Abandoned);
}

#[test]
fn released_token_is_never_abandoned_afterwards() {
    let (token, lock) = SessionToken::create();
    let copy = lock.token();
    lock.release();
    drop(copy);
    assert_eq!(token.state(), TokenState::ReleasedOrderly);
}

#[tokio::test]
async fn wait_resolves_on_release() {
    let (token, lock) = SessionToken::create();

    let waiter = tokio::spawn(async move { token.wait().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    lock.release();

    let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait should resolve")
        .unwrap();
    assert_eq!(outcome, WaitOutcome::OrderlyRelease);
    assert_eq!(outcome.session_signal(), Some(SessionSignal::OrderlyRelease));
}

#[tokio::test]
async fn wait_resolves_on_abandonment() {
    let (token, lock) = SessionToken::create();

    let waiter = tokio::spawn(async move { token.wait().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(lock);

    let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait should resolve")
        .unwrap();
    assert_eq!(outcome, WaitOutcome::Abandoned);
}

#[tokio::test]
async fn wait_on_already_signaled_token_is_immediate() {
    let (token, lock) = SessionToken::create();
    drop(lock);

    let outcome = tokio::time::timeout(Duration::from_millis(50), token.wait())
        .await
        .expect("already abandoned token resolves at once");
    assert_eq!(outcome, WaitOutcome::Abandoned);
}

#[tokio::test]
async fn live_token_keeps_waiting() {
    let (token, _lock) = SessionToken::create();
    let result = tokio::time::timeout(Duration::from_millis(50), token.wait()).await;
    assert!(result.is_err());
}
