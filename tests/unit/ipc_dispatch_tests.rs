//! Unit tests for IPC command dispatch on a single connection.

use std::sync::Arc;

use serde_json::Value;

use session_watcher::ipc::server::{IpcConnection, IpcState};
use session_watcher::models::machine::LockState;
use session_watcher::models::session::ResourceId;
use session_watcher::registry::machine::MachineRegistry;
use session_watcher::watcher::WatcherHandle;

fn test_state() -> Arc<IpcState> {
    let registry = Arc::new(MachineRegistry::new());
    registry.register_machine("vm-1");
    registry.register_machine("vm-2");
    Arc::new(IpcState {
        ipc_name: "ipc-dispatch-test".into(),
        registry,
        watcher: WatcherHandle::default(),
        launcher: None,
    })
}

fn call(connection: &mut IpcConnection, line: &str) -> Value {
    serde_json::from_str(&connection.handle_line(line)).expect("response is json")
}

#[test]
fn list_returns_all_machines() {
    let mut connection = IpcConnection::new(test_state());
    let response = call(&mut connection, r#"{"command":"list"}"#);

    assert_eq!(response["ok"], true);
    let machines = response["data"]["machines"].as_array().unwrap();
    assert_eq!(machines.len(), 2);
    assert_eq!(machines[0]["id"], "vm-1");
    assert_eq!(machines[0]["state"], "unlocked");
}

#[test]
fn status_reports_detached_watcher() {
    let mut connection = IpcConnection::new(test_state());
    let response = call(&mut connection, r#"{"command":"status"}"#);

    assert_eq!(response["ok"], true);
    assert_eq!(response["data"]["ready"], false);
    assert_eq!(response["data"]["stats"]["cycles"], 0);
}

#[test]
fn open_then_close_round_trip() {
    let state = test_state();
    let mut connection = IpcConnection::new(Arc::clone(&state));

    let opened = call(
        &mut connection,
        r#"{"command":"open_session","machine":"vm-1","pid":55}"#,
    );
    assert_eq!(opened["ok"], true);
    assert_eq!(opened["data"]["machine"], "vm-1");
    assert_eq!(connection.held_machine(), Some(&ResourceId::from("vm-1")));
    assert_eq!(
        state.registry.machine(&ResourceId::from("vm-1")).unwrap().state,
        LockState::Locked
    );

    let closed = call(&mut connection, r#"{"command":"close_session"}"#);
    assert_eq!(closed["ok"], true);
    assert_eq!(closed["data"]["session_id"], opened["data"]["session_id"]);
    assert!(connection.held_machine().is_none());
    assert_eq!(
        state.registry.machine(&ResourceId::from("vm-1")).unwrap().state,
        LockState::Unlocked
    );
}

#[test]
fn one_session_per_connection() {
    let mut connection = IpcConnection::new(test_state());
    call(&mut connection, r#"{"command":"open_session","machine":"vm-1"}"#);

    let second = call(&mut connection, r#"{"command":"open_session","machine":"vm-2"}"#);
    assert_eq!(second["ok"], false);
    assert!(second["error"].as_str().unwrap().contains("already holds"));
}

#[test]
fn conflicting_open_is_reported() {
    let state = test_state();
    let mut first = IpcConnection::new(Arc::clone(&state));
    let mut second = IpcConnection::new(state);

    call(&mut first, r#"{"command":"open_session","machine":"vm-1"}"#);
    let response = call(&mut second, r#"{"command":"open_session","machine":"vm-1"}"#);

    assert_eq!(response["ok"], false);
    assert!(response["error"].as_str().unwrap().starts_with("conflict:"));
}

#[test]
fn open_during_spawn_without_pid_asks_to_retry() {
    let state = test_state();
    let vm = ResourceId::from("vm-1");
    state.registry.begin_spawn(&vm).unwrap();
    let mut connection = IpcConnection::new(Arc::clone(&state));

    let early = call(
        &mut connection,
        r#"{"command":"open_session","machine":"vm-1","pid":77}"#,
    );
    assert_eq!(early["ok"], false);
    assert_eq!(early["retry"], true);

    state.registry.set_spawn_pid(&vm, 77).unwrap();
    let opened = call(
        &mut connection,
        r#"{"command":"open_session","machine":"vm-1","pid":77}"#,
    );
    assert_eq!(opened["ok"], true);
    assert_eq!(state.registry.machine(&vm).unwrap().state, LockState::Locked);
}

#[test]
fn plain_conflict_is_not_retryable() {
    let state = test_state();
    let mut first = IpcConnection::new(Arc::clone(&state));
    let mut second = IpcConnection::new(state);

    call(&mut first, r#"{"command":"open_session","machine":"vm-2"}"#);
    let response = call(&mut second, r#"{"command":"open_session","machine":"vm-2"}"#);

    assert_eq!(response["ok"], false);
    assert!(response.get("retry").is_none());
}

#[test]
fn disconnect_abandons_held_session() {
    let state = test_state();
    let mut connection = IpcConnection::new(Arc::clone(&state));
    call(&mut connection, r#"{"command":"open_session","machine":"vm-2"}"#);

    let token = {
        use session_watcher::registry::{RegistryView, SessionRegistry};
        let view = state.registry.read();
        view.enumerate_open_sessions().remove(0).token
    };
    assert!(token.is_live());

    connection.disconnect();
    assert!(!token.is_live());
}

#[test]
fn malformed_and_unknown_requests_are_errors() {
    let mut connection = IpcConnection::new(test_state());

    let invalid = call(&mut connection, "not json");
    assert_eq!(invalid["ok"], false);
    assert!(invalid["error"].as_str().unwrap().starts_with("invalid json"));

    let unknown = call(&mut connection, r#"{"command":"reboot"}"#);
    assert!(unknown["error"].as_str().unwrap().contains("unknown command"));

    let missing = call(&mut connection, r#"{"command":"open_session"}"#);
    assert!(missing["error"].as_str().unwrap().contains("'machine'"));

    let close = call(&mut connection, r#"{"command":"close_session"}"#);
    assert!(close["error"].as_str().unwrap().contains("holds no session"));
}

#[test]
fn launch_without_launcher_is_rejected() {
    let mut connection = IpcConnection::new(test_state());
    let response = call(&mut connection, r#"{"command":"launch","machine":"vm-1"}"#);
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"], "no launcher configured");
}
