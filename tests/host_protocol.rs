//! End-to-end tests for the wallet host's message protocol.
//!
//! Each test connects an application port to a running [`RpcRouter`] and
//! drives it only through envelopes:
//! - CONNECT handshake acceptance and rejection
//! - PING / unknown types / malformed payloads
//! - PM_SET_CONFIG merging and fail-fast configuration errors
//! - register → sign-and-send with a digest-bound confirmation
//! - PM_CANCEL first-wins terminal semantics
//! - confirmation surface supersession

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use common::{APP_ORIGIN, Harness, MockChain, Script, ScriptedSurfaces, base_config, drain, environment, recv};
use passkey_host::channel::{ContextRef, MessageChannel};
use passkey_host::config::HostConfigPatch;
use passkey_host::host::{HostContext, RpcRouter, WindowMessage, launch};
use passkey_host::protocol::PROTOCOL_VERSION;

const ACCOUNT: &str = "alice.testnet";

fn transfer(receiver: &str, deposit: &str) -> Value {
    json!({
        "receiverId": receiver,
        "actions": [{ "type": "Transfer", "deposit": deposit }]
    })
}

fn steps(progress: &[Value]) -> Vec<String> {
    progress
        .iter()
        .filter_map(|p| p["step"].as_str().map(String::from))
        .collect()
}

async fn registered(script: Script) -> Harness {
    let harness = Harness::connect(script, base_config()).await;
    let reply = harness
        .call("PM_REGISTER", "reg", json!({ "nearAccountId": ACCOUNT }))
        .await;
    assert_eq!(reply["type"], "PM_RESULT", "registration failed: {reply}");
    harness
}

/// Wait until `request_id` reports it is waiting on the user.
async fn until_awaiting_confirmation(harness: &Harness, request_id: &str) {
    loop {
        let message = recv(&harness.app).await;
        if message["requestId"] == request_id
            && message["type"] == "PROGRESS"
            && message["payload"]["step"] == "awaiting-confirmation"
        {
            return;
        }
        assert!(
            !(message["requestId"] == request_id && message["type"] != "PROGRESS"),
            "request finished early: {message}"
        );
    }
}

#[tokio::test]
async fn handshake_announces_protocol_version() {
    let surfaces = ScriptedSurfaces::new(Script::Confirm);
    let chain = Arc::new(MockChain::default());
    let parent = ContextRef::new("app");
    let router = RpcRouter::new(HostContext::create(
        parent.clone(),
        base_config(),
        environment(&surfaces, &chain),
    ));

    let (app, host_side) = MessageChannel::new().into_ports();
    router
        .accept_window_message(
            WindowMessage::new(parent, APP_ORIGIN, json!({ "type": "CONNECT" })).with_port(host_side),
        )
        .unwrap();

    let ready = recv(&app).await;
    assert_eq!(ready, json!({ "type": "READY", "protocolVersion": PROTOCOL_VERSION }));
    assert_eq!(
        router.with_context(|c| c.parent_origin().map(String::from)),
        Some(APP_ORIGIN.to_string())
    );
}

#[tokio::test]
async fn handshake_rejects_foreign_source_and_opaque_origin() {
    let surfaces = ScriptedSurfaces::new(Script::Confirm);
    let chain = Arc::new(MockChain::default());
    let parent = ContextRef::new("app");
    let router = RpcRouter::new(HostContext::create(
        parent.clone(),
        base_config(),
        environment(&surfaces, &chain),
    ));

    let (app, host_side) = MessageChannel::new().into_ports();
    let impostor = ContextRef::new("app");
    assert!(
        router
            .accept_window_message(
                WindowMessage::new(impostor, APP_ORIGIN, json!({ "type": "CONNECT" }))
                    .with_port(host_side)
            )
            .is_err()
    );

    let (_app2, host_side2) = MessageChannel::new().into_ports();
    assert!(
        router
            .accept_window_message(
                WindowMessage::new(parent.clone(), "null", json!({ "type": "CONNECT" }))
                    .with_port(host_side2)
            )
            .is_err()
    );

    assert!(
        router
            .accept_window_message(WindowMessage::new(parent, APP_ORIGIN, json!({ "type": "CONNECT" })))
            .is_err()
    );

    assert!(router.with_context(|c| c.port().is_none()));
    assert!(drain(&app, Duration::from_millis(50)).await.is_empty());
}

#[tokio::test]
async fn launch_serves_the_window() {
    let surfaces = ScriptedSurfaces::new(Script::Confirm);
    let chain = Arc::new(MockChain::default());
    let parent = ContextRef::new("app");
    let (window, window_rx) = mpsc::unbounded_channel();
    let task = launch(parent.clone(), environment(&surfaces, &chain), window_rx).unwrap();

    let (app, host_side) = MessageChannel::new().into_ports();
    window
        .send(WindowMessage::new(parent, APP_ORIGIN, json!({ "type": "CONNECT" })).with_port(host_side))
        .unwrap();
    assert_eq!(recv(&app).await["type"], "READY");

    drop(window);
    task.await.unwrap();
    assert!(app.recv().await.is_none());
}

#[tokio::test]
async fn window_loop_ignores_non_connect_messages() {
    let surfaces = ScriptedSurfaces::new(Script::Confirm);
    let chain = Arc::new(MockChain::default());
    let parent = ContextRef::new("app");
    let router = RpcRouter::new(HostContext::create(
        parent.clone(),
        base_config(),
        environment(&surfaces, &chain),
    ));
    let (window, window_rx) = mpsc::unbounded_channel();
    let task = router.clone().spawn(window_rx);

    window
        .send(WindowMessage::new(parent, APP_ORIGIN, json!({ "type": "HELLO" })))
        .unwrap();
    drop(window);
    task.await.unwrap();
    assert!(router.with_context(|c| c.port().is_none()));
}

#[tokio::test]
async fn ping_pongs_and_unknown_types_are_ignored() {
    let harness = Harness::connect(Script::Confirm, base_config()).await;

    harness.send("PM_FUTURE_FEATURE", "u1", json!({}));
    harness.send("PING", "p1", Value::Null);

    let pong = recv(&harness.app).await;
    assert_eq!(pong, json!({ "type": "PONG", "requestId": "p1" }));
    assert!(!harness.router.is_finished("u1"));
}

#[tokio::test]
async fn malformed_payload_is_an_invalid_request() {
    let harness = Harness::connect(Script::Confirm, base_config()).await;

    let reply = harness.call("PM_LOGIN", "r1", json!({ "wrong": true })).await;
    assert_eq!(reply["type"], "ERROR");
    assert_eq!(reply["payload"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn configuration_is_required_and_merges_additively() {
    let harness = Harness::connect(Script::Confirm, HostConfigPatch::default()).await;

    let reply = harness.call("PM_GET_LOGIN_STATE", "r1", Value::Null).await;
    assert_eq!(reply["type"], "ERROR");
    assert_eq!(reply["payload"]["code"], "CONFIG_MISSING");

    let reply = harness
        .call(
            "PM_SET_CONFIG",
            "c1",
            json!({ "nearRpcUrl": "https://rpc.testnet.near.org", "contractId": "w3a-v1.testnet" }),
        )
        .await;
    assert_eq!(reply["type"], "PM_RESULT");

    let reply = harness
        .call("PM_SET_CONFIG", "c2", json!({ "workerPoolCapacity": 2 }))
        .await;
    assert_eq!(reply["type"], "PM_RESULT");

    let patch = harness.router.with_context(|c| c.patch().clone());
    assert_eq!(patch.near_rpc_url.as_deref(), Some("https://rpc.testnet.near.org"));
    assert_eq!(patch.contract_id.as_deref(), Some("w3a-v1.testnet"));
    assert_eq!(patch.worker_pool_capacity, Some(2));

    let reply = harness.call("PM_GET_LOGIN_STATE", "r2", Value::Null).await;
    assert_eq!(reply["type"], "PM_RESULT");
    assert_eq!(reply["payload"]["result"]["isLoggedIn"], false);

    let reply = harness
        .call("PM_SET_CONFIG", "c3", json!({ "workerPoolCapacity": 0 }))
        .await;
    assert_eq!(reply["payload"]["code"], "CONFIG_INVALID");
    let patch = harness.router.with_context(|c| c.patch().clone());
    assert_eq!(patch.worker_pool_capacity, Some(2));
}

#[tokio::test]
async fn theme_changes_are_broadcast() {
    let harness = Harness::connect(Script::Confirm, base_config()).await;

    harness.send("PM_SET_THEME", "t1", json!({ "theme": "light" }));
    let mut saw_broadcast = false;
    let mut saw_result = false;
    while !(saw_broadcast && saw_result) {
        let message = recv(&harness.app).await;
        match message["type"].as_str() {
            Some("PREFERENCES_CHANGED") => {
                assert_eq!(message["payload"]["theme"], "light");
                saw_broadcast = true;
            }
            Some("PM_RESULT") => {
                assert_eq!(message["requestId"], "t1");
                saw_result = true;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn register_then_sign_and_send() {
    let harness = registered(Script::Confirm).await;

    harness.send(
        "PM_SIGN_AND_SEND_TXS",
        "s1",
        json!({ "nearAccountId": ACCOUNT, "transactions": [transfer("bob.testnet", "1000")] }),
    );
    let (progress, terminal) = harness.until_terminal("s1").await;

    assert_eq!(terminal["type"], "PM_RESULT", "sign failed: {terminal}");
    assert_eq!(terminal["payload"]["ok"], true);
    let signed = &terminal["payload"]["result"]["transactions"][0];
    assert_eq!(signed["signerId"], ACCOUNT);
    assert_eq!(signed["receiverId"], "bob.testnet");
    assert_eq!(signed["nonce"], 1);

    let steps = steps(&progress);
    let confirm_at = steps.iter().position(|s| s == "awaiting-confirmation").unwrap();
    let sign_at = steps.iter().position(|s| s == "signing").unwrap();
    assert!(confirm_at < sign_at);

    let props = harness.surfaces.last_props.lock().clone().unwrap();
    assert!(props.intent_digest.is_some());
    assert_eq!(props.summary.len(), 1);
    assert_eq!(harness.chain.sent_count(), 1);

    let later: Vec<Value> = drain(&harness.app, Duration::from_millis(100))
        .await
        .into_iter()
        .filter(|m| m["requestId"] == "s1")
        .collect();
    assert!(later.is_empty(), "unexpected messages after terminal: {later:?}");

    let sessions = harness
        .router
        .with_context(|c| c.existing_client().map(|client| client.pool().session_count()));
    assert_eq!(sessions, Some(0));
}

#[tokio::test]
async fn declined_confirmation_is_cancelled_and_nothing_is_sent() {
    let harness = registered(Script::Cancel).await;

    let reply = harness
        .call(
            "PM_SIGN_AND_SEND_TXS",
            "s1",
            json!({ "nearAccountId": ACCOUNT, "transactions": [transfer("bob.testnet", "5")] }),
        )
        .await;
    assert_eq!(reply["type"], "ERROR");
    assert_eq!(reply["payload"]["code"], "CANCELLED");
    assert_eq!(reply["payload"]["message"], "user declined");
    assert_eq!(harness.chain.sent_count(), 0);
    assert_eq!(harness.surfaces.mounted(), 0);
}

#[tokio::test]
async fn cancel_emits_exactly_one_terminal() {
    let harness = registered(Script::Hold).await;

    harness.send(
        "PM_SIGN_AND_SEND_TXS",
        "r1",
        json!({ "nearAccountId": ACCOUNT, "transactions": [transfer("bob.testnet", "1")] }),
    );
    until_awaiting_confirmation(&harness, "r1").await;

    harness.send("PM_CANCEL", "c1", json!({ "requestId": "r1" }));
    let (_, terminal) = harness.until_terminal("r1").await;
    assert_eq!(terminal["type"], "ERROR");
    assert_eq!(terminal["payload"]["code"], "CANCELLED");

    let (_, ack) = harness.until_terminal("c1").await;
    assert_eq!(ack["type"], "PM_RESULT");
    assert_eq!(ack["payload"]["result"]["cancelled"], json!(["r1"]));

    let later: Vec<Value> = drain(&harness.app, Duration::from_millis(200))
        .await
        .into_iter()
        .filter(|m| m["requestId"] == "r1")
        .collect();
    assert!(later.is_empty(), "terminal emitted twice: {later:?}");
    assert!(harness.router.is_finished("r1"));
    assert_eq!(harness.router.inflight_count(), 0);
    assert_eq!(harness.surfaces.mounted(), 0);
    assert_eq!(harness.chain.sent_count(), 0);
}

#[tokio::test]
async fn newer_confirmation_supersedes_older_one() {
    let harness = registered(Script::Hold).await;

    harness.send(
        "PM_SIGN_AND_SEND_TXS",
        "r1",
        json!({ "nearAccountId": ACCOUNT, "transactions": [transfer("bob.testnet", "1")] }),
    );
    until_awaiting_confirmation(&harness, "r1").await;

    harness.send(
        "PM_SIGN_AND_SEND_TXS",
        "r2",
        json!({ "nearAccountId": ACCOUNT, "transactions": [transfer("carol.testnet", "2")] }),
    );
    let (_, first) = harness.until_terminal("r1").await;
    assert_eq!(first["type"], "ERROR");
    assert_eq!(first["payload"]["code"], "CANCELLED");

    harness.send("PM_CANCEL", "c1", Value::Null);
    let (_, second) = harness.until_terminal("r2").await;
    assert_eq!(second["payload"]["code"], "CANCELLED");

    assert_eq!(harness.surfaces.max_mounted(), 1);
    assert_eq!(harness.surfaces.total_mounts(), 2);
    assert_eq!(harness.chain.sent_count(), 0);
}

#[tokio::test]
async fn duplicate_request_ids_get_one_terminal() {
    let harness = registered(Script::Confirm).await;

    let reply = harness.call("PM_GET_LOGIN_STATE", "dup", Value::Null).await;
    assert_eq!(reply["payload"]["result"]["nearAccountId"], ACCOUNT);

    harness.send("PM_GET_LOGIN_STATE", "dup", Value::Null);
    let later = drain(&harness.app, Duration::from_millis(100)).await;
    assert!(later.iter().all(|m| m["requestId"] != "dup"));
}

#[tokio::test]
async fn cancelled_request_that_finishes_late_stays_silent() {
    const FLOOD: usize = 1100;
    let harness = Harness::connect(Script::Confirm, base_config()).await;
    let gate = Arc::new(Notify::new());
    *harness.chain.key_list_gate.lock() = Some(Arc::clone(&gate));

    harness.send("PM_VIEW_ACCESS_KEYS", "r1", json!({ "nearAccountId": ACCOUNT }));
    harness.send("PM_CANCEL", "c1", json!({ "requestId": "r1" }));
    let (_, terminal) = harness.until_terminal("r1").await;
    assert_eq!(terminal["payload"]["code"], "CANCELLED");

    // Push r1 out of the finished-id memory while its handler is still blocked.
    for i in 0..FLOOD {
        harness.send("PM_SET_THEME", &format!("t{i}"), json!({ "theme": "dark" }));
    }
    let mut finished = 0;
    while finished < FLOOD {
        let message = recv(&harness.app).await;
        assert_ne!(message["requestId"], "r1", "late envelope for r1: {message}");
        let is_theme = message["requestId"]
            .as_str()
            .is_some_and(|id| id.starts_with('t'));
        if is_theme && message["type"] == "PM_RESULT" {
            finished += 1;
        }
    }
    assert!(!harness.router.is_finished("r1"));

    // Still running, so the id is not free for reuse yet.
    harness.send("PM_GET_LOGIN_STATE", "r1", Value::Null);
    harness.send("PING", "p1", Value::Null);
    loop {
        let message = recv(&harness.app).await;
        assert_ne!(message["requestId"], "r1", "duplicate id was served: {message}");
        if message["type"] == "PONG" {
            break;
        }
    }
    assert_eq!(harness.router.inflight_count(), 1);

    gate.notify_one();
    let later: Vec<Value> = drain(&harness.app, Duration::from_millis(200))
        .await
        .into_iter()
        .filter(|m| m["requestId"] == "r1")
        .collect();
    assert!(later.is_empty(), "terminal emitted twice: {later:?}");
    assert_eq!(harness.router.inflight_count(), 0);
}
