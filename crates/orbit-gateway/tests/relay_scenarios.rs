#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end scenarios against a real `axum::serve` instance, driven over
//! real WebSocket connections. These mirror spec.md §8's literal scenarios
//! (S1-S6): the hub is only interesting once sockets, HTTP auth, and
//! storage are wired together the way they run in production.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use orbit_gateway::{AppState, RelayHub, build_gateway_app};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsTx = futures::stream::SplitSink<WsStream, WsMessage>;
type WsRx = futures::stream::SplitStream<WsStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server() -> SocketAddr {
    let pool = SqlitePool::connect("sqlite::memory:").await.expect("pool");
    orbit_storage::SqliteStorage::init(&pool).await.expect("init schema");
    let storage: Arc<dyn orbit_storage::Storage> = Arc::new(orbit_storage::SqliteStorage::new(pool));

    let config = Arc::new(orbit_config::OrbitConfig::default());
    let hub = RelayHub::new(storage, config.retention, Duration::from_millis(config.dispatch_timeout_ms));
    let state = AppState { hub, config };
    let app = build_gateway_app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    addr
}

/// Log a user in under `basic` auth mode, where the supplied name is the
/// user id directly. Returns the web session bearer token.
async fn login(client: &reqwest::Client, addr: SocketAddr, name: &str) -> String {
    let resp = client
        .post(format!("http://{addr}/auth/login/basic"))
        .json(&json!({ "name": name }))
        .send()
        .await
        .expect("login request");
    let body: Value = resp.json().await.expect("login body");
    body["token"].as_str().expect("token field").to_owned()
}

/// Run the device-code flow end to end and return a bearer token usable on
/// `/ws/anchor` — the same path a real anchor agent goes through.
async fn anchor_token(client: &reqwest::Client, addr: SocketAddr, web_token: &str) -> String {
    let start: Value = client
        .post(format!("http://{addr}/auth/device/code"))
        .send()
        .await
        .expect("device code start")
        .json()
        .await
        .expect("device code body");
    let device_code = start["deviceCode"].as_str().expect("deviceCode").to_owned();
    let user_code = start["userCode"].as_str().expect("userCode").to_owned();

    let authorised = client
        .post(format!("http://{addr}/auth/device/authorise"))
        .bearer_auth(web_token)
        .json(&json!({ "userCode": user_code }))
        .send()
        .await
        .expect("authorise request");
    assert!(authorised.status().is_success());

    let polled: Value = client
        .post(format!("http://{addr}/auth/device/token"))
        .json(&json!({ "deviceCode": device_code }))
        .send()
        .await
        .expect("device token request")
        .json()
        .await
        .expect("device token body");
    assert_eq!(polled["status"], json!("authorised"));
    polled["anchorAccessToken"].as_str().expect("anchorAccessToken").to_owned()
}

async fn ws_connect(addr: SocketAddr, path: &str, query: &str) -> (WsTx, WsRx) {
    let url = format!("ws://{addr}{path}?{query}");
    let (stream, _) = tokio_tungstenite::connect_async(&url).await.expect("ws connect");
    stream.split()
}

async fn send(tx: &mut WsTx, value: &Value) {
    tx.send(WsMessage::Text(value.to_string().into())).await.expect("ws send");
}

async fn recv(rx: &mut WsRx) -> Value {
    let msg = tokio::time::timeout(RECV_TIMEOUT, rx.next())
        .await
        .expect("recv timeout")
        .expect("stream closed")
        .expect("ws error");
    match msg {
        WsMessage::Text(text) => serde_json::from_str(&text).expect("valid json frame"),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Receive frames until one matches `predicate`, skipping ones that don't
/// (connection-lifecycle chatter like `orbit.hello` routinely precedes the
/// frame under test).
async fn recv_until(rx: &mut WsRx, predicate: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..16 {
        let frame = recv(rx).await;
        if predicate(&frame) {
            return frame;
        }
    }
    panic!("did not observe the expected frame within 16 messages");
}

// --- S1: basic client-anchor RPC -------------------------------------------

#[tokio::test]
async fn basic_client_anchor_rpc_round_trip() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let web_token = login(&http, addr, "u1").await;
    let anchor_access = anchor_token(&http, addr, &web_token).await;

    let (mut anchor_tx, mut anchor_rx) = ws_connect(addr, "/ws/anchor", &format!("token={anchor_access}")).await;
    recv(&mut anchor_rx).await; // orbit.hello

    send(&mut anchor_tx, &json!({"type": "anchor.hello", "anchorId": "anchor-one"})).await;

    let (mut client_tx, mut client_rx) =
        ws_connect(addr, "/ws/client", &format!("token={web_token}&clientId=c1")).await;
    recv(&mut client_rx).await; // orbit.hello

    send(
        &mut client_tx,
        &json!({"id": 900, "method": "thread/start", "params": {"cwd": ".", "anchorId": "anchor-one"}}),
    )
    .await;

    let forwarded = recv(&mut anchor_rx).await;
    assert_eq!(forwarded["id"], json!(900));
    assert_eq!(forwarded["method"], json!("thread/start"));

    send(&mut anchor_tx, &json!({"id": 900, "result": {"thread": {"id": "T"}}})).await;

    let reply = recv(&mut client_rx).await;
    assert_eq!(reply["result"]["thread"]["id"], json!("T"));
}

// --- S2: thread-binding mismatch --------------------------------------------

#[tokio::test]
async fn thread_anchor_mismatch_is_rejected() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let web_token = login(&http, addr, "u1").await;

    let anchor_one_token = anchor_token(&http, addr, &web_token).await;
    let (mut a1_tx, mut a1_rx) = ws_connect(addr, "/ws/anchor", &format!("token={anchor_one_token}")).await;
    recv(&mut a1_rx).await;
    send(&mut a1_tx, &json!({"type": "anchor.hello", "anchorId": "anchor-one"})).await;

    let anchor_two_token = anchor_token(&http, addr, &web_token).await;
    let (mut a2_tx, mut a2_rx) = ws_connect(addr, "/ws/anchor", &format!("token={anchor_two_token}")).await;
    recv(&mut a2_rx).await;
    send(&mut a2_tx, &json!({"type": "anchor.hello", "anchorId": "anchor-two"})).await;

    let (mut client_tx, mut client_rx) =
        ws_connect(addr, "/ws/client", &format!("token={web_token}&clientId=c1")).await;
    recv(&mut client_rx).await;
    recv(&mut client_rx).await; // orbit.anchor-connected for anchor-two

    send(
        &mut client_tx,
        &json!({"id": 900, "method": "thread/start", "params": {"threadId": "T", "anchorId": "anchor-one"}}),
    )
    .await;
    recv(&mut a1_rx).await; // the forwarded request

    send(
        &mut client_tx,
        &json!({"id": 902, "method": "turn/start", "params": {"threadId": "T", "anchorId": "anchor-two"}}),
    )
    .await;

    let error_frame = recv(&mut client_rx).await;
    assert_eq!(error_frame["id"], json!(902));
    assert_eq!(error_frame["error"]["data"]["code"], json!("thread_anchor_mismatch"));

    let nothing = tokio::time::timeout(Duration::from_millis(200), a2_rx.next()).await;
    assert!(nothing.is_err(), "anchor-two must not receive the mismatched request");
}

// --- S3: anchor replacement --------------------------------------------------

#[tokio::test]
async fn colliding_anchor_registration_replaces_and_announces() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let web_token = login(&http, addr, "u1").await;

    let (mut client_tx, mut client_rx) =
        ws_connect(addr, "/ws/client", &format!("token={web_token}&clientId=c1")).await;
    recv(&mut client_rx).await;
    let _ = &mut client_tx;

    let first_token = anchor_token(&http, addr, &web_token).await;
    let (mut first_tx, mut first_rx) = ws_connect(addr, "/ws/anchor", &format!("token={first_token}")).await;
    recv(&mut first_rx).await;
    send(&mut first_tx, &json!({"type": "anchor.hello", "anchorId": "X"})).await;
    recv_until(&mut client_rx, |f| f["type"] == "orbit.anchor-connected").await;

    let second_token = anchor_token(&http, addr, &web_token).await;
    let (mut second_tx, mut second_rx) = ws_connect(addr, "/ws/anchor", &format!("token={second_token}")).await;
    recv(&mut second_rx).await;
    send(&mut second_tx, &json!({"type": "anchor.hello", "anchorId": "X"})).await;

    let close = tokio::time::timeout(RECV_TIMEOUT, first_rx.next())
        .await
        .expect("timeout waiting for close")
        .expect("stream ended without a close frame");
    match close {
        Ok(WsMessage::Close(Some(frame))) => {
            assert_eq!(frame.code, tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal);
            assert_eq!(frame.reason, "Replaced by newer connection");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }

    let disconnected = recv_until(&mut client_rx, |f| f["type"] == "orbit.anchor-disconnected").await;
    assert_eq!(disconnected["anchorId"], json!("X"));
    let reconnected = recv_until(&mut client_rx, |f| f["type"] == "orbit.anchor-connected").await;
    assert_eq!(reconnected["anchorId"], json!("X"));

    // The replacement anchor must still be addressable as "X": the displaced
    // socket's teardown must not have clobbered the new binding.
    send(
        &mut client_tx,
        &json!({"id": 950, "method": "thread/start", "params": {"cwd": ".", "anchorId": "X"}}),
    )
    .await;
    let forwarded = recv(&mut second_rx).await;
    assert_eq!(forwarded["id"], json!(950));
}

// --- S4: replay ---------------------------------------------------------------

#[tokio::test]
async fn late_subscriber_gets_relay_state_and_replay() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let web_token = login(&http, addr, "u1").await;
    let anchor_access = anchor_token(&http, addr, &web_token).await;

    let (mut anchor_tx, mut anchor_rx) = ws_connect(addr, "/ws/anchor", &format!("token={anchor_access}")).await;
    recv(&mut anchor_rx).await;
    send(&mut anchor_tx, &json!({"type": "anchor.hello", "anchorId": "anchor-one"})).await;
    send(&mut anchor_tx, &json!({"type": "orbit.subscribe", "threadId": "R"})).await;
    recv(&mut anchor_rx).await; // orbit.subscribed

    send(
        &mut anchor_tx,
        &json!({"method": "turn/started", "params": {"threadId": "R", "turn": {"id": "t1", "status": "running"}}}),
    )
    .await;
    send(
        &mut anchor_tx,
        &json!({"method": "item/agentMessage/delta", "params": {"threadId": "R", "delta": "hi"}}),
    )
    .await;

    let (mut client_a_tx, mut client_a_rx) =
        ws_connect(addr, "/ws/client", &format!("token={web_token}&clientId=a")).await;
    recv(&mut client_a_rx).await;
    send(&mut client_a_tx, &json!({"type": "orbit.subscribe", "threadId": "R"})).await;
    recv(&mut client_a_rx).await; // orbit.subscribed
    recv(&mut client_a_rx).await; // orbit.relay-state
    recv(&mut client_a_rx).await; // turn/started
    recv(&mut client_a_rx).await; // item/agentMessage/delta
    drop(client_a_tx);
    drop(client_a_rx);

    let (mut client_b_tx, mut client_b_rx) =
        ws_connect(addr, "/ws/client", &format!("token={web_token}&clientId=b")).await;
    recv(&mut client_b_rx).await; // orbit.hello
    send(&mut client_b_tx, &json!({"type": "orbit.subscribe", "threadId": "R"})).await;

    let subscribed = recv(&mut client_b_rx).await;
    assert_eq!(subscribed["type"], json!("orbit.subscribed"));

    let relay_state = recv(&mut client_b_rx).await;
    assert_eq!(relay_state["type"], json!("orbit.relay-state"));
    assert_eq!(relay_state["boundAnchorId"], json!("anchor-one"));
    assert_eq!(relay_state["turn"]["id"], json!("t1"));
    assert!(relay_state["replayed"].as_u64().expect("replayed count") >= 2);

    let replay_one = recv(&mut client_b_rx).await;
    assert_eq!(replay_one["method"], json!("turn/started"));
    let replay_two = recv(&mut client_b_rx).await;
    assert_eq!(replay_two["method"], json!("item/agentMessage/delta"));
}

// --- S5: artifact capture and listing ----------------------------------------

#[tokio::test]
async fn completed_command_item_becomes_a_listed_artifact() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let web_token = login(&http, addr, "u1").await;
    let anchor_access = anchor_token(&http, addr, &web_token).await;

    let (mut anchor_tx, mut anchor_rx) = ws_connect(addr, "/ws/anchor", &format!("token={anchor_access}")).await;
    recv(&mut anchor_rx).await;
    send(&mut anchor_tx, &json!({"type": "anchor.hello", "anchorId": "anchor-one"})).await;

    send(
        &mut anchor_tx,
        &json!({
            "method": "item/completed",
            "params": {
                "threadId": "A",
                "item": {"type": "commandExecution", "id": "cmd-1", "command": "echo hi", "exitCode": 0},
            },
        }),
    )
    .await;

    // Give the capture step (an async storage write) a moment to land before
    // listing over REST.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let resp: Value = http
        .get(format!("http://{addr}/relay/artifacts?threadId=A"))
        .bearer_auth(&web_token)
        .send()
        .await
        .expect("artifacts request")
        .json()
        .await
        .expect("artifacts body");

    let artifacts = resp["artifacts"].as_array().expect("artifacts array");
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0]["artifactType"], json!("command"));
    assert_eq!(artifacts[0]["itemId"], json!("cmd-1"));
    assert_eq!(artifacts[0]["summary"], json!("echo hi (exit=0)"));
}

// --- S6: multi-dispatch aggregate --------------------------------------------

#[tokio::test]
async fn multi_dispatch_aggregates_results_in_order() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();
    let web_token = login(&http, addr, "u1").await;

    let token_a = anchor_token(&http, addr, &web_token).await;
    let (mut a_tx, mut a_rx) = ws_connect(addr, "/ws/anchor", &format!("token={token_a}")).await;
    recv(&mut a_rx).await;
    send(&mut a_tx, &json!({"type": "anchor.hello", "anchorId": "a"})).await;

    let token_b = anchor_token(&http, addr, &web_token).await;
    let (mut b_tx, mut b_rx) = ws_connect(addr, "/ws/anchor", &format!("token={token_b}")).await;
    recv(&mut b_rx).await;
    send(&mut b_tx, &json!({"type": "anchor.hello", "anchorId": "b"})).await;

    let (mut client_tx, mut client_rx) =
        ws_connect(addr, "/ws/client", &format!("token={web_token}&clientId=c1")).await;
    recv(&mut client_rx).await;
    recv(&mut client_rx).await; // orbit.anchor-connected for b

    send(
        &mut client_tx,
        &json!({
            "type": "orbit.multi-dispatch",
            "requestId": "md-1",
            "anchorIds": ["a", "b"],
            "request": {"id": 77, "method": "anchor.echo", "params": {"value": "ping"}},
        }),
    )
    .await;

    let req_a = recv(&mut a_rx).await;
    assert_eq!(req_a["method"], json!("anchor.echo"));
    send(&mut a_tx, &json!({"id": req_a["id"], "result": {"value": "pong-a"}})).await;

    let req_b = recv(&mut b_rx).await;
    send(&mut b_tx, &json!({"id": req_b["id"], "result": {"value": "pong-b"}})).await;

    let result = recv(&mut client_rx).await;
    assert_eq!(result["type"], json!("orbit.multi-dispatch.result"));
    assert_eq!(result["requestId"], json!("md-1"));
    let results = result["results"].as_array().expect("results array");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["anchorId"], json!("a"));
    assert_eq!(results[0]["ok"], json!(true));
    assert_eq!(results[1]["anchorId"], json!("b"));
    assert_eq!(results[1]["ok"], json!(true));
}

// --- S7: cross-user isolation -------------------------------------------------

#[tokio::test]
async fn anchors_are_scoped_to_their_owning_user() {
    let addr = spawn_server().await;
    let http = reqwest::Client::new();

    let u1_token = login(&http, addr, "u1").await;
    let u1_anchor_token = anchor_token(&http, addr, &u1_token).await;
    let (mut u1_anchor_tx, mut u1_anchor_rx) =
        ws_connect(addr, "/ws/anchor", &format!("token={u1_anchor_token}")).await;
    recv(&mut u1_anchor_rx).await;
    send(&mut u1_anchor_tx, &json!({"type": "anchor.hello", "anchorId": "shared"})).await;

    let u2_token = login(&http, addr, "u2").await;
    let u2_anchor_token = anchor_token(&http, addr, &u2_token).await;
    let (mut u2_anchor_tx, mut u2_anchor_rx) =
        ws_connect(addr, "/ws/anchor", &format!("token={u2_anchor_token}")).await;
    recv(&mut u2_anchor_rx).await;
    send(&mut u2_anchor_tx, &json!({"type": "anchor.hello", "anchorId": "shared"})).await;

    let (mut u1_client_tx, mut u1_client_rx) =
        ws_connect(addr, "/ws/client", &format!("token={u1_token}&clientId=c1")).await;
    recv(&mut u1_client_rx).await;

    send(
        &mut u1_client_tx,
        &json!({"id": 1, "method": "ping.anchor", "params": {"anchorId": "shared"}}),
    )
    .await;

    let forwarded = recv(&mut u1_anchor_rx).await;
    assert_eq!(forwarded["id"], json!(1));

    let nothing = tokio::time::timeout(Duration::from_millis(200), u2_anchor_rx.next()).await;
    assert!(nothing.is_err(), "u2's anchor must never see u1's traffic");

    send(&mut u1_client_tx, &json!({"type": "orbit.list-anchors"})).await;
    let anchors = recv(&mut u1_client_rx).await;
    let list = anchors["anchors"].as_array().expect("anchors array");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["anchorId"], json!("shared"));
}
