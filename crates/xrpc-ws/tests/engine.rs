//! End-to-end engine tests over in-memory duplex websockets.
//!
//! One side runs the engine (server mode or the full client); the other is
//! driven as a raw websocket peer so the wire frames themselves can be
//! asserted.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;

use xrpc_core::{CallContext, Frame, Handlers};
use xrpc_ws::{serve_conn, Backoff, Latch, Subscription, WsClient, WsConfig, WsError};

type Ws = WebSocketStream<DuplexStream>;

async fn ws_pair() -> (Ws, Ws) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    (client, server)
}

fn test_handlers() -> Arc<Handlers> {
    let mut handlers = Handlers::new();
    handlers
        .register("Svc", |ns| {
            ns.method("Echo", |_cx, (msg,): (String,)| async move {
                Ok::<_, Infallible>(msg)
            });
            ns.method("Wait", |cx: CallContext, (): ()| async move {
                cx.cancelled().await;
                Err::<Value, _>("wait cancelled")
            });
            ns.streaming("Tail", |_cx, (): ()| async move {
                Ok::<_, Infallible>(futures::stream::iter(["x"]))
            });
            ns.streaming("Hang", |_cx, (): ()| async move {
                Ok::<_, Infallible>(futures::stream::pending::<Value>())
            });
        })
        .unwrap();
    Arc::new(handlers)
}

/// Spawn the engine in server mode over one duplex end.
fn spawn_server(ws: Ws) -> tokio::task::JoinHandle<()> {
    tokio::spawn(serve_conn(
        ws,
        test_handlers(),
        WsConfig::default(),
        Latch::new(),
    ))
}

async fn send_json(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .expect("send frame");
}

async fn recv_frame(ws: &mut Ws) -> Frame {
    loop {
        let item = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame");
        match item {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).expect("decode frame")
            }
            Some(Ok(_)) => continue,
            other => panic!("unexpected websocket item: {:?}", other),
        }
    }
}

fn result_as<T: serde::de::DeserializeOwned>(frame: &Frame) -> T {
    serde_json::from_str(frame.result.as_ref().expect("result slot").get()).expect("decode result")
}

/// A factory that hands out pre-established connections, then fails.
fn queue_factory(
    conns: Vec<Ws>,
) -> impl FnMut() -> futures_util::future::BoxFuture<'static, Result<Ws, WsError>> + Send + 'static {
    use futures_util::FutureExt;
    let queue = Arc::new(Mutex::new(conns));
    move || {
        let queue = Arc::clone(&queue);
        async move {
            let mut queue = queue.lock().unwrap();
            if queue.is_empty() {
                Err(WsError::Connect("no more test connections".into()))
            } else {
                Ok(queue.remove(0))
            }
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_echo_call() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":1,"method":"Svc.Echo","params":["hi"]}"#,
    )
    .await;

    let frame = recv_frame(&mut peer).await;
    assert_eq!(frame.id, Some(1));
    assert!(frame.error.is_none());
    assert_eq!(result_as::<String>(&frame), "hi");
}

#[tokio::test]
async fn test_unknown_method() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":2,"method":"Svc.Nope","params":[]}"#,
    )
    .await;

    let frame = recv_frame(&mut peer).await;
    assert_eq!(frame.id, Some(2));
    let err = frame.error.unwrap();
    assert_eq!(err.code, -32601);
    assert_eq!(err.message, "method 'Svc.Nope' not found");
}

#[tokio::test]
async fn test_wrong_param_count() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":3,"method":"Svc.Echo","params":["a","b"]}"#,
    )
    .await;

    let frame = recv_frame(&mut peer).await;
    let err = frame.error.unwrap();
    assert_eq!(err.code, -32602);
    assert!(err.message.contains("wrong param count"));
}

#[tokio::test]
async fn test_streaming_wire_protocol() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":4,"method":"Svc.Tail","params":[]}"#,
    )
    .await;

    // The chanId response comes first, then each value, then the close.
    let response = recv_frame(&mut peer).await;
    assert_eq!(response.id, Some(4));
    let chan_id: u64 = result_as(&response);
    assert_eq!(chan_id, 1);

    let value = recv_frame(&mut peer).await;
    assert_eq!(value.method.as_deref(), Some("xrpc.ch.val"));
    assert_eq!(value.param(0).unwrap().decode::<u64>().unwrap(), chan_id);
    assert_eq!(
        value.param(1).unwrap().decode::<String>().unwrap(),
        "x".to_string()
    );

    let close = recv_frame(&mut peer).await;
    assert_eq!(close.method.as_deref(), Some("xrpc.ch.close"));
    assert_eq!(close.param(0).unwrap().decode::<u64>().unwrap(), chan_id);
}

#[tokio::test]
async fn test_chan_ids_increase_per_connection() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":1,"method":"Svc.Tail","params":[]}"#,
    )
    .await;
    // Drain the whole first stream before starting the next.
    let first: u64 = result_as(&recv_frame(&mut peer).await);
    recv_frame(&mut peer).await; // ch.val
    recv_frame(&mut peer).await; // ch.close

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":2,"method":"Svc.Tail","params":[]}"#,
    )
    .await;
    let second: u64 = result_as(&recv_frame(&mut peer).await);

    assert!(second > first);
}

#[tokio::test]
async fn test_remote_cancellation() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":5,"method":"Svc.Wait","params":[]}"#,
    )
    .await;
    // The router arms cancellation before spawning the dispatch, so an
    // immediately following cancel always finds the entry.
    send_json(&mut peer, r#"{"jsonrpc":"2.0","method":"xrpc.cancel","params":[5]}"#).await;

    let frame = recv_frame(&mut peer).await;
    assert_eq!(frame.id, Some(5));
    let err = frame.error.unwrap();
    assert_eq!(err.code, 1);
    assert_eq!(err.message, "wait cancelled");
}

#[tokio::test]
async fn test_duplicate_cancel_is_harmless() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":6,"method":"Svc.Wait","params":[]}"#,
    )
    .await;
    for _ in 0..3 {
        send_json(&mut peer, r#"{"jsonrpc":"2.0","method":"xrpc.cancel","params":[6]}"#).await;
    }

    let frame = recv_frame(&mut peer).await;
    assert_eq!(frame.id, Some(6));

    // The connection is still healthy afterwards.
    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":7,"method":"Svc.Echo","params":["still here"]}"#,
    )
    .await;
    let frame = recv_frame(&mut peer).await;
    assert_eq!(result_as::<String>(&frame), "still here");
}

#[tokio::test]
async fn test_notification_produces_no_reply() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    // A notification, even a failing one, must not produce a frame.
    send_json(&mut peer, r#"{"jsonrpc":"2.0","method":"Svc.Nope","params":[]}"#).await;
    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":9,"method":"Svc.Echo","params":["after"]}"#,
    )
    .await;

    let frame = recv_frame(&mut peer).await;
    assert_eq!(frame.id, Some(9));
    assert_eq!(result_as::<String>(&frame), "after");
}

#[tokio::test]
async fn test_server_answers_ping() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","method":"xrpc.ping","params":["2026-01-01T00:00:00Z"]}"#,
    )
    .await;

    let frame = recv_frame(&mut peer).await;
    assert_eq!(frame.method.as_deref(), Some("xrpc.pong"));
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_not_fatal() {
    let (mut peer, server) = ws_pair().await;
    let _server = spawn_server(server);

    send_json(&mut peer, "{not json").await;
    send_json(
        &mut peer,
        r#"{"jsonrpc":"2.0","id":10,"method":"Svc.Echo","params":["ok"]}"#,
    )
    .await;

    let frame = recv_frame(&mut peer).await;
    assert_eq!(frame.id, Some(10));
    assert_eq!(result_as::<String>(&frame), "ok");
}

#[tokio::test]
async fn test_client_call_roundtrip() {
    let (client_ws, server_ws) = ws_pair().await;
    spawn_server(server_ws);

    let client = WsClient::with_factory(
        queue_factory(vec![client_ws]),
        None,
        WsConfig::new().no_reconnect(true),
    )
    .await
    .unwrap();

    let result = client.call("Svc.Echo", vec![json!("hi")]).await.unwrap();
    assert_eq!(result, json!("hi"));
}

#[tokio::test]
async fn test_client_remote_error() {
    let (client_ws, server_ws) = ws_pair().await;
    spawn_server(server_ws);

    let client = WsClient::with_factory(
        queue_factory(vec![client_ws]),
        None,
        WsConfig::new().no_reconnect(true),
    )
    .await
    .unwrap();

    let err = client.call("Svc.Nope", vec![]).await.unwrap_err();
    match err {
        WsError::Rpc(e) => {
            assert_eq!(e.code, -32601);
            assert_eq!(e.message, "method 'Svc.Nope' not found");
        }
        other => panic!("expected rpc error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_subscribe() {
    let (client_ws, server_ws) = ws_pair().await;
    spawn_server(server_ws);

    let client = WsClient::with_factory(
        queue_factory(vec![client_ws]),
        None,
        WsConfig::new().no_reconnect(true),
    )
    .await
    .unwrap();

    let mut sub: Subscription = client.subscribe("Svc.Tail", vec![]).await.unwrap();
    assert_eq!(sub.next().await, Some(json!("x")));
    assert_eq!(sub.next().await, None);
}

#[tokio::test]
async fn test_disconnect_fails_inflight_exactly_once() {
    let (client_ws, server_ws) = ws_pair().await;

    let client = Arc::new(
        WsClient::with_factory(
            queue_factory(vec![client_ws]),
            None,
            WsConfig::new().no_reconnect(true),
        )
        .await
        .unwrap(),
    );

    // The peer never replies; the call stays in flight until the socket
    // drops.
    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.call("Svc.Wait", vec![]).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server_ws);

    let err = timeout(Duration::from_secs(5), call)
        .await
        .expect("call must resolve after disconnect")
        .unwrap()
        .unwrap_err();
    match err {
        WsError::Rpc(e) => {
            assert_eq!(e.code, 2);
            assert_eq!(e.message, "handler: websocket connection closed");
        }
        other => panic!("expected code-2 rpc error, got {:?}", other),
    }

    // With reconnection disabled the engine is terminally closed.
    timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("engine should close");
    let err = client.call("Svc.Echo", vec![json!("x")]).await.unwrap_err();
    assert!(matches!(err, WsError::Closed));
}

#[tokio::test]
async fn test_subscription_ends_on_connection_loss() {
    let (client_ws, server_ws) = ws_pair().await;
    let server = spawn_server(server_ws);

    let client = WsClient::with_factory(
        queue_factory(vec![client_ws]),
        None,
        WsConfig::new().no_reconnect(true),
    )
    .await
    .unwrap();

    let mut sub = client.subscribe("Svc.Hang", vec![]).await.unwrap();

    // Kill the server side while the stream is live.
    server.abort();

    let next = timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("subscription must observe the loss");
    assert_eq!(next, None);
}

#[tokio::test]
async fn test_client_reconnects_with_fresh_state() {
    let (client_ws_1, server_ws_1) = ws_pair().await;
    let (client_ws_2, server_ws_2) = ws_pair().await;
    let first_server = spawn_server(server_ws_1);
    spawn_server(server_ws_2);

    let client = WsClient::with_factory(
        queue_factory(vec![client_ws_1, client_ws_2]),
        None,
        WsConfig::new().reconnect_backoff(Backoff::new(Duration::from_millis(10))),
    )
    .await
    .unwrap();

    let result = client.call("Svc.Echo", vec![json!("one")]).await.unwrap();
    assert_eq!(result, json!("one"));

    // Drop the first connection out from under the client.
    first_server.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The call either rides the reconnected engine directly or waits in the
    // request queue until the new connection picks it up.
    let result = timeout(
        Duration::from_secs(5),
        client.call("Svc.Echo", vec![json!("two")]),
    )
    .await
    .expect("call after reconnect must resolve")
    .unwrap();
    assert_eq!(result, json!("two"));

    client.stop();
    timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("stop should close the engine");
}

#[tokio::test]
async fn test_client_emits_keepalive_pings() {
    let (client_ws, mut peer) = ws_pair().await;

    let _client = WsClient::with_factory(
        queue_factory(vec![client_ws]),
        None,
        WsConfig::new()
            .no_reconnect(true)
            .ping_interval(Duration::from_millis(50)),
    )
    .await
    .unwrap();

    let first = recv_frame(&mut peer).await;
    assert_eq!(first.method.as_deref(), Some("xrpc.ping"));
    // The payload is an RFC3339 timestamp.
    let stamp: String = first.param(0).unwrap().decode().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());

    let second = recv_frame(&mut peer).await;
    assert_eq!(second.method.as_deref(), Some("xrpc.ping"));
}
