//! Flow hooks, message subscriptions, proto desync reporting, and the
//! custom passthrough.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{endpoint, init_tracing, linked_pair, register_default_handlers, test_opts};
use parley::{
    DataFormat, ErrorKind, MemoryTransport, ServiceMap, Side, TransportOptions, WireData,
};
use pretty_assertions::assert_eq;
use regex::Regex;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn msg_roundtrip_and_once_semantics() {
    init_tracing();
    let (client, server) = linked_pair(
        DataFormat::Buffer,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    server.conn.listen_msg(
        "Chat",
        Arc::new(move |_, body| {
            seen2.lock().unwrap().push(body.clone());
            Ok(())
        }),
    );
    let once_hits = Arc::new(AtomicUsize::new(0));
    let once2 = once_hits.clone();
    server.conn.listen_msg_once(
        "Chat",
        Arc::new(move |_, _| {
            once2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    for i in 0..3 {
        client
            .conn
            .send_msg("Chat", json!({"line": i}), TransportOptions::default())
            .await
            .unwrap()
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![json!({"line": 0}), json!({"line": 1}), json!({"line": 2})]
    );
    assert_eq!(once_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn pattern_subscription_covers_matching_names() {
    init_tracing();
    let (client, server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let subscribed = server.conn.listen_msg_pattern(
        &Regex::new("^Room").unwrap(),
        Arc::new(move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    assert_eq!(subscribed, 2); // RoomJoin, RoomLeave

    for name in ["RoomJoin", "RoomLeave", "Chat"] {
        client
            .conn
            .send_msg(name, json!({}), TransportOptions::default())
            .await
            .unwrap()
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_send_msg_flow_cancel_sends_nothing() {
    init_tracing();
    let (client, server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    server.conn.listen_msg(
        "Chat",
        Arc::new(move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    client
        .flows
        .pre_send_msg
        .push_fn(|item| async move {
            if item.name == "Chat" {
                Ok(None)
            } else {
                Ok(Some(item))
            }
        });

    // Canceled send: the aborted sentinel, and no bytes on the wire.
    let ret = client
        .conn
        .send_msg("Chat", json!({"line": "censored"}), TransportOptions::default())
        .await;
    assert_eq!(ret, None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_recv_data_flow_can_swallow_frames() {
    init_tracing();
    let (client, server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    // The server swallows every inbound frame; calls from the client
    // never reach dispatch and time out.
    server
        .flows
        .pre_recv_data
        .push_fn(|_item| async move { Ok(None) });

    let err = client
        .conn
        .call_api(
            "Echo",
            json!({}),
            TransportOptions::default().with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Network);
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_recv_msg_flow_can_rewrite() {
    init_tracing();
    let (client, server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    server.flows.pre_recv_msg.push_fn(|mut item| async move {
        item.msg["redacted"] = json!(true);
        Ok(Some(item))
    });
    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    server.conn.listen_msg(
        "Chat",
        Arc::new(move |_, body| {
            *seen2.lock().unwrap() = Some(body.clone());
            Ok(())
        }),
    );

    client
        .conn
        .send_msg("Chat", json!({"line": "hello"}), TransportOptions::default())
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *seen.lock().unwrap(),
        Some(json!({"line": "hello", "redacted": true}))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_envelopes_reach_the_custom_handler() {
    init_tracing();
    let (client, server) = linked_pair(
        DataFormat::Buffer,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    let seen = Arc::new(Mutex::new(None));
    let seen2 = seen.clone();
    server
        .conn
        .set_custom_handler(Arc::new(move |_conn, body| {
            *seen2.lock().unwrap() = Some(body);
        }));

    client
        .conn
        .send_custom(json!({"op": "trace", "id": 42}), TransportOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *seen.lock().unwrap(),
        Some(json!({"op": "trace", "id": 42}))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn proto_desync_is_explained_on_decode_failure() {
    init_tracing();
    // Client and server carry different schema fingerprints; the server is
    // newer. The client's codec rejects the response body, and the error
    // the caller sees names both fingerprints and the newer side.
    let client_map = Arc::new(
        ServiceMap::builder()
            .add_api("Echo")
            .with_fingerprint("aaaa1111")
            .with_last_modified(1_000)
            .build()
            .unwrap(),
    );
    let server_map = Arc::new(
        ServiceMap::builder()
            .add_api("Echo")
            .with_fingerprint("bbbb2222")
            .with_last_modified(2_000)
            .build()
            .unwrap(),
    );

    let strict_codec = parley::JsonCodec::new();
    strict_codec.set_validator("Echo.res", Arc::new(|_| Err("unexpected shape".into())));

    let (client_tr, server_tr) = MemoryTransport::pair();
    let client = common::endpoint_with_codec(
        Side::Client,
        DataFormat::Text,
        test_opts("client"),
        client_map,
        client_tr,
        Arc::new(strict_codec),
    );
    let server = endpoint(
        Side::Server,
        DataFormat::Text,
        test_opts("server"),
        server_map,
        server_tr,
    );
    register_default_handlers(&server.handlers);
    server.conn.connect().await.unwrap();
    client.conn.connect().await.unwrap();

    let err = client
        .conn
        .call_api("Echo", json!({"text": "hi"}), TransportOptions::default())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Local);
    assert!(err.message.contains("aaaa1111"), "message: {}", err.message);
    assert!(err.message.contains("bbbb2222"), "message: {}", err.message);
    assert!(
        err.message.contains("remote side is newer"),
        "message: {}",
        err.message
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_frames_produce_a_global_error_report() {
    init_tracing();
    let (client, server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    // Inject a frame the server cannot even frame-decode; the server must
    // stay up and the client's pending calls must be untouched.
    server.conn.recv_data(WireData::Text("not json".into())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.conn.pending_count(), 0);
    assert_eq!(client.conn.pending_count(), 0);

    // The link still works afterwards.
    let ret = client
        .conn
        .call_api("Echo", json!({"still": "alive"}), TransportOptions::default())
        .await;
    assert_eq!(ret, Some(Ok(json!({"still": "alive"}))));
}
