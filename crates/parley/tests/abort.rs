//! Abort semantics: aborted calls never settle — they resolve to the
//! `None` sentinel, release their pending slot, and drop late replies.

mod common;

use std::time::Duration;

use common::{init_tracing, linked_pair, test_opts};
use parley::{DataFormat, TransportOptions};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn abort_by_key_takes_the_whole_group() {
    init_tracing();
    let (client, _server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    // Three slow calls under one abort key; replies come after ~1000ms.
    let mut joins = Vec::new();
    for _ in 0..3 {
        let conn = client.conn.clone();
        joins.push(tokio::spawn(async move {
            conn.call_api(
                "Slow",
                json!({}),
                TransportOptions::default().with_abort_key("K"),
            )
            .await
        }));
    }
    // Let the requests hit the wire before aborting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.conn.pending_count(), 3);
    assert_eq!(client.conn.abort_by_key("K"), 3);
    assert_eq!(client.conn.pending_count(), 0);

    for join in joins {
        assert_eq!(join.await.unwrap(), None);
    }

    // Late replies for the aborted sns arrive and are dropped.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(client.conn.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_signal_cancels_a_call() {
    init_tracing();
    let (client, _server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    let (abort_tx, abort_rx) = tokio::sync::oneshot::channel();
    let conn = client.conn.clone();
    let join = tokio::spawn(async move {
        conn.call_api(
            "Slow",
            json!({}),
            TransportOptions::default().with_abort_signal(abort_rx),
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    abort_tx.send(()).unwrap();

    assert_eq!(join.await.unwrap(), None);
    assert_eq!(client.conn.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_single_sn() {
    init_tracing();
    let (client, _server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;

    let conn = client.conn.clone();
    let join = tokio::spawn(async move {
        conn.call_api("Slow", json!({}), TransportOptions::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // First call of this connection gets sn 1.
    assert!(client.conn.abort(1));
    assert!(!client.conn.abort(1));
    assert_eq!(join.await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_call_api_flow_cancel_aborts() {
    init_tracing();
    let (client, _server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;
    client
        .flows
        .pre_call_api
        .push_fn(|item| async move {
            if item.api_name == "Echo" {
                Ok(None)
            } else {
                Ok(Some(item))
            }
        });

    let ret = client
        .conn
        .call_api("Echo", json!({}), TransportOptions::default())
        .await;
    assert_eq!(ret, None);
    assert_eq!(client.conn.pending_count(), 0);

    // Other APIs are untouched.
    let ret = client
        .conn
        .call_api("Fail", json!({}), TransportOptions::default())
        .await;
    assert!(matches!(ret, Some(Err(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_call_api_flow_can_answer_locally() {
    init_tracing();
    let (client, server) = linked_pair(
        DataFormat::Text,
        test_opts("client"),
        test_opts("server"),
    )
    .await;
    // Answer Echo from a middleware; the server must never see the call.
    server.handlers.remove("Echo");
    server
        .handlers
        .register_fn("Echo", |_call| async move { panic!("must not reach the server") });
    client.flows.pre_call_api.push_fn(|mut item| async move {
        item.ret = Some(Ok(json!({"cached": true})));
        Ok(Some(item))
    });

    let ret = client
        .conn
        .call_api("Echo", json!({}), TransportOptions::default())
        .await;
    assert_eq!(ret, Some(Ok(json!({"cached": true}))));
    assert_eq!(client.conn.pending_count(), 0);
}
