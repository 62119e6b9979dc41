use std::time::Duration;

use quill_lsp::LspError;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::{Behavior, FakeServer};

#[tokio::test]
async fn request_resolves_once_and_redelivery_is_ignored() {
    let (server, conn) = FakeServer::connect("fake", Behavior::default());
    let cancel = CancellationToken::new();

    let result = conn.request("custom/ping", None, &cancel, None).await.unwrap();
    assert!(result.is_null());
    let id = server.received()[0].id.clone().unwrap();

    // A duplicate response for an id that already resolved goes nowhere.
    server
        .send(json!({ "jsonrpc": "2.0", "id": id, "result": "late" }))
        .await;
    let again = conn.request("custom/ping", None, &cancel, None).await.unwrap();
    assert!(again.is_null());
    assert_eq!(conn.pending_requests().await, 0);
    assert!(conn.is_alive());
}

#[tokio::test]
async fn error_response_surfaces_code_and_method() {
    let behavior = Behavior::default().with_error("textDocument/hover", -32603, "internal");
    let (_server, conn) = FakeServer::connect("fake", behavior);

    let err = conn
        .request("textDocument/hover", Some(json!({})), &CancellationToken::new(), None)
        .await
        .unwrap_err();
    match err {
        LspError::Protocol { method, code, message } => {
            assert_eq!(method, "textDocument/hover");
            assert_eq!(code, -32603);
            assert_eq!(message, "internal");
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_sends_cancel_request_and_ignores_late_response() {
    let (server, conn) = FakeServer::connect("fake", Behavior::silent("slow/op"));
    let cancel = CancellationToken::new();

    let pending = {
        let conn = conn.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { conn.request("slow/op", None, &cancel, None).await })
    };
    server.wait_for("slow/op", 1).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("cancelled request released promptly")
        .unwrap();
    assert!(matches!(result, Err(LspError::Cancelled)));

    server.wait_for("$/cancelRequest", 1).await;
    let received = server.received();
    let request_id = received
        .iter()
        .find(|r| r.method == "slow/op")
        .and_then(|r| r.id.clone())
        .unwrap();
    let cancel_params = &received
        .iter()
        .find(|r| r.method == "$/cancelRequest")
        .unwrap()
        .params;
    assert_eq!(cancel_params["id"], request_id);

    server
        .send(json!({ "jsonrpc": "2.0", "id": request_id, "result": 42 }))
        .await;
    let next = conn
        .request("custom/ping", None, &CancellationToken::new(), None)
        .await;
    assert!(next.is_ok());
    assert_eq!(conn.pending_requests().await, 0);
}

#[tokio::test]
async fn timeout_rejects_and_cancels_on_server() {
    let (server, conn) = FakeServer::connect("fake", Behavior::silent("slow/op"));

    let err = conn
        .request(
            "slow/op",
            None,
            &CancellationToken::new(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    server.wait_for("$/cancelRequest", 1).await;
    assert_eq!(conn.pending_requests().await, 0);
}

#[tokio::test]
async fn already_cancelled_token_sends_nothing() {
    let (server, conn) = FakeServer::connect("fake", Behavior::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = conn.request("custom/ping", None, &cancel, None).await.unwrap_err();
    assert!(err.is_cancelled());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.count("custom/ping"), 0);
}

#[tokio::test]
async fn crash_rejects_every_pending_request() {
    let (server, conn) = FakeServer::connect("fake", Behavior::silent("slow/op"));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request("slow/op", None, &CancellationToken::new(), None)
                    .await
            })
        })
        .collect();
    server.wait_for("slow/op", 3).await;
    server.crash();

    for waiter in waiters {
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("pending request rejected after crash")
            .unwrap();
        assert!(
            matches!(result, Err(LspError::ConnectionClosed { .. })),
            "{result:?}"
        );
    }
    tokio::time::timeout(Duration::from_secs(1), conn.closed())
        .await
        .unwrap();
    assert!(!conn.is_alive());

    let after = conn
        .request("custom/ping", None, &CancellationToken::new(), None)
        .await;
    assert!(matches!(after, Err(LspError::ConnectionClosed { .. })));
}

#[tokio::test]
async fn handshake_records_capabilities() {
    let (server, conn) = FakeServer::connect_ready("fake", Behavior::formatting()).await;
    assert!(conn.supports_formatting());
    assert_eq!(server.methods()[..2], ["initialize", "initialized"]);

    let (_server, plain) = FakeServer::connect_ready("plain", Behavior::default()).await;
    assert!(!plain.supports_formatting());
}

#[tokio::test]
async fn handshake_error_is_reported_as_handshake() {
    let behavior = Behavior::default().with_error("initialize", -32002, "not ready");
    let (_server, conn) = FakeServer::connect("fake", behavior);
    let err = conn
        .initialize(None, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::Handshake { .. }), "{err:?}");
}

#[tokio::test]
async fn server_requests_get_answers() {
    let (server, _conn) = FakeServer::connect_ready("fake", Behavior::default()).await;

    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": 99,
            "method": "client/registerCapability",
            "params": { "registrations": [] }
        }))
        .await;
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": 100,
            "method": "custom/unknown",
            "params": {}
        }))
        .await;
    server.wait_for("<response>", 2).await;

    let responses: Vec<_> = server
        .received()
        .into_iter()
        .filter(|r| r.method == "<response>")
        .collect();
    let ids: Vec<_> = responses.iter().filter_map(|r| r.id.clone()).collect();
    assert!(ids.contains(&json!(99)));
    assert!(ids.contains(&json!(100)));
}

#[tokio::test]
async fn shutdown_sends_shutdown_then_exit() {
    let (server, conn) = FakeServer::connect_ready("fake", Behavior::default()).await;
    conn.shutdown().await;
    server.wait_for("exit", 1).await;

    let methods = server.methods();
    let shutdown = methods.iter().position(|m| m == "shutdown").unwrap();
    let exit = methods.iter().position(|m| m == "exit").unwrap();
    assert!(shutdown < exit);
    assert!(!conn.is_alive());

    // A second call is a no-op.
    conn.shutdown().await;
    assert_eq!(server.count("shutdown"), 1);
}
