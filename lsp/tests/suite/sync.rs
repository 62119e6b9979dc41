use futures_util::future::join_all;
use quill_lsp::SyncOutcome;
use tokio_util::sync::CancellationToken;

use crate::common::{Behavior, FakeServer, write_file};

#[tokio::test]
async fn concurrent_ensure_open_sends_one_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "src/main.rs", "fn main() {}\n");
    let (server, conn) = FakeServer::connect_ready("fake", Behavior::default()).await;
    let cancel = CancellationToken::new();

    let outcomes = join_all((0..5).map(|_| conn.ensure_open(&path, &cancel))).await;
    let opened = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(SyncOutcome::Opened)))
        .count();
    assert_eq!(opened, 1);
    server.wait_for("textDocument/didOpen", 1).await;
    assert_eq!(server.count("textDocument/didOpen"), 1);
    assert_eq!(conn.open_version(&path).await, Some(1));
    assert_eq!(conn.open_file_count().await, 1);
}

#[tokio::test]
async fn missing_file_is_not_opened() {
    let dir = tempfile::tempdir().unwrap();
    let (server, conn) = FakeServer::connect_ready("fake", Behavior::default()).await;

    let outcome = conn
        .ensure_open(&dir.path().join("gone.rs"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Skipped);
    assert_eq!(server.count("textDocument/didOpen"), 0);
}

#[tokio::test]
async fn concurrent_syncs_send_strictly_increasing_versions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lib.rs");
    let (server, conn) = FakeServer::connect_ready("fake", Behavior::default()).await;
    let cancel = CancellationToken::new();

    let contents: Vec<String> = (0..10).map(|i| format!("// revision {i}\n")).collect();
    let outcomes = join_all(
        contents
            .iter()
            .map(|content| conn.sync_content(&path, content, &cancel)),
    )
    .await;
    assert!(outcomes.iter().all(Result::is_ok));

    server.wait_for("textDocument/didChange", 9).await;
    let versions = server.versions();
    assert_eq!(versions[0], ("textDocument/didOpen".to_string(), 1));
    let numbers: Vec<i64> = versions.iter().map(|(_, v)| *v).collect();
    assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
    assert_eq!(conn.open_version(&path).await, Some(10));
}

#[tokio::test]
async fn save_requires_an_open_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.rs", "let x = 1;\n");
    let (server, conn) = FakeServer::connect_ready("fake", Behavior::default()).await;
    let cancel = CancellationToken::new();

    assert_eq!(
        conn.notify_saved(&path, &cancel).await.unwrap(),
        SyncOutcome::Skipped
    );
    conn.ensure_open(&path, &cancel).await.unwrap();
    assert_eq!(
        conn.notify_saved(&path, &cancel).await.unwrap(),
        SyncOutcome::Saved
    );
    server.wait_for("textDocument/didSave", 1).await;
    assert_eq!(server.count("textDocument/didSave"), 1);
}

#[tokio::test]
async fn refresh_treats_disk_as_source_of_truth() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.rs", "on disk\n");
    let (server, conn) = FakeServer::connect_ready("fake", Behavior::default()).await;
    let cancel = CancellationToken::new();

    conn.sync_content(&path, "in memory\n", &cancel).await.unwrap();
    let outcome = conn.refresh(&path, &cancel).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Changed { version: 2 });

    server.wait_for("textDocument/didSave", 1).await;
    let received = server.received();
    let change = received
        .iter()
        .rfind(|r| r.method == "textDocument/didChange")
        .unwrap();
    assert_eq!(change.params["contentChanges"][0]["text"], "on disk\n");
    let methods = server.methods();
    let change_at = methods.iter().rposition(|m| m == "textDocument/didChange").unwrap();
    let save_at = methods.iter().rposition(|m| m == "textDocument/didSave").unwrap();
    assert!(change_at < save_at);
}

#[tokio::test]
async fn cancelled_sync_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (server, conn) = FakeServer::connect_ready("fake", Behavior::default()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = conn
        .sync_content(&dir.path().join("a.rs"), "x", &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(server.count("textDocument/didOpen"), 0);
}
