use std::sync::Arc;
use std::time::Duration;

use quill_lsp::{ConnectionState, LspError, ServerConfig};
use tokio_util::sync::CancellationToken;

use crate::common::{
    Behavior, FakeConnector, eventually, rust_server, session, settings, write_file,
};

#[tokio::test]
async fn diagnose_file_through_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "src/main.rs", "fn main() {\n    bad();\n}\n");
    let connector = Arc::new(FakeConnector::new());
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector.clone(),
    );

    let report = session
        .diagnose_file(&path, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.servers, ["rust"]);
    assert_eq!(report.error_count(), 1);
    assert!(report.summary().contains("1 error"), "{}", report.summary());
    assert_eq!(report.messages.len(), 1);
    assert!(report.messages[0].ends_with("[fake] bad token"));
}

#[tokio::test]
async fn relative_paths_resolve_against_the_root() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "lib.rs", "let bad = 0;\n");
    let connector = Arc::new(FakeConnector::new());
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector,
    );

    let report = session
        .diagnose_file(std::path::Path::new("lib.rs"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.path, dir.path().join("lib.rs"));
    assert_eq!(report.error_count(), 1);
}

#[tokio::test]
async fn unhandled_file_type_has_no_servers() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "README.md", "# hi\n");
    let connector = Arc::new(FakeConnector::new());
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector.clone(),
    );

    let report = session
        .diagnose_file(&path, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.has_no_servers());
    assert!(connector.servers("rust").is_empty());
}

#[tokio::test]
async fn two_servers_for_one_file_share_nothing_and_merge() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.rs", "let bad = 1;\n");
    let connector = Arc::new(FakeConnector::new());
    let session = session(
        dir.path(),
        settings(vec![
            ("analyzer", rust_server("fake-analyzer")),
            ("checker", rust_server("fake-checker")),
        ]),
        connector.clone(),
    );

    let report = session
        .diagnose_file(&path, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.servers, ["analyzer", "checker"]);
    // Both publish the same diagnostic; the merge keeps one.
    assert_eq!(report.items.len(), 1);
    assert_eq!(connector.servers("analyzer").len(), 1);
    assert_eq!(connector.servers("checker").len(), 1);
}

#[tokio::test]
async fn concurrent_callers_reuse_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_file(dir.path(), "a.rs", "");
    let b = write_file(dir.path(), "b.rs", "");
    let connector = Arc::new(FakeConnector::new().with(
        "rust",
        Behavior {
            init_delay: Duration::from_millis(50),
            ..Behavior::default()
        },
    ));
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector.clone(),
    );
    let cancel = CancellationToken::new();

    let (ra, rb) = tokio::join!(session.ensure_open(&a, &cancel), session.ensure_open(&b, &cancel));
    assert_eq!(ra.unwrap(), 1);
    assert_eq!(rb.unwrap(), 1);
    assert_eq!(connector.servers("rust").len(), 1);

    let status = session.status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, ConnectionState::Ready);
    assert_eq!(status[0].open_files, 2);
    assert_eq!(status[0].file_types, ["rs"]);
}

#[tokio::test]
async fn crashed_server_is_replaced_on_next_use() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.rs", "let bad = 1;\n");
    let connector = Arc::new(FakeConnector::new());
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector.clone(),
    );
    let cancel = CancellationToken::new();

    session.diagnose_file(&path, &cancel).await.unwrap();
    connector.latest("rust").crash();
    eventually("crashed entry removed", || {
        let session = session.clone();
        async move { session.status().await.is_empty() }
    })
    .await;

    let report = session.diagnose_file(&path, &cancel).await.unwrap();
    assert_eq!(report.error_count(), 1);
    assert_eq!(connector.servers("rust").len(), 2);
}

#[tokio::test]
async fn slow_handshake_is_a_failure_not_a_hang() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.rs", "");
    let connector = Arc::new(FakeConnector::new().with(
        "rust",
        Behavior {
            init_delay: Duration::from_millis(500),
            ..Behavior::default()
        },
    ));
    let mut settings = settings(vec![("rust", rust_server("fake-rust"))]);
    settings.warmup_timeout_ms = 50;
    let session = session(dir.path(), settings, connector.clone());
    let cancel = CancellationToken::new();

    let report = session.diagnose_file(&path, &cancel).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].server, "rust");
    assert!(!report.has_no_servers());

    // The handshake finished in the background and is picked up later.
    eventually("handshake completes", || {
        let session = session.clone();
        async move {
            session
                .status()
                .await
                .first()
                .is_some_and(|s| s.state == ConnectionState::Ready)
        }
    })
    .await;
    assert_eq!(connector.servers("rust").len(), 1);
}

#[tokio::test]
async fn diagnose_glob_truncates_and_reports_total() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.rs", "b.rs", "nested/c.rs"] {
        write_file(dir.path(), name, "let bad = 1;\n");
    }
    write_file(dir.path(), "notes.md", "bad\n");
    let connector = Arc::new(FakeConnector::new());
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector,
    );

    let report = session
        .diagnose_glob("*.rs", Some(2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.total_matches, 3);
    assert_eq!(report.files.len(), 2);
    assert!(report.truncated());
    assert_eq!(report.error_count(), 2);
    assert!(report.files[0].path.ends_with("a.rs"));
    assert!(report.files[1].path.ends_with("b.rs"));
}

#[tokio::test]
async fn diagnose_glob_rejects_bad_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(FakeConnector::new());
    let session = session(dir.path(), settings(vec![]), connector);
    let err = session
        .diagnose_glob("src/[", None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::Glob { .. }));
}

#[tokio::test]
async fn shutdown_all_closes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_file(dir.path(), "a.rs", "");
    let b = write_file(dir.path(), "b.ts", "");
    let connector = Arc::new(FakeConnector::new());
    let session = session(
        dir.path(),
        settings(vec![
            ("rust", rust_server("fake-rust")),
            (
                "ts",
                ServerConfig::protocol("fake-ts", "typescript", &["ts"]).unwrap(),
            ),
        ]),
        connector.clone(),
    );
    let cancel = CancellationToken::new();
    session.ensure_open(&a, &cancel).await.unwrap();
    session.ensure_open(&b, &cancel).await.unwrap();
    assert_eq!(session.status().await.len(), 2);

    assert_eq!(session.shutdown_one("ts").await, 1);
    assert_eq!(session.status().await.len(), 1);
    assert_eq!(connector.latest("ts").count("shutdown"), 1);

    assert_eq!(session.shutdown_all().await, 1);
    assert!(session.status().await.is_empty());
    connector.latest("rust").wait_for("exit", 1).await;

    // After shutdown no new server is started; the failure is reported.
    let report = session.diagnose_file(&a, &cancel).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(connector.servers("rust").len(), 1);
}
