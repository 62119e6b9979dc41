use std::time::{Duration, Instant};

use quill_lsp::diagnostics::{diagnose_targets, wait_for_fresh};
use quill_lsp::{Applicable, DiagnosticSeverity};
use tokio_util::sync::CancellationToken;

use crate::common::{Behavior, FakeServer, eventually, file_uri, lsp_diagnostic, write_file};

fn quiet() -> Behavior {
    Behavior {
        publish: false,
        ..Behavior::default()
    }
}

#[tokio::test]
async fn stale_cache_is_never_fresh_before_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "a.rs", "let x = 1;\n");
    let uri = file_uri(&path);
    let (server, conn) = FakeServer::connect_ready("fake", quiet()).await;
    let cancel = CancellationToken::new();

    server.publish(&uri, vec![lsp_diagnostic(0, 1, "old", 3)]).await;
    eventually("first publish", || {
        let conn = conn.clone();
        let uri = uri.clone();
        async move { conn.cached_diagnostics(&uri).await.is_some() }
    })
    .await;
    let floor = conn.diagnostics_version();

    let started = Instant::now();
    let stale = wait_for_fresh(&conn, &uri, Duration::from_millis(200), Some(floor), &cancel)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    // Timeout hands back the best available list, stale or not.
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].message(), "old");

    let publisher = {
        let server = server.clone();
        let uri = uri.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            server.publish(&uri, vec![lsp_diagnostic(0, 2, "new", 3)]).await;
        })
    };
    let started = Instant::now();
    let fresh = wait_for_fresh(&conn, &uri, Duration::from_secs(3), Some(floor), &cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(fresh[0].message(), "new");
    publisher.await.unwrap();
}

#[tokio::test]
async fn publish_for_another_file_does_not_satisfy_the_wait() {
    let dir = tempfile::tempdir().unwrap();
    let a = file_uri(&write_file(dir.path(), "a.rs", ""));
    let b = file_uri(&write_file(dir.path(), "b.rs", ""));
    let (server, conn) = FakeServer::connect_ready("fake", quiet()).await;

    let floor = conn.diagnostics_version();
    server.publish(&b, vec![lsp_diagnostic(0, 1, "in b", 1)]).await;
    let items = wait_for_fresh(
        &conn,
        &a,
        Duration::from_millis(150),
        Some(floor),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn cancel_ends_the_wait() {
    let (_server, conn) = FakeServer::connect_ready("fake", quiet()).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });
    let err = wait_for_fresh(&conn, "file:///a.rs", Duration::from_secs(10), Some(0), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn two_servers_are_merged_deduplicated_and_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.rs", "ok\nlet bad = 1;\n");
    let (_a, conn_a) = FakeServer::connect_ready("alpha", Behavior::default()).await;
    let behavior = Behavior::default().with_diagnose(|uri, text| {
        let mut out = crate::common::flag_bad_lines(uri, text);
        out.push(lsp_diagnostic(0, 2, "unused", 2));
        out
    });
    let (_b, conn_b) = FakeServer::connect_ready("beta", behavior).await;

    let targets = [
        Applicable::Protocol {
            name: "alpha".to_string(),
            conn: conn_a,
        },
        Applicable::Protocol {
            name: "beta".to_string(),
            conn: conn_b,
        },
    ];
    let report = diagnose_targets(
        &path,
        &targets,
        Duration::from_secs(2),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.servers, ["alpha", "beta"]);
    assert_eq!(report.items.len(), 2);
    assert_eq!(report.items[0].severity(), DiagnosticSeverity::Error);
    assert_eq!(report.items[0].line(), 1);
    assert_eq!(report.items[1].message(), "unused");
    assert_eq!(report.error_count(), 1);
    assert!(report.summary().contains("1 error, 1 warning"));
}

#[tokio::test]
async fn failed_server_is_left_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.rs", "let bad = 1;\n");
    let (_a, healthy) = FakeServer::connect_ready("healthy", Behavior::default()).await;
    let (crashed_server, crashed) = FakeServer::connect_ready("crashed", Behavior::default()).await;
    crashed_server.crash();
    tokio::time::timeout(Duration::from_secs(1), crashed.closed())
        .await
        .unwrap();

    let targets = [
        Applicable::Protocol {
            name: "healthy".to_string(),
            conn: healthy,
        },
        Applicable::Protocol {
            name: "crashed".to_string(),
            conn: crashed,
        },
    ];
    let report = diagnose_targets(
        &path,
        &targets,
        Duration::from_secs(2),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.applicable, 2);
    assert_eq!(report.servers, ["healthy"]);
    assert_eq!(report.items.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].server, "crashed");
}

#[tokio::test]
async fn no_targets_is_a_no_servers_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.md");
    let report = diagnose_targets(
        &path,
        &[],
        Duration::from_secs(1),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(report.has_no_servers());
    assert!(report.summary().ends_with("no language servers"));
}
