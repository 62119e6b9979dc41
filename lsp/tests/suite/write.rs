use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quill_lsp::{
    BatchSpec, ConfigResolver, Diagnostic, DiagnosticSeverity, LinterAdapter, LinterFut, LspError,
    Range, ServerConfig, WriteOptions, WriteOutcome,
};
use tokio_util::sync::CancellationToken;

use crate::common::{
    Behavior, FakeConnector, fake_format, rust_server, session, session_with, settings, write_file,
};

const MESSY: &str = "fn main() {   \n    let bad = 1;  \n}\n";

/// Lints from disk; fails for any file named `broken.rs`.
struct FlakyLinter;

impl LinterAdapter for FlakyLinter {
    fn name(&self) -> &str {
        "flaky"
    }

    fn lint<'a>(&'a self, path: &'a Path, _cancel: &'a CancellationToken) -> LinterFut<'a, Vec<Diagnostic>> {
        Box::pin(async move {
            if path.ends_with("broken.rs") {
                return Err(LspError::Linter {
                    adapter: "flaky".to_string(),
                    message: "crashed on input".to_string(),
                });
            }
            Ok(vec![Diagnostic::new(
                DiagnosticSeverity::Hint,
                "checked",
                Range::line(0, 0, 1),
                "flaky",
            )])
        })
    }

    fn format<'a>(
        &'a self,
        _path: &'a Path,
        content: &'a str,
        _cancel: &'a CancellationToken,
    ) -> LinterFut<'a, String> {
        Box::pin(async move { Ok(content.to_string()) })
    }

    fn can_format(&self) -> bool {
        false
    }
}

/// Formats by upper-casing; asserts the unformatted text is already on disk.
struct ShoutFormatter;

impl LinterAdapter for ShoutFormatter {
    fn name(&self) -> &str {
        "shout"
    }

    fn lint<'a>(&'a self, _path: &'a Path, _cancel: &'a CancellationToken) -> LinterFut<'a, Vec<Diagnostic>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn format<'a>(
        &'a self,
        path: &'a Path,
        content: &'a str,
        _cancel: &'a CancellationToken,
    ) -> LinterFut<'a, String> {
        Box::pin(async move {
            let on_disk = tokio::fs::read_to_string(path).await.unwrap();
            assert_eq!(on_disk, content);
            Ok(content.to_uppercase())
        })
    }
}

fn written(outcome: WriteOutcome) -> quill_lsp::FileWriteReport {
    match outcome {
        WriteOutcome::Written(report) => report,
        other => panic!("expected a single write, got {other:?}"),
    }
}

#[tokio::test]
async fn write_formats_persists_and_diagnoses() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("src/main.rs");
    let connector = Arc::new(FakeConnector::new().with("rust", Behavior::formatting()));
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector.clone(),
    );

    let report = written(
        session
            .write(&path, MESSY, None, &CancellationToken::new())
            .await
            .unwrap(),
    );
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert_eq!(on_disk, fake_format(MESSY));
    assert!(report.formatted);
    assert_eq!(report.formatter.as_deref(), Some("rust"));
    assert_eq!(report.bytes_written, on_disk.len());
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let diagnostics = report.diagnostics.unwrap();
    assert_eq!(diagnostics.error_count(), 1);
    assert_eq!(diagnostics.servers, ["rust"]);

    // Formatted content was synced before the save notification.
    let server = connector.latest("rust");
    let received = server.received();
    let last_change = received
        .iter()
        .rposition(|r| r.method == "textDocument/didChange")
        .unwrap();
    assert_eq!(
        received[last_change].params["contentChanges"][0]["text"],
        fake_format(MESSY)
    );
    assert!(server.count("textDocument/didSave") >= 1);
}

#[tokio::test]
async fn disabled_steps_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.rs");
    let connector = Arc::new(FakeConnector::new().with("rust", Behavior::formatting()));
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector.clone(),
    );

    let options = WriteOptions {
        format: false,
        diagnostics: false,
    };
    let report = written(
        session
            .write_with(&path, MESSY, options, None, &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), MESSY);
    assert!(!report.formatted);
    assert!(report.diagnostics.is_none());
    assert_eq!(connector.latest("rust").count("textDocument/formatting"), 0);
}

#[tokio::test]
async fn write_without_servers_still_lands() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes/todo.md");
    let session = session(dir.path(), settings(vec![]), Arc::new(FakeConnector::new()));

    let report = written(
        session
            .write(&path, "- [ ] ship\n", None, &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "- [ ] ship\n");
    assert!(report.diagnostics.unwrap().has_no_servers());
}

#[tokio::test]
async fn cancelled_write_still_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.rs");
    let connector = Arc::new(FakeConnector::new().with("rust", Behavior::formatting()));
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector,
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = written(session.write(&path, MESSY, None, &cancel).await.unwrap());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), MESSY);
    assert!(report.cancelled);
    assert!(!report.deadline_expired);
    assert!(report.diagnostics.is_none());
}

#[tokio::test]
async fn deadline_abandons_formatting_but_not_the_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.rs");
    let behavior = Behavior {
        formatting: true,
        ..Behavior::silent("textDocument/formatting")
    };
    let connector = Arc::new(FakeConnector::new().with("rust", behavior));
    let mut settings = settings(vec![("rust", rust_server("fake-rust"))]);
    settings.write_deadline_ms = 200;
    let session = session(dir.path(), settings, connector.clone());

    let started = std::time::Instant::now();
    let report = written(
        session
            .write(&path, MESSY, None, &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), MESSY);
    assert!(report.deadline_expired);
    assert!(!report.cancelled);
    assert!(!report.formatted);
    assert!(report.diagnostics.is_none());

    connector
        .latest("rust")
        .wait_for("$/cancelRequest", 1)
        .await;
}

#[tokio::test]
async fn formatting_error_degrades_to_unformatted_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.rs");
    let behavior = Behavior::formatting().with_error("textDocument/formatting", -32603, "boom");
    let connector = Arc::new(FakeConnector::new().with("rust", behavior));
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector,
    );

    let report = written(
        session
            .write(&path, MESSY, None, &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), MESSY);
    assert!(!report.formatted);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("format failed"));
    assert_eq!(report.diagnostics.unwrap().error_count(), 1);
}

#[tokio::test]
async fn overlapping_format_edits_still_write_the_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.rs");
    let overlapping = serde_json::json!([
        {
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 10 } },
            "newText": ""
        },
        {
            "range": { "start": { "line": 0, "character": 5 }, "end": { "line": 0, "character": 8 } },
            "newText": ""
        }
    ]);
    let behavior = Behavior::formatting().with_format_edits(overlapping);
    let connector = Arc::new(FakeConnector::new().with("rust", behavior));
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector,
    );

    let report = written(
        session
            .write(&path, MESSY, None, &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), MESSY);
    assert!(!report.formatted);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("overlaps"), "{:?}", report.warnings);
    assert_eq!(report.diagnostics.unwrap().error_count(), 1);
}

#[tokio::test]
async fn linter_formatter_reads_unformatted_content_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    let mut servers = settings(vec![(
        "shout",
        ServerConfig::adapter("shout", &["txt"]).unwrap(),
    )]);
    servers.diagnostics_on_write = false;
    let resolver =
        ConfigResolver::new(dir.path(), &servers.servers).with_adapter("shout", Arc::new(ShoutFormatter));
    let session = session_with(dir.path(), servers, Arc::new(FakeConnector::new()), resolver);

    let report = written(
        session
            .write(&path, "quiet words\n", None, &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "QUIET WORDS\n");
    assert!(report.formatted);
    assert_eq!(report.formatter.as_deref(), Some("shout"));
}

#[tokio::test]
async fn format_file_rewrites_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.rs", MESSY);
    let connector = Arc::new(FakeConnector::new().with("rust", Behavior::formatting()));
    let session = session(
        dir.path(),
        settings(vec![("rust", rust_server("fake-rust"))]),
        connector,
    );

    let report = session
        .format_file(&path, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.formatted);
    assert!(report.diagnostics.is_none());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), fake_format(MESSY));
}

#[tokio::test]
async fn batch_of_three_survives_a_failure_on_the_second() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(vec![
        ("rust", rust_server("fake-rust")),
        ("flaky", ServerConfig::adapter("flaky", &["rs"]).unwrap()),
    ]);
    let resolver =
        ConfigResolver::new(dir.path(), &settings.servers).with_adapter("flaky", Arc::new(FlakyLinter));
    let connector = Arc::new(FakeConnector::new().with("rust", Behavior::formatting()));
    let session = session_with(dir.path(), settings, connector, resolver);
    let cancel = CancellationToken::new();

    let first = dir.path().join("first.rs");
    let broken = dir.path().join("broken.rs");
    let third = dir.path().join("third.rs");

    for path in [&first, &broken] {
        let outcome = session
            .write(path, MESSY, Some(BatchSpec::defer("edit-1")), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Deferred { .. }));
        assert!(!path.exists(), "deferred writes stay in memory");
    }

    let outcome = session
        .write(&third, MESSY, Some(BatchSpec::flush("edit-1")), &cancel)
        .await
        .unwrap();
    let WriteOutcome::Flushed(batch) = outcome else {
        panic!("expected a flushed batch, got {outcome:?}");
    };

    assert_eq!(batch.files.len(), 3);
    assert!(batch.failed.is_empty());
    assert!(batch.formatted_any);
    for path in [&first, &broken, &third] {
        assert_eq!(std::fs::read_to_string(path).unwrap(), fake_format(MESSY));
    }
    assert!(batch.files.iter().all(|f| f.formatted));

    let by_name = |name: &str| {
        batch
            .files
            .iter()
            .find(|f| f.path.ends_with(name))
            .and_then(|f| f.diagnostics.clone())
            .unwrap()
    };
    let broken_report = by_name("broken.rs");
    assert_eq!(broken_report.failures.len(), 1);
    assert_eq!(broken_report.failures[0].server, "flaky");
    assert_eq!(broken_report.servers, ["rust"]);
    assert_eq!(by_name("first.rs").servers, ["flaky", "rust"]);
    assert_eq!(by_name("third.rs").servers, ["flaky", "rust"]);

    assert!(batch.servers.contains("rust"));
    assert!(batch.servers.contains("flaky"));
    assert_eq!(batch.error_count(), 3);
    assert!(!batch.messages.is_empty());
}

#[tokio::test]
async fn later_write_to_same_path_replaces_the_queued_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.md");
    let mut settings = settings(vec![]);
    settings.diagnostics_on_write = false;
    let session = session(dir.path(), settings, Arc::new(FakeConnector::new()));
    let cancel = CancellationToken::new();

    session
        .write(&path, "one", Some(BatchSpec::defer("b")), &cancel)
        .await
        .unwrap();
    let outcome = session
        .write(&path, "two", Some(BatchSpec::defer("b")), &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, WriteOutcome::Deferred { queued: 1, .. }));

    let other = dir.path().join("b.md");
    let WriteOutcome::Flushed(batch) = session
        .write(&other, "three", Some(BatchSpec::flush("b")), &cancel)
        .await
        .unwrap()
    else {
        panic!("expected flush");
    };
    assert_eq!(batch.files.len(), 2);
    assert!(!batch.formatted_any);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    assert_eq!(std::fs::read_to_string(&other).unwrap(), "three");
}
