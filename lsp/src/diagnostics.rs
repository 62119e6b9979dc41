//! Diagnostics engine: fresh-result waiting, fan-out, merge, and reporting.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::ServerConnection;
use crate::error::{LspError, Result};
use crate::linter::LinterAdapter;
use crate::protocol;
use crate::types::{Diagnostic, DiagnosticSeverity, Range};

/// Poll interval for [`wait_for_fresh`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Formatted messages kept per report; counts stay exact.
pub const MAX_MESSAGES: usize = 50;

/// A server that applies to a file, already connected.
#[derive(Clone)]
pub enum Applicable {
    Protocol {
        name: String,
        conn: Arc<ServerConnection>,
    },
    Linter {
        name: String,
        adapter: Arc<dyn LinterAdapter>,
    },
}

impl Applicable {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Protocol { name, .. } | Self::Linter { name, .. } => name,
        }
    }
}

impl fmt::Debug for Applicable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { name, conn } => f
                .debug_struct("Protocol")
                .field("name", name)
                .field("conn", conn)
                .finish(),
            Self::Linter { name, .. } => f
                .debug_struct("Linter")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// Wait until the cache for `uri` is newer than `min_version_exclusive`
/// (or, without a floor, until anything is cached), then return it.
///
/// Never waits past `timeout`: on expiry the best available cache is
/// returned, which may be stale or empty. A closed connection ends the wait
/// early the same way.
pub async fn wait_for_fresh(
    conn: &ServerConnection,
    uri: &str,
    timeout: Duration,
    min_version_exclusive: Option<u64>,
    cancel: &CancellationToken,
) -> Result<Vec<Diagnostic>> {
    let deadline = Instant::now() + timeout;
    loop {
        let cached = conn.cached_diagnostics(uri).await;
        let fresh = cached
            .as_ref()
            .is_some_and(|c| min_version_exclusive.is_none_or(|floor| c.stamp > floor));
        if fresh || !conn.is_alive() || Instant::now() >= deadline {
            if !fresh {
                tracing::debug!(server = %conn.name(), uri, "diagnostics wait ended without a fresh publish");
            }
            return Ok(cached.map(|c| c.items).unwrap_or_default());
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LspError::Cancelled),
            () = tokio::time::sleep_until(deadline.min(Instant::now() + POLL_INTERVAL)) => {}
        }
    }
}

/// A server whose contribution was dropped from a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFailure {
    pub server: String,
    pub message: String,
}

/// Merged diagnostics for one file.
#[derive(Debug, Clone)]
pub struct FileDiagnostics {
    pub path: PathBuf,
    /// Servers that applied to the file, whether or not they succeeded.
    pub applicable: usize,
    /// Servers whose results are included.
    pub servers: Vec<String>,
    /// Deduplicated and sorted, never truncated.
    pub items: Vec<Diagnostic>,
    /// Formatted lines for `items`, capped at [`MAX_MESSAGES`].
    pub messages: Vec<String>,
    pub failures: Vec<ServerFailure>,
}

impl FileDiagnostics {
    #[must_use]
    pub fn no_servers(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            applicable: 0,
            servers: Vec::new(),
            items: Vec::new(),
            messages: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Zero applicable servers, as opposed to zero diagnostics.
    #[must_use]
    pub fn has_no_servers(&self) -> bool {
        self.applicable == 0
    }

    #[must_use]
    pub fn count(&self, severity: DiagnosticSeverity) -> usize {
        self.items.iter().filter(|d| d.severity() == severity).count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn truncated(&self) -> bool {
        self.items.len() > self.messages.len()
    }

    /// One line: `path: 2 errors, 1 warning (rust, eslint)`.
    #[must_use]
    pub fn summary(&self) -> String {
        let path = self.path.display();
        if self.has_no_servers() {
            return format!("{path}: no language servers");
        }
        let servers = if self.servers.is_empty() {
            String::from("no server responded")
        } else {
            self.servers.join(", ")
        };
        if self.items.is_empty() {
            return format!("{path}: no issues ({servers})");
        }
        let errors = self.error_count();
        let warnings = self.count(DiagnosticSeverity::Warning);
        let other = self.items.len() - errors - warnings;
        let mut parts = vec![plural(errors, "error"), plural(warnings, "warning")];
        if other > 0 {
            parts.push(format!("{other} other"));
        }
        format!("{path}: {} ({servers})", parts.join(", "))
    }
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

impl fmt::Display for FileDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        for line in &self.messages {
            writeln!(f, "  {line}")?;
        }
        if self.truncated() {
            writeln!(
                f,
                "  ... {} more not shown",
                self.items.len() - self.messages.len()
            )?;
        }
        for failure in &self.failures {
            writeln!(f, "  [{}] failed: {}", failure.server, failure.message)?;
        }
        Ok(())
    }
}

/// Drop entries with the same range and message, keeping the first, then
/// order by severity and position.
#[must_use]
pub fn merge(diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    let mut seen: HashSet<(Range, String)> = HashSet::new();
    let mut merged: Vec<Diagnostic> = diagnostics
        .into_iter()
        .filter(|d| seen.insert((d.range(), d.message().to_string())))
        .collect();
    merged.sort_by(|a, b| {
        a.severity()
            .cmp(&b.severity())
            .then_with(|| a.range().start.cmp(&b.range().start))
    });
    merged
}

/// Build a report from per-server results, in server order.
pub(crate) fn assemble(
    path: &Path,
    results: Vec<(String, Result<Vec<Diagnostic>>)>,
) -> FileDiagnostics {
    let applicable = results.len();
    let mut servers = Vec::new();
    let mut failures = Vec::new();
    let mut all = Vec::new();
    for (server, result) in results {
        match result {
            Ok(items) => {
                servers.push(server);
                all.extend(items);
            }
            Err(e) => {
                tracing::debug!(server = %server, path = %path.display(), "diagnostics excluded: {e}");
                failures.push(ServerFailure {
                    server,
                    message: e.to_string(),
                });
            }
        }
    }
    let items = merge(all);
    let messages = items
        .iter()
        .take(MAX_MESSAGES)
        .map(|d| d.display_with_path(path))
        .collect();
    FileDiagnostics {
        path: path.to_path_buf(),
        applicable,
        servers,
        items,
        messages,
        failures,
    }
}

/// Diagnose one file against every applicable server concurrently.
///
/// Protocol servers get a disk refresh and then a wait for a publish newer
/// than their floor: the version in `floors` for that server if given,
/// otherwise the version seen just before the refresh. Linter adapters are
/// asked to lint directly. A failing server is left out; only cancellation
/// fails the whole call.
pub async fn diagnose_targets(
    path: &Path,
    targets: &[Applicable],
    timeout: Duration,
    floors: Option<&HashMap<String, u64>>,
    cancel: &CancellationToken,
) -> Result<FileDiagnostics> {
    if targets.is_empty() {
        return Ok(FileDiagnostics::no_servers(path));
    }

    let uri = protocol::path_to_file_uri(path)?.to_string();
    let tasks = targets.iter().map(|target| {
        let uri = uri.as_str();
        async move {
            let result = match target {
                Applicable::Protocol { name, conn } => {
                    let floor = floors
                        .and_then(|f| f.get(name).copied())
                        .unwrap_or_else(|| conn.diagnostics_version());
                    match conn.refresh(path, cancel).await {
                        Ok(_) => wait_for_fresh(conn, uri, timeout, Some(floor), cancel).await,
                        Err(e) => Err(e),
                    }
                }
                Applicable::Linter { adapter, .. } => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => Err(LspError::Cancelled),
                        result = tokio::time::timeout(timeout, adapter.lint(path, cancel)) => {
                            result.unwrap_or_else(|_| Err(LspError::Timeout {
                                method: "lint".to_string(),
                                elapsed: timeout,
                            }))
                        }
                    }
                }
            };
            (target.name().to_string(), result)
        }
    });
    let results = join_all(tasks).await;

    if cancel.is_cancelled() || results.iter().any(|(_, r)| matches!(r, Err(e) if e.is_cancelled())) {
        return Err(LspError::Cancelled);
    }
    Ok(assemble(path, results))
}

/// Diagnostics for every file a glob expanded to.
#[derive(Debug, Clone)]
pub struct GlobDiagnostics {
    pub pattern: String,
    pub files: Vec<FileDiagnostics>,
    /// Matches before the target cap.
    pub total_matches: usize,
    pub ignore_rules_applied: bool,
}

impl GlobDiagnostics {
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.total_matches > self.files.len()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.files.iter().map(FileDiagnostics::error_count).sum()
    }
}

impl fmt::Display for GlobDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.files.is_empty() {
            return writeln!(f, "no files match {}", self.pattern);
        }
        for file in &self.files {
            write!(f, "{file}")?;
        }
        if self.truncated() {
            writeln!(
                f,
                "showing {} of {} files matching {}",
                self.files.len(),
                self.total_matches,
                self.pattern
            )?;
        }
        Ok(())
    }
}
