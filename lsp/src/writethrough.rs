//! Format-on-write pipeline: sync, format, persist, save, diagnose.
//!
//! Every step but the disk write degrades on failure. The write always lands,
//! even when the caller cancels or the pipeline deadline expires first; only
//! the formatting and diagnostics results are given up in that case.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use quill_types::LspSettings;

use crate::connection::ServerConnection;
use crate::diagnostics::{self, Applicable, FileDiagnostics, ServerFailure};
use crate::error::{LspError, Result};
use crate::linter::LinterAdapter;
use crate::protocol::{self, TextEdit};
use crate::session::{LspSession, protocol_connections, with_connect_failures};

const FORMATTING: &str = "textDocument/formatting";

/// Which optional steps run for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub format: bool,
    pub diagnostics: bool,
}

impl WriteOptions {
    #[must_use]
    pub fn from_settings(settings: &LspSettings) -> Self {
        Self {
            format: settings.format_on_write,
            diagnostics: settings.diagnostics_on_write,
        }
    }
}

/// Tags a write as part of a batch. Only a `flush` call runs the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSpec {
    pub id: String,
    pub flush: bool,
}

impl BatchSpec {
    #[must_use]
    pub fn defer(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flush: false,
        }
    }

    #[must_use]
    pub fn flush(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flush: true,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BatchEntry {
    path: PathBuf,
    content: String,
    options: WriteOptions,
}

/// Result of running the pipeline for one file.
#[derive(Debug, Clone, Default)]
pub struct FileWriteReport {
    pub path: PathBuf,
    pub bytes_written: usize,
    /// Formatting changed the content that was written.
    pub formatted: bool,
    /// Server or adapter that produced the formatting.
    pub formatter: Option<String>,
    /// `None` when diagnostics were disabled, abandoned, or failed.
    pub diagnostics: Option<FileDiagnostics>,
    pub cancelled: bool,
    pub deadline_expired: bool,
    /// Steps that degraded, in order.
    pub warnings: Vec<String>,
}

impl FileWriteReport {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ..Self::default()
        }
    }
}

impl fmt::Display for FileWriteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wrote {} ({} bytes)", self.path.display(), self.bytes_written)?;
        if let Some(formatter) = self.formatter.as_deref().filter(|_| self.formatted) {
            write!(f, ", formatted by {formatter}")?;
        }
        if self.cancelled {
            write!(f, ", cancelled")?;
        } else if self.deadline_expired {
            write!(f, ", deadline expired")?;
        }
        writeln!(f)?;
        for warning in &self.warnings {
            writeln!(f, "  warning: {warning}")?;
        }
        if let Some(diagnostics) = &self.diagnostics {
            write!(f, "{diagnostics}")?;
        }
        Ok(())
    }
}

/// A file in a flushed batch whose disk write failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Aggregate over every file a batch flush wrote.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub id: String,
    pub files: Vec<FileWriteReport>,
    pub failed: Vec<BatchFailure>,
    /// Every server that reported diagnostics or formatted a file.
    pub servers: BTreeSet<String>,
    pub messages: Vec<String>,
    pub formatted_any: bool,
}

impl BatchReport {
    fn new(id: String, results: Vec<(PathBuf, Result<FileWriteReport>)>) -> Self {
        let mut report = Self {
            id,
            ..Self::default()
        };
        for (path, result) in results {
            match result {
                Ok(file) => {
                    report.formatted_any |= file.formatted;
                    if let Some(formatter) = file.formatter.as_ref().filter(|_| file.formatted) {
                        report.servers.insert(formatter.clone());
                    }
                    if let Some(diagnostics) = &file.diagnostics {
                        report.servers.extend(diagnostics.servers.iter().cloned());
                        report.messages.extend(diagnostics.messages.iter().cloned());
                    }
                    report.files.push(file);
                }
                Err(e) => report.failed.push(BatchFailure {
                    path,
                    message: e.to_string(),
                }),
            }
        }
        report
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.files
            .iter()
            .filter_map(|f| f.diagnostics.as_ref())
            .map(FileDiagnostics::error_count)
            .sum()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for file in &self.files {
            write!(f, "{file}")?;
        }
        for failure in &self.failed {
            writeln!(f, "failed to write {}: {}", failure.path.display(), failure.message)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Written(FileWriteReport),
    /// Queued under a batch id; nothing touched disk yet.
    Deferred { batch_id: String, queued: usize },
    Flushed(BatchReport),
}

impl LspSession {
    /// Write `content` to `path` with the configured format and diagnostics
    /// behavior.
    pub async fn write(
        &self,
        path: &Path,
        content: impl Into<String>,
        batch: Option<BatchSpec>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome> {
        let options = WriteOptions::from_settings(self.settings());
        self.write_with(path, content, options, batch, cancel).await
    }

    pub async fn write_with(
        &self,
        path: &Path,
        content: impl Into<String>,
        options: WriteOptions,
        batch: Option<BatchSpec>,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome> {
        let entry = BatchEntry {
            path: self.absolute(path),
            content: content.into(),
            options,
        };
        let Some(batch) = batch else {
            let timeout = self.settings().diagnostics_timeout();
            let report = self.writethrough(&entry, timeout, cancel).await?;
            return Ok(WriteOutcome::Written(report));
        };

        let entries = {
            let mut batches = self.batches.lock().await;
            let queued = batches.entry(batch.id.clone()).or_default();
            match queued.iter_mut().find(|queued| queued.path == entry.path) {
                Some(existing) => *existing = entry,
                None => queued.push(entry),
            }
            if !batch.flush {
                let queued = queued.len();
                tracing::debug!(batch = %batch.id, queued, "write deferred");
                return Ok(WriteOutcome::Deferred {
                    batch_id: batch.id,
                    queued,
                });
            }
            batches.remove(&batch.id).unwrap_or_default()
        };
        Ok(WriteOutcome::Flushed(self.flush_batch(batch.id, entries, cancel).await))
    }

    /// Format `path` in place without collecting diagnostics.
    pub async fn format_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<FileWriteReport> {
        let path = self.absolute(path);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| LspError::io(&path, &e))?;
        let entry = BatchEntry {
            path,
            content,
            options: WriteOptions {
                format: true,
                diagnostics: false,
            },
        };
        self.writethrough(&entry, self.settings().diagnostics_timeout(), cancel)
            .await
    }

    async fn flush_batch(
        &self,
        id: String,
        entries: Vec<BatchEntry>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let timeout = if entries.len() > 1 {
            self.settings().batch_diagnostics_timeout()
        } else {
            self.settings().diagnostics_timeout()
        };
        tracing::info!(batch = %id, files = entries.len(), "flushing write batch");
        let results = join_all(entries.iter().map(|entry| async move {
            (entry.path.clone(), self.writethrough(entry, timeout, cancel).await)
        }))
        .await;
        BatchReport::new(id, results)
    }

    /// Run the whole pipeline for one file under the write deadline.
    async fn writethrough(
        &self,
        entry: &BatchEntry,
        diagnostics_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FileWriteReport> {
        // Deadline expiry cancels the child token; outer cancellation does too.
        let token = cancel.child_token();
        let deadline = {
            let token = token.clone();
            let limit = self.settings().write_deadline();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        };
        let result = self
            .run_pipeline(entry, diagnostics_timeout, &token)
            .await;
        deadline.abort();

        let mut report = result?;
        if token.is_cancelled() {
            report.cancelled = cancel.is_cancelled();
            report.deadline_expired = !report.cancelled;
            report.diagnostics = None;
        }
        Ok(report)
    }

    async fn run_pipeline(
        &self,
        entry: &BatchEntry,
        diagnostics_timeout: Duration,
        token: &CancellationToken,
    ) -> Result<FileWriteReport> {
        let path = entry.path.as_path();
        let mut report = FileWriteReport::new(path);

        let (targets, connect_failures) = match self.applicable(path, token).await {
            Ok(found) => found,
            // Only cancellation fails here; the write still has to land.
            Err(_) => (Vec::new(), Vec::new()),
        };
        let conns = protocol_connections(&targets);

        let floors: HashMap<String, u64> = targets
            .iter()
            .filter_map(|t| match t {
                Applicable::Protocol { name, conn } => {
                    Some((name.clone(), conn.diagnostics_version()))
                }
                Applicable::Linter { .. } => None,
            })
            .collect();

        let linter_formatter = targets.iter().find_map(|t| match t {
            Applicable::Linter { name, adapter } if entry.options.format && adapter.can_format() => {
                Some((name.as_str(), adapter))
            }
            _ => None,
        });

        let content = match linter_formatter {
            Some((name, adapter)) => {
                let formatted =
                    format_with_linter(name, adapter.as_ref(), entry, token, &mut report).await?;
                sync_all(&conns, path, &formatted, token, &mut report).await;
                formatted
            }
            None => {
                sync_all(&conns, path, &entry.content, token, &mut report).await;
                let mut content = entry.content.clone();
                if entry.options.format
                    && let Some(formatted) =
                        format_with_server(&conns, path, &content, token, &mut report).await
                {
                    sync_all(&conns, path, &formatted, token, &mut report).await;
                    content = formatted;
                }
                content
            }
        };

        persist(path, &content).await?;
        report.bytes_written = content.len();

        if !token.is_cancelled() {
            for (conn, result) in conns
                .iter()
                .zip(join_all(conns.iter().map(|c| c.notify_saved(path, token))).await)
            {
                if let Err(e) = result {
                    degrade(&mut report, conn.name(), "save notification", &e);
                }
            }
        }

        if entry.options.diagnostics && !token.is_cancelled() {
            match diagnostics::diagnose_targets(path, &targets, diagnostics_timeout, Some(&floors), token)
                .await
            {
                Ok(found) => report.diagnostics = Some(with_connect_failures(found, connect_failures)),
                Err(e) if e.is_cancelled() => {}
                Err(e) => report.warnings.push(format!("diagnostics failed: {e}")),
            }
        } else if !connect_failures.is_empty() {
            report.warnings.extend(
                connect_failures
                    .into_iter()
                    .map(|ServerFailure { server, message }| format!("{server}: {message}")),
            );
        }

        Ok(report)
    }
}

/// Linters read from disk, so the unformatted content is written first.
async fn format_with_linter(
    name: &str,
    adapter: &dyn LinterAdapter,
    entry: &BatchEntry,
    token: &CancellationToken,
    report: &mut FileWriteReport,
) -> Result<String> {
    persist(&entry.path, &entry.content).await?;
    if token.is_cancelled() {
        return Ok(entry.content.clone());
    }
    match adapter.format(&entry.path, &entry.content, token).await {
        Ok(formatted) => {
            if formatted != entry.content {
                report.formatted = true;
                report.formatter = Some(name.to_string());
            }
            Ok(formatted)
        }
        Err(e) => {
            degrade(report, name, "format", &e);
            Ok(entry.content.clone())
        }
    }
}

async fn sync_all(
    conns: &[Arc<ServerConnection>],
    path: &Path,
    content: &str,
    token: &CancellationToken,
    report: &mut FileWriteReport,
) {
    if token.is_cancelled() {
        return;
    }
    let results = join_all(conns.iter().map(|c| c.sync_content(path, content, token))).await;
    for (conn, result) in conns.iter().zip(results) {
        if let Err(e) = result {
            degrade(report, conn.name(), "sync", &e);
        }
    }
}

/// Ask the first connection advertising formatting for edits. Returns the
/// new content only when it differs.
async fn format_with_server(
    conns: &[Arc<ServerConnection>],
    path: &Path,
    content: &str,
    token: &CancellationToken,
    report: &mut FileWriteReport,
) -> Option<String> {
    if token.is_cancelled() {
        return None;
    }
    let conn = conns.iter().find(|c| c.supports_formatting())?;
    let uri = match protocol::path_to_file_uri(path) {
        Ok(uri) => uri.to_string(),
        Err(e) => {
            degrade(report, conn.name(), "format", &e);
            return None;
        }
    };
    let params = protocol::formatting_params(&uri, content);
    let result = match conn.request(FORMATTING, Some(params), token, None).await {
        Ok(result) => result,
        Err(e) => {
            degrade(report, conn.name(), "format", &e);
            return None;
        }
    };
    if result.is_null() {
        return None;
    }
    let edits: Vec<TextEdit> = match serde_json::from_value(result) {
        Ok(edits) => edits,
        Err(e) => {
            report
                .warnings
                .push(format!("{}: malformed formatting edits: {e}", conn.name()));
            return None;
        }
    };
    let formatted = match protocol::apply_text_edits(content, &edits) {
        Ok(formatted) => formatted,
        Err(reason) => {
            let err = LspError::Protocol {
                method: FORMATTING.to_string(),
                code: protocol::INVALID_PARAMS,
                message: reason,
            };
            degrade(report, conn.name(), "format", &err);
            return None;
        }
    };
    if formatted == content {
        return None;
    }
    report.formatted = true;
    report.formatter = Some(conn.name().to_string());
    Some(formatted)
}

async fn persist(path: &Path, content: &str) -> Result<()> {
    let target = path.to_path_buf();
    let bytes = content.as_bytes().to_vec();
    tokio::task::spawn_blocking(move || quill_utils::atomic_write(&target, &bytes))
        .await
        .map_err(|e| LspError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .map_err(|e| LspError::io(path, &e))
}

fn degrade(report: &mut FileWriteReport, server: &str, step: &str, err: &LspError) {
    if err.is_cancelled() {
        return;
    }
    tracing::warn!(server, path = %report.path.display(), "{step} failed: {err}");
    report.warnings.push(format!("{server}: {step} failed: {err}"));
}
