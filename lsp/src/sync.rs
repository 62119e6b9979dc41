//! Open-file bookkeeping and document synchronization.
//!
//! Every operation takes the per-file lock for its URI first, so two callers
//! touching the same file on the same connection never interleave their
//! open/change/save notifications, while other files proceed in parallel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::connection::ServerConnection;
use crate::error::{LspError, Result};
use crate::protocol;

#[derive(Debug, Clone)]
struct OpenFile {
    version: i32,
    language_id: String,
}

/// Per-connection table of open documents and their operation locks.
///
/// A lock entry lives only while some caller holds or waits on it.
#[derive(Debug, Default)]
pub(crate) struct FileTracker {
    open: Mutex<HashMap<String, OpenFile>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one file operation.
#[derive(Debug)]
pub(crate) struct FileLock<'a> {
    tracker: &'a FileTracker,
    uri: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.tracker.release(&self.uri, &self.lock);
    }
}

impl FileTracker {
    async fn lock(&self, uri: &str, cancel: &CancellationToken) -> Result<FileLock<'_>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(uri.to_string()).or_default())
        };
        let acquired = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            guard = Arc::clone(&lock).lock_owned() => Some(guard),
        };
        match acquired {
            Some(guard) => Ok(FileLock {
                tracker: self,
                uri: uri.to_string(),
                lock,
                guard: Some(guard),
            }),
            None => {
                self.release(uri, &lock);
                Err(LspError::Cancelled)
            }
        }
    }

    /// Drop the entry for `uri` once only the table and `lock` reference it.
    fn release(&self, uri: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(uri)
            .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(uri);
        }
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn version(&self, uri: &str) -> Option<i32> {
        self.open.lock().await.get(uri).map(|f| f.version)
    }

    async fn set(&self, uri: &str, version: i32, language_id: String) {
        self.open.lock().await.insert(
            uri.to_string(),
            OpenFile {
                version,
                language_id,
            },
        );
    }

    pub(crate) async fn open_count(&self) -> usize {
        self.open.lock().await.len()
    }

    async fn language_id(&self, uri: &str) -> Option<String> {
        self.open
            .lock()
            .await
            .get(uri)
            .map(|f| f.language_id.clone())
    }
}

/// What a sync operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing was sent (already open, never opened, or missing on disk).
    Skipped,
    Opened,
    Changed { version: i32 },
    Saved,
}

impl ServerConnection {
    /// Open `path` from disk unless it is already open. A missing file is
    /// nothing to open, not an error.
    pub async fn ensure_open(&self, path: &Path, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let uri = file_uri(path)?;
        let _guard = self.files.lock(&uri, cancel).await?;
        if self.files.version(&uri).await.is_some() {
            return Ok(SyncOutcome::Skipped);
        }
        let Some(text) = read_if_exists(path).await? else {
            return Ok(SyncOutcome::Skipped);
        };
        self.open_with(&uri, path, &text).await?;
        Ok(SyncOutcome::Opened)
    }

    /// Push in-memory `content` for `path`, opening it first if needed.
    ///
    /// Cached diagnostics for the file are dropped before anything is sent:
    /// they describe content that is about to be replaced.
    pub async fn sync_content(
        &self,
        path: &Path,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let uri = file_uri(path)?;
        let _guard = self.files.lock(&uri, cancel).await?;
        self.invalidate_diagnostics(&uri).await;
        match self.files.version(&uri).await {
            None => {
                self.open_with(&uri, path, content).await?;
                Ok(SyncOutcome::Opened)
            }
            Some(current) => {
                let version = self.change_with(&uri, current, content).await?;
                Ok(SyncOutcome::Changed { version })
            }
        }
    }

    /// Send `didSave` for a file this connection has open.
    pub async fn notify_saved(&self, path: &Path, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let uri = file_uri(path)?;
        let _guard = self.files.lock(&uri, cancel).await?;
        if self.files.version(&uri).await.is_none() {
            return Ok(SyncOutcome::Skipped);
        }
        let text = if self.save_includes_text() {
            read_if_exists(path).await?
        } else {
            None
        };
        self.save_with(&uri, text.as_deref()).await?;
        Ok(SyncOutcome::Saved)
    }

    /// Re-read `path` from disk and send change + save, treating disk as the
    /// source of truth. Files not yet open are opened instead of changed.
    pub async fn refresh(&self, path: &Path, cancel: &CancellationToken) -> Result<SyncOutcome> {
        let uri = file_uri(path)?;
        let _guard = self.files.lock(&uri, cancel).await?;
        let Some(text) = read_if_exists(path).await? else {
            return Ok(SyncOutcome::Skipped);
        };
        let outcome = match self.files.version(&uri).await {
            None => {
                self.open_with(&uri, path, &text).await?;
                SyncOutcome::Opened
            }
            Some(current) => SyncOutcome::Changed {
                version: self.change_with(&uri, current, &text).await?,
            },
        };
        let include = self.save_includes_text().then_some(text.as_str());
        self.save_with(&uri, include).await?;
        Ok(outcome)
    }

    /// Version last sent for `path`, if it is open on this connection.
    pub async fn open_version(&self, path: &Path) -> Option<i32> {
        let uri = file_uri(path).ok()?;
        self.files.version(&uri).await
    }

    pub async fn open_file_count(&self) -> usize {
        self.files.open_count().await
    }

    async fn open_with(&self, uri: &str, path: &Path, text: &str) -> Result<()> {
        let language_id = language_id_for(path, self.language_id());
        self.notify(
            "textDocument/didOpen",
            Some(protocol::did_open_params(uri, &language_id, 1, text)),
        )
        .await?;
        self.files.set(uri, 1, language_id).await;
        tracing::trace!(server = %self.name(), uri, "didOpen");
        Ok(())
    }

    async fn change_with(&self, uri: &str, current: i32, text: &str) -> Result<i32> {
        let version = current.saturating_add(1);
        self.notify(
            "textDocument/didChange",
            Some(protocol::did_change_params(uri, version, text)),
        )
        .await?;
        let language_id = self
            .files
            .language_id(uri)
            .await
            .unwrap_or_else(|| self.language_id().to_string());
        self.files.set(uri, version, language_id).await;
        tracing::trace!(server = %self.name(), uri, version, "didChange");
        Ok(version)
    }

    async fn save_with(&self, uri: &str, text: Option<&str>) -> Result<()> {
        self.notify(
            "textDocument/didSave",
            Some(protocol::did_save_params(uri, text)),
        )
        .await
    }

    fn save_includes_text(&self) -> bool {
        self.capabilities()
            .and_then(|caps| caps.get("textDocumentSync"))
            .and_then(|sync| sync.get("save"))
            .and_then(|save| save.get("includeText"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

fn file_uri(path: &Path) -> Result<String> {
    protocol::path_to_file_uri(path).map(String::from)
}

async fn read_if_exists(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LspError::io(path, &e)),
    }
}

/// Content-type tag for `path`, falling back to the server's own language.
#[must_use]
pub fn language_id_for(path: &Path, fallback: &str) -> String {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let known = match extension.as_str() {
        "rs" => "rust",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "py" | "pyi" => "python",
        "go" => "go",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "rb" => "ruby",
        "php" => "php",
        "cs" => "csharp",
        "swift" => "swift",
        "lua" => "lua",
        "zig" => "zig",
        "sh" | "bash" => "shellscript",
        "json" => "json",
        "jsonc" => "jsonc",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "html" | "htm" => "html",
        "css" => "css",
        "scss" => "scss",
        "vue" => "vue",
        "svelte" => "svelte",
        _ => return fallback.to_string(),
    };
    known.to_string()
}
