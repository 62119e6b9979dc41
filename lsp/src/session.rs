//! `LspSession` facade: the public API consumed by editing tools.
//!
//! A session owns its registry, resolver, and batch table. Nothing here is
//! process-global, so tests construct isolated sessions and the binary wires
//! its signal handlers to [`LspSession::shutdown_all`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::{StreamExt, stream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use quill_types::LspSettings;

use crate::connection::ServerConnection;
use crate::diagnostics::{
    self, Applicable, FileDiagnostics, GlobDiagnostics, ServerFailure,
};
use crate::error::{LspError, Result};
use crate::glob;
use crate::registry::{ConnectionRegistry, Connector, ProcessConnector};
use crate::resolve::{ConfigResolver, ServerResolver, Target};
use crate::sync::SyncOutcome;
use crate::types::ConnectionStatus;
use crate::writethrough::BatchEntry;

/// Files diagnosed at once by a glob.
const GLOB_CONCURRENCY: usize = 4;

pub struct LspSession {
    root: PathBuf,
    settings: LspSettings,
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<dyn ServerResolver>,
    pub(crate) batches: Mutex<HashMap<String, Vec<BatchEntry>>>,
}

impl LspSession {
    /// Session over the configured server table, spawning real processes.
    ///
    /// Starts the idle reaper when `idle_timeout_ms` is set, so this must be
    /// called from within a Tokio runtime.
    #[must_use]
    pub fn new(settings: LspSettings, root: impl Into<PathBuf>) -> Arc<Self> {
        let root = root.into();
        let resolver = Arc::new(ConfigResolver::new(root.clone(), &settings.servers));
        let connector = Arc::new(ProcessConnector::new(settings.request_timeout()));
        Self::with_parts(settings, root, resolver, connector)
    }

    #[must_use]
    pub fn with_parts(
        settings: LspSettings,
        root: impl Into<PathBuf>,
        resolver: Arc<dyn ServerResolver>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let registry = ConnectionRegistry::new(connector);
        if let Some(idle) = settings.idle_timeout() {
            registry.start_idle_reaper(idle, settings.idle_check_interval());
        }
        Arc::new(Self {
            root: root.into(),
            settings,
            registry,
            resolver,
            batches: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn settings(&self) -> &LspSettings {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Resolve relative paths against the session root.
    #[must_use]
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Connect to every server that applies to `path`.
    ///
    /// Servers that fail to start (or are still warming up) are returned as
    /// failures; only cancellation is an error.
    pub async fn applicable(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Applicable>, Vec<ServerFailure>)> {
        let targets = self.resolver.resolve(path);
        let warmup = Some(self.settings.warmup_timeout());
        let connecting = targets.into_iter().map(|target| async move {
            match target {
                Target::Protocol { name, config, cwd } => {
                    let conn = self
                        .registry
                        .get_or_create(&name, &config, &cwd, warmup, cancel)
                        .await;
                    (name.clone(), conn.map(|conn| Applicable::Protocol { name, conn }))
                }
                Target::Linter { name, adapter } => {
                    (name.clone(), Ok(Applicable::Linter { name, adapter }))
                }
            }
        });

        let mut ready = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in join_all(connecting).await {
            match result {
                Ok(applicable) => ready.push(applicable),
                Err(LspError::Cancelled) => return Err(LspError::Cancelled),
                Err(e) => {
                    tracing::warn!(server = %name, path = %path.display(), "server unavailable: {e}");
                    failures.push(ServerFailure {
                        server: name,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok((ready, failures))
    }

    pub(crate) async fn connections(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<ServerConnection>>> {
        let (applicable, _) = self.applicable(path, cancel).await?;
        Ok(protocol_connections(&applicable))
    }

    /// Open `path` on every applicable protocol server. Returns how many
    /// servers newly opened it.
    pub async fn ensure_open(&self, path: &Path, cancel: &CancellationToken) -> Result<usize> {
        let path = self.absolute(path);
        let conns = self.connections(&path, cancel).await?;
        let results = join_all(conns.iter().map(|conn| conn.ensure_open(&path, cancel))).await;
        count_outcomes(&conns, &path, results, "ensure_open")
    }

    /// Push in-memory `content` for `path` to every applicable protocol server.
    pub async fn sync_content(
        &self,
        path: &Path,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let path = self.absolute(path);
        let conns = self.connections(&path, cancel).await?;
        let results =
            join_all(conns.iter().map(|conn| conn.sync_content(&path, content, cancel))).await;
        count_outcomes(&conns, &path, results, "sync_content")
    }

    pub async fn notify_saved(&self, path: &Path, cancel: &CancellationToken) -> Result<usize> {
        let path = self.absolute(path);
        let conns = self.connections(&path, cancel).await?;
        let results = join_all(conns.iter().map(|conn| conn.notify_saved(&path, cancel))).await;
        count_outcomes(&conns, &path, results, "notify_saved")
    }

    pub async fn refresh(&self, path: &Path, cancel: &CancellationToken) -> Result<usize> {
        let path = self.absolute(path);
        let conns = self.connections(&path, cancel).await?;
        let results = join_all(conns.iter().map(|conn| conn.refresh(&path, cancel))).await;
        count_outcomes(&conns, &path, results, "refresh")
    }

    /// Diagnose one file with the single-file wait budget.
    pub async fn diagnose_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<FileDiagnostics> {
        let path = self.absolute(path);
        self.diagnose_path(&path, self.settings.diagnostics_timeout(), None, cancel)
            .await
    }

    pub(crate) async fn diagnose_path(
        &self,
        path: &Path,
        timeout: Duration,
        floors: Option<&HashMap<String, u64>>,
        cancel: &CancellationToken,
    ) -> Result<FileDiagnostics> {
        let (targets, failures) = self.applicable(path, cancel).await?;
        let report = diagnostics::diagnose_targets(path, &targets, timeout, floors, cancel).await?;
        Ok(with_connect_failures(report, failures))
    }

    /// Expand `pattern` under the session root and diagnose every match.
    ///
    /// More than one target switches to the shorter per-file wait budget.
    pub async fn diagnose_glob(
        &self,
        pattern: &str,
        max_targets: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<GlobDiagnostics> {
        let max_targets = max_targets.unwrap_or(self.settings.max_glob_targets);
        let root = self.root.clone();
        let owned_pattern = pattern.to_string();
        let expansion = tokio::task::spawn_blocking(move || {
            glob::expand(&root, &owned_pattern, max_targets)
        })
        .await
        .map_err(|e| LspError::Glob {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })??;

        if expansion.truncated() {
            tracing::info!(
                pattern,
                total = expansion.total,
                kept = expansion.files.len(),
                "glob matched more files than the target limit"
            );
        }

        let timeout = if expansion.files.len() > 1 {
            self.settings.batch_diagnostics_timeout()
        } else {
            self.settings.diagnostics_timeout()
        };
        let reports: Vec<Result<FileDiagnostics>> = stream::iter(expansion.files.iter())
            .map(|path| self.diagnose_path(path, timeout, None, cancel))
            .buffered(GLOB_CONCURRENCY)
            .collect()
            .await;
        let files = reports.into_iter().collect::<Result<Vec<_>>>()?;

        Ok(GlobDiagnostics {
            pattern: pattern.to_string(),
            files,
            total_matches: expansion.total,
            ignore_rules_applied: expansion.ignore_rules_applied,
        })
    }

    /// Read-only listing of every connection. Never fails.
    pub async fn status(&self) -> Vec<ConnectionStatus> {
        self.registry.status().await
    }

    /// Shut down every connection of the named server.
    pub async fn shutdown_one(&self, name: &str) -> usize {
        self.registry.shutdown_named(name).await
    }

    pub async fn shutdown_all(&self) -> usize {
        self.registry.shutdown_all().await
    }
}

pub(crate) fn protocol_connections(applicable: &[Applicable]) -> Vec<Arc<ServerConnection>> {
    applicable
        .iter()
        .filter_map(|a| match a {
            Applicable::Protocol { conn, .. } => Some(Arc::clone(conn)),
            Applicable::Linter { .. } => None,
        })
        .collect()
}

pub(crate) fn with_connect_failures(
    mut report: FileDiagnostics,
    failures: Vec<ServerFailure>,
) -> FileDiagnostics {
    if !failures.is_empty() {
        report.applicable += failures.len();
        report.failures.extend(failures);
    }
    report
}

/// Count servers that acted; cancellation wins, other failures are logged.
fn count_outcomes(
    conns: &[Arc<ServerConnection>],
    path: &Path,
    results: Vec<Result<SyncOutcome>>,
    operation: &str,
) -> Result<usize> {
    let mut acted = 0;
    for (conn, result) in conns.iter().zip(results) {
        match result {
            Ok(SyncOutcome::Skipped) => {}
            Ok(_) => acted += 1,
            Err(LspError::Cancelled) => return Err(LspError::Cancelled),
            Err(e) => {
                tracing::warn!(
                    server = %conn.name(),
                    path = %path.display(),
                    "{operation} failed: {e}"
                );
            }
        }
    }
    Ok(acted)
}
