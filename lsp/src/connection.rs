//! One language server connection.
//!
//! A connection owns the child process (when there is one), a writer task
//! that serializes every outbound frame, and a reader task that classifies
//! inbound frames into responses, server requests, and notifications.
//! Pending requests and the diagnostics cache are the only state the two
//! tasks share with callers.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use quill_types::ServerConfig;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{LspError, Result};
use crate::handler::ServerRequestHandler;
use crate::protocol::{self, IncomingMessage, Notification, PublishDiagnosticsParams, Request};
use crate::sync::FileTracker;
use crate::types::Diagnostic;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_CHANNEL_CAPACITY: usize = 64;

const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// How long the crash sweep waits for stderr to drain before reporting.
const STDERR_GRACE: Duration = Duration::from_millis(100);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

enum WriterCommand {
    Send {
        frame: Value,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Shutdown,
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// Diagnostics last published for one file.
///
/// `stamp` is the connection's diagnostics version right after the publish
/// was ingested; it orders publishes without relying on wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDiagnostics {
    pub items: Vec<Diagnostic>,
    pub stamp: u64,
}

/// Identity and tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub name: String,
    pub cwd: PathBuf,
    /// Fallback content-type tag for files without a known extension.
    pub language_id: String,
    pub file_types: Vec<String>,
    pub request_timeout: Duration,
}

impl ConnectionOptions {
    #[must_use]
    pub fn new(name: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            cwd: cwd.into(),
            language_id: String::from("plaintext"),
            file_types: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn for_server(
        name: impl Into<String>,
        config: &ServerConfig,
        cwd: impl Into<PathBuf>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            cwd: cwd.into(),
            language_id: config.language_id().to_string(),
            file_types: config.file_extensions().to_vec(),
            request_timeout,
        }
    }

    #[must_use]
    pub fn with_language_id(mut self, language_id: impl Into<String>) -> Self {
        self.language_id = language_id.into();
        self
    }

    #[must_use]
    pub fn with_file_types(mut self, file_types: Vec<String>) -> Self {
        self.file_types = file_types;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// State shared between the connection handle and its background tasks.
struct Shared {
    name: String,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    diagnostics: Mutex<HashMap<String, CachedDiagnostics>>,
    diagnostics_version: AtomicU64,
    stderr_tail: Mutex<VecDeque<u8>>,
    stderr_done: CancellationToken,
    closed: CancellationToken,
    close_error: OnceLock<LspError>,
}

impl Shared {
    fn new(name: String) -> Self {
        Self {
            name,
            pending: Mutex::new(HashMap::new()),
            diagnostics: Mutex::new(HashMap::new()),
            diagnostics_version: AtomicU64::new(0),
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_BYTES)),
            stderr_done: CancellationToken::new(),
            closed: CancellationToken::new(),
            close_error: OnceLock::new(),
        }
    }

    fn closed_error(&self) -> LspError {
        self.close_error
            .get()
            .cloned()
            .unwrap_or_else(|| LspError::ConnectionClosed {
                server: self.name.clone(),
                stderr: None,
            })
    }

    fn transport_error(&self, message: impl Into<String>) -> LspError {
        LspError::Transport {
            server: self.name.clone(),
            message: message.into(),
        }
    }

    async fn stderr_text(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().await;
        if tail.is_empty() {
            return None;
        }
        let (front, back) = tail.as_slices();
        let mut bytes = Vec::with_capacity(tail.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reject every pending request without closing the connection.
    async fn reject_pending(&self, err: &LspError) -> usize {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(err.clone()));
        }
        count
    }

    /// Terminal transition: mark closed and reject everything still pending.
    ///
    /// Closing happens under the pending lock so a request can never register
    /// after the sweep has drained the map.
    async fn sweep(&self, reason: &str) {
        let _ = tokio::time::timeout(STDERR_GRACE, self.stderr_done.cancelled()).await;
        let stderr = self.stderr_text().await;
        let _ = self.close_error.set(LspError::ConnectionClosed {
            server: self.name.clone(),
            stderr,
        });
        let err = self.closed_error();

        let drained: Vec<_> = {
            let mut pending = self.pending.lock().await;
            self.closed.cancel();
            pending.drain().collect()
        };
        if drained.is_empty() {
            tracing::debug!(server = %self.name, reason, "connection closed");
        } else {
            tracing::warn!(
                server = %self.name,
                reason,
                pending = drained.len(),
                "connection closed with requests in flight"
            );
        }
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(err.clone()));
        }
    }

    async fn dispatch(
        &self,
        frame: Value,
        writer_tx: &mpsc::Sender<WriterCommand>,
        handler: &Arc<dyn ServerRequestHandler>,
    ) {
        let Some(incoming) = protocol::classify(frame) else {
            tracing::trace!(server = %self.name, "ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            IncomingMessage::Response { id, outcome } => {
                // Removal before completion: a second response for the same
                // id finds nothing.
                let entry = self.pending.lock().await.remove(&id);
                match entry {
                    Some(pending) => {
                        let result = outcome.map_err(|e| e.into_lsp_error(&pending.method));
                        let _ = pending.tx.send(result);
                    }
                    None => {
                        tracing::trace!(server = %self.name, id, "response for unknown or abandoned request");
                    }
                }
            }
            IncomingMessage::ServerRequest { id, method, params } => {
                tracing::debug!(server = %self.name, method = %method, "server request");
                let handler = Arc::clone(handler);
                let writer_tx = writer_tx.clone();
                let name = self.name.clone();
                tokio::spawn(async move {
                    let response = match handler.handle(&method, params).await {
                        Ok(result) => protocol::response_ok(id, result),
                        Err(error) => protocol::response_err(id, &error),
                    };
                    let command = WriterCommand::Send {
                        frame: response,
                        ack: None,
                    };
                    if writer_tx.send(command).await.is_err() {
                        tracing::debug!(server = %name, method = %method, "connection closed before reply");
                    }
                });
            }
            IncomingMessage::Notification { method, params } => {
                self.handle_notification(&method, params).await;
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            protocol::PUBLISH_DIAGNOSTICS => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(published) => self.ingest_diagnostics(published).await,
                    Err(e) => {
                        tracing::debug!(server = %self.name, "failed to parse publishDiagnostics: {e}");
                    }
                }
            }
            "window/logMessage" | "window/showMessage" => {
                let message = params
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                tracing::debug!(server = %self.name, "{method}: {message}");
            }
            _ => {
                tracing::trace!(server = %self.name, "ignoring notification: {method}");
            }
        }
    }

    /// The only writer of the diagnostics cache besides invalidation.
    async fn ingest_diagnostics(&self, published: PublishDiagnosticsParams) {
        let items: Vec<Diagnostic> = published
            .diagnostics
            .iter()
            .map(|d| d.to_diagnostic(&self.name))
            .collect();
        let mut cache = self.diagnostics.lock().await;
        let stamp = self.diagnostics_version.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(
            server = %self.name,
            uri = %published.uri,
            count = items.len(),
            stamp,
            "diagnostics published"
        );
        cache.insert(published.uri, CachedDiagnostics { items, stamp });
    }
}

/// A live connection to one language server.
pub struct ServerConnection {
    shared: Arc<Shared>,
    cwd: PathBuf,
    language_id: String,
    file_types: Vec<String>,
    request_timeout: Duration,
    writer_tx: mpsc::Sender<WriterCommand>,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    closing: AtomicBool,
    created: Instant,
    last_activity_ms: AtomicU64,
    capabilities: OnceLock<Value>,
    pub(crate) files: FileTracker,
}

impl ServerConnection {
    /// Spawn the configured server process in `opts.cwd` and connect to it.
    ///
    /// The handshake is not performed here; see [`ServerConnection::initialize`].
    pub fn spawn(
        opts: ConnectionOptions,
        config: &ServerConfig,
        handler: Arc<dyn ServerRequestHandler>,
    ) -> Result<Arc<Self>> {
        let spawn_error = |message: String| LspError::Spawn {
            server: opts.name.clone(),
            message,
        };
        let program = resolve_command(config.command(), &opts.cwd).map_err(spawn_error)?;

        let mut cmd = Command::new(&program);
        cmd.args(config.args())
            .current_dir(&opts.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, _) in std::env::vars_os() {
            if let Some(key) = key.to_str()
                && quill_types::is_secret_env_var(key)
            {
                cmd.env_remove(key);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(format!("{}: {e}", program.display())))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("no stdout from child".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("no stdin from child".to_string()))?;

        tracing::info!(
            server = %opts.name,
            command = %program.display(),
            cwd = %opts.cwd.display(),
            pid = child.id(),
            "spawned language server"
        );
        Ok(Self::start(opts, stdout, stdin, handler, Some(child)))
    }

    /// Connect over an arbitrary byte-stream pair.
    pub fn from_transport<R, W>(
        opts: ConnectionOptions,
        reader: R,
        writer: W,
        handler: Arc<dyn ServerRequestHandler>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(opts, reader, writer, handler, None)
    }

    fn start<R, W>(
        opts: ConnectionOptions,
        reader: R,
        writer: W,
        handler: Arc<dyn ServerRequestHandler>,
        mut child: Option<Child>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::new(opts.name.clone()));

        match child.as_mut().and_then(|c| c.stderr.take()) {
            Some(stderr) => {
                tokio::spawn(capture_stderr(Arc::clone(&shared), stderr));
            }
            None => shared.stderr_done.cancel(),
        }

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        tokio::spawn(run_writer(Arc::clone(&shared), writer, writer_rx));
        tokio::spawn(run_reader(
            Arc::clone(&shared),
            reader,
            writer_tx.clone(),
            handler,
        ));

        Arc::new(Self {
            shared,
            cwd: opts.cwd,
            language_id: opts.language_id,
            file_types: opts.file_types,
            request_timeout: opts.request_timeout,
            writer_tx,
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            capabilities: OnceLock::new(),
            files: FileTracker::default(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn file_types(&self) -> &[String] {
        &self.file_types
    }

    /// False once the process has exited or shutdown has begun.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.shared.closed.is_cancelled() && !self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once the connection is closed for good.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    pub(crate) fn closed_signal(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    /// Capabilities declared in the `initialize` result, once the handshake
    /// has completed.
    #[must_use]
    pub fn capabilities(&self) -> Option<&Value> {
        self.capabilities.get()
    }

    #[must_use]
    pub fn supports_formatting(&self) -> bool {
        self.capabilities
            .get()
            .and_then(|caps| caps.get("documentFormattingProvider"))
            .is_some_and(|provider| provider.as_bool().unwrap_or(provider.is_object()))
    }

    /// Refresh the idle clock.
    pub fn touch(&self) {
        let now = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Number of publishes ingested so far on this connection.
    #[must_use]
    pub fn diagnostics_version(&self) -> u64 {
        self.shared.diagnostics_version.load(Ordering::SeqCst)
    }

    pub async fn cached_diagnostics(&self, uri: &str) -> Option<CachedDiagnostics> {
        self.shared.diagnostics.lock().await.get(uri).cloned()
    }

    pub(crate) async fn invalidate_diagnostics(&self, uri: &str) {
        self.shared.diagnostics.lock().await.remove(uri);
    }

    /// In-flight requests awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(self.shared.closed_error())
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Exactly one of response, cancellation, timeout, or connection loss
    /// completes the call. Cancellation is checked first, so it beats a
    /// timeout that elapses at the same moment. On cancellation or timeout a
    /// `$/cancelRequest` is sent without waiting for it to be written.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.ensure_usable()?;
        self.request_inner(method, params, cancel, timeout).await
    }

    async fn request_inner(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(LspError::Cancelled);
        }
        self.touch();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| self.shared.transport_error(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            if self.shared.closed.is_cancelled() {
                return Err(self.shared.closed_error());
            }
            pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        let timeout = timeout.unwrap_or(self.request_timeout);
        let started = Instant::now();
        let exchange = async {
            self.send(frame).await?;
            rx.await.map_err(|_| self.shared.closed_error())?
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LspError::Cancelled),
            result = exchange => result,
            () = tokio::time::sleep(timeout) => Err(LspError::Timeout {
                method: method.to_string(),
                elapsed: started.elapsed(),
            }),
        };

        if let Err(err) = &outcome {
            let abandoned = self.shared.pending.lock().await.remove(&id).is_some();
            if abandoned && (err.is_cancelled() || err.is_timeout()) {
                tracing::debug!(server = %self.name(), id, method, "abandoning request: {err}");
                self.send_cancel(id);
            }
        }
        outcome
    }

    /// Fire-and-forget notification. Errors only when the frame could not
    /// be written.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_usable()?;
        self.notify_inner(method, params).await
    }

    async fn notify_inner(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.touch();
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| self.shared.transport_error(e.to_string()))?;
        self.send(frame).await
    }

    /// Queue a frame and wait for the writer to report the outcome.
    async fn send(&self, frame: Value) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer_tx
            .send(WriterCommand::Send {
                frame,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| self.shared.closed_error())?;
        ack_rx.await.map_err(|_| self.shared.closed_error())?
    }

    fn send_cancel(&self, id: u64) {
        let notification = Notification::new(protocol::CANCEL_REQUEST, Some(protocol::cancel_params(id)));
        let Ok(frame) = serde_json::to_value(notification) else {
            return;
        };
        let command = WriterCommand::Send { frame, ack: None };
        if self.writer_tx.try_send(command).is_err() {
            tracing::trace!(server = %self.name(), id, "could not queue $/cancelRequest");
        }
    }

    /// `initialize` then `initialized`. Failures are reported as
    /// [`LspError::Handshake`] unless the caller cancelled.
    pub async fn initialize(
        &self,
        initialization_options: Option<&Value>,
        settings: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let handshake_error = |err: LspError| match err {
            LspError::Cancelled => LspError::Cancelled,
            other => LspError::Handshake {
                server: self.name().to_string(),
                message: other.to_string(),
            },
        };

        let root_uri = protocol::path_to_file_uri(&self.cwd)?;
        let params = protocol::initialize_params(root_uri.as_str(), &self.cwd, initialization_options);
        let result = self
            .request("initialize", Some(params), cancel, None)
            .await
            .map_err(handshake_error)?;

        let capabilities = result
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let _ = self.capabilities.set(capabilities);

        self.notify("initialized", Some(serde_json::json!({})))
            .await
            .map_err(handshake_error)?;

        if let Some(settings) = settings
            && let Err(e) = self
                .notify(
                    "workspace/didChangeConfiguration",
                    Some(serde_json::json!({ "settings": settings })),
                )
                .await
        {
            tracing::debug!(server = %self.name(), "didChangeConfiguration failed: {e}");
        }

        tracing::info!(server = %self.name(), cwd = %self.cwd.display(), "language server ready");
        Ok(())
    }

    /// Reject outstanding work, ask the server to exit, then make sure the
    /// process is gone. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            self.shared.closed.cancelled().await;
            return;
        }

        let rejected = self
            .shared
            .reject_pending(&LspError::ConnectionClosed {
                server: self.name().to_string(),
                stderr: None,
            })
            .await;
        if rejected > 0 {
            tracing::debug!(server = %self.name(), rejected, "rejected pending requests for shutdown");
        }

        if !self.shared.closed.is_cancelled() {
            let cancel = CancellationToken::new();
            match self
                .request_inner("shutdown", None, &cancel, Some(SHUTDOWN_TIMEOUT))
                .await
            {
                Ok(_) => {
                    let _ = self.notify_inner("exit", None).await;
                }
                Err(e) => {
                    tracing::debug!(server = %self.name(), "shutdown request failed: {e}");
                }
            }
        }

        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        if let Some(mut child) = self.child.lock().await.take()
            && tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait())
                .await
                .is_err()
        {
            tracing::debug!(server = %self.name(), "server didn't exit in time, killing");
            let _ = child.kill().await;
        }

        self.shared.sweep("shutdown").await;
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.shared.name)
            .field("cwd", &self.cwd)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Commands containing a path separator resolve against `cwd`; bare names
/// are looked up on `PATH`.
fn resolve_command(command: &str, cwd: &Path) -> std::result::Result<PathBuf, String> {
    let path = Path::new(command);
    if path.is_absolute() || path.components().count() > 1 {
        let candidate = cwd.join(path);
        return if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(format!("{} does not exist", candidate.display()))
        };
    }
    which::which(command).map_err(|e| format!("{command} not found in PATH: {e}"))
}

async fn run_writer<W>(
    shared: Arc<Shared>,
    writer: W,
    mut rx: mpsc::Receiver<WriterCommand>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(writer);
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send { frame, ack } => match writer.write_frame(&frame).await {
                Ok(()) => {
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %shared.name, "write failed: {e}");
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(shared.transport_error(e.to_string())));
                    }
                    shared.sweep("write failed").await;
                    break;
                }
            },
            WriterCommand::Shutdown => {
                let _ = writer.close().await;
                break;
            }
        }
    }
}

async fn run_reader<R>(
    shared: Arc<Shared>,
    reader: R,
    writer_tx: mpsc::Sender<WriterCommand>,
    handler: Arc<dyn ServerRequestHandler>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new(reader);
    let reason = loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => shared.dispatch(frame, &writer_tx, &handler).await,
            Ok(None) => {
                tracing::info!(server = %shared.name, "language server closed stdout");
                break "end of stream";
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(server = %shared.name, "skipping bad frame: {e}");
            }
            Err(e) => {
                tracing::warn!(server = %shared.name, "read failed: {e}");
                break "read failed";
            }
        }
    };
    shared.sweep(reason).await;
}

async fn capture_stderr(shared: Arc<Shared>, mut stderr: ChildStderr) {
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut tail = shared.stderr_tail.lock().await;
                tail.extend(&buf[..n]);
                let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                tail.drain(..excess);
            }
        }
    }
    shared.stderr_done.cancel();
}
