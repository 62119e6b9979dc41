//! Keyed cache of live connections.
//!
//! One connection per (command line, working directory). Creation runs in a
//! background task whose outcome is broadcast to every caller waiting on the
//! same key, so concurrent callers never spawn duplicate processes. A
//! watcher per connection removes the entry as soon as the process exits.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use quill_types::ServerConfig;

use crate::connection::{ConnectionOptions, ServerConnection};
use crate::error::{LspError, Result};
use crate::handler::DefaultRequestHandler;
use crate::types::{ConnectionState, ConnectionStatus};

pub type ConnectFut<'a> = Pin<Box<dyn Future<Output = Result<Arc<ServerConnection>>> + Send + 'a>>;

/// Creates a connection and completes its handshake.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, name: &'a str, config: &'a ServerConfig, cwd: &'a Path)
    -> ConnectFut<'a>;
}

/// Spawns the configured command and performs the `initialize` handshake.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    request_timeout: Duration,
}

impl ProcessConnector {
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Connector for ProcessConnector {
    fn connect<'a>(
        &'a self,
        name: &'a str,
        config: &'a ServerConfig,
        cwd: &'a Path,
    ) -> ConnectFut<'a> {
        Box::pin(async move {
            let opts = ConnectionOptions::for_server(name, config, cwd, self.request_timeout);
            let handler = Arc::new(DefaultRequestHandler::new(name, config.settings().cloned()));
            let conn = ServerConnection::spawn(opts, config, handler)?;
            let handshake = conn
                .initialize(
                    config.initialization_options(),
                    config.settings(),
                    &CancellationToken::new(),
                )
                .await;
            if let Err(e) = handshake {
                conn.shutdown().await;
                return Err(e);
            }
            Ok(conn)
        })
    }
}

/// Registry key: the command line and the directory it runs in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    command: String,
    cwd: PathBuf,
}

impl ConnectionKey {
    #[must_use]
    pub fn new(config: &ServerConfig, cwd: &Path) -> Self {
        let mut command = config.command().to_string();
        for arg in config.args() {
            command.push(' ');
            command.push_str(arg);
        }
        Self {
            command,
            cwd: cwd.to_path_buf(),
        }
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.command, self.cwd.display())
    }
}

type Outcome = Option<Result<Arc<ServerConnection>>>;

enum Slot {
    Starting {
        generation: u64,
        name: String,
        file_types: Vec<String>,
        rx: watch::Receiver<Outcome>,
    },
    Ready {
        generation: u64,
        conn: Arc<ServerConnection>,
    },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Self::Starting { generation, .. } | Self::Ready { generation, .. } => *generation,
        }
    }
}

type Slots = Arc<Mutex<HashMap<ConnectionKey, Slot>>>;

pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    slots: Slots,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Return the live connection for `(config, cwd)`, creating it if needed.
    ///
    /// A caller that finds creation in progress waits for that outcome. With
    /// `warmup` set the wait is bounded; the handshake itself keeps running
    /// and a later call picks up the finished connection.
    pub async fn get_or_create(
        &self,
        name: &str,
        config: &ServerConfig,
        cwd: &Path,
        warmup: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ServerConnection>> {
        if self.shutdown.is_cancelled() {
            return Err(LspError::ConnectionClosed {
                server: name.to_string(),
                stderr: None,
            });
        }
        let key = ConnectionKey::new(config, cwd);

        let mut rx = {
            let mut slots = self.slots.lock().await;
            match slots.get(&key) {
                Some(Slot::Ready { conn, .. }) if conn.is_alive() => {
                    conn.touch();
                    return Ok(Arc::clone(conn));
                }
                Some(Slot::Starting { rx, .. }) => rx.clone(),
                Some(Slot::Ready { .. }) | None => {
                    self.start_creation(&mut slots, key, name, config)
                }
            }
        };

        let started = Instant::now();
        let outcome = async {
            loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(LspError::ConnectionClosed {
                        server: name.to_string(),
                        stderr: None,
                    });
                }
            }
        };
        let warmup_elapsed = async {
            match warmup {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LspError::Cancelled),
            result = outcome => result,
            () = warmup_elapsed => {
                tracing::debug!(server = name, "still starting after warm-up window");
                Err(LspError::Timeout {
                    method: "initialize".to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    fn start_creation(
        &self,
        slots: &mut HashMap<ConnectionKey, Slot>,
        key: ConnectionKey,
        name: &str,
        config: &ServerConfig,
    ) -> watch::Receiver<Outcome> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(
            key.clone(),
            Slot::Starting {
                generation,
                name: name.to_string(),
                file_types: config.file_extensions().to_vec(),
                rx: rx.clone(),
            },
        );
        tracing::debug!(server = name, key = %key, "creating connection");

        let connector = Arc::clone(&self.connector);
        let slots = Arc::clone(&self.slots);
        let shutdown = self.shutdown.clone();
        let name = name.to_string();
        let config = config.clone();
        tokio::spawn(async move {
            let created = connector.connect(&name, &config, key.cwd()).await;

            let mut guard = slots.lock().await;
            let still_ours = guard
                .get(&key)
                .is_some_and(|slot| slot.generation() == generation);
            let outcome = match created {
                Ok(conn) if still_ours && !shutdown.is_cancelled() => {
                    guard.insert(
                        key.clone(),
                        Slot::Ready {
                            generation,
                            conn: Arc::clone(&conn),
                        },
                    );
                    drop(guard);
                    watch_for_exit(
                        Arc::downgrade(&slots),
                        key,
                        generation,
                        conn.closed_signal(),
                    );
                    Ok(conn)
                }
                Ok(conn) => {
                    // Registry shut down or the slot was dropped meanwhile.
                    drop(guard);
                    conn.shutdown().await;
                    Err(LspError::ConnectionClosed {
                        server: name,
                        stderr: None,
                    })
                }
                Err(e) => {
                    if still_ours {
                        guard.remove(&key);
                    }
                    drop(guard);
                    if !e.is_cancelled() {
                        tracing::warn!(server = %name, key = %key, "connection failed: {e}");
                    }
                    Err(e)
                }
            };
            tx.send_replace(Some(outcome));
        });
        rx
    }

    /// Start the idle reaper. It stops when the registry shuts down or is
    /// dropped.
    pub fn start_idle_reaper(self: &Arc<Self>, idle_timeout: Duration, interval: Duration) {
        let registry = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let reaped = registry.reap_idle(idle_timeout).await;
                if reaped > 0 {
                    tracing::info!(reaped, "shut down idle language servers");
                }
            }
        });
    }

    /// Shut down every ready connection idle for longer than `idle_timeout`.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let idle: Vec<Arc<ServerConnection>> = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<ConnectionKey> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready { conn, .. } if conn.idle_for() > idle_timeout => {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();
            keys.iter()
                .filter_map(|key| match slots.remove(key) {
                    Some(Slot::Ready { conn, .. }) => Some(conn),
                    _ => None,
                })
                .collect()
        };
        for conn in &idle {
            tracing::debug!(server = %conn.name(), idle_ms = conn.idle_for().as_millis(), "reaping idle connection");
        }
        let count = idle.len();
        join_all(idle.iter().map(|conn| conn.shutdown())).await;
        count
    }

    /// Shut down every connection for the named server. Returns how many.
    pub async fn shutdown_named(&self, name: &str) -> usize {
        let removed: Vec<Arc<ServerConnection>> = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<ConnectionKey> = slots
                .iter()
                .filter(|(_, slot)| match slot {
                    Slot::Ready { conn, .. } => conn.name() == name,
                    Slot::Starting { name: starting, .. } => starting == name,
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| match slots.remove(key) {
                    Some(Slot::Ready { conn, .. }) => Some(conn),
                    // Creation finishes, finds its slot gone, and shuts itself down.
                    _ => None,
                })
                .collect()
        };
        let count = removed.len();
        join_all(removed.iter().map(|conn| conn.shutdown())).await;
        count
    }

    /// Shut down everything. New creations are refused afterwards.
    pub async fn shutdown_all(&self) -> usize {
        self.shutdown.cancel();
        let removed: Vec<Arc<ServerConnection>> = {
            let mut slots = self.slots.lock().await;
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready { conn, .. } => Some(conn),
                    Slot::Starting { .. } => None,
                })
                .collect()
        };
        let count = removed.len();
        join_all(removed.iter().map(|conn| conn.shutdown())).await;
        if count > 0 {
            tracing::info!(count, "shut down language servers");
        }
        count
    }

    /// One line per entry. Never fails.
    pub async fn status(&self) -> Vec<ConnectionStatus> {
        let slots = self.slots.lock().await;
        let mut out = Vec::with_capacity(slots.len());
        for (key, slot) in slots.iter() {
            let status = match slot {
                Slot::Starting {
                    name, file_types, ..
                } => ConnectionStatus {
                    name: name.clone(),
                    state: ConnectionState::Starting,
                    file_types: file_types.clone(),
                    open_files: 0,
                    cwd: key.cwd.display().to_string(),
                },
                Slot::Ready { conn, .. } => ConnectionStatus {
                    name: conn.name().to_string(),
                    state: if conn.is_alive() {
                        ConnectionState::Ready
                    } else {
                        ConnectionState::Closed
                    },
                    file_types: conn.file_types().to_vec(),
                    open_files: conn.open_file_count().await,
                    cwd: key.cwd.display().to_string(),
                },
            };
            out.push(status);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.cwd.cmp(&b.cwd)));
        out
    }

    /// Number of entries, starting or ready.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Remove the entry once its connection closes, unless it has already been
/// replaced by a newer one.
fn watch_for_exit(
    slots: Weak<Mutex<HashMap<ConnectionKey, Slot>>>,
    key: ConnectionKey,
    generation: u64,
    closed: CancellationToken,
) {
    tokio::spawn(async move {
        closed.cancelled().await;
        let Some(slots) = slots.upgrade() else {
            return;
        };
        let removed = {
            let mut slots = slots.lock().await;
            let current = matches!(
                slots.get(&key),
                Some(Slot::Ready { generation: g, .. }) if *g == generation
            );
            if current { slots.remove(&key) } else { None }
        };
        if let Some(Slot::Ready { conn, .. }) = removed {
            tracing::info!(server = %conn.name(), key = %key, "language server exited; entry removed");
            // Reaps the child process.
            conn.shutdown().await;
        }
    });
}
