//! Server selection: which servers apply to a file, and where they run.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quill_types::ServerConfig;

use crate::linter::{CommandFormatter, LinterAdapter};

/// Adapter name that pipes content through the entry's own `command`.
pub const COMMAND_ADAPTER: &str = "command";

/// How one applicable server is reached. Decided once, at resolution.
#[derive(Clone)]
pub enum Target {
    Protocol {
        name: String,
        config: ServerConfig,
        cwd: PathBuf,
    },
    Linter {
        name: String,
        adapter: Arc<dyn LinterAdapter>,
    },
}

impl Target {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Protocol { name, .. } | Self::Linter { name, .. } => name,
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol { name, cwd, .. } => f
                .debug_struct("Protocol")
                .field("name", name)
                .field("cwd", cwd)
                .finish_non_exhaustive(),
            Self::Linter { name, .. } => f
                .debug_struct("Linter")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// Maps a file to the ordered list of servers that handle it.
pub trait ServerResolver: Send + Sync {
    fn resolve(&self, path: &Path) -> Vec<Target>;
}

/// Resolver driven by the configured server table.
pub struct ConfigResolver {
    root: PathBuf,
    servers: Vec<(String, ServerConfig)>,
    adapters: HashMap<String, Arc<dyn LinterAdapter>>,
}

impl ConfigResolver {
    #[must_use]
    pub fn new<'a>(
        root: impl Into<PathBuf>,
        servers: impl IntoIterator<Item = (&'a String, &'a ServerConfig)>,
    ) -> Self {
        Self {
            root: root.into(),
            servers: servers
                .into_iter()
                .map(|(name, config)| (name.clone(), config.clone()))
                .collect(),
            adapters: HashMap::new(),
        }
    }

    /// Register a named external linter adapter.
    #[must_use]
    pub fn with_adapter(mut self, name: impl Into<String>, adapter: Arc<dyn LinterAdapter>) -> Self {
        self.adapters.insert(name.into(), adapter);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn adapter_for(&self, name: &str, config: &ServerConfig, adapter: &str) -> Option<Arc<dyn LinterAdapter>> {
        if let Some(registered) = self.adapters.get(adapter) {
            return Some(Arc::clone(registered));
        }
        if adapter == COMMAND_ADAPTER && !config.command().is_empty() {
            return Some(Arc::new(CommandFormatter::new(
                name,
                config.command(),
                config.args().to_vec(),
            )));
        }
        tracing::debug!(server = name, adapter, "no linter adapter registered under this name");
        None
    }

    /// Nearest ancestor of `path` holding one of `markers`, not walking above
    /// the session root when the file lives under it.
    fn workspace_root(&self, path: &Path, markers: &[String]) -> PathBuf {
        if markers.is_empty() {
            return self.root.clone();
        }
        let Some(start) = path.parent() else {
            return self.root.clone();
        };
        for dir in start.ancestors() {
            if markers.iter().any(|marker| dir.join(marker).exists()) {
                return dir.to_path_buf();
            }
            if dir == self.root {
                break;
            }
        }
        self.root.clone()
    }
}

impl ServerResolver for ConfigResolver {
    fn resolve(&self, path: &Path) -> Vec<Target> {
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return Vec::new();
        };
        self.servers
            .iter()
            .filter(|(_, config)| config.handles_extension(extension))
            .filter_map(|(name, config)| match config.adapter_name() {
                Some(adapter) => self
                    .adapter_for(name, config, adapter)
                    .map(|adapter| Target::Linter {
                        name: name.clone(),
                        adapter,
                    }),
                None => Some(Target::Protocol {
                    name: name.clone(),
                    config: config.clone(),
                    cwd: self.workspace_root(path, config.root_markers()),
                }),
            })
            .collect()
    }
}
