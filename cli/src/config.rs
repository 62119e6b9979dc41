use std::{fmt, path::PathBuf};

use quill_types::{LspSettings, SettingsError};
use serde::Deserialize;

/// On-disk configuration, `~/.quill/config.toml` unless overridden.
///
/// ```toml
/// [lsp]
/// diagnostics_timeout_ms = 3000
///
/// [lsp.servers.rust]
/// command = "rust-analyzer"
/// language_id = "rust"
/// file_extensions = ["rs"]
/// root_markers = ["Cargo.toml"]
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct QuillConfig {
    #[serde(default)]
    pub lsp: LspSettings,
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        path: PathBuf,
        source: SettingsError,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.path().display();
        match self {
            ConfigError::Read { source, .. } => write!(f, "failed to read {path}: {source}"),
            ConfigError::Parse { source, .. } => write!(f, "failed to parse {path}: {source}"),
            ConfigError::Invalid { source, .. } => write!(f, "invalid settings in {path}: {source}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { source, .. } => Some(source),
        }
    }
}

impl QuillConfig {
    /// Load from an explicit path, or the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let (path, required) = match explicit {
            Some(path) => (path, true),
            None => match config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        if !required && !path.exists() {
            tracing::debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(source) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, source);
                return Err(ConfigError::Read { path, source });
            }
        };
        Self::parse(path, &content)
    }

    fn parse(path: PathBuf, content: &str) -> Result<Self, ConfigError> {
        let config: QuillConfig = match toml::from_str(content) {
            Ok(config) => config,
            Err(source) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, source);
                return Err(ConfigError::Parse { path, source });
            }
        };
        if let Err(source) = config.lsp.validate() {
            return Err(ConfigError::Invalid { path, source });
        }
        tracing::info!(
            path = %path.display(),
            servers = config.lsp.servers.len(),
            "Config loaded"
        );
        Ok(config)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".quill").join("config.toml"))
}
