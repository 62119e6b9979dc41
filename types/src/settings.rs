//! Resolved configuration types shared across crates.
//!
//! [`ServerConfig`] is validated at the deserialization boundary: existence of
//! a value is the proof of its validity. [`LspSettings`] carries the tunables
//! for the language-intelligence layer with serde defaults for every field.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerConfigError {
    #[error("server command must not be empty")]
    EmptyCommand,
    #[error("language_id must not be empty")]
    EmptyLanguageId,
    #[error("adapter name must not be empty")]
    EmptyAdapter,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("max_glob_targets must be greater than zero")]
    ZeroGlobTargets,
}

#[derive(Deserialize)]
struct RawServerConfig {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    language_id: String,
    #[serde(default)]
    file_extensions: Vec<String>,
    #[serde(default)]
    root_markers: Vec<String>,
    #[serde(default)]
    adapter: Option<String>,
    #[serde(default)]
    settings: Option<serde_json::Value>,
    #[serde(default)]
    initialization_options: Option<serde_json::Value>,
}

/// Validated language server configuration.
///
/// Invariant: protocol servers have a non-empty `command` and `language_id`.
/// Entries carrying an `adapter` name are routed to an external linter
/// adapter instead and only need the adapter name.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    command: String,
    args: Vec<String>,
    language_id: String,
    file_extensions: Vec<String>,
    root_markers: Vec<String>,
    adapter: Option<String>,
    settings: Option<serde_json::Value>,
    initialization_options: Option<serde_json::Value>,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = ServerConfigError;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        match &raw.adapter {
            Some(adapter) if adapter.trim().is_empty() => {
                return Err(ServerConfigError::EmptyAdapter);
            }
            Some(_) => {}
            None => {
                if raw.command.trim().is_empty() {
                    return Err(ServerConfigError::EmptyCommand);
                }
                if raw.language_id.trim().is_empty() {
                    return Err(ServerConfigError::EmptyLanguageId);
                }
            }
        }
        let file_extensions = raw
            .file_extensions
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Ok(Self {
            command: raw.command,
            args: raw.args,
            language_id: raw.language_id,
            file_extensions,
            root_markers: raw.root_markers,
            adapter: raw.adapter,
            settings: raw.settings,
            initialization_options: raw.initialization_options,
        })
    }
}

impl ServerConfig {
    /// Construct a protocol server config.
    pub fn protocol(
        command: impl Into<String>,
        language_id: impl Into<String>,
        file_extensions: &[&str],
    ) -> Result<Self, ServerConfigError> {
        Self::try_from(RawServerConfig {
            command: command.into(),
            args: Vec::new(),
            language_id: language_id.into(),
            file_extensions: file_extensions.iter().map(ToString::to_string).collect(),
            root_markers: Vec::new(),
            adapter: None,
            settings: None,
            initialization_options: None,
        })
    }

    /// Construct a config that routes to the named external linter adapter.
    pub fn adapter(
        adapter: impl Into<String>,
        file_extensions: &[&str],
    ) -> Result<Self, ServerConfigError> {
        Self::try_from(RawServerConfig {
            command: String::new(),
            args: Vec::new(),
            language_id: String::new(),
            file_extensions: file_extensions.iter().map(ToString::to_string).collect(),
            root_markers: Vec::new(),
            adapter: Some(adapter.into()),
            settings: None,
            initialization_options: None,
        })
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_root_markers(mut self, markers: Vec<String>) -> Self {
        self.root_markers = markers;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = Some(settings);
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    /// Lowercase extensions without the leading dot (e.g. `["rs"]`).
    #[must_use]
    pub fn file_extensions(&self) -> &[String] {
        &self.file_extensions
    }

    #[must_use]
    pub fn root_markers(&self) -> &[String] {
        &self.root_markers
    }

    /// Name of the external linter adapter this entry routes to, if any.
    #[must_use]
    pub fn adapter_name(&self) -> Option<&str> {
        self.adapter.as_deref()
    }

    /// Value tree answered for `workspace/configuration` requests.
    #[must_use]
    pub fn settings(&self) -> Option<&serde_json::Value> {
        self.settings.as_ref()
    }

    #[must_use]
    pub fn initialization_options(&self) -> Option<&serde_json::Value> {
        self.initialization_options.as_ref()
    }

    /// Whether this server declares `extension` (case-insensitive, no dot).
    #[must_use]
    pub fn handles_extension(&self, extension: &str) -> bool {
        self.file_extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(extension))
    }
}

const fn default_true() -> bool {
    true
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_warmup_timeout_ms() -> u64 {
    5_000
}

const fn default_diagnostics_timeout_ms() -> u64 {
    3_000
}

const fn default_batch_diagnostics_timeout_ms() -> u64 {
    1_000
}

const fn default_write_deadline_ms() -> u64 {
    10_000
}

const fn default_idle_check_interval_ms() -> u64 {
    60_000
}

const fn default_max_glob_targets() -> usize {
    20
}

/// Tunables for the language-intelligence layer.
#[derive(Debug, Clone, Deserialize)]
pub struct LspSettings {
    /// Request a formatting edit before persisting a write. Default: true.
    #[serde(default = "default_true")]
    pub format_on_write: bool,
    /// Collect diagnostics after persisting a write. Default: true.
    #[serde(default = "default_true")]
    pub diagnostics_on_write: bool,
    /// Steady-state timeout for a single request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long a caller waits for a server handshake before giving up.
    /// The handshake itself keeps running in the background.
    #[serde(default = "default_warmup_timeout_ms")]
    pub warmup_timeout_ms: u64,
    /// Per-file diagnostics wait when a single file is diagnosed.
    #[serde(default = "default_diagnostics_timeout_ms")]
    pub diagnostics_timeout_ms: u64,
    /// Per-file diagnostics wait when several files are diagnosed together.
    #[serde(default = "default_batch_diagnostics_timeout_ms")]
    pub batch_diagnostics_timeout_ms: u64,
    /// Deadline for one whole writethrough (format + write + diagnose).
    #[serde(default = "default_write_deadline_ms")]
    pub write_deadline_ms: u64,
    /// Connections idle longer than this are shut down. `None` disables the reaper.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,
    /// Upper bound on files expanded from a diagnostics glob.
    #[serde(default = "default_max_glob_targets")]
    pub max_glob_targets: usize,
    /// Server entries keyed by name (e.g. "rust").
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for LspSettings {
    fn default() -> Self {
        Self {
            format_on_write: true,
            diagnostics_on_write: true,
            request_timeout_ms: default_request_timeout_ms(),
            warmup_timeout_ms: default_warmup_timeout_ms(),
            diagnostics_timeout_ms: default_diagnostics_timeout_ms(),
            batch_diagnostics_timeout_ms: default_batch_diagnostics_timeout_ms(),
            write_deadline_ms: default_write_deadline_ms(),
            idle_timeout_ms: None,
            idle_check_interval_ms: default_idle_check_interval_ms(),
            max_glob_targets: default_max_glob_targets(),
            servers: BTreeMap::new(),
        }
    }
}

impl LspSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let durations = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("warmup_timeout_ms", self.warmup_timeout_ms),
            ("diagnostics_timeout_ms", self.diagnostics_timeout_ms),
            (
                "batch_diagnostics_timeout_ms",
                self.batch_diagnostics_timeout_ms,
            ),
            ("write_deadline_ms", self.write_deadline_ms),
            ("idle_check_interval_ms", self.idle_check_interval_ms),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(SettingsError::ZeroDuration { field });
        }
        if self.idle_timeout_ms == Some(0) {
            return Err(SettingsError::ZeroDuration {
                field: "idle_timeout_ms",
            });
        }
        if self.max_glob_targets == 0 {
            return Err(SettingsError::ZeroGlobTargets);
        }
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    #[must_use]
    pub fn diagnostics_timeout(&self) -> Duration {
        Duration::from_millis(self.diagnostics_timeout_ms)
    }

    #[must_use]
    pub fn batch_diagnostics_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_diagnostics_timeout_ms)
    }

    #[must_use]
    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }
}
