//! Public data types shared by the connection, diagnostics, and write layers.

use std::fmt;
use std::path::Path;

/// Severity level for a diagnostic. Ordered most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// Zero-based line and UTF-16 column, as the protocol reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Single-line range helper, mostly for adapters and tests.
    #[must_use]
    pub const fn line(line: u32, start_col: u32, end_col: u32) -> Self {
        Self {
            start: Position::new(line, start_col),
            end: Position::new(line, end_col),
        }
    }
}

/// A single diagnostic from a language server or linter adapter.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    range: Range,
    /// Producer of the diagnostic (e.g. "rustc", "eslint").
    source: String,
    code: Option<String>,
    tags: Vec<u8>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: impl Into<String>,
        range: Range,
        source: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            range,
            source: source.into(),
            code: None,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<u8>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    /// 0-indexed start line.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.range.start.line
    }

    /// 0-indexed start column.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.range.start.character
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// LSP diagnostic tags (1 = unnecessary, 2 = deprecated).
    #[must_use]
    pub fn tags(&self) -> &[u8] {
        &self.tags
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        let code = self
            .code
            .as_deref()
            .map(|code| format!(" ({code})"))
            .unwrap_or_default();
        format!(
            "{}:{}:{}: {}: [{}] {}{code}",
            path.display(),
            self.line() + 1,
            self.col() + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Lifecycle state of a registry entry, as reported by status listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Starting,
    Ready,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }
}

/// One line of the read-only status listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub name: String,
    pub state: ConnectionState,
    pub file_types: Vec<String>,
    pub open_files: usize,
    pub cwd: String,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types = if self.file_types.is_empty() {
            String::from("-")
        } else {
            self.file_types.join(",")
        };
        write!(
            f,
            "{}: {} [{}] open={} cwd={}",
            self.name,
            self.state.label(),
            types,
            self.open_files,
            self.cwd
        )
    }
}
