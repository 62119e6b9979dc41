//! External linter adapters: tools with no protocol, only lint and format.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{LspError, Result};
use crate::types::Diagnostic;

pub type LinterFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A non-protocol integration. There is no open/change/version concept:
/// `lint` reads the file from disk, `format` returns new content.
pub trait LinterAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn lint<'a>(
        &'a self,
        path: &'a Path,
        cancel: &'a CancellationToken,
    ) -> LinterFut<'a, Vec<Diagnostic>>;

    fn format<'a>(
        &'a self,
        path: &'a Path,
        content: &'a str,
        cancel: &'a CancellationToken,
    ) -> LinterFut<'a, String>;

    /// Whether `format` does anything useful.
    fn can_format(&self) -> bool {
        true
    }
}

/// Placeholder in argument lists replaced by the target file path.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Formats by piping content through a command's stdin and reading stdout,
/// e.g. `rustfmt --emit stdout` or `prettier --stdin-filepath {file}`.
/// Reports no diagnostics.
#[derive(Debug, Clone)]
pub struct CommandFormatter {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandFormatter {
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    fn error(&self, message: impl Into<String>) -> LspError {
        LspError::Linter {
            adapter: self.name.clone(),
            message: message.into(),
        }
    }

    async fn run(&self, path: &Path, content: &str) -> Result<String> {
        let file = path.to_string_lossy();
        let args = self
            .args
            .iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, &file));

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        for (key, _) in std::env::vars_os() {
            if let Some(key) = key.to_str()
                && quill_types::is_secret_env_var(key)
            {
                cmd.env_remove(key);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.error(format!("spawning {}: {e}", self.program)))?;
        // Feed stdin while stdout drains; a formatter that echoes more than the
        // pipe buffer would otherwise block both sides.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| self.error(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.error(format!("{}: {}", output.status, stderr.trim())));
        }
        match fed {
            // Formatters driven by the file placeholder may never read stdin.
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                return Err(self.error(format!("writing stdin: {e}")));
            }
            _ => {}
        }
        String::from_utf8(output.stdout).map_err(|_| self.error("output is not valid UTF-8"))
    }
}

impl LinterAdapter for CommandFormatter {
    fn name(&self) -> &str {
        &self.name
    }

    fn lint<'a>(
        &'a self,
        _path: &'a Path,
        _cancel: &'a CancellationToken,
    ) -> LinterFut<'a, Vec<Diagnostic>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn format<'a>(
        &'a self,
        path: &'a Path,
        content: &'a str,
        cancel: &'a CancellationToken,
    ) -> LinterFut<'a, String> {
        Box::pin(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(LspError::Cancelled),
                result = self.run(path, content) => result,
            }
        })
    }
}
