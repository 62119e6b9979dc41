//! Quill CLI - drives the language-intelligence layer from the command line.
//!
//! ```text
//! main() -> QuillConfig::load() -> LspSession::new() -> subcommand
//!                                        |
//!                                        v
//!                       SIGINT/SIGTERM -> cancel + shutdown_all()
//! ```
//!
//! Every subcommand shares one session, so a server started while
//! diagnosing is reused by the rest of the run and torn down on exit.

mod config;

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::QuillConfig;
use quill_lsp::{FileDiagnostics, LspSession, WriteOptions, WriteOutcome};

const LOG_ENV: &str = "QUILL_LOG";

#[derive(Debug, Parser)]
#[command(name = "quill", version, about)]
struct Cli {
    /// Config file (default: ~/.quill/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Workspace root; relative paths resolve against it.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured servers and any running connections.
    Status,
    /// Collect diagnostics for a file or glob pattern.
    Diagnose {
        pattern: String,
        /// Maximum number of files to diagnose.
        #[arg(long)]
        max: Option<usize>,
    },
    /// Write content (stdin unless --input) to a file, formatting and
    /// diagnosing it on the way.
    Write {
        path: PathBuf,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        no_format: bool,
        #[arg(long)]
        no_diagnostics: bool,
    },
    /// Format a file in place.
    Format { path: PathBuf },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries command output, so logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    // ~/.quill/logs/quill.log
    QuillConfig::path()
        .and_then(|config| config.parent().map(Path::to_path_buf))
        .map(|dir| dir.join("logs").join("quill.log"))
        .into_iter()
        .collect()
}

/// Cancel in-flight work and stop every server on SIGINT or SIGTERM.
fn install_signal_handlers(session: Arc<LspSession>, cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Signal received; shutting down language servers");
        cancel.cancel();
        session.shutdown_all().await;
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn read_input(input: Option<&Path>) -> Result<String> {
    match input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut content = String::new();
            tokio::io::stdin()
                .read_to_string(&mut content)
                .await
                .context("failed to read stdin")?;
            Ok(content)
        }
    }
}

async fn run(command: Command, session: &LspSession, cancel: &CancellationToken) -> Result<ExitCode> {
    match command {
        Command::Status => {
            for (name, server) in &session.settings().servers {
                let kind = server.adapter_name().unwrap_or(server.command());
                println!("{name}: {kind} [{}]", server.file_extensions().join(", "));
            }
            for status in session.status().await {
                println!("{status}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Diagnose { pattern, max } => {
            let report = session.diagnose_glob(&pattern, max, cancel).await?;
            print!("{report}");
            Ok(exit_for_errors(report.error_count()))
        }
        Command::Write {
            path,
            input,
            no_format,
            no_diagnostics,
        } => {
            let content = read_input(input.as_deref()).await?;
            let defaults = WriteOptions::from_settings(session.settings());
            let options = WriteOptions {
                format: defaults.format && !no_format,
                diagnostics: defaults.diagnostics && !no_diagnostics,
            };
            let outcome = session
                .write_with(&path, content, options, None, cancel)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            match outcome {
                WriteOutcome::Written(report) => {
                    print!("{report}");
                    let errors = report.diagnostics.as_ref().map_or(0, FileDiagnostics::error_count);
                    Ok(exit_for_errors(errors))
                }
                WriteOutcome::Flushed(report) => {
                    print!("{report}");
                    Ok(exit_for_errors(report.error_count()))
                }
                WriteOutcome::Deferred { .. } => Ok(ExitCode::SUCCESS),
            }
        }
        Command::Format { path } => {
            let report = session
                .format_file(&path, cancel)
                .await
                .with_context(|| format!("failed to format {}", path.display()))?;
            print!("{report}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_for_errors(errors: usize) -> ExitCode {
    if errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let config = QuillConfig::load(cli.config)?;
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("failed to resolve working directory")?,
    };
    let session = LspSession::new(config.lsp, root);
    let cancel = CancellationToken::new();
    install_signal_handlers(session.clone(), cancel.clone());

    let result = run(cli.command, &session, &cancel).await;
    let stopped = session.shutdown_all().await;
    tracing::debug!(stopped, "Session closed");

    match result {
        Ok(code) => Ok(code),
        Err(err) if cancel.is_cancelled() => {
            eprintln!("Interrupted: {err:#}");
            Ok(ExitCode::from(130))
        }
        Err(err) => Err(err),
    }
}
