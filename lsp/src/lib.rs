//! Language-intelligence layer: language server connections, diagnostics,
//! and format-on-write.
//!
//! - **`codec`**: `Content-Length` framed JSON-RPC over byte streams
//! - **`connection`**: one server process, request correlation, crash sweep
//! - **`registry`**: one connection per (command, cwd), idle reaping
//! - **`sync`**: per-file open/change/save state under a per-file lock
//! - **`diagnostics`**: staleness-aware waiting, fan-out, merge
//! - **`writethrough`**: sync, format, persist, save, diagnose
//! - **`session`**: the facade editing tools call

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod codec;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod glob;
pub mod handler;
pub mod linter;
pub mod registry;
pub mod resolve;
pub mod session;
pub mod sync;
pub mod types;
pub mod writethrough;

pub(crate) mod protocol;

pub use connection::{CachedDiagnostics, ConnectionOptions, ServerConnection};
pub use diagnostics::{Applicable, FileDiagnostics, GlobDiagnostics, ServerFailure};
pub use error::{LspError, Result};
pub use handler::{DefaultRequestHandler, HandlerFut, ServerRequestHandler};
pub use linter::{CommandFormatter, LinterAdapter, LinterFut};
pub use protocol::ResponseError;
pub use registry::{ConnectionKey, ConnectionRegistry, Connector, ProcessConnector};
pub use resolve::{ConfigResolver, ServerResolver, Target};
pub use session::LspSession;
pub use sync::SyncOutcome;
pub use types::{ConnectionState, ConnectionStatus, Diagnostic, DiagnosticSeverity, Position, Range};
pub use writethrough::{
    BatchFailure, BatchReport, BatchSpec, FileWriteReport, WriteOptions, WriteOutcome,
};

pub use quill_types::{LspSettings, ServerConfig};
