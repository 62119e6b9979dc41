//! Shared infrastructure utilities for Quill.
//!
//! - **`atomic_write`**: Crash-safe full-file persistence (temp + rename)

pub mod atomic_write;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, PersistMode, atomic_write, atomic_write_with_options,
};
