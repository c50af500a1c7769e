//! Native TDLib JSON boundary.
//!
//! This crate handles:
//! * The [`NativeClient`] primitives every TDLib JSON instance exposes
//!   (non-blocking send, blocking receive with a timeout, synchronous execute)
//! * Loading `libtdjson` at runtime ([`TdJsonLibrary`])
//! * An in-memory stand-in for tests and offline runs ([`MemoryLibrary`])
//!
//! Nothing here understands the JSON it moves: requests and events cross the
//! boundary as opaque strings.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod dynamic;
pub mod memory;

pub use dynamic::{TdJsonClient, TdJsonLibrary};
pub use memory::{MemoryClient, MemoryLibrary};

use std::sync::Arc;
use std::time::Duration;

// ─── NativeClient ─────────────────────────────────────────────────────────────

/// One opaque native client instance.
///
/// `send` and `execute` may be called from any thread. `receive` must only
/// ever be called from one thread at a time per instance.
pub trait NativeClient: Send + Sync {
    /// Queue a JSON request. Never blocks on the network.
    fn send(&self, request: &str) -> Result<(), NativeError>;

    /// Wait up to `timeout` for the next event. `None` means nothing arrived.
    fn receive(&self, timeout: Duration) -> Option<String>;

    /// Run a request that the library can answer locally and synchronously.
    fn execute(&self, request: &str) -> Result<Option<String>, NativeError>;
}

// ─── NativeLibrary ────────────────────────────────────────────────────────────

/// A factory for [`NativeClient`] instances.
pub trait NativeLibrary: Send + Sync {
    /// Create a fresh client instance.
    fn create(&self) -> Result<Arc<dyn NativeClient>, NativeError>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── NativeError ──────────────────────────────────────────────────────────────

/// Failures at the native boundary.
#[derive(Debug, thiserror::Error)]
pub enum NativeError {
    /// The shared library could not be opened.
    #[error("failed to load {path}: {reason}")]
    Load {
        /// Path or file name that was tried.
        path:   String,
        /// Loader error text.
        reason: String,
    },
    /// The shared library lacks a required entry point.
    #[error("missing symbol {0}")]
    MissingSymbol(&'static str),
    /// The library returned a null instance.
    #[error("native client creation failed")]
    CreateFailed,
    /// A request contained an interior NUL byte.
    #[error("request contains an interior NUL byte")]
    InvalidString,
    /// The instance was closed and accepts nothing more.
    #[error("native client closed")]
    Closed,
}
