//! Error types for picolink.
//!
//! Link-level failures (open errors, read errors, handshake stalls) are
//! recovered internally by the reconnect loop and never surface here;
//! upload failures are reported as [`crate::UploadOutcome`] values. What
//! remains fallible at the public boundary is spawning and shutting down
//! the worker.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for picolink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for picolink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (worker spawn, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The link worker did not exit within the join timeout.
    #[error("Link worker did not stop within {0:?}")]
    JoinTimeout(Duration),

    /// The link worker is no longer running.
    #[error("Link worker has already stopped")]
    WorkerGone,
}
