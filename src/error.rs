// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication core.
//!
//! One enum covers every subsystem so that `?` composes across the crate:
//!
//! | Variant        | Source                                        | Retryable |
//! |----------------|-----------------------------------------------|-----------|
//! | `Io`           | socket/file I/O                               | yes       |
//! | `Handshake`    | malformed 22-byte subscriber handshake        | no        |
//! | `Frame`        | malformed block frame or repair request       | no        |
//! | `Store`        | index-file structure violations               | no        |
//! | `Corruption`   | duplicate open index block, bad control block | no (*)    |
//! | `Bootstrap`    | upstream full-index fetch failed/timed out    | yes       |
//! | `Config`       | invalid configuration                         | no        |
//! | `InvalidState` | lifecycle misuse (start twice, etc.)          | no        |
//! | `Shutdown`     | operation interrupted by shutdown             | no        |
//! | `Internal`     | bugs, poisoned locks                          | no        |
//!
//! (*) Corruption is never retried in place; it triggers a full re-bootstrap
//! of the affected file.

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Socket or file I/O failure. The operation context says which.
    #[error("i/o failure during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// The subscriber handshake could not be parsed or carried bad fields.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// A block frame or out-of-band repair request violated the wire format.
    #[error("bad frame: {0}")]
    Frame(String),

    /// An index-file operation hit a structural problem (bad pointer, range
    /// outside the region, writer conflict).
    #[error("store failure on {file}: {message}")]
    Store { file: String, message: String },

    /// The file's index structure is damaged and must be rebuilt from the
    /// upstream copy.
    #[error("corruption detected in {file}: {message}")]
    Corruption { file: String, message: String },

    /// Fetching the full index from upstream failed or timed out.
    #[error("bootstrap of {file} failed: {message}")]
    Bootstrap { file: String, message: String },

    /// Configuration validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState { expected: String, actual: String },

    /// The engine is shutting down; the operation was abandoned.
    #[error("shutting down")]
    Shutdown,

    /// Should-not-happen conditions (poisoned locks, closed channels).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Whether the caller should retry after backoff. Transient I/O and
    /// bootstrap fetches are; protocol and structure violations are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Io { .. } | ReplicationError::Bootstrap { .. }
        )
    }

    pub fn io(operation: &'static str, source: io::Error) -> Self {
        ReplicationError::Io { operation, source }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        ReplicationError::Frame(message.into())
    }

    pub fn store(file: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicationError::Store {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn corruption(file: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicationError::Corruption {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn bootstrap(file: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicationError::Bootstrap {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        ReplicationError::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ReplicationError::Internal(message.into())
    }
}
