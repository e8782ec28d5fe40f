// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for synchronized collections.
//!
//! Errors fall into two groups: those the engine recovers from on its own
//! (transport failures, invalidated cursors) and those that are always
//! surfaced to the caller of a specific mutation.
//!
//! # Error Categories
//!
//! | Error Type | Surfaced to | Description |
//! |------------|-------------|-------------|
//! | `Transport` | nobody (retried) | Shape source unreachable, request failed |
//! | `CursorInvalid` | nobody (resnapshot) | Source can no longer resume from our cursor |
//! | `WriteRejected` | mutation caller | Write handler returned an error |
//! | `ConfirmationTimeout` | mutation caller | No matching txid observed in time |
//! | `ConflictingKeyMutation` | mutation caller | Key busy and policy is reject-concurrent |
//! | `KeyExists` / `KeyNotFound` / `InvalidRow` | mutation caller | Local validation failed |
//! | `Cancelled` | mutation caller | Collection closed while mutation was in flight |
//! | `Config` | opener | Configuration invalid |
//! | `InvalidState` / `Closed` | caller | Lifecycle violation |
//! | `Internal` | caller | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`SyncError::is_retryable()`] to decide whether an operation should be
//! retried with backoff. Only transport errors are retryable. Write failures
//! are never retried by the engine: the caller decides.

use std::time::Duration;
use thiserror::Error;

use crate::stream::Txid;

/// Result type alias for collection operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification of a [`SyncError`], for callers that branch on the
/// kind of failure rather than its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    CursorInvalid,
    WriteRejected,
    ConfirmationTimeout,
    ConflictingKeyMutation,
    Validation,
    Cancelled,
    Config,
    Lifecycle,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::CursorInvalid => "cursor_invalid",
            ErrorKind::WriteRejected => "write_rejected",
            ErrorKind::ConfirmationTimeout => "confirmation_timeout",
            ErrorKind::ConflictingKeyMutation => "conflicting_key_mutation",
            ErrorKind::Validation => "validation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Lifecycle => "lifecycle",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while syncing or mutating a collection.
///
/// Use [`kind()`](Self::kind) to classify and
/// [`is_retryable()`](Self::is_retryable) to check retry semantics.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The shape source could not be reached or returned a bad response.
    ///
    /// Retried with backoff by the ingestion task; the collection stays
    /// readable from its last known base state.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The source cannot resume from the supplied cursor.
    ///
    /// Recovered locally by a full resnapshot. Never surfaced to mutation callers.
    #[error("Cursor no longer valid for shape {shape_id}")]
    CursorInvalid { shape_id: String },

    /// The write handler rejected the mutation. The optimistic state was rolled back.
    #[error("Write rejected for key {key}: {message}")]
    WriteRejected { key: String, message: String },

    /// The write handler succeeded but its txid never showed up in the stream.
    ///
    /// The write may have been persisted server-side. Only the optimistic
    /// view was rolled back; nothing is re-sent.
    #[error("Confirmation timeout for key {key} awaiting txid {txid} after {timeout:?}")]
    ConfirmationTimeout {
        key: String,
        txid: Txid,
        timeout: Duration,
    },

    /// Another mutation on the same key is in flight and the collection
    /// rejects concurrent writes per key.
    #[error("Conflicting mutation in flight for key {key}")]
    ConflictingKeyMutation { key: String },

    /// Insert of a key that already has an effective row.
    #[error("Key already exists: {0}")]
    KeyExists(String),

    /// Update or delete of a key with no effective row.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The proposed row is malformed (not an object, or no key could be extracted).
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// The collection was closed while the mutation was in flight.
    #[error("Mutation cancelled for key {key}: collection closed")]
    Cancelled { key: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The collection (or manager) has been closed.
    #[error("Collection closed: {0}")]
    Closed(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a transport error from a reqwest error.
    pub fn transport(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without a source.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::CursorInvalid { .. } => ErrorKind::CursorInvalid,
            Self::WriteRejected { .. } => ErrorKind::WriteRejected,
            Self::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            Self::ConflictingKeyMutation { .. } => ErrorKind::ConflictingKeyMutation,
            Self::KeyExists(_) | Self::KeyNotFound(_) | Self::InvalidRow(_) => {
                ErrorKind::Validation
            }
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidState { .. } | Self::Closed(_) => ErrorKind::Lifecycle,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::transport("unknown", e)
    }
}
