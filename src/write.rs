// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write handler integration trait.
//!
//! The application supplies a [`WriteHandler`] per collection. It performs
//! the real persistence (usually an HTTP call to its own API) and returns
//! the transaction id the durable store assigned, so the engine can match
//! it against the change stream.
//!
//! # Example
//!
//! ```rust
//! use sync_collection::write::{MutationIntent, WriteAck, WriteFuture, WriteHandler};
//!
//! struct TodoApi;
//!
//! impl WriteHandler for TodoApi {
//!     fn on_update(&self, intent: MutationIntent) -> WriteFuture<'_> {
//!         Box::pin(async move {
//!             // PATCH /todos/{key} ... returns {"txid": 42}
//!             let _ = intent.key;
//!             Ok(WriteAck::new(42u64))
//!         })
//!     }
//! }
//! ```
//!
//! Handlers only need the operations their collection allows; the default
//! implementations reject.

use crate::store::{Key, MutationId, Row};
use crate::stream::{ChangeOp, Txid};
use std::future::Future;
use std::pin::Pin;

/// Result type for write handler operations.
pub type WriteResult<T> = std::result::Result<T, WriteError>;

/// Boxed future returned by write handlers.
pub type WriteFuture<'a> = Pin<Box<dyn Future<Output = WriteResult<WriteAck>> + Send + 'a>>;

/// Error reported by a write handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError(pub String);

impl WriteError {
    pub fn new(message: impl Into<String>) -> Self {
        WriteError(message.into())
    }
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for WriteError {}

/// Successful write: the confirmation token to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub txid: Txid,
}

impl WriteAck {
    pub fn new(txid: impl Into<Txid>) -> Self {
        Self { txid: txid.into() }
    }
}

/// What the application is asked to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationIntent {
    /// Collection the mutation belongs to.
    pub collection: String,
    /// Local id of the optimistic mutation.
    pub mutation_id: MutationId,
    /// Operation.
    pub kind: ChangeOp,
    /// Row key.
    pub key: Key,
    /// Effective row before the mutation, if any.
    pub original: Option<Row>,
    /// Effective row the mutation produces. `None` for deletes.
    pub modified: Option<Row>,
    /// Fields the caller supplied: the full row for inserts, the patch for
    /// updates, empty for deletes.
    pub changes: Row,
}

/// Persists mutations for one collection.
pub trait WriteHandler: Send + Sync + 'static {
    /// Persist a new row.
    fn on_insert(&self, intent: MutationIntent) -> WriteFuture<'_> {
        unsupported(intent)
    }

    /// Persist a partial update.
    fn on_update(&self, intent: MutationIntent) -> WriteFuture<'_> {
        unsupported(intent)
    }

    /// Persist a delete.
    fn on_delete(&self, intent: MutationIntent) -> WriteFuture<'_> {
        unsupported(intent)
    }
}

fn unsupported<'a>(intent: MutationIntent) -> WriteFuture<'a> {
    Box::pin(async move {
        Err(WriteError(format!(
            "collection {} has no {} handler",
            intent.collection, intent.kind
        )))
    })
}

/// Route an intent to the handler method for its kind.
pub(crate) fn dispatch(handler: &dyn WriteHandler, intent: MutationIntent) -> WriteFuture<'_> {
    match intent.kind {
        ChangeOp::Insert => handler.on_insert(intent),
        ChangeOp::Update => handler.on_update(intent),
        ChangeOp::Delete => handler.on_delete(intent),
    }
}

/// Handler for collections that never accept local writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

impl WriteHandler for ReadOnly {}

/// Adapter that sends every intent to one async closure.
pub struct FnWriteHandler<F> {
    f: F,
}

/// Build a [`WriteHandler`] from a closure.
///
/// ```rust
/// use sync_collection::write::{write_handler_fn, WriteAck};
///
/// let handler = write_handler_fn(|intent| async move {
///     let _ = intent.kind;
///     Ok(WriteAck::new(7u64))
/// });
/// # let _ = handler;
/// ```
pub fn write_handler_fn<F, Fut>(f: F) -> FnWriteHandler<F>
where
    F: Fn(MutationIntent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WriteResult<WriteAck>> + Send + 'static,
{
    FnWriteHandler { f }
}

impl<F, Fut> FnWriteHandler<F>
where
    F: Fn(MutationIntent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WriteResult<WriteAck>> + Send + 'static,
{
    fn call(&self, intent: MutationIntent) -> WriteFuture<'_> {
        Box::pin((self.f)(intent))
    }
}

impl<F, Fut> WriteHandler for FnWriteHandler<F>
where
    F: Fn(MutationIntent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WriteResult<WriteAck>> + Send + 'static,
{
    fn on_insert(&self, intent: MutationIntent) -> WriteFuture<'_> {
        self.call(intent)
    }

    fn on_update(&self, intent: MutationIntent) -> WriteFuture<'_> {
        self.call(intent)
    }

    fn on_delete(&self, intent: MutationIntent) -> WriteFuture<'_> {
        self.call(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(kind: ChangeOp) -> MutationIntent {
        MutationIntent {
            collection: "todos".to_string(),
            mutation_id: MutationId(1),
            kind,
            key: Key::from("todo-1"),
            original: None,
            modified: None,
            changes: Row::new(),
        }
    }

    #[tokio::test]
    async fn test_read_only_rejects_everything() {
        for kind in [ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete] {
            let err = dispatch(&ReadOnly, intent(kind)).await.unwrap_err();
            assert!(err.0.contains(kind.as_str()));
            assert!(err.0.contains("todos"));
        }
    }

    #[tokio::test]
    async fn test_partial_handler_routes_by_kind() {
        struct UpdatesOnly;
        impl WriteHandler for UpdatesOnly {
            fn on_update(&self, _intent: MutationIntent) -> WriteFuture<'_> {
                Box::pin(async { Ok(WriteAck::new(42u64)) })
            }
        }

        let ack = dispatch(&UpdatesOnly, intent(ChangeOp::Update)).await.unwrap();
        assert_eq!(ack.txid, Txid(42));
        assert!(dispatch(&UpdatesOnly, intent(ChangeOp::Delete)).await.is_err());
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = write_handler_fn(|intent: MutationIntent| async move {
            match intent.kind {
                ChangeOp::Delete => Err(WriteError::new("deletes disabled")),
                _ => Ok(WriteAck::new(intent.mutation_id.0 + 100)),
            }
        });

        assert_eq!(
            dispatch(&handler, intent(ChangeOp::Insert)).await.unwrap().txid,
            Txid(101)
        );
        assert_eq!(
            dispatch(&handler, intent(ChangeOp::Delete)).await.unwrap_err(),
            WriteError::new("deletes disabled")
        );
    }
}
