//! # Sync Collection
//!
//! Client-side synchronized collections: a local, queryable mirror of a
//! server-defined shape, with optimistic writes that are confirmed when
//! they come back through the shape log.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              Collection                                   │
//! │                                                                           │
//! │  ┌────────────────┐   ┌──────────────┐   ┌──────────────────────────────┐ │
//! │  │ ShapeTransport │──►│ ingest task  │──►│ LocalStore                   │ │
//! │  │ (HTTP / memory)│   │ (cursor)     │   │ base + optimistic overlay    │ │
//! │  └────────────────┘   └──────────────┘   └──────────────────────────────┘ │
//! │                              │ txids          ▲                │          │
//! │                              ▼                │ overlay        ▼          │
//! │                    ┌─────────────────────┐    │     ┌─────────────────┐   │
//! │  insert/update ───►│ MutationCoordinator │────┘     │ QueryRegistry   │──►│── LiveQuery
//! │  /delete           │ (per-key, timeouts) │          │ (incremental)   │   │
//! │                    └─────────────────────┘          └─────────────────┘   │
//! │                              │                                            │
//! │                              ▼                                            │
//! │                        WriteHandler (application)                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Mutation Round Trip
//!
//! 1. `update()` validates, installs an overlay entry (visible immediately)
//! 2. The write handler persists the change and returns a txid
//! 3. The shape log later delivers a change carrying that txid
//! 4. The overlay is dropped in the same step the base row is applied,
//!    so readers never see the old value again
//!
//! A rejected write or a txid that never arrives rolls the overlay back.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sync_collection::{Collection, CollectionConfig, HttpShapeTransport, QuerySpec, ShapeDefinition};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sync_collection::Result<()> {
//!     let transport = Arc::new(HttpShapeTransport::new("http://localhost:3000")?);
//!     let config = CollectionConfig::new("todos", ShapeDefinition::table("todos"));
//!
//!     let todos = Collection::builder(config, transport).key_field("id").open()?;
//!     todos.wait_ready().await?;
//!
//!     let mut open = todos.live_query(QuerySpec::all().where_eq("completed", false));
//!     while let Some(result) = open.recv().await {
//!         println!("{} open todos", result.len());
//!     }
//!
//!     todos.close().await;
//!     Ok(())
//! }
//! ```

pub mod collection;
pub mod config;
pub mod cursor;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod mutation;
pub mod query;
pub mod resilience;
pub mod shape;
pub mod store;
pub mod stream;
pub mod transport;
pub mod write;

// Re-exports for convenience
pub use collection::{Collection, CollectionBuilder, CollectionHealth, CollectionStatus, KeyExtractor};
pub use config::{CollectionConfig, ConflictPolicy, IngestConfig, MutationConfig, TxidMatch};
pub use cursor::{Offset, ShapeCursor};
pub use error::{ErrorKind, Result, SyncError};
pub use manager::CollectionManager;
pub use mutation::{MutationHandle, MutationOptions, MutationState};
pub use query::{Direction, LiveQuery, QueryId, QueryResult, QuerySpec, QuerySubscription};
pub use shape::ShapeDefinition;
pub use store::{Key, MutationId, Row};
pub use stream::{ChangeEvent, ChangeOp, ShapeBatch, Txid};
pub use transport::{FetchRequest, HttpShapeTransport, MemoryShapeSource, ShapeTransport};
pub use write::{write_handler_fn, MutationIntent, WriteAck, WriteError, WriteHandler};
