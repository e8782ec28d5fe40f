//! Collection manager.
//!
//! An explicit owner for a set of open collections, keyed by collection id.
//! Callers create one, open collections through it and close it when done;
//! there is no process-wide registry.
//!
//! ```rust,no_run
//! use sync_collection::{Collection, CollectionConfig, CollectionManager, MemoryShapeSource};
//! use std::sync::Arc;
//!
//! # async fn example() -> sync_collection::Result<()> {
//! let manager = CollectionManager::new();
//! let source = Arc::new(MemoryShapeSource::new("todos"));
//! let todos = manager.open(Collection::builder(CollectionConfig::for_testing("todos", "todos"), source))?;
//! todos.wait_ready().await?;
//!
//! manager.close_all().await;
//! # Ok(())
//! # }
//! ```

use crate::collection::{Collection, CollectionBuilder, CollectionHealth};
use crate::error::{Result, SyncError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns open collections by id.
#[derive(Default)]
pub struct CollectionManager {
    collections: DashMap<String, Arc<Collection>>,
    closed: AtomicBool,
}

impl CollectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a collection and register it under its id.
    ///
    /// Fails if a collection with the same id is already open.
    pub fn open(&self, builder: CollectionBuilder) -> Result<Arc<Collection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed("collection manager".to_string()));
        }
        match self.collections.entry(builder.id().to_string()) {
            Entry::Occupied(entry) => Err(SyncError::Config(format!(
                "collection {} is already open",
                entry.key()
            ))),
            Entry::Vacant(slot) => {
                let collection = Arc::new(builder.open()?);
                debug!(collection = %collection.id(), "Registered collection");
                slot.insert(Arc::clone(&collection));
                Ok(collection)
            }
        }
    }

    /// Get an open collection by id.
    pub fn get(&self, id: &str) -> Option<Arc<Collection>> {
        self.collections.get(id).map(|r| r.value().clone())
    }

    /// Ids of all open collections, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.collections.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Health of every open collection, sorted by id.
    pub fn health(&self) -> Vec<CollectionHealth> {
        let mut health: Vec<CollectionHealth> = self.collections.iter().map(|r| r.value().health()).collect();
        health.sort_by(|a, b| a.id.cmp(&b.id));
        health
    }

    /// Close and forget one collection. Returns `false` if it wasn't open.
    pub async fn close(&self, id: &str) -> bool {
        match self.collections.remove(id) {
            Some((_, collection)) => {
                collection.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every collection. Later `open` calls fail.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<String> = self.collections.iter().map(|r| r.key().clone()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Closing all collections");
        }
        for id in ids {
            self.close(&id).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;
    use crate::collection::CollectionStatus;
    use crate::transport::MemoryShapeSource;

    fn builder(id: &str) -> CollectionBuilder {
        let source = Arc::new(MemoryShapeSource::new("todos"));
        Collection::builder(CollectionConfig::for_testing(id, "todos"), source)
    }

    #[tokio::test]
    async fn test_open_and_get() {
        let manager = CollectionManager::new();
        let todos = manager.open(builder("todos")).unwrap();
        manager.open(builder("archive")).unwrap();

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.ids(), vec!["archive", "todos"]);
        assert!(Arc::ptr_eq(&manager.get("todos").unwrap(), &todos));
        assert!(manager.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = CollectionManager::new();
        manager.open(builder("todos")).unwrap();
        let err = manager.open(builder("todos")).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_close_one() {
        let manager = CollectionManager::new();
        let todos = manager.open(builder("todos")).unwrap();

        assert!(manager.close("todos").await);
        assert!(!manager.close("todos").await);
        assert!(manager.is_empty());
        assert_eq!(todos.status(), CollectionStatus::Closed);

        // The id can be reused
        manager.open(builder("todos")).unwrap();
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = CollectionManager::new();
        let a = manager.open(builder("a")).unwrap();
        let b = manager.open(builder("b")).unwrap();

        manager.close_all().await;
        assert!(manager.is_closed());
        assert!(manager.is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(matches!(manager.open(builder("c")), Err(SyncError::Closed(_))));
    }

    #[tokio::test]
    async fn test_health_sorted() {
        let manager = CollectionManager::new();
        manager.open(builder("b")).unwrap();
        manager.open(builder("a")).unwrap();
        manager.get("a").unwrap().wait_ready().await.unwrap();

        let health = manager.health();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].id, "a");
        assert_eq!(health[1].id, "b");
    }
}
