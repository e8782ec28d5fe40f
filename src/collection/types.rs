//! Collection status and supporting types.
//!
//! # Status Transitions
//!
//! ```text
//!                 open()
//! Created ──────────────────→ Loading
//!                               │  ▲
//!            (first up-to-date) │  │ (transport error before ready)
//!                               ▼  │
//!            ┌───────────────► Ready ◄───────┐
//!            │                  │            │ (fetch succeeds)
//!            │   (fetch fails)  ▼            │
//!            │                Stale ─────────┘
//!            │                  │
//!            │  (retries exhausted)
//!            │                  ▼
//!            │               Failed
//!            │
//!   close() from any state ───→ Closed
//! ```
//!
//! - **Created**: constructed, ingestion not started yet.
//! - **Loading**: fetching the initial snapshot. Reads work, live queries wait.
//! - **Ready**: caught up at least once; live queries are emitting.
//! - **Stale**: the shape source is unreachable. Reads and queries serve the
//!   last known state, flagged stale.
//! - **Failed**: ingestion gave up (bounded retries only). Reads still work.
//! - **Closed**: torn down. Pending mutations were cancelled.

use crate::cursor::ShapeCursor;
use crate::store::{Key, Row};
use std::fmt;
use std::sync::Arc;

/// Status of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    /// Constructed, ingestion not started.
    Created,
    /// Loading the initial snapshot.
    Loading,
    /// Caught up; live queries emitting.
    Ready,
    /// Serving last known state while the source is unreachable.
    Stale,
    /// Ingestion gave up.
    Failed,
    /// Closed by the owner.
    Closed,
}

impl CollectionStatus {
    /// Check if the collection will never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CollectionStatus::Closed | CollectionStatus::Failed)
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionStatus::Created => write!(f, "Created"),
            CollectionStatus::Loading => write!(f, "Loading"),
            CollectionStatus::Ready => write!(f, "Ready"),
            CollectionStatus::Stale => write!(f, "Stale"),
            CollectionStatus::Failed => write!(f, "Failed"),
            CollectionStatus::Closed => write!(f, "Closed"),
        }
    }
}

/// Derives a row's key.
#[derive(Clone)]
pub struct KeyExtractor(Arc<dyn Fn(&Row) -> Option<Key> + Send + Sync>);

impl KeyExtractor {
    /// Use a custom function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Row) -> Option<Key> + Send + Sync + 'static,
    {
        KeyExtractor(Arc::new(f))
    }

    /// Read the key from one field (string or integer).
    pub fn field(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |row| row.get(&name).and_then(Key::from_value))
    }

    /// Extract the key from a row.
    pub fn extract(&self, row: &Row) -> Option<Key> {
        (self.0)(row)
    }
}

impl Default for KeyExtractor {
    /// The `id` field.
    fn default() -> Self {
        Self::field("id")
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyExtractor(..)")
    }
}

/// Point-in-time health snapshot of a collection.
///
/// Built from in-memory state only; no I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionHealth {
    pub id: String,
    pub status: CollectionStatus,
    /// Caught up at least once.
    pub ready: bool,
    pub cursor: ShapeCursor,
    /// Confirmed rows.
    pub base_rows: usize,
    /// Rows visible to readers (base plus overlay).
    pub visible_rows: usize,
    pub pending_mutations: usize,
    pub live_queries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_display() {
        assert_eq!(CollectionStatus::Created.to_string(), "Created");
        assert_eq!(CollectionStatus::Loading.to_string(), "Loading");
        assert_eq!(CollectionStatus::Ready.to_string(), "Ready");
        assert_eq!(CollectionStatus::Stale.to_string(), "Stale");
        assert_eq!(CollectionStatus::Failed.to_string(), "Failed");
        assert_eq!(CollectionStatus::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_status_terminal() {
        assert!(CollectionStatus::Closed.is_terminal());
        assert!(CollectionStatus::Failed.is_terminal());
        assert!(!CollectionStatus::Stale.is_terminal());
        assert!(!CollectionStatus::Ready.is_terminal());
    }

    #[test]
    fn test_key_extractor_field() {
        let extractor = KeyExtractor::field("id");
        let row = json!({"id": "todo-1"}).as_object().cloned().unwrap();
        assert_eq!(extractor.extract(&row), Some(Key::from("todo-1")));

        let numeric = json!({"id": 7}).as_object().cloned().unwrap();
        assert_eq!(extractor.extract(&numeric), Some(Key::from("7")));

        let missing = json!({"title": "x"}).as_object().cloned().unwrap();
        assert_eq!(extractor.extract(&missing), None);
    }

    #[test]
    fn test_key_extractor_custom() {
        let extractor = KeyExtractor::new(|row| {
            let list = row.get("list")?.as_str()?;
            let pos = row.get("pos")?.as_u64()?;
            Some(Key::new(format!("{}:{}", list, pos)))
        });
        let row = json!({"list": "groceries", "pos": 3}).as_object().cloned().unwrap();
        assert_eq!(extractor.extract(&row), Some(Key::from("groceries:3")));
        assert_eq!(format!("{:?}", extractor), "KeyExtractor(..)");
    }
}
