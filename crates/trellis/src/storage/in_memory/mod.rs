//! In-memory store backend.
//!
//! This module provides a fast, **ephemeral** [`IssueStore`] where all data is
//! held in RAM and lost when the process exits. It is suitable for:
//!
//! - Testing and development
//! - Embedding applications that persist snapshots themselves
//!
//! # Architecture
//!
//! - `HashMap<IssueId, IssueNode>` for O(1) node lookups
//! - `BTreeMap<RelationId, RelationEdge>` so relations come back in creation
//!   order
//! - Monotonic counters for issue and relation ids
//!
//! # Thread Safety
//!
//! The data is wrapped in `Arc<Mutex<StoreInner>>`. Cloning an
//! [`InMemoryStore`] yields another handle to the same data, which lets a
//! test keep a handle while the tracker owns the boxed store.

mod inner;
mod trait_impl;

use crate::domain::IssueId;
use crate::storage::IssueStore;
use inner::StoreInner;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Thread-safe in-memory store.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::new())),
        }
    }

    async fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().await
    }

    /// Pretend another writer saves `issue` right before each of the next
    /// `writes` saves that include it, so those saves hit a stale version.
    pub async fn simulate_concurrent_writes(&self, issue: IssueId, writes: u32) {
        let mut inner = self.lock().await;
        inner.interference.insert(issue, writes);
    }

    /// Number of stored nodes.
    pub async fn node_count(&self) -> usize {
        self.lock().await.nodes.len()
    }

    /// Number of stored relations.
    pub async fn edge_count(&self) -> usize {
        self.lock().await.edges.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a new in-memory store instance.
///
/// # Example
///
/// ```
/// use trellis::storage::in_memory::new_in_memory_store;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let store = new_in_memory_store();
///     // Use store...
/// }
/// ```
pub fn new_in_memory_store() -> Box<dyn IssueStore> {
    Box::new(InMemoryStore::new())
}
