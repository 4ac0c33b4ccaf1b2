//! Persistence abstraction for trellis.
//!
//! The tracker keeps its working set in memory and writes every committed
//! change through an [`IssueStore`]. Stores own identifier allocation and
//! optimistic concurrency: each node carries a `lock_version` that a save
//! must match.
//!
//! # Architecture
//!
//! The trait is async so that embedding applications can back it with a
//! database, and object-safe so the tracker holds a `Box<dyn IssueStore>`.
//! An ephemeral [`in_memory::InMemoryStore`] ships with the crate.
//!
//! # Example
//!
//! ```no_run
//! use trellis::storage::{IssueStore, in_memory::new_in_memory_store};
//! use trellis::domain::IssueId;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let store = new_in_memory_store();
//!     let node = store.load_node(IssueId(1)).await?;
//!     println!("Loaded: {:?}", node);
//!     Ok(())
//! }
//! ```

use crate::domain::{IssueId, IssueNode, RelationEdge, RelationId};
use crate::error::Result;
use async_trait::async_trait;

pub mod in_memory;

/// Core storage trait for issue trees and relations.
///
/// Implementations must be `Send + Sync` to support use across tasks.
///
/// # Method Categories
///
/// - **Identifiers**: `allocate_issue_id`, `allocate_relation_id`
/// - **Loading**: `load_node`, `load_subtree`, `load_relations`
/// - **Writing**: `save_nodes`, `delete_nodes`, `save_edges`, `delete_edge`
///
/// # Concurrency
///
/// `save_nodes` is all-or-nothing per call. A node whose `lock_version`
/// differs from the stored one fails the whole batch with
/// `Error::Conflict`; new nodes must carry version `0`.
#[async_trait]
pub trait IssueStore: Send + Sync {
    // ========== Identifiers ==========

    /// Reserve a new issue id. Ids are never reused.
    async fn allocate_issue_id(&mut self) -> Result<IssueId>;

    /// Reserve a new relation id. Ids grow monotonically.
    async fn allocate_relation_id(&mut self) -> Result<RelationId>;

    // ========== Loading ==========

    /// Load a single node. Returns `None` if it doesn't exist.
    async fn load_node(&self, id: IssueId) -> Result<Option<IssueNode>>;

    /// Load every node of the tree rooted at `root`, ordered by left bound.
    ///
    /// # Errors
    ///
    /// Returns `Error::IssueNotFound` if `root` doesn't exist.
    async fn load_subtree(&self, root: IssueId) -> Result<Vec<IssueNode>>;

    /// Load every relation touching `issue`, in creation order.
    async fn load_relations(&self, issue: IssueId) -> Result<Vec<RelationEdge>>;

    // ========== Writing ==========

    /// Insert or update nodes.
    ///
    /// Returns the stored copies with their bumped `lock_version`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if any node is stale; nothing is written.
    async fn save_nodes(&mut self, nodes: &[IssueNode]) -> Result<Vec<IssueNode>>;

    /// Delete nodes. Unknown ids are ignored.
    async fn delete_nodes(&mut self, ids: &[IssueId]) -> Result<()>;

    /// Insert or replace relations.
    async fn save_edges(&mut self, edges: &[RelationEdge]) -> Result<()>;

    /// Delete a relation.
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotFound` if it doesn't exist.
    async fn delete_edge(&mut self, id: RelationId) -> Result<()>;
}
