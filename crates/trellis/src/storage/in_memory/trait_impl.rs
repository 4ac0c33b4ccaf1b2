//! IssueStore trait implementation for the in-memory store.

use super::InMemoryStore;
use crate::domain::{IssueId, IssueNode, RelationEdge, RelationId};
use crate::error::{Error, Result};
use crate::storage::IssueStore;
use async_trait::async_trait;

#[async_trait]
impl IssueStore for InMemoryStore {
    async fn allocate_issue_id(&mut self) -> Result<IssueId> {
        let mut inner = self.lock().await;
        Ok(inner.next_issue_id())
    }

    async fn allocate_relation_id(&mut self) -> Result<RelationId> {
        let mut inner = self.lock().await;
        Ok(inner.next_relation_id())
    }

    async fn load_node(&self, id: IssueId) -> Result<Option<IssueNode>> {
        let inner = self.lock().await;
        Ok(inner.nodes.get(&id).cloned())
    }

    async fn load_subtree(&self, root: IssueId) -> Result<Vec<IssueNode>> {
        let inner = self.lock().await;
        inner.subtree(root)
    }

    async fn load_relations(&self, issue: IssueId) -> Result<Vec<RelationEdge>> {
        let inner = self.lock().await;
        Ok(inner
            .edges
            .values()
            .filter(|edge| edge.involves(issue))
            .cloned()
            .collect())
    }

    async fn save_nodes(&mut self, nodes: &[IssueNode]) -> Result<Vec<IssueNode>> {
        let mut inner = self.lock().await;

        // === Phase 1: Validate every version (no mutations) ===
        inner.interfere(nodes);
        inner.check_versions(nodes)?;

        // === Phase 2: Write ===
        Ok(inner.write(nodes))
    }

    async fn delete_nodes(&mut self, ids: &[IssueId]) -> Result<()> {
        let mut inner = self.lock().await;
        for id in ids {
            inner.nodes.remove(id);
            inner.interference.remove(id);
        }
        Ok(())
    }

    async fn save_edges(&mut self, edges: &[RelationEdge]) -> Result<()> {
        let mut inner = self.lock().await;
        for edge in edges {
            inner.insert_edge(edge);
        }
        Ok(())
    }

    async fn delete_edge(&mut self, id: RelationId) -> Result<()> {
        let mut inner = self.lock().await;
        inner
            .edges
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::RelationNotFound(id))
    }
}
