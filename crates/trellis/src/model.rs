//! Loaded working set of issues.
//!
//! A [`Model`] owns the nodes the tracker has loaded together with the
//! hierarchy index and the relation graph built over them. Structural
//! mutations go through the hierarchy and the graph, and [`Model::sync_tree`]
//! copies the resulting coordinates back into the nodes so they can be
//! persisted.

use crate::domain::{IssueId, IssueNode, NewRelation, OrphanPolicy, RelationEdge, RelationId};
use crate::error::{Error, Result};
use crate::graph::RelationGraph;
use crate::hierarchy::{Hierarchy, TreeShift};
use std::collections::HashMap;
use tracing::warn;

/// Issues, hierarchy and relations held in memory
#[derive(Debug, Clone, Default)]
pub struct Model {
    nodes: HashMap<IssueId, IssueNode>,
    hierarchy: Hierarchy,
    relations: RelationGraph,
}

impl Model {
    /// Create an empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a model from persisted nodes and relations.
    ///
    /// Persisted bounds are verified first. If they are inconsistent the
    /// trees are rebuilt from parent links and the nodes updated to match.
    ///
    /// # Errors
    ///
    /// - `Error::ConsistencyViolation` if the parent links themselves are
    ///   broken, or a relation references an issue that was not loaded
    pub fn from_parts(
        nodes: impl IntoIterator<Item = IssueNode>,
        edges: impl IntoIterator<Item = RelationEdge>,
    ) -> Result<Self> {
        let nodes: HashMap<IssueId, IssueNode> =
            nodes.into_iter().map(|node| (node.id, node)).collect();

        let hierarchy = match Hierarchy::from_nodes(nodes.values()) {
            Ok(hierarchy) => hierarchy,
            Err(err) => {
                warn!(error = %err, "Persisted tree bounds are inconsistent, rebuilding");
                Hierarchy::rebuild(nodes.values().map(|node| (node.id, node.parent)))?
            }
        };

        let edges: Vec<RelationEdge> = edges.into_iter().collect();
        for edge in &edges {
            for issue in [edge.issue_from, edge.issue_to] {
                if !nodes.contains_key(&issue) {
                    return Err(Error::ConsistencyViolation(format!(
                        "{} references {issue}, which is not loaded",
                        edge.id
                    )));
                }
            }
        }
        let relations = RelationGraph::from_edges(edges)?;

        let mut model = Self {
            nodes,
            hierarchy,
            relations,
        };
        let ids: Vec<IssueId> = model.nodes.keys().copied().collect();
        model.sync_nodes(&ids)?;
        Ok(model)
    }

    /// Returns `true` if the issue is loaded.
    pub fn contains(&self, id: IssueId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Look up a loaded issue.
    pub fn node(&self, id: IssueId) -> Result<&IssueNode> {
        self.nodes.get(&id).ok_or(Error::IssueNotFound(id))
    }

    pub(crate) fn node_mut(&mut self, id: IssueId) -> Result<&mut IssueNode> {
        self.nodes.get_mut(&id).ok_or(Error::IssueNotFound(id))
    }

    /// Nodes for the given ids, in the given order.
    pub fn nodes_of(&self, ids: &[IssueId]) -> Result<Vec<IssueNode>> {
        ids.iter().map(|&id| self.node(id).cloned()).collect()
    }

    /// Number of loaded issues.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The hierarchy index.
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// The relation graph.
    pub fn relations(&self) -> &RelationGraph {
        &self.relations
    }

    /// Replace a loaded node with a fresher copy (after a save or reload).
    ///
    /// Tree coordinates always come from the hierarchy index.
    pub(crate) fn replace_node(&mut self, node: IssueNode) -> Result<()> {
        let id = node.id;
        if !self.nodes.contains_key(&id) {
            return Err(Error::IssueNotFound(id));
        }
        self.nodes.insert(id, node);
        self.sync_nodes(&[id])
    }

    /// Add a node as its own single-node tree.
    pub(crate) fn insert_node(&mut self, node: IssueNode) -> Result<()> {
        self.hierarchy.insert(node.id)?;
        let id = node.id;
        self.nodes.insert(id, node);
        self.sync_nodes(&[id])
    }

    /// Merge freshly loaded trees and relations into the model.
    ///
    /// Nodes already present are left as they are. On error the model is
    /// unchanged.
    pub(crate) fn merge(
        &mut self,
        loaded: impl IntoIterator<Item = IssueNode>,
        loaded_edges: impl IntoIterator<Item = RelationEdge>,
    ) -> Result<()> {
        let mut nodes = self.nodes.clone();
        for node in loaded {
            nodes.entry(node.id).or_insert(node);
        }
        let mut edges = self.relations.edges();
        for edge in loaded_edges {
            if self.relations.get(edge.id).is_none() {
                edges.push(edge);
            }
        }
        *self = Self::from_parts(nodes.into_values(), edges)?;
        Ok(())
    }

    /// Move an issue under a new parent without validating the move.
    ///
    /// Returns the nodes whose tree coordinates changed.
    pub(crate) fn commit_parent(
        &mut self,
        child: IssueId,
        parent: Option<IssueId>,
    ) -> Result<Vec<IssueId>> {
        let shift = self.hierarchy.set_parent(child, parent)?;
        self.sync_tree(&shift)
    }

    /// Store an already validated canonical relation.
    pub(crate) fn commit_relation(&mut self, id: RelationId, relation: NewRelation) -> RelationEdge {
        self.relations.insert(id, relation)
    }

    /// Remove a relation.
    pub(crate) fn remove_relation(&mut self, id: RelationId) -> Result<RelationEdge> {
        self.relations.remove(id)
    }

    /// Restore a relation removed earlier, keeping its id.
    pub(crate) fn restore_relation(&mut self, edge: RelationEdge) {
        let relation = NewRelation {
            from: edge.issue_from,
            to: edge.issue_to,
            kind: edge.kind,
            delay: edge.delay,
        };
        self.relations.insert(edge.id, relation);
    }

    /// Remove an issue, cascading its relations and applying `policy` to its
    /// children.
    ///
    /// Returns the removed nodes, the removed relations, and the nodes whose
    /// tree coordinates changed.
    pub(crate) fn remove_issue(
        &mut self,
        id: IssueId,
        policy: OrphanPolicy,
    ) -> Result<(Vec<IssueNode>, Vec<RelationEdge>, Vec<IssueId>)> {
        let shift = self.hierarchy.remove(id, policy)?;
        let mut removed_edges = Vec::new();
        let mut removed_nodes = Vec::new();
        for &issue in &shift.removed {
            removed_edges.extend(self.relations.remove_issue(issue));
            if let Some(node) = self.nodes.remove(&issue) {
                removed_nodes.push(node);
            }
        }
        removed_edges.sort_by_key(|edge| edge.id);
        removed_edges.dedup_by_key(|edge| edge.id);
        let changed = self.sync_tree(&shift)?;
        Ok((removed_nodes, removed_edges, changed))
    }

    /// Copy tree coordinates from the hierarchy into the nodes a mutation
    /// touched. Returns the ids of nodes that actually changed.
    pub(crate) fn sync_tree(&mut self, shift: &TreeShift) -> Result<Vec<IssueId>> {
        let mut changed = Vec::new();
        for &id in &shift.changed {
            let before = self.node(id)?.clone();
            self.sync_nodes(&[id])?;
            if *self.node(id)? != before {
                changed.push(id);
            }
        }
        Ok(changed)
    }

    fn sync_nodes(&mut self, ids: &[IssueId]) -> Result<()> {
        for &id in ids {
            let parent = self.hierarchy.parent_of(id)?;
            let root = self.hierarchy.root_of(id)?;
            let bounds = self.hierarchy.bounds(id)?;
            let node = self.node_mut(id)?;
            node.parent = parent;
            node.root_id = root;
            node.bounds = bounds;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NestedBounds, PriorityId, ProjectId, RelationKind, StatusId};

    fn node(id: u64, parent: Option<u64>, root: u64, lft: u32, rgt: u32) -> IssueNode {
        IssueNode {
            id: IssueId(id),
            project: ProjectId(1),
            status: StatusId(1),
            priority: PriorityId(1),
            start_date: None,
            due_date: None,
            done_ratio: 0,
            estimated_hours: None,
            parent: parent.map(IssueId),
            root_id: IssueId(root),
            bounds: NestedBounds { lft, rgt },
            lock_version: 1,
        }
    }

    #[test]
    fn test_from_parts_keeps_valid_bounds() {
        let model = Model::from_parts(
            [node(1, None, 1, 1, 4), node(2, Some(1), 1, 2, 3)],
            Vec::new(),
        )
        .unwrap();
        assert_eq!(model.node(IssueId(2)).unwrap().bounds, NestedBounds { lft: 2, rgt: 3 });
        assert_eq!(model.hierarchy().children(IssueId(1)).unwrap(), vec![IssueId(2)]);
    }

    #[test]
    fn test_from_parts_rebuilds_corrupt_bounds() {
        // Both children claim the same slot.
        let model = Model::from_parts(
            [
                node(1, None, 1, 1, 4),
                node(2, Some(1), 1, 2, 3),
                node(3, Some(1), 1, 2, 3),
            ],
            Vec::new(),
        )
        .unwrap();
        model.hierarchy().check_integrity().unwrap();
        assert_eq!(model.node(IssueId(1)).unwrap().bounds, NestedBounds { lft: 1, rgt: 6 });
        assert_eq!(model.node(IssueId(3)).unwrap().bounds, NestedBounds { lft: 4, rgt: 5 });
    }

    #[test]
    fn test_from_parts_rejects_dangling_relation() {
        let edge = RelationEdge {
            id: RelationId(1),
            issue_from: IssueId(1),
            issue_to: IssueId(9),
            kind: RelationKind::Relates,
            delay: None,
        };
        let result = Model::from_parts([node(1, None, 1, 1, 2)], [edge]);
        assert!(matches!(result, Err(Error::ConsistencyViolation(_))));
    }

    #[test]
    fn test_commit_parent_syncs_nodes() {
        let mut model =
            Model::from_parts([node(1, None, 1, 1, 2), node(2, None, 2, 1, 2)], Vec::new()).unwrap();
        let changed = model.commit_parent(IssueId(2), Some(IssueId(1))).unwrap();
        assert_eq!(changed, vec![IssueId(1), IssueId(2)]);

        let child = model.node(IssueId(2)).unwrap();
        assert_eq!(child.parent, Some(IssueId(1)));
        assert_eq!(child.root_id, IssueId(1));
        assert_eq!(child.bounds, NestedBounds { lft: 2, rgt: 3 });
    }

    #[test]
    fn test_remove_issue_cascades_relations() {
        let mut model = Model::from_parts(
            [node(1, None, 1, 1, 4), node(2, Some(1), 1, 2, 3), node(3, None, 3, 1, 2)],
            Vec::new(),
        )
        .unwrap();
        model.commit_relation(
            RelationId(1),
            NewRelation::new(IssueId(2), IssueId(3), RelationKind::Precedes).canonicalize(),
        );

        let (nodes, edges, changed) = model
            .remove_issue(IssueId(2), OrphanPolicy::DeleteSubtree)
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(edges.len(), 1);
        assert_eq!(changed, vec![IssueId(1)]);
        assert!(model.relations().is_empty());
        assert_eq!(model.node(IssueId(1)).unwrap().bounds, NestedBounds { lft: 1, rgt: 2 });
    }

    #[test]
    fn test_merge_links_new_tree_to_loaded_issue() {
        let mut model = Model::from_parts([node(1, None, 1, 1, 2)], Vec::new()).unwrap();
        let edge = RelationEdge {
            id: RelationId(4),
            issue_from: IssueId(1),
            issue_to: IssueId(2),
            kind: RelationKind::Blocks,
            delay: None,
        };
        model
            .merge([node(2, None, 2, 1, 2), node(1, None, 1, 5, 6)], [edge])
            .unwrap();

        assert_eq!(model.len(), 2);
        assert_eq!(model.relations().blockers_of(IssueId(2)), vec![IssueId(1)]);
        // Already loaded nodes win over the freshly loaded copy.
        assert_eq!(model.node(IssueId(1)).unwrap().bounds, NestedBounds { lft: 1, rgt: 2 });
    }
}
