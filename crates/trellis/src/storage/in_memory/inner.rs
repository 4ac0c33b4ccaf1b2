//! Core in-memory store data structures.
//!
//! This module contains the inner structure that holds all data and is
//! wrapped in `Arc<Mutex<>>` for thread safety.

use crate::domain::{IssueId, IssueNode, RelationEdge, RelationId};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Inner store structure (not thread-safe).
pub(crate) struct StoreInner {
    /// Nodes indexed by ID for O(1) lookups
    pub(super) nodes: HashMap<IssueId, IssueNode>,

    /// Relations keyed by id, so iteration follows creation order
    pub(super) edges: BTreeMap<RelationId, RelationEdge>,

    /// Pending simulated foreign writes per issue
    pub(super) interference: HashMap<IssueId, u32>,

    next_issue: u64,
    next_relation: u64,
}

impl StoreInner {
    /// Create a new empty store
    pub(crate) fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: BTreeMap::new(),
            interference: HashMap::new(),
            next_issue: 1,
            next_relation: 1,
        }
    }

    pub(super) fn next_issue_id(&mut self) -> IssueId {
        let id = IssueId(self.next_issue);
        self.next_issue += 1;
        id
    }

    pub(super) fn next_relation_id(&mut self) -> RelationId {
        let id = RelationId(self.next_relation);
        self.next_relation += 1;
        id
    }

    /// Apply one simulated foreign write to every interfered node of the
    /// batch.
    pub(super) fn interfere(&mut self, batch: &[IssueNode]) {
        for node in batch {
            let Some(pending) = self.interference.get_mut(&node.id) else {
                continue;
            };
            if *pending == 0 {
                continue;
            }
            *pending -= 1;
            if let Some(stored) = self.nodes.get_mut(&node.id) {
                stored.lock_version += 1;
            }
        }
        self.interference.retain(|_, pending| *pending > 0);
    }

    /// Verify that every node of a batch matches the stored version.
    ///
    /// # Errors
    ///
    /// - `Error::Storage` if the batch names a node twice
    /// - `Error::Conflict` for the first stale node
    pub(super) fn check_versions(&self, batch: &[IssueNode]) -> Result<()> {
        let mut seen = HashSet::new();
        for node in batch {
            if !seen.insert(node.id) {
                return Err(Error::Storage(format!(
                    "Issue {} appears twice in one save",
                    node.id
                )));
            }
            let found = self.nodes.get(&node.id).map_or(0, |stored| stored.lock_version);
            if node.lock_version != found {
                return Err(Error::Conflict {
                    issue: node.id,
                    expected: node.lock_version,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Write a validated batch, bumping versions.
    pub(super) fn write(&mut self, batch: &[IssueNode]) -> Vec<IssueNode> {
        let mut saved = Vec::with_capacity(batch.len());
        for node in batch {
            let mut stored = node.clone();
            stored.lock_version += 1;
            self.next_issue = self.next_issue.max(node.id.0 + 1);
            self.nodes.insert(node.id, stored.clone());
            saved.push(stored);
        }
        saved
    }

    /// Nodes of the subtree rooted at `id`, ordered by left bound.
    pub(super) fn subtree(&self, id: IssueId) -> Result<Vec<IssueNode>> {
        let top = self.nodes.get(&id).ok_or(Error::IssueNotFound(id))?;
        let mut nodes: Vec<IssueNode> = self
            .nodes
            .values()
            .filter(|node| {
                node.root_id == top.root_id
                    && top.bounds.lft <= node.bounds.lft
                    && node.bounds.rgt <= top.bounds.rgt
            })
            .cloned()
            .collect();
        nodes.sort_by_key(|node| (node.bounds.lft, node.id));
        Ok(nodes)
    }

    pub(super) fn insert_edge(&mut self, edge: &RelationEdge) {
        self.next_relation = self.next_relation.max(edge.id.0 + 1);
        self.edges.insert(edge.id, edge.clone());
    }
}
