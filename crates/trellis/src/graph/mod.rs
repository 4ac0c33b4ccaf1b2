//! Typed relation graph between issues.
//!
//! Relations are stored in a petgraph `StableDiGraph` so that removing an
//! issue or an edge never invalidates the indices held for the others.
//!
//! # Edge Direction Convention
//!
//! Every stored edge points from `issue_from` to `issue_to` in its
//! canonical orientation (see [`NewRelation::canonicalize`]):
//!
//! - **Blocks**: if A blocks B, edge is `A -> B`
//! - **Precedes**: if A must finish before B starts, edge is `A -> B`
//! - **Duplicates**: if A is a duplicate of B, edge is `A -> B`
//! - **CopiedTo**: if B was copied from A, edge is `A -> B`
//! - **Relates**: stored from the smaller id to the larger one
//!
//! The graph itself never validates semantics; callers go through
//! [`crate::guard::ConsistencyGuard`] before [`RelationGraph::insert`].

use crate::domain::{IssueId, NewRelation, RelationEdge, RelationId, RelationKind};
use crate::error::{Error, Result};
use petgraph::Direction;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

/// Directed multigraph of canonical relations
#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    graph: StableDiGraph<IssueId, RelationEdge>,

    /// Mapping from IssueId to graph NodeIndex
    node_map: HashMap<IssueId, NodeIndex>,

    /// Mapping from RelationId to graph EdgeIndex
    edge_map: HashMap<RelationId, EdgeIndex>,
}

impl RelationGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from persisted edges.
    ///
    /// Edges are inserted as stored; their orientation is trusted.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConsistencyViolation` if two edges share an id.
    pub fn from_edges(edges: impl IntoIterator<Item = RelationEdge>) -> Result<Self> {
        let mut graph = Self::new();
        for edge in edges {
            if graph.edge_map.contains_key(&edge.id) {
                return Err(Error::ConsistencyViolation(format!(
                    "{} loaded twice",
                    edge.id
                )));
            }
            graph.insert_edge(edge);
        }
        Ok(graph)
    }

    fn ensure_node(&mut self, issue: IssueId) -> NodeIndex {
        if let Some(&node) = self.node_map.get(&issue) {
            return node;
        }
        let node = self.graph.add_node(issue);
        self.node_map.insert(issue, node);
        node
    }

    fn insert_edge(&mut self, edge: RelationEdge) -> RelationEdge {
        let from = self.ensure_node(edge.issue_from);
        let to = self.ensure_node(edge.issue_to);
        let id = edge.id;
        let index = self.graph.add_edge(from, to, edge.clone());
        self.edge_map.insert(id, index);
        edge
    }

    /// Commit an already validated, canonical relation under `id`.
    pub(crate) fn insert(&mut self, id: RelationId, relation: NewRelation) -> RelationEdge {
        self.insert_edge(RelationEdge {
            id,
            issue_from: relation.from,
            issue_to: relation.to,
            kind: relation.kind,
            delay: relation.delay,
        })
    }

    /// Remove a relation.
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotFound` if no edge has this id.
    pub(crate) fn remove(&mut self, id: RelationId) -> Result<RelationEdge> {
        let index = self
            .edge_map
            .remove(&id)
            .ok_or(Error::RelationNotFound(id))?;
        self.graph
            .remove_edge(index)
            .ok_or(Error::RelationNotFound(id))
    }

    /// Remove an issue and every relation touching it.
    ///
    /// Returns the removed relations in creation order.
    pub(crate) fn remove_issue(&mut self, issue: IssueId) -> Vec<RelationEdge> {
        let removed = self.relations_of(issue);
        for edge in &removed {
            self.edge_map.remove(&edge.id);
        }
        if let Some(node) = self.node_map.remove(&issue) {
            self.graph.remove_node(node);
        }
        removed
    }

    /// Look up a relation by id.
    pub fn get(&self, id: RelationId) -> Option<&RelationEdge> {
        self.edge_map
            .get(&id)
            .and_then(|&index| self.graph.edge_weight(index))
    }

    /// Number of stored relations.
    pub fn len(&self) -> usize {
        self.edge_map.len()
    }

    /// Returns `true` if no relation is stored.
    pub fn is_empty(&self) -> bool {
        self.edge_map.is_empty()
    }

    /// All stored relations in creation order.
    pub fn edges(&self) -> Vec<RelationEdge> {
        let mut edges: Vec<RelationEdge> = self.graph.edge_weights().cloned().collect();
        edges.sort_by_key(|edge| edge.id);
        edges
    }

    fn directed(&self, issue: IssueId, direction: Direction) -> Vec<RelationEdge> {
        let Some(&node) = self.node_map.get(&issue) else {
            return Vec::new();
        };
        let mut edges: Vec<RelationEdge> = self
            .graph
            .edges_directed(node, direction)
            .map(|edge| edge.weight().clone())
            .collect();
        edges.sort_by_key(|edge| edge.id);
        edges
    }

    /// Relations stored with `issue` as source, in creation order.
    pub fn relations_from(&self, issue: IssueId) -> Vec<RelationEdge> {
        self.directed(issue, Direction::Outgoing)
    }

    /// Relations stored with `issue` as target, in creation order.
    pub fn relations_to(&self, issue: IssueId) -> Vec<RelationEdge> {
        self.directed(issue, Direction::Incoming)
    }

    /// Every relation touching `issue`, in creation order.
    pub fn relations_of(&self, issue: IssueId) -> Vec<RelationEdge> {
        let mut edges = self.relations_from(issue);
        edges.extend(self.relations_to(issue));
        edges.sort_by_key(|edge| edge.id);
        edges
    }

    /// Outgoing `precedes` relations, in creation order.
    pub fn successors(&self, issue: IssueId) -> Vec<RelationEdge> {
        self.of_kind(issue, Direction::Outgoing, RelationKind::Precedes)
    }

    /// Incoming `precedes` relations, in creation order.
    pub fn predecessors(&self, issue: IssueId) -> Vec<RelationEdge> {
        self.of_kind(issue, Direction::Incoming, RelationKind::Precedes)
    }

    /// Issues stored as duplicates of `issue` (sources of incoming
    /// `duplicates` edges), in creation order.
    pub fn duplicates_of(&self, issue: IssueId) -> Vec<IssueId> {
        self.of_kind(issue, Direction::Incoming, RelationKind::Duplicates)
            .into_iter()
            .map(|edge| edge.issue_from)
            .collect()
    }

    /// Issues blocking `issue` directly, in creation order.
    pub fn blockers_of(&self, issue: IssueId) -> Vec<IssueId> {
        self.of_kind(issue, Direction::Incoming, RelationKind::Blocks)
            .into_iter()
            .map(|edge| edge.issue_from)
            .collect()
    }

    fn of_kind(&self, issue: IssueId, direction: Direction, kind: RelationKind) -> Vec<RelationEdge> {
        let mut edges = self.directed(issue, direction);
        edges.retain(|edge| edge.kind == kind);
        edges
    }

    /// The stored relation on an ordered pair, if any.
    pub fn edge_between(&self, from: IssueId, to: IssueId) -> Option<&RelationEdge> {
        let (&from, &to) = (self.node_map.get(&from)?, self.node_map.get(&to)?);
        self.graph
            .edges(from)
            .filter(|edge| edge.target() == to)
            .map(|edge| edge.weight())
            .min_by_key(|edge| edge.id)
    }

    /// Returns `true` if `a` reaches `b` through `blocks` edges.
    ///
    /// Breadth-first: each round expands the frontier along outgoing
    /// `blocks` edges, dropping issues already visited, so shared
    /// descendants and corrupt cycles are walked once.
    pub fn blocks(&self, a: IssueId, b: IssueId) -> bool {
        let mut visited = HashSet::from([a]);
        let mut frontier = vec![a];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for issue in &frontier {
                for edge in self.of_kind(*issue, Direction::Outgoing, RelationKind::Blocks) {
                    if visited.insert(edge.issue_to) {
                        next.push(edge.issue_to);
                    }
                }
            }
            if next.contains(&b) {
                return true;
            }
            frontier = next;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> IssueId {
        IssueId(n)
    }

    fn graph_with(edges: &[(u64, u64, RelationKind)]) -> RelationGraph {
        let mut graph = RelationGraph::new();
        for (i, &(from, to, kind)) in edges.iter().enumerate() {
            let relation = NewRelation::new(id(from), id(to), kind).canonicalize();
            graph.insert(RelationId(i as u64 + 1), relation);
        }
        graph
    }

    #[test]
    fn test_blocks_follows_transitive_chain() {
        let graph = graph_with(&[
            (1, 2, RelationKind::Blocks),
            (2, 3, RelationKind::Blocks),
            (3, 4, RelationKind::Relates),
        ]);
        assert!(graph.blocks(id(1), id(3)));
        assert!(!graph.blocks(id(3), id(1)));
        assert!(!graph.blocks(id(1), id(4)));
    }

    #[test]
    fn test_blocks_terminates_on_shared_descendants_and_cycles() {
        // Diamond plus a corrupt back edge
        let graph = graph_with(&[
            (1, 2, RelationKind::Blocks),
            (1, 3, RelationKind::Blocks),
            (2, 4, RelationKind::Blocks),
            (3, 4, RelationKind::Blocks),
            (4, 1, RelationKind::Blocks),
        ]);
        assert!(graph.blocks(id(1), id(4)));
        assert!(!graph.blocks(id(1), id(9)));
    }

    #[test]
    fn test_blocked_by_is_stored_as_blocks() {
        let graph = graph_with(&[(2, 1, RelationKind::BlockedBy)]);
        let edge = graph.edge_between(id(1), id(2)).unwrap();
        assert_eq!(edge.kind, RelationKind::Blocks);
        assert_eq!(graph.blockers_of(id(2)), vec![id(1)]);
    }

    #[test]
    fn test_successors_in_creation_order() {
        let graph = graph_with(&[
            (1, 3, RelationKind::Precedes),
            (1, 2, RelationKind::Precedes),
            (1, 4, RelationKind::Relates),
        ]);
        let targets: Vec<IssueId> = graph.successors(id(1)).iter().map(|e| e.issue_to).collect();
        assert_eq!(targets, vec![id(3), id(2)]);
        assert_eq!(graph.predecessors(id(2)).len(), 1);
    }

    #[test]
    fn test_remove_issue_cascades_edges() {
        let mut graph = graph_with(&[
            (1, 2, RelationKind::Precedes),
            (2, 3, RelationKind::Blocks),
            (3, 4, RelationKind::Relates),
        ]);
        let removed = graph.remove_issue(id(2));
        assert_eq!(removed.len(), 2);
        assert_eq!(graph.len(), 1);
        assert!(graph.relations_of(id(1)).is_empty());
        assert!(graph.get(RelationId(3)).is_some());
    }

    #[test]
    fn test_remove_unknown_relation() {
        let mut graph = RelationGraph::new();
        assert!(matches!(
            graph.remove(RelationId(1)),
            Err(Error::RelationNotFound(_))
        ));
    }

    #[test]
    fn test_from_edges_rejects_duplicate_ids() {
        let edge = RelationEdge {
            id: RelationId(1),
            issue_from: id(1),
            issue_to: id(2),
            kind: RelationKind::Relates,
            delay: None,
        };
        let result = RelationGraph::from_edges([edge.clone(), edge]);
        assert!(matches!(result, Err(Error::ConsistencyViolation(_))));
    }
}
