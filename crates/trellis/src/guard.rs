//! Structural validation ahead of every hierarchy or relation mutation.
//!
//! The guard only reads. Each check returns the first violated rule as a
//! [`StructuralError`] and leaves committing to the caller.

use crate::catalog::ProjectPolicy;
use crate::domain::{CrossProjectPolicy, IssueId, NewRelation, ProjectId, RelationKind};
use crate::error::{Error, Result, StructuralError};
use crate::model::Model;
use crate::schedule::would_reschedule;
use std::collections::HashSet;

/// Largest accepted `precedes` delay, in working days either way.
pub const MAX_RELATION_DELAY: i32 = 3650;

/// Read-only validator over a loaded model
pub struct ConsistencyGuard<'a> {
    model: &'a Model,
    policy: &'a dyn ProjectPolicy,
}

impl<'a> ConsistencyGuard<'a> {
    /// Create a guard
    pub fn new(model: &'a Model, policy: &'a dyn ProjectPolicy) -> Self {
        Self { model, policy }
    }

    /// Validate a relation request and return its canonical form.
    ///
    /// Checks run in order: same issue, duplicate on the ordered pair,
    /// ancestor/descendant link, cross-project link, then the kind-specific
    /// cycle check.
    ///
    /// # Errors
    ///
    /// - `Error::IssueNotFound` if an endpoint is not loaded
    /// - `Error::InvalidDelay` if the delay exceeds [`MAX_RELATION_DELAY`]
    /// - the first violated [`StructuralError`]
    pub fn check_relation(&self, request: NewRelation) -> Result<NewRelation> {
        let relation = request.canonicalize();
        if let Some(delay) = relation
            .delay
            .filter(|delay| delay.unsigned_abs() > MAX_RELATION_DELAY.unsigned_abs())
        {
            return Err(Error::InvalidDelay {
                delay,
                max: MAX_RELATION_DELAY,
            });
        }
        let (from, to) = (relation.from, relation.to);
        let from_node = self.model.node(from)?;
        let to_node = self.model.node(to)?;
        let hierarchy = self.model.hierarchy();
        let relations = self.model.relations();

        if from == to {
            return Err(StructuralError::SameIssue(from).into());
        }
        if relations.edge_between(from, to).is_some() {
            return Err(StructuralError::DuplicateRelation { from, to }.into());
        }
        if hierarchy.is_lineal(from, to)? {
            return Err(StructuralError::LinkedToDescendant { from, to }.into());
        }
        if from_node.project != to_node.project && !self.policy.cross_project_relations_allowed() {
            return Err(StructuralError::CrossProjectNotAllowed {
                issue: from,
                issue_project: from_node.project,
                target: to,
                target_project: to_node.project,
            }
            .into());
        }

        let circular = match relation.kind {
            RelationKind::Precedes => would_reschedule(hierarchy, relations, to, from)?,
            RelationKind::Blocks => relations.blocks(to, from),
            RelationKind::Relates => relations
                .edge_between(to, from)
                .is_some_and(|edge| edge.kind == RelationKind::Relates),
            RelationKind::Duplicates
            | RelationKind::DuplicatedBy
            | RelationKind::BlockedBy
            | RelationKind::Follows
            | RelationKind::CopiedTo
            | RelationKind::CopiedFrom => false,
        };
        if circular {
            return Err(StructuralError::CircularDependency {
                from,
                to,
                kind: relation.kind,
            }
            .into());
        }
        Ok(relation)
    }

    /// Validate moving `child` under `new_parent`.
    ///
    /// Making an issue a root is always allowed.
    ///
    /// # Errors
    ///
    /// - `Error::IssueNotFound` if either issue is not loaded
    /// - `StructuralError::CyclicParent` if the parent is the child or one of
    ///   its descendants
    /// - `StructuralError::CrossProjectNotAllowed` if the subtask policy
    ///   forbids the parent's project
    /// - `StructuralError::LinkedToDescendant` if a relation joins the moved
    ///   subtree to the new parent or one of its ancestors
    /// - `StructuralError::CircularDependency` if the move would make the
    ///   schedule feed back into itself
    pub fn check_parent(&self, child: IssueId, new_parent: Option<IssueId>) -> Result<()> {
        let child_node = self.model.node(child)?;
        let Some(parent) = new_parent else {
            return Ok(());
        };
        self.model.node(parent)?;
        let hierarchy = self.model.hierarchy();
        let relations = self.model.relations();

        if parent == child || hierarchy.is_ancestor_of(child, parent)? {
            return Err(StructuralError::CyclicParent { child, parent }.into());
        }
        self.check_subtask_project(child, child_node.project, parent)?;

        let subtree = hierarchy.tree(child)?;
        let mut lineage: HashSet<IssueId> = hierarchy.ancestors(parent)?.into_iter().collect();
        lineage.insert(parent);
        for &issue in &subtree {
            for edge in relations.relations_of(issue) {
                if lineage.contains(&edge.other_issue(issue)) {
                    return Err(StructuralError::LinkedToDescendant {
                        from: edge.issue_from,
                        to: edge.issue_to,
                    }
                    .into());
                }
            }
        }

        let mut trial = hierarchy.clone();
        trial.set_parent(child, Some(parent))?;
        for &issue in &subtree {
            if would_reschedule(&trial, relations, issue, issue)? {
                return Err(StructuralError::CircularDependency {
                    from: child,
                    to: parent,
                    kind: RelationKind::Precedes,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Validate that an issue of `project` may be a subtask of `parent`
    /// under the configured cross-project policy.
    ///
    /// # Errors
    ///
    /// - `Error::IssueNotFound` if the parent is not loaded
    /// - `StructuralError::CrossProjectNotAllowed` otherwise
    pub fn check_subtask_project(
        &self,
        issue: IssueId,
        project: ProjectId,
        parent: IssueId,
    ) -> Result<()> {
        let parent_project = self.model.node(parent)?.project;
        if self.parent_project_allowed(project, parent_project) {
            return Ok(());
        }
        Err(StructuralError::CrossProjectNotAllowed {
            issue,
            issue_project: project,
            target: parent,
            target_project: parent_project,
        }
        .into())
    }

    /// A project followed by its ancestors, nearest first.
    fn project_lineage(&self, project: ProjectId) -> Vec<ProjectId> {
        let mut lineage = vec![project];
        let mut seen = HashSet::from([project]);
        let mut current = project;
        while let Some(parent) = self.policy.project_parent(current) {
            if !seen.insert(parent) {
                break;
            }
            lineage.push(parent);
            current = parent;
        }
        lineage
    }

    fn parent_project_allowed(&self, child_project: ProjectId, parent_project: ProjectId) -> bool {
        if child_project == parent_project {
            return true;
        }
        match self.policy.cross_project_subtasks_policy() {
            CrossProjectPolicy::System => true,
            CrossProjectPolicy::Tree => {
                self.project_lineage(child_project).last() == self.project_lineage(parent_project).last()
            }
            CrossProjectPolicy::Hierarchy => {
                self.project_lineage(child_project).contains(&parent_project)
                    || self.project_lineage(parent_project).contains(&child_project)
            }
            CrossProjectPolicy::Descendants => {
                self.project_lineage(child_project).contains(&parent_project)
            }
            CrossProjectPolicy::Disabled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IssueNode, NestedBounds, PriorityId, RelationId, StatusId};
    use rstest::rstest;

    /// Projects 1 <- 2 <- 3, and 4 as a separate root.
    struct Projects {
        subtasks: CrossProjectPolicy,
        cross_relations: bool,
    }

    impl ProjectPolicy for Projects {
        fn cross_project_relations_allowed(&self) -> bool {
            self.cross_relations
        }
        fn cross_project_subtasks_policy(&self) -> CrossProjectPolicy {
            self.subtasks
        }
        fn project_parent(&self, project: ProjectId) -> Option<ProjectId> {
            match project.0 {
                2 => Some(ProjectId(1)),
                3 => Some(ProjectId(2)),
                _ => None,
            }
        }
        fn dates_derived(&self, _project: ProjectId) -> bool {
            true
        }
        fn priority_derived(&self, _project: ProjectId) -> bool {
            true
        }
        fn done_ratio_derived(&self, _project: ProjectId) -> bool {
            true
        }
        fn done_ratio_uses_status(&self, _project: ProjectId) -> bool {
            false
        }
    }

    fn policy() -> Projects {
        Projects {
            subtasks: CrossProjectPolicy::Tree,
            cross_relations: false,
        }
    }

    fn issue(id: u64, project: u64) -> IssueNode {
        IssueNode {
            id: IssueId(id),
            project: ProjectId(project),
            status: StatusId(1),
            priority: PriorityId(1),
            start_date: None,
            due_date: None,
            done_ratio: 0,
            estimated_hours: None,
            parent: None,
            root_id: IssueId(id),
            bounds: NestedBounds { lft: 1, rgt: 2 },
            lock_version: 1,
        }
    }

    /// Issues 1..=4 in project 1, with 2 a child of 1.
    fn model() -> Model {
        let mut model =
            Model::from_parts((1..=4).map(|id| issue(id, 1)), Vec::new()).unwrap();
        model.commit_parent(IssueId(2), Some(IssueId(1))).unwrap();
        model
    }

    fn relate(model: &mut Model, id: u64, from: u64, to: u64, kind: RelationKind) {
        let relation = NewRelation::new(IssueId(from), IssueId(to), kind).canonicalize();
        model.commit_relation(RelationId(id), relation);
    }

    fn structural(result: Result<impl std::fmt::Debug>) -> StructuralError {
        match result {
            Err(Error::Structural(err)) => err,
            other => panic!("expected structural error, got {other:?}"),
        }
    }

    #[test]
    fn test_relation_to_self_is_rejected() {
        let model = model();
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);
        let err = structural(
            guard.check_relation(NewRelation::new(IssueId(3), IssueId(3), RelationKind::Relates)),
        );
        assert_eq!(err, StructuralError::SameIssue(IssueId(3)));
    }

    #[rstest]
    #[case::largest(MAX_RELATION_DELAY, true)]
    #[case::most_negative(-MAX_RELATION_DELAY, true)]
    #[case::too_far(MAX_RELATION_DELAY + 1, false)]
    #[case::overflowing(i32::MAX, false)]
    #[case::underflowing(i32::MIN, false)]
    fn test_delay_is_bounded(#[case] delay: i32, #[case] accepted: bool) {
        let model = model();
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);
        let result = guard.check_relation(
            NewRelation::new(IssueId(3), IssueId(4), RelationKind::Precedes).with_delay(delay),
        );
        if accepted {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(Error::InvalidDelay { .. })));
        }
    }

    #[test]
    fn test_relation_between_parent_and_child_is_rejected() {
        let model = model();
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);
        let err = structural(
            guard.check_relation(NewRelation::new(IssueId(1), IssueId(2), RelationKind::Relates)),
        );
        assert!(matches!(err, StructuralError::LinkedToDescendant { .. }));
    }

    #[test]
    fn test_duplicate_on_ordered_pair_is_rejected() {
        let mut model = model();
        relate(&mut model, 1, 3, 4, RelationKind::Blocks);
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);

        let err = structural(
            guard.check_relation(NewRelation::new(IssueId(4), IssueId(3), RelationKind::Follows)),
        );
        assert_eq!(
            err,
            StructuralError::DuplicateRelation {
                from: IssueId(3),
                to: IssueId(4)
            }
        );
    }

    #[rstest]
    #[case::precedes(RelationKind::Precedes)]
    #[case::blocks(RelationKind::Blocks)]
    fn test_reverse_chain_is_circular(#[case] kind: RelationKind) {
        let mut model = model();
        relate(&mut model, 1, 3, 2, kind);
        relate(&mut model, 2, 2, 4, kind);
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);

        let err = structural(guard.check_relation(NewRelation::new(IssueId(4), IssueId(3), kind)));
        assert!(matches!(err, StructuralError::CircularDependency { .. }));
    }

    #[test]
    fn test_precedes_into_parent_of_successor_is_circular() {
        // 2 (child of 1) precedes 3; 3 preceding 1 would move 2 again.
        let mut model = model();
        relate(&mut model, 1, 2, 3, RelationKind::Precedes);
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);

        let err = structural(
            guard.check_relation(NewRelation::new(IssueId(3), IssueId(1), RelationKind::Precedes)),
        );
        assert!(matches!(err, StructuralError::CircularDependency { .. }));
    }

    #[test]
    fn test_cross_project_relation_requires_flag() {
        let mut model = model();
        model.node_mut(IssueId(4)).unwrap().project = ProjectId(4);
        let request = NewRelation::new(IssueId(3), IssueId(4), RelationKind::Relates);

        let denied = policy();
        let err = structural(ConsistencyGuard::new(&model, &denied).check_relation(request));
        assert!(matches!(err, StructuralError::CrossProjectNotAllowed { .. }));

        let allowed = Projects {
            cross_relations: true,
            ..policy()
        };
        assert!(ConsistencyGuard::new(&model, &allowed).check_relation(request).is_ok());
    }

    #[test]
    fn test_parent_cannot_be_descendant() {
        let model = model();
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);
        let err = structural(guard.check_parent(IssueId(1), Some(IssueId(2))));
        assert_eq!(
            err,
            StructuralError::CyclicParent {
                child: IssueId(1),
                parent: IssueId(2)
            }
        );
        assert!(guard.check_parent(IssueId(2), None).is_ok());
    }

    #[test]
    fn test_parent_linked_to_subtree_is_rejected() {
        let mut model = model();
        relate(&mut model, 1, 3, 2, RelationKind::Relates);
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);

        let err = structural(guard.check_parent(IssueId(3), Some(IssueId(2))));
        assert!(matches!(err, StructuralError::LinkedToDescendant { .. }));
        // Becoming a sibling of 2 is fine.
        assert!(guard.check_parent(IssueId(3), Some(IssueId(1))).is_ok());
        assert!(guard.check_parent(IssueId(3), Some(IssueId(4))).is_ok());
    }

    #[test]
    fn test_reparent_creating_schedule_loop_is_rejected() {
        // 3 precedes 4 and 4 precedes 1: putting 3 under 1 would loop.
        let mut model = model();
        relate(&mut model, 1, 3, 4, RelationKind::Precedes);
        relate(&mut model, 2, 4, 1, RelationKind::Precedes);
        let policy = policy();
        let guard = ConsistencyGuard::new(&model, &policy);

        let err = structural(guard.check_parent(IssueId(3), Some(IssueId(1))));
        assert!(matches!(err, StructuralError::CircularDependency { .. }));
    }

    #[rstest]
    #[case::system_unrelated(CrossProjectPolicy::System, 3, 4, true)]
    #[case::tree_same_root(CrossProjectPolicy::Tree, 3, 1, true)]
    #[case::tree_other_root(CrossProjectPolicy::Tree, 3, 4, false)]
    #[case::hierarchy_descendant(CrossProjectPolicy::Hierarchy, 1, 3, true)]
    #[case::hierarchy_ancestor(CrossProjectPolicy::Hierarchy, 3, 1, true)]
    #[case::descendants_ancestor(CrossProjectPolicy::Descendants, 3, 1, true)]
    #[case::descendants_descendant(CrossProjectPolicy::Descendants, 1, 3, false)]
    #[case::disabled(CrossProjectPolicy::Disabled, 2, 1, false)]
    fn test_cross_project_subtask_policy(
        #[case] subtasks: CrossProjectPolicy,
        #[case] child_project: u64,
        #[case] parent_project: u64,
        #[case] allowed: bool,
    ) {
        let mut model = model();
        model.node_mut(IssueId(3)).unwrap().project = ProjectId(child_project);
        model.node_mut(IssueId(4)).unwrap().project = ProjectId(parent_project);
        let policy = Projects {
            subtasks,
            cross_relations: false,
        };
        let guard = ConsistencyGuard::new(&model, &policy);
        assert_eq!(guard.check_parent(IssueId(3), Some(IssueId(4))).is_ok(), allowed);
    }
}
