//! Derived parent attributes.
//!
//! Each of priority, dates and done ratio is derived independently,
//! depending on the parent project's settings. Leaves are never touched.

use crate::catalog::{PriorityCatalog, ProjectPolicy, StatusCatalog};
use crate::domain::{IssueId, IssueNode, PriorityId};
use crate::error::Result;
use crate::model::Model;
use chrono::NaiveDate;
use serde::Serialize;

/// Rounding slack so that exact ratios such as 25.0 are not floored to 24.
const FLOOR_EPSILON: f64 = 1e-9;

/// Attributes a recalculation changed. A field is `Some` only if its value
/// differs from the parent's current one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Recalculation {
    /// New priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<PriorityId>,

    /// New start date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<Option<NaiveDate>>,

    /// New due date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,

    /// New done ratio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_ratio: Option<u8>,
}

impl Recalculation {
    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.priority.is_none()
            && self.start_date.is_none()
            && self.due_date.is_none()
            && self.done_ratio.is_none()
    }

    /// The derived attributes that differ between two copies of a node.
    pub fn between(before: &IssueNode, after: &IssueNode) -> Self {
        Self {
            priority: (before.priority != after.priority).then_some(after.priority),
            start_date: (before.start_date != after.start_date).then_some(after.start_date),
            due_date: (before.due_date != after.due_date).then_some(after.due_date),
            done_ratio: (before.done_ratio != after.done_ratio).then_some(after.done_ratio),
        }
    }

    /// Returns `true` if start or due date changed.
    pub fn touches_dates(&self) -> bool {
        self.start_date.is_some() || self.due_date.is_some()
    }

    /// Write the changed attributes into a node.
    pub fn apply(&self, node: &mut IssueNode) {
        if let Some(priority) = self.priority {
            node.priority = priority;
        }
        if let Some(start) = self.start_date {
            node.start_date = start;
        }
        if let Some(due) = self.due_date {
            node.due_date = due;
        }
        if let Some(ratio) = self.done_ratio {
            node.done_ratio = ratio;
        }
    }
}

/// Computes derived attributes of parents from their children
pub struct Aggregator<'a> {
    model: &'a Model,
    policy: &'a dyn ProjectPolicy,
    statuses: &'a dyn StatusCatalog,
    priorities: &'a dyn PriorityCatalog,
}

impl<'a> Aggregator<'a> {
    /// Create an aggregator
    pub fn new(
        model: &'a Model,
        policy: &'a dyn ProjectPolicy,
        statuses: &'a dyn StatusCatalog,
        priorities: &'a dyn PriorityCatalog,
    ) -> Self {
        Self {
            model,
            policy,
            statuses,
            priorities,
        }
    }

    /// Recompute the derived attributes of `parent` from its children.
    ///
    /// Returns an empty [`Recalculation`] for leaves.
    pub fn recalculate(&self, parent: IssueId) -> Result<Recalculation> {
        let node = self.model.node(parent)?;
        let hierarchy = self.model.hierarchy();
        let mut change = Recalculation::default();
        if hierarchy.is_leaf(parent)? {
            return Ok(change);
        }
        let children = self.model.nodes_of(&hierarchy.children(parent)?)?;

        if self.policy.priority_derived(node.project) {
            let any_open = children.iter().any(|child| !self.statuses.is_closed(child.status));
            let priority = if any_open {
                self.highest_open_priority(&children)
            } else {
                self.priorities.default_priority()
            };
            if let Some(priority) = priority.filter(|&p| p != node.priority) {
                change.priority = Some(priority);
            }
        }

        if self.policy.dates_derived(node.project) {
            let mut start = children.iter().filter_map(|c| c.start_date).min();
            let mut due = children.iter().filter_map(|c| c.due_date).max();
            if let (Some(s), Some(d)) = (start, due) {
                if d < s {
                    std::mem::swap(&mut start, &mut due);
                }
            }
            if start != node.start_date {
                change.start_date = Some(start);
            }
            if due != node.due_date {
                change.due_date = Some(due);
            }
        }

        let status_driven = self.policy.done_ratio_uses_status(node.project)
            && self.statuses.default_done_ratio(node.status).is_some();
        if self.policy.done_ratio_derived(node.project) && !status_driven {
            let ratio = self.weighted_done_ratio(&children)?;
            if ratio != node.done_ratio {
                change.done_ratio = Some(ratio);
            }
        }
        Ok(change)
    }

    fn highest_open_priority(&self, children: &[IssueNode]) -> Option<PriorityId> {
        children
            .iter()
            .filter(|child| !self.statuses.is_closed(child.status))
            .filter_map(|child| {
                self.priorities
                    .position(child.priority)
                    .map(|position| (position, child.priority))
            })
            .max_by_key(|&(position, _)| position)
            .map(|(_, priority)| priority)
    }

    /// Estimated hours of an issue plus all its descendants, `None` when no
    /// issue of the subtree carries an estimate.
    pub fn total_estimated_hours(&self, issue: IssueId) -> Result<Option<f64>> {
        let mut total = None;
        for id in self.model.hierarchy().tree(issue)? {
            if let Some(hours) = self.model.node(id)?.estimated_hours {
                total = Some(total.unwrap_or(0.0) + hours);
            }
        }
        Ok(total)
    }

    /// Average of effective child ratios weighted by total estimated hours.
    ///
    /// Closed children count as 100. Children without a positive estimate
    /// weigh as much as the average estimated child, or 1.0 when no child is
    /// estimated. The result is floored.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn weighted_done_ratio(&self, children: &[IssueNode]) -> Result<u8> {
        let mut weights = Vec::with_capacity(children.len());
        for child in children {
            weights.push(self.total_estimated_hours(child.id)?.filter(|&hours| hours > 0.0));
        }

        let estimated: Vec<f64> = weights.iter().flatten().copied().collect();
        let average = if estimated.is_empty() {
            1.0
        } else {
            estimated.iter().sum::<f64>() / estimated.len() as f64
        };

        let mut done = 0.0;
        let mut total = 0.0;
        for (child, weight) in children.iter().zip(&weights) {
            let weight = weight.unwrap_or(average);
            let ratio = if self.statuses.is_closed(child.status) {
                100.0
            } else {
                f64::from(child.done_ratio)
            };
            done += weight * ratio;
            total += weight;
        }
        if total <= 0.0 {
            return Ok(0);
        }
        Ok((done / total + FLOOR_EPSILON).floor().clamp(0.0, 100.0) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CrossProjectPolicy, NestedBounds, ProjectId, StatusId};
    use rstest::rstest;

    const OPEN: StatusId = StatusId(1);
    const CLOSED: StatusId = StatusId(5);
    const LOW: PriorityId = PriorityId(1);
    const NORMAL: PriorityId = PriorityId(2);
    const HIGH: PriorityId = PriorityId(3);

    struct Catalogs {
        default_priority: Option<PriorityId>,
        status_ratio: Option<u8>,
        uses_status: bool,
    }

    impl StatusCatalog for Catalogs {
        fn is_closed(&self, status: StatusId) -> bool {
            status == CLOSED
        }
        fn default_done_ratio(&self, _status: StatusId) -> Option<u8> {
            self.status_ratio
        }
    }

    impl PriorityCatalog for Catalogs {
        fn position(&self, priority: PriorityId) -> Option<usize> {
            [LOW, NORMAL, HIGH].iter().position(|&p| p == priority)
        }
        fn default_priority(&self) -> Option<PriorityId> {
            self.default_priority
        }
    }

    impl ProjectPolicy for Catalogs {
        fn cross_project_relations_allowed(&self) -> bool {
            false
        }
        fn cross_project_subtasks_policy(&self) -> CrossProjectPolicy {
            CrossProjectPolicy::Tree
        }
        fn project_parent(&self, _project: ProjectId) -> Option<ProjectId> {
            None
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
            self.uses_status
        }
    }

    fn catalogs() -> Catalogs {
        Catalogs {
            default_priority: None,
            status_ratio: None,
            uses_status: false,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn issue(id: u64) -> IssueNode {
        IssueNode {
            id: IssueId(id),
            project: ProjectId(1),
            status: OPEN,
            priority: NORMAL,
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

    /// Parent 1 with the given children (ids 2, 3, ...).
    fn family(children: Vec<IssueNode>) -> Model {
        let ids: Vec<IssueId> = children.iter().map(|c| c.id).collect();
        let mut nodes = vec![issue(1)];
        nodes.extend(children);
        let mut model = Model::from_parts(nodes, Vec::new()).unwrap();
        for id in ids {
            model.commit_parent(id, Some(IssueId(1))).unwrap();
        }
        model
    }

    fn child(id: u64, status: StatusId, ratio: u8, hours: Option<f64>) -> IssueNode {
        IssueNode {
            status,
            done_ratio: ratio,
            estimated_hours: hours,
            ..issue(id)
        }
    }

    fn recalc(model: &Model, catalogs: &Catalogs) -> Recalculation {
        Aggregator::new(model, catalogs, catalogs, catalogs)
            .recalculate(IssueId(1))
            .unwrap()
    }

    #[rstest]
    #[case::two_closed_unestimated(vec![child(2, CLOSED, 0, None), child(3, CLOSED, 0, Some(0.0))], 100)]
    #[case::average_substitution(vec![child(2, OPEN, 50, Some(10.0)), child(3, OPEN, 0, Some(0.0))], 25)]
    #[case::weighted(vec![child(2, CLOSED, 0, Some(30.0)), child(3, OPEN, 0, Some(10.0))], 75)]
    #[case::floored(vec![child(2, OPEN, 33, None), child(3, OPEN, 34, None)], 33)]
    fn test_done_ratio(#[case] children: Vec<IssueNode>, #[case] expected: u8) {
        let model = family(children);
        assert_eq!(recalc(&model, &catalogs()).done_ratio, Some(expected));
    }

    #[test]
    fn test_done_ratio_weights_include_descendants() {
        // Child 2 has no estimate of its own but a 30h grandchild.
        let mut model = family(vec![
            child(2, OPEN, 0, None),
            child(3, OPEN, 100, Some(10.0)),
            child(4, OPEN, 0, Some(30.0)),
        ]);
        model.commit_parent(IssueId(4), Some(IssueId(2))).unwrap();
        // Children of 1: 2 (weight 30, 0%) and 3 (weight 10, 100%).
        assert_eq!(recalc(&model, &catalogs()).done_ratio, Some(25));
    }

    #[test]
    fn test_done_ratio_skipped_when_status_driven() {
        let model = family(vec![child(2, CLOSED, 100, None)]);
        let catalogs = Catalogs {
            status_ratio: Some(40),
            uses_status: true,
            ..catalogs()
        };
        assert_eq!(recalc(&model, &catalogs).done_ratio, None);
    }

    #[test]
    fn test_priority_is_highest_open_child() {
        let model = family(vec![
            IssueNode { priority: HIGH, ..child(2, CLOSED, 0, None) },
            IssueNode { priority: LOW, ..child(3, OPEN, 0, None) },
            IssueNode { priority: HIGH, ..child(4, OPEN, 0, None) },
        ]);
        assert_eq!(recalc(&model, &catalogs()).priority, Some(HIGH));
    }

    #[test]
    fn test_priority_with_all_children_closed() {
        let model = family(vec![IssueNode { priority: HIGH, ..child(2, CLOSED, 0, None) }]);
        assert_eq!(recalc(&model, &catalogs()).priority, None);

        let with_default = Catalogs {
            default_priority: Some(LOW),
            ..catalogs()
        };
        assert_eq!(recalc(&model, &with_default).priority, Some(LOW));
    }

    #[test]
    fn test_open_child_outside_catalog_keeps_priority() {
        let model = family(vec![IssueNode { priority: PriorityId(9), ..child(2, OPEN, 0, None) }]);
        let with_default = Catalogs {
            default_priority: Some(LOW),
            ..catalogs()
        };
        assert_eq!(recalc(&model, &with_default).priority, None);
    }

        #[test]
    fn test_dates_span_children() {
        let model = family(vec![
            IssueNode {
                start_date: Some(d(2024, 1, 3)),
                due_date: Some(d(2024, 1, 5)),
                ..issue(2)
            },
            IssueNode {
                start_date: Some(d(2024, 1, 1)),
                due_date: None,
                ..issue(3)
            },
        ]);
        let change = recalc(&model, &catalogs());
        assert_eq!(change.start_date, Some(Some(d(2024, 1, 1))));
        assert_eq!(change.due_date, Some(Some(d(2024, 1, 5))));
    }

    #[test]
    fn test_inverted_dates_are_swapped() {
        let model = family(vec![
            IssueNode {
                start_date: Some(d(2024, 1, 10)),
                ..issue(2)
            },
            IssueNode {
                due_date: Some(d(2024, 1, 2)),
                ..issue(3)
            },
        ]);
        let change = recalc(&model, &catalogs());
        assert_eq!(change.start_date, Some(Some(d(2024, 1, 2))));
        assert_eq!(change.due_date, Some(Some(d(2024, 1, 10))));
    }

    #[test]
    fn test_leaf_is_left_alone() {
        let model = Model::from_parts([issue(1)], Vec::new()).unwrap();
        assert!(recalc(&model, &catalogs()).is_empty());
    }
}
