//! Date propagation along `precedes` relations and down derived trees.
//!
//! The scheduler only plans. It reads the [`Model`] and returns the date
//! moves that a reschedule implies; the tracker commits them and decides
//! which follow-up steps to queue.

use crate::calendar::WorkingCalendar;
use crate::catalog::ProjectPolicy;
use crate::domain::{IssueId, IssueNode, RelationEdge, RelationKind};
use crate::error::{Error, Result};
use crate::graph::RelationGraph;
use crate::guard::MAX_RELATION_DELAY;
use crate::hierarchy::Hierarchy;
use crate::model::Model;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Start and due date of an issue at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateSpan {
    /// Start date
    pub start_date: Option<NaiveDate>,
    /// Due date
    pub due_date: Option<NaiveDate>,
}

impl DateSpan {
    /// Dates currently set on a node
    pub fn of(node: &IssueNode) -> Self {
        Self {
            start_date: node.start_date,
            due_date: node.due_date,
        }
    }
}

/// A planned change of one issue's dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateMove {
    /// Issue being moved
    pub issue: IssueId,
    /// Dates before the move
    pub from: DateSpan,
    /// Dates after the move
    pub to: DateSpan,
}

impl DateMove {
    /// Write the new dates into a node.
    pub fn apply(&self, node: &mut IssueNode) {
        node.start_date = self.to.start_date;
        node.due_date = self.to.due_date;
    }
}

/// Memoized soonest-start values for one propagation pass
#[derive(Debug, Clone, Default)]
pub struct SoonestStartCache {
    entries: HashMap<IssueId, Option<NaiveDate>>,
}

impl SoonestStartCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget values that depend on the dates of `changed`: its `precedes`
    /// successors and their descendants.
    pub fn invalidate(&mut self, model: &Model, changed: IssueId) -> Result<()> {
        for edge in model.relations().successors(changed) {
            let successor = edge.issue_to;
            self.entries.remove(&successor);
            if model.hierarchy().contains(successor) {
                for descendant in model.hierarchy().descendants(successor)? {
                    self.entries.remove(&descendant);
                }
            }
        }
        Ok(())
    }
}

/// Returns `true` if rescheduling `a` would reschedule `b`.
///
/// Expands a frontier from `a` through three kinds of pressure: `precedes`
/// successors, leaf descendants, and `precedes` successors of every
/// ancestor. Each issue enters the frontier at most once. With `a == b` this
/// answers whether `a` feeds back into itself.
pub fn would_reschedule(
    hierarchy: &Hierarchy,
    relations: &RelationGraph,
    a: IssueId,
    b: IssueId,
) -> Result<bool> {
    let mut visited = HashSet::new();
    let mut frontier = vec![a];

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for &issue in &frontier {
            let mut reached: Vec<IssueId> = relations
                .successors(issue)
                .iter()
                .map(|edge| edge.issue_to)
                .collect();
            if hierarchy.contains(issue) {
                reached.extend(hierarchy.leaves(issue)?);
                for ancestor in hierarchy.ancestors(issue)? {
                    reached.extend(relations.successors(ancestor).iter().map(|edge| edge.issue_to));
                }
            }
            for candidate in reached {
                if visited.insert(candidate) {
                    next.push(candidate);
                }
            }
        }
        if next.contains(&b) {
            return Ok(true);
        }
        frontier = next;
    }
    Ok(false)
}

/// Reschedule planner over a loaded model
pub struct Scheduler<'a> {
    model: &'a Model,
    calendar: &'a WorkingCalendar,
    policy: &'a dyn ProjectPolicy,
}

impl<'a> Scheduler<'a> {
    /// Create a planner
    pub fn new(model: &'a Model, calendar: &'a WorkingCalendar, policy: &'a dyn ProjectPolicy) -> Self {
        Self {
            model,
            calendar,
            policy,
        }
    }

    /// Earliest start a `precedes` edge imposes on its target.
    ///
    /// One working day after the source's due date (or start date when it
    /// has no due date), plus the delay. `None` for other kinds and for
    /// sources without dates.
    pub fn successor_soonest_start(&self, edge: &RelationEdge) -> Result<Option<NaiveDate>> {
        if edge.kind != RelationKind::Precedes {
            return Ok(None);
        }
        let source = self.model.node(edge.issue_from)?;
        let Some(anchor) = source.due_date.or(source.start_date) else {
            return Ok(None);
        };
        let delay = edge.delay.unwrap_or(0);
        let offset = delay.checked_add(1).ok_or(Error::InvalidDelay {
            delay,
            max: MAX_RELATION_DELAY,
        })?;
        self.calendar.add_working_days(anchor, offset).map(Some)
    }

    fn own_soonest_start(&self, issue: IssueId) -> Result<Option<NaiveDate>> {
        let mut soonest = None;
        for edge in self.model.relations().predecessors(issue) {
            soonest = soonest.max(self.successor_soonest_start(&edge)?);
        }
        Ok(soonest)
    }

    /// Earliest start allowed for an issue.
    ///
    /// The latest bound among its incoming `precedes` edges and, while the
    /// parent's dates are derived, the parent's own soonest start.
    pub fn soonest_start(&self, issue: IssueId, cache: &mut SoonestStartCache) -> Result<Option<NaiveDate>> {
        if let Some(&cached) = cache.entries.get(&issue) {
            return Ok(cached);
        }

        let mut chain = vec![issue];
        let mut seen = HashSet::from([issue]);
        let mut inherited = None;
        let mut current = self.model.node(issue)?;
        while let Some(parent) = current.parent {
            let parent_node = self.model.node(parent)?;
            if !self.policy.dates_derived(parent_node.project) {
                break;
            }
            if let Some(&cached) = cache.entries.get(&parent) {
                inherited = cached;
                break;
            }
            if !seen.insert(parent) {
                return Err(Error::ConsistencyViolation(format!(
                    "parent links of {issue} loop through {parent}"
                )));
            }
            chain.push(parent);
            current = parent_node;
        }

        for &id in chain.iter().rev() {
            let value = self.own_soonest_start(id)?.max(inherited);
            cache.entries.insert(id, value);
            inherited = value;
        }
        Ok(inherited)
    }

    /// Working-day span between start and due, `0` unless both are set.
    pub fn working_duration(&self, node: &IssueNode) -> i32 {
        match (node.start_date, node.due_date) {
            (Some(start), Some(due)) => self.calendar.working_days_between(start, due),
            _ => 0,
        }
    }

    /// Plan moving an issue to start on `date`.
    ///
    /// A leaf, or a parent whose dates are not derived, is moved itself.
    /// A parent with derived dates moves each leaf that has no start, starts
    /// on the parent's start, or starts before `date`.
    pub fn plan_reschedule(
        &self,
        issue: IssueId,
        date: NaiveDate,
        cache: &mut SoonestStartCache,
    ) -> Result<Vec<DateMove>> {
        let node = self.model.node(issue)?;
        let hierarchy = self.model.hierarchy();
        if hierarchy.is_leaf(issue)? || !self.policy.dates_derived(node.project) {
            return Ok(self.plan_move(node, date, cache)?.into_iter().collect());
        }

        let mut moves = Vec::new();
        for leaf in hierarchy.leaves(issue)? {
            let leaf_node = self.model.node(leaf)?;
            let follows = match leaf_node.start_date {
                None => true,
                Some(start) => node.start_date == Some(start) || start < date,
            };
            if follows {
                moves.extend(self.plan_move(leaf_node, date, cache)?);
            }
        }
        Ok(moves)
    }

    /// Plan moving a single issue, keeping its working duration.
    ///
    /// An issue starting later than `date` is never moved earlier than its
    /// soonest start. A missing due date lands on the new start.
    pub fn plan_move(
        &self,
        node: &IssueNode,
        date: NaiveDate,
        cache: &mut SoonestStartCache,
    ) -> Result<Option<DateMove>> {
        if node.start_date == Some(date) {
            return Ok(None);
        }
        let mut date = date;
        if node.start_date.is_some_and(|start| start > date) {
            date = self.soonest_start(node.id, cache)?.map_or(date, |soonest| soonest.max(date));
        }

        let duration = self.working_duration(node);
        let start = self.calendar.next_working_date(date)?;
        let to = DateSpan {
            start_date: Some(start),
            due_date: Some(self.calendar.add_working_days(start, duration)?),
        };
        let from = DateSpan::of(node);
        Ok((from != to).then_some(DateMove {
            issue: node.id,
            from,
            to,
        }))
    }

    /// Returns `true` if rescheduling `issue` would come back to it.
    pub fn feeds_back(&self, issue: IssueId) -> Result<bool> {
        would_reschedule(self.model.hierarchy(), self.model.relations(), issue, issue)
    }
}
