//! Transactional entry point.
//!
//! The [`Tracker`] owns the loaded [`Model`] and an [`IssueStore`]. Every
//! mutation follows the same shape:
//!
//! 1. validate (guard, attribute rules), touching nothing
//! 2. apply to the model and persist; a failed save restores the model
//! 3. run the propagation queue seeded by the change
//!
//! Errors from steps 1 and 2 are returned as `Err`, and nothing is changed.
//! Failures during step 3 are collected in the [`PropagationReport`].

mod propagate;

pub use propagate::{PropagationFailure, PropagationReport};

use crate::aggregate::Aggregator;
use crate::calendar::WorkingCalendar;
use crate::catalog::{PriorityCatalog, ProjectPolicy, StatusCatalog};
use crate::config::TrackerConfig;
use crate::domain::{
    ChangeContext, IssueId, IssueNode, IssueUpdate, NewIssue, NewRelation, OrphanPolicy,
    RelationEdge, RelationId, StatusId,
};
use crate::error::{Error, Result};
use crate::events::TrackerEvent;
use crate::guard::ConsistencyGuard;
use crate::model::Model;
use crate::schedule::{Scheduler, SoonestStartCache};
use crate::storage::IssueStore;
use chrono::NaiveDate;
use propagate::{Propagation, Step};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Issue hierarchy and relation tracker over a persistent store
pub struct Tracker {
    model: Model,
    store: Box<dyn IssueStore>,
    policy: Arc<dyn ProjectPolicy>,
    statuses: Arc<dyn StatusCatalog>,
    priorities: Arc<dyn PriorityCatalog>,
    calendar: WorkingCalendar,
}

impl Tracker {
    /// Create a tracker with an empty working set.
    pub fn new(
        store: Box<dyn IssueStore>,
        policy: Arc<dyn ProjectPolicy>,
        statuses: Arc<dyn StatusCatalog>,
        priorities: Arc<dyn PriorityCatalog>,
        calendar: WorkingCalendar,
    ) -> Self {
        Self {
            model: Model::new(),
            store,
            policy,
            statuses,
            priorities,
            calendar,
        }
    }

    /// Create a tracker whose policy and catalogs come from a config file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configured calendar is invalid.
    pub fn from_config(store: Box<dyn IssueStore>, config: TrackerConfig) -> Result<Self> {
        let calendar = config.calendar()?;
        let config = Arc::new(config);
        Ok(Self::new(
            store,
            config.clone(),
            config.clone(),
            config,
            calendar,
        ))
    }

    fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(&self.model, &self.calendar, self.policy.as_ref())
    }

    fn aggregator(&self) -> Aggregator<'_> {
        Aggregator::new(
            &self.model,
            self.policy.as_ref(),
            self.statuses.as_ref(),
            self.priorities.as_ref(),
        )
    }

    fn guard(&self) -> ConsistencyGuard<'_> {
        ConsistencyGuard::new(&self.model, self.policy.as_ref())
    }

    // ========== Loading ==========

    /// Load the trees containing `issues`, plus every tree reachable from
    /// them through relations.
    ///
    /// Trees whose persisted bounds are inconsistent are rebuilt from their
    /// parent links and the corrected nodes are saved.
    ///
    /// # Errors
    ///
    /// - `Error::IssueNotFound` if an issue doesn't exist in the store
    /// - `Error::ConsistencyViolation` if parent links are broken
    #[instrument(skip(self))]
    pub async fn load(&mut self, issues: &[IssueId]) -> Result<()> {
        let mut nodes: Vec<IssueNode> = Vec::new();
        let mut edges: Vec<RelationEdge> = Vec::new();
        let mut loaded: HashSet<IssueId> = HashSet::new();
        let mut seen_edges: HashSet<RelationId> = HashSet::new();
        let mut queue: VecDeque<IssueId> = issues.iter().copied().collect();

        while let Some(issue) = queue.pop_front() {
            if loaded.contains(&issue) || self.model.contains(issue) {
                continue;
            }
            let node = self
                .store
                .load_node(issue)
                .await?
                .ok_or(Error::IssueNotFound(issue))?;
            let tree = self.store.load_subtree(node.root_id).await?;
            for member in tree {
                if !loaded.insert(member.id) {
                    continue;
                }
                for edge in self.store.load_relations(member.id).await? {
                    let other = edge.other_issue(member.id);
                    if !loaded.contains(&other) && !self.model.contains(other) {
                        queue.push_back(other);
                    }
                    if seen_edges.insert(edge.id) {
                        edges.push(edge);
                    }
                }
                nodes.push(member);
            }
        }
        if nodes.is_empty() {
            return Ok(());
        }

        self.model.merge(nodes.clone(), edges)?;

        let repaired: Vec<IssueNode> = nodes
            .iter()
            .filter_map(|stored| {
                self.model
                    .node(stored.id)
                    .ok()
                    .filter(|current| *current != stored)
                    .cloned()
            })
            .collect();
        if !repaired.is_empty() {
            info!(count = repaired.len(), "Saving repaired tree bounds");
            self.save_nodes(repaired).await?;
        }
        debug!(issues = self.model.len(), relations = self.model.relations().len(), "Loaded");
        Ok(())
    }

    /// Reload one node's attributes from the store.
    ///
    /// Tree coordinates stay as the loaded hierarchy has them.
    pub async fn refresh(&mut self, issue: IssueId) -> Result<()> {
        self.refresh_node(issue).await
    }

    async fn refresh_node(&mut self, issue: IssueId) -> Result<()> {
        let node = self
            .store
            .load_node(issue)
            .await?
            .ok_or(Error::IssueNotFound(issue))?;
        self.model.replace_node(node)
    }

    /// Persist nodes and take the saved copies into the model.
    async fn save_nodes(&mut self, nodes: Vec<IssueNode>) -> Result<Vec<IssueNode>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let saved = self.store.save_nodes(&nodes).await?;
        for node in &saved {
            self.model.replace_node(node.clone())?;
        }
        Ok(saved)
    }

    /// Current copies of the given nodes, ready to save.
    fn dirty(&self, ids: &[IssueId]) -> Result<Vec<IssueNode>> {
        self.model.nodes_of(ids)
    }

    // ========== Queries ==========

    /// The loaded working set.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The working calendar.
    pub fn calendar(&self) -> &WorkingCalendar {
        &self.calendar
    }

    /// Look up a loaded issue.
    pub fn node(&self, issue: IssueId) -> Result<&IssueNode> {
        self.model.node(issue)
    }

    /// Direct children, ordered by id.
    pub fn children(&self, issue: IssueId) -> Result<Vec<IssueId>> {
        self.model.hierarchy().children(issue)
    }

    /// All descendants, depth first.
    pub fn descendants(&self, issue: IssueId) -> Result<Vec<IssueId>> {
        self.model.hierarchy().descendants(issue)
    }

    /// Ancestors from the root down to the parent.
    pub fn ancestors(&self, issue: IssueId) -> Result<Vec<IssueId>> {
        self.model.hierarchy().ancestors(issue)
    }

    /// Relations touching an issue, in creation order.
    pub fn relations_of(&self, issue: IssueId) -> Vec<RelationEdge> {
        self.model.relations().relations_of(issue)
    }

    /// Earliest start allowed for an issue.
    pub fn soonest_start(&self, issue: IssueId) -> Result<Option<NaiveDate>> {
        self.scheduler()
            .soonest_start(issue, &mut SoonestStartCache::new())
    }

    /// Returns `true` if rescheduling `a` would reschedule `b`.
    pub fn would_reschedule(&self, a: IssueId, b: IssueId) -> Result<bool> {
        crate::schedule::would_reschedule(self.model.hierarchy(), self.model.relations(), a, b)
    }

    /// Returns `true` if `a` blocks `b`, directly or transitively.
    pub fn blocks(&self, a: IssueId, b: IssueId) -> bool {
        self.model.relations().blocks(a, b)
    }

    /// Returns `true` if some open issue blocks `issue` directly.
    pub fn is_blocked(&self, issue: IssueId) -> Result<bool> {
        for blocker in self.model.relations().blockers_of(issue) {
            if !self.statuses.is_closed(self.model.node(blocker)?.status) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ========== Mutations ==========

    /// Create an issue, optionally under a parent.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidDoneRatio`, `Error::InvalidDates`
    /// - `Error::IssueNotFound` if the parent is not loaded
    /// - `StructuralError::CrossProjectNotAllowed` if the subtask policy
    ///   forbids the parent
    /// - `Error::EarlierThanSoonestStart` if the parent's derived schedule
    ///   starts later
    #[instrument(skip(self, context), fields(actor = %context.actor))]
    pub async fn create_issue(
        &mut self,
        new_issue: NewIssue,
        context: ChangeContext,
    ) -> Result<(IssueId, PropagationReport)> {
        validate_attributes(new_issue.done_ratio, new_issue.start_date, new_issue.due_date)?;
        if let Some(parent) = new_issue.parent {
            self.model.node(parent)?;
        }

        let id = self.store.allocate_issue_id().await?;
        if self.model.contains(id) {
            return Err(Error::ConsistencyViolation(format!(
                "store allocated {id}, which is already loaded"
            )));
        }
        if let Some(parent) = new_issue.parent {
            self.guard()
                .check_subtask_project(id, new_issue.project, parent)?;
            let parent_project = self.model.node(parent)?.project;
            if let (Some(start), true) = (new_issue.start_date, self.policy.dates_derived(parent_project)) {
                if let Some(soonest) = self.soonest_start(parent)? {
                    if start < soonest {
                        return Err(Error::EarlierThanSoonestStart { issue: id, soonest });
                    }
                }
            }
        }
        let mut node = IssueNode::from_new(id, &new_issue);
        self.apply_status(&mut node, new_issue.status)?;

        self.model.insert_node(node)?;
        let mut changed = vec![id];
        if new_issue.parent.is_some() {
            for moved in self.model.commit_parent(id, new_issue.parent)? {
                if moved != id {
                    changed.push(moved);
                }
            }
        }
        let nodes = self.dirty(&changed)?;
        if let Err(err) = self.save_nodes(nodes).await {
            self.model.remove_issue(id, OrphanPolicy::DeleteSubtree)?;
            return Err(err);
        }
        info!(issue = %id, parent = ?new_issue.parent, "Created issue");

        let mut run = Propagation::new(context.clone());
        run.emit(TrackerEvent::IssueCreated {
            issue: id,
            parent: new_issue.parent,
            context,
        });
        for &moved in &changed[1..] {
            run.report.record(moved);
        }
        run.recalculate(new_issue.parent);
        Ok((id, self.propagate(run).await))
    }

    /// Move an issue (with its subtree) under a new parent, or make it a
    /// root.
    ///
    /// # Errors
    ///
    /// Any [`crate::error::StructuralError`] from the guard, or a store
    /// error from persisting the shifted nodes.
    #[instrument(skip(self, context), fields(actor = %context.actor))]
    pub async fn set_parent(
        &mut self,
        child: IssueId,
        new_parent: Option<IssueId>,
        context: ChangeContext,
    ) -> Result<PropagationReport> {
        self.guard().check_parent(child, new_parent)?;
        let old_parent = self.model.node(child)?.parent;
        if old_parent == new_parent {
            return Ok(PropagationReport::default());
        }

        let changed = self.model.commit_parent(child, new_parent)?;
        let nodes = self.dirty(&changed)?;
        if let Err(err) = self.save_nodes(nodes).await {
            self.model.commit_parent(child, old_parent)?;
            return Err(err);
        }
        info!(issue = %child, from = ?old_parent, to = ?new_parent, "Moved issue");

        let mut run = Propagation::new(context.clone());
        run.emit(TrackerEvent::ParentChanged {
            issue: child,
            from: old_parent,
            to: new_parent,
            context,
        });
        for &moved in &changed {
            run.report.record(moved);
        }
        if let Some(parent) = new_parent {
            let parent_node = self.model.node(parent)?;
            if self.policy.dates_derived(parent_node.project) {
                match self.scheduler().soonest_start(parent, &mut run.cache) {
                    Ok(Some(bound)) => run.push(Step::Cascade { issue: child, bound }),
                    Ok(None) => {}
                    Err(err) => run.fail(child, err),
                }
            }
        }
        run.recalculate(old_parent);
        run.recalculate(new_parent);
        Ok(self.propagate(run).await)
    }

    /// Add a relation between two loaded issues.
    ///
    /// Reverse kinds are stored canonically. A new `precedes` relation moves
    /// its target if the target starts before the new bound.
    ///
    /// # Errors
    ///
    /// Any [`crate::error::StructuralError`] from the guard, or a store
    /// error.
    #[instrument(skip(self, context), fields(actor = %context.actor))]
    pub async fn add_relation(
        &mut self,
        request: NewRelation,
        context: ChangeContext,
    ) -> Result<(RelationEdge, PropagationReport)> {
        let relation = self.guard().check_relation(request)?;
        let id = self.store.allocate_relation_id().await?;
        if self.model.relations().get(id).is_some() {
            return Err(Error::ConsistencyViolation(format!(
                "store allocated {id}, which is already loaded"
            )));
        }

        let edge = self.model.commit_relation(id, relation);
        if let Err(err) = self.store.save_edges(std::slice::from_ref(&edge)).await {
            self.model.remove_relation(id)?;
            return Err(err);
        }
        info!(relation = %edge.id, kind = %edge.kind, from = %edge.issue_from, to = %edge.issue_to, "Added relation");

        let mut run = Propagation::new(context.clone());
        run.emit(TrackerEvent::RelationAdded {
            relation: edge.clone(),
            context,
        });
        match self.scheduler().successor_soonest_start(&edge) {
            Ok(Some(bound)) => run.push(Step::Cascade {
                issue: edge.issue_to,
                bound,
            }),
            Ok(None) => {}
            Err(err) => run.fail(edge.issue_to, err),
        }
        Ok((edge, self.propagate(run).await))
    }

    /// Remove a relation.
    ///
    /// # Errors
    ///
    /// Returns `Error::RelationNotFound` if it isn't loaded.
    #[instrument(skip(self, context), fields(actor = %context.actor))]
    pub async fn remove_relation(
        &mut self,
        id: RelationId,
        context: ChangeContext,
    ) -> Result<PropagationReport> {
        let edge = self.model.remove_relation(id)?;
        if let Err(err) = self.store.delete_edge(id).await {
            self.model.restore_relation(edge);
            return Err(err);
        }
        info!(relation = %id, "Removed relation");

        let mut run = Propagation::new(context.clone());
        run.emit(TrackerEvent::RelationRemoved {
            relation: edge,
            context,
        });
        Ok(run.report)
    }

    /// Edit user-editable attributes of an issue.
    ///
    /// Date changes reschedule following issues; changes to aggregated
    /// attributes recalculate the ancestors; closing an issue closes its
    /// duplicates.
    ///
    /// # Errors
    ///
    /// - `Error::DerivedAttribute` if a derived attribute is set on a parent
    /// - `Error::InvalidDoneRatio`, `Error::InvalidDates`
    /// - `Error::EarlierThanSoonestStart` if the start precedes the bound
    ///   set by preceding issues
    /// - `Error::ConsistencyViolation` if the schedule around the issue
    ///   feeds back into itself
    /// - `Error::Conflict` if the issue was modified concurrently
    #[instrument(skip(self, context), fields(actor = %context.actor))]
    pub async fn update_issue(
        &mut self,
        issue: IssueId,
        update: IssueUpdate,
        context: ChangeContext,
    ) -> Result<PropagationReport> {
        let before = self.model.node(issue)?.clone();
        self.check_derived(&before, &update)?;

        let mut after = before.clone();
        if let Some(start) = update.start_date {
            after.start_date = start;
        }
        if let Some(due) = update.due_date {
            after.due_date = due;
        }
        if let Some(priority) = update.priority {
            after.priority = priority;
        }
        if let Some(ratio) = update.done_ratio {
            after.done_ratio = ratio;
        }
        if let Some(hours) = update.estimated_hours {
            after.estimated_hours = hours;
        }
        if let Some(status) = update.status {
            self.apply_status(&mut after, status)?;
        }
        validate_attributes(after.done_ratio, after.start_date, after.due_date)?;
        if after == before {
            return Ok(PropagationReport::default());
        }

        let dates_changed =
            after.start_date != before.start_date || after.due_date != before.due_date;
        if let Some(start) = after.start_date.filter(|_| after.start_date != before.start_date) {
            if let Some(soonest) = self.soonest_start(issue)? {
                if start < soonest {
                    return Err(Error::EarlierThanSoonestStart { issue, soonest });
                }
            }
        }
        if dates_changed {
            self.ensure_acyclic(issue)?;
        }

        self.save_nodes(vec![after.clone()]).await?;
        info!(%issue, "Updated issue");

        let mut run = Propagation::new(context.clone());
        run.emit(TrackerEvent::IssueUpdated { issue, context });
        if dates_changed {
            run.cache.invalidate(&self.model, issue)?;
            run.push(Step::FollowSuccessors(issue));
        }
        let closed_now =
            self.statuses.is_closed(after.status) && !self.statuses.is_closed(before.status);
        if closed_now {
            run.push(Step::CloseDuplicates(issue));
        }
        run.recalculate(after.parent);
        Ok(self.propagate(run).await)
    }

    /// Move an issue to start on `date`, keeping its working duration, and
    /// cascade to everything that follows it.
    ///
    /// On a parent with derived dates the matching leaves are moved instead.
    ///
    /// # Errors
    ///
    /// - `Error::ConsistencyViolation` if the schedule around the issue
    ///   feeds back into itself
    /// - `Error::Conflict` (retryable) if the issue itself could not be
    ///   saved after one reload
    #[instrument(skip(self, context), fields(actor = %context.actor))]
    pub async fn reschedule_on(
        &mut self,
        issue: IssueId,
        date: NaiveDate,
        context: ChangeContext,
    ) -> Result<PropagationReport> {
        self.ensure_acyclic(issue)?;
        let node = self.model.node(issue)?;
        let single = self.model.hierarchy().is_leaf(issue)? || !self.policy.dates_derived(node.project);

        let mut run = Propagation::new(context);
        if single {
            let planned = self
                .scheduler()
                .plan_move(node, date, &mut run.cache)?;
            if let Some(planned) = planned {
                self.commit_move(planned, date, &mut run).await?;
            }
        } else {
            run.push(Step::Reschedule { issue, date });
        }
        Ok(self.propagate(run).await)
    }

    /// Delete an issue.
    ///
    /// Its relations are removed, its children are promoted or deleted
    /// according to `policy`, and its former parent is recalculated.
    ///
    /// # Errors
    ///
    /// Returns `Error::IssueNotFound` if it isn't loaded, or a store error;
    /// either way the model is unchanged. Relations another writer already
    /// removed count as deleted, so a failed deletion can be retried.
    #[instrument(skip(self, context), fields(actor = %context.actor))]
    pub async fn delete_issue(
        &mut self,
        issue: IssueId,
        policy: OrphanPolicy,
        context: ChangeContext,
    ) -> Result<PropagationReport> {
        let parent = self.model.node(issue)?.parent;
        let promoted = match policy {
            OrphanPolicy::PromoteChildren => self.model.hierarchy().children(issue)?,
            OrphanPolicy::DeleteSubtree => Vec::new(),
        };
        let snapshot = self.model.clone();
        let (removed_nodes, removed_edges, changed) = self.model.remove_issue(issue, policy)?;

        let removed_ids: Vec<IssueId> = removed_nodes.iter().map(|node| node.id).collect();
        let nodes = self.dirty(&changed)?;
        let saved = match self.save_nodes(nodes).await {
            Ok(saved) => saved,
            Err(err) => {
                self.model = snapshot;
                return Err(err);
            }
        };
        if let Err(err) = self.delete_records(&removed_edges, &removed_ids).await {
            warn!(%issue, error = %err, "Deletion failed after saving shifted nodes, restoring model");
            self.model = snapshot;
            // Keep the versions just written so a retry is not stale.
            for node in saved {
                let mut restored = self.model.node(node.id)?.clone();
                restored.lock_version = node.lock_version;
                self.model.replace_node(restored)?;
            }
            return Err(err);
        }
        info!(%issue, removed = removed_ids.len(), relations = removed_edges.len(), "Deleted issue");

        let mut run = Propagation::new(context.clone());
        for edge in removed_edges {
            run.emit(TrackerEvent::RelationRemoved {
                relation: edge,
                context: context.clone(),
            });
        }
        for child in promoted {
            run.emit(TrackerEvent::ParentChanged {
                issue: child,
                from: Some(issue),
                to: None,
                context: context.clone(),
            });
        }
        for id in removed_ids {
            run.emit(TrackerEvent::IssueDeleted {
                issue: id,
                context: context.clone(),
            });
        }
        for &moved in &changed {
            run.report.record(moved);
        }
        run.recalculate(parent);
        Ok(self.propagate(run).await)
    }

    // ========== Helpers ==========

    /// Delete relations, then nodes, from the store.
    async fn delete_records(&mut self, edges: &[RelationEdge], ids: &[IssueId]) -> Result<()> {
        for edge in edges {
            match self.store.delete_edge(edge.id).await {
                Ok(()) => {}
                Err(Error::RelationNotFound(id)) => debug!(relation = %id, "Relation already deleted"),
                Err(err) => return Err(err),
            }
        }
        self.store.delete_nodes(ids).await
    }

    /// Set a status, taking the done ratio from it when the project uses
    /// status-driven done ratios and the ratio is not derived.
    fn apply_status(&self, node: &mut IssueNode, status: StatusId) -> Result<()> {
        node.status = status;
        if !self.policy.done_ratio_uses_status(node.project) {
            return Ok(());
        }
        let derived = self.model.hierarchy().contains(node.id)
            && !self.model.hierarchy().is_leaf(node.id)?
            && self.policy.done_ratio_derived(node.project);
        if !derived {
            if let Some(ratio) = self.statuses.default_done_ratio(status) {
                node.done_ratio = ratio;
            }
        }
        Ok(())
    }

    /// Reject edits of attributes a parent derives from its children.
    fn check_derived(&self, node: &IssueNode, update: &IssueUpdate) -> Result<()> {
        if self.model.hierarchy().is_leaf(node.id)? {
            return Ok(());
        }
        let project = node.project;
        let dates = self.policy.dates_derived(project);
        let rejected = if update.start_date.is_some() && dates {
            Some("start date")
        } else if update.due_date.is_some() && dates {
            Some("due date")
        } else if update.priority.is_some() && self.policy.priority_derived(project) {
            Some("priority")
        } else if update.done_ratio.is_some() && self.policy.done_ratio_derived(project) {
            Some("done ratio")
        } else {
            None
        };
        match rejected {
            Some(attribute) => Err(Error::DerivedAttribute {
                issue: node.id,
                attribute,
            }),
            None => Ok(()),
        }
    }

    /// Abort before a cascade over a schedule that feeds back into itself.
    fn ensure_acyclic(&self, issue: IssueId) -> Result<()> {
        if self.scheduler().feeds_back(issue)? {
            let err = Error::ConsistencyViolation(format!(
                "rescheduling {issue} would reschedule it again"
            ));
            error!(%issue, error = %err, "Corrupt relation graph");
            return Err(err);
        }
        Ok(())
    }
}

/// Attribute rules shared by creation and edits.
fn validate_attributes(
    done_ratio: u8,
    start: Option<NaiveDate>,
    due: Option<NaiveDate>,
) -> Result<()> {
    if done_ratio > 100 {
        return Err(Error::InvalidDoneRatio(done_ratio));
    }
    if let (Some(start), Some(due)) = (start, due) {
        if due < start {
            return Err(Error::InvalidDates { start, due });
        }
    }
    Ok(())
}
