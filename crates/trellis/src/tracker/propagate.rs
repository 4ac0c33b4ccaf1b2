//! Explicit propagation queue.
//!
//! A committed change seeds a [`Propagation`] with follow-up steps. The
//! tracker drains the queue in order; each step may queue further steps.
//! A failing step is recorded in the report and the queue carries on with
//! the remaining steps. Nothing already committed is rolled back.

use super::Tracker;
use crate::aggregate::Recalculation;
use crate::domain::{ChangeContext, IssueId, IssueNode};
use crate::error::{Error, Result};
use crate::events::TrackerEvent;
use crate::schedule::{DateMove, DateSpan, SoonestStartCache};
use chrono::NaiveDate;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, error, warn};

/// A propagation step that failed.
///
/// Follow-up work of the failed step was not performed.
#[derive(Debug)]
pub struct PropagationFailure {
    /// Issue the step was working on
    pub issue: IssueId,
    /// Why it failed
    pub error: Error,
}

/// What an operation changed, including everything it propagated to
#[derive(Debug, Default)]
pub struct PropagationReport {
    /// Committed changes, in commit order
    pub events: Vec<TrackerEvent>,
    /// Issues whose stored state changed, in first-commit order
    pub updated: Vec<IssueId>,
    /// Propagation steps that failed
    pub failures: Vec<PropagationFailure>,
}

impl PropagationReport {
    /// Returns `true` if every propagation step succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns `true` if `issue` was changed.
    pub fn touched(&self, issue: IssueId) -> bool {
        self.updated.contains(&issue)
    }

    pub(crate) fn record(&mut self, issue: IssueId) {
        if !self.updated.contains(&issue) {
            self.updated.push(issue);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    /// Check every `precedes` successor of an issue against its new bound
    FollowSuccessors(IssueId),
    /// Move an issue to `bound` unless it already starts on or after it
    Cascade { issue: IssueId, bound: NaiveDate },
    /// Move an issue (or the matching leaves of a derived parent) to `date`
    Reschedule { issue: IssueId, date: NaiveDate },
    /// Recompute derived attributes of a parent
    Recalculate(IssueId),
    /// Close the open duplicates of a closed issue
    CloseDuplicates(IssueId),
}

impl Step {
    fn issue(self) -> IssueId {
        match self {
            Self::FollowSuccessors(issue)
            | Self::Cascade { issue, .. }
            | Self::Reschedule { issue, .. }
            | Self::Recalculate(issue)
            | Self::CloseDuplicates(issue) => issue,
        }
    }
}

/// State of one propagation pass
pub(crate) struct Propagation {
    queue: VecDeque<Step>,
    pending_recalc: HashSet<IssueId>,
    closed: HashSet<IssueId>,
    /// `(issue, date)` pairs already planned
    scheduled: HashSet<(IssueId, NaiveDate)>,
    /// Issues known not to feed back into themselves
    acyclic: HashSet<IssueId>,
    pub(crate) cache: SoonestStartCache,
    pub(crate) context: ChangeContext,
    pub(crate) report: PropagationReport,
}

impl Propagation {
    pub(crate) fn new(context: ChangeContext) -> Self {
        Self {
            queue: VecDeque::new(),
            pending_recalc: HashSet::new(),
            closed: HashSet::new(),
            scheduled: HashSet::new(),
            acyclic: HashSet::new(),
            cache: SoonestStartCache::new(),
            context,
            report: PropagationReport::default(),
        }
    }

    /// Queue a step. Recalculations already waiting are not queued twice.
    pub(crate) fn push(&mut self, step: Step) {
        if let Step::Recalculate(issue) = step {
            if !self.pending_recalc.insert(issue) {
                return;
            }
        }
        self.queue.push_back(step);
    }

    /// Queue recalculation of `parent`, if there is one.
    pub(crate) fn recalculate(&mut self, parent: Option<IssueId>) {
        if let Some(parent) = parent {
            self.push(Step::Recalculate(parent));
        }
    }

    pub(crate) fn emit(&mut self, event: TrackerEvent) {
        if let Some(issue) = event.issue() {
            self.report.record(issue);
        }
        self.report.events.push(event);
    }

    /// Record a failed step.
    pub(crate) fn fail(&mut self, issue: IssueId, error: Error) {
        if matches!(error, Error::ConsistencyViolation(_)) {
            error!(%issue, %error, "Propagation hit a consistency violation");
        } else {
            warn!(%issue, %error, "Propagation step failed");
        }
        self.report.failures.push(PropagationFailure { issue, error });
    }

    fn pop(&mut self) -> Option<Step> {
        let step = self.queue.pop_front()?;
        if let Step::Recalculate(issue) = step {
            self.pending_recalc.remove(&issue);
        }
        Some(step)
    }
}

impl Tracker {
    /// Drain the queue and return the report.
    pub(crate) async fn propagate(&mut self, mut run: Propagation) -> PropagationReport {
        while let Some(step) = run.pop() {
            debug!(?step, "Propagation step");
            let result = match step {
                Step::FollowSuccessors(issue) => self.follow_successors(issue, &mut run),
                Step::Cascade { issue, bound } => self.cascade(issue, bound, &mut run).await,
                Step::Reschedule { issue, date } => self.reschedule_step(issue, date, &mut run).await,
                Step::Recalculate(issue) => self.recalculate_step(issue, &mut run).await,
                Step::CloseDuplicates(issue) => self.close_duplicates(issue, &mut run).await,
            };
            if let Err(err) = result {
                run.fail(step.issue(), err);
            }
        }
        run.report
    }

    fn follow_successors(&self, issue: IssueId, run: &mut Propagation) -> Result<()> {
        let scheduler = self.scheduler();
        for edge in self.model.relations().successors(issue) {
            if let Some(bound) = scheduler.successor_soonest_start(&edge)? {
                run.push(Step::Cascade {
                    issue: edge.issue_to,
                    bound,
                });
            }
        }
        Ok(())
    }

    async fn cascade(&mut self, issue: IssueId, bound: NaiveDate, run: &mut Propagation) -> Result<()> {
        let node = self.model.node(issue)?;
        if node.start_date.is_some_and(|start| start >= bound) {
            return Ok(());
        }
        self.reschedule_step(issue, bound, run).await
    }

    /// Move an issue to `date`. An issue whose schedule feeds back into
    /// itself is never moved, so a corrupt cycle ends the branch.
    async fn reschedule_step(&mut self, issue: IssueId, date: NaiveDate, run: &mut Propagation) -> Result<()> {
        if !run.scheduled.insert((issue, date)) {
            return Ok(());
        }
        if !run.acyclic.contains(&issue) {
            self.ensure_acyclic(issue)?;
            run.acyclic.insert(issue);
        }
        let moves = self.scheduler().plan_reschedule(issue, date, &mut run.cache)?;
        for planned in moves {
            self.commit_move(planned, date, run).await?;
        }
        Ok(())
    }

    /// Persist a planned move, reloading and re-planning once on a stale
    /// write, then queue its follow-ups.
    pub(crate) async fn commit_move(
        &mut self,
        planned: DateMove,
        date: NaiveDate,
        run: &mut Propagation,
    ) -> Result<()> {
        let mut first = Some(planned);
        let saved = self
            .save_with_retry(planned.issue, &mut run.cache, |tracker, node, cache| {
                let planned = match first.take() {
                    Some(planned) => Some(planned),
                    None => tracker.scheduler().plan_move(node, date, cache)?,
                };
                Ok(planned.map(|planned| {
                    let mut updated = node.clone();
                    planned.apply(&mut updated);
                    updated
                }))
            })
            .await?;

        let Some((before, after)) = saved else {
            return Ok(());
        };
        run.cache.invalidate(&self.model, after.id)?;
        run.emit(TrackerEvent::IssueRescheduled {
            issue: after.id,
            from: DateSpan::of(&before),
            to: DateSpan::of(&after),
            context: run.context.clone(),
        });
        run.push(Step::FollowSuccessors(after.id));
        run.recalculate(after.parent);
        Ok(())
    }

    async fn recalculate_step(&mut self, issue: IssueId, run: &mut Propagation) -> Result<()> {
        let parent = self.model.node(issue)?.parent;
        let saved = self
            .save_with_retry(issue, &mut run.cache, |tracker, node, _| {
                let change = tracker.aggregator().recalculate(node.id)?;
                Ok((!change.is_empty()).then(|| {
                    let mut updated = node.clone();
                    change.apply(&mut updated);
                    updated
                }))
            })
            .await?;

        if let Some((before, after)) = saved {
            let changes = Recalculation::between(&before, &after);
            if changes.touches_dates() {
                run.cache.invalidate(&self.model, issue)?;
                run.push(Step::FollowSuccessors(issue));
            }
            run.emit(TrackerEvent::ParentRecalculated {
                issue,
                changes,
                context: run.context.clone(),
            });
        }
        run.recalculate(parent);
        Ok(())
    }

    async fn close_duplicates(&mut self, issue: IssueId, run: &mut Propagation) -> Result<()> {
        if !self.policy.close_duplicate_issues() {
            return Ok(());
        }
        let node = self.model.node(issue)?;
        if !self.statuses.is_closed(node.status) {
            return Ok(());
        }
        let status = node.status;
        run.closed.insert(issue);

        for duplicate in self.model.relations().duplicates_of(issue) {
            if !run.closed.insert(duplicate) {
                continue;
            }
            let saved = self
                .save_with_retry(duplicate, &mut run.cache, |tracker, node, _| {
                    if tracker.statuses.is_closed(node.status) {
                        return Ok(None);
                    }
                    let mut updated = node.clone();
                    tracker.apply_status(&mut updated, status)?;
                    Ok(Some(updated))
                })
                .await?;

            if let Some((_, after)) = saved {
                run.emit(TrackerEvent::IssueClosedAsDuplicate {
                    issue: duplicate,
                    duplicate_of: issue,
                    status,
                    context: run.context.clone(),
                });
                run.push(Step::CloseDuplicates(duplicate));
                run.recalculate(after.parent);
            }
        }
        Ok(())
    }

    /// Save an updated copy of one node.
    ///
    /// `plan` derives the updated node from the current one, or returns
    /// `None` when nothing needs to change. On a stale write the node is
    /// reloaded and planned once more; a second conflict is returned.
    ///
    /// Returns the node before and after the save.
    pub(crate) async fn save_with_retry<P>(
        &mut self,
        issue: IssueId,
        cache: &mut SoonestStartCache,
        mut plan: P,
    ) -> Result<Option<(IssueNode, IssueNode)>>
    where
        P: FnMut(&Self, &IssueNode, &mut SoonestStartCache) -> Result<Option<IssueNode>> + Send,
    {
        let before = self.model.node(issue)?.clone();
        let Some(updated) = plan(self, &before, cache)? else {
            return Ok(None);
        };
        match self.save_nodes(vec![updated]).await {
            Ok(mut saved) => Ok(saved.pop().map(|after| (before, after))),
            Err(err) if err.is_retryable() => {
                warn!(%issue, error = %err, "Stale write, reloading and retrying once");
                self.refresh_node(issue).await?;
                cache.invalidate(&self.model, issue)?;
                let before = self.model.node(issue)?.clone();
                let Some(updated) = plan(self, &before, cache)? else {
                    return Ok(None);
                };
                let mut saved = self.save_nodes(vec![updated]).await?;
                Ok(saved.pop().map(|after| (before, after)))
            }
            Err(err) => Err(err),
        }
    }
}
