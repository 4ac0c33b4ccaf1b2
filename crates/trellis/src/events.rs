//! Change notifications returned by tracker operations.

use crate::aggregate::Recalculation;
use crate::domain::{ChangeContext, IssueId, RelationEdge, StatusId};
use crate::schedule::DateSpan;
use serde::Serialize;

/// Something the tracker changed, attributed to the context that caused it.
///
/// Events are returned in the order the changes were committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    /// A new issue was stored
    IssueCreated {
        /// New issue
        issue: IssueId,
        /// Parent it was created under
        parent: Option<IssueId>,
        /// Who caused it
        context: ChangeContext,
    },

    /// User-editable attributes of an issue changed
    IssueUpdated {
        /// Edited issue
        issue: IssueId,
        /// Who caused it
        context: ChangeContext,
    },

    /// An issue's dates were moved by the scheduler
    IssueRescheduled {
        /// Moved issue
        issue: IssueId,
        /// Dates before
        from: DateSpan,
        /// Dates after
        to: DateSpan,
        /// Who caused it
        context: ChangeContext,
    },

    /// Derived attributes of a parent were recomputed
    ParentRecalculated {
        /// Parent issue
        issue: IssueId,
        /// Attributes that changed
        changes: Recalculation,
        /// Who caused it
        context: ChangeContext,
    },

    /// An issue moved in the hierarchy
    ParentChanged {
        /// Moved issue
        issue: IssueId,
        /// Previous parent
        from: Option<IssueId>,
        /// New parent
        to: Option<IssueId>,
        /// Who caused it
        context: ChangeContext,
    },

    /// A relation was stored
    RelationAdded {
        /// Stored relation
        relation: RelationEdge,
        /// Who caused it
        context: ChangeContext,
    },

    /// A relation was removed
    RelationRemoved {
        /// Removed relation
        relation: RelationEdge,
        /// Who caused it
        context: ChangeContext,
    },

    /// A duplicate was closed because the issue it duplicates was closed
    IssueClosedAsDuplicate {
        /// Closed duplicate
        issue: IssueId,
        /// Issue it duplicates
        duplicate_of: IssueId,
        /// Status it was given
        status: StatusId,
        /// Who caused it
        context: ChangeContext,
    },

    /// An issue was deleted
    IssueDeleted {
        /// Deleted issue
        issue: IssueId,
        /// Who caused it
        context: ChangeContext,
    },
}

impl TrackerEvent {
    /// The issue the event is about, if it is about one.
    pub fn issue(&self) -> Option<IssueId> {
        match self {
            Self::IssueCreated { issue, .. }
            | Self::IssueUpdated { issue, .. }
            | Self::IssueRescheduled { issue, .. }
            | Self::ParentRecalculated { issue, .. }
            | Self::ParentChanged { issue, .. }
            | Self::IssueClosedAsDuplicate { issue, .. }
            | Self::IssueDeleted { issue, .. } => Some(*issue),
            Self::RelationAdded { .. } | Self::RelationRemoved { .. } => None,
        }
    }

    /// Who caused the change.
    pub fn context(&self) -> &ChangeContext {
        match self {
            Self::IssueCreated { context, .. }
            | Self::IssueUpdated { context, .. }
            | Self::IssueRescheduled { context, .. }
            | Self::ParentRecalculated { context, .. }
            | Self::ParentChanged { context, .. }
            | Self::RelationAdded { context, .. }
            | Self::RelationRemoved { context, .. }
            | Self::IssueClosedAsDuplicate { context, .. }
            | Self::IssueDeleted { context, .. } => context,
        }
    }
}
