//! Error types for trellis operations.

use crate::domain::{IssueId, ProjectId, RelationId, RelationKind};
use chrono::NaiveDate;
use std::io;
use thiserror::Error;

/// A rejected structural mutation.
///
/// These are always detected before anything is changed, so the caller can
/// fix the input and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    /// The new parent is the issue itself or one of its descendants.
    #[error("Issue {child} cannot be moved under {parent}: it is the issue itself or one of its subtasks")]
    CyclicParent {
        /// Issue being moved
        child: IssueId,
        /// Requested parent
        parent: IssueId,
    },

    /// The relation would make the issues depend on each other.
    #[error("Relation {kind} from {from} to {to} would create a circular dependency")]
    CircularDependency {
        /// Canonical source
        from: IssueId,
        /// Canonical target
        to: IssueId,
        /// Canonical kind
        kind: RelationKind,
    },

    /// The endpoints are in an ancestor/descendant relationship.
    #[error("Issue {from} cannot be linked to {to}: one is a subtask of the other")]
    LinkedToDescendant {
        /// Canonical source
        from: IssueId,
        /// Canonical target
        to: IssueId,
    },

    /// The endpoints belong to projects that may not be linked.
    #[error("Issue {issue} ({issue_project}) cannot be linked to {target} ({target_project})")]
    CrossProjectNotAllowed {
        /// Issue being changed
        issue: IssueId,
        /// Its project
        issue_project: ProjectId,
        /// Parent or relation target
        target: IssueId,
        /// The target's project
        target_project: ProjectId,
    },

    /// A relation already exists between these issues.
    #[error("Issue {from} is already linked to {to}")]
    DuplicateRelation {
        /// Canonical source
        from: IssueId,
        /// Canonical target
        to: IssueId,
    },

    /// Both endpoints are the same issue.
    #[error("Issue {0} cannot be related to itself")]
    SameIssue(IssueId),
}

/// The error type for trellis operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A structural invariant would be violated.
    #[error(transparent)]
    Structural(#[from] StructuralError),

    /// Optimistic concurrency check failed in the persistence layer.
    #[error("Issue {issue} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        /// Issue whose version did not match
        issue: IssueId,
        /// Version the writer held
        expected: u64,
        /// Version found in storage
        found: u64,
    },

    /// An internal invariant is broken. Indicates a bug or corrupt data.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Issue not found.
    #[error("Issue not found: {0}")]
    IssueNotFound(IssueId),

    /// Relation not found.
    #[error("Relation not found: {0}")]
    RelationNotFound(RelationId),

    /// Done ratio outside 0-100.
    #[error("Invalid done ratio: {0} (must be 0-100)")]
    InvalidDoneRatio(u8),

    /// Due date before start date.
    #[error("Due date {due} is before start date {start}")]
    InvalidDates {
        /// Requested start
        start: NaiveDate,
        /// Requested due
        due: NaiveDate,
    },

    /// Start date earlier than allowed by preceding issues.
    #[error("Start date of {issue} cannot be earlier than {soonest} because of preceding issues")]
    EarlierThanSoonestStart {
        /// Issue being edited
        issue: IssueId,
        /// Earliest permitted start
        soonest: NaiveDate,
    },

    /// Attribute is computed from subtasks and cannot be set directly.
    #[error("The {attribute} of {issue} is derived from its subtasks")]
    DerivedAttribute {
        /// Parent issue
        issue: IssueId,
        /// Attribute name
        attribute: &'static str,
    },

    /// Relation delay outside the supported range.
    #[error("Invalid delay: {delay} working days (must be within ±{max})")]
    InvalidDelay {
        /// Requested delay
        delay: i32,
        /// Largest accepted magnitude
        max: i32,
    },

    /// Date arithmetic left the representable calendar.
    #[error("Moving {date} by {days} days leaves the supported date range")]
    DateOutOfRange {
        /// Starting date
        date: NaiveDate,
        /// Offset in days
        days: i64,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Returns the structural error, if this is one.
    pub fn as_structural(&self) -> Option<&StructuralError> {
        match self {
            Error::Structural(err) => Some(err),
            _ => None,
        }
    }
}

/// A specialized Result type for trellis operations.
pub type Result<T> = std::result::Result<T, Error>;
