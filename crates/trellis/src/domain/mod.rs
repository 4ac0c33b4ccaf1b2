//! Domain types for issue hierarchies and relations.
//!
//! This module contains the core value types shared by the hierarchy store,
//! the relation graph, the scheduler and the attribute aggregator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub u64);

impl IssueId {
    /// Create a new issue ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for IssueId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of the project an issue belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project {}", self.0)
    }
}

/// Reference into the status catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusId(pub u32);

/// Reference into the priority catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityId(pub u32);

/// Identifier of a stored relation edge.
///
/// Ids are allocated monotonically, so ordering by id is ordering by
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationId(pub u64);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relation {}", self.0)
    }
}

/// Nested-set coordinates of a node.
///
/// These are index data owned by [`crate::hierarchy::Hierarchy`]. They are
/// serialized so that a persistence layer can store them, but carry no
/// meaning outside the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NestedBounds {
    pub(crate) lft: u32,
    pub(crate) rgt: u32,
}

/// An issue as seen by the hierarchy and scheduling core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueNode {
    /// Unique identifier for the issue
    pub id: IssueId,

    /// Owning project
    pub project: ProjectId,

    /// Current status
    pub status: StatusId,

    /// Current priority
    pub priority: PriorityId,

    /// Planned start date
    pub start_date: Option<NaiveDate>,

    /// Planned due date
    pub due_date: Option<NaiveDate>,

    /// Completion percentage (0-100)
    pub done_ratio: u8,

    /// Estimated effort of this issue alone, in hours
    pub estimated_hours: Option<f64>,

    /// Parent issue, if any
    pub parent: Option<IssueId>,

    /// Root of the tree this issue belongs to
    pub root_id: IssueId,

    /// Nested-set coordinates
    #[serde(default)]
    pub bounds: NestedBounds,

    /// Optimistic concurrency token, bumped on every save
    #[serde(default)]
    pub lock_version: u64,
}

impl IssueNode {
    /// Build the node for a freshly created issue (its own single-node tree).
    pub fn from_new(id: IssueId, new_issue: &NewIssue) -> Self {
        Self {
            id,
            project: new_issue.project,
            status: new_issue.status,
            priority: new_issue.priority,
            start_date: new_issue.start_date,
            due_date: new_issue.due_date,
            done_ratio: new_issue.done_ratio,
            estimated_hours: new_issue.estimated_hours,
            parent: None,
            root_id: id,
            bounds: NestedBounds { lft: 1, rgt: 2 },
            lock_version: 0,
        }
    }

    /// Returns `true` if this issue is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns `true` if either a start or a due date is set.
    pub fn has_dates(&self) -> bool {
        self.start_date.is_some() || self.due_date.is_some()
    }
}

/// Data for creating a new issue
#[derive(Debug, Clone)]
pub struct NewIssue {
    /// Owning project
    pub project: ProjectId,

    /// Initial status
    pub status: StatusId,

    /// Initial priority
    pub priority: PriorityId,

    /// Planned start date
    pub start_date: Option<NaiveDate>,

    /// Planned due date
    pub due_date: Option<NaiveDate>,

    /// Completion percentage (0-100)
    pub done_ratio: u8,

    /// Estimated effort, in hours
    pub estimated_hours: Option<f64>,

    /// Parent to attach the new issue to
    pub parent: Option<IssueId>,
}

/// Data for updating an existing issue.
///
/// Only fields that are `Some` are applied. Date fields use a nested option
/// so a caller can clear a date (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    /// New start date (if updating, `Some(None)` to clear)
    pub start_date: Option<Option<NaiveDate>>,

    /// New due date (if updating, `Some(None)` to clear)
    pub due_date: Option<Option<NaiveDate>>,

    /// New status (if updating)
    pub status: Option<StatusId>,

    /// New priority (if updating)
    pub priority: Option<PriorityId>,

    /// New completion percentage (if updating)
    pub done_ratio: Option<u8>,

    /// New estimate (if updating, `Some(None)` to clear)
    pub estimated_hours: Option<Option<f64>>,
}

impl IssueUpdate {
    /// Returns `true` if the update touches start or due date.
    pub fn touches_dates(&self) -> bool {
        self.start_date.is_some() || self.due_date.is_some()
    }
}

/// Type of relation between two issues.
///
/// The set is closed and paired: every kind has a reverse, and `relates` is
/// its own reverse. Only the canonical half of each pair is ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Informational link, symmetric
    Relates,
    /// `from` is a duplicate of `to`
    Duplicates,
    /// Reverse of `Duplicates`
    DuplicatedBy,
    /// `from` must be closed before work on `to`
    Blocks,
    /// Reverse of `Blocks`
    BlockedBy,
    /// `to` starts after `from` ends (plus a delay)
    Precedes,
    /// Reverse of `Precedes`
    Follows,
    /// `to` was copied from `from`
    CopiedTo,
    /// Reverse of `CopiedTo`
    CopiedFrom,
}

impl RelationKind {
    /// The kind seen from the other endpoint.
    pub fn reverse(self) -> Self {
        match self {
            Self::Relates => Self::Relates,
            Self::Duplicates => Self::DuplicatedBy,
            Self::DuplicatedBy => Self::Duplicates,
            Self::Blocks => Self::BlockedBy,
            Self::BlockedBy => Self::Blocks,
            Self::Precedes => Self::Follows,
            Self::Follows => Self::Precedes,
            Self::CopiedTo => Self::CopiedFrom,
            Self::CopiedFrom => Self::CopiedTo,
        }
    }

    /// Returns `true` for the half of each pair that is kept in storage.
    pub fn is_canonical(self) -> bool {
        matches!(
            self,
            Self::Relates | Self::Duplicates | Self::Blocks | Self::Precedes | Self::CopiedTo
        )
    }

    /// Returns `true` if relations of this kind carry a delay.
    pub fn has_delay(self) -> bool {
        matches!(self, Self::Precedes | Self::Follows)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Relates => "relates",
            Self::Duplicates => "duplicates",
            Self::DuplicatedBy => "duplicated_by",
            Self::Blocks => "blocks",
            Self::BlockedBy => "blocked_by",
            Self::Precedes => "precedes",
            Self::Follows => "follows",
            Self::CopiedTo => "copied_to",
            Self::CopiedFrom => "copied_from",
        };
        f.write_str(name)
    }
}

/// A stored, canonically oriented relation between two issues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEdge {
    /// Edge identifier (creation order)
    pub id: RelationId,

    /// Source endpoint
    pub issue_from: IssueId,

    /// Target endpoint
    pub issue_to: IssueId,

    /// Canonical relation kind
    pub kind: RelationKind,

    /// Working-day delay, only for `Precedes`
    pub delay: Option<i32>,
}

impl RelationEdge {
    /// Returns whichever endpoint is not `issue`.
    pub fn other_issue(&self, issue: IssueId) -> IssueId {
        if self.issue_from == issue {
            self.issue_to
        } else {
            self.issue_from
        }
    }

    /// The kind as seen from `issue`: the stored kind from the source side,
    /// its reverse from the target side.
    pub fn kind_for(&self, issue: IssueId) -> RelationKind {
        if self.issue_from == issue {
            self.kind
        } else {
            self.kind.reverse()
        }
    }

    /// Returns `true` if `issue` is one of the endpoints.
    pub fn involves(&self, issue: IssueId) -> bool {
        self.issue_from == issue || self.issue_to == issue
    }
}

/// A relation request before canonicalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRelation {
    /// Requested source endpoint
    pub from: IssueId,

    /// Requested target endpoint
    pub to: IssueId,

    /// Requested kind, possibly a reverse kind
    pub kind: RelationKind,

    /// Requested delay (ignored unless the kind carries one)
    pub delay: Option<i32>,
}

impl NewRelation {
    /// Create a relation request
    pub fn new(from: IssueId, to: IssueId, kind: RelationKind) -> Self {
        Self {
            from,
            to,
            kind,
            delay: None,
        }
    }

    /// Set the delay for a precedes/follows request
    pub fn with_delay(mut self, delay: i32) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Rewrite the request into its stored orientation.
    ///
    /// Reverse kinds are swapped onto their canonical kind, `relates` is
    /// ordered by id, and the delay is defaulted to `0` for precedes and
    /// cleared for every other kind.
    pub fn canonicalize(self) -> Self {
        let (from, to, kind) = if self.kind.is_canonical() {
            (self.from, self.to, self.kind)
        } else {
            (self.to, self.from, self.kind.reverse())
        };
        let (from, to) = if kind == RelationKind::Relates && from > to {
            (to, from)
        } else {
            (from, to)
        };
        let delay = if kind == RelationKind::Precedes {
            Some(self.delay.unwrap_or(0))
        } else {
            None
        };
        Self {
            from,
            to,
            kind,
            delay,
        }
    }
}

/// Cross-project subtask policy.
///
/// Controls which projects an issue's parent may belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossProjectPolicy {
    /// Any project
    System,
    /// Any project sharing the same root project
    #[default]
    Tree,
    /// Ancestor or descendant projects
    Hierarchy,
    /// The parent's project must be the child's project or one of its ancestors
    Descendants,
    /// Same project only
    Disabled,
}

/// What happens to the children of a deleted issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Children become roots of their own trees
    PromoteChildren,
    /// The whole subtree is deleted
    DeleteSubtree,
}

/// Who is making a change.
///
/// Passed explicitly into every mutation so that emitted events can be
/// attributed without ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeContext {
    /// Acting user or system component
    pub actor: String,

    /// Optional free-form note attached to the change
    pub note: Option<String>,
}

impl ChangeContext {
    /// Context for a change made by `actor`
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            note: None,
        }
    }

    /// Context for derived changes made by the tracker itself
    pub fn system() -> Self {
        Self::new("system")
    }

    /// Attach a note
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}
