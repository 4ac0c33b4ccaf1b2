//! Read-only collaborator interfaces.
//!
//! The core never owns statuses, priorities or project settings. It reads
//! them through these traits, which [`crate::config::TrackerConfig`]
//! implements for file-based setups.

use crate::domain::{CrossProjectPolicy, PriorityId, ProjectId, StatusId};

/// Lookup of issue statuses
pub trait StatusCatalog: Send + Sync {
    /// Returns `true` if issues in this status count as closed.
    fn is_closed(&self, status: StatusId) -> bool;

    /// Done ratio implied by the status, when done ratio follows status.
    fn default_done_ratio(&self, status: StatusId) -> Option<u8>;
}

/// Totally ordered priority list
pub trait PriorityCatalog: Send + Sync {
    /// Rank of a priority; higher is more urgent. `None` for unknown ids.
    fn position(&self, priority: PriorityId) -> Option<usize>;

    /// Priority assigned when nothing else applies.
    fn default_priority(&self) -> Option<PriorityId>;
}

/// Project-level settings consulted by the guard and the propagators
pub trait ProjectPolicy: Send + Sync {
    /// Whether relations may link issues of different projects.
    fn cross_project_relations_allowed(&self) -> bool;

    /// Which projects a parent issue may belong to.
    fn cross_project_subtasks_policy(&self) -> CrossProjectPolicy;

    /// Parent of a project in the project tree.
    fn project_parent(&self, project: ProjectId) -> Option<ProjectId>;

    /// Parent start/due dates are computed from children.
    fn dates_derived(&self, project: ProjectId) -> bool;

    /// Parent priority is computed from children.
    fn priority_derived(&self, project: ProjectId) -> bool;

    /// Parent done ratio is computed from children.
    fn done_ratio_derived(&self, project: ProjectId) -> bool;

    /// Done ratio is taken from the status instead of being edited.
    fn done_ratio_uses_status(&self, project: ProjectId) -> bool;

    /// Closing an issue also closes the issues that duplicate it.
    fn close_duplicate_issues(&self) -> bool {
        true
    }
}
