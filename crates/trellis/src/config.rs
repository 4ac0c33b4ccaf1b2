//! Configuration management for trellis.
//!
//! A [`TrackerConfig`] is a YAML document carrying the working calendar, the
//! relation and subtask policies, per-project settings, and the status and
//! priority catalogs. It implements [`ProjectPolicy`], [`StatusCatalog`] and
//! [`PriorityCatalog`], so a loaded file can be handed straight to
//! [`crate::tracker::Tracker`].
//!
//! ```yaml
//! calendar:
//!   non-working-days: [Sat, Sun]
//! relations:
//!   cross-project: false
//!   close-duplicates: true
//! subtasks:
//!   cross-project: tree
//! project-defaults:
//!   dates: derived
//!   priority: derived
//!   done-ratio: derived
//!   done-ratio-source: field
//! projects:
//!   - id: 1
//!   - id: 2
//!     parent: 1
//! statuses:
//!   - { id: 1, name: New }
//!   - { id: 5, name: Closed, closed: true, default-done-ratio: 100 }
//! priorities:
//!   - { id: 1, name: Low }
//!   - { id: 2, name: Normal, default: true }
//!   - { id: 3, name: High }
//! ```

use crate::calendar::WorkingCalendar;
use crate::catalog::{PriorityCatalog, ProjectPolicy, StatusCatalog};
use crate::domain::{CrossProjectPolicy, PriorityId, ProjectId, StatusId};
use crate::error::{Error, Result};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

/// Whether a parent attribute is computed from its children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeMode {
    /// Computed from children and read-only on parents
    #[default]
    Derived,
    /// Edited on the parent like on any other issue
    Independent,
}

/// Where an issue's done ratio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneRatioSource {
    /// Edited on the issue
    #[default]
    Field,
    /// Taken from the status' default done ratio
    Status,
}

/// Working calendar section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CalendarConfig {
    /// Weekdays excluded from duration math
    pub non_working_days: Vec<Weekday>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            non_working_days: vec![Weekday::Sat, Weekday::Sun],
        }
    }
}

/// Relation policy section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelationConfig {
    /// Allow relations between issues of different projects
    #[serde(default)]
    pub cross_project: bool,

    /// Closing an issue closes its duplicates
    #[serde(default = "default_true")]
    pub close_duplicates: bool,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            cross_project: false,
            close_duplicates: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Subtask policy section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubtaskConfig {
    /// Which projects a parent issue may belong to
    #[serde(default)]
    pub cross_project: CrossProjectPolicy,
}

/// Per-project attribute settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectSettings {
    /// Parent start/due dates
    #[serde(default)]
    pub dates: AttributeMode,

    /// Parent priority
    #[serde(default)]
    pub priority: AttributeMode,

    /// Parent done ratio
    #[serde(default)]
    pub done_ratio: AttributeMode,

    /// Source of issue done ratios
    #[serde(default)]
    pub done_ratio_source: DoneRatioSource,
}

/// A project entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    /// Project identifier
    pub id: ProjectId,

    /// Parent project, if any
    #[serde(default)]
    pub parent: Option<ProjectId>,

    /// Overrides for `project-defaults`
    #[serde(default)]
    pub settings: Option<ProjectSettings>,
}

/// A status catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusConfig {
    /// Status identifier
    pub id: StatusId,

    /// Display name
    pub name: String,

    /// Issues in this status count as closed
    #[serde(default)]
    pub closed: bool,

    /// Done ratio applied when done ratio follows status
    #[serde(default)]
    pub default_done_ratio: Option<u8>,
}

/// A priority catalog entry. List order is rank order, lowest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PriorityConfig {
    /// Priority identifier
    pub id: PriorityId,

    /// Display name
    pub name: String,

    /// Priority used when nothing else applies
    #[serde(default)]
    pub default: bool,
}

/// Configuration file structure for trellis
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrackerConfig {
    /// Working calendar
    #[serde(default)]
    pub calendar: CalendarConfig,

    /// Relation policy
    #[serde(default)]
    pub relations: RelationConfig,

    /// Subtask policy
    #[serde(default)]
    pub subtasks: SubtaskConfig,

    /// Settings for projects without overrides
    #[serde(default)]
    pub project_defaults: ProjectSettings,

    /// Known projects
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,

    /// Status catalog
    #[serde(default)]
    pub statuses: Vec<StatusConfig>,

    /// Priority catalog, lowest first
    #[serde(default)]
    pub priorities: Vec<PriorityConfig>,
}

impl TrackerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_yaml(&content)
    }

    /// Save configuration to a file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::Config(format!("YAML error: {}", e)))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Check catalog and calendar consistency.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if ids repeat, a default done ratio exceeds
    /// 100, more than one priority is marked default, or the calendar has no
    /// working day.
    pub fn validate(&self) -> Result<()> {
        self.calendar()?;

        let mut seen = HashSet::new();
        for status in &self.statuses {
            if !seen.insert(status.id) {
                return Err(Error::Config(format!(
                    "Status id {} is defined twice",
                    status.id.0
                )));
            }
            if status.default_done_ratio.is_some_and(|ratio| ratio > 100) {
                return Err(Error::Config(format!(
                    "Status '{}' has a default done ratio above 100",
                    status.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for priority in &self.priorities {
            if !seen.insert(priority.id) {
                return Err(Error::Config(format!(
                    "Priority id {} is defined twice",
                    priority.id.0
                )));
            }
        }
        if self.priorities.iter().filter(|p| p.default).count() > 1 {
            return Err(Error::Config(
                "At most one priority can be the default".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            if !seen.insert(project.id) {
                return Err(Error::Config(format!("{} is defined twice", project.id)));
            }
        }
        Ok(())
    }

    /// Working calendar described by this configuration
    pub fn calendar(&self) -> Result<WorkingCalendar> {
        WorkingCalendar::new(self.calendar.non_working_days.iter().copied())
    }

    /// Effective settings of a project
    pub fn settings(&self, project: ProjectId) -> ProjectSettings {
        self.projects
            .iter()
            .find(|p| p.id == project)
            .and_then(|p| p.settings)
            .unwrap_or(self.project_defaults)
    }

    fn status(&self, status: StatusId) -> Option<&StatusConfig> {
        self.statuses.iter().find(|s| s.id == status)
    }
}

impl StatusCatalog for TrackerConfig {
    fn is_closed(&self, status: StatusId) -> bool {
        self.status(status).is_some_and(|s| s.closed)
    }

    fn default_done_ratio(&self, status: StatusId) -> Option<u8> {
        self.status(status).and_then(|s| s.default_done_ratio)
    }
}

impl PriorityCatalog for TrackerConfig {
    fn position(&self, priority: PriorityId) -> Option<usize> {
        self.priorities.iter().position(|p| p.id == priority)
    }

    fn default_priority(&self) -> Option<PriorityId> {
        self.priorities.iter().find(|p| p.default).map(|p| p.id)
    }
}

impl ProjectPolicy for TrackerConfig {
    fn cross_project_relations_allowed(&self) -> bool {
        self.relations.cross_project
    }

    fn cross_project_subtasks_policy(&self) -> CrossProjectPolicy {
        self.subtasks.cross_project
    }

    fn project_parent(&self, project: ProjectId) -> Option<ProjectId> {
        self.projects
            .iter()
            .find(|p| p.id == project)
            .and_then(|p| p.parent)
    }

    fn dates_derived(&self, project: ProjectId) -> bool {
        self.settings(project).dates == AttributeMode::Derived
    }

    fn priority_derived(&self, project: ProjectId) -> bool {
        self.settings(project).priority == AttributeMode::Derived
    }

    fn done_ratio_derived(&self, project: ProjectId) -> bool {
        self.settings(project).done_ratio == AttributeMode::Derived
    }

    fn done_ratio_uses_status(&self, project: ProjectId) -> bool {
        self.settings(project).done_ratio_source == DoneRatioSource::Status
    }

    fn close_duplicate_issues(&self) -> bool {
        self.relations.close_duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r"
calendar:
  non-working-days: [Fri, Sat, Sun]
relations:
  cross-project: true
subtasks:
  cross-project: hierarchy
project-defaults:
  dates: independent
projects:
  - id: 1
  - id: 2
    parent: 1
    settings:
      dates: derived
      done-ratio-source: status
statuses:
  - { id: 1, name: New }
  - { id: 5, name: Closed, closed: true, default-done-ratio: 100 }
priorities:
  - { id: 1, name: Low }
  - { id: 2, name: Normal, default: true }
  - { id: 3, name: High }
";

    #[test]
    fn test_parse_sample() {
        let config = TrackerConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.calendar().unwrap().working_days_per_week(), 4);
        assert!(config.cross_project_relations_allowed());
        assert!(config.close_duplicate_issues());
        assert_eq!(
            config.cross_project_subtasks_policy(),
            CrossProjectPolicy::Hierarchy
        );
        assert!(!config.dates_derived(ProjectId(1)));
        assert!(config.dates_derived(ProjectId(2)));
        assert!(config.priority_derived(ProjectId(2)));
        assert!(config.done_ratio_uses_status(ProjectId(2)));
        assert_eq!(config.project_parent(ProjectId(2)), Some(ProjectId(1)));
        assert!(config.is_closed(StatusId(5)));
        assert!(!config.is_closed(StatusId(1)));
        assert_eq!(config.default_done_ratio(StatusId(5)), Some(100));
        assert_eq!(config.default_priority(), Some(PriorityId(2)));
        assert!(config.position(PriorityId(3)) > config.position(PriorityId(1)));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TrackerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.calendar().unwrap(), WorkingCalendar::default());
        assert!(!config.cross_project_relations_allowed());
        assert_eq!(config.cross_project_subtasks_policy(), CrossProjectPolicy::Tree);
        assert!(config.dates_derived(ProjectId(42)));
        assert_eq!(config.default_priority(), None);
    }

    #[test]
    fn test_rejects_two_default_priorities() {
        let yaml = r"
priorities:
  - { id: 1, name: Low, default: true }
  - { id: 2, name: High, default: true }
";
        assert!(matches!(
            TrackerConfig::from_yaml(yaml),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_done_ratio_above_hundred() {
        let yaml = "statuses:\n  - { id: 1, name: Odd, default-done-ratio: 150 }\n";
        assert!(matches!(
            TrackerConfig::from_yaml(yaml),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trellis.yaml");
        let config = TrackerConfig::from_yaml(SAMPLE).unwrap();

        config.save(&path).await.unwrap();
        let loaded = TrackerConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }
}
