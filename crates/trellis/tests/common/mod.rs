//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use std::sync::Once;
use trellis::config::TrackerConfig;
use trellis::domain::{IssueId, NewIssue, PriorityId, ProjectId, StatusId};
use trellis::storage::in_memory::InMemoryStore;
use trellis::Tracker;

/// Projects 1 <- 2, 3 as a separate root, and 4 whose parents keep their
/// own attributes.
pub const CONFIG: &str = r"
calendar:
  non-working-days: [Sat, Sun]
relations:
  cross-project: false
  close-duplicates: true
subtasks:
  cross-project: tree
projects:
  - id: 1
  - id: 2
    parent: 1
  - id: 3
  - id: 4
    settings:
      dates: independent
      priority: independent
      done-ratio: independent
statuses:
  - { id: 1, name: New }
  - { id: 2, name: In Progress, default-done-ratio: 50 }
  - { id: 5, name: Closed, closed: true, default-done-ratio: 100 }
priorities:
  - { id: 1, name: Low }
  - { id: 2, name: Normal, default: true }
  - { id: 3, name: High }
";

pub const NEW: StatusId = StatusId(1);
pub const CLOSED: StatusId = StatusId(5);
pub const LOW: PriorityId = PriorityId(1);
pub const NORMAL: PriorityId = PriorityId(2);
pub const HIGH: PriorityId = PriorityId(3);

static TRACING: Once = Once::new();

/// Route tracing output through the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config() -> TrackerConfig {
    TrackerConfig::from_yaml(CONFIG).expect("fixture config is valid")
}

/// Tracker over a fresh store, plus a second handle to that store.
pub fn tracker_with(config: TrackerConfig) -> (Tracker, InMemoryStore) {
    init_tracing();
    let store = InMemoryStore::new();
    let tracker =
        Tracker::from_config(Box::new(store.clone()), config).expect("fixture config is valid");
    (tracker, store)
}

pub fn tracker() -> (Tracker, InMemoryStore) {
    tracker_with(config())
}

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
}

/// A bare open issue in `project`.
pub fn issue(project: u64) -> NewIssue {
    NewIssue {
        project: ProjectId(project),
        status: NEW,
        priority: NORMAL,
        start_date: None,
        due_date: None,
        done_ratio: 0,
        estimated_hours: None,
        parent: None,
    }
}

/// A bare open issue in project 1 under `parent`.
pub fn subtask(parent: IssueId) -> NewIssue {
    NewIssue {
        parent: Some(parent),
        ..issue(1)
    }
}
