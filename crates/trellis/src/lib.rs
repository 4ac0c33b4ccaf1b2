//! Trellis - issue hierarchy, dependency graph and schedule propagation.
//!
//! This crate keeps issue trees as nested sets, stores typed relations
//! between issues, and propagates date, priority and done ratio changes
//! through `precedes` chains and parent aggregation. Persistence sits
//! behind the [`storage::IssueStore`] trait.

#![forbid(unsafe_code)]

// Core types
pub mod domain;
pub mod error;

// Structures over the loaded working set
pub mod calendar;
pub mod graph;
pub mod hierarchy;
pub mod model;

// Rules
pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod guard;
pub mod schedule;

// Persistence and the transactional entry point
pub mod events;
pub mod storage;
pub mod tracker;

pub use error::{Error, Result, StructuralError};
pub use tracker::{PropagationFailure, PropagationReport, Tracker};
