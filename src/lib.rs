//! Pezzottify Job Engine Library
//!
//! Durable background job execution: jobs are persisted to SQLite, gated by
//! constraints and dependencies, serialized per queue, retried with backoff
//! and survive process restarts.

pub mod config;
pub mod constraint;
pub mod controller;
pub mod engine;
pub mod job;
pub mod job_data;
pub mod legacy;
pub mod migration;
pub mod spec;
pub mod sqlite_persistence;
pub mod store;
pub mod tracker;
pub mod trigger;
pub mod worker;

// Re-export commonly used types for convenience
pub use constraint::{Constraint, ConstraintFlag, ConstraintObserver, ConstraintRegistry};
pub use controller::{BackoffPolicy, ControllerError, Submission};
pub use engine::{JobChain, JobEngine, JobEngineBuilder};
pub use job::{Job, JobContext, JobFactory, JobParameters, JobRegistry, JobResult};
pub use job_data::{JobData, JobDataError};
pub use store::{JobStore, SqliteJobStore};
pub use tracker::{JobHandle, JobState};
