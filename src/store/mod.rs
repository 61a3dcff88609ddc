mod schema;
mod sqlite_job_store;

pub use schema::JOB_STORE_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use crate::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
use anyhow::Result;

/// New payload for one job, produced by a job data migration step.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDataUpdate {
    pub job_id: String,
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub serialized_data: String,
}

/// Durable storage for outstanding jobs and their edges.
///
/// Every write is atomic. Edges belonging to a job disappear with it.
pub trait JobStore: Send + Sync {
    /// Inserts jobs together with their constraint and dependency rows, all or nothing.
    fn insert_jobs(&self, specs: &[FullSpec]) -> Result<()>;

    fn get_job_spec(&self, id: &str) -> Result<Option<JobSpec>>;

    /// All job specs, in insertion order.
    fn get_all_job_specs(&self) -> Result<Vec<JobSpec>>;

    fn get_constraints_for_job(&self, id: &str) -> Result<Vec<ConstraintSpec>>;
    fn get_dependencies_for_job(&self, id: &str) -> Result<Vec<DependencySpec>>;
    fn get_all_constraint_specs(&self) -> Result<Vec<ConstraintSpec>>;
    fn get_all_dependency_specs(&self) -> Result<Vec<DependencySpec>>;

    // State transitions
    fn mark_job_running(&self, id: &str, is_running: bool) -> Result<()>;
    fn update_job_after_retry(
        &self,
        id: &str,
        is_running: bool,
        run_attempt: u32,
        next_run_attempt_time: i64,
        serialized_data: &str,
    ) -> Result<()>;
    /// Clears `is_running` on every job. Returns how many rows changed.
    fn update_all_jobs_to_not_running(&self) -> Result<usize>;

    /// Removes the jobs, their own edges and every dependency row pointing at them.
    fn delete_jobs(&self, ids: &[String]) -> Result<()>;

    fn delete_job(&self, id: &str) -> Result<()> {
        self.delete_jobs(&[id.to_string()])
    }

    // Job data schema version
    /// Recorded job data schema version, `None` when never written.
    fn schema_version(&self) -> Result<Option<u32>>;
    fn set_schema_version(&self, version: u32) -> Result<()>;

    /// Rewrites job payloads and records the new schema version in one transaction.
    fn apply_job_data_migration(&self, updates: &[JobDataUpdate], version: u32) -> Result<()>;
}
