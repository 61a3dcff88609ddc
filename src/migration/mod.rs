//! Versioned job data migrations.
//!
//! Persisted payloads outlive the code that wrote them. Each [`JobMigration`]
//! upgrades every stored job by exactly one job data schema version; a
//! [`JobMigrator`] validates that the steps form an unbroken chain and applies
//! the ones the store has not seen yet.

use crate::job_data::JobData;
use crate::store::{JobDataUpdate, JobStore};
use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The part of a persisted job a migration may rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMigrationData {
    pub factory_key: String,
    pub queue_key: Option<String>,
    pub data: JobData,
}

/// One step of the chain, upgrading jobs from `end_version() - 1` to `end_version()`.
pub trait JobMigration: Send + Sync {
    fn end_version(&self) -> u32;

    /// Transforms one job. Jobs this step does not care about are returned unchanged.
    fn migrate(&self, job: JobMigrationData) -> JobMigrationData;
}

struct FnMigration<F> {
    end_version: u32,
    migrate: F,
}

impl<F> JobMigration for FnMigration<F>
where
    F: Fn(JobMigrationData) -> JobMigrationData + Send + Sync,
{
    fn end_version(&self) -> u32 {
        self.end_version
    }

    fn migrate(&self, job: JobMigrationData) -> JobMigrationData {
        (self.migrate)(job)
    }
}

/// Builds a migration step from a closure.
pub fn migration_step<F>(end_version: u32, migrate: F) -> Box<dyn JobMigration>
where
    F: Fn(JobMigrationData) -> JobMigrationData + Send + Sync + 'static,
{
    Box::new(FnMigration {
        end_version,
        migrate,
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MigrationChainError {
    #[error("No migration steps, but versions {start} and {end} differ")]
    EmptyChainRange { start: u32, end: u32 },

    #[error("First migration step targets version {actual}, expected {expected}")]
    WrongFirstStep { expected: u32, actual: u32 },

    #[error("Migration step to version {next} follows step to version {previous}")]
    VersionGap { previous: u32, next: u32 },

    #[error("Last migration step targets version {actual}, expected {expected}")]
    WrongLastStep { expected: u32, actual: u32 },
}

/// A validated chain of migrations from `start_version` to `end_version`.
pub struct JobMigrator {
    start_version: u32,
    end_version: u32,
    steps: Vec<Box<dyn JobMigration>>,
}

impl std::fmt::Debug for JobMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMigrator")
            .field("start_version", &self.start_version)
            .field("end_version", &self.end_version)
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl JobMigrator {
    pub fn new(
        start_version: u32,
        end_version: u32,
        steps: Vec<Box<dyn JobMigration>>,
    ) -> Result<Self, MigrationChainError> {
        let (first, last) = match (steps.first(), steps.last()) {
            (Some(first), Some(last)) => (first.end_version(), last.end_version()),
            _ if start_version == end_version => {
                return Ok(Self {
                    start_version,
                    end_version,
                    steps,
                })
            }
            _ => {
                return Err(MigrationChainError::EmptyChainRange {
                    start: start_version,
                    end: end_version,
                })
            }
        };

        let expected_first = start_version.saturating_add(1);
        if first != expected_first {
            return Err(MigrationChainError::WrongFirstStep {
                expected: expected_first,
                actual: first,
            });
        }
        for pair in steps.windows(2) {
            let previous = pair[0].end_version();
            let next = pair[1].end_version();
            if next != previous.saturating_add(1) {
                return Err(MigrationChainError::VersionGap { previous, next });
            }
        }
        if last != end_version {
            return Err(MigrationChainError::WrongLastStep {
                expected: end_version,
                actual: last,
            });
        }

        Ok(Self {
            start_version,
            end_version,
            steps,
        })
    }

    /// A chain with no steps, for hosts that never changed their payloads.
    pub fn empty(version: u32) -> Self {
        Self {
            start_version: version,
            end_version: version,
            steps: Vec::new(),
        }
    }

    pub fn start_version(&self) -> u32 {
        self.start_version
    }

    pub fn end_version(&self) -> u32 {
        self.end_version
    }

    /// Brings every stored job up to `end_version` and returns the version the
    /// store ends up at.
    ///
    /// A store without a recorded version is treated as being at
    /// `start_version`. Running it again at the same version applies nothing.
    pub fn migrate(&self, store: &dyn JobStore) -> Result<u32> {
        let recorded = store.schema_version()?;
        let current = recorded.unwrap_or(self.start_version);

        if current > self.end_version {
            warn!(
                "Job data schema version {} is newer than this build ({}), leaving it untouched",
                current, self.end_version
            );
            return Ok(current);
        }

        let pending: Vec<&dyn JobMigration> = self
            .steps
            .iter()
            .map(|step| step.as_ref())
            .filter(|step| step.end_version() > current)
            .collect();

        if pending.is_empty() {
            if recorded != Some(self.end_version) {
                store.set_schema_version(self.end_version)?;
            }
            debug!("Job data schema already at version {}", self.end_version);
            return Ok(self.end_version);
        }

        let specs = store
            .get_all_job_specs()
            .context("Failed to load jobs for migration")?;

        let mut jobs: Vec<(String, JobMigrationData)> = Vec::with_capacity(specs.len());
        for spec in specs {
            match JobData::deserialize(&spec.serialized_data) {
                Ok(data) => jobs.push((
                    spec.id,
                    JobMigrationData {
                        factory_key: spec.factory_key,
                        queue_key: spec.queue_key,
                        data,
                    },
                )),
                Err(e) => warn!(
                    "Job {} has undecodable data, leaving it out of the migration: {}",
                    spec.id, e
                ),
            }
        }

        for step in &pending {
            info!(
                "Migrating {} job(s) to job data schema version {}",
                jobs.len(),
                step.end_version()
            );
            jobs = jobs
                .into_iter()
                .map(|(id, job)| (id, step.migrate(job)))
                .collect();
        }

        let mut updates = Vec::with_capacity(jobs.len());
        for (id, job) in jobs {
            let serialized_data = job
                .data
                .serialize()
                .with_context(|| format!("Failed to encode migrated data of job {}", id))?;
            updates.push(JobDataUpdate {
                job_id: id,
                factory_key: job.factory_key,
                queue_key: job.queue_key,
                serialized_data,
            });
        }
        store.apply_job_data_migration(&updates, self.end_version)?;

        info!(
            "Job data schema migrated from version {} to {}",
            current, self.end_version
        );
        Ok(self.end_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{FullSpec, JobSpec, Lifespan, MaxAttempts};
    use crate::store::SqliteJobStore;
    use std::sync::{Arc, Mutex};

    fn recording_step(end_version: u32, log: Arc<Mutex<Vec<u32>>>) -> Box<dyn JobMigration> {
        let recorded = std::sync::atomic::AtomicBool::new(false);
        migration_step(end_version, move |job| {
            if !recorded.swap(true, std::sync::atomic::Ordering::SeqCst) {
                log.lock().unwrap().push(end_version);
            }
            job
        })
    }

    fn noop_step(end_version: u32) -> Box<dyn JobMigration> {
        migration_step(end_version, |job| job)
    }

    fn insert_job(store: &SqliteJobStore, id: &str, factory_key: &str, data: JobData) {
        store
            .insert_jobs(&[FullSpec {
                job: JobSpec {
                    id: id.to_string(),
                    factory_key: factory_key.to_string(),
                    queue_key: None,
                    create_time: 0,
                    next_run_attempt_time: 0,
                    run_attempt: 0,
                    max_attempts: MaxAttempts::Limited(1),
                    lifespan: Lifespan::Immortal,
                    serialized_data: data.serialize().unwrap(),
                    is_running: false,
                    is_memory_only: false,
                },
                constraints: vec![],
                dependencies: vec![],
            }])
            .unwrap();
    }

    #[test]
    fn test_valid_chain() {
        let migrator =
            JobMigrator::new(1, 3, vec![noop_step(2), noop_step(3)]).unwrap();
        assert_eq!(migrator.start_version(), 1);
        assert_eq!(migrator.end_version(), 3);
        assert!(JobMigrator::new(4, 4, vec![]).is_ok());
    }

    #[test]
    fn test_invalid_chains_fail_at_construction() {
        assert_eq!(
            JobMigrator::new(1, 3, vec![noop_step(3)]).unwrap_err(),
            MigrationChainError::WrongFirstStep {
                expected: 2,
                actual: 3
            }
        );
        assert_eq!(
            JobMigrator::new(1, 4, vec![noop_step(2), noop_step(4)]).unwrap_err(),
            MigrationChainError::VersionGap {
                previous: 2,
                next: 4
            }
        );
        assert_eq!(
            JobMigrator::new(1, 3, vec![noop_step(2), noop_step(2), noop_step(3)]).unwrap_err(),
            MigrationChainError::VersionGap {
                previous: 2,
                next: 2
            }
        );
        assert_eq!(
            JobMigrator::new(1, 4, vec![noop_step(2), noop_step(3)]).unwrap_err(),
            MigrationChainError::WrongLastStep {
                expected: 4,
                actual: 3
            }
        );
        assert_eq!(
            JobMigrator::new(1, 2, vec![]).unwrap_err(),
            MigrationChainError::EmptyChainRange { start: 1, end: 2 }
        );
    }

    #[test]
    fn test_applies_steps_in_order_then_nothing() {
        let store = SqliteJobStore::in_memory().unwrap();
        insert_job(&store, "a", "test", JobData::empty());
        store.set_schema_version(1).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let migrator = JobMigrator::new(
            1,
            3,
            vec![recording_step(2, log.clone()), recording_step(3, log.clone())],
        )
        .unwrap();

        assert_eq!(migrator.migrate(&store).unwrap(), 3);
        assert_eq!(*log.lock().unwrap(), vec![2, 3]);
        assert_eq!(store.schema_version().unwrap(), Some(3));

        let log_again = Arc::new(Mutex::new(Vec::new()));
        let migrator = JobMigrator::new(
            1,
            3,
            vec![
                recording_step(2, log_again.clone()),
                recording_step(3, log_again.clone()),
            ],
        )
        .unwrap();
        migrator.migrate(&store).unwrap();
        assert!(log_again.lock().unwrap().is_empty());
    }

    #[test]
    fn test_applies_only_suffix() {
        let store = SqliteJobStore::in_memory().unwrap();
        insert_job(&store, "a", "test", JobData::empty());
        store.set_schema_version(2).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let migrator = JobMigrator::new(
            1,
            3,
            vec![recording_step(2, log.clone()), recording_step(3, log.clone())],
        )
        .unwrap();
        migrator.migrate(&store).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_rewrites_payload_and_factory_key() {
        let store = SqliteJobStore::in_memory().unwrap();
        insert_job(
            &store,
            "a",
            "send_v1",
            JobData::builder().put_int("retries", 2).build(),
        );
        insert_job(&store, "b", "other", JobData::empty());

        let migrator = JobMigrator::new(
            0,
            1,
            vec![migration_step(1, |mut job| {
                if job.factory_key == "send_v1" {
                    let retries = job.data.get_int_or_default("retries", 0).unwrap_or(0);
                    job.factory_key = "send".to_string();
                    job.data = job
                        .data
                        .to_builder()
                        .remove("retries")
                        .put_long("retries", retries as i64)
                        .build();
                }
                job
            })],
        )
        .unwrap();
        migrator.migrate(&store).unwrap();

        let a = store.get_job_spec("a").unwrap().unwrap();
        assert_eq!(a.factory_key, "send");
        let data = JobData::deserialize(&a.serialized_data).unwrap();
        assert_eq!(data.get_long("retries").unwrap(), 2);
        assert_eq!(store.get_job_spec("b").unwrap().unwrap().factory_key, "other");
    }

    #[test]
    fn test_unrecorded_store_starts_at_start_version() {
        let store = SqliteJobStore::in_memory().unwrap();
        let migrator = JobMigrator::empty(5);
        assert_eq!(migrator.migrate(&store).unwrap(), 5);
        assert_eq!(store.schema_version().unwrap(), Some(5));
    }
}
