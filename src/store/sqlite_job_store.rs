//! SQLite-backed job storage.

use super::schema::JOB_STORE_VERSIONED_SCHEMAS;
use super::{JobDataUpdate, JobStore};
use crate::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec, Lifespan, MaxAttempts};
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA_VERSION_KEY: &str = "job_data_schema_version";

const JOB_SPEC_COLUMNS: &str = "job_spec_id, factory_key, queue_key, create_time, \
    next_run_attempt_time, run_attempt, max_attempts, lifespan, serialized_data, is_running";

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let mut conn = Connection::open(path)
            .with_context(|| format!("Failed to open job database at {:?}", path))?;
        open_versioned(&mut conn, JOB_STORE_VERSIONED_SCHEMAS, "job")?;
        info!("Opened job database at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store backed by a private in-memory database. Nothing survives a drop.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        open_versioned(&mut conn, JOB_STORE_VERSIONED_SCHEMAS, "job")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Job database connection lock poisoned"))
    }

    fn row_to_job_spec(row: &rusqlite::Row) -> rusqlite::Result<JobSpec> {
        let run_attempt: i64 = row.get("run_attempt")?;
        Ok(JobSpec {
            id: row.get("job_spec_id")?,
            factory_key: row.get("factory_key")?,
            queue_key: row.get("queue_key")?,
            create_time: row.get("create_time")?,
            next_run_attempt_time: row.get("next_run_attempt_time")?,
            run_attempt: run_attempt.clamp(0, u32::MAX as i64) as u32,
            max_attempts: MaxAttempts::from_db_value(row.get("max_attempts")?),
            lifespan: Lifespan::from_db_value(row.get("lifespan")?),
            serialized_data: row.get("serialized_data")?,
            is_running: row.get::<_, i64>("is_running")? != 0,
            is_memory_only: false,
        })
    }

    fn row_to_constraint_spec(row: &rusqlite::Row) -> rusqlite::Result<ConstraintSpec> {
        Ok(ConstraintSpec {
            job_id: row.get("job_spec_id")?,
            factory_key: row.get("factory_key")?,
        })
    }

    fn row_to_dependency_spec(row: &rusqlite::Row) -> rusqlite::Result<DependencySpec> {
        Ok(DependencySpec {
            job_id: row.get("job_spec_id")?,
            depends_on_job_id: row.get("depends_on_job_spec_id")?,
        })
    }

    fn insert_full_spec(conn: &Connection, spec: &FullSpec) -> Result<()> {
        let job = &spec.job;
        conn.execute(
            &format!(
                "INSERT INTO job_spec ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                JOB_SPEC_COLUMNS
            ),
            params![
                job.id,
                job.factory_key,
                job.queue_key,
                job.create_time,
                job.next_run_attempt_time,
                job.run_attempt as i64,
                job.max_attempts.as_db_value(),
                job.lifespan.as_db_value(),
                job.serialized_data,
                job.is_running as i64,
            ],
        )
        .with_context(|| format!("Failed to insert job {}", job.id))?;

        for constraint in &spec.constraints {
            conn.execute(
                "INSERT INTO constraint_spec (job_spec_id, factory_key) VALUES (?1, ?2)",
                params![constraint.job_id, constraint.factory_key],
            )?;
        }
        for dependency in &spec.dependencies {
            conn.execute(
                "INSERT INTO dependency_spec (job_spec_id, depends_on_job_spec_id) VALUES (?1, ?2)",
                params![dependency.job_id, dependency.depends_on_job_id],
            )?;
        }
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    fn insert_jobs(&self, specs: &[FullSpec]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for spec in specs {
            Self::insert_full_spec(&tx, spec)?;
        }
        tx.commit()?;
        debug!("Inserted {} job(s)", specs.len());
        Ok(())
    }

    fn get_job_spec(&self, id: &str) -> Result<Option<JobSpec>> {
        let conn = self.lock()?;
        let spec = conn
            .query_row(
                &format!("SELECT {} FROM job_spec WHERE job_spec_id = ?1", JOB_SPEC_COLUMNS),
                params![id],
                Self::row_to_job_spec,
            )
            .optional()?;
        Ok(spec)
    }

    fn get_all_job_specs(&self) -> Result<Vec<JobSpec>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_spec ORDER BY _id ASC",
            JOB_SPEC_COLUMNS
        ))?;
        let specs = stmt
            .query_map([], Self::row_to_job_spec)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(specs)
    }

    fn get_constraints_for_job(&self, id: &str) -> Result<Vec<ConstraintSpec>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT job_spec_id, factory_key FROM constraint_spec WHERE job_spec_id = ?1 ORDER BY _id",
        )?;
        let specs = stmt
            .query_map(params![id], Self::row_to_constraint_spec)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(specs)
    }

    fn get_dependencies_for_job(&self, id: &str) -> Result<Vec<DependencySpec>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT job_spec_id, depends_on_job_spec_id FROM dependency_spec
             WHERE job_spec_id = ?1 ORDER BY _id",
        )?;
        let specs = stmt
            .query_map(params![id], Self::row_to_dependency_spec)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(specs)
    }

    fn get_all_constraint_specs(&self) -> Result<Vec<ConstraintSpec>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT job_spec_id, factory_key FROM constraint_spec ORDER BY _id")?;
        let specs = stmt
            .query_map([], Self::row_to_constraint_spec)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(specs)
    }

    fn get_all_dependency_specs(&self) -> Result<Vec<DependencySpec>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT job_spec_id, depends_on_job_spec_id FROM dependency_spec ORDER BY _id",
        )?;
        let specs = stmt
            .query_map([], Self::row_to_dependency_spec)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(specs)
    }

    fn mark_job_running(&self, id: &str, is_running: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE job_spec SET is_running = ?1 WHERE job_spec_id = ?2",
            params![is_running as i64, id],
        )
        .with_context(|| format!("Failed to update running flag of job {}", id))?;
        Ok(())
    }

    fn update_job_after_retry(
        &self,
        id: &str,
        is_running: bool,
        run_attempt: u32,
        next_run_attempt_time: i64,
        serialized_data: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE job_spec SET is_running = ?1, run_attempt = ?2, next_run_attempt_time = ?3,
                serialized_data = ?4
             WHERE job_spec_id = ?5",
            params![
                is_running as i64,
                run_attempt as i64,
                next_run_attempt_time,
                serialized_data,
                id
            ],
        )
        .with_context(|| format!("Failed to update job {} after retry", id))?;
        Ok(())
    }

    fn update_all_jobs_to_not_running(&self) -> Result<usize> {
        let conn = self.lock()?;
        let changed = conn.execute("UPDATE job_spec SET is_running = 0 WHERE is_running != 0", [])?;
        Ok(changed)
    }

    fn delete_jobs(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "DELETE FROM dependency_spec WHERE depends_on_job_spec_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM job_spec WHERE job_spec_id = ?1", params![id])?;
        }
        tx.commit()?;
        debug!("Deleted {} job(s)", ids.len());
        Ok(())
    }

    fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM engine_meta WHERE key = ?1",
                params![SCHEMA_VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v.clamp(0, u32::MAX as i64) as u32))
    }

    fn set_schema_version(&self, version: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO engine_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEMA_VERSION_KEY, version as i64],
        )?;
        Ok(())
    }

    fn apply_job_data_migration(&self, updates: &[JobDataUpdate], version: u32) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for update in updates {
            tx.execute(
                "UPDATE job_spec SET factory_key = ?1, queue_key = ?2, serialized_data = ?3
                 WHERE job_spec_id = ?4",
                params![
                    update.factory_key,
                    update.queue_key,
                    update.serialized_data,
                    update.job_id
                ],
            )
            .with_context(|| format!("Failed to migrate data of job {}", update.job_id))?;
        }
        tx.execute(
            "INSERT INTO engine_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SCHEMA_VERSION_KEY, version as i64],
        )?;
        tx.commit()?;
        Ok(())
    }
}
