//! One-time import of work items written by the previous scheduler.
//!
//! The previous generation kept everything in a single SQLite table:
//!
//! ```text
//! legacy_jobs(
//!     id            INTEGER PRIMARY KEY,   -- insertion order
//!     item_type     TEXT NOT NULL,         -- mapped to a factory key
//!     queue_key     TEXT,
//!     payload       TEXT NOT NULL,         -- JSON array of {"key", "tag", "value"}
//!     requirements  TEXT,                  -- comma separated requirement names
//!     run_attempt   INTEGER NOT NULL,
//!     max_attempts  INTEGER NOT NULL,      -- 0 or negative: unlimited
//!     created_at    INTEGER NOT NULL       -- milliseconds since epoch
//! )
//! ```
//!
//! Items are inserted one by one through [`JobStore::insert_jobs`] under the
//! id `legacy-<id>`, so an import interrupted halfway can simply run again.
//! The legacy file and its SQLite side files are deleted once every item has
//! been handled.

use crate::job_data::{DataValue, JobData};
use crate::spec::{ConstraintSpec, FullSpec, JobSpec, Lifespan, MaxAttempts};
use crate::store::JobStore;
use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Maps legacy names onto the current engine's keys.
#[derive(Debug, Clone, Default)]
pub struct LegacyTypeMap {
    job_types: HashMap<String, String>,
    requirements: HashMap<String, String>,
}

impl LegacyTypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_type(mut self, legacy_type: impl Into<String>, factory_key: impl Into<String>) -> Self {
        self.job_types.insert(legacy_type.into(), factory_key.into());
        self
    }

    pub fn requirement(
        mut self,
        legacy_requirement: impl Into<String>,
        constraint_key: impl Into<String>,
    ) -> Self {
        self.requirements
            .insert(legacy_requirement.into(), constraint_key.into());
        self
    }

    pub fn from_maps(
        job_types: HashMap<String, String>,
        requirements: HashMap<String, String>,
    ) -> Self {
        Self {
            job_types,
            requirements,
        }
    }

    fn factory_key(&self, legacy_type: &str) -> Option<&str> {
        self.job_types.get(legacy_type).map(String::as_str)
    }

    fn constraint_key(&self, requirement: &str) -> Option<&str> {
        self.requirements.get(requirement).map(String::as_str)
    }
}

/// Counters describing what an import did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyImportReport {
    pub imported: usize,
    pub already_present: usize,
    pub dropped_jobs: usize,
    pub skipped_values: usize,
    pub skipped_requirements: usize,
}

#[derive(Debug, Deserialize)]
struct LegacyValue {
    key: String,
    tag: String,
    value: serde_json::Value,
}

struct LegacyRow {
    id: i64,
    item_type: String,
    queue_key: Option<String>,
    payload: String,
    requirements: Option<String>,
    run_attempt: i64,
    max_attempts: i64,
    created_at: i64,
}

pub struct LegacyJobImporter {
    path: PathBuf,
    type_map: LegacyTypeMap,
}

impl LegacyJobImporter {
    pub fn new<P: AsRef<Path>>(path: P, type_map: LegacyTypeMap) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            type_map,
        }
    }

    /// Imports every legacy item into `store`, then deletes the legacy database.
    ///
    /// Returns an empty report when there is no legacy database. If inserting
    /// an item fails the legacy database is kept and the error returned.
    pub fn import_into(&self, store: &dyn JobStore) -> Result<LegacyImportReport> {
        let mut report = LegacyImportReport::default();
        if !self.path.exists() {
            debug!("No legacy job database at {:?}", self.path);
            return Ok(report);
        }

        info!("Importing legacy jobs from {:?}", self.path);
        let rows = self.read_rows()?;

        for row in rows {
            let job_id = format!("legacy-{}", row.id);
            if store.get_job_spec(&job_id)?.is_some() {
                report.already_present += 1;
                continue;
            }
            let Some(spec) = self.convert(&job_id, row, &mut report) else {
                report.dropped_jobs += 1;
                continue;
            };
            store
                .insert_jobs(std::slice::from_ref(&spec))
                .with_context(|| format!("Failed to import legacy job {}", job_id))?;
            report.imported += 1;
        }

        delete_database_files(&self.path)?;
        info!(
            "Legacy import done: {} imported, {} dropped, {} values skipped",
            report.imported, report.dropped_jobs, report.skipped_values
        );
        Ok(report)
    }

    fn read_rows(&self) -> Result<Vec<LegacyRow>> {
        let conn = Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open legacy database {:?}", self.path))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, item_type, queue_key, payload, requirements, run_attempt, max_attempts,
                    created_at
                 FROM legacy_jobs ORDER BY id ASC",
            )
            .context("Legacy database has no readable legacy_jobs table")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LegacyRow {
                    id: row.get("id")?,
                    item_type: row.get("item_type")?,
                    queue_key: row.get("queue_key")?,
                    payload: row.get("payload")?,
                    requirements: row.get("requirements")?,
                    run_attempt: row.get("run_attempt")?,
                    max_attempts: row.get("max_attempts")?,
                    created_at: row.get("created_at")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn convert(
        &self,
        job_id: &str,
        row: LegacyRow,
        report: &mut LegacyImportReport,
    ) -> Option<FullSpec> {
        let Some(factory_key) = self.type_map.factory_key(&row.item_type) else {
            warn!(
                "Dropping legacy job {}: unknown type '{}'",
                row.id, row.item_type
            );
            return None;
        };

        let values: Vec<LegacyValue> = match serde_json::from_str(&row.payload) {
            Ok(values) => values,
            Err(e) => {
                warn!("Dropping legacy job {}: unreadable payload: {}", row.id, e);
                return None;
            }
        };

        let mut data = JobData::builder();
        for value in values {
            match decode_value(&value) {
                Some(decoded) => data = data.put(value.key, decoded),
                None => {
                    warn!(
                        "Skipping value '{}' of legacy job {}: unsupported tag '{}' or bad value",
                        value.key, row.id, value.tag
                    );
                    report.skipped_values += 1;
                }
            }
        }
        let serialized_data = match data.build().serialize() {
            Ok(s) => s,
            Err(e) => {
                warn!("Dropping legacy job {}: {}", row.id, e);
                return None;
            }
        };

        let mut constraints: Vec<ConstraintSpec> = Vec::new();
        for requirement in row
            .requirements
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
        {
            match self.type_map.constraint_key(requirement) {
                Some(key) if !constraints.iter().any(|c| c.factory_key == key) => {
                    constraints.push(ConstraintSpec {
                        job_id: job_id.to_string(),
                        factory_key: key.to_string(),
                    })
                }
                Some(_) => {}
                None => {
                    warn!(
                        "Ignoring unknown requirement '{}' of legacy job {}",
                        requirement, row.id
                    );
                    report.skipped_requirements += 1;
                }
            }
        }

        let max_attempts = if row.max_attempts <= 0 {
            MaxAttempts::Unlimited
        } else {
            MaxAttempts::from_db_value(row.max_attempts)
        };
        let mut run_attempt = row.run_attempt.clamp(0, u32::MAX as i64) as u32;
        if let MaxAttempts::Limited(max) = max_attempts {
            if run_attempt >= max {
                warn!(
                    "Legacy job {} already used {} of {} attempts, keeping one last attempt",
                    row.id, run_attempt, max
                );
                run_attempt = max.saturating_sub(1);
            }
        }

        Some(FullSpec {
            job: JobSpec {
                id: job_id.to_string(),
                factory_key: factory_key.to_string(),
                queue_key: row.queue_key,
                create_time: row.created_at,
                next_run_attempt_time: row.created_at,
                run_attempt,
                max_attempts,
                lifespan: Lifespan::Immortal,
                serialized_data,
                is_running: false,
                is_memory_only: false,
            },
            constraints,
            dependencies: Vec::new(),
        })
    }
}

/// Enumerated tag switch over the supported legacy value types.
fn decode_value(value: &LegacyValue) -> Option<DataValue> {
    use serde_json::Value;

    fn array<T>(value: &Value, item: impl Fn(&Value) -> Option<T>) -> Option<Vec<T>> {
        value.as_array()?.iter().map(item).collect()
    }
    fn int(value: &Value) -> Option<i32> {
        value.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    let v = &value.value;
    match value.tag.as_str() {
        "string" => v.as_str().map(|s| DataValue::String(s.to_string())),
        "int" => int(v).map(DataValue::Int),
        "long" => v.as_i64().map(DataValue::Long),
        "float" => v.as_f64().map(|f| DataValue::Float(f as f32)),
        "double" => v.as_f64().map(DataValue::Double),
        "boolean" => v.as_bool().map(DataValue::Boolean),
        "string_array" => {
            array(v, |i| i.as_str().map(str::to_string)).map(DataValue::StringArray)
        }
        "int_array" => array(v, int).map(DataValue::IntArray),
        "long_array" => array(v, Value::as_i64).map(DataValue::LongArray),
        "float_array" => {
            array(v, |i| i.as_f64().map(|f| f as f32)).map(DataValue::FloatArray)
        }
        "double_array" => array(v, Value::as_f64).map(DataValue::DoubleArray),
        "boolean_array" => array(v, Value::as_bool).map(DataValue::BooleanArray),
        _ => None,
    }
}

fn delete_database_files(path: &Path) -> Result<()> {
    std::fs::remove_file(path)
        .with_context(|| format!("Failed to delete legacy database {:?}", path))?;
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let side = PathBuf::from(side);
        if side.exists() {
            std::fs::remove_file(&side)
                .with_context(|| format!("Failed to delete {:?}", side))?;
        }
    }
    info!("Deleted legacy job database {:?}", path);
    Ok(())
}
