//! Database schema for jobs.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, ForeignKey, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Job, constraint and dependency specs
// =============================================================================

const JOB_SPEC_FK: ForeignKey = ForeignKey {
    foreign_table: "job_spec",
    foreign_column: "job_spec_id",
    cascade_on_delete: true,
};

const JOB_SPEC_TABLE_V1: Table = Table {
    name: "job_spec",
    columns: &[
        // Insertion order, used to rebuild per-queue FIFO order on startup.
        sqlite_column!("_id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_spec_id", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("factory_key", &SqlType::Text, non_null = true),
        sqlite_column!("queue_key", &SqlType::Text),
        sqlite_column!("create_time", &SqlType::Integer, non_null = true),
        sqlite_column!("next_run_attempt_time", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "run_attempt",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("lifespan", &SqlType::Integer, non_null = true),
        sqlite_column!("serialized_data", &SqlType::Text, non_null = true),
        sqlite_column!(
            "is_running",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_job_spec_queue", "queue_key")],
    unique_constraints: &[],
};

const CONSTRAINT_SPEC_TABLE_V1: Table = Table {
    name: "constraint_spec",
    columns: &[
        sqlite_column!("_id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "job_spec_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&JOB_SPEC_FK)
        ),
        sqlite_column!("factory_key", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_constraint_spec_job", "job_spec_id")],
    unique_constraints: &[&["job_spec_id", "factory_key"]],
};

const DEPENDENCY_SPEC_TABLE_V1: Table = Table {
    name: "dependency_spec",
    columns: &[
        sqlite_column!("_id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "job_spec_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&JOB_SPEC_FK)
        ),
        sqlite_column!("depends_on_job_spec_id", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_dependency_spec_job", "job_spec_id"),
        ("idx_dependency_spec_depends_on", "depends_on_job_spec_id"),
    ],
    unique_constraints: &[&["job_spec_id", "depends_on_job_spec_id"]],
};

// =============================================================================
// Version 2 - Engine metadata (job data schema version)
// =============================================================================

const ENGINE_META_TABLE_V2: Table = Table {
    name: "engine_meta",
    columns: &[
        sqlite_column!("key", &SqlType::Text, is_primary_key = true),
        sqlite_column!("value", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    ENGINE_META_TABLE_V2.create(conn)
}

pub const JOB_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            JOB_SPEC_TABLE_V1,
            CONSTRAINT_SPEC_TABLE_V1,
            DEPENDENCY_SPEC_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            JOB_SPEC_TABLE_V1,
            CONSTRAINT_SPEC_TABLE_V1,
            DEPENDENCY_SPEC_TABLE_V1,
            ENGINE_META_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_latest_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = JOB_STORE_VERSIONED_SCHEMAS.last().unwrap();
        schema.create(&conn).unwrap();
        schema.validate(&conn).unwrap();
    }

    #[test]
    fn test_constraint_rows_cascade_with_job() {
        let conn = Connection::open_in_memory().unwrap();
        JOB_STORE_VERSIONED_SCHEMAS.last().unwrap().create(&conn).unwrap();

        conn.execute(
            "INSERT INTO job_spec (job_spec_id, factory_key, create_time, next_run_attempt_time,
                max_attempts, lifespan, serialized_data) VALUES ('j1', 'f', 0, 0, 1, -1, '{}')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO constraint_spec (job_spec_id, factory_key) VALUES ('j1', 'network')",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM job_spec WHERE job_spec_id = 'j1'", [])
            .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM constraint_spec", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_duplicate_constraint_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        JOB_STORE_VERSIONED_SCHEMAS.last().unwrap().create(&conn).unwrap();
        conn.execute(
            "INSERT INTO job_spec (job_spec_id, factory_key, create_time, next_run_attempt_time,
                max_attempts, lifespan, serialized_data) VALUES ('j1', 'f', 0, 0, 1, -1, '{}')",
            [],
        )
        .unwrap();
        let insert = "INSERT INTO constraint_spec (job_spec_id, factory_key) VALUES ('j1', 'network')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
