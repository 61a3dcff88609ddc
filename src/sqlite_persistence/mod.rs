//! Declarative SQLite table layouts with versioned migrations.

mod versioned_schema;

pub use versioned_schema::{
    open_versioned, read_layout_version, Column, ForeignKey, SqlType, Table, VersionedSchema,
    BASE_DB_VERSION,
};
