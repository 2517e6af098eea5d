//! rollcall-store: durable attendance storage on SQLite.
//!
//! Holds enrollments, one state row per user, the append-only record table
//! and the audit log. Record rows are protected by triggers that abort any
//! UPDATE or DELETE.

pub mod migrations;
mod rows;
pub mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),

    #[error("database schema version {db_version} is newer than supported version {latest}")]
    UnsupportedSchemaVersion { db_version: u32, latest: u32 },
}
