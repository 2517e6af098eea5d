//! SQLite-backed [`AttendanceStore`].
//!
//! All statements run on the tokio-rusqlite connection thread. A transition
//! appends its record and upserts the state row in one transaction guarded by
//! a version check, so two writers that read the same state cannot both
//! commit.

use crate::migrations::{self, MigrationOutcome};
use crate::rows::{
    to_millis, AuditRow, EnrollmentRow, RecordRow, StateRow, AUDIT_COLUMNS, RECORD_COLUMNS,
};
use crate::OpenError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceRecord, AttendanceState, AttendanceStore, AuditEntry, EnrolledUser, StoreError, TimeRange,
    UserId,
};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn unavailable(err: tokio_rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OpenError> {
        let started = Instant::now();
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), "opening attendance database");
        let conn = Connection::open(&path).await?;
        Self::bootstrap(conn, started).await
    }

    pub async fn open_in_memory() -> Result<Self, OpenError> {
        let started = Instant::now();
        let conn = Connection::open_in_memory().await?;
        Self::bootstrap(conn, started).await
    }

    async fn bootstrap(conn: Connection, started: Instant) -> Result<Self, OpenError> {
        let outcome = conn
            .call(|conn| {
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                Ok(migrations::apply(conn)?)
            })
            .await?;

        match outcome {
            MigrationOutcome::TooNew { db_version, latest } => {
                tracing::error!(db_version, latest, "database schema is newer than this build");
                return Err(OpenError::UnsupportedSchemaVersion { db_version, latest });
            }
            MigrationOutcome::UpToDate(version) => {
                tracing::info!(
                    version,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "attendance database ready"
                );
            }
            MigrationOutcome::Applied { from, to } => {
                tracing::info!(
                    from,
                    to,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "attendance database migrated"
                );
            }
        }

        Ok(Self { conn })
    }

    /// Audit entries for `user` inside `range`, oldest first.
    pub async fn audit_entries(&self, user: &UserId, range: &TimeRange) -> Result<Vec<AuditEntry>, StoreError> {
        let user = user.as_str().to_owned();
        let (start, end) = (to_millis(range.start), to_millis(range.end));
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log \
                     WHERE claimed_user_id = ?1 AND at >= ?2 AND at < ?3 ORDER BY at ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map(params![user, start, end], AuditRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(unavailable)?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn load_enrollments(&self) -> Result<Vec<EnrolledUser>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, embedding, bound_device_id, site, geofence, allowed_networks, enrolled_at \
                     FROM enrollments ORDER BY user_id",
                )?;
                let rows = stmt
                    .query_map([], EnrollmentRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(unavailable)?;
        rows.into_iter().map(EnrollmentRow::into_user).collect()
    }

    async fn save_enrollment(&self, user: &EnrolledUser) -> Result<(), StoreError> {
        let row = EnrollmentRow::from_user(user)?;
        self.conn
            .call(move |conn| Ok(row.upsert(conn)?))
            .await
            .map_err(unavailable)?;
        tracing::debug!(user = %user.user_id, "enrollment persisted");
        Ok(())
    }

    async fn load_state(&self, user: &UserId) -> Result<Option<AttendanceState>, StoreError> {
        let key = user.as_str().to_owned();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT status, last_event_at, version FROM attendance_state WHERE user_id = ?1",
                        params![key],
                        |r| {
                            Ok(StateRow {
                                status: r.get(0)?,
                                last_event_at: r.get(1)?,
                                version: r.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(unavailable)?;
        row.map(|r| r.into_state(user.clone())).transpose()
    }

    async fn commit_transition(
        &self,
        record: &AttendanceRecord,
        state: &AttendanceState,
    ) -> Result<(), StoreError> {
        let row = RecordRow::from_record(record)?;
        let user = state.user_id.as_str().to_owned();
        let status = state.status.as_str();
        let last_event_at = state.last_event_at.map(to_millis);
        let version = i64::try_from(state.version)
            .map_err(|_| StoreError::Corrupt(format!("state version {} overflows", state.version)))?;
        let expected = state.version.saturating_sub(1);
        let expected_row = version - 1;

        let found = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let stored: i64 = tx
                    .query_row(
                        "SELECT version FROM attendance_state WHERE user_id = ?1",
                        params![user],
                        |r| r.get(0),
                    )
                    .optional()?
                    .unwrap_or(0);
                if stored != expected_row {
                    return Ok(Some(stored));
                }
                row.insert(&tx)?;
                tx.execute(
                    "INSERT INTO attendance_state (user_id, status, last_event_at, version) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(user_id) DO UPDATE SET \
                         status = excluded.status, \
                         last_event_at = excluded.last_event_at, \
                         version = excluded.version",
                    params![user, status, last_event_at, version],
                )?;
                tx.commit()?;
                Ok(None)
            })
            .await
            .map_err(unavailable)?;

        match found {
            None => Ok(()),
            Some(stored) => Err(StoreError::Conflict {
                user: state.user_id.clone(),
                expected,
                found: u64::try_from(stored).unwrap_or_default(),
            }),
        }
    }

    async fn records(&self, user: &UserId, range: &TimeRange) -> Result<Vec<AttendanceRecord>, StoreError> {
        let user = user.as_str().to_owned();
        let (start, end) = (to_millis(range.start), to_millis(range.end));
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance_records \
                     WHERE user_id = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts ASC, rowid ASC"
                ))?;
                let rows = stmt
                    .query_map(params![user, start, end], RecordRow::read)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(unavailable)?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    async fn last_record_before(
        &self,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let user = user.as_str().to_owned();
        let before = to_millis(at);
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {RECORD_COLUMNS} FROM attendance_records \
                             WHERE user_id = ?1 AND ts < ?2 ORDER BY ts DESC, rowid DESC LIMIT 1"
                        ),
                        params![user, before],
                        RecordRow::read,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(unavailable)?;
        row.map(RecordRow::into_record).transpose()
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let row = AuditRow::from_entry(entry)?;
        self.conn
            .call(move |conn| Ok(row.insert(conn)?))
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
