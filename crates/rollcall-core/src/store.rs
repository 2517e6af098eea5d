//! Persistence seam for the decision engine.
//!
//! The engine only talks to an [`AttendanceStore`]. `rollcall-store` provides
//! the SQLite implementation; [`MemoryStore`] is used in tests and for
//! ephemeral deployments.

use crate::decision::Rejection;
use crate::types::{AttendanceRecord, AttendanceState, EnrolledUser, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("state version conflict for {user}: expected {expected}, found {found}")]
    Conflict { user: UserId, expected: u64, found: u64 },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `days` days ending at `end`.
    pub fn last_days(end: DateTime<Utc>, days: i64) -> Self {
        Self { start: end - chrono::Duration::days(days), end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// One decision, accepted or rejected, kept apart from attendance records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub claimed_user_id: UserId,
    pub accepted: bool,
    pub reasons: Vec<Rejection>,
    pub match_score: Option<f32>,
    /// Identity the probe actually matched when it differs from the claim.
    pub matched_user_id: Option<UserId>,
    pub record_id: Option<Uuid>,
    pub client_timestamp: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn load_enrollments(&self) -> Result<Vec<EnrolledUser>, StoreError>;

    async fn save_enrollment(&self, user: &EnrolledUser) -> Result<(), StoreError>;

    async fn load_state(&self, user: &UserId) -> Result<Option<AttendanceState>, StoreError>;

    /// Append `record` and store `state` in one transaction.
    ///
    /// Fails with [`StoreError::Conflict`] unless the stored state version is
    /// exactly `state.version - 1` (zero meaning "no row yet").
    async fn commit_transition(
        &self,
        record: &AttendanceRecord,
        state: &AttendanceState,
    ) -> Result<(), StoreError>;

    /// Records of `user` inside `range`, oldest first.
    async fn records(&self, user: &UserId, range: &TimeRange) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Most recent record of `user` strictly before `at`.
    async fn last_record_before(
        &self,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

/// Run a store call with a deadline. Elapsed deadlines surface as
/// [`StoreError::Timeout`], which callers treat as retryable.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[derive(Default)]
struct MemoryInner {
    enrollments: BTreeMap<UserId, EnrolledUser>,
    states: HashMap<UserId, AttendanceState>,
    records: Vec<AttendanceRecord>,
    audit: Vec<AuditEntry>,
}

/// In-process store. Every operation completes under one short lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All records in insertion order.
    pub fn all_records(&self) -> Vec<AttendanceRecord> {
        self.lock().records.clone()
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.lock().audit.clone()
    }

    /// Append a record without touching state. Used to seed history.
    pub fn insert_record(&self, record: AttendanceRecord) {
        self.lock().records.push(record);
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn load_enrollments(&self) -> Result<Vec<EnrolledUser>, StoreError> {
        Ok(self.lock().enrollments.values().cloned().collect())
    }

    async fn save_enrollment(&self, user: &EnrolledUser) -> Result<(), StoreError> {
        self.lock().enrollments.insert(user.user_id.clone(), user.clone());
        Ok(())
    }

    async fn load_state(&self, user: &UserId) -> Result<Option<AttendanceState>, StoreError> {
        Ok(self.lock().states.get(user).cloned())
    }

    async fn commit_transition(
        &self,
        record: &AttendanceRecord,
        state: &AttendanceState,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let found = inner.states.get(&state.user_id).map(|s| s.version).unwrap_or(0);
        let expected = state.version.saturating_sub(1);
        if found != expected {
            return Err(StoreError::Conflict {
                user: state.user_id.clone(),
                expected,
                found,
            });
        }
        inner.states.insert(state.user_id.clone(), state.clone());
        inner.records.push(record.clone());
        Ok(())
    }

    async fn records(&self, user: &UserId, range: &TimeRange) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut out: Vec<AttendanceRecord> = self
            .lock()
            .records
            .iter()
            .filter(|r| &r.user_id == user && range.contains(r.timestamp))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    async fn last_record_before(
        &self,
        user: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(self
            .lock()
            .records
            .iter()
            .filter(|r| &r.user_id == user && r.timestamp < at)
            .max_by_key(|r| r.timestamp)
            .cloned())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.lock().audit.push(entry.clone());
        Ok(())
    }
}
