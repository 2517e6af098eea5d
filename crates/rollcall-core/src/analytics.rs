//! Analytics aggregator: turns the append-only record stream into worked
//! durations per day.
//!
//! Read-only and off the decision path. Records are paired CHECK_IN →
//! CHECK_OUT in timestamp order; a trailing CHECK_IN is an open interval.
//! History that breaks alternation is not fatal: the offending record is
//! skipped, flagged as an anomaly, and pairing resumes.

use crate::store::{bounded, AttendanceStore, StoreError, TimeRange};
use crate::types::{AttendanceRecord, AttendanceStatus, EventType, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayTotal {
    pub day: NaiveDate,
    pub total_seconds: i64,
    /// True if part of the total comes from a still-open interval.
    pub ongoing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// A CHECK_IN while already checked in. The later record is ignored.
    ConsecutiveCheckIn,
    /// A CHECK_OUT with no open CHECK_IN. The record is ignored.
    OrphanCheckOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub record_id: Uuid,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInterval {
    pub since: DateTime<Utc>,
    pub record_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub user_id: UserId,
    pub range: TimeRange,
    pub days: Vec<DayTotal>,
    pub total_seconds: i64,
    pub open_interval: Option<OpenInterval>,
    pub anomalies: Vec<Anomaly>,
    /// Status implied by the last valid transition in the history.
    pub current_status: AttendanceStatus,
}

/// Pair and sum the records of `user` over `range`.
///
/// `records` may include entries before the range (e.g. the CHECK_IN that
/// opened an interval ending inside it) and entries of other users, which
/// are ignored. Open intervals are counted up to `as_of`.
pub fn aggregate(
    user: &UserId,
    records: &[AttendanceRecord],
    range: &TimeRange,
    as_of: DateTime<Utc>,
) -> AnalyticsReport {
    let mut ordered: Vec<&AttendanceRecord> = records.iter().filter(|r| &r.user_id == user).collect();
    ordered.sort_by_key(|r| r.timestamp);

    let mut anomalies = Vec::new();
    let mut intervals: Vec<(DateTime<Utc>, DateTime<Utc>, bool)> = Vec::new();
    let mut pending: Option<&AttendanceRecord> = None;

    for record in ordered {
        let kind = match (record.event_type, pending) {
            (EventType::CheckIn, None) => {
                pending = Some(record);
                continue;
            }
            (EventType::CheckOut, Some(open)) => {
                intervals.push((open.timestamp, record.timestamp, false));
                pending = None;
                continue;
            }
            (EventType::CheckIn, Some(_)) => AnomalyKind::ConsecutiveCheckIn,
            (EventType::CheckOut, None) => AnomalyKind::OrphanCheckOut,
        };
        // Records before the range only seed pairing; they are never reported.
        if record.timestamp >= range.start {
            anomalies.push(Anomaly {
                kind,
                record_id: record.record_id,
                at: record.timestamp,
            });
        }
    }

    let open_interval = pending.map(|open| {
        intervals.push((open.timestamp, as_of, true));
        OpenInterval {
            since: open.timestamp,
            record_id: open.record_id,
        }
    });

    if !anomalies.is_empty() {
        tracing::warn!(user = %user, count = anomalies.len(), "attendance history has gaps");
    }

    let mut per_day: BTreeMap<NaiveDate, (i64, bool)> = BTreeMap::new();
    for (start, end, ongoing) in intervals {
        let start = start.max(range.start);
        let end = end.min(range.end);
        for (day, seconds) in split_by_day(start, end) {
            let slot = per_day.entry(day).or_insert((0, false));
            slot.0 += seconds;
            slot.1 |= ongoing;
        }
    }

    let days: Vec<DayTotal> = per_day
        .into_iter()
        .map(|(day, (total_seconds, ongoing))| DayTotal { day, total_seconds, ongoing })
        .collect();
    let total_seconds = days.iter().map(|d| d.total_seconds).sum();

    AnalyticsReport {
        user_id: user.clone(),
        range: *range,
        days,
        total_seconds,
        current_status: if open_interval.is_some() {
            AttendanceStatus::In
        } else {
            AttendanceStatus::Out
        },
        open_interval,
        anomalies,
    }
}

/// Split `[start, end)` at UTC midnights. Empty or inverted spans yield nothing.
fn split_by_day(mut start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(NaiveDate, i64)> {
    let mut out = Vec::new();
    while start < end {
        let day = start.date_naive();
        let next_midnight = day
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .unwrap_or(end);
        let segment_end = next_midnight.min(end);
        out.push((day, (segment_end - start).num_seconds()));
        start = segment_end;
    }
    out
}

/// Fetch the records needed for `range` and aggregate them.
pub async fn build_report(
    store: &dyn AttendanceStore,
    user: &UserId,
    range: &TimeRange,
    as_of: DateTime<Utc>,
    timeout: Duration,
) -> Result<AnalyticsReport, StoreError> {
    let mut records = Vec::new();
    // Only a CHECK_IN before the range can open an interval that reaches into it.
    if let Some(previous) = bounded(timeout, store.last_record_before(user, range.start)).await? {
        if previous.event_type == EventType::CheckIn {
            records.push(previous);
        }
    }
    records.extend(bounded(timeout, store.records(user, range)).await?);
    Ok(aggregate(user, &records, range, as_of))
}
