//! Row codecs between SQLite columns and core types.
//!
//! Rows are read into plain column structs inside the connection thread and
//! decoded afterwards, so a bad row surfaces as `StoreError::Corrupt` rather
//! than a driver error.

use chrono::{DateTime, TimeZone, Utc};
use rollcall_core::{
    AllowedNetwork, AttendanceRecord, AttendanceState, AttendanceStatus, AuditEntry, Check, Coordinate,
    Embedding, EnrolledUser, EventType, Geofence, NetworkEvidence, Rejection, StoreError, UserId,
};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Result<Embedding, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let values = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding::new(values))
}

pub(crate) const RECORD_COLUMNS: &str = "record_id, user_id, event_type, ts, match_score, lat, lon, \
     accuracy_m, ssid, bssid, rssi_dbm, device_id, decision_basis";

#[derive(Debug)]
pub(crate) struct RecordRow {
    record_id: String,
    user_id: String,
    event_type: String,
    ts: i64,
    match_score: f64,
    lat: f64,
    lon: f64,
    accuracy_m: f64,
    ssid: String,
    bssid: String,
    rssi_dbm: f64,
    device_id: String,
    decision_basis: String,
}

impl RecordRow {
    pub(crate) fn from_record(r: &AttendanceRecord) -> Result<Self, StoreError> {
        Ok(Self {
            record_id: r.record_id.to_string(),
            user_id: r.user_id.as_str().to_owned(),
            event_type: r.event_type.as_str().to_owned(),
            ts: to_millis(r.timestamp),
            match_score: f64::from(r.match_score),
            lat: r.location.lat,
            lon: r.location.lon,
            accuracy_m: r.location.accuracy_m,
            ssid: r.network.ssid.clone(),
            bssid: r.network.bssid.clone(),
            rssi_dbm: r.network.rssi_dbm,
            device_id: r.device_id.clone(),
            decision_basis: serde_json::to_string(&r.decision_basis)
                .map_err(|e| corrupt("decision_basis", e))?,
        })
    }

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            record_id: row.get(0)?,
            user_id: row.get(1)?,
            event_type: row.get(2)?,
            ts: row.get(3)?,
            match_score: row.get(4)?,
            lat: row.get(5)?,
            lon: row.get(6)?,
            accuracy_m: row.get(7)?,
            ssid: row.get(8)?,
            bssid: row.get(9)?,
            rssi_dbm: row.get(10)?,
            device_id: row.get(11)?,
            decision_basis: row.get(12)?,
        })
    }

    pub(crate) fn insert(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            &format!(
                "INSERT INTO attendance_records ({RECORD_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                self.record_id,
                self.user_id,
                self.event_type,
                self.ts,
                self.match_score,
                self.lat,
                self.lon,
                self.accuracy_m,
                self.ssid,
                self.bssid,
                self.rssi_dbm,
                self.device_id,
                self.decision_basis,
            ],
        )
    }

    pub(crate) fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        let decision_basis: Vec<Check> =
            serde_json::from_str(&self.decision_basis).map_err(|e| corrupt("decision_basis", e))?;
        Ok(AttendanceRecord {
            record_id: Uuid::parse_str(&self.record_id).map_err(|e| corrupt("record_id", e))?,
            user_id: UserId::new(self.user_id),
            event_type: EventType::parse(&self.event_type)
                .ok_or_else(|| corrupt("event_type", &self.event_type))?,
            timestamp: from_millis(self.ts)?,
            match_score: self.match_score as f32,
            location: Coordinate {
                lat: self.lat,
                lon: self.lon,
                accuracy_m: self.accuracy_m,
            },
            network: NetworkEvidence {
                ssid: self.ssid,
                bssid: self.bssid,
                rssi_dbm: self.rssi_dbm,
            },
            device_id: self.device_id,
            decision_basis,
        })
    }
}

#[derive(Debug)]
pub(crate) struct EnrollmentRow {
    user_id: String,
    embedding: Vec<u8>,
    bound_device_id: String,
    site: String,
    geofence: String,
    allowed_networks: String,
    enrolled_at: i64,
}

impl EnrollmentRow {
    pub(crate) fn from_user(u: &EnrolledUser) -> Result<Self, StoreError> {
        Ok(Self {
            user_id: u.user_id.as_str().to_owned(),
            embedding: encode_embedding(&u.embedding),
            bound_device_id: u.bound_device_id.clone(),
            site: u.site.clone(),
            geofence: serde_json::to_string(&u.geofence).map_err(|e| corrupt("geofence", e))?,
            allowed_networks: serde_json::to_string(&u.allowed_networks)
                .map_err(|e| corrupt("allowed_networks", e))?,
            enrolled_at: to_millis(u.enrolled_at),
        })
    }

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            embedding: row.get(1)?,
            bound_device_id: row.get(2)?,
            site: row.get(3)?,
            geofence: row.get(4)?,
            allowed_networks: row.get(5)?,
            enrolled_at: row.get(6)?,
        })
    }

    pub(crate) fn upsert(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO enrollments \
                 (user_id, embedding, bound_device_id, site, geofence, allowed_networks, enrolled_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(user_id) DO UPDATE SET \
                 embedding = excluded.embedding, \
                 bound_device_id = excluded.bound_device_id, \
                 site = excluded.site, \
                 geofence = excluded.geofence, \
                 allowed_networks = excluded.allowed_networks, \
                 enrolled_at = excluded.enrolled_at",
            params![
                self.user_id,
                self.embedding,
                self.bound_device_id,
                self.site,
                self.geofence,
                self.allowed_networks,
                self.enrolled_at,
            ],
        )
    }

    pub(crate) fn into_user(self) -> Result<EnrolledUser, StoreError> {
        let geofence: Geofence = serde_json::from_str(&self.geofence).map_err(|e| corrupt("geofence", e))?;
        let allowed_networks: Vec<AllowedNetwork> =
            serde_json::from_str(&self.allowed_networks).map_err(|e| corrupt("allowed_networks", e))?;
        Ok(EnrolledUser {
            user_id: UserId::new(self.user_id),
            embedding: decode_embedding(&self.embedding)?,
            bound_device_id: self.bound_device_id,
            site: self.site,
            geofence,
            allowed_networks,
            enrolled_at: from_millis(self.enrolled_at)?,
        })
    }
}

#[derive(Debug)]
pub(crate) struct StateRow {
    pub(crate) status: String,
    pub(crate) last_event_at: Option<i64>,
    pub(crate) version: i64,
}

impl StateRow {
    pub(crate) fn into_state(self, user_id: UserId) -> Result<AttendanceState, StoreError> {
        Ok(AttendanceState {
            user_id,
            status: AttendanceStatus::parse(&self.status).ok_or_else(|| corrupt("status", &self.status))?,
            last_event_at: self.last_event_at.map(from_millis).transpose()?,
            version: u64::try_from(self.version).map_err(|e| corrupt("version", e))?,
        })
    }
}

pub(crate) const AUDIT_COLUMNS: &str =
    "at, claimed_user_id, accepted, reasons, match_score, matched_user_id, record_id, client_ts";

#[derive(Debug)]
pub(crate) struct AuditRow {
    at: i64,
    claimed_user_id: String,
    accepted: bool,
    reasons: String,
    match_score: Option<f64>,
    matched_user_id: Option<String>,
    record_id: Option<String>,
    client_ts: Option<i64>,
}

impl AuditRow {
    pub(crate) fn from_entry(e: &AuditEntry) -> Result<Self, StoreError> {
        Ok(Self {
            at: to_millis(e.at),
            claimed_user_id: e.claimed_user_id.as_str().to_owned(),
            accepted: e.accepted,
            reasons: serde_json::to_string(&e.reasons).map_err(|err| corrupt("reasons", err))?,
            match_score: e.match_score.map(f64::from),
            matched_user_id: e.matched_user_id.as_ref().map(|u| u.as_str().to_owned()),
            record_id: e.record_id.map(|id| id.to_string()),
            client_ts: e.client_timestamp.map(to_millis),
        })
    }

    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            at: row.get(0)?,
            claimed_user_id: row.get(1)?,
            accepted: row.get(2)?,
            reasons: row.get(3)?,
            match_score: row.get(4)?,
            matched_user_id: row.get(5)?,
            record_id: row.get(6)?,
            client_ts: row.get(7)?,
        })
    }

    pub(crate) fn insert(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(
            &format!("INSERT INTO audit_log ({AUDIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                self.at,
                self.claimed_user_id,
                self.accepted,
                self.reasons,
                self.match_score,
                self.matched_user_id,
                self.record_id,
                self.client_ts,
            ],
        )
    }

    pub(crate) fn into_entry(self) -> Result<AuditEntry, StoreError> {
        let reasons: Vec<Rejection> = serde_json::from_str(&self.reasons).map_err(|e| corrupt("reasons", e))?;
        Ok(AuditEntry {
            at: from_millis(self.at)?,
            claimed_user_id: UserId::new(self.claimed_user_id),
            accepted: self.accepted,
            reasons,
            match_score: self.match_score.map(|s| s as f32),
            matched_user_id: self.matched_user_id.map(UserId::new),
            record_id: self
                .record_id
                .map(|id| Uuid::parse_str(&id))
                .transpose()
                .map_err(|e| corrupt("record_id", e))?,
            client_timestamp: self.client_ts.map(from_millis).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_blob_roundtrip() {
        let e = Embedding::new(vec![0.25, -1.5, 3.0]);
        let bytes = encode_embedding(&e);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_embedding(&bytes).unwrap(), e);
    }

    #[test]
    fn test_truncated_blob_is_corrupt() {
        assert!(matches!(decode_embedding(&[0, 0, 0]), Err(StoreError::Corrupt(_))));
    }
}
