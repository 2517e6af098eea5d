use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of an enrolled user (the claimed identity of a request).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Face embedding vector produced by an external model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// True when the vector has `dim` finite components and a non-zero norm.
    pub fn is_well_formed(&self, dim: usize) -> bool {
        self.values.len() == dim
            && self.values.iter().all(|v| v.is_finite())
            && self.values.iter().any(|v| *v != 0.0)
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Uses constant-time computation: always processes all dimensions.
    /// Sums are kept in f64 so any finite f32 input stays finite.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(*a), f64::from(*b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { (dot / denom) as f32 } else { 0.0 }
    }
}

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A GPS fix reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
    /// Horizontal accuracy radius reported by the device, in meters.
    pub accuracy_m: f64,
}

impl Coordinate {
    pub fn point(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// Wi-Fi evidence reported alongside a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvidence {
    pub ssid: String,
    pub bssid: String,
    /// Received signal strength in dBm (e.g. -60).
    pub rssi_dbm: f64,
}

impl NetworkEvidence {
    /// Signal quality in percent, using the common `2 * (dBm + 100)` mapping.
    pub fn quality_percent(&self) -> f64 {
        (2.0 * (self.rssi_dbm + 100.0)).clamp(0.0, 100.0)
    }
}

/// One allow-listed network: an SSID or BSSID with a minimum signal strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowedNetwork {
    pub identifier: String,
    pub min_rssi_dbm: f64,
}

/// Allowed region for a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Geofence {
    Circle { center: LatLon, radius_m: f64 },
    Polygon { vertices: Vec<LatLon> },
}

/// An enrolled user with everything the decision checks need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledUser {
    pub user_id: UserId,
    pub embedding: Embedding,
    pub bound_device_id: String,
    /// Name of the policy site the geofence and networks were taken from.
    pub site: String,
    pub geofence: Geofence,
    pub allowed_networks: Vec<AllowedNetwork>,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CheckIn,
    CheckOut,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CheckIn => "check_in",
            EventType::CheckOut => "check_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "check_in" => Some(EventType::CheckIn),
            "check_out" => Some(EventType::CheckOut),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Out,
    In,
}

impl AttendanceStatus {
    /// Event that a successful decision in this status produces.
    pub fn next_event(&self) -> EventType {
        match self {
            AttendanceStatus::Out => EventType::CheckIn,
            AttendanceStatus::In => EventType::CheckOut,
        }
    }

    /// Status reached after `event` was recorded.
    pub fn after(event: EventType) -> Self {
        match event {
            EventType::CheckIn => AttendanceStatus::In,
            EventType::CheckOut => AttendanceStatus::Out,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Out => "out",
            AttendanceStatus::In => "in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "out" => Some(AttendanceStatus::Out),
            "in" => Some(AttendanceStatus::In),
            _ => None,
        }
    }
}

/// Independent checks a request must pass, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Face,
    Geofence,
    Network,
    Device,
}

/// Per-user attendance state. `version` increases by one on every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceState {
    pub user_id: UserId,
    pub status: AttendanceStatus,
    pub last_event_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl AttendanceState {
    pub fn initial(user_id: UserId) -> Self {
        Self {
            user_id,
            status: AttendanceStatus::Out,
            last_event_at: None,
            version: 0,
        }
    }

    /// True if an event at `now` falls inside the debounce window of the
    /// last accepted event. A `now` earlier than the last event counts as
    /// inside the window.
    pub fn within_debounce(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        match self.last_event_at {
            Some(last) => now.signed_duration_since(last) < window,
            None => false,
        }
    }

    pub fn advance(&self, event: EventType, at: DateTime<Utc>) -> Self {
        Self {
            user_id: self.user_id.clone(),
            status: AttendanceStatus::after(event),
            last_event_at: Some(at),
            version: self.version + 1,
        }
    }
}

/// Append-only record of an accepted decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: Uuid,
    pub user_id: UserId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub match_score: f32,
    pub location: Coordinate,
    pub network: NetworkEvidence,
    pub device_id: String,
    pub decision_basis: Vec<Check>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_cosine_similarity_large_magnitude() {
        let a = Embedding::new(vec![1e20, 3e20, 0.0]);
        let b = Embedding::new(vec![2e20, 6e20, 0.0]);
        assert!(a.is_well_formed(3));
        let s = a.similarity(&b);
        assert!(s.is_finite());
        assert!((s - 1.0).abs() < 1e-6);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_well_formed() {
        assert!(Embedding::new(vec![0.5, 0.5]).is_well_formed(2));
        assert!(!Embedding::new(vec![0.5, 0.5]).is_well_formed(3));
        assert!(!Embedding::new(vec![0.0, 0.0]).is_well_formed(2));
        assert!(!Embedding::new(vec![f32::NAN, 1.0]).is_well_formed(2));
    }

    #[test]
    fn test_quality_percent_clamped() {
        let ev = |rssi| NetworkEvidence { ssid: "x".into(), bssid: String::new(), rssi_dbm: rssi };
        assert_eq!(ev(-60.0).quality_percent(), 80.0);
        assert_eq!(ev(-20.0).quality_percent(), 100.0);
        assert_eq!(ev(-120.0).quality_percent(), 0.0);
    }

    #[test]
    fn test_state_alternates() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let s0 = AttendanceState::initial(UserId::from("u"));
        assert_eq!(s0.status.next_event(), EventType::CheckIn);
        let s1 = s0.advance(EventType::CheckIn, t0);
        assert_eq!(s1.status, AttendanceStatus::In);
        assert_eq!(s1.version, 1);
        assert_eq!(s1.status.next_event(), EventType::CheckOut);
    }

    #[test]
    fn test_debounce_window() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let window = chrono::Duration::seconds(300);
        let s = AttendanceState::initial(UserId::from("u")).advance(EventType::CheckIn, t0);
        assert!(s.within_debounce(t0 + chrono::Duration::seconds(299), window));
        assert!(!s.within_debounce(t0 + chrono::Duration::seconds(300), window));
        assert!(s.within_debounce(t0 - chrono::Duration::seconds(5), window));
        assert!(!AttendanceState::initial(UserId::from("u")).within_debounce(t0, window));
    }

    #[test]
    fn test_geofence_serde_tagged() {
        let fence: Geofence = serde_json::from_str(
            r#"{"kind":"circle","center":{"lat":1.0,"lon":2.0},"radius_m":100.0}"#,
        )
        .unwrap();
        assert!(matches!(fence, Geofence::Circle { radius_m, .. } if radius_m == 100.0));
    }
}
