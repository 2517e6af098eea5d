use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceRequest, Decision, DecisionEngine, EngineError, EnrollmentRequest,
    FaceUpdateRequest, Rejection, TimeRange, UserId,
};
use serde::Serialize;
use std::sync::Arc;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// Range used by History and Analytics when the caller leaves `from` empty.
const DEFAULT_RANGE_DAYS: i64 = 7;

/// D-Bus interface for the attendance decision daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: Arc<DecisionEngine>,
    started_at: DateTime<Utc>,
}

impl AttendanceService {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self {
            engine,
            started_at: Utc::now(),
        }
    }

    async fn handle_attend(&self, request: &str) -> fdo::Result<String> {
        let decision = match AttendanceRequest::from_json(request) {
            Ok(request) => self.engine.decide(request).await,
            Err(err) => {
                tracing::warn!(error = %err, "attend request could not be parsed");
                Decision::rejected(vec![Rejection::MalformedRequest])
            }
        };
        to_json(&decision)
    }

    async fn handle_enroll(&self, request: &str) -> fdo::Result<String> {
        let request = EnrollmentRequest::from_json(request).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
        let user_id = request.user_id.clone();
        let version = self.engine.enroll(request).await.map_err(engine_error)?;
        to_json(&EnrollmentReply { user_id, gallery_version: version })
    }

    async fn handle_update_face(&self, request: &str) -> fdo::Result<String> {
        let request = FaceUpdateRequest::from_json(request).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
        let user_id = request.user_id.clone();
        let version = self.engine.update_face(request).await.map_err(engine_error)?;
        to_json(&EnrollmentReply { user_id, gallery_version: version })
    }

    async fn handle_history(&self, user: &str, from: &str, to: &str) -> fdo::Result<String> {
        let range = parse_range(from, to, Utc::now())?;
        let records = self
            .engine
            .history(&UserId::from(user), &range)
            .await
            .map_err(engine_error)?;
        to_json(&records)
    }

    async fn handle_analytics(&self, user: &str, from: &str, to: &str) -> fdo::Result<String> {
        let now = Utc::now();
        let range = parse_range(from, to, now)?;
        let report = self
            .engine
            .analytics(&UserId::from(user), &range, now)
            .await
            .map_err(engine_error)?;
        to_json(&report)
    }

    fn handle_status(&self) -> fdo::Result<String> {
        let policy = self.engine.policy();
        let gallery = self.engine.gallery().snapshot();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": self.started_at,
            "gallery_version": gallery.version(),
            "enrolled_users": gallery.len(),
            "embedding_dim": policy.embedding_dim,
            "match_threshold": policy.match_threshold,
            "debounce_window_secs": policy.debounce_window_secs,
            "sites": policy.sites.keys().collect::<Vec<_>>(),
        }))
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Decide one attendance request. Takes and returns JSON; rejections are
    /// reported in the returned decision, not as D-Bus errors.
    async fn attend(&self, request: &str) -> fdo::Result<String> {
        self.handle_attend(request).await
    }

    /// Enroll a user or replace their enrollment.
    async fn enroll(&self, request: &str) -> fdo::Result<String> {
        tracing::info!("enroll requested");
        self.handle_enroll(request).await
    }

    /// Replace the face template of an enrolled user after presence checks.
    async fn update_face(&self, request: &str) -> fdo::Result<String> {
        tracing::info!("update_face requested");
        self.handle_update_face(request).await
    }

    /// Records of `user` between two RFC 3339 instants, newest first.
    async fn history(&self, user: &str, from: &str, to: &str) -> fdo::Result<String> {
        tracing::info!(user, from, to, "history requested");
        self.handle_history(user, from, to).await
    }

    /// Worked-time report of `user` between two RFC 3339 instants.
    async fn analytics(&self, user: &str, from: &str, to: &str) -> fdo::Result<String> {
        tracing::info!(user, from, to, "analytics requested");
        self.handle_analytics(user, from, to).await
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        self.handle_status()
    }
}

#[derive(Serialize)]
struct EnrollmentReply {
    user_id: UserId,
    gallery_version: u64,
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

/// Empty `to` means now; empty `from` means `DEFAULT_RANGE_DAYS` before `to`.
fn parse_range(from: &str, to: &str, now: DateTime<Utc>) -> fdo::Result<TimeRange> {
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| fdo::Error::InvalidArgs(format!("bad timestamp `{s}`: {e}")))
    };
    let end = if to.is_empty() { now } else { parse(to)? };
    let range = if from.is_empty() {
        TimeRange::last_days(end, DEFAULT_RANGE_DAYS)
    } else {
        TimeRange::new(parse(from)?, end)
    };
    if range.start > range.end {
        return Err(fdo::Error::InvalidArgs("range start is after its end".into()));
    }
    Ok(range)
}

fn engine_error(err: EngineError) -> fdo::Error {
    match err {
        EngineError::PresenceRejected(_) => fdo::Error::AccessDenied(err.to_string()),
        EngineError::UnknownUser(_) | EngineError::Enroll(_) => fdo::Error::InvalidArgs(err.to_string()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_core::{AttendanceStore, MemoryStore, Policy};

    const POLICY: &str = r#"
match_threshold = 0.8
debounce_window_secs = 300
embedding_dim = 4

[sites.hq.geofence]
kind = "circle"
center = { lat = 23.8103, lon = 90.4125 }
radius_m = 100.0

[[sites.hq.allowed_networks]]
identifier = "OfficeWiFi"
min_rssi_dbm = -70.0
"#;

    const ENROLL_U: &str =
        r#"{"user_id":"u","embedding":[1.0,0.0,0.0,0.0],"device_id":"D1","site":"hq"}"#;

    async fn service() -> AttendanceService {
        let policy: Policy = toml::from_str(POLICY).unwrap();
        let store: Arc<dyn AttendanceStore> = Arc::new(MemoryStore::new());
        let engine = DecisionEngine::bootstrap(policy, store).await.unwrap();
        AttendanceService::new(Arc::new(engine))
    }

    fn attend_json(device: &str) -> String {
        serde_json::json!({
            "claimed_user_id": "u",
            "probe_embedding": [0.95, 0.3122499, 0.0, 0.0],
            "coordinate": { "lat": 23.8105, "lon": 90.4125, "accuracy_m": 8.0 },
            "network": { "ssid": "OfficeWiFi", "bssid": "", "rssi_dbm": -60.0 },
            "device_id": device,
            "client_timestamp": "2026-03-02T09:00:00Z",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_enroll_then_attend() {
        let svc = service().await;
        let reply: serde_json::Value = serde_json::from_str(&svc.handle_enroll(ENROLL_U).await.unwrap()).unwrap();
        assert_eq!(reply["gallery_version"], 1);

        let decision: Decision = serde_json::from_str(&svc.handle_attend(&attend_json("D1")).await.unwrap()).unwrap();
        assert!(decision.accepted, "{decision:?}");
        assert!(decision.record_id.is_some());

        let status: serde_json::Value = serde_json::from_str(&svc.handle_status().unwrap()).unwrap();
        assert_eq!(status["enrolled_users"], 1);
        assert_eq!(status["sites"], serde_json::json!(["hq"]));
    }

    #[tokio::test]
    async fn test_unparseable_attend_is_malformed_decision() {
        let svc = service().await;
        let decision: Decision = serde_json::from_str(&svc.handle_attend("{not json").await.unwrap()).unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.reasons, vec![Rejection::MalformedRequest]);
        assert!(!decision.retryable);
    }

    #[tokio::test]
    async fn test_enroll_unknown_site_is_invalid_args() {
        let svc = service().await;
        let request = ENROLL_U.replace("\"hq\"", "\"annex\"");
        assert!(matches!(svc.handle_enroll(&request).await, Err(fdo::Error::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn test_update_face_off_site_is_access_denied() {
        let svc = service().await;
        svc.handle_enroll(ENROLL_U).await.unwrap();
        let request = serde_json::json!({
            "user_id": "u",
            "embedding": [0.0, 1.0, 0.0, 0.0],
            "coordinate": { "lat": 23.9, "lon": 90.4125, "accuracy_m": 8.0 },
            "network": { "ssid": "OfficeWiFi", "bssid": "", "rssi_dbm": -60.0 },
            "device_id": "D1",
        })
        .to_string();
        match svc.handle_update_face(&request).await {
            Err(fdo::Error::AccessDenied(msg)) => assert!(msg.contains("geofence_violation"), "{msg}"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_of_unknown_user() {
        let svc = service().await;
        assert!(matches!(
            svc.handle_history("ghost", "", "").await,
            Err(fdo::Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_parse_range_defaults_and_errors() {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        let range = parse_range("", "", now).unwrap();
        assert_eq!(range.end, now);
        assert_eq!(range.start, now - chrono::Duration::days(DEFAULT_RANGE_DAYS));

        let range = parse_range("2026-03-01T00:00:00Z", "2026-03-02T00:00:00+00:00", now).unwrap();
        assert_eq!(range.start, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());

        assert!(parse_range("yesterday", "", now).is_err());
        assert!(parse_range("2026-03-05T00:00:00Z", "2026-03-01T00:00:00Z", now).is_err());
    }
}
