use chrono::{DateTime, Duration, TimeZone, Utc};
use rollcall_core::{
    AllowedNetwork, AttendanceRecord, AttendanceState, AttendanceStatus, AttendanceStore, AuditEntry, Check,
    Coordinate, Embedding, EnrolledUser, EventType, Geofence, LatLon, NetworkEvidence, Rejection, StoreError,
    TimeRange, UserId,
};
use rollcall_store::migrations::latest_version;
use rollcall_store::{OpenError, SqliteStore};
use uuid::Uuid;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
}

fn record(user: &str, event: EventType, t: DateTime<Utc>) -> AttendanceRecord {
    AttendanceRecord {
        record_id: Uuid::new_v4(),
        user_id: UserId::from(user),
        event_type: event,
        timestamp: t,
        match_score: 0.93,
        location: Coordinate { lat: 23.8103, lon: 90.4125, accuracy_m: 8.0 },
        network: NetworkEvidence {
            ssid: "OfficeWiFi".into(),
            bssid: "aa:bb:cc:dd:ee:ff".into(),
            rssi_dbm: -55.0,
        },
        device_id: "D1".into(),
        decision_basis: vec![Check::Face, Check::Geofence, Check::Network, Check::Device],
    }
}

/// Commit the next transition for `state`, returning the new state.
async fn transition(
    store: &SqliteStore,
    state: AttendanceState,
    t: DateTime<Utc>,
) -> (AttendanceState, AttendanceRecord) {
    let event = state.status.next_event();
    let next = state.advance(event, t);
    let rec = record(next.user_id.as_str(), event, t);
    store.commit_transition(&rec, &next).await.unwrap();
    (next, rec)
}

fn enrolled(user: &str) -> EnrolledUser {
    EnrolledUser {
        user_id: UserId::from(user),
        embedding: Embedding::new(vec![0.5, -0.25, 0.0, 1.0]),
        bound_device_id: "D1".into(),
        site: "hq".into(),
        geofence: Geofence::Circle {
            center: LatLon { lat: 23.8103, lon: 90.4125 },
            radius_m: 100.0,
        },
        allowed_networks: vec![AllowedNetwork {
            identifier: "OfficeWiFi".into(),
            min_rssi_dbm: -70.0,
        }],
        enrolled_at: at(8, 0),
    }
}

#[tokio::test]
async fn test_open_in_memory_applies_migrations() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    assert!(store.load_enrollments().await.unwrap().is_empty());
    assert!(store.load_state(&UserId::from("u")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_newer_schema_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    match SqliteStore::open(&path).await {
        Err(OpenError::UnsupportedSchemaVersion { db_version, latest }) => {
            assert_eq!(db_version, 999);
            assert_eq!(latest, latest_version());
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("newer schema must be refused"),
    }
}

#[tokio::test]
async fn test_commit_and_reload_state() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let user = UserId::from("u");
    let (state, _) = transition(&store, AttendanceState::initial(user.clone()), at(9, 0)).await;

    let loaded = store.load_state(&user).await.unwrap().unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.status, AttendanceStatus::In);
    assert_eq!(loaded.version, 1);
}

#[tokio::test]
async fn test_stale_version_conflicts_and_writes_nothing() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let user = UserId::from("u");
    let initial = AttendanceState::initial(user.clone());
    transition(&store, initial.clone(), at(9, 0)).await;

    // A second writer that also read version 0.
    let stale = initial.advance(EventType::CheckIn, at(9, 1));
    let err = store
        .commit_transition(&record("u", EventType::CheckIn, at(9, 1)), &stale)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::Conflict { user: user.clone(), expected: 0, found: 1 }
    );

    let range = TimeRange::new(at(0, 0), at(23, 0));
    assert_eq!(store.records(&user, &range).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_records_ordered_and_range_half_open() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let user = UserId::from("u");
    let (s, first) = transition(&store, AttendanceState::initial(user.clone()), at(9, 0)).await;
    let (s, second) = transition(&store, s, at(12, 0)).await;
    let (_, third) = transition(&store, s, at(13, 0)).await;

    let all = store.records(&user, &TimeRange::new(at(0, 0), at(23, 0))).await.unwrap();
    let ids: Vec<Uuid> = all.iter().map(|r| r.record_id).collect();
    assert_eq!(ids, vec![first.record_id, second.record_id, third.record_id]);
    assert_eq!(all[0], first);

    let window = store.records(&user, &TimeRange::new(at(9, 0), at(13, 0))).await.unwrap();
    assert_eq!(window.len(), 2);

    let other = store
        .records(&UserId::from("v"), &TimeRange::new(at(0, 0), at(23, 0)))
        .await
        .unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn test_last_record_before() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let user = UserId::from("u");
    let (s, first) = transition(&store, AttendanceState::initial(user.clone()), at(9, 0)).await;
    transition(&store, s, at(17, 0)).await;

    assert_eq!(store.last_record_before(&user, at(9, 0)).await.unwrap(), None);
    assert_eq!(store.last_record_before(&user, at(12, 0)).await.unwrap(), Some(first));
}

#[tokio::test]
async fn test_records_are_append_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rollcall.db");
    {
        let store = SqliteStore::open(&path).await.unwrap();
        transition(&store, AttendanceState::initial(UserId::from("u")), at(9, 0)).await;
    }

    let conn = rusqlite::Connection::open(&path).unwrap();
    assert!(conn.execute("UPDATE attendance_records SET device_id = 'X'", []).is_err());
    assert!(conn.execute("DELETE FROM attendance_records", []).is_err());
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM attendance_records", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rollcall.db");
    let user = UserId::from("u");
    {
        let store = SqliteStore::open(&path).await.unwrap();
        store.save_enrollment(&enrolled("u")).await.unwrap();
        transition(&store, AttendanceState::initial(user.clone()), at(9, 0)).await;
    }

    let store = SqliteStore::open(&path).await.unwrap();
    let state = store.load_state(&user).await.unwrap().unwrap();
    assert_eq!(state.status, AttendanceStatus::In);
    assert_eq!(state.last_event_at, Some(at(9, 0)));
    assert_eq!(store.load_enrollments().await.unwrap(), vec![enrolled("u")]);
}

#[tokio::test]
async fn test_reenrollment_replaces_row() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    store.save_enrollment(&enrolled("u")).await.unwrap();

    let mut updated = enrolled("u");
    updated.embedding = Embedding::new(vec![1.0, 0.0, 0.0, 0.0]);
    updated.bound_device_id = "D2".into();
    updated.enrolled_at = at(10, 0);
    store.save_enrollment(&updated).await.unwrap();

    assert_eq!(store.load_enrollments().await.unwrap(), vec![updated]);
}

#[tokio::test]
async fn test_audit_entries_roundtrip() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let user = UserId::from("u");
    let rejected = AuditEntry {
        at: at(9, 0),
        claimed_user_id: user.clone(),
        accepted: false,
        reasons: vec![Rejection::IdentityMismatch, Rejection::DeviceMismatch],
        match_score: Some(0.5),
        matched_user_id: Some(UserId::from("v")),
        record_id: None,
        client_timestamp: Some(at(8, 59)),
    };
    let accepted = AuditEntry {
        at: at(9, 5),
        claimed_user_id: user.clone(),
        accepted: true,
        reasons: vec![],
        match_score: Some(0.25),
        matched_user_id: None,
        record_id: Some(Uuid::new_v4()),
        client_timestamp: None,
    };
    store.append_audit(&accepted).await.unwrap();
    store.append_audit(&rejected).await.unwrap();

    let entries = store
        .audit_entries(&user, &TimeRange::new(at(0, 0), at(0, 0) + Duration::days(1)))
        .await
        .unwrap();
    assert_eq!(entries, vec![rejected, accepted]);
}
