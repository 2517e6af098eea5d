//! Decision engine: fuses face, geofence, network and device evidence into
//! one accept/reject decision and drives the per-user check-in/out machine.

use crate::analytics::{self, AnalyticsReport};
use crate::decision::{Decision, Rejection};
use crate::device;
use crate::gallery::{EmbeddingStore, EnrollError, Gallery};
use crate::geofence::GeofenceValidator;
use crate::matcher::{CosineMatcher, MatchResult, MatchVerdict, Matcher};
use crate::network;
use crate::policy::{Policy, PolicyError};
use crate::request::{AttendanceRequest, EnrollmentRequest, FaceUpdateRequest};
use crate::state::{StateSlot, StateTracker};
use crate::store::{bounded, AttendanceStore, AuditEntry, StoreError, TimeRange};
use crate::types::{
    AttendanceRecord, AttendanceState, Check, Coordinate, EnrolledUser, EventType, NetworkEvidence,
    UserId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("enrollment: {0}")]
    Enroll(#[from] EnrollError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("presence checks failed: {}", codes(.0).join(","))]
    PresenceRejected(Vec<Rejection>),
}

/// Result of the independent checks for one request.
struct Evaluation {
    passed: Vec<Check>,
    failures: Vec<Rejection>,
    face: MatchResult,
}

/// Owned inputs of the per-user critical section.
struct PendingTransition {
    user_id: UserId,
    intended_event: Option<EventType>,
    match_score: f32,
    coordinate: Coordinate,
    network: NetworkEvidence,
    device_id: String,
    decision_basis: Vec<Check>,
    now: DateTime<Utc>,
    window: chrono::Duration,
    timeout: Duration,
}

pub struct DecisionEngine {
    policy: Policy,
    gallery: EmbeddingStore,
    matcher: CosineMatcher,
    geofence: GeofenceValidator,
    tracker: Arc<StateTracker>,
    store: Arc<dyn AttendanceStore>,
    /// Serializes enrollment writes so persisted and published order agree.
    enroll_lock: AsyncMutex<()>,
}

impl DecisionEngine {
    pub fn new(
        policy: Policy,
        gallery: EmbeddingStore,
        store: Arc<dyn AttendanceStore>,
    ) -> Result<Self, EngineError> {
        policy.validate()?;
        if gallery.dim() != policy.embedding_dim {
            return Err(EnrollError::DimensionMismatch {
                expected: policy.embedding_dim,
                actual: gallery.dim(),
            }
            .into());
        }
        Ok(Self {
            matcher: CosineMatcher::new(policy.match_threshold),
            geofence: GeofenceValidator::new(policy.max_gps_accuracy_m),
            policy,
            gallery,
            tracker: Arc::new(StateTracker::new()),
            store,
            enroll_lock: AsyncMutex::new(()),
        })
    }

    /// Load persisted enrollments into a fresh gallery and build the engine.
    pub async fn bootstrap(policy: Policy, store: Arc<dyn AttendanceStore>) -> Result<Self, EngineError> {
        policy.validate()?;
        let users = bounded(policy.store_timeout(), store.load_enrollments()).await?;
        let gallery = EmbeddingStore::from_enrollments(policy.embedding_dim, users)?;
        Self::new(policy, gallery, store)
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn gallery(&self) -> &EmbeddingStore {
        &self.gallery
    }

    /// Cached attendance state, if the user has been seen since startup.
    pub fn cached_state(&self, user: &UserId) -> Option<AttendanceState> {
        self.tracker.peek(user)
    }

    pub async fn decide(&self, request: AttendanceRequest) -> Decision {
        self.decide_at(request, Utc::now()).await
    }

    /// Decide a request as of server time `now`.
    pub async fn decide_at(&self, request: AttendanceRequest, now: DateTime<Utc>) -> Decision {
        let user_id = request.claimed_user_id.clone();
        let client_timestamp = request.client_timestamp;

        if let Err(err) = request.validate(self.gallery.dim()) {
            tracing::warn!(user = %user_id, error = %err, "attendance rejected: malformed request");
            let decision = Decision::rejected(vec![Rejection::MalformedRequest]);
            self.audit(now, &user_id, &decision, None, client_timestamp).await;
            return decision;
        }

        let gallery = self.gallery.snapshot();
        let Some(profile) = gallery.get(&user_id) else {
            tracing::warn!(user = %user_id, "attendance rejected: user not enrolled");
            let decision = Decision::rejected(vec![Rejection::EnrollmentMissing]);
            self.audit(now, &user_id, &decision, None, client_timestamp).await;
            return decision;
        };

        let eval = self.evaluate(&request, &gallery, profile);
        if eval.face.verdict == MatchVerdict::IdentityMismatch {
            tracing::warn!(
                user = %user_id,
                matched = ?eval.face.matched_user_id,
                score = eval.face.score,
                claimed_score = eval.face.claimed_score,
                "possible impersonation: probe is closer to another enrolled user"
            );
        }
        if !eval.failures.is_empty() {
            let mut failures = eval.failures;
            if self.within_debounce(&user_id, now).await {
                failures.push(Rejection::DuplicateWithinDebounce);
            }
            tracing::warn!(
                user = %user_id,
                reasons = ?codes(&failures),
                score = eval.face.claimed_score,
                "attendance rejected"
            );
            let decision = Decision::rejected(failures);
            self.audit(now, &user_id, &decision, Some(&eval.face), client_timestamp).await;
            return decision;
        }

        let pending = PendingTransition {
            user_id: user_id.clone(),
            intended_event: request.intended_event,
            match_score: eval.face.claimed_score,
            coordinate: request.coordinate,
            network: request.network,
            device_id: request.device_id,
            decision_basis: eval.passed,
            now,
            window: self.policy.debounce_window(),
            timeout: self.policy.store_timeout(),
        };

        // Dropping this future while waiting for the lock has no effect. Once
        // the lock is held the transition runs in its own task to completion.
        let slot = self.tracker.acquire(&user_id).await;
        let store = Arc::clone(&self.store);
        let outcome = match tokio::spawn(run_transition(slot, store, pending)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(user = %user_id, error = %err, "transition task failed");
                Err(Rejection::TransientStoreFailure)
            }
        };

        let decision = match outcome {
            Ok(record) => {
                tracing::info!(
                    user = %user_id,
                    event = %record.event_type,
                    record_id = %record.record_id,
                    score = record.match_score,
                    wifi_quality = record.network.quality_percent(),
                    "attendance accepted"
                );
                Decision::accepted(record.event_type, record.record_id)
            }
            Err(reason) => {
                tracing::warn!(user = %user_id, reason = reason.code(), "attendance rejected");
                Decision::rejected(vec![reason])
            }
        };
        self.audit(now, &user_id, &decision, Some(&eval.face), client_timestamp).await;
        decision
    }

    /// Whether `now` falls inside the user's debounce window. Reads the
    /// state under the user's lock but never caches or changes it.
    async fn within_debounce(&self, user_id: &UserId, now: DateTime<Utc>) -> bool {
        let slot = self.tracker.acquire(user_id).await;
        let state = match (*slot).clone() {
            Some(state) => Some(state),
            None => match bounded(self.policy.store_timeout(), self.store.load_state(user_id)).await {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(user = %user_id, error = %err, "state load failed; debounce not checked");
                    None
                }
            },
        };
        state.is_some_and(|s| s.within_debounce(now, self.policy.debounce_window()))
    }

    fn evaluate(&self, request: &AttendanceRequest, gallery: &Gallery, profile: &EnrolledUser) -> Evaluation {
        let mut passed = Vec::with_capacity(4);
        let mut failures = Vec::new();

        let face = self
            .matcher
            .identify(&request.probe_embedding, gallery, &request.claimed_user_id);
        match face.verdict {
            MatchVerdict::Accepted => passed.push(Check::Face),
            MatchVerdict::NoMatch => failures.push(Rejection::NoFaceMatch),
            MatchVerdict::IdentityMismatch => failures.push(Rejection::IdentityMismatch),
            MatchVerdict::Ambiguous => failures.push(Rejection::AmbiguousFaceMatch),
            MatchVerdict::NotEnrolled => failures.push(Rejection::EnrollmentMissing),
        }

        let (presence_passed, presence_failures) =
            self.presence(&request.coordinate, &request.network, &request.device_id, profile);
        passed.extend(presence_passed);
        failures.extend(presence_failures);

        Evaluation { passed, failures, face }
    }

    /// Geofence, network and device checks, in that order.
    fn presence(
        &self,
        coordinate: &Coordinate,
        evidence: &NetworkEvidence,
        device_id: &str,
        profile: &EnrolledUser,
    ) -> (Vec<Check>, Vec<Rejection>) {
        let mut passed = Vec::with_capacity(3);
        let mut failures = Vec::new();

        if self.geofence.validate(coordinate, &profile.geofence) {
            passed.push(Check::Geofence);
        } else {
            tracing::debug!(
                user = %profile.user_id,
                distance_m = ?profile.geofence.distance_to_center_m(coordinate.point()),
                "geofence check failed"
            );
            failures.push(Rejection::GeofenceViolation);
        }

        match network::check(evidence, &profile.allowed_networks) {
            Ok(entry) => {
                tracing::debug!(user = %profile.user_id, network = %entry.identifier, "network check passed");
                passed.push(Check::Network);
            }
            Err(fault) => {
                tracing::debug!(user = %profile.user_id, %fault, "network check failed");
                failures.push(Rejection::NetworkEvidenceInvalid);
            }
        }

        if device::validate(device_id, &profile.bound_device_id) {
            passed.push(Check::Device);
        } else {
            failures.push(Rejection::DeviceMismatch);
        }

        (passed, failures)
    }

    async fn audit(
        &self,
        at: DateTime<Utc>,
        user_id: &UserId,
        decision: &Decision,
        face: Option<&MatchResult>,
        client_timestamp: DateTime<Utc>,
    ) {
        let entry = AuditEntry {
            at,
            claimed_user_id: user_id.clone(),
            accepted: decision.accepted,
            reasons: decision.reasons.clone(),
            match_score: face.map(|f| f.claimed_score),
            matched_user_id: face.and_then(|f| f.matched_user_id.clone()),
            record_id: decision.record_id,
            client_timestamp: Some(client_timestamp),
        };
        if let Err(err) = bounded(self.policy.store_timeout(), self.store.append_audit(&entry)).await {
            tracing::warn!(user = %user_id, error = %err, "audit append failed");
        }
    }

    /// Enroll a user, or fully replace an existing enrollment.
    ///
    /// Returns the version of the published gallery snapshot.
    pub async fn enroll(&self, request: EnrollmentRequest) -> Result<u64, EngineError> {
        let site = self
            .policy
            .site(&request.site)
            .ok_or_else(|| EnrollError::UnknownSite(request.site.clone()))?;
        let profile = EnrolledUser {
            user_id: request.user_id,
            embedding: request.embedding,
            bound_device_id: request.device_id,
            geofence: site.geofence.clone(),
            allowed_networks: site.allowed_networks.clone(),
            site: request.site,
            enrolled_at: Utc::now(),
        };
        self.gallery.validate(&profile)?;

        let _guard = self.enroll_lock.lock().await;
        bounded(self.policy.store_timeout(), self.store.save_enrollment(&profile)).await?;
        let user_id = profile.user_id.clone();
        let snapshot = self.gallery.publish(profile)?;
        tracing::info!(user = %user_id, version = snapshot.version(), "user enrolled");
        Ok(snapshot.version())
    }

    /// Replace the face template of an enrolled user.
    ///
    /// The request must pass the user's geofence, network and device checks.
    /// Attendance state is not touched.
    pub async fn update_face(&self, request: FaceUpdateRequest) -> Result<u64, EngineError> {
        let _guard = self.enroll_lock.lock().await;
        let gallery = self.gallery.snapshot();
        let profile = gallery
            .get(&request.user_id)
            .ok_or_else(|| EngineError::UnknownUser(request.user_id.clone()))?;

        let (_, failures) = self.presence(&request.coordinate, &request.network, &request.device_id, profile);
        if !failures.is_empty() {
            tracing::warn!(user = %request.user_id, reasons = ?codes(&failures), "face update rejected");
            return Err(EngineError::PresenceRejected(failures));
        }

        let mut updated = profile.clone();
        updated.embedding = request.embedding;
        updated.enrolled_at = Utc::now();
        self.gallery.validate(&updated)?;

        bounded(self.policy.store_timeout(), self.store.save_enrollment(&updated)).await?;
        let snapshot = self.gallery.publish(updated)?;
        tracing::info!(user = %request.user_id, version = snapshot.version(), "face template updated");
        Ok(snapshot.version())
    }

    /// Records of `user` inside `range`, newest first.
    pub async fn history(&self, user: &UserId, range: &TimeRange) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.require_enrolled(user)?;
        let mut records = bounded(self.policy.store_timeout(), self.store.records(user, range)).await?;
        records.reverse();
        Ok(records)
    }

    pub async fn analytics(
        &self,
        user: &UserId,
        range: &TimeRange,
        as_of: DateTime<Utc>,
    ) -> Result<AnalyticsReport, EngineError> {
        self.require_enrolled(user)?;
        let report =
            analytics::build_report(self.store.as_ref(), user, range, as_of, self.policy.store_timeout()).await?;
        Ok(report)
    }

    fn require_enrolled(&self, user: &UserId) -> Result<(), EngineError> {
        match self.gallery.snapshot().get(user) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownUser(user.clone())),
        }
    }
}

/// The per-user critical section: load state, debounce, pick the event,
/// commit record and state together.
async fn run_transition(
    mut slot: OwnedMutexGuard<StateSlot>,
    store: Arc<dyn AttendanceStore>,
    pending: PendingTransition,
) -> Result<AttendanceRecord, Rejection> {
    let current = match (*slot).clone() {
        Some(state) => state,
        None => match bounded(pending.timeout, store.load_state(&pending.user_id)).await {
            Ok(Some(state)) => state,
            Ok(None) => AttendanceState::initial(pending.user_id.clone()),
            Err(err) => {
                tracing::warn!(user = %pending.user_id, error = %err, "state load failed");
                return Err(Rejection::TransientStoreFailure);
            }
        },
    };
    *slot = Some(current.clone());

    if current.within_debounce(pending.now, pending.window) {
        return Err(Rejection::DuplicateWithinDebounce);
    }

    let event = current.status.next_event();
    if let Some(intended) = pending.intended_event {
        if intended != event {
            return Err(Rejection::SequenceConflict);
        }
    }

    let record = AttendanceRecord {
        record_id: Uuid::new_v4(),
        user_id: pending.user_id,
        event_type: event,
        timestamp: pending.now,
        match_score: pending.match_score,
        location: pending.coordinate,
        network: pending.network,
        device_id: pending.device_id,
        decision_basis: pending.decision_basis,
    };
    let next = current.advance(event, pending.now);

    match bounded(pending.timeout, store.commit_transition(&record, &next)).await {
        Ok(()) => {
            *slot = Some(next);
            Ok(record)
        }
        Err(StoreError::Conflict { expected, found, .. }) => {
            tracing::warn!(user = %record.user_id, expected, found, "state version conflict");
            *slot = None;
            Err(Rejection::StateConflict)
        }
        Err(err) => {
            // The write may or may not have landed; reload next time.
            tracing::warn!(user = %record.user_id, error = %err, "commit failed");
            *slot = None;
            Err(Rejection::TransientStoreFailure)
        }
    }
}

fn codes(reasons: &[Rejection]) -> Vec<&'static str> {
    reasons.iter().map(Rejection::code).collect()
}
