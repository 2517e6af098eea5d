use crate::types::EventType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Why an attendance request was not accepted.
///
/// Variants carry no payload: this is what the claimant sees. Details such as
/// the identity an impostor probe matched go to the audit log only.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    #[error("request is missing fields or has malformed values")]
    MalformedRequest,
    #[error("claimed user is not enrolled")]
    EnrollmentMissing,
    #[error("face not recognized")]
    NoFaceMatch,
    #[error("face verification failed")]
    IdentityMismatch,
    #[error("face match is ambiguous")]
    AmbiguousFaceMatch,
    #[error("location is outside the allowed area or the GPS fix is invalid")]
    GeofenceViolation,
    #[error("network evidence does not satisfy the allow-list")]
    NetworkEvidenceInvalid,
    #[error("request does not come from the registered device")]
    DeviceMismatch,
    #[error("duplicate submission within the debounce window")]
    DuplicateWithinDebounce,
    #[error("requested event does not follow the current attendance status")]
    SequenceConflict,
    #[error("attendance state changed concurrently")]
    StateConflict,
    #[error("attendance store temporarily unavailable")]
    TransientStoreFailure,
}

impl Rejection {
    /// Whether the caller may resubmit the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Rejection::TransientStoreFailure | Rejection::StateConflict)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Rejection::MalformedRequest => "malformed_request",
            Rejection::EnrollmentMissing => "enrollment_missing",
            Rejection::NoFaceMatch => "no_face_match",
            Rejection::IdentityMismatch => "identity_mismatch",
            Rejection::AmbiguousFaceMatch => "ambiguous_face_match",
            Rejection::GeofenceViolation => "geofence_violation",
            Rejection::NetworkEvidenceInvalid => "network_evidence_invalid",
            Rejection::DeviceMismatch => "device_mismatch",
            Rejection::DuplicateWithinDebounce => "duplicate_within_debounce",
            Rejection::SequenceConflict => "sequence_conflict",
            Rejection::StateConflict => "state_conflict",
            Rejection::TransientStoreFailure => "transient_store_failure",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        ALL_REJECTIONS.iter().copied().find(|r| r.code() == code)
    }
}

const ALL_REJECTIONS: [Rejection; 12] = [
    Rejection::MalformedRequest,
    Rejection::EnrollmentMissing,
    Rejection::NoFaceMatch,
    Rejection::IdentityMismatch,
    Rejection::AmbiguousFaceMatch,
    Rejection::GeofenceViolation,
    Rejection::NetworkEvidenceInvalid,
    Rejection::DeviceMismatch,
    Rejection::DuplicateWithinDebounce,
    Rejection::SequenceConflict,
    Rejection::StateConflict,
    Rejection::TransientStoreFailure,
];

/// Response returned to the request handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub accepted: bool,
    pub event_type: Option<EventType>,
    /// Failed checks in evaluation order; empty when accepted.
    pub reasons: Vec<Rejection>,
    pub record_id: Option<Uuid>,
    pub retryable: bool,
}

impl Decision {
    pub fn accepted(event_type: EventType, record_id: Uuid) -> Self {
        Self {
            accepted: true,
            event_type: Some(event_type),
            reasons: Vec::new(),
            record_id: Some(record_id),
            retryable: false,
        }
    }

    pub fn rejected(reasons: Vec<Rejection>) -> Self {
        let retryable = !reasons.is_empty() && reasons.iter().all(Rejection::is_retryable);
        Self {
            accepted: false,
            event_type: None,
            reasons,
            record_id: None,
            retryable,
        }
    }
}
