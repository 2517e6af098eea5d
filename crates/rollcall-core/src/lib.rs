//! rollcall-core: attendance decision engine.
//!
//! Fuses a face-embedding match, a GPS fix, Wi-Fi evidence and the bound
//! device into a single check-in/check-out decision, serialized per user,
//! and aggregates the resulting record stream into worked hours.

pub mod analytics;
pub mod decision;
pub mod device;
pub mod engine;
pub mod gallery;
pub mod geofence;
pub mod matcher;
pub mod network;
pub mod policy;
pub mod request;
pub mod state;
pub mod store;
pub mod types;

pub use analytics::{AnalyticsReport, Anomaly, AnomalyKind, DayTotal, OpenInterval};
pub use decision::{Decision, Rejection};
pub use engine::{DecisionEngine, EngineError};
pub use gallery::{EmbeddingStore, EnrollError, Gallery};
pub use matcher::{CosineMatcher, MatchResult, MatchVerdict, Matcher};
pub use policy::{Policy, PolicyError, Site};
pub use request::{AttendanceRequest, EnrollmentRequest, FaceUpdateRequest, RequestError};
pub use store::{AttendanceStore, AuditEntry, MemoryStore, StoreError, TimeRange};
pub use types::{
    AllowedNetwork, AttendanceRecord, AttendanceState, AttendanceStatus, Check, Coordinate, Embedding,
    EnrolledUser, EventType, Geofence, LatLon, NetworkEvidence, UserId,
};
