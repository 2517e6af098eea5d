//! Request schemas accepted by the engine.
//!
//! Every field is required unless its type is `Option`. Parsing never fills
//! in defaults for evidence, and unknown fields are rejected.

use crate::types::{Coordinate, Embedding, EventType, NetworkEvidence, UserId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Parse(String),
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("probe embedding has {actual} dimensions, expected {expected}")]
    EmbeddingDimension { expected: usize, actual: usize },
    #[error("field `{0}` contains non-finite or all-zero values")]
    NonFinite(&'static str),
}

fn parse<T: DeserializeOwned>(json: &str) -> Result<T, RequestError> {
    serde_json::from_str(json).map_err(|e| RequestError::Parse(e.to_string()))
}

fn check_embedding(embedding: &Embedding, dim: usize) -> Result<(), RequestError> {
    if embedding.dim() != dim {
        return Err(RequestError::EmbeddingDimension {
            expected: dim,
            actual: embedding.dim(),
        });
    }
    if !embedding.is_well_formed(dim) {
        return Err(RequestError::NonFinite("embedding"));
    }
    Ok(())
}

/// An attendance submission from an authenticated client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttendanceRequest {
    pub claimed_user_id: UserId,
    pub probe_embedding: Embedding,
    pub coordinate: Coordinate,
    pub network: NetworkEvidence,
    pub device_id: String,
    pub client_timestamp: DateTime<Utc>,
    /// Event the user meant to record. When present it must agree with the
    /// state machine.
    #[serde(default)]
    pub intended_event: Option<EventType>,
}

impl AttendanceRequest {
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        parse(json)
    }

    /// Structural checks only. GPS and network plausibility belong to the
    /// validators and surface as their own rejections.
    pub fn validate(&self, dim: usize) -> Result<(), RequestError> {
        if self.claimed_user_id.as_str().is_empty() {
            return Err(RequestError::EmptyField("claimed_user_id"));
        }
        if self.device_id.is_empty() {
            return Err(RequestError::EmptyField("device_id"));
        }
        check_embedding(&self.probe_embedding, dim)
    }
}

/// Administrative enrollment (or full re-enrollment) of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrollmentRequest {
    pub user_id: UserId,
    pub embedding: Embedding,
    pub device_id: String,
    /// Policy site supplying the geofence and network allow-list.
    pub site: String,
}

impl EnrollmentRequest {
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        parse(json)
    }
}

/// Replace the face template of an enrolled user, gated on presence checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaceUpdateRequest {
    pub user_id: UserId,
    pub embedding: Embedding,
    pub coordinate: Coordinate,
    pub network: NetworkEvidence,
    pub device_id: String,
}

impl FaceUpdateRequest {
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        parse(json)
    }
}
