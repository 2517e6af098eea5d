//! Embedding store: versioned, copy-on-write gallery of enrolled users.
//!
//! Readers take an `Arc<Gallery>` snapshot and match against it without
//! holding any lock. Enrollment builds a new gallery and swaps it in, so a
//! match never observes a half-applied re-enrollment.

use crate::types::{Embedding, EnrolledUser, UserId};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Reasons a profile cannot enter the gallery.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding must be finite and non-zero")]
    InvalidEmbedding,
    #[error("device id must not be empty")]
    EmptyDevice,
    #[error("user id must not be empty")]
    EmptyUser,
    #[error("unknown site: {0}")]
    UnknownSite(String),
}

/// Immutable point-in-time view of all enrollments.
#[derive(Debug, Default)]
pub struct Gallery {
    version: u64,
    users: BTreeMap<UserId, Arc<EnrolledUser>>,
}

impl Gallery {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, user_id: &UserId) -> Option<&EnrolledUser> {
        self.users.get(user_id).map(Arc::as_ref)
    }

    /// Enrolled users in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &EnrolledUser> {
        self.users.values().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Publisher of gallery snapshots, fixed to one embedding dimension.
pub struct EmbeddingStore {
    dim: usize,
    current: RwLock<Arc<Gallery>>,
}

impl EmbeddingStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            current: RwLock::new(Arc::new(Gallery::default())),
        }
    }

    /// Build a store from persisted enrollments, validating each one.
    pub fn from_enrollments(dim: usize, users: Vec<EnrolledUser>) -> Result<Self, EnrollError> {
        let mut map = BTreeMap::new();
        for user in users {
            validate_profile(dim, &user)?;
            map.insert(user.user_id.clone(), Arc::new(user));
        }
        tracing::info!(users = map.len(), dim, "embedding store loaded");
        Ok(Self {
            dim,
            current: RwLock::new(Arc::new(Gallery { version: 1, users: map })),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Gallery> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    /// Check a profile without publishing it.
    pub fn validate(&self, user: &EnrolledUser) -> Result<(), EnrollError> {
        validate_profile(self.dim, user)
    }

    /// Insert or replace a user's profile and publish a new snapshot.
    pub fn publish(&self, user: EnrolledUser) -> Result<Arc<Gallery>, EnrollError> {
        validate_profile(self.dim, &user)?;
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut users = guard.users.clone();
        let user_id = user.user_id.clone();
        users.insert(user_id.clone(), Arc::new(user));
        let next = Arc::new(Gallery {
            version: guard.version + 1,
            users,
        });
        *guard = Arc::clone(&next);
        tracing::info!(user = %user_id, version = next.version, "gallery snapshot published");
        Ok(next)
    }
}

fn validate_profile(dim: usize, user: &EnrolledUser) -> Result<(), EnrollError> {
    if user.user_id.as_str().is_empty() {
        return Err(EnrollError::EmptyUser);
    }
    if user.embedding.dim() != dim {
        return Err(EnrollError::DimensionMismatch {
            expected: dim,
            actual: user.embedding.dim(),
        });
    }
    if !user.embedding.is_well_formed(dim) {
        return Err(EnrollError::InvalidEmbedding);
    }
    if user.bound_device_id.is_empty() {
        return Err(EnrollError::EmptyDevice);
    }
    Ok(())
}
