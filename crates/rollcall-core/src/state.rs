//! Per-user attendance state with one async lock per user.
//!
//! The outer map lock is held only long enough to find or create a user's
//! slot; the transition itself runs under that user's own lock, so requests
//! for different users never wait on each other.

use crate::types::{AttendanceState, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Cached state for one user. `None` means "not loaded from the store yet"
/// (or invalidated after a failed commit).
pub type StateSlot = Option<AttendanceState>;

#[derive(Default)]
pub struct StateTracker {
    slots: Mutex<HashMap<UserId, Arc<AsyncMutex<StateSlot>>>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, user: &UserId) -> Arc<AsyncMutex<StateSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry(user.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None))),
        )
    }

    /// Enter the user's critical section. The guard is owned so it can move
    /// into a spawned task.
    pub async fn acquire(&self, user: &UserId) -> OwnedMutexGuard<StateSlot> {
        self.slot(user).lock_owned().await
    }

    /// Last cached state, without waiting for an in-flight transition.
    pub fn peek(&self, user: &UserId) -> Option<AttendanceState> {
        let slot = self.slot(user);
        let guard = slot.try_lock().ok()?;
        guard.clone()
    }

    /// Drop the cached state of `user` so the next transition reloads it.
    pub async fn invalidate(&self, user: &UserId) {
        *self.acquire(user).await = None;
    }
}
