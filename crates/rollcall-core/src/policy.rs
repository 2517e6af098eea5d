//! Decision policy injected by the host process.

use crate::types::{AllowedNetwork, Geofence};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_GPS_ACCURACY_M: f64 = 50.0;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
// chrono durations are bounded by i64 milliseconds
const MAX_DEBOUNCE_SECS: i64 = i64::MAX / 1_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("match_threshold must be in (0, 1], got {0}")]
    Threshold(f32),
    #[error("embedding_dim must be positive")]
    Dimension,
    #[error("store_timeout_ms must be positive")]
    Timeout,
    #[error("max_gps_accuracy_m must be positive, got {0}")]
    Accuracy(f64),
    #[error("no sites configured")]
    NoSites,
    #[error("site `{site}`: {reason}")]
    Site { site: String, reason: String },
}

/// A physical location users attend: its geofence and Wi-Fi allow-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub geofence: Geofence,
    pub allowed_networks: Vec<AllowedNetwork>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Minimum cosine similarity for a face match (T_match).
    pub match_threshold: f32,
    /// Minimum seconds between accepted events of one user.
    pub debounce_window_secs: u64,
    /// Dimension D of every embedding.
    pub embedding_dim: usize,
    #[serde(default = "default_max_gps_accuracy_m")]
    pub max_gps_accuracy_m: f64,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    pub sites: BTreeMap<String, Site>,
}

fn default_max_gps_accuracy_m() -> f64 {
    DEFAULT_MAX_GPS_ACCURACY_M
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

impl Policy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(self.match_threshold > 0.0 && self.match_threshold <= 1.0) {
            return Err(PolicyError::Threshold(self.match_threshold));
        }
        if self.embedding_dim == 0 {
            return Err(PolicyError::Dimension);
        }
        if self.store_timeout_ms == 0 {
            return Err(PolicyError::Timeout);
        }
        if !(self.max_gps_accuracy_m > 0.0) {
            return Err(PolicyError::Accuracy(self.max_gps_accuracy_m));
        }
        if self.sites.is_empty() {
            return Err(PolicyError::NoSites);
        }
        for (name, site) in &self.sites {
            let fail = |reason: &str| PolicyError::Site {
                site: name.clone(),
                reason: reason.to_string(),
            };
            match &site.geofence {
                Geofence::Circle { radius_m, .. } if !(*radius_m > 0.0) => {
                    return Err(fail("radius_m must be positive"));
                }
                Geofence::Polygon { vertices } if vertices.len() < 3 => {
                    return Err(fail("polygon needs at least 3 vertices"));
                }
                _ => {}
            }
            if site.allowed_networks.is_empty() {
                return Err(fail("allowed_networks is empty"));
            }
            if site.allowed_networks.iter().any(|n| n.identifier.is_empty()) {
                return Err(fail("network identifier is empty"));
            }
        }
        Ok(())
    }

    pub fn site(&self, name: &str) -> Option<&Site> {
        self.sites.get(name)
    }

    pub fn debounce_window(&self) -> chrono::Duration {
        let secs = i64::try_from(self.debounce_window_secs).unwrap_or(i64::MAX);
        chrono::Duration::seconds(secs.min(MAX_DEBOUNCE_SECS))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
