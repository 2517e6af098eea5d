//! Network evidence validation against a site's Wi-Fi allow-list.

use crate::types::{AllowedNetwork, NetworkEvidence};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkFault {
    #[error("no network identifier reported")]
    NoIdentifier,
    #[error("signal strength is not finite")]
    NonFinite,
    #[error("network not in allow-list")]
    UnknownNetwork,
    #[error("signal {rssi_dbm} dBm weaker than required {min_rssi_dbm} dBm")]
    WeakSignal { rssi_dbm: f64, min_rssi_dbm: f64 },
}

/// True if `s` looks like a MAC address (`aa:bb:cc:dd:ee:ff` or dash-separated).
fn is_bssid(s: &str) -> bool {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn normalize_bssid(s: &str) -> String {
    s.to_ascii_lowercase().replace('-', ":")
}

impl AllowedNetwork {
    /// BSSIDs compare case-insensitively, SSIDs exactly.
    pub fn identifies(&self, evidence: &NetworkEvidence) -> bool {
        if is_bssid(&self.identifier) {
            !evidence.bssid.is_empty()
                && normalize_bssid(&evidence.bssid) == normalize_bssid(&self.identifier)
        } else {
            !evidence.ssid.is_empty() && evidence.ssid == self.identifier
        }
    }
}

/// Find the allow-list entry satisfied by `evidence`.
///
/// When several entries name the reported network, any one whose minimum
/// signal is met is enough.
pub fn check<'a>(
    evidence: &NetworkEvidence,
    allowed: &'a [AllowedNetwork],
) -> Result<&'a AllowedNetwork, NetworkFault> {
    if evidence.ssid.is_empty() && evidence.bssid.is_empty() {
        return Err(NetworkFault::NoIdentifier);
    }
    if !evidence.rssi_dbm.is_finite() {
        return Err(NetworkFault::NonFinite);
    }

    let mut weakest_required: Option<f64> = None;
    for entry in allowed.iter().filter(|e| e.identifies(evidence)) {
        if evidence.rssi_dbm >= entry.min_rssi_dbm {
            return Ok(entry);
        }
        weakest_required = Some(match weakest_required {
            Some(m) => m.min(entry.min_rssi_dbm),
            None => entry.min_rssi_dbm,
        });
    }

    match weakest_required {
        Some(min_rssi_dbm) => Err(NetworkFault::WeakSignal {
            rssi_dbm: evidence.rssi_dbm,
            min_rssi_dbm,
        }),
        None => Err(NetworkFault::UnknownNetwork),
    }
}

pub fn validate(evidence: &NetworkEvidence, allowed: &[AllowedNetwork]) -> bool {
    check(evidence, allowed).is_ok()
}
