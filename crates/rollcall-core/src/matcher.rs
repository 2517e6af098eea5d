//! Face matcher: 1:1 verification of the claimed user combined with 1:N
//! identification over the whole gallery.

use crate::gallery::Gallery;
use crate::types::{Embedding, UserId};

/// Outcome class of a match attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchVerdict {
    /// The claimed user is the unique best match above threshold.
    Accepted,
    /// Best score in the gallery is below threshold (or the gallery is empty).
    NoMatch,
    /// A different user scored strictly higher than the claimed user.
    IdentityMismatch,
    /// Two or more users share the top score.
    Ambiguous,
    /// The claimed user has no enrolled embedding.
    NotEnrolled,
}

/// Result of matching a probe embedding against a gallery snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub verdict: MatchVerdict,
    pub accepted: bool,
    /// Best cosine similarity over the whole gallery [-1, 1].
    pub score: f32,
    /// Cosine similarity against the claimed user's own template.
    pub claimed_score: f32,
    /// Unique best match at or above threshold, if any. Never returned to
    /// the claimant; used for audit only.
    pub matched_user_id: Option<UserId>,
    /// Version of the gallery snapshot the match ran against.
    pub gallery_version: u64,
}

/// Strategy for matching a probe embedding against enrolled faces.
pub trait Matcher {
    fn identify(&self, probe: &Embedding, gallery: &Gallery, claimed: &UserId) -> MatchResult;
}

/// Cosine similarity matcher with constant-time gallery traversal.
///
/// Always iterates ALL gallery entries to prevent timing side-channels
/// that could leak gallery size or match position.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub threshold: f32,
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for CosineMatcher {
    fn identify(&self, probe: &Embedding, gallery: &Gallery, claimed: &UserId) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_id: Option<&UserId> = None;
        let mut tied = false;
        let mut claimed_sim: Option<f32> = None;

        // Constant-time: always iterate every entry, no early exit.
        // Gallery order is by user id, so ties resolve the same way every time.
        for user in gallery.iter() {
            let sim = probe.similarity(&user.embedding);
            if &user.user_id == claimed {
                claimed_sim = Some(sim);
            }
            if sim > best_sim {
                best_sim = sim;
                best_id = Some(&user.user_id);
                tied = false;
            } else if sim == best_sim {
                tied = true;
            }
        }

        let score = if best_sim == f32::NEG_INFINITY { 0.0 } else { best_sim };
        let claimed_score = claimed_sim.unwrap_or(0.0);

        let verdict = match (claimed_sim, best_id) {
            (None, _) => MatchVerdict::NotEnrolled,
            (Some(_), None) => MatchVerdict::NoMatch,
            (Some(_), Some(_)) if best_sim < self.threshold => MatchVerdict::NoMatch,
            (Some(_), Some(_)) if tied => MatchVerdict::Ambiguous,
            (Some(_), Some(best)) if best != claimed => MatchVerdict::IdentityMismatch,
            (Some(_), Some(_)) => MatchVerdict::Accepted,
        };

        let matched_user_id = match verdict {
            MatchVerdict::Accepted | MatchVerdict::IdentityMismatch => best_id.cloned(),
            _ => None,
        };

        MatchResult {
            verdict,
            accepted: verdict == MatchVerdict::Accepted,
            score,
            claimed_score,
            matched_user_id,
            gallery_version: gallery.version(),
        }
    }
}
