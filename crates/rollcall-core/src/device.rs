//! Device binding guard.
//!
//! A request must come from the exact device bound at enrollment. There is
//! no fallback and no automatic rebinding on this path.

/// Exact, constant-time comparison of the reported device id against the
/// bound one. An empty id never matches.
pub fn validate(reported: &str, bound: &str) -> bool {
    let (a, b) = (reported.as_bytes(), bound.as_bytes());
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return false;
    }
    let diff = a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_only() {
        assert!(validate("D1", "D1"));
        assert!(!validate("D2", "D1"));
        assert!(!validate("d1", "D1"));
        assert!(!validate("D1 ", "D1"));
    }

    #[test]
    fn test_empty_never_matches() {
        assert!(!validate("", ""));
        assert!(!validate("", "D1"));
    }
}
