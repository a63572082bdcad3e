//! Pure functions backing the dedup-aware memory store. Kept free of any I/O
//! so the conflict-resolution branch logic can be exercised directly.
use std::collections::HashSet;

use crate::types::Resolution;

/// Below this similarity, two memories are considered unrelated and the new
/// one is inserted outright.
pub const DEDUP_THRESHOLD: f64 = 0.85;

/// At or above this similarity, a match merges without the extra checks that
/// apply in the 0.85..0.95 band.
pub const AUTO_MERGE_THRESHOLD: f64 = 0.95;

/// Token-overlap (Jaccard) similarity over lowercased word sets. Cheap,
/// deterministic, and good enough to gate the merge-vs-flag decision — no
/// embedding model is required to compute it.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let sa: HashSet<&str> = a.split_whitespace().collect();
    let sb: HashSet<&str> = b.split_whitespace().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Classify how a near-duplicate memory should be resolved against an
/// existing candidate.
///
/// Branch order (first match wins), mirroring the store's merge policy:
/// 1. `similarity >= AUTO_MERGE_THRESHOLD` → merge
/// 2. same `source_agent` → merge (an agent correcting or restating itself)
/// 3. different `visibility` → keep both (never silently narrow or widen
///    who can see a fact)
/// 4. length ratio more than 2x either way → flag for user review
/// 5. otherwise → merge
pub fn resolve_conflict(
    similarity: f64,
    same_source_agent: bool,
    same_visibility: bool,
    new_len: usize,
    existing_len: usize,
) -> Resolution {
    if similarity >= AUTO_MERGE_THRESHOLD {
        return Resolution::Merge;
    }
    if same_source_agent {
        return Resolution::Merge;
    }
    if !same_visibility {
        return Resolution::KeepBoth;
    }
    let ratio = if existing_len == 0 {
        f64::INFINITY
    } else {
        new_len as f64 / existing_len as f64
    };
    if ratio > 2.0 || ratio < 0.5 {
        return Resolution::FlagForUser;
    }
    Resolution::Merge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_is_fully_similar() {
        assert_eq!(text_similarity("the cat sat", "the cat sat"), 1.0);
    }

    #[test]
    fn disjoint_text_is_not_similar() {
        assert_eq!(text_similarity("alpha beta", "gamma delta"), 0.0);
    }

    #[test]
    fn high_similarity_always_merges() {
        let r = resolve_conflict(0.96, false, false, 50, 10);
        assert_eq!(r, Resolution::Merge);
    }

    #[test]
    fn same_agent_merges_even_at_low_similarity() {
        let r = resolve_conflict(0.86, true, true, 50, 10);
        assert_eq!(r, Resolution::Merge);
    }

    #[test]
    fn different_visibility_keeps_both() {
        let r = resolve_conflict(0.9, false, false, 20, 18);
        assert_eq!(r, Resolution::KeepBoth);
    }

    #[test]
    fn wildly_different_length_flags_for_review() {
        let r = resolve_conflict(0.88, false, true, 200, 20);
        assert_eq!(r, Resolution::FlagForUser);
    }

    #[test]
    fn comparable_length_merges_by_default() {
        let r = resolve_conflict(0.88, false, true, 30, 25);
        assert_eq!(r, Resolution::Merge);
    }
}
