use serde::{Deserialize, Serialize};

use crate::extract::Role;

/// Thresholds for deciding whether a freshly extracted fragment is a
/// re-render of an existing message. Both values are empirical; callers may
/// tune them rather than relying on the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityConfig {
    /// Substring rule: shorter/longer length ratio must be at least this.
    pub min_length_ratio: f64,
    /// Edit-distance rule: 1 - distance/max_len must be at least this.
    pub min_edit_similarity: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            min_length_ratio: 0.9,
            min_edit_similarity: 0.95,
        }
    }
}

/// Collapse whitespace runs to single spaces, drop carriage returns, trim.
///
/// Terminal re-renders reflow line wraps and pad lines with spaces, so all
/// similarity checks run on normalized text.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for ch in text.chars() {
        if ch == '\r' {
            continue;
        }
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out.trim().to_string()
}

/// Levenshtein distance with a single rolling row (O(min(len)) memory).
/// Operates on chars; inputs are full-screen-sized strings, which is
/// acceptable because comparison only ever happens against a bounded
/// lookback window, never the whole history.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let (short, long): (Vec<char>, Vec<char>) = {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        if a.len() <= b.len() {
            (a, b)
        } else {
            (b, a)
        }
    };

    if short.is_empty() {
        return long.len();
    }

    let mut row: Vec<usize> = (0..=short.len()).collect();
    for (i, lc) in long.iter().enumerate() {
        let mut prev_diag = row[0];
        row[0] = i + 1;
        for (j, sc) in short.iter().enumerate() {
            let cost = if lc == sc { 0 } else { 1 };
            let next = (prev_diag + cost).min(row[j] + 1).min(row[j + 1] + 1);
            prev_diag = row[j + 1];
            row[j + 1] = next;
        }
    }
    row[short.len()]
}

/// Edit-distance similarity in [0, 1]: 1 - distance / max(len).
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Decide whether `candidate` is a continuation/duplicate re-render of
/// `existing` rather than a genuinely new turn.
pub fn are_similar(
    existing_role: Role,
    existing: &str,
    candidate_role: Role,
    candidate: &str,
    config: &SimilarityConfig,
) -> bool {
    if existing_role != candidate_role {
        return false;
    }

    let a = normalize(existing);
    let b = normalize(candidate);

    if a == b {
        return true;
    }

    // A more-complete re-render of the same turn contains the earlier render
    // as a prefix/substring and is nearly the same length.
    let (shorter, longer) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if !shorter.is_empty() && longer.contains(shorter.as_str()) {
        let ratio = shorter.chars().count() as f64 / longer.chars().count() as f64;
        if ratio >= config.min_length_ratio {
            return true;
        }
    }

    similarity(&a, &b) >= config.min_edit_similarity
}

/// Linear scan for the first existing message similar to `candidate`.
pub fn find_similar_index(
    candidate_role: Role,
    candidate: &str,
    existing: &[(Role, String)],
    config: &SimilarityConfig,
) -> Option<usize> {
    existing.iter().position(|(role, content)| {
        are_similar(*role, content, candidate_role, candidate, config)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize("  hello   world \r\n"), "hello world");
        assert_eq!(normalize("a\tb\nc"), "a b c");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        for s in ["  a \r b  ", "hello", "", "x\n\n\ny"] {
            let once = normalize(s);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_similarity_range() {
        assert!((similarity("", "") - 1.0).abs() < f64::EPSILON);
        assert!((similarity("abcd", "abcd") - 1.0).abs() < f64::EPSILON);
        assert!(similarity("abcd", "wxyz") < 0.01);
    }

    #[test]
    fn test_are_similar_role_mismatch() {
        let cfg = SimilarityConfig::default();
        assert!(!are_similar(Role::User, "hello", Role::Assistant, "hello", &cfg));
    }

    #[test]
    fn test_are_similar_exact_after_normalize() {
        let cfg = SimilarityConfig::default();
        assert!(are_similar(
            Role::User,
            "build   the\r\nthing",
            Role::User,
            "build the thing",
            &cfg
        ));
    }

    #[test]
    fn test_are_similar_substring_growth() {
        let cfg = SimilarityConfig::default();
        // A longer re-render that contains the earlier one, length ratio >= 0.9.
        let short = "the quick brown fox jumps over the lazy dog";
        let long = "the quick brown fox jumps over the lazy dog tod";
        assert!(are_similar(Role::Assistant, short, Role::Assistant, long, &cfg));

        // Substring but far too short: a genuinely different amount of content.
        assert!(!are_similar(Role::Assistant, "the quick", Role::Assistant, long, &cfg));
    }

    #[test]
    fn test_are_similar_edit_distance() {
        let cfg = SimilarityConfig::default();
        // One char drifted out of 50 -> similarity 0.98.
        let a = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab";
        let b = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaac";
        assert!(are_similar(Role::User, a, Role::User, b, &cfg));

        assert!(!are_similar(Role::User, "deploy to prod", Role::User, "run the tests", &cfg));
    }

    #[test]
    fn test_are_similar_symmetry() {
        let cfg = SimilarityConfig::default();
        let pairs = [
            ("build", "build please"),
            ("hello world", "hello world"),
            ("one thing", "another thing entirely"),
            ("", "x"),
        ];
        for (a, b) in pairs {
            assert_eq!(
                are_similar(Role::User, a, Role::User, b, &cfg),
                are_similar(Role::User, b, Role::User, a, &cfg),
                "symmetry failed for {:?} / {:?}",
                a,
                b
            );
        }
    }

    #[test]
    fn test_find_similar_index_first_match() {
        let cfg = SimilarityConfig::default();
        let existing = vec![
            (Role::User, "run the tests".to_string()),
            (Role::Assistant, "running tests now".to_string()),
            (Role::User, "run the tests".to_string()),
        ];
        assert_eq!(
            find_similar_index(Role::User, "run the tests", &existing, &cfg),
            Some(0)
        );
        assert_eq!(
            find_similar_index(Role::System, "run the tests", &existing, &cfg),
            None
        );
    }
}
