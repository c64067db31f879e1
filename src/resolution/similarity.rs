//! String similarity scoring for fuzzy cluster merging.

use std::collections::BTreeSet;

use strsim::normalized_levenshtein;

/// Combined similarity over normalized keys: the mean of the plain
/// edit-distance ratio and the token-set ratio.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    (normalized_levenshtein(a, b) + token_set_ratio(a, b)) / 2.0
}

/// Token-set ratio: compares the shared token core against each side's
/// additions, tolerant of word order and partial overlap.
fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a: BTreeSet<&str> = a.split_whitespace().collect();
    let tokens_b: BTreeSet<&str> = b.split_whitespace().collect();

    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection: Vec<&str> = tokens_a.intersection(&tokens_b).copied().collect();
    let only_a: Vec<&str> = tokens_a.difference(&tokens_b).copied().collect();
    let only_b: Vec<&str> = tokens_b.difference(&tokens_a).copied().collect();

    let core = intersection.join(" ");
    let combined_a = join_nonempty(&core, &only_a.join(" "));
    let combined_b = join_nonempty(&core, &only_b.join(" "));

    let scores = [
        normalized_levenshtein(&core, &combined_a),
        normalized_levenshtein(&core, &combined_b),
        normalized_levenshtein(&combined_a, &combined_b),
    ];

    scores.into_iter().fold(0.0, f64::max)
}

fn join_nonempty(core: &str, rest: &str) -> String {
    match (core.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => core.to_string(),
        _ => format!("{} {}", core, rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_strings() {
        assert!((similarity("john doe", "john doe") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_word_order_tolerated() {
        // Token-set score is 1.0 for reordered tokens, lifting the mean
        // well above what edit distance alone would give.
        let score = similarity("doe john", "john doe");
        assert!(score > 0.55, "score was {}", score);
        assert!((token_set_ratio("doe john", "john doe") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_near_duplicate_above_threshold() {
        let score = similarity("jonathan smithfield", "jonathon smithfield");
        assert!(score >= 0.85, "score was {}", score);
    }

    #[test]
    fn test_unrelated_below_threshold() {
        let score = similarity("acme widgets", "first national bank");
        assert!(score < 0.5, "score was {}", score);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(similarity("", ""), 0.0);
        assert!(similarity("word", "") < 0.5);
    }
}
