//! Deep-match quality scoring.
//!
//! The score ranks candidates for inspection and prompt construction. It is
//! never used as acceptance confidence.

const UNIQUE_MULTIPLIER: f64 = 2.0;
const AMBIGUOUS_FLOOR: f64 = 0.7;
const SIMPLICITY_CEILING: usize = 5;

/// 2.0 for a unique mapping, decaying as `0.7 + 1.3 / n` toward 0.7.
pub fn ambiguity_multiplier(num_valid_mappings: usize) -> f64 {
    if num_valid_mappings <= 1 {
        UNIQUE_MULTIPLIER
    } else {
        AMBIGUOUS_FLOOR + (UNIQUE_MULTIPLIER - AMBIGUOUS_FLOOR) / num_valid_mappings as f64
    }
}

pub fn simplicity_bonus(num_valid_mappings: usize) -> f64 {
    SIMPLICITY_CEILING.saturating_sub(num_valid_mappings) as f64
}

/// `bm25 * ambiguity_multiplier * value_match_quality + simplicity_bonus`
pub fn deep_match_quality(bm25_score: f64, value_match_quality: f64, num_valid_mappings: usize) -> f64 {
    let bm25 = if bm25_score.is_finite() { bm25_score } else { 0.0 };
    bm25 * ambiguity_multiplier(num_valid_mappings) * value_match_quality
        + simplicity_bonus(num_valid_mappings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_multiplier_calibration() {
        assert!(close(ambiguity_multiplier(0), 2.0));
        assert!(close(ambiguity_multiplier(1), 2.0));
        assert!(close(ambiguity_multiplier(2), 1.35));
        assert!(close(ambiguity_multiplier(4), 1.025));
        assert!(close(ambiguity_multiplier(13), 0.8));
        assert!(ambiguity_multiplier(10_000) > 0.7);
        assert!(ambiguity_multiplier(10_000) < 0.71);
    }

    #[test]
    fn test_multiplier_is_monotonic() {
        let mut previous = ambiguity_multiplier(1);
        for n in 2..200 {
            let current = ambiguity_multiplier(n);
            assert!(current < previous, "m({}) = {} not below {}", n, current, previous);
            previous = current;
        }
    }

    #[test]
    fn test_simplicity_bonus() {
        assert_eq!(simplicity_bonus(1), 4.0);
        assert_eq!(simplicity_bonus(5), 0.0);
        assert_eq!(simplicity_bonus(9), 0.0);
    }

    #[test]
    fn test_deep_match_quality() {
        assert!(close(deep_match_quality(0.5, 1.0, 1), 0.5 * 2.0 + 4.0));
        assert!(close(deep_match_quality(0.5, 0.8, 2), 0.5 * 1.35 * 0.8 + 3.0));
        assert!(close(deep_match_quality(f64::NAN, 1.0, 1), 4.0));
    }

    #[test]
    fn test_unique_outranks_ambiguous() {
        assert!(deep_match_quality(0.6, 0.9, 1) > deep_match_quality(0.6, 0.9, 3));
    }
}
