//! Position ranking and merging.
//!
//! Freshness beyond the window dominates; inside the window a fix with
//! accuracy beats one without, and smaller accuracy beats larger. The
//! comparator is not a total order (freshness is not transitive), so the best
//! fix is picked with a single pass instead of a sort.

use locfuse_core::types::Position;
use std::cmp::Ordering;

/// Time delta below which two fixes are compared by accuracy.
pub const FRESHNESS_WINDOW_MS: i64 = 30_000;

/// Provider tag of every merged position.
pub const FUSED_PROVIDER: &str = "network-fused";

/// Ranks two fixes; `Ordering::Greater` means `a` is better.
pub fn compare_positions(a: &Position, b: &Position, freshness_window_ms: i64) -> Ordering {
    if std::ptr::eq(a, b) {
        return Ordering::Equal;
    }
    if a.timestamp > b.timestamp.saturating_add(freshness_window_ms) {
        return Ordering::Greater;
    }
    if b.timestamp > a.timestamp.saturating_add(freshness_window_ms) {
        return Ordering::Less;
    }
    match (a.accuracy, b.accuracy) {
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
        (Some(acc_a), Some(acc_b)) => acc_b.partial_cmp(&acc_a).unwrap_or(Ordering::Equal),
    }
}

/// Merges per-backend fixes into one.
///
/// Invalid fixes are dropped. The best remaining fix (first in input order
/// among equals) becomes primary, carries every other valid fix in
/// `alternates` and is tagged [`FUSED_PROVIDER`]. Returns `None` when nothing
/// valid remains.
pub fn merge_positions(positions: Vec<Position>, freshness_window_ms: i64) -> Option<Position> {
    let mut valid: Vec<Position> = positions.into_iter().filter(Position::is_valid).collect();
    if valid.is_empty() {
        return None;
    }

    let mut best = 0;
    for candidate in 1..valid.len() {
        if compare_positions(&valid[candidate], &valid[best], freshness_window_ms)
            == Ordering::Greater
        {
            best = candidate;
        }
    }

    let mut primary = valid.remove(best);
    primary.alternates = valid
        .into_iter()
        .map(|mut alternate| {
            alternate.alternates.clear();
            alternate
        })
        .collect();
    primary.provider = FUSED_PROVIDER.to_string();
    Some(primary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(timestamp: i64, accuracy: Option<f64>) -> Position {
        let position = Position::new(48.0, 11.0, timestamp);
        match accuracy {
            Some(a) => position.with_accuracy(a),
            None => position,
        }
    }

    #[test]
    fn test_same_reference_is_equal() {
        let a = fix(1000, Some(10.0));
        assert_eq!(
            compare_positions(&a, &a, FRESHNESS_WINDOW_MS),
            Ordering::Equal
        );
    }

    #[test]
    fn test_accuracy_wins_inside_window() {
        let precise = fix(1000, Some(10.0));
        let coarse = fix(20_000, Some(50.0));
        assert_eq!(
            compare_positions(&precise, &coarse, FRESHNESS_WINDOW_MS),
            Ordering::Greater
        );
        assert_eq!(
            compare_positions(&coarse, &precise, FRESHNESS_WINDOW_MS),
            Ordering::Less
        );
    }

    #[test]
    fn test_freshness_wins_outside_window() {
        let old_precise = fix(1000, Some(5.0));
        let new_coarse = fix(40_000, Some(500.0));
        assert_eq!(
            compare_positions(&new_coarse, &old_precise, FRESHNESS_WINDOW_MS),
            Ordering::Greater
        );
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let a = fix(0, Some(5.0));
        let b = fix(30_000, Some(50.0));
        assert_eq!(
            compare_positions(&a, &b, FRESHNESS_WINDOW_MS),
            Ordering::Greater
        );
    }

    #[test]
    fn test_missing_accuracy_loses_inside_window() {
        let with = fix(1000, Some(900.0));
        let without = fix(25_000, None);
        assert_eq!(
            compare_positions(&with, &without, FRESHNESS_WINDOW_MS),
            Ordering::Greater
        );
    }

    #[test]
    fn test_same_timestamp_prefers_accuracy() {
        let merged = merge_positions(
            vec![fix(5000, Some(50.0)), fix(5000, Some(10.0))],
            FRESHNESS_WINDOW_MS,
        )
        .unwrap();

        assert_eq!(merged.accuracy, Some(10.0));
        assert_eq!(merged.alternates.len(), 1);
        assert_eq!(merged.alternates[0].accuracy, Some(50.0));
        assert_eq!(merged.provider, FUSED_PROVIDER);
    }

    #[test]
    fn test_freshness_overrides_missing_accuracy() {
        let x = fix(1000, Some(5.0));
        let y = Position::new(49.0, 12.0, 40_000);
        let merged = merge_positions(vec![x, y], FRESHNESS_WINDOW_MS).unwrap();

        assert_eq!(merged.timestamp, 40_000);
        assert_eq!(merged.accuracy, None);
        assert_eq!(merged.provider, "network-fused");
        assert_eq!(merged.alternates[0].timestamp, 1000);
    }

    #[test]
    fn test_invalid_positions_discarded() {
        let bad = Position::new(95.0, 0.0, 9000).with_accuracy(1.0);
        let good = fix(1000, Some(100.0));
        let merged = merge_positions(vec![bad, good], FRESHNESS_WINDOW_MS).unwrap();
        assert_eq!(merged.accuracy, Some(100.0));
        assert!(merged.alternates.is_empty());

        let only_bad = vec![Position::new(0.0, 0.0, 1).with_accuracy(f64::NAN)];
        assert!(merge_positions(only_bad, FRESHNESS_WINDOW_MS).is_none());
        assert!(merge_positions(Vec::new(), FRESHNESS_WINDOW_MS).is_none());
    }

    #[test]
    fn test_ties_keep_input_order() {
        let first = Position::new(1.0, 1.0, 1000).with_accuracy(20.0);
        let second = Position::new(2.0, 2.0, 1000).with_accuracy(20.0);
        let merged = merge_positions(vec![first, second], FRESHNESS_WINDOW_MS).unwrap();
        assert_eq!(merged.latitude, 1.0);
    }

    #[test]
    fn test_primary_never_less_accurate_within_window() {
        let inputs = vec![
            fix(10_000, Some(80.0)),
            fix(12_000, Some(15.0)),
            fix(9_000, None),
            fix(11_000, Some(40.0)),
            fix(30_000, Some(25.0)),
        ];
        let merged = merge_positions(inputs.clone(), FRESHNESS_WINDOW_MS).unwrap();
        let primary_accuracy = merged.accuracy.unwrap();
        for other in inputs.iter() {
            let within = (other.timestamp - merged.timestamp).abs() <= FRESHNESS_WINDOW_MS;
            if let (true, Some(acc)) = (within, other.accuracy) {
                assert!(primary_accuracy <= acc);
            }
        }
        assert_eq!(merged.alternates.len(), 4);
    }
}
