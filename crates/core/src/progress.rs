//! Weighted progress aggregation for a tracked run.
//!
//! Every node carries an equal weight of `1 / total`. A node that has left
//! `Pending` counts with its full weight, except when it is reporting an
//! in-flight fraction, in which case only `weight * fraction` is counted.

use crate::execution::NodeStatus;

/// Decimal places kept in the reported percentage.
pub const PROGRESS_DECIMAL_PLACES: i32 = 2;

/// Percentage reported once a run has fully finished.
pub const PROGRESS_COMPLETE: f64 = 100.0;

/// Compute overall run progress as a percentage in `[0, 100]`.
///
/// * `statuses`  - status of every node in the run.
/// * `fractions` - in-flight fractions (each in `[0, 1]`), one per node
///   currently reporting step progress. Those nodes must already be counted
///   as non-`Pending` in `statuses`.
///
/// Returns `0.0` for an empty node set.
pub fn aggregate_progress<I>(statuses: I, fractions: &[f64]) -> f64
where
    I: IntoIterator<Item = NodeStatus>,
{
    let mut total = 0usize;
    let mut started = 0usize;
    for status in statuses {
        total += 1;
        if status.is_started() {
            started += 1;
        }
    }

    if total == 0 {
        return 0.0;
    }

    let weight = 1.0 / total as f64;
    let mut progress = started as f64 * weight;
    for fraction in fractions {
        progress -= weight;
        progress += weight * fraction.clamp(0.0, 1.0);
    }

    round_to_decimal_places(progress * PROGRESS_COMPLETE, PROGRESS_DECIMAL_PLACES)
        .clamp(0.0, PROGRESS_COMPLETE)
}

/// Clamp a `value / max` step report to a fraction in `[0, 1]`.
///
/// A non-positive `max` carries no information and yields `0.0`.
pub fn step_fraction(value: f64, max: f64) -> f64 {
    if max > 0.0 && value.is_finite() {
        (value / max).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Round half away from zero to `places` decimal places.
pub fn round_to_decimal_places(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    use NodeStatus::{Error, Finished, Pending, Running};

    #[test]
    fn all_pending_is_zero() {
        assert_eq!(aggregate_progress([Pending, Pending, Pending], &[]), 0.0);
    }

    #[test]
    fn all_finished_is_complete() {
        assert_eq!(aggregate_progress([Finished, Finished], &[]), 100.0);
    }

    #[test]
    fn started_nodes_count_with_full_weight() {
        assert_eq!(aggregate_progress([Running, Pending], &[]), 50.0);
        assert_eq!(aggregate_progress([Finished, Error, Pending, Pending], &[]), 50.0);
    }

    #[test]
    fn k_of_n_without_fractions() {
        for n in 1..=7usize {
            for k in 0..=n {
                let statuses: Vec<NodeStatus> = (0..n)
                    .map(|i| if i < k { Finished } else { Pending })
                    .collect();
                let expected = round_to_decimal_places(100.0 * k as f64 / n as f64, 2);
                assert_eq!(aggregate_progress(statuses, &[]), expected, "k={k} n={n}");
            }
        }
    }

    #[test]
    fn half_finished_node_contributes_half_weight() {
        assert_eq!(aggregate_progress([Running, Pending], &[0.5]), 25.0);
    }

    #[test]
    fn fraction_stays_between_neighbouring_steps() {
        let n = 3usize;
        for k in 1..=n {
            let statuses: Vec<NodeStatus> = (0..n)
                .map(|i| if i < k { Running } else { Pending })
                .collect();
            let progress = aggregate_progress(statuses, &[0.37]);
            let low = 100.0 * (k - 1) as f64 / n as f64;
            let high = 100.0 * k as f64 / n as f64;
            assert!(progress >= low - 0.01 && progress <= high + 0.01, "k={k} got {progress}");
        }
    }

    #[test]
    fn multiple_fractions_are_each_weighted() {
        // 4 nodes: two running at 0.5 and 0.25, one finished, one pending.
        let progress = aggregate_progress([Running, Running, Finished, Pending], &[0.5, 0.25]);
        assert_eq!(progress, 43.75);
    }

    #[test]
    fn result_is_rounded_to_two_places() {
        assert_eq!(aggregate_progress([Finished, Pending, Pending], &[]), 33.33);
    }

    #[test]
    fn result_never_leaves_range() {
        // A fraction reported for a node still marked pending would go negative.
        assert_eq!(aggregate_progress([Pending, Pending], &[0.5]), 0.0);
    }

    #[test]
    fn empty_node_set_is_zero() {
        assert_eq!(aggregate_progress(Vec::<NodeStatus>::new(), &[]), 0.0);
    }

    #[test]
    fn step_fraction_clamps() {
        assert_eq!(step_fraction(5.0, 10.0), 0.5);
        assert_eq!(step_fraction(12.0, 10.0), 1.0);
        assert_eq!(step_fraction(-1.0, 10.0), 0.0);
        assert_eq!(step_fraction(3.0, 0.0), 0.0);
    }
}
