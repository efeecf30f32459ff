//! Round aggregation: folding store-local patterns into global patterns.
//!
//! Aggregation is a pure fold over store contributions so the coordinator
//! can compute it deterministically and the same math is testable without a
//! database. Differential-privacy noise is applied afterwards, see
//! [`privacy`].

use std::collections::{BTreeMap, BTreeSet};

pub mod privacy;

/// One store's input to a round: its unattributed local patterns plus the
/// size of its transaction database (the weight in the global support
/// average).
#[derive(Clone, Debug)]
pub struct StoreContribution {
    pub store_id: String,
    pub database_size: u64,
    pub patterns: Vec<ContributedPattern>,
}

#[derive(Clone, Debug)]
pub struct ContributedPattern {
    /// Item ids, sorted ascending (the canonical itemset identity).
    pub items: Vec<i64>,
    pub utility: f64,
    /// Support as a fraction of the store's transaction count.
    pub support: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedPattern {
    pub items: Vec<i64>,
    pub aggregated_utility: f64,
    pub global_support: f64,
    pub contributing_stores: u64,
}

#[derive(Debug, Default)]
struct PatternAccumulator {
    utility: f64,
    /// `Σ support_k · |D_k|`, i.e. the absolute number of transactions
    /// containing the itemset across contributing stores.
    weighted_support: f64,
    stores: BTreeSet<String>,
}

/// Partial aggregate over any subset of the round's contributions.
///
/// Folding is associative: merging the states of two disjoint store
/// partitions equals folding all stores into one state, which is what makes
/// re-running collection deterministic and incremental.
#[derive(Debug, Default)]
pub struct AggregationState {
    groups: BTreeMap<Vec<i64>, PatternAccumulator>,
    total_database_size: u64,
}

impl AggregationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold(&mut self, contribution: &StoreContribution) {
        self.total_database_size += contribution.database_size;

        for pattern in &contribution.patterns {
            let group = self.groups.entry(pattern.items.clone()).or_default();
            group.utility += pattern.utility;
            group.weighted_support +=
                pattern.support * contribution.database_size as f64;
            group.stores.insert(contribution.store_id.clone());
        }
    }

    pub fn merge(&mut self, other: AggregationState) {
        self.total_database_size += other.total_database_size;
        for (items, accumulator) in other.groups {
            let group = self.groups.entry(items).or_default();
            group.utility += accumulator.utility;
            group.weighted_support += accumulator.weighted_support;
            group.stores.extend(accumulator.stores);
        }
    }

    /// Finish the fold: global support is the weighted average
    /// `Σ support_k · |D_k| / Σ |D_k|` over all participating stores.
    /// Output is ordered by aggregated utility descending, itemset ascending
    /// on ties.
    pub fn finish(self) -> Vec<AggregatedPattern> {
        let total = self.total_database_size as f64;

        let mut patterns: Vec<AggregatedPattern> = self
            .groups
            .into_iter()
            .map(|(items, accumulator)| AggregatedPattern {
                items,
                aggregated_utility: accumulator.utility,
                global_support: if total > 0.0 {
                    accumulator.weighted_support / total
                } else {
                    0.0
                },
                contributing_stores: accumulator.stores.len() as u64,
            })
            .collect();

        patterns.sort_by(|a, b| {
            b.aggregated_utility
                .total_cmp(&a.aggregated_utility)
                .then_with(|| a.items.cmp(&b.items))
        });
        patterns
    }
}

/// Aggregate a full round's contributions in one shot.
pub fn aggregate(contributions: &[StoreContribution]) -> Vec<AggregatedPattern> {
    let mut state = AggregationState::new();
    for contribution in contributions {
        state.fold(contribution);
    }
    state.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(items: &[i64], utility: f64, support: f64) -> ContributedPattern {
        ContributedPattern {
            items: items.to_vec(),
            utility,
            support,
        }
    }

    fn two_store_round() -> Vec<StoreContribution> {
        vec![
            StoreContribution {
                store_id: "s1".into(),
                database_size: 3,
                patterns: vec![
                    pattern(&[2], 30.0, 2.0 / 3.0),
                    pattern(&[2, 3], 37.0, 2.0 / 3.0),
                ],
            },
            StoreContribution {
                store_id: "s2".into(),
                database_size: 2,
                patterns: vec![pattern(&[2], 12.0, 0.5), pattern(&[1, 2], 25.0, 0.5)],
            },
        ]
    }

    #[test]
    fn patterns_group_by_canonical_itemset() {
        let aggregated = aggregate(&two_store_round());

        assert_eq!(aggregated.len(), 3);

        // Ordered by utility descending.
        assert_eq!(aggregated[0].items, vec![2]);
        assert_eq!(aggregated[0].aggregated_utility, 42.0);
        assert_eq!(aggregated[0].contributing_stores, 2);

        assert_eq!(aggregated[1].items, vec![2, 3]);
        assert_eq!(aggregated[1].aggregated_utility, 37.0);
        assert_eq!(aggregated[1].contributing_stores, 1);

        assert_eq!(aggregated[2].items, vec![1, 2]);
        assert_eq!(aggregated[2].aggregated_utility, 25.0);
        assert_eq!(aggregated[2].contributing_stores, 1);
    }

    #[test]
    fn global_support_is_the_weighted_average() {
        let aggregated = aggregate(&two_store_round());

        // {2}: 2 of 3 transactions at s1, 1 of 2 at s2 -> 3 of 5 overall.
        let b = aggregated.iter().find(|p| p.items == vec![2]).unwrap();
        assert!((b.global_support - 3.0 / 5.0).abs() < 1e-12);

        // {2,3}: 2 of 3 at s1, absent at s2 -> 2 of 5 overall.
        let bc = aggregated.iter().find(|p| p.items == vec![2, 3]).unwrap();
        assert!((bc.global_support - 2.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn folding_is_associative_over_store_partitions() {
        let contributions = two_store_round();
        let third = StoreContribution {
            store_id: "s3".into(),
            database_size: 5,
            patterns: vec![pattern(&[2], 8.0, 0.2), pattern(&[4], 50.0, 0.8)],
        };

        let mut all_at_once = AggregationState::new();
        for contribution in contributions.iter().chain([&third]) {
            all_at_once.fold(contribution);
        }

        let mut first_two = AggregationState::new();
        first_two.fold(&contributions[0]);
        first_two.fold(&contributions[1]);
        let mut rest = AggregationState::new();
        rest.fold(&third);
        first_two.merge(rest);

        assert_eq!(all_at_once.finish(), first_two.finish());
    }

    #[test]
    fn empty_round_aggregates_to_nothing() {
        assert!(aggregate(&[]).is_empty());
    }

    #[test]
    fn store_with_no_patterns_still_weights_the_denominator() {
        let mut contributions = two_store_round();
        contributions.push(StoreContribution {
            store_id: "s3".into(),
            database_size: 5,
            patterns: vec![],
        });

        let aggregated = aggregate(&contributions);
        let b = aggregated.iter().find(|p| p.items == vec![2]).unwrap();
        assert!((b.global_support - 3.0 / 10.0).abs() < 1e-12);
    }
}
