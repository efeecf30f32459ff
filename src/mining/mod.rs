//! High-utility itemset mining with UP-Growth over a pseudo-projected
//! UP-Tree.
//!
//! The engine is a pure, synchronous computation: two passes over the
//! transactions build the tree (TWU filtering plus the DGU/DGN utility
//! reorganizations), and a third pass mines it by narrowing projections over
//! the master tree instead of constructing conditional trees.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

pub mod cache;
mod projection;
mod tree;

pub use cache::CacheSizes;

use cache::EngineCaches;
use projection::PathProjection;
use tree::UpTree;

/// A transaction as the engine consumes it: parallel item, quantity and
/// per-unit utility arrays.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub items: Vec<i64>,
    pub quantities: Vec<f64>,
    pub unit_utilities: Vec<f64>,
}

impl Transaction {
    /// Total transaction utility `TU(T)`.
    pub fn utility(&self) -> f64 {
        self.quantities
            .iter()
            .zip(&self.unit_utilities)
            .map(|(q, p)| q * p)
            .sum()
    }
}

#[derive(Clone, Debug)]
pub struct MiningParams {
    pub min_utility: f64,
    /// Minimum support as a fraction of the transaction count.
    pub min_support: Option<f64>,
    pub max_length: Option<usize>,
    /// When unset, the TWU filter and all bound-based cutoffs are skipped;
    /// output is identical, only slower.
    pub use_pruning: bool,
    pub cache_sizes: CacheSizes,
}

impl MiningParams {
    pub fn new(min_utility: f64) -> Self {
        Self {
            min_utility,
            min_support: None,
            max_length: None,
            use_pruning: true,
            cache_sizes: CacheSizes::default(),
        }
    }
}

/// An itemset whose exact dataset utility met the threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct MinedPattern {
    /// Item ids, sorted ascending.
    pub items: Vec<i64>,
    pub utility: f64,
    /// Number of transactions containing the itemset.
    pub support: u64,
}

#[derive(Debug, Error)]
pub enum MiningError {
    #[error(
        "transaction {index} has mismatched arrays: {items} items, \
         {quantities} quantities, {unit_utilities} unit utilities"
    )]
    RaggedTransaction {
        index: usize,
        items: usize,
        quantities: usize,
        unit_utilities: usize,
    },
    #[error("transaction {index}, item {item}: negative or non-finite value")]
    InvalidValue { index: usize, item: i64 },
}

/// Reorganized transaction: `(rank, exact utility)` pairs sorted by rank
/// ascending, duplicates merged. Ranks index the global TWU-descending item
/// order.
pub(crate) type ReorgTransaction = Vec<(u32, f64)>;

/// Mine all itemsets whose exact utility meets `params.min_utility`.
///
/// Output ordering is unspecified; callers sort. Deterministic for a fixed
/// input ordering: ties in TWU break by item id ascending.
pub fn mine(
    transactions: &[Transaction],
    params: &MiningParams,
) -> Result<Vec<MinedPattern>, MiningError> {
    validate(transactions)?;

    // Pass 1: global TWU per item.
    let mut twu: BTreeMap<i64, f64> = BTreeMap::new();
    for transaction in transactions {
        let tu = transaction.utility();
        for &item in &transaction.items {
            *twu.entry(item).or_insert(0.0) += tu;
        }
    }

    // DGU: discard items that cannot reach the threshold in any superset.
    let mut retained: Vec<(i64, f64)> = twu
        .into_iter()
        .filter(|&(_, item_twu)| !params.use_pruning || item_twu >= params.min_utility)
        .collect();
    retained.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let items: Vec<i64> = retained.into_iter().map(|(item, _)| item).collect();
    let ranks: BTreeMap<i64, u32> = items
        .iter()
        .enumerate()
        .map(|(rank, &item)| (item, rank as u32))
        .collect();

    // Pass 2: reorganize transactions and build the tree. Duplicate items in
    // a transaction merge; survivors sort into the global rank order so the
    // DGN residual at each node stays an upper bound.
    let mut reorg: Vec<ReorgTransaction> = Vec::with_capacity(transactions.len());
    let mut tree = UpTree::with_items(items.len());

    for transaction in transactions {
        let mut merged: BTreeMap<u32, f64> = BTreeMap::new();
        for ((&item, &quantity), &unit) in transaction
            .items
            .iter()
            .zip(&transaction.quantities)
            .zip(&transaction.unit_utilities)
        {
            if let Some(&rank) = ranks.get(&item) {
                *merged.entry(rank).or_insert(0.0) += quantity * unit;
            }
        }

        let path: ReorgTransaction = merged.into_iter().collect();
        let tx_id = reorg.len() as u32;
        tree.insert_transaction(tx_id, &path);
        reorg.push(path);
    }

    debug!(
        transactions = transactions.len(),
        promising_items = items.len(),
        tree_nodes = tree.len(),
        "built utility tree"
    );

    let min_support_count = match params.min_support {
        Some(fraction) => (fraction * transactions.len() as f64).ceil() as u64,
        None => 0,
    };

    // Pass 3: mine suffixes from least-TWU item upwards.
    let mut miner = Miner {
        tree,
        reorg,
        items,
        params,
        min_support_count,
        caches: EngineCaches::new(params.cache_sizes),
        patterns: Vec::new(),
    };

    for rank in (0..miner.items.len() as u32).rev() {
        let key = miner.canonical_items(&[rank]);
        let projection = match miner.caches.cached_projection(&key) {
            Some(projection) => projection,
            None => {
                let projection = PathProjection::for_item(&miner.tree, rank);
                miner.caches.record_projection(key, projection.clone());
                projection
            }
        };

        let mut suffix = vec![rank];
        miner.grow(&mut suffix, projection);
    }

    Ok(miner.patterns)
}

struct Miner<'a> {
    tree: UpTree,
    reorg: Vec<ReorgTransaction>,
    items: Vec<i64>,
    params: &'a MiningParams,
    min_support_count: u64,
    caches: EngineCaches,
    patterns: Vec<MinedPattern>,
}

impl Miner<'_> {
    fn canonical_items(&self, ranks: &[u32]) -> Vec<i64> {
        let mut items: Vec<i64> = ranks
            .iter()
            .map(|&rank| self.items[rank as usize])
            .collect();
        items.sort_unstable();
        items
    }

    /// Recursively extend `suffix` with prefix items from `projection`.
    /// `suffix` holds ranks in strictly decreasing insertion order, so the
    /// candidate set at each level is bounded by the last chosen rank and
    /// every itemset is enumerated exactly once.
    fn grow(&mut self, suffix: &mut Vec<u32>, projection: PathProjection) {
        let key = self.canonical_items(suffix);

        if projection.exact_utility >= self.params.min_utility
            && projection.support >= self.min_support_count
            && self.caches.mark_emitted(key.clone())
        {
            self.patterns.push(MinedPattern {
                items: key.clone(),
                utility: projection.exact_utility,
                support: projection.support,
            });
        }

        let bound = projection.residual_bound();
        self.caches.record_bound(key, bound);
        if self.params.use_pruning && bound < self.params.min_utility {
            return;
        }
        if let Some(max_length) = self.params.max_length {
            if suffix.len() >= max_length {
                return;
            }
        }

        let last = *suffix.last().expect("suffix is never empty");
        for (beta, local_twu) in projection.local_twu(&self.tree, last) {
            // Local DGU over the projection.
            if self.params.use_pruning && local_twu < self.params.min_utility {
                continue;
            }

            suffix.push(beta);
            let child_key = self.canonical_items(suffix);

            if self.params.use_pruning {
                if let Some(cached) = self.caches.cached_bound(&child_key) {
                    if cached < self.params.min_utility {
                        suffix.pop();
                        continue;
                    }
                }
            }

            let narrowed = match self.caches.cached_projection(&child_key) {
                Some(narrowed) => narrowed,
                None => {
                    let narrowed = projection.narrow(&self.tree, &self.reorg, beta);
                    self.caches
                        .record_projection(child_key, narrowed.clone());
                    narrowed
                }
            };

            if !narrowed.is_empty() {
                self.grow(suffix, narrowed);
            }
            suffix.pop();
        }
    }
}

fn validate(transactions: &[Transaction]) -> Result<(), MiningError> {
    for (index, transaction) in transactions.iter().enumerate() {
        if transaction.items.len() != transaction.quantities.len()
            || transaction.items.len() != transaction.unit_utilities.len()
        {
            return Err(MiningError::RaggedTransaction {
                index,
                items: transaction.items.len(),
                quantities: transaction.quantities.len(),
                unit_utilities: transaction.unit_utilities.len(),
            });
        }

        for ((&item, &quantity), &unit) in transaction
            .items
            .iter()
            .zip(&transaction.quantities)
            .zip(&transaction.unit_utilities)
        {
            if !quantity.is_finite() || !unit.is_finite() || quantity < 0.0 || unit < 0.0 {
                return Err(MiningError::InvalidValue { index, item });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    fn tx(entries: &[(i64, f64, f64)]) -> Transaction {
        Transaction {
            items: entries.iter().map(|e| e.0).collect(),
            quantities: entries.iter().map(|e| e.1).collect(),
            unit_utilities: entries.iter().map(|e| e.2).collect(),
        }
    }

    // Utilities A=3/unit, B=10/unit, C=1/unit:
    //   T0: 2A 1B 3C (TU 19)   T1: 1A 2C (TU 5)   T2: 2B 4C (TU 24)
    fn worked_example() -> Vec<Transaction> {
        vec![
            tx(&[(1, 2.0, 3.0), (2, 1.0, 10.0), (3, 3.0, 1.0)]),
            tx(&[(1, 1.0, 3.0), (3, 2.0, 1.0)]),
            tx(&[(2, 2.0, 10.0), (3, 4.0, 1.0)]),
        ]
    }

    fn by_items(patterns: Vec<MinedPattern>) -> BTreeMap<Vec<i64>, (f64, u64)> {
        patterns
            .into_iter()
            .map(|p| (p.items, (p.utility, p.support)))
            .collect()
    }

    #[test]
    fn worked_example_finds_exactly_the_high_utility_sets() {
        let patterns = mine(&worked_example(), &MiningParams::new(20.0)).unwrap();
        let patterns = by_items(patterns);

        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[&vec![2]], (30.0, 2));
        assert_eq!(patterns[&vec![2, 3]], (37.0, 2));
    }

    #[test]
    fn globally_unpromising_items_never_appear_in_output() {
        // Item 9 only occurs in a transaction of TU 5; with the threshold at
        // 20 it is discarded in pass 1.
        let mut transactions = worked_example();
        transactions.push(tx(&[(9, 1.0, 5.0)]));

        let patterns = mine(&transactions, &MiningParams::new(20.0)).unwrap();
        assert!(patterns.iter().all(|p| !p.items.contains(&9)));
    }

    #[test]
    fn zero_threshold_returns_every_occurring_itemset() {
        let patterns = mine(&worked_example(), &MiningParams::new(0.0)).unwrap();
        let patterns = by_items(patterns);

        // Distinct itemsets occurring in at least one transaction:
        // {1} {2} {3} {1,2} {1,3} {2,3} {1,2,3}
        assert_eq!(patterns.len(), 7);
        assert_eq!(patterns[&vec![3]], (9.0, 3));
        assert_eq!(patterns[&vec![1, 2, 3]], (19.0, 1));
    }

    #[test]
    fn empty_database_mines_to_nothing() {
        let patterns = mine(&[], &MiningParams::new(0.0)).unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn single_item_transactions_threshold_on_total_utility() {
        let transactions = vec![
            tx(&[(1, 2.0, 5.0)]),
            tx(&[(1, 1.0, 5.0)]),
            tx(&[(2, 1.0, 4.0)]),
        ];

        let patterns = by_items(mine(&transactions, &MiningParams::new(10.0)).unwrap());
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[&vec![1]], (15.0, 2));
    }

    #[test]
    fn duplicate_items_within_a_transaction_merge() {
        let transactions = vec![tx(&[(1, 2.0, 3.0), (1, 1.0, 3.0)])];

        let patterns = by_items(mine(&transactions, &MiningParams::new(0.0)).unwrap());
        assert_eq!(patterns[&vec![1]], (9.0, 1));
    }

    #[test]
    fn max_length_caps_pattern_size() {
        let params = MiningParams {
            max_length: Some(1),
            ..MiningParams::new(0.0)
        };

        let patterns = mine(&worked_example(), &params).unwrap();
        assert!(patterns.iter().all(|p| p.items.len() == 1));
        assert_eq!(patterns.len(), 3);
    }

    #[test]
    fn min_support_filters_rare_itemsets() {
        let params = MiningParams {
            min_support: Some(0.5),
            ..MiningParams::new(0.0)
        };

        // Support 1 of 3 transactions is below the 0.5 fraction.
        let patterns = by_items(mine(&worked_example(), &params).unwrap());
        assert!(!patterns.contains_key(&vec![1, 2, 3]));
        assert!(patterns.contains_key(&vec![2, 3]));
    }

    #[test]
    fn disabling_pruning_does_not_change_the_result() {
        let pruned = by_items(mine(&worked_example(), &MiningParams::new(20.0)).unwrap());

        let params = MiningParams {
            use_pruning: false,
            ..MiningParams::new(20.0)
        };
        let unpruned = by_items(mine(&worked_example(), &params).unwrap());

        assert_eq!(pruned, unpruned);
    }

    #[test]
    fn equal_inputs_yield_equal_outputs() {
        let first = mine(&worked_example(), &MiningParams::new(0.0)).unwrap();
        let second = mine(&worked_example(), &MiningParams::new(0.0)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ragged_transaction_is_rejected_before_mining() {
        let broken = Transaction {
            items: vec![1, 2],
            quantities: vec![1.0],
            unit_utilities: vec![1.0, 1.0],
        };

        let err = mine(&[broken], &MiningParams::new(0.0)).unwrap_err();
        assert!(matches!(err, MiningError::RaggedTransaction { index: 0, .. }));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let broken = tx(&[(1, f64::NAN, 1.0)]);
        let err = mine(&[broken], &MiningParams::new(0.0)).unwrap_err();
        assert!(matches!(err, MiningError::InvalidValue { item: 1, .. }));
    }

    /// Brute-force oracle: exact utility and support of every itemset over
    /// the distinct items of the database.
    fn brute_force(
        transactions: &[Transaction],
        min_utility: f64,
    ) -> BTreeMap<Vec<i64>, (f64, u64)> {
        let mut distinct: Vec<i64> = transactions
            .iter()
            .flat_map(|t| t.items.iter().copied())
            .collect();
        distinct.sort_unstable();
        distinct.dedup();

        let per_tx: Vec<BTreeMap<i64, f64>> = transactions
            .iter()
            .map(|t| {
                let mut merged = BTreeMap::new();
                for ((&item, &q), &p) in
                    t.items.iter().zip(&t.quantities).zip(&t.unit_utilities)
                {
                    *merged.entry(item).or_insert(0.0) += q * p;
                }
                merged
            })
            .collect();

        let mut result = BTreeMap::new();
        for mask in 1u32..(1 << distinct.len()) {
            let itemset: Vec<i64> = distinct
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, &item)| item)
                .collect();

            let mut utility = 0.0;
            let mut support = 0;
            for tx in &per_tx {
                if itemset.iter().all(|item| tx.contains_key(item)) {
                    utility += itemset.iter().map(|item| tx[item]).sum::<f64>();
                    support += 1;
                }
            }

            if support > 0 && utility >= min_utility {
                result.insert(itemset, (utility, support));
            }
        }
        result
    }

    fn arbitrary_database() -> impl Strategy<Value = Vec<Transaction>> {
        // Integer-valued quantities and utilities keep the float sums exact,
        // so the oracle comparison needs no epsilon.
        let entry = (0i64..6, 1u8..5, 1u8..10);
        let transaction = prop::collection::vec(entry, 1..6).prop_map(|entries| {
            Transaction {
                items: entries.iter().map(|e| e.0).collect(),
                quantities: entries.iter().map(|e| f64::from(e.1)).collect(),
                unit_utilities: entries.iter().map(|e| f64::from(e.2)).collect(),
            }
        });
        prop::collection::vec(transaction, 0..8)
    }

    proptest! {
        #[test]
        fn mining_is_sound_and_complete(
            transactions in arbitrary_database(),
            min_utility in 0u32..120,
        ) {
            let min_utility = f64::from(min_utility);
            let mined = by_items(
                mine(&transactions, &MiningParams::new(min_utility)).unwrap(),
            );
            let oracle = brute_force(&transactions, min_utility);

            prop_assert_eq!(mined, oracle);
        }
    }
}
