use std::collections::BTreeMap;

use super::tree::{NodeId, UpTree};
use super::ReorgTransaction;

/// One conditional pattern-base path, viewed through its anchor node in the
/// master tree.
///
/// `residual_utility` is the anchor's DGN node utility: an upper bound on the
/// utility of the current suffix extended with any items from this path.
/// `exact_utility` is the exact utility of the current suffix within the
/// transactions recorded at the anchor.
#[derive(Clone, Debug)]
pub struct ProjectedPath {
    pub anchor: NodeId,
    pub residual_utility: f64,
    pub exact_utility: f64,
}

/// Pseudo-projection of a conditional pattern base.
///
/// Holds non-owning node ids plus parallel utility state; no conditional
/// tree is ever materialized. Narrowing filters the paths in place of
/// rebuilding them.
#[derive(Clone, Debug, Default)]
pub struct PathProjection {
    pub entries: Vec<ProjectedPath>,
    /// Exact utility of the suffix itemset over all projected paths.
    pub exact_utility: f64,
    /// Number of transactions containing the suffix itemset.
    pub support: u64,
}

fn item_utility(transaction: &ReorgTransaction, rank: u32) -> f64 {
    match transaction.binary_search_by_key(&rank, |&(r, _)| r) {
        Ok(i) => transaction[i].1,
        Err(_) => 0.0,
    }
}

impl PathProjection {
    /// Projection for the single-item suffix `{rank}`: every node on the
    /// item's header chain anchors one path.
    pub fn for_item(tree: &UpTree, rank: u32) -> Self {
        let mut entries = Vec::new();
        let mut exact_utility = 0.0;
        let mut support = 0;

        for id in tree.header_chain(rank) {
            let node = tree.node(id);
            entries.push(ProjectedPath {
                anchor: id,
                residual_utility: node.node_utility,
                exact_utility: node.item_utility,
            });
            exact_utility += node.item_utility;
            support += node.count;
        }

        Self {
            entries,
            exact_utility,
            support,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upper bound on the utility of the suffix extended with any items
    /// reachable from this projection.
    pub fn residual_bound(&self) -> f64 {
        self.entries.iter().map(|e| e.residual_utility).sum()
    }

    /// Local TWU of every item appearing on the projected prefix paths with
    /// rank strictly below `below`, highest rank first.
    pub fn local_twu(&self, tree: &UpTree, below: u32) -> Vec<(u32, f64)> {
        let mut twu: BTreeMap<u32, f64> = BTreeMap::new();

        for entry in &self.entries {
            for ancestor in tree.ancestors(entry.anchor) {
                let item = tree.node(ancestor).item;
                if item < below {
                    *twu.entry(item).or_insert(0.0) += entry.residual_utility;
                }
            }
        }

        twu.into_iter().rev().collect()
    }

    /// Narrow to the paths whose prefix contains `beta`, folding `beta`'s
    /// exact utilities (looked up in the reorganized transaction index via
    /// the anchors) into the running suffix utility.
    pub fn narrow(
        &self,
        tree: &UpTree,
        transactions: &[ReorgTransaction],
        beta: u32,
    ) -> Self {
        let mut entries = Vec::new();
        let mut exact_utility = 0.0;
        let mut support = 0;

        for entry in &self.entries {
            if !tree.path_contains(entry.anchor, beta) {
                continue;
            }

            let node = tree.node(entry.anchor);
            let beta_utility: f64 = node
                .transactions
                .iter()
                .map(|&tx| item_utility(&transactions[tx as usize], beta))
                .sum();

            let exact = entry.exact_utility + beta_utility;
            entries.push(ProjectedPath {
                anchor: entry.anchor,
                residual_utility: entry.residual_utility,
                exact_utility: exact,
            });
            exact_utility += exact;
            support += node.count;
        }

        Self {
            entries,
            exact_utility,
            support,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The worked example: utilities A=3/unit, B=10/unit, C=1/unit over
    //   T0: 2A 1B 3C   T1: 1A 2C   T2: 2B 4C
    // TWU order is C(48), B(43), A(24), so ranks are C=0, B=1, A=2.
    fn worked_example() -> (UpTree, Vec<ReorgTransaction>) {
        let transactions: Vec<ReorgTransaction> = vec![
            vec![(0, 3.0), (1, 10.0), (2, 6.0)],
            vec![(0, 2.0), (2, 3.0)],
            vec![(0, 4.0), (1, 20.0)],
        ];

        let mut tree = UpTree::with_items(3);
        for (tx_id, path) in transactions.iter().enumerate() {
            tree.insert_transaction(tx_id as u32, path);
        }
        (tree, transactions)
    }

    #[test]
    fn single_item_projection_sums_header_chain() {
        let (tree, _) = worked_example();

        // A (rank 2) occurs on two paths.
        let proj = PathProjection::for_item(&tree, 2);
        assert_eq!(proj.entries.len(), 2);
        assert_eq!(proj.support, 2);
        assert_eq!(proj.exact_utility, 9.0);
        assert_eq!(proj.residual_bound(), 24.0);
    }

    #[test]
    fn local_twu_accumulates_residuals_per_prefix_item() {
        let (tree, _) = worked_example();

        let proj = PathProjection::for_item(&tree, 2);
        let twu = proj.local_twu(&tree, 2);

        // B appears only on the 19.0 path, C on both.
        assert_eq!(twu, vec![(1, 19.0), (0, 24.0)]);
    }

    #[test]
    fn narrowing_keeps_matching_paths_and_tracks_exact_utility() {
        let (tree, transactions) = worked_example();

        // {B} -> {B, C}: the single B-over-C path survives and picks up
        // C's exact utilities from both of its transactions.
        let proj = PathProjection::for_item(&tree, 1);
        assert_eq!(proj.exact_utility, 30.0);

        let narrowed = proj.narrow(&tree, &transactions, 0);
        assert_eq!(narrowed.entries.len(), 1);
        assert_eq!(narrowed.support, 2);
        assert_eq!(narrowed.exact_utility, 37.0);
    }

    #[test]
    fn narrowing_to_an_absent_item_yields_an_empty_projection() {
        let (tree, transactions) = worked_example();

        // C (rank 0) is topmost; its projection has no prefix items.
        let proj = PathProjection::for_item(&tree, 0);
        let narrowed = proj.narrow(&tree, &transactions, 1);

        assert!(narrowed.is_empty());
        assert_eq!(narrowed.support, 0);
    }
}
