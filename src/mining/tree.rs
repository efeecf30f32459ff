use std::fmt;

/// Index of a node in the [`UpTree`] arena.
///
/// Projections hold `NodeId`s instead of owning references; the arena is
/// immutable for the whole mining pass, so an id held by a projection can
/// never dangle within a run.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    const ROOT: NodeId = NodeId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A single UP-Tree node.
///
/// `node_utility` is maintained under the DGN reorganization: the value added
/// on each insertion is the running prefix utility of the reorganized
/// transaction, so it upper-bounds the utility of any itemset drawn from the
/// path ending at this node.
pub struct UpNode {
    /// Item rank (position in the global TWU-descending order).
    pub item: u32,
    /// Number of transactions whose path passes through this node.
    pub count: u64,
    /// DGN residual utility accumulated over those transactions.
    pub node_utility: f64,
    /// Exact utility of this node's own item over those transactions.
    pub item_utility: f64,
    pub parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Next node with the same item label, in insertion order.
    pub next_in_chain: Option<NodeId>,
    /// Ids into the reorganized transaction index for every transaction
    /// inserted through this node. This is what lets projections recover
    /// exact utilities without reconstructing conditional trees.
    pub transactions: Vec<u32>,
}

const ROOT_ITEM: u32 = u32::MAX;

struct HeaderChain {
    head: Option<NodeId>,
    tail: Option<NodeId>,
}

/// Utility-pattern prefix tree with per-item header chains.
///
/// Built in a single pass over the reorganized transactions; read-only
/// afterwards.
pub struct UpTree {
    nodes: Vec<UpNode>,
    headers: Vec<HeaderChain>,
}

impl UpTree {
    pub fn with_items(num_items: usize) -> Self {
        let root = UpNode {
            item: ROOT_ITEM,
            count: 0,
            node_utility: 0.0,
            item_utility: 0.0,
            parent: None,
            children: Vec::new(),
            next_in_chain: None,
            transactions: Vec::new(),
        };

        Self {
            nodes: vec![root],
            headers: (0..num_items)
                .map(|_| HeaderChain {
                    head: None,
                    tail: None,
                })
                .collect(),
        }
    }

    pub fn node(&self, id: NodeId) -> &UpNode {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Insert one reorganized transaction, `path` being its `(rank, utility)`
    /// pairs sorted by rank ascending. Applies DGN: the utility recorded at
    /// each visited node is the running prefix utility, i.e. the transaction
    /// utility with the items further along the path discarded.
    pub fn insert_transaction(&mut self, tx_id: u32, path: &[(u32, f64)]) {
        let mut current = NodeId::ROOT;
        let mut residual = 0.0;

        for &(rank, utility) in path {
            residual += utility;

            let child = match self.find_child(current, rank) {
                Some(child) => child,
                None => self.add_child(current, rank),
            };

            let node = &mut self.nodes[child.index()];
            node.count += 1;
            node.node_utility += residual;
            node.item_utility += utility;
            node.transactions.push(tx_id);

            current = child;
        }
    }

    fn find_child(&self, parent: NodeId, item: u32) -> Option<NodeId> {
        self.nodes[parent.index()]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child.index()].item == item)
    }

    fn add_child(&mut self, parent: NodeId, item: u32) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);

        self.nodes.push(UpNode {
            item,
            count: 0,
            node_utility: 0.0,
            item_utility: 0.0,
            parent: Some(parent),
            children: Vec::new(),
            next_in_chain: None,
            transactions: Vec::new(),
        });

        self.nodes[parent.index()].children.push(id);

        let chain = &mut self.headers[item as usize];
        match chain.tail {
            Some(tail) => {
                self.nodes[tail.index()].next_in_chain = Some(id);
                chain.tail = Some(id);
            }
            None => {
                chain.head = Some(id);
                chain.tail = Some(id);
            }
        }

        id
    }

    /// All nodes labeled with `rank`, in insertion order.
    pub fn header_chain(&self, rank: u32) -> HeaderIter<'_> {
        HeaderIter {
            tree: self,
            next: self.headers[rank as usize].head,
        }
    }

    /// Ancestors of `id` from its parent up to (excluding) the root.
    pub fn ancestors(&self, id: NodeId) -> AncestorIter<'_> {
        AncestorIter {
            tree: self,
            next: self.node(id).parent,
        }
    }

    /// Whether the root-exclusive prefix path of `id` contains `rank`.
    pub fn path_contains(&self, id: NodeId, rank: u32) -> bool {
        self.ancestors(id).any(|a| self.node(a).item == rank)
    }
}

pub struct HeaderIter<'a> {
    tree: &'a UpTree,
    next: Option<NodeId>,
}

impl Iterator for HeaderIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.tree.node(id).next_in_chain;
        Some(id)
    }
}

pub struct AncestorIter<'a> {
    tree: &'a UpTree,
    next: Option<NodeId>,
}

impl Iterator for AncestorIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        if self.tree.node(id).item == ROOT_ITEM {
            return None;
        }
        self.next = self.tree.node(id).parent;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(paths: &[&[(u32, f64)]]) -> UpTree {
        let num_items = paths
            .iter()
            .flat_map(|p| p.iter())
            .map(|&(rank, _)| rank + 1)
            .max()
            .unwrap_or(0);

        let mut tree = UpTree::with_items(num_items as usize);
        for (tx_id, path) in paths.iter().enumerate() {
            tree.insert_transaction(tx_id as u32, path);
        }
        tree
    }

    #[test]
    fn shared_prefixes_merge_into_one_path() {
        let tree = build(&[
            &[(0, 1.0), (1, 2.0), (2, 3.0)],
            &[(0, 4.0), (1, 5.0)],
            &[(0, 6.0)],
        ]);

        // root + one node per distinct prefix
        assert_eq!(tree.len(), 4);

        let zero: Vec<_> = tree.header_chain(0).collect();
        assert_eq!(zero.len(), 1);
        assert_eq!(tree.node(zero[0]).count, 3);
        assert_eq!(tree.node(zero[0]).transactions, vec![0, 1, 2]);
    }

    #[test]
    fn node_utility_is_residual_prefix_utility() {
        // One transaction with utilities 3, 10, 6: the deepest node carries
        // the full transaction utility, the shallower nodes only the prefix.
        let tree = build(&[&[(0, 3.0), (1, 10.0), (2, 6.0)]]);

        let by_rank = |rank| {
            let node = tree.header_chain(rank).next().unwrap();
            tree.node(node).node_utility
        };

        assert_eq!(by_rank(0), 3.0);
        assert_eq!(by_rank(1), 13.0);
        assert_eq!(by_rank(2), 19.0);
    }

    #[test]
    fn header_chain_reaches_every_node_of_an_item() {
        // Item 2 occurs under two different prefixes.
        let tree = build(&[&[(0, 1.0), (2, 1.0)], &[(1, 1.0), (2, 1.0)]]);

        let twos: Vec<_> = tree.header_chain(2).collect();
        assert_eq!(twos.len(), 2);
        assert!(twos.iter().all(|&n| tree.node(n).item == 2));
        // Insertion order is preserved.
        assert_eq!(tree.node(twos[0]).transactions, vec![0]);
        assert_eq!(tree.node(twos[1]).transactions, vec![1]);
    }

    #[test]
    fn ancestors_walk_excludes_root_and_self() {
        let tree = build(&[&[(0, 1.0), (1, 1.0), (2, 1.0)]]);
        let leaf = tree.header_chain(2).next().unwrap();

        let items: Vec<_> = tree
            .ancestors(leaf)
            .map(|id| tree.node(id).item)
            .collect();
        assert_eq!(items, vec![1, 0]);

        assert!(tree.path_contains(leaf, 0));
        assert!(tree.path_contains(leaf, 1));
        assert!(!tree.path_contains(leaf, 2));
    }

    #[test]
    fn children_are_unique_per_item_label() {
        let tree = build(&[
            &[(0, 1.0), (1, 1.0)],
            &[(0, 1.0), (1, 1.0)],
            &[(0, 1.0), (2, 1.0)],
        ]);

        // 0 has exactly two children (1 and 2), not three.
        let zero = tree.header_chain(0).next().unwrap();
        let child_items: Vec<_> = tree
            .header_chain(1)
            .chain(tree.header_chain(2))
            .filter(|&n| tree.node(n).parent == Some(zero))
            .collect();
        assert_eq!(child_items.len(), 2);
        assert_eq!(tree.len(), 4);
    }
}
