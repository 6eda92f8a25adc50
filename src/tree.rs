//! Structural index of the fog tree: (tier, group, slot) coordinates, flat node ids, ancestor and
//! descendant traversal, and interface addresses.
//!
//! Every node owns one interface per child link plus, unless it is the root, one interface toward
//! its parent. The parent link of a node is created before its child links, so a non-root node's
//! interface 1 faces its parent and interfaces 2.. face its children in child order, while the
//! root's interfaces 1.. face its children.

use crate::simulator::Addr;

use failure::{bail, format_err, Error};
use std::ops::Range;

/// Flat identifier of a tree node. The root is 0
pub type NodeId = usize;

pub const ROOT: NodeId = 0;

/// Structural coordinate of a node
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Coord {
    pub tier: usize,
    pub group: usize,
    pub slot: usize,
}

#[derive(Clone, Debug)]
struct TreeNode {
    coord: Coord,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Owns every node record of the tree, stored contiguously by id. Immutable once built
#[derive(Clone, Debug)]
pub struct TreeIndex {
    /// Number of nodes in each group of a tier
    fanouts: Vec<usize>,
    /// Id of the first node of each tier
    tier_offsets: Vec<usize>,
    nodes: Vec<TreeNode>,
}

impl TreeIndex {
    /// Builds the tree from its per-tier fan-out vector. Tier 0 must hold exactly one node (the
    /// root) and there must be at least one tier below it.
    pub fn new(fanouts: &[usize]) -> Result<Self, Error> {
        if fanouts.len() < 2 {
            bail!(
                "A tree needs a root tier and at least one more tier, got fan-outs {:?}",
                fanouts
            );
        }
        if fanouts[0] != 1 {
            bail!("Tier 0 must hold a single root, got fan-out {}", fanouts[0]);
        }
        if let Some(tier) = fanouts.iter().position(|&f| f == 0) {
            bail!("Fan-out of tier {} is zero", tier);
        }

        // Node count per tier is the product of all fan-outs up to and including that tier
        let mut tier_offsets = Vec::with_capacity(fanouts.len());
        let mut total = 0usize;
        let mut tier_size = 1usize;
        for &fanout in fanouts {
            tier_offsets.push(total);
            tier_size = tier_size
                .checked_mul(fanout)
                .ok_or_else(|| format_err!("Tree with fan-outs {:?} is too large", fanouts))?;
            total = total
                .checked_add(tier_size)
                .ok_or_else(|| format_err!("Tree with fan-outs {:?} is too large", fanouts))?;
        }

        let mut nodes = Vec::with_capacity(total);
        nodes.push(TreeNode {
            coord: Coord {
                tier: 0,
                group: 0,
                slot: 0,
            },
            parent: None,
            children: Vec::new(),
        });
        // Group `g` of tier `t` holds the children of the g-th node of tier `t - 1`
        for tier in 1..fanouts.len() {
            let n_groups = tier_offsets[tier] - tier_offsets[tier - 1];
            for group in 0..n_groups {
                let parent = tier_offsets[tier - 1] + group;
                for slot in 0..fanouts[tier] {
                    let id = nodes.len();
                    nodes.push(TreeNode {
                        coord: Coord { tier, group, slot },
                        parent: Some(parent),
                        children: Vec::new(),
                    });
                    nodes[parent].children.push(id);
                }
            }
        }
        assert_eq!(nodes.len(), total);

        Ok(Self {
            fanouts: fanouts.to_vec(),
            tier_offsets,
            nodes,
        })
    }

    pub fn n_tiers(&self) -> usize {
        self.fanouts.len()
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Deepest tier, where the clients live
    pub fn leaf_tier(&self) -> usize {
        self.fanouts.len() - 1
    }

    /// Number of groups in `tier`: the product of the fan-outs of all shallower tiers
    pub fn n_groups(&self, tier: usize) -> usize {
        self.fanouts[..tier].iter().product()
    }

    /// Number of nodes in each group of `tier`
    #[allow(dead_code)]
    pub fn n_slots(&self, tier: usize) -> usize {
        self.fanouts[tier]
    }

    /// Ids of every node in `tier`, in enumeration order
    pub fn nodes_at(&self, tier: usize) -> Range<NodeId> {
        let start = self.tier_offsets[tier];
        start..start + self.n_groups(tier) * self.fanouts[tier]
    }

    /// Flat id of the node at the given coordinate. Tier 0 always yields the root
    #[allow(dead_code)]
    pub fn node_id(&self, tier: usize, group: usize, slot: usize) -> NodeId {
        if tier == 0 {
            return ROOT;
        }
        assert!(tier < self.n_tiers(), "tier {} out of range", tier);
        assert!(
            group < self.n_groups(tier) && slot < self.fanouts[tier],
            "coordinate ({}, {}, {}) out of range",
            tier,
            group,
            slot
        );
        self.tier_offsets[tier] + group * self.fanouts[tier] + slot
    }

    #[allow(dead_code)]
    pub fn coord(&self, id: NodeId) -> Coord {
        self.nodes[id].coord
    }

    pub fn tier(&self, id: NodeId) -> usize {
        self.nodes[id].coord.tier
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    #[allow(dead_code)]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Position of `child` among the children of `parent`
    pub fn nth_child_index(&self, parent: NodeId, child: NodeId) -> usize {
        self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == child)
            .unwrap_or_else(|| panic!("node {} is not a child of node {}", child, parent))
    }

    /// Ancestor of `id` that is `levels_up` tiers above it
    pub fn parent_id(&self, id: NodeId, levels_up: usize) -> NodeId {
        self.walk_up(id, levels_up).0
    }

    /// Address of the ancestor `levels_up` tiers above `id`, on the interface that faces the
    /// branch containing `id`
    pub fn parent_address(&self, id: NodeId, levels_up: usize) -> Addr {
        assert!(levels_up >= 1, "parent address needs at least one level up");
        let (ancestor, child_on_path) = self.walk_up(id, levels_up);
        let nth = self.nth_child_index(ancestor, child_on_path) as u32;
        // The root has no uplink interface, so its child links start at interface 1
        if ancestor == ROOT {
            self.address(ancestor, nth + 1)
        } else {
            self.address(ancestor, nth + 2)
        }
    }

    /// Returns the ancestor and the node just below it on the path from `id`
    fn walk_up(&self, id: NodeId, levels_up: usize) -> (NodeId, NodeId) {
        assert!(
            levels_up <= self.tier(id),
            "cannot walk {} levels up from node {} at tier {}",
            levels_up,
            id,
            self.tier(id)
        );
        let mut cur = id;
        let mut prev = id;
        for _ in 0..levels_up {
            prev = cur;
            cur = self.nodes[cur].parent.expect("non-root node has a parent");
        }
        (cur, prev)
    }

    /// Descendants of `id` exactly `levels_down` tiers below it. Empty for zero levels
    pub fn children_ids(&self, id: NodeId, levels_down: usize) -> Vec<NodeId> {
        match levels_down {
            0 => Vec::new(),
            1 => self.nodes[id].children.clone(),
            _ => self.nodes[id]
                .children
                .iter()
                .flat_map(|&c| self.children_ids(c, levels_down - 1))
                .collect(),
        }
    }

    /// Primary addresses of the descendants `levels_down` tiers below `id`
    #[allow(dead_code)]
    pub fn children_addresses(&self, id: NodeId, levels_down: usize) -> Vec<Addr> {
        self.children_ids(id, levels_down)
            .into_iter()
            .map(|c| self.primary_address(c))
            .collect()
    }

    /// Leaf-tier nodes in the subtree of `id`. A leaf is its own only leaf descendant
    pub fn leaves_under(&self, id: NodeId) -> Vec<NodeId> {
        let tier = self.tier(id);
        if tier == self.leaf_tier() {
            vec![id]
        } else {
            self.children_ids(id, self.leaf_tier() - tier)
        }
    }

    pub fn n_interfaces(&self, id: NodeId) -> u32 {
        let uplink = if self.nodes[id].parent.is_some() { 1 } else { 0 };
        (self.nodes[id].children.len() + uplink) as u32
    }

    pub fn address(&self, id: NodeId, iface: u32) -> Addr {
        assert!(
            iface >= 1 && iface <= self.n_interfaces(id),
            "node {} has no interface {}",
            id,
            iface
        );
        Addr { node: id, iface }
    }

    pub fn primary_address(&self, id: NodeId) -> Addr {
        self.address(id, 1)
    }

    /// Upper tier of every link crossed going from `a` to `b` through their lowest common
    /// ancestor
    pub fn path_link_tiers(&self, a: NodeId, b: NodeId) -> Vec<usize> {
        let (mut a, mut b) = (a, b);
        let mut up = Vec::new();
        let mut down = Vec::new();
        while self.tier(a) > self.tier(b) {
            up.push(self.tier(a) - 1);
            a = self.nodes[a].parent.expect("non-root node has a parent");
        }
        while self.tier(b) > self.tier(a) {
            down.push(self.tier(b) - 1);
            b = self.nodes[b].parent.expect("non-root node has a parent");
        }
        while a != b {
            up.push(self.tier(a) - 1);
            down.push(self.tier(b) - 1);
            a = self.nodes[a].parent.expect("non-root node has a parent");
            b = self.nodes[b].parent.expect("non-root node has a parent");
        }
        up.extend(down.into_iter().rev());
        up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn all_coords(tree: &TreeIndex) -> Vec<Coord> {
        let mut coords = Vec::new();
        for tier in 0..tree.n_tiers() {
            for group in 0..tree.n_groups(tier) {
                for slot in 0..tree.n_slots(tier) {
                    coords.push(Coord { tier, group, slot });
                }
            }
        }
        coords
    }

    #[test]
    fn bad_fanouts_are_rejected() {
        assert!(TreeIndex::new(&[]).is_err());
        assert!(TreeIndex::new(&[1]).is_err());
        assert!(TreeIndex::new(&[2, 3]).is_err());
        assert!(TreeIndex::new(&[1, 0, 3]).is_err());
        assert!(TreeIndex::new(&[1, usize::MAX, usize::MAX]).is_err());
    }

    #[test]
    fn tier_shape() {
        let tree = TreeIndex::new(&[1, 1, 5, 20]).unwrap();
        assert_eq!(tree.n_nodes(), 1 + 1 + 5 + 100);
        assert_eq!(tree.n_groups(3), 5);
        assert_eq!(tree.n_slots(3), 20);
        assert_eq!(tree.nodes_at(2), 2..7);
        assert_eq!(tree.nodes_at(3), 7..107);
        assert_eq!(tree.leaf_tier(), 3);
    }

    #[test]
    fn node_ids_enumerate_in_order() {
        let tree = TreeIndex::new(&[1, 2, 3, 2]).unwrap();
        let ids: Vec<NodeId> = all_coords(&tree)
            .iter()
            .map(|c| tree.node_id(c.tier, c.group, c.slot))
            .collect();
        // Strictly increasing and therefore injective, and dense
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids, (0..tree.n_nodes()).collect::<Vec<_>>());
        for c in all_coords(&tree) {
            assert_eq!(tree.coord(tree.node_id(c.tier, c.group, c.slot)), c);
        }
    }

    #[test]
    fn parent_matches_structure() {
        let tree = TreeIndex::new(&[1, 2, 3, 2]).unwrap();
        for c in all_coords(&tree).into_iter().filter(|c| c.tier > 0) {
            let id = tree.node_id(c.tier, c.group, c.slot);
            let prev_slots = tree.n_slots(c.tier - 1);
            let expected = tree.node_id(c.tier - 1, c.group / prev_slots, c.group % prev_slots);
            assert_eq!(tree.parent_id(id, 1), expected);
            assert_eq!(tree.parent(id), Some(expected));
            assert!(tree.children(expected).contains(&id));
        }
        assert_eq!(tree.parent(ROOT), None);
        assert_eq!(tree.parent_id(tree.node_id(3, 5, 1), 3), ROOT);
        assert_eq!(tree.parent_id(7, 0), 7);
    }

    #[test]
    #[should_panic]
    fn walking_above_the_root_panics() {
        let tree = TreeIndex::new(&[1, 2, 3]).unwrap();
        tree.parent_id(3, 3);
    }

    #[test]
    fn parent_address_interface_offset() {
        // ids: root 0; tier 1: 1, 2; tier 2: 3, 4, 5 under 1 and 6, 7, 8 under 2
        let tree = TreeIndex::new(&[1, 2, 3]).unwrap();
        assert_eq!(tree.children(1), &[3, 4, 5]);
        assert_eq!(tree.children(2), &[6, 7, 8]);

        // Non-root ancestor: child index + 2
        assert_eq!(tree.parent_address(4, 1), Addr { node: 1, iface: 3 });
        assert_eq!(tree.parent_address(8, 1), Addr { node: 2, iface: 4 });
        // Root ancestor: child index + 1
        assert_eq!(tree.parent_address(1, 1), Addr { node: 0, iface: 1 });
        assert_eq!(tree.parent_address(2, 1), Addr { node: 0, iface: 2 });
        // Two levels up the interface is chosen by the tier-1 node on the path
        assert_eq!(tree.parent_address(3, 2), Addr { node: 0, iface: 1 });
        assert_eq!(tree.parent_address(7, 2), Addr { node: 0, iface: 2 });
    }

    #[test]
    fn interfaces() {
        let tree = TreeIndex::new(&[1, 2, 3]).unwrap();
        assert_eq!(tree.n_interfaces(ROOT), 2);
        assert_eq!(tree.n_interfaces(1), 4);
        assert_eq!(tree.n_interfaces(5), 1);
        assert_eq!(tree.primary_address(5), Addr { node: 5, iface: 1 });
    }

    #[test]
    fn children_closure() {
        let fanouts = [1, 2, 3, 4];
        let tree = TreeIndex::new(&fanouts).unwrap();
        for id in 0..tree.n_nodes() {
            let tier = tree.tier(id);
            let depth = tree.leaf_tier() - tier;
            let got: BTreeSet<NodeId> = tree.children_ids(id, depth).into_iter().collect();
            if depth == 0 {
                assert!(got.is_empty());
                continue;
            }
            let expected: BTreeSet<NodeId> = tree
                .nodes_at(tree.leaf_tier())
                .filter(|&leaf| tree.parent_id(leaf, depth) == id)
                .collect();
            assert_eq!(got, expected);
            let cardinality: usize = fanouts[tier + 1..].iter().product();
            assert_eq!(got.len(), cardinality);
        }
    }

    #[test]
    fn children_addresses_use_primary_interface() {
        let tree = TreeIndex::new(&[1, 2, 3]).unwrap();
        assert_eq!(
            tree.children_addresses(2, 1),
            vec![
                Addr { node: 6, iface: 1 },
                Addr { node: 7, iface: 1 },
                Addr { node: 8, iface: 1 }
            ]
        );
        assert!(tree.children_addresses(6, 1).is_empty());
        assert_eq!(tree.children_addresses(ROOT, 2).len(), 6);
    }

    #[test]
    fn leaves_under() {
        let tree = TreeIndex::new(&[1, 2, 3]).unwrap();
        assert_eq!(tree.leaves_under(1), vec![3, 4, 5]);
        assert_eq!(tree.leaves_under(7), vec![7]);
        assert_eq!(tree.leaves_under(ROOT).len(), 6);
    }

    #[test]
    fn paths_go_through_lowest_common_ancestor() {
        let tree = TreeIndex::new(&[1, 2, 3]).unwrap();
        // Siblings under node 1
        assert_eq!(tree.path_link_tiers(3, 4), vec![1, 1]);
        // Cousins through the root
        assert_eq!(tree.path_link_tiers(3, 8), vec![1, 0, 0, 1]);
        // Straight up and straight down
        assert_eq!(tree.path_link_tiers(8, ROOT), vec![1, 0]);
        assert_eq!(tree.path_link_tiers(ROOT, 4), vec![0, 1]);
        assert!(tree.path_link_tiers(5, 5).is_empty());
    }
}
