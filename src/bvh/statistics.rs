use std::fmt::Display;

use crate::util::Stats;

use super::{Bvh, NodeKind, NodeRef};

/// Shape summary of a hierarchy.
#[derive(Clone, Debug, PartialEq)]
pub struct BvhStatistics {
    /// Number of inner nodes above each leaf.
    pub leaf_depth: Stats,
    pub inner_node_child_count: Stats,
    pub leaf_size: Stats,
    pub motion_nodes: usize,
}

impl<const N: usize> Bvh<N> {
    pub fn statistics(&self) -> BvhStatistics {
        let mut inner_node_child_count = Stats::default();
        let mut leaf_size = Stats::default();
        let mut motion_nodes = 0;

        self.visit_reachable(self.root, &mut |node| match node.kind() {
            NodeKind::Inner(index) => {
                let node = &self.nodes[index];
                inner_node_child_count.add_sample(node.child_count());
                motion_nodes += node.is_motion() as usize;
            }
            NodeKind::Leaf(range) => leaf_size.add_sample(range.len()),
            NodeKind::Empty | NodeKind::Invalid => {}
        });

        BvhStatistics {
            leaf_depth: self.depth_statistics_recursive(self.root),
            inner_node_child_count,
            leaf_size,
            motion_nodes,
        }
    }

    fn depth_statistics_recursive(&self, node: NodeRef) -> Stats {
        match node.kind() {
            NodeKind::Leaf(_) => Stats::new_single(0),
            NodeKind::Empty | NodeKind::Invalid => Stats::default(),
            NodeKind::Inner(index) => {
                let node = &self.nodes[index];
                node.children()[..node.child_count()]
                    .iter()
                    .map(|child| self.depth_statistics_recursive(*child))
                    .fold(Stats::default(), |a, b| a.merge(&b))
                    .offset(1)
            }
        }
    }

    fn visit_reachable(&self, node: NodeRef, f: &mut impl FnMut(NodeRef)) {
        f(node);
        if let NodeKind::Inner(index) = node.kind() {
            let node = &self.nodes[index];
            for child in &node.children()[..node.child_count()] {
                self.visit_reachable(*child, f);
            }
        }
    }
}

impl Display for BvhStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Leaf depth: {}", self.leaf_depth)?;
        writeln!(f, "Inner node child count: {}", self.inner_node_child_count)?;
        writeln!(f, "Leaf size: {}", self.leaf_size)?;
        write!(f, "Motion nodes: {}", self.motion_nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bvh::{AlignedNode, Node, NodeIdx},
        geometry::{WorldBox, WorldPoint},
    };
    use assert2::assert;
    use index_vec::IndexVec;

    #[test]
    fn two_level_statistics() {
        let b = WorldBox::new(WorldPoint::new(0.0, 0.0, 0.0), WorldPoint::new(1.0, 1.0, 1.0));
        let mut nodes = IndexVec::<NodeIdx, Node<4>>::new();
        let inner = nodes.push(Node::Aligned(
            AlignedNode::new(&[
                (NodeRef::new_leaf(1u32.into(), 2), b.clone()),
                (NodeRef::new_leaf(3u32.into(), 4), b.clone()),
            ])
            .unwrap(),
        ));
        let root = nodes.push(Node::Aligned(
            AlignedNode::new(&[
                (NodeRef::new_leaf(0u32.into(), 1), b.clone()),
                (NodeRef::new_inner(inner), b.clone()),
            ])
            .unwrap(),
        ));
        let bvh = Bvh::from_nodes(nodes, NodeRef::new_inner(root), 7).unwrap();
        let stats = bvh.statistics();

        assert!(stats.leaf_depth.min == 1);
        assert!(stats.leaf_depth.max == 2);
        assert!(stats.leaf_depth.count == 3);
        assert!(stats.inner_node_child_count.avg == 2.0);
        assert!(stats.leaf_size.max == 4);
        assert!(stats.leaf_size.count == 3);
        assert!(stats.motion_nodes == 0);
        assert!(format!("{stats}").contains("Leaf size: 1 - 4"));
    }

    #[test]
    fn empty_statistics() {
        let stats = Bvh::<4>::empty().statistics();
        assert!(stats.leaf_depth.count == 0);
        assert!(stats.leaf_size.count == 0);
    }
}
