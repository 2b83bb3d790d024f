mod building;
mod node_ref;
mod statistics;

pub use building::{Bounded, BvhBuildSettings};
pub use node_ref::{NodeIdx, NodeKind, NodeRef, PrimIdx, PrimRange};
pub use statistics::BvhStatistics;

use index_vec::IndexVec;
use simba::simd::SimdValue as _;
use thiserror::Error;

use crate::{
    geometry::{WorldBox, WorldPoint},
    util::simba::SimdFloat,
};

/// Largest supported branching factor.
pub const MAX_WIDTH: usize = 8;

/// Largest number of inner nodes on any root to leaf path.
/// Traversal stacks are sized for this depth.
pub const MAX_DEPTH: usize = 32;

/// Index of the lower slab in the `side` dimension of child bounds.
pub const LOWER: usize = 0;
/// Index of the upper slab in the `side` dimension of child bounds.
pub const UPPER: usize = 1;

/// Child bounds in structure-of-arrays layout: `[side][axis][child]`.
pub type Slabs<const N: usize> = [[[f32; N]; 3]; 2];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BvhError {
    #[error("branching factor {0} is not supported, it must be in 2..=8")]
    UnsupportedWidth(usize),

    #[error("node has {count} children, at most {max} fit")]
    TooManyChildren { count: usize, max: usize },

    #[error("leaf size {size} exceeds the maximum of {max} primitives")]
    LeafTooLarge { size: usize, max: usize },

    #[error("leaves must hold at least one primitive")]
    EmptyLeaf,

    #[error("hierarchy is deeper than 32 levels or contains a cycle")]
    TooDeep,

    #[error("node {node:?} references missing node {index}")]
    DanglingNode { node: Option<usize>, index: usize },

    #[error("leaf references primitives up to {end}, only {count} exist")]
    PrimitiveOutOfRange { end: usize, count: usize },

    #[error("node {node}: child slot {slot} follows an empty slot")]
    ChildrenNotPrefix { node: usize, slot: usize },

    #[error("node {node}: child slot {slot} holds the invalid sentinel")]
    InvalidChild { node: usize, slot: usize },

    #[error("the root reference is the invalid sentinel")]
    InvalidRoot,

    #[error("{0} primitives do not fit in a node reference")]
    TooManyPrimitives(usize),
}

/// Inner node with static child bounds.
#[derive(Clone, Debug, PartialEq)]
pub struct AlignedNode<const N: usize> {
    bounds: Slabs<N>,
    children: [NodeRef; N],
    child_count: usize,
}

/// Inner node whose child bounds move linearly with ray time: `bound(t) = base + t * delta`.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionNode<const N: usize> {
    base: Slabs<N>,
    delta: Slabs<N>,
    children: [NodeRef; N],
    child_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Node<const N: usize> {
    Aligned(AlignedNode<N>),
    Motion(MotionNode<N>),
}

fn empty_slabs<const N: usize>() -> Slabs<N> {
    [[[f32::INFINITY; N]; 3], [[f32::NEG_INFINITY; N]; 3]]
}

fn set_slot<const N: usize>(slabs: &mut Slabs<N>, slot: usize, b: &WorldBox) {
    for axis in 0..3 {
        slabs[LOWER][axis][slot] = b.min[axis];
        slabs[UPPER][axis][slot] = b.max[axis];
    }
}

fn check_child_count<const N: usize>(count: usize) -> Result<(), BvhError> {
    if count > N {
        Err(BvhError::TooManyChildren { count, max: N })
    } else {
        Ok(())
    }
}

impl<const N: usize> AlignedNode<N> {
    /// Node with the given children in the first slots, the rest stay empty.
    pub fn new(children: &[(NodeRef, WorldBox)]) -> Result<Self, BvhError> {
        check_child_count::<N>(children.len())?;
        let mut node = Self::empty();
        for (slot, (child, b)) in children.iter().enumerate() {
            node.children[slot] = *child;
            set_slot(&mut node.bounds, slot, b);
        }
        node.child_count = children.len();
        Ok(node)
    }

    pub fn empty() -> Self {
        AlignedNode {
            bounds: empty_slabs(),
            children: [NodeRef::EMPTY; N],
            child_count: 0,
        }
    }
}

impl<const N: usize> MotionNode<N> {
    /// Node from child bounds at time 0 and time 1.
    pub fn new(children: &[(NodeRef, WorldBox, WorldBox)]) -> Result<Self, BvhError> {
        check_child_count::<N>(children.len())?;
        let mut base = empty_slabs();
        let mut delta = [[[0.0; N]; 3]; 2];
        let mut node_children = [NodeRef::EMPTY; N];
        for (slot, (child, b0, b1)) in children.iter().enumerate() {
            node_children[slot] = *child;
            set_slot(&mut base, slot, b0);
            for axis in 0..3 {
                delta[LOWER][axis][slot] = b1.min[axis] - b0.min[axis];
                delta[UPPER][axis][slot] = b1.max[axis] - b0.max[axis];
            }
        }
        Ok(MotionNode {
            base,
            delta,
            children: node_children,
            child_count: children.len(),
        })
    }
}

impl<const N: usize> Node<N> {
    pub fn children(&self) -> &[NodeRef; N] {
        match self {
            Node::Aligned(node) => &node.children,
            Node::Motion(node) => &node.children,
        }
    }

    /// Number of occupied child slots, these always form a prefix.
    pub fn child_count(&self) -> usize {
        match self {
            Node::Aligned(node) => node.child_count,
            Node::Motion(node) => node.child_count,
        }
    }

    pub fn is_motion(&self) -> bool {
        matches!(self, Node::Motion(_))
    }

    /// One slab of all children at once, evaluated at `time` for motion nodes.
    #[inline(always)]
    pub fn slab<V: SimdFloat>(&self, side: usize, axis: usize, time: V) -> V {
        debug_assert!(V::LANES == N);
        match self {
            Node::Aligned(node) => V::load(&node.bounds[side][axis]),
            Node::Motion(node) => {
                V::load(&node.base[side][axis]) + time * V::load(&node.delta[side][axis])
            }
        }
    }

    /// One slab of a single child, broadcast to every lane and evaluated at per-lane `time`.
    #[inline(always)]
    pub fn child_slab<W: SimdFloat>(&self, side: usize, axis: usize, slot: usize, time: W) -> W {
        match self {
            Node::Aligned(node) => W::splat(node.bounds[side][axis][slot]),
            Node::Motion(node) => {
                W::splat(node.base[side][axis][slot])
                    + time * W::splat(node.delta[side][axis][slot])
            }
        }
    }

    /// Bounding box of a child at the given time.
    pub fn child_bounds(&self, slot: usize, time: f32) -> WorldBox {
        let corner = |side: usize| -> WorldPoint {
            let coords: [f32; 3] =
                std::array::from_fn(|axis| self.child_slab::<f32>(side, axis, slot, time));
            coords.into()
        };
        WorldBox::new(corner(LOWER), corner(UPPER))
    }
}

const UNVISITED: usize = 0;
const IN_PROGRESS: usize = usize::MAX;

/// Number of inner node levels below and including every node, whether the root reaches it
/// or not. Fails past [`MAX_DEPTH`] and when a node can reach itself.
/// All child references must already be in range.
fn node_heights<const N: usize>(
    nodes: &IndexVec<NodeIdx, Node<N>>,
) -> Result<IndexVec<NodeIdx, usize>, BvhError> {
    let inner_children = |index: NodeIdx| {
        let node = &nodes[index];
        node.children()[..node.child_count()]
            .iter()
            .enumerate()
            .filter_map(|(slot, child)| match child.kind() {
                NodeKind::Inner(child) => Some((slot, child)),
                _ => None,
            })
    };

    let mut heights = IndexVec::from_vec(vec![UNVISITED; nodes.len()]);
    for start in (0..nodes.len()).map(NodeIdx::from_usize) {
        if heights[start] != UNVISITED {
            continue;
        }
        heights[start] = IN_PROGRESS;
        // Nodes on the current path with the first child slot not looked at yet
        let mut path = vec![(start, 0usize)];
        while let Some((index, next_slot)) = path.pop() {
            match inner_children(index).find(|&(slot, _)| slot >= next_slot) {
                Some((slot, child)) => {
                    path.push((index, slot + 1));
                    match heights[child] {
                        IN_PROGRESS => return Err(BvhError::TooDeep),
                        UNVISITED => {
                            heights[child] = IN_PROGRESS;
                            path.push((child, 0));
                        }
                        _ => {}
                    }
                }
                None => {
                    let height = 1 + inner_children(index)
                        .map(|(_, child)| heights[child])
                        .max()
                        .unwrap_or(0);
                    if height > MAX_DEPTH {
                        return Err(BvhError::TooDeep);
                    }
                    heights[index] = height;
                }
            }
        }
    }
    Ok(heights)
}

/// Bounding volume hierarchy with branching factor `N`.
///
/// Immutable once created, traversal only reads it.
#[derive(Clone, Debug)]
pub struct Bvh<const N: usize> {
    nodes: IndexVec<NodeIdx, Node<N>>,
    root: NodeRef,
    depth: usize,
    primitive_count: usize,
    has_motion: bool,
}

impl<const N: usize> Bvh<N> {
    /// Hierarchy without any primitives, its root is the empty reference.
    pub fn empty() -> Self {
        Bvh {
            nodes: IndexVec::new(),
            root: NodeRef::EMPTY,
            depth: 0,
            primitive_count: 0,
            has_motion: false,
        }
    }

    /// Creates a hierarchy from raw nodes, checking every structural invariant traversal relies on.
    ///
    /// `primitive_count` is the length of the primitive array the leaves index into.
    /// Nodes that are not reachable from the root are checked too, since they can still be
    /// handed to traversal as lazy nodes.
    pub fn from_nodes(
        nodes: IndexVec<NodeIdx, Node<N>>,
        root: NodeRef,
        primitive_count: usize,
    ) -> Result<Self, BvhError> {
        if !(2..=MAX_WIDTH).contains(&N) {
            return Err(BvhError::UnsupportedWidth(N));
        }

        let check_ref = |node: Option<usize>, child: NodeRef| match child.kind() {
            NodeKind::Inner(index) if index.index() >= nodes.len() => {
                Err(BvhError::DanglingNode {
                    node,
                    index: index.index(),
                })
            }
            NodeKind::Leaf(range) if range.end() > primitive_count => {
                Err(BvhError::PrimitiveOutOfRange {
                    end: range.end(),
                    count: primitive_count,
                })
            }
            _ => Ok(()),
        };

        if root.is_invalid() {
            return Err(BvhError::InvalidRoot);
        }
        check_ref(None, root)?;

        for (index, node) in nodes.iter_enumerated() {
            let index = index.index();
            let children = node.children();
            for (slot, child) in children.iter().enumerate() {
                if child.is_invalid() {
                    return Err(BvhError::InvalidChild { node: index, slot });
                }
                if slot >= node.child_count() {
                    if !child.is_empty() {
                        return Err(BvhError::ChildrenNotPrefix { node: index, slot });
                    }
                } else if child.is_empty() {
                    return Err(BvhError::ChildrenNotPrefix { node: index, slot });
                }
                check_ref(Some(index), *child)?;
            }
        }

        let heights = node_heights(&nodes)?;
        let depth = match root.kind() {
            NodeKind::Inner(index) => heights[index],
            _ => 0,
        };
        let bvh = Bvh {
            has_motion: nodes.iter().any(Node::is_motion),
            nodes,
            root,
            depth,
            primitive_count,
        };

        log::debug!(
            "BVH{N}: {} nodes, depth {}, {} primitives{}",
            bvh.nodes.len(),
            bvh.depth,
            bvh.primitive_count,
            if bvh.has_motion { ", motion blur" } else { "" }
        );

        Ok(bvh)
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn node(&self, index: NodeIdx) -> &Node<N> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &IndexVec<NodeIdx, Node<N>> {
        &self.nodes
    }

    /// Number of inner node levels on the longest path.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn primitive_count(&self) -> usize {
        self.primitive_count
    }

    pub fn has_motion(&self) -> bool {
        self.has_motion
    }

    /// Union of the root's children at time 0, `None` unless the root is an inner node.
    pub fn bounds(&self) -> Option<WorldBox> {
        let NodeKind::Inner(index) = self.root.kind() else {
            return None;
        };
        let node = &self.nodes[index];
        (0..node.child_count())
            .map(|slot| node.child_bounds(slot, 0.0))
            .reduce(|a, b| a.merge(&b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{assert, let_assert};

    fn unit_box(offset: f32) -> WorldBox {
        WorldBox::new(
            WorldPoint::new(offset, 0.0, 0.0),
            WorldPoint::new(offset + 1.0, 1.0, 1.0),
        )
    }

    fn leaf(first: u32) -> NodeRef {
        NodeRef::new_leaf(first.into(), 1)
    }

    #[test]
    fn two_level_tree() {
        let mut nodes = IndexVec::<NodeIdx, Node<4>>::new();
        let child = nodes.push(Node::Aligned(
            AlignedNode::new(&[(leaf(1), unit_box(2.0)), (leaf(2), unit_box(3.0))]).unwrap(),
        ));
        let root = nodes.push(Node::Aligned(
            AlignedNode::new(&[
                (leaf(0), unit_box(0.0)),
                (NodeRef::new_inner(child), unit_box(2.0).merge(&unit_box(3.0))),
            ])
            .unwrap(),
        ));
        let bvh = Bvh::from_nodes(nodes, NodeRef::new_inner(root), 3).unwrap();
        assert!(bvh.depth() == 2);
        assert!(!bvh.has_motion());
        let_assert!(Some(bounds) = bvh.bounds());
        assert!(bounds == WorldBox::new(WorldPoint::new(0.0, 0.0, 0.0), WorldPoint::new(4.0, 1.0, 1.0)));
    }

    #[test]
    fn empty_hierarchy() {
        let bvh = Bvh::<4>::empty();
        assert!(bvh.root().is_empty());
        assert!(bvh.bounds() == None);
        assert!(Bvh::<4>::from_nodes(IndexVec::new(), NodeRef::EMPTY, 0).is_ok());
    }

    #[test]
    fn too_many_children() {
        let children = vec![(leaf(0), unit_box(0.0)); 5];
        assert!(
            AlignedNode::<4>::new(&children) == Err(BvhError::TooManyChildren { count: 5, max: 4 })
        );
    }

    #[test]
    fn rejects_dangling_node() {
        let mut nodes = IndexVec::<NodeIdx, Node<4>>::new();
        nodes.push(Node::Aligned(
            AlignedNode::new(&[(NodeRef::new_inner(5u32.into()), unit_box(0.0))]).unwrap(),
        ));
        let result = Bvh::from_nodes(nodes, NodeRef::new_inner(0u32.into()), 0);
        assert!(result.unwrap_err() == BvhError::DanglingNode { node: Some(0), index: 5 });
    }

    #[test]
    fn rejects_missing_primitives() {
        let result = Bvh::<4>::from_nodes(IndexVec::new(), NodeRef::new_leaf(2u32.into(), 3), 4);
        assert!(result.unwrap_err() == BvhError::PrimitiveOutOfRange { end: 5, count: 4 });
    }

    #[test]
    fn rejects_gap_in_children() {
        let mut node = AlignedNode::<4>::new(&[(leaf(0), unit_box(0.0))]).unwrap();
        node.children[2] = leaf(0);
        let mut nodes = IndexVec::<NodeIdx, Node<4>>::new();
        nodes.push(Node::Aligned(node));
        let result = Bvh::from_nodes(nodes, NodeRef::new_inner(0u32.into()), 1);
        assert!(result.unwrap_err() == BvhError::ChildrenNotPrefix { node: 0, slot: 2 });
    }

    #[test]
    fn rejects_invalid_child_and_root() {
        let mut nodes = IndexVec::<NodeIdx, Node<4>>::new();
        nodes.push(Node::Aligned(
            AlignedNode::new(&[(NodeRef::INVALID, unit_box(0.0))]).unwrap(),
        ));
        let result = Bvh::from_nodes(nodes, NodeRef::new_inner(0u32.into()), 0);
        assert!(result.unwrap_err() == BvhError::InvalidChild { node: 0, slot: 0 });
        assert!(
            Bvh::<4>::from_nodes(IndexVec::new(), NodeRef::INVALID, 0).unwrap_err()
                == BvhError::InvalidRoot
        );
    }

    #[test]
    fn rejects_cycle() {
        let mut nodes = IndexVec::<NodeIdx, Node<2>>::new();
        nodes.push(Node::Aligned(
            AlignedNode::new(&[(NodeRef::new_inner(0u32.into()), unit_box(0.0))]).unwrap(),
        ));
        let result = Bvh::from_nodes(nodes, NodeRef::new_inner(0u32.into()), 0);
        assert!(result.unwrap_err() == BvhError::TooDeep);
    }

    fn chain(nodes: &mut IndexVec<NodeIdx, Node<2>>, length: usize) -> NodeIdx {
        let first = nodes.len();
        for i in 0..length {
            let child = if i + 1 == length {
                leaf(0)
            } else {
                NodeRef::new_inner(NodeIdx::from_usize(first + i + 1))
            };
            nodes.push(Node::Aligned(AlignedNode::new(&[(child, unit_box(0.0))]).unwrap()));
        }
        NodeIdx::from_usize(first)
    }

    #[test]
    fn chain_depth() {
        let mut nodes = IndexVec::new();
        let root = chain(&mut nodes, MAX_DEPTH);
        let bvh = Bvh::from_nodes(nodes, NodeRef::new_inner(root), 1).unwrap();
        assert!(bvh.depth() == MAX_DEPTH);

        let mut nodes = IndexVec::new();
        let root = chain(&mut nodes, MAX_DEPTH + 1);
        assert!(Bvh::from_nodes(nodes, NodeRef::new_inner(root), 1).unwrap_err() == BvhError::TooDeep);
    }

    /// Subtrees the root does not reach may still be returned as lazy nodes.
    #[test]
    fn unreachable_nodes_are_checked() {
        let mut nodes = IndexVec::new();
        chain(&mut nodes, 40);
        assert!(Bvh::from_nodes(nodes, leaf(0), 1).unwrap_err() == BvhError::TooDeep);

        let mut nodes = IndexVec::<NodeIdx, Node<2>>::new();
        nodes.push(Node::Aligned(
            AlignedNode::new(&[(NodeRef::new_inner(0u32.into()), unit_box(0.0))]).unwrap(),
        ));
        assert!(Bvh::from_nodes(nodes, leaf(0), 1).unwrap_err() == BvhError::TooDeep);

        let mut nodes = IndexVec::new();
        chain(&mut nodes, 5);
        let bvh = Bvh::from_nodes(nodes, leaf(0), 1).unwrap();
        assert!(bvh.depth() == 0);
    }

    #[test]
    fn shared_children_are_not_cycles() {
        let mut nodes = IndexVec::<NodeIdx, Node<2>>::new();
        let shared = chain(&mut nodes, 3);
        let shared_ref = NodeRef::new_inner(shared);
        let left = nodes.push(Node::Aligned(
            AlignedNode::new(&[(shared_ref, unit_box(0.0)), (leaf(0), unit_box(1.0))]).unwrap(),
        ));
        let root = nodes.push(Node::Aligned(
            AlignedNode::new(&[(NodeRef::new_inner(left), unit_box(0.0)), (shared_ref, unit_box(0.0))])
                .unwrap(),
        ));
        let bvh = Bvh::from_nodes(nodes, NodeRef::new_inner(root), 1).unwrap();
        assert!(bvh.depth() == 5);
    }

    #[test]
    fn rejects_unsupported_width() {
        assert!(
            Bvh::<16>::from_nodes(IndexVec::new(), NodeRef::EMPTY, 0).unwrap_err()
                == BvhError::UnsupportedWidth(16)
        );
    }

    #[test]
    fn motion_bounds_follow_time() {
        let node = Node::<4>::Motion(
            MotionNode::new(&[(leaf(0), unit_box(0.0), unit_box(10.0))]).unwrap(),
        );
        assert!(node.child_bounds(0, 0.0) == unit_box(0.0));
        assert!(node.child_bounds(0, 0.5) == unit_box(5.0));
        assert!(node.child_bounds(0, 1.0) == unit_box(10.0));
        assert!(node.child_count() == 1);
        assert!(node.children()[1].is_empty());
    }
}
