use std::array;

use bon::bon;
use index_vec::IndexVec;
use itertools::Itertools as _;
use ordered_float::OrderedFloat;

use crate::geometry::{WorldBox, WorldPoint};

use super::{AlignedNode, Bvh, BvhError, Node, NodeIdx, NodeRef, PrimIdx};

/// Anything the builder can put in a leaf.
pub trait Bounded {
    fn bounds(&self) -> WorldBox;

    fn centroid(&self) -> WorldPoint {
        self.bounds().center()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BvhBuildSettings {
    max_leaf_size: usize,
}

#[bon]
impl BvhBuildSettings {
    #[builder]
    pub fn new(#[builder(default = 4)] max_leaf_size: usize) -> Result<Self, BvhError> {
        if max_leaf_size == 0 {
            return Err(BvhError::EmptyLeaf);
        }
        let max = NodeRef::MAX_LEAF_SIZE as usize;
        if max_leaf_size > max {
            return Err(BvhError::LeafTooLarge {
                size: max_leaf_size,
                max,
            });
        }
        Ok(BvhBuildSettings { max_leaf_size })
    }
}

impl BvhBuildSettings {
    pub fn max_leaf_size(&self) -> usize {
        self.max_leaf_size
    }
}

impl Default for BvhBuildSettings {
    fn default() -> Self {
        BvhBuildSettings { max_leaf_size: 4 }
    }
}

impl<const N: usize> Bvh<N> {
    /// Builds a hierarchy over `items` using equal count splits along the longest centroid axis.
    ///
    /// Reorders `items` so that every leaf references a contiguous range of it;
    /// leaf [`PrimIdx`] values are positions in the reordered slice.
    pub fn build<T: Bounded>(items: &mut [T], settings: &BvhBuildSettings) -> Result<Self, BvhError> {
        if !(2..=super::MAX_WIDTH).contains(&N) {
            return Err(BvhError::UnsupportedWidth(N));
        }
        if items.len() > NodeRef::MAX_INDEX as usize {
            return Err(BvhError::TooManyPrimitives(items.len()));
        }
        if items.is_empty() {
            return Ok(Bvh::empty());
        }

        let mut builder = Builder::<N> {
            nodes: IndexVec::new(),
            max_leaf_size: settings.max_leaf_size,
        };
        let root = builder.build_recursive(items, 0)?;

        Bvh::from_nodes(builder.nodes, root, items.len())
    }
}

struct Builder<const N: usize> {
    nodes: IndexVec<NodeIdx, Node<N>>,
    max_leaf_size: usize,
}

impl<const N: usize> Builder<N> {
    /// `offset` is the position of `items[0]` in the whole primitive array.
    fn build_recursive<T: Bounded>(
        &mut self,
        items: &mut [T],
        offset: usize,
    ) -> Result<NodeRef, BvhError> {
        if items.len() <= self.max_leaf_size {
            Ok(NodeRef::new_leaf(
                PrimIdx::from_usize(offset),
                items.len() as u32,
            ))
        } else {
            self.build_inner_node(items, offset)
        }
    }

    fn build_inner_node<T: Bounded>(
        &mut self,
        items: &mut [T],
        offset: usize,
    ) -> Result<NodeRef, BvhError> {
        sort_along_longest_axis(items);
        let split_indices = split_items::<N>(items.len());

        // Create placeholder node that will be overwriten later
        let node_index = self.nodes.push(Node::Aligned(AlignedNode::empty()));

        let mut children = Vec::with_capacity(N);
        for (&start, &end) in split_indices.iter().tuple_windows() {
            if start == end {
                continue;
            }
            let part = &mut items[start..end];
            let Some(bounds) = part.iter().map(Bounded::bounds).reduce(|a, b| a.merge(&b)) else {
                continue;
            };
            let child = self.build_recursive(part, offset + start)?;
            children.push((child, bounds.round_out()));
        }

        // Replace the placeholder with an actual inner node
        self.nodes[node_index] = Node::Aligned(AlignedNode::new(&children)?);

        Ok(NodeRef::new_inner(node_index))
    }
}

fn sort_along_longest_axis<T: Bounded>(items: &mut [T]) {
    let centroids = items.iter().map(Bounded::centroid).collect_vec();
    let Some(centroid_bounds) = WorldBox::from_points(centroids.iter()) else {
        return;
    };
    let axis = centroid_bounds.longest_axis();
    items.sort_by_cached_key(|item| OrderedFloat(item.centroid()[axis]));
}

/// Returns indices in the item array where the children should be split.
/// Array is one larger than N, first item is always 0, last item is always `len`.
fn split_items<const N: usize>(len: usize) -> Vec<usize> {
    array::from_fn::<usize, N, _>(|i| i * len / N)
        .into_iter()
        .chain([len])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::NodeKind;
    use assert2::{assert, let_assert};
    use test_case::test_case;

    #[derive(Clone, Debug)]
    struct Point(WorldPoint);

    impl Bounded for Point {
        fn bounds(&self) -> WorldBox {
            WorldBox::new(self.0, self.0)
        }
    }

    fn points(count: usize) -> Vec<Point> {
        (0..count)
            .map(|i| Point(WorldPoint::new((i * 7 % 13) as f32, (i % 5) as f32, (i / 3) as f32)))
            .collect()
    }

    /// Walks the hierarchy and returns the primitive indices covered by leaves, checking
    /// that every child box contains its primitives.
    fn collect_leaves<const N: usize>(bvh: &Bvh<N>, items: &[Point]) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![(bvh.root(), None::<WorldBox>)];
        while let Some((node, bounds)) = stack.pop() {
            match node.kind() {
                NodeKind::Inner(index) => {
                    let node = bvh.node(index);
                    for slot in 0..node.child_count() {
                        stack.push((node.children()[slot], Some(node.child_bounds(slot, 0.0))));
                    }
                }
                NodeKind::Leaf(range) => {
                    for prim in range.iter() {
                        if let Some(b) = &bounds {
                            assert!(b.contains(&items[prim.index()].0));
                        }
                        out.push(prim.index());
                    }
                }
                NodeKind::Empty | NodeKind::Invalid => {}
            }
        }
        out.sort();
        out
    }

    #[test_case(1 ; "single")]
    #[test_case(4 ; "one_leaf")]
    #[test_case(5 ; "just_over_leaf")]
    #[test_case(100 ; "many")]
    #[test_case(1000 ; "lots")]
    fn covers_every_item_once(count: usize) {
        let mut items = points(count);
        let bvh = Bvh::<4>::build(&mut items, &BvhBuildSettings::default()).unwrap();
        assert!(collect_leaves(&bvh, &items) == (0..count).collect::<Vec<_>>());
        assert!(bvh.primitive_count() == count);
    }

    #[test]
    fn wide_nodes_are_shallow() {
        let mut items = points(1000);
        let bvh = Bvh::<8>::build(&mut items, &BvhBuildSettings::default()).unwrap();
        assert!(bvh.depth() <= 4);
        assert!(collect_leaves(&bvh, &items).len() == 1000);
    }

    #[test]
    fn empty_input() {
        let bvh = Bvh::<4>::build::<Point>(&mut [], &BvhBuildSettings::default()).unwrap();
        assert!(bvh.root().is_empty());
    }

    #[test]
    fn small_input_is_a_leaf() {
        let mut items = points(3);
        let bvh = Bvh::<4>::build(&mut items, &BvhBuildSettings::default()).unwrap();
        let_assert!(NodeKind::Leaf(range) = bvh.root().kind());
        assert!(range.len() == 3);
        assert!(bvh.depth() == 0);
    }

    #[test]
    fn settings_validation() {
        assert!(BvhBuildSettings::builder().build().unwrap().max_leaf_size() == 4);
        assert!(BvhBuildSettings::builder().max_leaf_size(0).build() == Err(BvhError::EmptyLeaf));
        assert!(
            BvhBuildSettings::builder().max_leaf_size(16).build()
                == Err(BvhError::LeafTooLarge { size: 16, max: 15 })
        );
    }

    #[test]
    fn split_indices() {
        assert!(split_items::<4>(10) == vec![0, 2, 5, 7, 10]);
        assert!(split_items::<4>(2) == vec![0, 0, 1, 1, 2]);
    }
}
