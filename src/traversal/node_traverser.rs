//! Stack entries and the child ordering shared by all traversal variants.
//!
//! Closest-hit ordering continues with the nearest hit child and pushes the others so that
//! the next nearest is popped first. Distance ties are broken by slot index, which keeps the
//! order deterministic. Any-hit ordering ignores distances and walks slots in increasing order.

use arrayvec::ArrayVec;
use ordered_float::OrderedFloat;
use simba::simd::{SimdPartialOrd as _, SimdValue as _};

use crate::{
    bvh::{MAX_DEPTH, MAX_WIDTH, NodeIdx, NodeRef},
    util::{
        BoundedStack, LaneMask,
        simba::{SimdFloat, bits},
    },
};

/// Entries needed for the deepest supported hierarchy: up to `MAX_WIDTH - 1` deferred
/// children per level, plus room for the sentinel and lazy nodes.
pub const STACK_CAPACITY: usize = MAX_DEPTH * (MAX_WIDTH - 1) + 32;

pub type Stack<T> = BoundedStack<T, STACK_CAPACITY>;

#[derive(Copy, Clone, Debug)]
pub struct StackItem {
    pub node: NodeRef,
    /// Entry distance of the ray into the node's box.
    pub dist: f32,
}

/// Entry of a stream traversal, `mask` holds the rays that hit the node.
#[derive(Copy, Clone, Debug)]
pub struct StackItemMask {
    pub node: NodeRef,
    pub mask: LaneMask,
    /// Smallest entry distance among the rays in `mask`.
    pub dist: f32,
}

/// Child slot of an inner node, where a coherent entry came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ParentSlot {
    pub node: NodeIdx,
    pub slot: usize,
}

#[derive(Copy, Clone, Debug)]
pub struct StackItemCoherent {
    pub node: NodeRef,
    pub mask: LaneMask,
    /// `None` for the root and for lazy nodes.
    pub parent: Option<ParentSlot>,
}

#[derive(Copy, Clone, Debug)]
pub struct StackItemPacket<W: SimdFloat> {
    pub node: NodeRef,
    /// Per lane entry distance, `+inf` in lanes that missed the node.
    pub near: W,
}

/// Hit slots sorted nearest first, ties by slot index.
fn closest_hit_order<const N: usize>(
    hits: LaneMask,
    dist: impl Fn(usize) -> f32,
) -> ArrayVec<usize, N> {
    let mut order: ArrayVec<usize, N> = hits.iter().collect();
    order.sort_unstable_by_key(|&slot| (OrderedFloat(dist(slot)), slot));
    order
}

fn any_hit_order<const N: usize>(hits: LaneMask) -> ArrayVec<usize, N> {
    hits.iter().collect()
}

/// Pushes all but the first element of `order` so that the second one ends up on top.
/// Returns the first element. `order` must not be empty.
fn push_and_select<T: Copy>(
    order: &[usize],
    stack: &mut Stack<T>,
    item: impl Fn(usize) -> T,
) -> T {
    assert!(!order.is_empty());
    for &slot in order[1..].iter().rev() {
        stack.push(item(slot));
    }
    item(order[0])
}

/// Single ray closest-hit step: returns the child to descend into and pushes the other hits.
/// `hits` must not be empty.
pub fn traverse_closest_hit<V: SimdFloat, const N: usize>(
    children: &[NodeRef; N],
    hits: LaneMask,
    dist: V,
    stack: &mut Stack<StackItem>,
) -> NodeRef {
    let order = closest_hit_order::<N>(hits, |slot| dist.extract(slot));
    push_and_select(&order, stack, |slot| StackItem {
        node: children[slot],
        dist: dist.extract(slot),
    })
    .node
}

/// Single ray any-hit step: descends into the lowest hit slot.
pub fn traverse_any_hit<const N: usize>(
    children: &[NodeRef; N],
    hits: LaneMask,
    stack: &mut Stack<StackItem>,
) -> NodeRef {
    let order = any_hit_order::<N>(hits);
    push_and_select(&order, stack, |slot| StackItem {
        node: children[slot],
        dist: f32::NEG_INFINITY,
    })
    .node
}

/// Stream closest-hit step, every child carries the rays that hit it.
pub fn traverse_closest_hit_stream<const N: usize>(
    children: &[NodeRef; N],
    hits: LaneMask,
    masks: &[LaneMask; N],
    dist: &[f32; N],
    stack: &mut Stack<StackItemMask>,
) -> StackItemMask {
    let order = closest_hit_order::<N>(hits, |slot| dist[slot]);
    push_and_select(&order, stack, |slot| StackItemMask {
        node: children[slot],
        mask: masks[slot],
        dist: dist[slot],
    })
}

pub fn traverse_any_hit_stream<const N: usize>(
    children: &[NodeRef; N],
    hits: LaneMask,
    masks: &[LaneMask; N],
    dist: &[f32; N],
    stack: &mut Stack<StackItemMask>,
) -> StackItemMask {
    let order = any_hit_order::<N>(hits);
    push_and_select(&order, stack, |slot| StackItemMask {
        node: children[slot],
        mask: masks[slot],
        dist: dist[slot],
    })
}

/// Coherent step, entries remember the slot of `parent` they were reached through.
pub fn traverse_coherent<const N: usize>(
    parent: NodeIdx,
    children: &[NodeRef; N],
    hits: LaneMask,
    masks: &[LaneMask; N],
    dist: Option<&[f32; N]>,
    stack: &mut Stack<StackItemCoherent>,
) -> StackItemCoherent {
    let order = match dist {
        Some(dist) => closest_hit_order::<N>(hits, |slot| dist[slot]),
        None => any_hit_order::<N>(hits),
    };
    push_and_select(&order, stack, |slot| StackItemCoherent {
        node: children[slot],
        mask: masks[slot],
        parent: Some(ParentSlot { node: parent, slot }),
    })
}

/// Packet step for one hit child.
///
/// Continues with the child and defers the current node if the child is nearer in any lane,
/// otherwise defers the child. `cur` is `Empty` before the first hit child of a node.
pub fn visit_packet_child<W: SimdFloat>(
    child: NodeRef,
    child_dist: W,
    cur: &mut NodeRef,
    cur_dist: &mut W,
    stack: &mut Stack<StackItemPacket<W>>,
) {
    if bits::<W>(child_dist.simd_lt(*cur_dist)) != 0 {
        if !cur.is_empty() {
            stack.push(StackItemPacket {
                node: *cur,
                near: *cur_dist,
            });
        }
        *cur = child;
        *cur_dist = child_dist;
    } else {
        stack.push(StackItemPacket {
            node: child,
            near: child_dist,
        });
    }
}
