//! Coherent stream traversal of up to 64 rays from one direction octant.
//!
//! A frustum bounding all rays culls children coarsely, surviving children are tested per
//! packet, and a child inherits every active lane of each packet with at least one hit.
//! Because of that packet granularity a leaf is re-tested lane by lane against the slot of
//! its parent before its primitives are intersected.

use arrayvec::ArrayVec;
use simba::simd::{SimdPartialOrd as _, SimdValue as _};

use crate::{
    bvh::{Node, NodeKind, NodeRef, PrimRange},
    primitive::PrimitiveIntersector,
    ray::RayPacket,
    util::{
        LaneMask,
        simba::{SimdFloat, bits, select},
    },
};

use super::{
    MAX_STREAM_RAYS, TraversalContext, TraversalStats, Traverser,
    box_test::{NearFar, PacketTravRay, intersect_child_packet},
    node_traverser::{ParentSlot, Stack, StackItemCoherent, traverse_coherent},
    packet::lanes,
};

/// Interval bound of the reciprocal directions and ray ranges of a ray group.
/// All rays must share one direction octant.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Frustum {
    pub min_rdir: [f32; 3],
    pub max_rdir: [f32; 3],
    pub min_org_rdir: [f32; 3],
    pub max_org_rdir: [f32; 3],
    pub min_dist: f32,
    pub max_dist: f32,
    pub near_far: NearFar,
}

impl Frustum {
    /// Children that any ray of the group might hit.
    pub fn intersect<V: SimdFloat, const N: usize>(&self, node: &Node<N>) -> LaneMask {
        let time = V::splat(0.0);
        let mut tnear = V::splat(self.min_dist);
        let mut tfar = V::splat(self.max_dist);
        for axis in 0..3 {
            let near_bound = node.slab::<V>(self.near_far.near(axis), axis, time);
            let far_bound = node.slab::<V>(self.near_far.far(axis), axis, time);
            let min_rdir = V::splat(self.min_rdir[axis]);
            let max_rdir = V::splat(self.max_rdir[axis]);

            let lo = (near_bound * min_rdir).fast_min(near_bound * max_rdir)
                - V::splat(self.max_org_rdir[axis]);
            let hi = (far_bound * min_rdir).fast_max(far_bound * max_rdir)
                - V::splat(self.min_org_rdir[axis]);
            tnear = tnear.fast_max(lo);
            tfar = tfar.fast_min(hi);
        }
        LaneMask::from_bits(bits::<V>(tnear.simd_le(tfar))) & LaneMask::first(node.child_count())
    }
}

/// Per call state shared by all nodes of a coherent traversal.
struct CoherentSetup<W: SimdFloat> {
    /// Stream lanes (packet `p`, lane `l` is bit `p * W::LANES + l`) that started active.
    active: LaneMask,
    rays: ArrayVec<PacketTravRay<W>, MAX_STREAM_RAYS>,
    /// Clamped `tnear`, `+inf` in inactive lanes.
    tnear: ArrayVec<W, MAX_STREAM_RAYS>,
    frustum: Frustum,
}

fn init_packets_and_frustum<W: SimdFloat>(packets: &[RayPacket<W>]) -> CoherentSetup<W> {
    assert!(packets.len() * W::LANES <= MAX_STREAM_RAYS);

    let mut active = LaneMask::EMPTY;
    let mut rays = ArrayVec::new();
    let mut tnears = ArrayVec::new();
    let mut frustum = Frustum {
        min_rdir: [f32::INFINITY; 3],
        max_rdir: [f32::NEG_INFINITY; 3],
        min_org_rdir: [f32::INFINITY; 3],
        max_org_rdir: [f32::NEG_INFINITY; 3],
        min_dist: f32::INFINITY,
        max_dist: f32::NEG_INFINITY,
        near_far: NearFar::from_rdir([0.0; 3]),
    };

    for (p, packet) in packets.iter().enumerate() {
        let tray = PacketTravRay::new(packet, false);
        let local = packet.active_lanes();
        let tnear = select(
            W::mask_from_bits(local.bits()),
            packet.tnear.fast_max(W::splat(0.0)),
            W::infinity(),
        );

        for lane in local {
            let rdir = tray.rdir.extract(lane);
            let org_rdir = tray.org_rdir.extract(lane);
            for axis in 0..3 {
                frustum.min_rdir[axis] = frustum.min_rdir[axis].min(rdir[axis]);
                frustum.max_rdir[axis] = frustum.max_rdir[axis].max(rdir[axis]);
                frustum.min_org_rdir[axis] = frustum.min_org_rdir[axis].min(org_rdir[axis]);
                frustum.max_org_rdir[axis] = frustum.max_org_rdir[axis].max(org_rdir[axis]);
            }
            frustum.min_dist = frustum.min_dist.min(tnear.extract(lane));
            frustum.max_dist = frustum.max_dist.max(packet.tfar.extract(lane));
            if active.is_empty() {
                frustum.near_far = NearFar::from_rdir(rdir.into());
            }
            active |= LaneMask::from_packet(LaneMask::single(lane), p, W::LANES);
        }

        rays.push(tray);
        tnears.push(tnear);
    }

    CoherentSetup {
        active,
        rays,
        tnear: tnears,
        frustum,
    }
}

/// Largest `tfar` among the given stream lanes.
fn max_tfar<W: SimdFloat>(packets: &[RayPacket<W>], mask: LaneMask) -> f32 {
    mask.packets(W::LANES)
        .map(|p| {
            let local = mask.packet(p, W::LANES);
            select(
                W::mask_from_bits(local.bits()),
                packets[p].tfar,
                W::neg_infinity(),
            )
            .simd_horizontal_max()
        })
        .fold(f32::NEG_INFINITY, f32::max)
}

struct CoherentLeaf {
    range: PrimRange,
    mask: LaneMask,
    parent: Option<ParentSlot>,
}

impl<V: SimdFloat, P: PrimitiveIntersector, const N: usize> Traverser<'_, V, P, N> {
    pub(super) fn intersect_coherent<W: SimdFloat>(
        &self,
        packets: &mut [RayPacket<W>],
        ctx: &TraversalContext,
        stats: &mut TraversalStats,
    ) {
        if self.bvh.root().is_empty() {
            return;
        }
        let mut setup = init_packets_and_frustum(packets);
        if setup.active.is_empty() {
            return;
        }

        let mut stack = Stack::<StackItemCoherent>::new();
        stack.push(StackItemCoherent {
            node: NodeRef::INVALID,
            mask: LaneMask::EMPTY,
            parent: None,
        });
        stack.push(StackItemCoherent {
            node: self.bvh.root(),
            mask: setup.active,
            parent: None,
        });

        while let Some(entry) = stack.pop() {
            stats.stack_pops += 1;
            if entry.node.is_invalid() {
                break;
            }

            let Some(leaf) = self.descend_coherent(entry, &setup, packets, true, &mut stack, stats)
            else {
                continue;
            };
            let mask = self.exact_leaf_lanes(&leaf, &setup, packets, stats);
            if mask.is_empty() {
                continue;
            }

            stats.leaf_visits += 1;
            let mut lazy_node = None;
            for p in mask.packets(W::LANES) {
                let local = mask.packet(p, W::LANES);
                let outcome = self.primitives.intersect_packet(ctx, local, &mut packets[p], leaf.range);
                lazy_node = lazy_node.or(outcome.lazy_node);
            }
            setup.frustum.max_dist = max_tfar(packets, setup.active);

            if let Some(lazy_node) = lazy_node {
                stack.push(StackItemCoherent {
                    node: lazy_node,
                    mask,
                    parent: None,
                });
            }
        }
    }

    pub(super) fn occluded_coherent<W: SimdFloat>(
        &self,
        packets: &mut [RayPacket<W>],
        ctx: &TraversalContext,
        stats: &mut TraversalStats,
    ) {
        if self.bvh.root().is_empty() {
            return;
        }
        let setup = init_packets_and_frustum(packets);
        let mut m_active = setup.active;
        if m_active.is_empty() {
            return;
        }

        let mut stack = Stack::<StackItemCoherent>::new();
        stack.push(StackItemCoherent {
            node: NodeRef::INVALID,
            mask: LaneMask::EMPTY,
            parent: None,
        });
        stack.push(StackItemCoherent {
            node: self.bvh.root(),
            mask: m_active,
            parent: None,
        });

        while let Some(mut entry) = stack.pop() {
            stats.stack_pops += 1;
            if entry.node.is_invalid() {
                break;
            }

            entry.mask &= m_active;
            if entry.mask.is_empty() {
                continue;
            }

            let Some(mut leaf) =
                self.descend_coherent(entry, &setup, packets, false, &mut stack, stats)
            else {
                continue;
            };
            leaf.mask &= m_active;
            let mask = self.exact_leaf_lanes(&leaf, &setup, packets, stats);
            if mask.is_empty() {
                continue;
            }

            stats.leaf_visits += 1;
            let mut lazy_node = None;
            for p in mask.packets(W::LANES) {
                let local = mask.packet(p, W::LANES);
                let outcome = self.primitives.occluded_packet(ctx, local, &packets[p], leaf.range);
                let hits = outcome.result & local;
                for lane in hits {
                    packets[p].geometry_id.as_mut()[lane] = 0;
                }
                m_active &= !LaneMask::from_packet(hits, p, W::LANES);
                lazy_node = lazy_node.or(outcome.lazy_node);
            }
            if m_active.is_empty() {
                break;
            }

            if let Some(lazy_node) = lazy_node {
                stack.push(StackItemCoherent {
                    node: lazy_node,
                    mask: mask & m_active,
                    parent: None,
                });
            }
        }
    }

    /// Descends from a popped entry until a leaf is reached, `None` if nothing is hit.
    /// `closest` selects closest-hit ordering, otherwise children are visited by slot.
    fn descend_coherent<W: SimdFloat>(
        &self,
        entry: StackItemCoherent,
        setup: &CoherentSetup<W>,
        packets: &[RayPacket<W>],
        closest: bool,
        stack: &mut Stack<StackItemCoherent>,
        stats: &mut TraversalStats,
    ) -> Option<CoherentLeaf> {
        let mut cur = entry;
        loop {
            let index = match cur.node.kind() {
                NodeKind::Inner(index) => index,
                NodeKind::Leaf(range) => {
                    return Some(CoherentLeaf {
                        range,
                        mask: cur.mask,
                        parent: cur.parent,
                    });
                }
                NodeKind::Empty | NodeKind::Invalid => return None,
            };

            stats.node_visits += 1;
            let node = self.bvh.node(index);
            let frustum_hits = setup.frustum.intersect::<V, N>(node);
            if frustum_hits.is_empty() {
                return None;
            }

            let mut masks = [LaneMask::EMPTY; N];
            let mut dist = [f32::INFINITY; N];
            for slot in frustum_hits {
                for p in cur.mask.packets(W::LANES) {
                    let local = cur.mask.packet(p, W::LANES);
                    stats.ray_node_tests += local.count() as u64;
                    let (hit, near) = intersect_child_packet(
                        node,
                        slot,
                        &setup.rays[p],
                        setup.tnear[p],
                        packets[p].tfar,
                        false,
                    );
                    let hit = lanes::<W>(hit) & local;
                    if hit.is_empty() {
                        continue;
                    }
                    masks[slot] |= LaneMask::from_packet(local, p, W::LANES);
                    dist[slot] = hit.iter().map(|lane| near.extract(lane)).fold(dist[slot], f32::min);
                }
            }

            let hits: LaneMask = (0..N).filter(|&slot| !masks[slot].is_empty()).collect();
            if hits.is_empty() {
                return None;
            }
            cur = traverse_coherent(index, node.children(), hits, &masks, closest.then_some(&dist), stack);
        }
    }

    /// Lanes of the leaf that really hit the parent slot it was reached through.
    fn exact_leaf_lanes<W: SimdFloat>(
        &self,
        leaf: &CoherentLeaf,
        setup: &CoherentSetup<W>,
        packets: &[RayPacket<W>],
        stats: &mut TraversalStats,
    ) -> LaneMask {
        let Some(parent) = leaf.parent else {
            return leaf.mask;
        };
        let node = self.bvh.node(parent.node);
        leaf.mask
            .packets(W::LANES)
            .map(|p| {
                let local = leaf.mask.packet(p, W::LANES);
                stats.ray_node_tests += local.count() as u64;
                let (hit, _) = intersect_child_packet(
                    node,
                    parent.slot,
                    &setup.rays[p],
                    setup.tnear[p],
                    packets[p].tfar,
                    false,
                );
                LaneMask::from_packet(lanes::<W>(hit) & local, p, W::LANES)
            })
            .fold(LaneMask::EMPTY, |acc, m| acc | m)
    }
}
