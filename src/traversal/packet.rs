//! Hybrid packet traversal: all lanes share one stack until few of them remain active,
//! then the survivors continue as single rays.

use simba::simd::{SimdPartialOrd as _, SimdValue as _};

use crate::{
    bvh::{NodeKind, NodeRef, PrimRange},
    primitive::PrimitiveIntersector,
    ray::RayPacket,
    util::{
        LaneMask,
        simba::{SimdFloat, bits, select},
    },
};

use super::{
    TraversalContext, TraversalStats, Traverser,
    box_test::{PacketTravRay, TravRay, intersect_child_packet},
    node_traverser::{Stack, StackItemPacket, visit_packet_child},
};

#[inline(always)]
pub(super) fn lanes<W: SimdFloat>(mask: W::SimdBool) -> LaneMask {
    LaneMask::from_bits(bits::<W>(mask))
}

impl<V: SimdFloat, P: PrimitiveIntersector, const N: usize> Traverser<'_, V, P, N> {
    /// Finds the closest hit of every active lane in `valid`.
    pub fn intersect_packet<W: SimdFloat>(
        &self,
        valid: LaneMask,
        packet: &mut RayPacket<W>,
        ctx: &TraversalContext,
    ) -> TraversalStats {
        let mut stats = TraversalStats::default();
        let valid = valid & packet.active_lanes();
        if valid.is_empty() || self.bvh.root().is_empty() {
            return stats;
        }

        let tray = PacketTravRay::new(packet, self.config.robust);
        let valid_mask = W::mask_from_bits(valid.bits());
        let ray_tnear = select(valid_mask, packet.tnear.fast_max(W::splat(0.0)), W::infinity());
        let mut ray_tfar = select(valid_mask, packet.tfar, W::neg_infinity());

        let mut stack = Stack::<StackItemPacket<W>>::new();
        stack.push(StackItemPacket {
            node: NodeRef::INVALID,
            near: W::infinity(),
        });
        stack.push(StackItemPacket {
            node: self.bvh.root(),
            near: ray_tnear,
        });

        while let Some(entry) = stack.pop() {
            stats.stack_pops += 1;
            if entry.node.is_invalid() {
                break;
            }

            let active = lanes::<W>(entry.near.simd_lt(ray_tfar));
            if active.is_empty() {
                continue;
            }
            if active.count() <= self.config.switch_threshold {
                self.intersect_lanes_single(entry.node, active, packet, ctx, &mut stats);
                ray_tfar = ray_tfar.fast_min(packet.tfar);
                continue;
            }

            let Some((range, cur_dist)) =
                self.descend_packet(entry, &tray, ray_tnear, ray_tfar, &mut stack, &mut stats)
            else {
                continue;
            };

            let valid_leaf = lanes::<W>(cur_dist.simd_lt(ray_tfar));
            if valid_leaf.is_empty() {
                continue;
            }
            stats.leaf_visits += 1;
            let outcome = self.primitives.intersect_packet(ctx, valid_leaf, packet, range);
            ray_tfar = select(W::mask_from_bits(valid_leaf.bits()), packet.tfar, ray_tfar);
            if let Some(lazy_node) = outcome.lazy_node {
                stack.push(StackItemPacket {
                    node: lazy_node,
                    near: W::neg_infinity(),
                });
            }
        }

        stats
    }

    /// Sets `geometry_id = 0` in every active lane of `valid` that hits anything.
    pub fn occluded_packet<W: SimdFloat>(
        &self,
        valid: LaneMask,
        packet: &mut RayPacket<W>,
        ctx: &TraversalContext,
    ) -> TraversalStats {
        let mut stats = TraversalStats::default();
        let valid = valid & packet.active_lanes();
        if valid.is_empty() || self.bvh.root().is_empty() {
            return stats;
        }

        let all_lanes = LaneMask::first(W::LANES);
        let tray = PacketTravRay::new(packet, self.config.robust);
        let valid_mask = W::mask_from_bits(valid.bits());
        let ray_tnear = select(valid_mask, packet.tnear.fast_max(W::splat(0.0)), W::infinity());
        let mut ray_tfar = select(valid_mask, packet.tfar, W::neg_infinity());
        let mut terminated = !valid & all_lanes;

        let mut stack = Stack::<StackItemPacket<W>>::new();
        stack.push(StackItemPacket {
            node: NodeRef::INVALID,
            near: W::infinity(),
        });
        stack.push(StackItemPacket {
            node: self.bvh.root(),
            near: ray_tnear,
        });

        while let Some(entry) = stack.pop() {
            stats.stack_pops += 1;
            if entry.node.is_invalid() {
                break;
            }

            let active = lanes::<W>(entry.near.simd_lt(ray_tfar));
            if active.is_empty() {
                continue;
            }
            if active.count() <= self.config.switch_threshold {
                terminated |= self.occluded_lanes_single(entry.node, active, packet, ctx, &mut stats);
                if terminated == all_lanes {
                    break;
                }
                ray_tfar = select(W::mask_from_bits(terminated.bits()), W::neg_infinity(), ray_tfar);
                continue;
            }

            let Some((range, cur_dist)) =
                self.descend_packet(entry, &tray, ray_tnear, ray_tfar, &mut stack, &mut stats)
            else {
                continue;
            };

            let valid_leaf = lanes::<W>(cur_dist.simd_lt(ray_tfar));
            if valid_leaf.is_empty() {
                continue;
            }
            stats.leaf_visits += 1;
            let outcome = self.primitives.occluded_packet(ctx, valid_leaf, packet, range);
            terminated |= outcome.result & valid_leaf;
            if terminated == all_lanes {
                break;
            }
            ray_tfar = select(W::mask_from_bits(terminated.bits()), W::neg_infinity(), ray_tfar);
            if let Some(lazy_node) = outcome.lazy_node {
                stack.push(StackItemPacket {
                    node: lazy_node,
                    near: W::neg_infinity(),
                });
            }
        }

        for lane in valid & terminated {
            packet.geometry_id.as_mut()[lane] = 0;
        }
        stats
    }

    /// Descends from a popped entry until a leaf is reached.
    ///
    /// Returns `None` when no child is hit any more, or when the entry was pushed back
    /// because too few lanes remain for packet traversal.
    fn descend_packet<W: SimdFloat>(
        &self,
        entry: StackItemPacket<W>,
        tray: &PacketTravRay<W>,
        ray_tnear: W,
        ray_tfar: W,
        stack: &mut Stack<StackItemPacket<W>>,
        stats: &mut TraversalStats,
    ) -> Option<(PrimRange, W)> {
        let mut cur = entry.node;
        let mut cur_dist = entry.near;
        loop {
            let index = match cur.kind() {
                NodeKind::Inner(index) => index,
                NodeKind::Leaf(range) => return Some((range, cur_dist)),
                NodeKind::Empty | NodeKind::Invalid => return None,
            };

            let valid_node = cur_dist.simd_lt(ray_tfar);
            stats.node_visits += 1;
            stats.ray_node_tests += lanes::<W>(valid_node).count() as u64;
            let node_tfar = select(valid_node, ray_tfar, W::neg_infinity());

            let node = self.bvh.node(index);
            cur = NodeRef::EMPTY;
            cur_dist = W::infinity();
            for slot in 0..node.child_count() {
                let (hit, near) =
                    intersect_child_packet(node, slot, tray, ray_tnear, node_tfar, self.config.robust);
                if bits::<W>(hit) == 0 {
                    continue;
                }
                let child_dist = select(hit, near, W::infinity());
                visit_packet_child(node.children()[slot], child_dist, &mut cur, &mut cur_dist, stack);
            }

            if cur.is_empty() {
                return None;
            }
            if self.config.switch_during_descent
                && lanes::<W>(cur_dist.simd_lt(ray_tfar)).count() <= self.config.switch_threshold
            {
                stack.push(StackItemPacket {
                    node: cur,
                    near: cur_dist,
                });
                return None;
            }
        }
    }

    fn intersect_lanes_single<W: SimdFloat>(
        &self,
        start: NodeRef,
        active: LaneMask,
        packet: &mut RayPacket<W>,
        ctx: &TraversalContext,
        stats: &mut TraversalStats,
    ) {
        stats.single_ray_switches += 1;
        for lane in active {
            let mut ray = packet.get(lane);
            let tray = TravRay::new(&ray, self.config.robust);
            self.intersect1(start, &mut ray, &tray, ctx, stats);
            packet.set_hit(lane, &ray);
        }
    }

    /// Returns the lanes that turned out occluded.
    fn occluded_lanes_single<W: SimdFloat>(
        &self,
        start: NodeRef,
        active: LaneMask,
        packet: &RayPacket<W>,
        ctx: &TraversalContext,
        stats: &mut TraversalStats,
    ) -> LaneMask {
        stats.single_ray_switches += 1;
        active
            .iter()
            .filter(|&lane| {
                let ray = packet.get(lane);
                let tray = TravRay::new(&ray, self.config.robust);
                self.occluded1(start, &ray, &tray, ctx, stats)
            })
            .collect()
    }
}
