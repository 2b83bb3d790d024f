//! Incoherent stream traversal.
//!
//! Active rays are grouped by direction octant into groups of at most 64. Every group shares
//! one stack whose entries carry the set of rays that reached the node, while each ray is
//! tested against the node boxes on its own.

use arrayvec::ArrayVec;
use simba::simd::SimdValue as _;

use crate::{
    bvh::{NodeKind, NodeRef},
    primitive::PrimitiveIntersector,
    ray::Ray,
    util::{LaneMask, simba::SimdFloat},
};

use super::{
    MAX_STREAM_RAYS, Query, TraversalContext, TraversalStats, Traverser,
    box_test::{TravRay, intersect_node},
    node_traverser::{Stack, StackItemMask, traverse_any_hit_stream, traverse_closest_hit_stream},
};

/// Rays traced together with one shared stack.
const MAX_RAYS_PER_OCTANT: usize = MAX_STREAM_RAYS;

type Group = ArrayVec<usize, MAX_RAYS_PER_OCTANT>;

impl<V: SimdFloat, P: PrimitiveIntersector, const N: usize> Traverser<'_, V, P, N> {
    pub(super) fn intersect_incoherent(
        &self,
        rays: &mut [Ray],
        ctx: &TraversalContext,
        stats: &mut TraversalStats,
    ) {
        self.trace_octant_groups(rays, ctx, Query::Intersect, stats);
    }

    pub(super) fn occluded_incoherent(
        &self,
        rays: &mut [Ray],
        ctx: &TraversalContext,
        stats: &mut TraversalStats,
    ) {
        self.trace_octant_groups(rays, ctx, Query::Occluded, stats);
    }

    fn trace_octant_groups(
        &self,
        rays: &mut [Ray],
        ctx: &TraversalContext,
        query: Query,
        stats: &mut TraversalStats,
    ) {
        if self.bvh.root().is_empty() {
            return;
        }

        let mut groups: [Group; 8] = Default::default();
        for i in 0..rays.len() {
            if !rays[i].is_active() {
                continue;
            }
            let group = &mut groups[rays[i].octant()];
            group.push(i);
            if group.is_full() {
                self.trace_group(group, rays, ctx, query, stats);
                group.clear();
            }
        }
        for group in &groups {
            if !group.is_empty() {
                self.trace_group(group, rays, ctx, query, stats);
            }
        }
    }

    /// Traces rays of one octant, `group` holds their indices into `rays`.
    fn trace_group(
        &self,
        group: &[usize],
        rays: &mut [Ray],
        ctx: &TraversalContext,
        query: Query,
        stats: &mut TraversalStats,
    ) {
        let robust = self.config.robust;
        let mut local: ArrayVec<Ray, MAX_RAYS_PER_OCTANT> = group.iter().map(|&i| rays[i]).collect();
        let trays: ArrayVec<TravRay, MAX_RAYS_PER_OCTANT> =
            local.iter().map(|ray| TravRay::new(ray, robust)).collect();
        let Some(near_far) = trays.first().map(|tray| tray.near_far) else {
            return;
        };
        let closest = query == Query::Intersect;
        let mut m_active = LaneMask::first(local.len());

        let mut stack = Stack::<StackItemMask>::new();
        stack.push(StackItemMask {
            node: NodeRef::INVALID,
            mask: LaneMask::EMPTY,
            dist: f32::INFINITY,
        });
        stack.push(StackItemMask {
            node: self.bvh.root(),
            mask: m_active,
            dist: f32::NEG_INFINITY,
        });

        'pop: while let Some(entry) = stack.pop() {
            stats.stack_pops += 1;
            if entry.node.is_invalid() {
                break;
            }

            let mut cur = entry;
            cur.mask &= m_active;
            if closest {
                cur.mask = cur
                    .mask
                    .iter()
                    .filter(|&i| cur.dist <= local[i].tfar)
                    .collect();
            }
            if cur.mask.is_empty() {
                continue;
            }

            let range = loop {
                match cur.node.kind() {
                    NodeKind::Inner(index) => {
                        stats.node_visits += 1;
                        let node = self.bvh.node(index);
                        let mut masks = [LaneMask::EMPTY; N];
                        let mut dist = [f32::INFINITY; N];
                        for i in cur.mask {
                            stats.ray_node_tests += 1;
                            let (hits, near) =
                                intersect_node::<V, N>(node, &trays[i], &near_far, local[i].tfar, robust);
                            for slot in hits {
                                masks[slot].set(i);
                                dist[slot] = dist[slot].min(near.extract(slot));
                            }
                        }

                        let hits: LaneMask = (0..N).filter(|&slot| !masks[slot].is_empty()).collect();
                        if hits.is_empty() {
                            continue 'pop;
                        }
                        cur = if closest {
                            traverse_closest_hit_stream(node.children(), hits, &masks, &dist, &mut stack)
                        } else {
                            traverse_any_hit_stream(node.children(), hits, &masks, &dist, &mut stack)
                        };
                    }
                    NodeKind::Leaf(range) => break range,
                    NodeKind::Empty | NodeKind::Invalid => continue 'pop,
                }
            };

            stats.leaf_visits += 1;
            let lazy_node = match query {
                Query::Intersect => {
                    self.primitives
                        .intersect_stream(ctx, cur.mask, &mut local, range)
                        .lazy_node
                }
                Query::Occluded => {
                    let outcome = self.primitives.occluded_stream(ctx, cur.mask, &local, range);
                    let occluded = outcome.result & cur.mask;
                    for i in occluded {
                        local[i].set_occluded();
                    }
                    m_active &= !occluded;
                    if m_active.is_empty() {
                        break;
                    }
                    outcome.lazy_node
                }
            };

            if let Some(lazy_node) = lazy_node {
                stack.push(StackItemMask {
                    node: lazy_node,
                    mask: cur.mask & m_active,
                    dist: f32::NEG_INFINITY,
                });
            }
        }

        for (&i, ray) in group.iter().zip(&local) {
            rays[i] = *ray;
        }
    }
}
