use crate::{
    bvh::{NodeKind, NodeRef},
    primitive::PrimitiveIntersector,
    ray::Ray,
    util::simba::SimdFloat,
};

use super::{
    TraversalContext, TraversalStats, Traverser,
    box_test::{TravRay, intersect_node},
    node_traverser::{Stack, StackItem, traverse_any_hit, traverse_closest_hit},
};

impl<V: SimdFloat, P: PrimitiveIntersector, const N: usize> Traverser<'_, V, P, N> {
    /// Finds the closest hit of one ray, writing its hit record and shrinking `tfar`.
    pub fn intersect(&self, ray: &mut Ray, ctx: &TraversalContext) -> TraversalStats {
        let mut stats = TraversalStats::default();
        if !ray.is_active() || self.bvh.root().is_empty() {
            return stats;
        }
        let tray = TravRay::new(ray, self.config.robust);
        self.intersect1(self.bvh.root(), ray, &tray, ctx, &mut stats);
        stats
    }

    /// Sets `geometry_id = 0` if anything is hit inside the ray range.
    pub fn occluded(&self, ray: &mut Ray, ctx: &TraversalContext) -> TraversalStats {
        let mut stats = TraversalStats::default();
        if !ray.is_active() || self.bvh.root().is_empty() {
            return stats;
        }
        let tray = TravRay::new(ray, self.config.robust);
        if self.occluded1(self.bvh.root(), ray, &tray, ctx, &mut stats) {
            ray.set_occluded();
        }
        stats
    }

    /// Closest hit search in the subtree below `start`.
    pub(super) fn intersect1(
        &self,
        start: NodeRef,
        ray: &mut Ray,
        tray: &TravRay,
        ctx: &TraversalContext,
        stats: &mut TraversalStats,
    ) {
        let robust = self.config.robust;
        let mut stack = Stack::<StackItem>::new();
        stack.push(StackItem {
            node: NodeRef::INVALID,
            dist: f32::INFINITY,
        });
        stack.push(StackItem {
            node: start,
            dist: f32::NEG_INFINITY,
        });

        'pop: while let Some(entry) = stack.pop() {
            stats.stack_pops += 1;
            if entry.node.is_invalid() {
                break;
            }
            // Behind the closest hit so far
            if entry.dist > ray.tfar {
                continue;
            }

            let mut cur = entry.node;
            let range = loop {
                match cur.kind() {
                    NodeKind::Inner(index) => {
                        stats.node_visits += 1;
                        stats.ray_node_tests += 1;
                        let node = self.bvh.node(index);
                        let (hits, dist) =
                            intersect_node::<V, N>(node, tray, &tray.near_far, ray.tfar, robust);
                        if hits.is_empty() {
                            continue 'pop;
                        }
                        cur = traverse_closest_hit(node.children(), hits, dist, &mut stack);
                    }
                    NodeKind::Leaf(range) => break range,
                    NodeKind::Empty | NodeKind::Invalid => continue 'pop,
                }
            };

            stats.leaf_visits += 1;
            let outcome = self.primitives.intersect(ctx, ray, range);
            if let Some(lazy_node) = outcome.lazy_node {
                stack.push(StackItem {
                    node: lazy_node,
                    dist: f32::NEG_INFINITY,
                });
            }
        }
    }

    /// Any hit search in the subtree below `start`, returns as soon as one is found.
    pub(super) fn occluded1(
        &self,
        start: NodeRef,
        ray: &Ray,
        tray: &TravRay,
        ctx: &TraversalContext,
        stats: &mut TraversalStats,
    ) -> bool {
        let robust = self.config.robust;
        let mut stack = Stack::<StackItem>::new();
        stack.push(StackItem {
            node: NodeRef::INVALID,
            dist: f32::INFINITY,
        });
        stack.push(StackItem {
            node: start,
            dist: f32::NEG_INFINITY,
        });

        'pop: while let Some(entry) = stack.pop() {
            stats.stack_pops += 1;
            if entry.node.is_invalid() {
                break;
            }

            let mut cur = entry.node;
            let range = loop {
                match cur.kind() {
                    NodeKind::Inner(index) => {
                        stats.node_visits += 1;
                        stats.ray_node_tests += 1;
                        let node = self.bvh.node(index);
                        let (hits, _) =
                            intersect_node::<V, N>(node, tray, &tray.near_far, ray.tfar, robust);
                        if hits.is_empty() {
                            continue 'pop;
                        }
                        cur = traverse_any_hit(node.children(), hits, &mut stack);
                    }
                    NodeKind::Leaf(range) => break range,
                    NodeKind::Empty | NodeKind::Invalid => continue 'pop,
                }
            };

            stats.leaf_visits += 1;
            let outcome = self.primitives.occluded(ctx, ray, range);
            if outcome.result {
                return true;
            }
            if let Some(lazy_node) = outcome.lazy_node {
                stack.push(StackItem {
                    node: lazy_node,
                    dist: f32::NEG_INFINITY,
                });
            }
        }
        false
    }
}
