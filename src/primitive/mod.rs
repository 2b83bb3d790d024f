mod triangles;

pub use triangles::{TrianglePrimitive, Triangles};

use crate::{
    bvh::{NodeRef, PrimRange},
    ray::{Ray, RayPacket},
    traversal::TraversalContext,
    util::{LaneMask, simba::SimdFloat},
};

/// Result of intersecting one leaf.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LeafOutcome<T> {
    pub result: T,
    /// Subtree the leaf expanded into, traversal visits it right away.
    pub lazy_node: Option<NodeRef>,
}

impl<T> LeafOutcome<T> {
    pub fn new(result: T) -> Self {
        LeafOutcome {
            result,
            lazy_node: None,
        }
    }

    pub fn with_lazy_node(self, node: NodeRef) -> Self {
        LeafOutcome {
            lazy_node: Some(node),
            ..self
        }
    }
}

/// Intersects rays with the primitives referenced by a leaf.
///
/// Only the single ray entry points are required. The packet and stream versions default to
/// calling them lane by lane; representations with a vectorized test override those.
/// Implementations only write hit fields of rays that hit closer than their current `tfar`.
pub trait PrimitiveIntersector: Sync {
    /// Whether the packet entry points are worth calling; the coherent stream path relies on them.
    const SUPPORTS_PACKETS: bool = true;

    /// Returns whether a hit closer than `ray.tfar` was recorded.
    fn intersect(
        &self,
        ctx: &TraversalContext,
        ray: &mut Ray,
        prims: PrimRange,
    ) -> LeafOutcome<bool>;

    /// Returns whether any primitive is hit strictly inside the ray range.
    fn occluded(&self, ctx: &TraversalContext, ray: &Ray, prims: PrimRange) -> LeafOutcome<bool>;

    /// Intersects the `valid` lanes, returns the lanes that recorded a hit.
    fn intersect_packet<W: SimdFloat>(
        &self,
        ctx: &TraversalContext,
        valid: LaneMask,
        packet: &mut RayPacket<W>,
        prims: PrimRange,
    ) -> LeafOutcome<LaneMask> {
        let mut hits = LaneMask::EMPTY;
        let mut lazy_node = None;
        for lane in valid {
            let mut ray = packet.get(lane);
            let outcome = self.intersect(ctx, &mut ray, prims);
            if outcome.result {
                packet.set_hit(lane, &ray);
                hits.set(lane);
            }
            lazy_node = lazy_node.or(outcome.lazy_node);
        }
        LeafOutcome {
            result: hits,
            lazy_node,
        }
    }

    /// Returns the `valid` lanes that are occluded.
    fn occluded_packet<W: SimdFloat>(
        &self,
        ctx: &TraversalContext,
        valid: LaneMask,
        packet: &RayPacket<W>,
        prims: PrimRange,
    ) -> LeafOutcome<LaneMask> {
        let mut hits = LaneMask::EMPTY;
        let mut lazy_node = None;
        for lane in valid {
            let outcome = self.occluded(ctx, &packet.get(lane), prims);
            if outcome.result {
                hits.set(lane);
            }
            lazy_node = lazy_node.or(outcome.lazy_node);
        }
        LeafOutcome {
            result: hits,
            lazy_node,
        }
    }

    /// Intersects `rays[i]` for every `i` in `valid`, returns the rays that recorded a hit.
    fn intersect_stream(
        &self,
        ctx: &TraversalContext,
        valid: LaneMask,
        rays: &mut [Ray],
        prims: PrimRange,
    ) -> LeafOutcome<LaneMask> {
        let mut hits = LaneMask::EMPTY;
        let mut lazy_node = None;
        for i in valid {
            let outcome = self.intersect(ctx, &mut rays[i], prims);
            if outcome.result {
                hits.set(i);
            }
            lazy_node = lazy_node.or(outcome.lazy_node);
        }
        LeafOutcome {
            result: hits,
            lazy_node,
        }
    }

    /// Returns the rays among `valid` that are occluded.
    fn occluded_stream(
        &self,
        ctx: &TraversalContext,
        valid: LaneMask,
        rays: &[Ray],
        prims: PrimRange,
    ) -> LeafOutcome<LaneMask> {
        let mut hits = LaneMask::EMPTY;
        let mut lazy_node = None;
        for i in valid {
            let outcome = self.occluded(ctx, &rays[i], prims);
            if outcome.result {
                hits.set(i);
            }
            lazy_node = lazy_node.or(outcome.lazy_node);
        }
        LeafOutcome {
            result: hits,
            lazy_node,
        }
    }
}
