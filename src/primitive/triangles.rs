use index_vec::IndexVec;
use simba::simd::{SimdPartialOrd as _, SimdValue as _};

use crate::{
    bvh::{Bounded, Bvh, BvhBuildSettings, BvhError, PrimIdx, PrimRange},
    geometry::{BarycentricCoordinates, Triangle, WorldBox, WorldPoint},
    ray::{Ray, RayPacket},
    traversal::TraversalContext,
    util::{
        LaneMask,
        simba::{SimdFloat, bits, select},
    },
};

use super::{LeafOutcome, PrimitiveIntersector};

#[derive(Clone, Debug, PartialEq)]
pub struct TrianglePrimitive {
    pub triangle: Triangle<WorldPoint>,
    pub geometry_id: u32,
    pub primitive_id: u32,
    /// Rays only see the triangle if their mask shares a bit with this one (when masks are in use).
    pub mask: u32,
}

impl TrianglePrimitive {
    pub fn new(triangle: Triangle<WorldPoint>, geometry_id: u32, primitive_id: u32) -> Self {
        TrianglePrimitive {
            triangle,
            geometry_id,
            primitive_id,
            mask: u32::MAX,
        }
    }
}

impl Bounded for TrianglePrimitive {
    fn bounds(&self) -> WorldBox {
        WorldBox::from_points(self.triangle.iter()).unwrap_or_else(WorldBox::empty)
    }

    fn centroid(&self) -> WorldPoint {
        self.triangle.centroid()
    }
}

/// Two sided triangles stored in leaf order.
#[derive(Clone, Debug, Default)]
pub struct Triangles {
    primitives: IndexVec<PrimIdx, TrianglePrimitive>,
}

impl Triangles {
    /// Wraps triangles that are already in the order a hierarchy's leaves reference them.
    pub fn new(primitives: Vec<TrianglePrimitive>) -> Self {
        Triangles {
            primitives: IndexVec::from_vec(primitives),
        }
    }

    /// Builds a hierarchy over the triangles and returns it together with the reordered store.
    pub fn build_bvh<const N: usize>(
        mut primitives: Vec<TrianglePrimitive>,
        settings: &BvhBuildSettings,
    ) -> Result<(Bvh<N>, Triangles), BvhError> {
        let bvh = Bvh::build(&mut primitives, settings)?;
        Ok((bvh, Triangles::new(primitives)))
    }

    pub fn get(&self, index: PrimIdx) -> &TrianglePrimitive {
        &self.primitives[index]
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrianglePrimitive> {
        self.primitives.iter()
    }

    /// Distance and barycentrics of a hit strictly inside the ray range.
    fn hit(
        &self,
        ctx: &TraversalContext,
        ray: &Ray,
        prim: &TrianglePrimitive,
    ) -> Option<(f32, BarycentricCoordinates<f32>)> {
        if ctx.use_ray_mask && ray.mask & prim.mask == 0 {
            return None;
        }
        let (t, uv) = prim.triangle.intersect(&ray.origin, &ray.direction)?;
        (ray.tnear.max(0.0) < t && t < ray.tfar).then_some((t, uv))
    }

    /// Packet version of [`hit`](Self::hit), `None` if none of the `valid` lanes hit.
    fn packet_hit<W: SimdFloat>(
        &self,
        ctx: &TraversalContext,
        valid: LaneMask,
        packet: &RayPacket<W>,
        prim: &TrianglePrimitive,
    ) -> Option<(LaneMask, W, BarycentricCoordinates<W>)> {
        let valid = if ctx.use_ray_mask {
            valid
                .iter()
                .filter(|&lane| packet.mask.as_ref()[lane] & prim.mask != 0)
                .collect()
        } else {
            valid
        };
        if valid.is_empty() {
            return None;
        }

        let (hit, t, uv) = prim
            .triangle
            .intersect_packet(&packet.origin, &packet.direction);
        let in_range =
            packet.tnear.simd_max(W::splat(0.0)).simd_lt(t) & t.simd_lt(packet.tfar);
        let lanes = valid & LaneMask::from_bits(bits::<W>(hit & in_range));
        (!lanes.is_empty()).then_some((lanes, t, uv))
    }
}

impl PrimitiveIntersector for Triangles {
    fn intersect(
        &self,
        ctx: &TraversalContext,
        ray: &mut Ray,
        prims: PrimRange,
    ) -> LeafOutcome<bool> {
        let mut hit = false;
        for index in prims.iter() {
            let prim = &self.primitives[index];
            if let Some((t, uv)) = self.hit(ctx, ray, prim) {
                ray.tfar = t;
                ray.u = uv.u;
                ray.v = uv.v;
                ray.normal = prim.triangle.normal();
                ray.geometry_id = prim.geometry_id;
                ray.primitive_id = prim.primitive_id;
                hit = true;
            }
        }
        LeafOutcome::new(hit)
    }

    fn occluded(&self, ctx: &TraversalContext, ray: &Ray, prims: PrimRange) -> LeafOutcome<bool> {
        LeafOutcome::new(
            prims
                .iter()
                .any(|index| self.hit(ctx, ray, &self.primitives[index]).is_some()),
        )
    }

    fn intersect_packet<W: SimdFloat>(
        &self,
        ctx: &TraversalContext,
        valid: LaneMask,
        packet: &mut RayPacket<W>,
        prims: PrimRange,
    ) -> LeafOutcome<LaneMask> {
        let mut hits = LaneMask::EMPTY;
        for index in prims.iter() {
            let prim = &self.primitives[index];
            let Some((lanes, t, uv)) = self.packet_hit(ctx, valid, packet, prim) else {
                continue;
            };
            let mask = W::mask_from_bits(lanes.bits());
            packet.tfar = select(mask, t, packet.tfar);
            packet.u = select(mask, uv.u, packet.u);
            packet.v = select(mask, uv.v, packet.v);
            let normal = prim.triangle.normal();
            for lane in lanes {
                packet.normal.replace(lane, normal);
                packet.geometry_id.as_mut()[lane] = prim.geometry_id;
                packet.primitive_id.as_mut()[lane] = prim.primitive_id;
            }
            hits |= lanes;
        }
        LeafOutcome::new(hits)
    }

    fn occluded_packet<W: SimdFloat>(
        &self,
        ctx: &TraversalContext,
        valid: LaneMask,
        packet: &RayPacket<W>,
        prims: PrimRange,
    ) -> LeafOutcome<LaneMask> {
        let mut hits = LaneMask::EMPTY;
        for index in prims.iter() {
            let remaining = valid & !hits;
            if remaining.is_empty() {
                break;
            }
            if let Some((lanes, _, _)) =
                self.packet_hit(ctx, remaining, packet, &self.primitives[index])
            {
                hits |= lanes;
            }
        }
        LeafOutcome::new(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::WorldVector;
    use assert2::assert;
    use simba::simd::WideF32x8;
    use test_case::test_case;

    fn store() -> Triangles {
        Triangles::new(vec![
            TrianglePrimitive::new(
                Triangle::new(
                    WorldPoint::new(-1.0, -1.0, 5.0),
                    WorldPoint::new(1.0, -1.0, 5.0),
                    WorldPoint::new(0.0, 1.0, 5.0),
                ),
                3,
                0,
            ),
            TrianglePrimitive {
                mask: 0b10,
                ..TrianglePrimitive::new(
                    Triangle::new(
                        WorldPoint::new(-1.0, -1.0, 2.0),
                        WorldPoint::new(1.0, -1.0, 2.0),
                        WorldPoint::new(0.0, 1.0, 2.0),
                    ),
                    4,
                    1,
                )
            },
        ])
    }

    fn ray() -> Ray {
        Ray::builder()
            .origin(WorldPoint::new(0.0, 0.0, 0.0))
            .direction(WorldVector::new(0.0, 0.0, 1.0))
            .mask(0b01)
            .build()
    }

    fn all() -> PrimRange {
        PrimRange::new(0u32.into(), 2)
    }

    #[test_case(false, 4, 2.0 ; "closest_wins")]
    #[test_case(true, 3, 5.0 ; "mask_hides_closer")]
    fn intersect_records_hit(use_ray_mask: bool, geometry_id: u32, distance: f32) {
        let ctx = TraversalContext {
            use_ray_mask,
            ..Default::default()
        };
        let mut r = ray();
        let outcome = store().intersect(&ctx, &mut r, all());
        assert!(outcome.result);
        assert!(outcome.lazy_node == None);
        assert!(r.geometry_id == geometry_id);
        assert!(r.tfar == distance);
        assert!(r.normal.z != 0.0);
    }

    #[test]
    fn range_is_exclusive() {
        let ctx = TraversalContext::default();
        let mut r = ray();
        r.tfar = 2.0;
        assert!(!store().intersect(&ctx, &mut r, all()).result);
        assert!(!r.has_hit());
        assert!(r.tfar == 2.0);

        r.tnear = 2.0;
        r.tfar = 5.0;
        assert!(!store().occluded(&ctx, &r, all()).result);
        r.tfar = 5.5;
        assert!(store().occluded(&ctx, &r, all()).result);
    }

    #[test]
    fn bounds_cover_triangle() {
        let s = store();
        let b = s.get(0u32.into()).bounds();
        assert!(b.min == WorldPoint::new(-1.0, -1.0, 5.0));
        assert!(b.max == WorldPoint::new(1.0, 1.0, 5.0));
    }

    fn mixed_rays() -> Vec<Ray> {
        let z = WorldVector::new(0.0, 0.0, 1.0);
        let at = |x: f32, y: f32, z_origin: f32, direction: WorldVector| {
            Ray::builder()
                .origin(WorldPoint::new(x, y, z_origin))
                .direction(direction)
                .mask(0b01)
                .build()
        };
        vec![
            at(0.0, 0.0, 0.0, z),
            Ray { mask: 0b10, ..at(0.2, -0.3, 0.0, z) },
            at(3.0, 0.0, 0.0, z),
            Ray { tfar: 3.0, ..at(0.0, 0.0, 0.0, z) },
            at(0.0, 0.0, 10.0, -z),
            Ray { tnear: 2.5, ..at(0.0, 0.0, 0.0, z) },
            at(0.0, 0.0, 0.0, WorldVector::new(0.05, 0.05, 1.0)),
            at(0.0, 0.0, -1.0, WorldVector::new(1.0, 0.0, 0.0)),
        ]
    }

    #[test_case(false ; "all_triangles")]
    #[test_case(true ; "ray_masks")]
    fn packet_matches_single_rays(use_ray_mask: bool) {
        let ctx = TraversalContext {
            use_ray_mask,
            ..Default::default()
        };
        let s = store();
        let rays = mixed_rays();
        // Lane 6 is not valid and must come back untouched
        let valid = !LaneMask::single(6) & LaneMask::first(8);

        let mut packet = RayPacket::<WideF32x8>::from_rays(&rays);
        let hits = s.intersect_packet(&ctx, valid, &mut packet, all()).result;
        let occluded = s
            .occluded_packet(&ctx, valid, &RayPacket::<WideF32x8>::from_rays(&rays), all())
            .result;

        for (lane, original) in rays.iter().enumerate() {
            let mut expected = *original;
            let expected_hit =
                valid.contains(lane) && s.intersect(&ctx, &mut expected, all()).result;
            let expected_occluded = valid.contains(lane) && s.occluded(&ctx, original, all()).result;
            assert!(hits.contains(lane) == expected_hit, "lane {lane}");
            assert!(occluded.contains(lane) == expected_occluded, "lane {lane}");

            let actual = packet.get(lane);
            assert!(actual.geometry_id == expected.geometry_id, "lane {lane}");
            assert!(actual.primitive_id == expected.primitive_id, "lane {lane}");
            assert!(close(actual.tfar, expected.tfar), "lane {lane}");
            assert!(close(actual.u, expected.u), "lane {lane}");
            assert!(close(actual.v, expected.v), "lane {lane}");
            assert!(actual.normal == expected.normal, "lane {lane}");
        }
        assert!(hits.contains(0) && !hits.contains(2) && !hits.contains(6));
    }

    fn close(a: f32, b: f32) -> bool {
        a == b || (a - b).abs() < 1e-5
    }
}
