use nalgebra::Vector3;
use simba::simd::{SimdPartialOrd as _, SimdValue as _};

use crate::util::simba::SimdFloat;

use super::{BarycentricCoordinates, Triangle, WorldPoint, WorldVector};

impl Triangle<WorldPoint> {
    /// Calculates ray intersection with the (two sided) triangle.
    /// Returns distance along the ray and barycentric uv coordinates of the hit,
    /// the distance is not range checked.
    /// Adapted from https://en.wikipedia.org/wiki/M%C3%B6ller%E2%80%93Trumbore_intersection_algorithm#Rust_implementation
    pub fn intersect(
        &self,
        origin: &WorldPoint,
        direction: &WorldVector,
    ) -> Option<(f32, BarycentricCoordinates<f32>)> {
        let [e1, e2] = self.edges();

        let ray_cross_e2 = direction.cross(&e2);
        let det = e1.dot(&ray_cross_e2);
        if det == 0.0 {
            // Parallel to the triangle plane, or a degenerate triangle
            return None;
        }

        let inv_det = 1.0 / det;
        let s = origin - self[0];
        let u = inv_det * s.dot(&ray_cross_e2);

        let s_cross_e1 = s.cross(&e1);
        let v = inv_det * direction.dot(&s_cross_e1);
        let t = inv_det * e2.dot(&s_cross_e1);

        if u >= 0.0 && v >= 0.0 && u + v <= 1.0 && t.is_finite() {
            Some((t, BarycentricCoordinates { u, v }))
        } else {
            None
        }
    }

    /// [`intersect`](Self::intersect) for every lane of a ray packet.
    /// Returns the lanes that hit, distance and uv are meaningless in the other lanes.
    pub fn intersect_packet<W: SimdFloat>(
        &self,
        origin: &Vector3<W>,
        direction: &Vector3<W>,
    ) -> (W::SimdBool, W, BarycentricCoordinates<W>) {
        let [e1, e2] = self.edges().map(|e| e.map(W::splat));

        let ray_cross_e2 = direction.cross(&e2);
        let det = e1.dot(&ray_cross_e2);

        let inv_det = W::splat(1.0) / det; // May be infinite
        let s = origin - self[0].coords.map(W::splat);
        let u = inv_det * s.dot(&ray_cross_e2);

        let s_cross_e1 = s.cross(&e1);
        let v = inv_det * direction.dot(&s_cross_e1);
        let t = inv_det * e2.dot(&s_cross_e1);

        let zero = W::splat(0.0);
        let mask = det.simd_ne(zero)
            & u.simd_ge(zero)
            & v.simd_ge(zero)
            & (u + v).simd_le(W::splat(1.0))
            & t.simd_gt(W::neg_infinity())
            & t.simd_lt(W::infinity());
        (mask, t, BarycentricCoordinates { u, v })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::simba::bits;
    use assert2::{assert, let_assert};
    use simba::simd::{SimdValue as _, WideF32x8};
    use test_case::test_case;

    fn unit_triangle() -> Triangle<WorldPoint> {
        Triangle::new(
            WorldPoint::new(0.0, 0.0, 5.0),
            WorldPoint::new(1.0, 0.0, 5.0),
            WorldPoint::new(0.0, 1.0, 5.0),
        )
    }

    #[test_case(1.0 ; "front")]
    #[test_case(-1.0 ; "back")]
    fn hit_both_sides(dz: f32) {
        let origin = WorldPoint::new(0.25, 0.25, 5.0 - 5.0 * dz);
        let_assert!(
            Some((t, uv)) = unit_triangle().intersect(&origin, &WorldVector::new(0.0, 0.0, dz))
        );
        assert!((t - 5.0).abs() < 1e-5);
        assert!((uv.u - 0.25).abs() < 1e-6);
        assert!((uv.v - 0.25).abs() < 1e-6);
    }

    #[test]
    fn miss_outside() {
        let origin = WorldPoint::new(0.75, 0.75, 0.0);
        assert!(
            unit_triangle()
                .intersect(&origin, &WorldVector::new(0.0, 0.0, 1.0))
                .is_none()
        );
    }

    #[test]
    fn miss_parallel() {
        let origin = WorldPoint::new(0.25, 0.25, 0.0);
        assert!(
            unit_triangle()
                .intersect(&origin, &WorldVector::new(1.0, 0.0, 0.0))
                .is_none()
        );
    }

    #[test]
    fn packet_matches_single_rays() {
        let z = WorldVector::new(0.0, 0.0, 1.0);
        let rays = [
            (WorldPoint::new(0.25, 0.25, 0.0), z),
            (WorldPoint::new(0.6, 0.3, 0.0), z),
            (WorldPoint::new(0.6, 0.6, 0.0), z),
            (WorldPoint::new(-0.5, 0.1, 0.0), z),
            (WorldPoint::new(0.1, 0.3, 9.0), -z),
            (WorldPoint::new(0.0, 0.0, 0.0), WorldVector::new(0.02, 0.03, 1.0)),
            (WorldPoint::new(0.25, 0.25, 0.0), WorldVector::new(1.0, 0.0, 0.0)),
            (WorldPoint::new(0.25, 0.25, 0.0), WorldVector::new(f32::NAN, 0.0, 1.0)),
        ];
        let mut origin = Vector3::repeat(WideF32x8::splat(0.0));
        let mut direction = origin;
        for (lane, (o, d)) in rays.iter().enumerate() {
            origin.replace(lane, o.coords);
            direction.replace(lane, *d);
        }

        let triangle = unit_triangle();
        let (mask, t, uv) = triangle.intersect_packet(&origin, &direction);
        let mask = bits::<WideF32x8>(mask);
        assert!(mask == 0b0011_0011);
        for (lane, (o, d)) in rays.iter().enumerate() {
            match triangle.intersect(o, d) {
                Some((expected_t, expected_uv)) => {
                    assert!(mask & (1 << lane) != 0);
                    assert!((t.extract(lane) - expected_t).abs() < 1e-5);
                    assert!((uv.u.extract(lane) - expected_uv.u).abs() < 1e-6);
                    assert!((uv.v.extract(lane) - expected_uv.v).abs() < 1e-6);
                }
                None => assert!(mask & (1 << lane) == 0),
            }
        }
    }
}
