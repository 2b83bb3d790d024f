use nalgebra::Vector3;
use simba::simd::{SimdPartialOrd as _, SimdValue as _};

use crate::{
    geometry::WorldPoint,
    util::{
        LaneMask,
        simba::{SimdFloat, bits},
    },
};

use super::{INVALID_ID, Ray};

/// Structure-of-arrays group of `W::LANES` rays, one vector per float field.
#[derive(Copy, Clone, Debug)]
pub struct RayPacket<W: SimdFloat> {
    pub origin: Vector3<W>,
    pub direction: Vector3<W>,
    pub tnear: W,
    pub tfar: W,
    pub time: W,
    pub mask: W::Ints,
    pub instance_id: W::Ints,

    pub normal: Vector3<W>,
    pub u: W,
    pub v: W,
    pub geometry_id: W::Ints,
    pub primitive_id: W::Ints,
}

impl<W: SimdFloat> RayPacket<W> {
    /// Packet where every lane is inactive (`tnear = 0`, `tfar = -inf`) and has no hit.
    pub fn inactive() -> Self {
        let zero = W::splat(0.0);
        let mut invalid = W::Ints::default();
        invalid.as_mut().fill(INVALID_ID);
        let mut all_bits = W::Ints::default();
        all_bits.as_mut().fill(u32::MAX);
        RayPacket {
            origin: Vector3::repeat(zero),
            direction: Vector3::repeat(zero),
            tnear: zero,
            tfar: W::neg_infinity(),
            time: zero,
            mask: all_bits,
            instance_id: invalid,
            normal: Vector3::repeat(zero),
            u: zero,
            v: zero,
            geometry_id: invalid,
            primitive_id: invalid,
        }
    }

    /// Builds a packet from up to `W::LANES` rays, remaining lanes are inactive.
    pub fn from_rays(rays: &[Ray]) -> Self {
        assert!(rays.len() <= W::LANES);
        let mut packet = Self::inactive();
        for (lane, ray) in rays.iter().enumerate() {
            packet.set(lane, ray);
        }
        packet
    }

    /// Lanes with `tnear <= tfar`.
    pub fn active_lanes(&self) -> LaneMask {
        LaneMask::from_bits(bits::<W>(self.tnear.simd_le(self.tfar)))
    }

    pub fn get(&self, lane: usize) -> Ray {
        Ray {
            origin: WorldPoint::from(self.origin.extract(lane)),
            direction: self.direction.extract(lane),
            tnear: self.tnear.extract(lane),
            tfar: self.tfar.extract(lane),
            time: self.time.extract(lane),
            mask: self.mask.as_ref()[lane],
            instance_id: self.instance_id.as_ref()[lane],
            normal: self.normal.extract(lane),
            u: self.u.extract(lane),
            v: self.v.extract(lane),
            geometry_id: self.geometry_id.as_ref()[lane],
            primitive_id: self.primitive_id.as_ref()[lane],
        }
    }

    /// Stores every field of the ray in the given lane.
    pub fn set(&mut self, lane: usize, ray: &Ray) {
        self.origin.replace(lane, ray.origin.coords);
        self.direction.replace(lane, ray.direction);
        self.tnear.replace(lane, ray.tnear);
        self.time.replace(lane, ray.time);
        self.mask.as_mut()[lane] = ray.mask;
        self.set_hit(lane, ray);
    }

    /// Stores only the hit record of the ray (`tfar` and the hit fields) in the given lane.
    pub fn set_hit(&mut self, lane: usize, ray: &Ray) {
        self.tfar.replace(lane, ray.tfar);
        self.instance_id.as_mut()[lane] = ray.instance_id;
        self.normal.replace(lane, ray.normal);
        self.u.replace(lane, ray.u);
        self.v.replace(lane, ray.v);
        self.geometry_id.as_mut()[lane] = ray.geometry_id;
        self.primitive_id.as_mut()[lane] = ray.primitive_id;
    }
}
