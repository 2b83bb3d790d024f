mod packet;

pub use packet::RayPacket;

use bon::bon;

use crate::geometry::{WorldPoint, WorldVector, octant};

/// Id stored in `geometry_id` / `primitive_id` / `instance_id` when there is no hit.
pub const INVALID_ID: u32 = u32::MAX;

/// One traversal query together with its hit record.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Ray {
    pub origin: WorldPoint,
    /// Not required to be normalized, distances are measured in multiples of its length.
    pub direction: WorldVector,
    pub tnear: f32,
    /// Upper end of the valid range, shrinks to the hit distance as closer hits are found.
    pub tfar: f32,
    /// Motion blur time in `[0, 1]`.
    pub time: f32,
    /// Visibility mask, tested against primitive masks when the context enables ray masks.
    pub mask: u32,
    pub instance_id: u32,

    /// Geometric normal of the hit, not normalized.
    pub normal: WorldVector,
    pub u: f32,
    pub v: f32,
    pub geometry_id: u32,
    pub primitive_id: u32,
}

#[bon]
impl Ray {
    #[builder]
    pub fn new(
        origin: WorldPoint,
        direction: WorldVector,
        #[builder(default = 0.0)] tnear: f32,
        #[builder(default = f32::INFINITY)] tfar: f32,
        #[builder(default = 0.0)] time: f32,
        #[builder(default = u32::MAX)] mask: u32,
    ) -> Self {
        Ray {
            origin,
            direction,
            tnear,
            tfar,
            time,
            mask,
            instance_id: INVALID_ID,
            normal: WorldVector::zeros(),
            u: 0.0,
            v: 0.0,
            geometry_id: INVALID_ID,
            primitive_id: INVALID_ID,
        }
    }
}

impl Ray {
    /// A ray is only traversed while its range is non-empty.
    pub fn is_active(&self) -> bool {
        self.tnear <= self.tfar
    }

    pub fn has_hit(&self) -> bool {
        self.geometry_id != INVALID_ID
    }

    pub fn point_at(&self, distance: f32) -> WorldPoint {
        self.origin + self.direction * distance
    }

    pub fn octant(&self) -> usize {
        octant(&self.direction)
    }

    /// Resets the hit record, keeping the query fields.
    pub fn clear_hit(&mut self) {
        self.instance_id = INVALID_ID;
        self.normal = WorldVector::zeros();
        self.u = 0.0;
        self.v = 0.0;
        self.geometry_id = INVALID_ID;
        self.primitive_id = INVALID_ID;
    }

    /// Marks the ray as occluded.
    pub fn set_occluded(&mut self) {
        self.geometry_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;

    #[test]
    fn builder_defaults() {
        let ray = Ray::builder()
            .origin(WorldPoint::new(1.0, 2.0, 3.0))
            .direction(WorldVector::new(0.0, 0.0, -1.0))
            .build();
        assert!(ray.tnear == 0.0);
        assert!(ray.tfar == f32::INFINITY);
        assert!(ray.mask == u32::MAX);
        assert!(ray.is_active());
        assert!(!ray.has_hit());
        assert!(ray.octant() == 4);
        assert!(ray.point_at(2.0) == WorldPoint::new(1.0, 2.0, 1.0));
    }

    #[test]
    fn inactive_range() {
        let ray = Ray::builder()
            .origin(WorldPoint::origin())
            .direction(WorldVector::x())
            .tnear(2.0)
            .tfar(1.0)
            .build();
        assert!(!ray.is_active());
    }
}
