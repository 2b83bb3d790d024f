//! Conversion between the array layout (one [`Ray`] per ray) and the batched layout
//! ([`RayPacket`]s of `W::LANES` rays).

use simba::simd::SimdValue as _;
use thiserror::Error;

use crate::{
    geometry::{WorldVector, octant},
    ray::{INVALID_ID, Ray, RayPacket},
    util::simba::SimdFloat,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{rays} rays need {needed} packets, only {available} given")]
    NotEnoughPackets {
        rays: usize,
        needed: usize,
        available: usize,
    },

    #[error("{rays} rays do not fit into {lanes} packet lanes")]
    TooManyRays { rays: usize, lanes: usize },
}

/// Direction bounds of the active rays of a batch.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BatchSummary {
    pub min_direction: WorldVector,
    pub max_direction: WorldVector,
    /// Direction sign bits that differ between the rays (the sign bits of the minimum and
    /// maximum direction XORed), zero iff all rays lie in one octant.
    /// Signed zeros count by their sign bit. An empty batch spans all octants.
    pub octant_span: usize,
    pub ray_count: usize,
}

/// Accumulates a [`BatchSummary`].
struct SummaryBuilder {
    min_direction: WorldVector,
    max_direction: WorldVector,
    any_negative: usize,
    all_negative: usize,
    ray_count: usize,
}

impl SummaryBuilder {
    fn new() -> Self {
        SummaryBuilder {
            min_direction: WorldVector::repeat(f32::INFINITY),
            max_direction: WorldVector::repeat(f32::NEG_INFINITY),
            any_negative: 0,
            all_negative: 0b111,
            ray_count: 0,
        }
    }

    fn add(&mut self, direction: &WorldVector) {
        self.min_direction = self.min_direction.inf(direction);
        self.max_direction = self.max_direction.sup(direction);
        self.any_negative |= octant(direction);
        self.all_negative &= octant(direction);
        self.ray_count += 1;
    }

    fn finish(self) -> BatchSummary {
        BatchSummary {
            min_direction: self.min_direction,
            max_direction: self.max_direction,
            octant_span: if self.ray_count == 0 {
                0b111
            } else {
                self.any_negative ^ self.all_negative
            },
            ray_count: self.ray_count,
        }
    }
}

/// How much of the hit record [`to_array`] copies back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CopyMode {
    /// Distance, normal, barycentrics and ids.
    Intersect,
    /// Only the geometry id, which marks occlusion.
    Occluded,
}

/// Packs `rays` into `packets`, ray `i` goes to lane `i % W::LANES` of packet `i / W::LANES`.
///
/// `tnear` is clamped to zero and the hit ids are reset, so that only hits found by the following
/// traversal are copied back. Lanes without a ray, including any surplus packets, become inactive.
pub fn to_batched<W: SimdFloat>(
    rays: &[Ray],
    packets: &mut [RayPacket<W>],
) -> Result<BatchSummary, LayoutError> {
    let needed = rays.len().div_ceil(W::LANES);
    if packets.len() < needed {
        return Err(LayoutError::NotEnoughPackets {
            rays: rays.len(),
            needed,
            available: packets.len(),
        });
    }

    let mut summary = SummaryBuilder::new();
    let mut chunks = rays.chunks(W::LANES);
    for packet in packets.iter_mut() {
        *packet = RayPacket::inactive();
        let Some(chunk) = chunks.next() else {
            continue;
        };
        for (lane, ray) in chunk.iter().enumerate() {
            let mut ray = *ray;
            ray.tnear = ray.tnear.max(0.0);
            ray.instance_id = INVALID_ID;
            ray.geometry_id = INVALID_ID;
            ray.primitive_id = INVALID_ID;
            if ray.is_active() {
                summary.add(&ray.direction);
            }
            packet.set(lane, &ray);
        }
    }

    Ok(summary.finish())
}

/// Direction summary of the active lanes of an already batched stream.
pub fn summarize_batched<W: SimdFloat>(packets: &[RayPacket<W>]) -> BatchSummary {
    let mut summary = SummaryBuilder::new();
    for packet in packets {
        for lane in packet.active_lanes() {
            summary.add(&packet.direction.extract(lane));
        }
    }
    summary.finish()
}

/// Copies hit records back from `packets` into `rays`, the inverse of [`to_batched`].
///
/// Only lanes with a valid geometry id are copied, other rays keep their previous state.
pub fn to_array<W: SimdFloat>(
    packets: &[RayPacket<W>],
    rays: &mut [Ray],
    mode: CopyMode,
) -> Result<(), LayoutError> {
    let lanes = packets.len() * W::LANES;
    if rays.len() > lanes {
        return Err(LayoutError::TooManyRays {
            rays: rays.len(),
            lanes,
        });
    }
    copy_to_array(packets, rays, mode);
    Ok(())
}

/// [`to_array`] without the size check, rays beyond the packets are left alone.
pub(super) fn copy_to_array<W: SimdFloat>(packets: &[RayPacket<W>], rays: &mut [Ray], mode: CopyMode) {
    for (packet, chunk) in packets.iter().zip(rays.chunks_mut(W::LANES)) {
        for (lane, ray) in chunk.iter_mut().enumerate() {
            let geometry_id = packet.geometry_id.as_ref()[lane];
            if geometry_id == INVALID_ID {
                continue;
            }
            match mode {
                CopyMode::Occluded => ray.geometry_id = geometry_id,
                CopyMode::Intersect => {
                    let hit = packet.get(lane);
                    ray.tfar = hit.tfar;
                    ray.normal = hit.normal;
                    ray.u = hit.u;
                    ray.v = hit.v;
                    ray.instance_id = hit.instance_id;
                    ray.geometry_id = hit.geometry_id;
                    ray.primitive_id = hit.primitive_id;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{geometry::WorldPoint, util::LaneMask};
    use assert2::{assert, let_assert};
    use test_case::test_case;
    use simba::simd::{SimdValue as _, WideF32x4};

    fn ray(direction: [f32; 3]) -> Ray {
        Ray::builder()
            .origin(WorldPoint::new(0.0, 0.0, 0.0))
            .direction(direction.into())
            .tnear(-1.0)
            .tfar(100.0)
            .build()
    }

    #[test]
    fn pads_trailing_lanes() {
        let rays = vec![ray([1.0, 1.0, 1.0]); 6];
        let mut packets = [RayPacket::<WideF32x4>::inactive(); 3];
        let_assert!(Ok(summary) = to_batched(&rays, &mut packets));
        assert!(summary.ray_count == 6);
        assert!(packets[0].active_lanes() == LaneMask::first(4));
        assert!(packets[1].active_lanes() == LaneMask::first(2));
        assert!(packets[2].active_lanes().is_empty());
        assert!(packets[0].tnear.extract(1) == 0.0);
        assert!(packets[1].tfar.extract(3) == f32::NEG_INFINITY);
    }

    #[test_case(&[[1.0, 2.0, 3.0], [0.5, 0.1, 9.0]], 0 ; "one_octant")]
    #[test_case(&[[1.0, 2.0, 3.0], [-0.5, 0.1, 9.0]], 0b001 ; "x_differs")]
    #[test_case(&[[1.0, -2.0, 3.0], [0.5, 0.1, -9.0]], 0b110 ; "yz_differ")]
    #[test_case(&[[0.0, 1.0, 1.0], [-0.0, 1.0, 1.0]], 0b001 ; "signed_zero")]
    fn octant_span(directions: &[[f32; 3]], expected: usize) {
        let rays: Vec<_> = directions.iter().map(|d| ray(*d)).collect();
        let mut packets = [RayPacket::<WideF32x4>::inactive(); 1];
        let_assert!(Ok(summary) = to_batched(&rays, &mut packets));
        assert!(summary.octant_span == expected);
        assert!(summarize_batched(&packets) == summary);
    }

    #[test]
    fn inactive_rays_do_not_widen_summary() {
        let mut rays = vec![ray([1.0, 1.0, 1.0]), ray([-1.0, -1.0, -1.0])];
        rays[1].tfar = -5.0;
        let mut packets = [RayPacket::<WideF32x4>::inactive(); 1];
        let_assert!(Ok(summary) = to_batched(&rays, &mut packets));
        assert!(summary.ray_count == 1);
        assert!(summary.octant_span == 0);
    }

    #[test]
    fn empty_batch_spans_everything() {
        let mut packets = [RayPacket::<WideF32x4>::inactive(); 1];
        let_assert!(Ok(summary) = to_batched(&[], &mut packets));
        assert!(summary.ray_count == 0);
        assert!(summary.octant_span == 0b111);
    }

    #[test]
    fn rejects_short_buffers() {
        let rays = vec![ray([1.0, 1.0, 1.0]); 5];
        let mut packets = [RayPacket::<WideF32x4>::inactive(); 1];
        assert!(
            to_batched(&rays, &mut packets)
                == Err(LayoutError::NotEnoughPackets {
                    rays: 5,
                    needed: 2,
                    available: 1
                })
        );
        let mut rays = rays;
        assert!(
            to_array(&packets, &mut rays, CopyMode::Intersect)
                == Err(LayoutError::TooManyRays { rays: 5, lanes: 4 })
        );
    }

    #[test]
    fn copies_back_only_hit_lanes() {
        let mut rays = vec![ray([0.0, 0.0, 1.0]); 3];
        rays[2].geometry_id = 11;
        rays[2].tfar = 50.0;
        let mut packets = [RayPacket::<WideF32x4>::inactive(); 1];
        to_batched(&rays, &mut packets).unwrap();

        let mut hit = packets[0].get(0);
        hit.tfar = 4.0;
        hit.u = 0.25;
        hit.geometry_id = 2;
        hit.primitive_id = 7;
        packets[0].set_hit(0, &hit);

        to_array(&packets, &mut rays, CopyMode::Intersect).unwrap();
        assert!(rays[0].tfar == 4.0);
        assert!(rays[0].u == 0.25);
        assert!(rays[0].primitive_id == 7);
        assert!(rays[0].tnear == -1.0);
        assert!(rays[1] == ray([0.0, 0.0, 1.0]));
        // An earlier hit survives when the batch found nothing closer
        assert!(rays[2].geometry_id == 11);
        assert!(rays[2].tfar == 50.0);
    }

    #[test]
    fn occluded_copies_geometry_id_only() {
        let mut rays = vec![ray([0.0, 0.0, 1.0]); 2];
        let mut packets = [RayPacket::<WideF32x4>::inactive(); 1];
        to_batched(&rays, &mut packets).unwrap();
        packets[0].geometry_id.as_mut()[1] = 0;
        packets[0].tfar.replace(1, 3.0);

        to_array(&packets, &mut rays, CopyMode::Occluded).unwrap();
        assert!(rays[0].geometry_id == INVALID_ID);
        assert!(rays[1].geometry_id == 0);
        assert!(rays[1].tfar == 100.0);
    }
}
