//! Random scenes and rays shared by the traversal tests.

use rand::{Rng, SeedableRng, rngs::SmallRng};

use crate::{
    bvh::{Bvh, BvhBuildSettings},
    geometry::{Triangle, WorldPoint, WorldVector},
    primitive::{TrianglePrimitive, Triangles},
    ray::Ray,
};

fn random_point(rng: &mut impl Rng, extent: f32) -> WorldPoint {
    WorldPoint::new(
        rng.random_range(-extent..extent),
        rng.random_range(-extent..extent),
        rng.random_range(-extent..extent),
    )
}

/// `count` small triangles scattered in a cube of half size 10 around the origin.
pub fn random_triangles(seed: u64, count: u32) -> Vec<TrianglePrimitive> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let a = random_point(&mut rng, 10.0);
            let b = a + random_point(&mut rng, 1.5).coords;
            let c = a + random_point(&mut rng, 1.5).coords;
            TrianglePrimitive::new(Triangle::new(a, b, c), i % 3, i)
        })
        .collect()
}

pub fn random_scene<const N: usize>(seed: u64, count: u32) -> (Bvh<N>, Triangles) {
    let settings = BvhBuildSettings::builder()
        .max_leaf_size(2)
        .build()
        .unwrap();
    Triangles::build_bvh(random_triangles(seed, count), &settings).unwrap()
}

/// Rays from random points on a sphere of radius 20 towards random points inside the scene.
pub fn incoherent_rays(seed: u64, count: usize) -> Vec<Ray> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let origin = WorldPoint::from(random_point(&mut rng, 1.0).coords.normalize() * 20.0);
            let target = random_point(&mut rng, 8.0);
            Ray::builder().origin(origin).direction(target - origin).build()
        })
        .collect()
}

/// Camera style rays: one origin, directions spread over a small cone around `-z`.
/// All directions lie in one octant.
pub fn coherent_rays(seed: u64, count: usize) -> Vec<Ray> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let origin = WorldPoint::new(-0.5, -0.5, 25.0);
    (0..count)
        .map(|_| {
            let direction = WorldVector::new(
                rng.random_range(0.001..0.4),
                rng.random_range(0.001..0.4),
                -1.0,
            );
            Ray::builder().origin(origin).direction(direction).build()
        })
        .collect()
}
