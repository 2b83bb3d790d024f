mod aabb;
mod ray_triangle_intersection;
mod triangle;

pub use aabb::AABB;
pub use triangle::{BarycentricCoordinates, Triangle};

pub type WorldPoint = nalgebra::Point3<f32>;
pub type WorldVector = nalgebra::Vector3<f32>;
pub type WorldBox = AABB<WorldPoint>;

/// Index of the direction octant: bit `a` is set when the component on axis `a` is negative.
/// Negative zero counts as negative, like the sign bit does.
pub fn octant(direction: &WorldVector) -> usize {
    (0..3)
        .filter(|&axis| direction[axis].is_sign_negative())
        .fold(0, |acc, axis| acc | (1 << axis))
}
