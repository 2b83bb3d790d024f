use std::ops::Sub;

use nalgebra::{ClosedAddAssign, ClosedDivAssign, Point, Scalar};
use num_traits::One;

use super::{WorldPoint, WorldVector};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AABB<Point> {
    pub min: Point,
    pub max: Point,
}

impl<Point> AABB<Point> {
    pub fn new(min: Point, max: Point) -> AABB<Point> {
        AABB { min, max }
    }

    pub fn map<Point2, F: FnMut(&Point) -> Point2>(&self, mut f: F) -> AABB<Point2> {
        AABB {
            min: f(&self.min),
            max: f(&self.max),
        }
    }

    pub fn zip_map<Point2, Point3, F: FnMut(&Point, &Point2) -> Point3>(
        &self,
        rhs: &AABB<Point2>,
        mut f: F,
    ) -> AABB<Point3> {
        AABB {
            min: f(&self.min, &rhs.min),
            max: f(&self.max, &rhs.max),
        }
    }
}

impl<Point: Sub + Copy> AABB<Point> {
    pub fn size(&self) -> Point::Output {
        self.max - self.min
    }
}

impl<T: Scalar + ClosedAddAssign + ClosedDivAssign + One, const D: usize> AABB<Point<T, D>> {
    pub fn center(&self) -> Point<T, D> {
        let two = T::one() + T::one();
        let avg_coords = (&self.min.coords + &self.max.coords) / two;
        Point::from(avg_coords)
    }
}

impl AABB<WorldPoint> {
    /// Box that contains nothing; merging it with another box returns the other box.
    pub fn empty() -> Self {
        AABB {
            min: WorldPoint::from(WorldVector::repeat(f32::INFINITY)),
            max: WorldPoint::from(WorldVector::repeat(f32::NEG_INFINITY)),
        }
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.min[axis] > self.max[axis])
    }

    /// Smallest box containing all points, `None` for an empty iterator.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a WorldPoint>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        Some(points.fold(AABB::new(*first, *first), |acc, p| {
            AABB::new(acc.min.inf(p), acc.max.sup(p))
        }))
    }

    pub fn merge(&self, other: &Self) -> Self {
        AABB::new(self.min.inf(&other.min), self.max.sup(&other.max))
    }

    pub fn contains(&self, point: &WorldPoint) -> bool {
        (0..3).all(|axis| self.min[axis] <= point[axis] && point[axis] <= self.max[axis])
    }

    /// Pads the box outwards by a relative epsilon so that rounding during traversal
    /// can never make it smaller than the geometry it bounds.
    pub fn round_out(&self) -> Self {
        const RELATIVE_PADDING: f32 = 4.0 * f32::EPSILON;
        let pad = |a: f32, b: f32| (a.abs().max(b.abs()) * RELATIVE_PADDING).max(f32::MIN_POSITIVE);
        let padding = self.min.coords.zip_map(&self.max.coords, pad);
        AABB::new(self.min - padding, self.max + padding)
    }

    /// Axis along which the box is the largest.
    pub fn longest_axis(&self) -> usize {
        self.size().imax()
    }
}

impl<Point> From<[Point; 2]> for AABB<Point> {
    fn from(value: [Point; 2]) -> Self {
        let [min, max] = value;
        AABB { min, max }
    }
}
