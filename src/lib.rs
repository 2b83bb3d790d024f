pub mod bvh;
pub mod geometry;
pub mod primitive;
pub mod ray;
pub mod traversal;
pub mod util;

#[cfg(test)]
mod test_util;

pub use bvh::{Bvh, BvhBuildSettings, BvhError};
pub use primitive::{PrimitiveIntersector, Triangles};
pub use ray::{Ray, RayPacket};
pub use traversal::{
    Coherence, RayStream, TraversalConfig, TraversalContext, TraversalStats, Traverser, Traverser4,
    Traverser8,
};
