//! Ray traversal of [`Bvh`] hierarchies.
//!
//! [`Traverser`] bundles a hierarchy, its primitives and a [`TraversalConfig`] and offers
//! single ray, packet and stream queries. Stream queries are dispatched to the coherent stream,
//! incoherent stream, packet or single ray strategy depending on the context, the
//! configuration and the rays themselves.

pub mod coherent;
mod incoherent;
pub mod layout;
pub mod node_traverser;
mod packet;
mod single;

pub use layout::{BatchSummary, CopyMode, LayoutError};

use std::{
    fmt::Display,
    marker::PhantomData,
    ops::{Add, AddAssign},
};

use arrayvec::ArrayVec;
use bon::bon;
use simba::simd::{WideF32x4, WideF32x8};
use thiserror::Error;

use crate::{
    bvh::Bvh,
    primitive::PrimitiveIntersector,
    ray::{Ray, RayPacket},
    util::{LaneMask, simba::SimdFloat},
};

/// Largest number of rays traced together by the stream strategies.
pub const MAX_STREAM_RAYS: usize = LaneMask::MAX_LANES;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_coherent_rays must be in 1..=64, got {0}")]
    MaxCoherentRays(usize),
}

/// Traversal options, fixed when a [`Traverser`] is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraversalConfig {
    robust: bool,
    coherent_path: bool,
    switch_threshold: usize,
    switch_during_descent: bool,
    max_coherent_rays: usize,
}

#[bon]
impl TraversalConfig {
    /// * `robust` - use the robust box test, which also disables the coherent stream path
    /// * `coherent_path` - allow the coherent stream path
    /// * `switch_threshold` - packets with at most this many active lanes continue as single rays
    /// * `switch_during_descent` - check the threshold after each inner node, not only at pops
    /// * `max_coherent_rays` - largest stream the coherent path accepts
    #[builder]
    pub fn new(
        #[builder(default = false)] robust: bool,
        #[builder(default = true)] coherent_path: bool,
        #[builder(default = 3)] switch_threshold: usize,
        #[builder(default = true)] switch_during_descent: bool,
        #[builder(default = MAX_STREAM_RAYS)] max_coherent_rays: usize,
    ) -> Result<Self, ConfigError> {
        if !(1..=MAX_STREAM_RAYS).contains(&max_coherent_rays) {
            return Err(ConfigError::MaxCoherentRays(max_coherent_rays));
        }
        Ok(TraversalConfig {
            robust,
            coherent_path,
            switch_threshold,
            switch_during_descent,
            max_coherent_rays,
        })
    }
}

impl TraversalConfig {
    pub fn robust(&self) -> bool {
        self.robust
    }

    pub fn coherent_path(&self) -> bool {
        self.coherent_path
    }

    pub fn switch_threshold(&self) -> usize {
        self.switch_threshold
    }

    pub fn switch_during_descent(&self) -> bool {
        self.switch_during_descent
    }

    pub fn max_coherent_rays(&self) -> usize {
        self.max_coherent_rays
    }
}

impl Default for TraversalConfig {
    fn default() -> Self {
        TraversalConfig {
            robust: false,
            coherent_path: true,
            switch_threshold: 3,
            switch_during_descent: true,
            max_coherent_rays: MAX_STREAM_RAYS,
        }
    }
}

/// Hint about how similar the rays of a stream are.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Coherence {
    #[default]
    Incoherent,
    /// Rays share origin region and direction, like primary camera rays.
    Coherent,
}

/// Per call settings handed through to the primitive intersector.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TraversalContext {
    pub coherence: Coherence,
    /// Test ray masks against primitive masks.
    pub use_ray_mask: bool,
}

/// Work counters of a traversal call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TraversalStats {
    /// Inner nodes whose children were tested.
    pub node_visits: u64,
    /// Leaves handed to the primitive intersector.
    pub leaf_visits: u64,
    /// Ray (or lane) versus inner node tests.
    pub ray_node_tests: u64,
    pub stack_pops: u64,
    /// Times a packet continued as single rays.
    pub single_ray_switches: u64,
}

impl AddAssign for TraversalStats {
    fn add_assign(&mut self, rhs: Self) {
        self.node_visits += rhs.node_visits;
        self.leaf_visits += rhs.leaf_visits;
        self.ray_node_tests += rhs.ray_node_tests;
        self.stack_pops += rhs.stack_pops;
        self.single_ray_switches += rhs.single_ray_switches;
    }
}

impl Add for TraversalStats {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl Display for TraversalStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} node visits, {} leaf visits, {} ray-node tests, {} stack pops, {} single ray switches",
            self.node_visits,
            self.leaf_visits,
            self.ray_node_tests,
            self.stack_pops,
            self.single_ray_switches
        )
    }
}

/// Rays of a stream query in one of the two supported layouts.
#[derive(Debug)]
pub enum RayStream<'a, W: SimdFloat> {
    /// One struct per ray.
    Array(&'a mut [Ray]),
    /// Structure-of-arrays packets of `W::LANES` rays, inactive lanes are skipped.
    Batched(&'a mut [RayPacket<W>]),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Query {
    Intersect,
    Occluded,
}

impl Query {
    fn copy_mode(self) -> CopyMode {
        match self {
            Query::Intersect => CopyMode::Intersect,
            Query::Occluded => CopyMode::Occluded,
        }
    }
}

/// Traverses a hierarchy of width `N`, testing nodes with the `N` lane vector type `V`.
pub struct Traverser<'a, V, P, const N: usize> {
    bvh: &'a Bvh<N>,
    primitives: &'a P,
    config: TraversalConfig,
    lanes: PhantomData<V>,
}

pub type Traverser4<'a, P> = Traverser<'a, WideF32x4, P, 4>;
pub type Traverser8<'a, P> = Traverser<'a, WideF32x8, P, 8>;

impl<'a, V: SimdFloat, P: PrimitiveIntersector, const N: usize> Traverser<'a, V, P, N> {
    pub fn new(bvh: &'a Bvh<N>, primitives: &'a P, config: TraversalConfig) -> Self {
        const { assert!(V::LANES == N, "node test width must match the hierarchy width") };
        Traverser {
            bvh,
            primitives,
            config,
            lanes: PhantomData,
        }
    }

    pub fn bvh(&self) -> &'a Bvh<N> {
        self.bvh
    }

    pub fn config(&self) -> &TraversalConfig {
        &self.config
    }

    /// Finds the closest hit of every active ray in the stream.
    pub fn intersect_stream<W: SimdFloat>(
        &self,
        stream: RayStream<'_, W>,
        ctx: &TraversalContext,
    ) -> TraversalStats {
        self.trace_stream(stream, ctx, Query::Intersect)
    }

    /// Marks every active ray of the stream that hits anything with `geometry_id = 0`.
    pub fn occluded_stream<W: SimdFloat>(
        &self,
        stream: RayStream<'_, W>,
        ctx: &TraversalContext,
    ) -> TraversalStats {
        self.trace_stream(stream, ctx, Query::Occluded)
    }

    fn trace_stream<W: SimdFloat>(
        &self,
        stream: RayStream<'_, W>,
        ctx: &TraversalContext,
        query: Query,
    ) -> TraversalStats {
        let mut stats = TraversalStats::default();
        match stream {
            RayStream::Array(rays) => self.trace_array::<W>(rays, ctx, query, &mut stats),
            RayStream::Batched(packets) => self.trace_batched(packets, ctx, query, &mut stats),
        }
        stats
    }

    fn trace_array<W: SimdFloat>(
        &self,
        rays: &mut [Ray],
        ctx: &TraversalContext,
        query: Query,
        stats: &mut TraversalStats,
    ) {
        if rays.is_empty() {
            return;
        }

        if self.coherent_allowed(ctx, rays.len()) {
            let mut packets: ArrayVec<RayPacket<W>, MAX_STREAM_RAYS> =
                (0..rays.len().div_ceil(W::LANES)).map(|_| RayPacket::inactive()).collect();
            match layout::to_batched(rays, &mut packets) {
                Ok(summary) if summary.octant_span == 0 => {
                    log::trace!("{} rays: coherent stream", rays.len());
                    self.trace_coherent(&mut packets, ctx, query, stats);
                    layout::copy_to_array(&packets, rays, query.copy_mode());
                    return;
                }
                Ok(summary) => log::trace!(
                    "{} rays span octants {:#05b}, falling back to incoherent traversal",
                    rays.len(),
                    summary.octant_span
                ),
                Err(e) => log::trace!("{e}, falling back to incoherent traversal"),
            }
        }

        if let [ray] = rays {
            log::trace!("single ray");
            *stats += match query {
                Query::Intersect => self.intersect(ray, ctx),
                Query::Occluded => self.occluded(ray, ctx),
            };
        } else {
            log::trace!("{} rays: incoherent stream", rays.len());
            match query {
                Query::Intersect => self.intersect_incoherent(rays, ctx, stats),
                Query::Occluded => self.occluded_incoherent(rays, ctx, stats),
            }
        }
    }

    fn trace_batched<W: SimdFloat>(
        &self,
        packets: &mut [RayPacket<W>],
        ctx: &TraversalContext,
        query: Query,
        stats: &mut TraversalStats,
    ) {
        let lanes = packets.len() * W::LANES;
        if self.coherent_allowed(ctx, lanes) {
            let summary = layout::summarize_batched(packets);
            if summary.octant_span == 0 {
                log::trace!("{} batched packets: coherent stream", packets.len());
                self.trace_coherent(packets, ctx, query, stats);
                return;
            }
            log::trace!(
                "batched packets span octants {:#05b}, tracing packet by packet",
                summary.octant_span
            );
        }

        log::trace!("{} batched packets: packet traversal", packets.len());
        for packet in packets.iter_mut() {
            let valid = packet.active_lanes();
            *stats += match query {
                Query::Intersect => self.intersect_packet(valid, packet, ctx),
                Query::Occluded => self.occluded_packet(valid, packet, ctx),
            };
        }
    }

    fn trace_coherent<W: SimdFloat>(
        &self,
        packets: &mut [RayPacket<W>],
        ctx: &TraversalContext,
        query: Query,
        stats: &mut TraversalStats,
    ) {
        match query {
            Query::Intersect => self.intersect_coherent(packets, ctx, stats),
            Query::Occluded => self.occluded_coherent(packets, ctx, stats),
        }
    }

    /// Everything except the octant check that decides whether the coherent path may run.
    fn coherent_allowed(&self, ctx: &TraversalContext, ray_count: usize) -> bool {
        let reason = if ctx.coherence != Coherence::Coherent {
            "stream is not marked coherent"
        } else if !self.config.coherent_path {
            "coherent path is disabled"
        } else if self.config.robust {
            "robust traversal requested"
        } else if !P::SUPPORTS_PACKETS {
            "primitives do not support packets"
        } else if self.bvh.has_motion() {
            "hierarchy has motion nodes"
        } else if ray_count > self.config.max_coherent_rays {
            "too many rays for the coherent path"
        } else {
            return true;
        };
        log::trace!("coherent path skipped: {reason}");
        false
    }
}
