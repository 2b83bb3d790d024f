pub mod simba;
mod stack;
mod stats;

pub use stack::BoundedStack;
pub use stats::Stats;

use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Set lanes of a [`LaneMask`], lowest first.
#[derive(Copy, Clone, Debug)]
pub struct Lanes {
    remaining: u64,
}

impl Iterator for Lanes {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let lane = LaneMask(self.remaining).lowest()?;
        self.remaining &= self.remaining - 1;
        Some(lane)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = LaneMask(self.remaining).count();
        (count, Some(count))
    }
}

impl DoubleEndedIterator for Lanes {
    fn next_back(&mut self) -> Option<usize> {
        let lane = LaneMask(self.remaining).highest()?;
        self.remaining &= !(1u64 << lane);
        Some(lane)
    }
}

impl ExactSizeIterator for Lanes {}

/// Set of active lanes (rays or children), one bit per lane.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LaneMask(u64);

impl LaneMask {
    pub const EMPTY: Self = Self(0);
    pub const MAX_LANES: usize = u64::BITS as usize;

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Mask with the lowest `count` lanes set.
    pub const fn first(count: usize) -> Self {
        if count >= Self::MAX_LANES {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    pub const fn single(lane: usize) -> Self {
        Self(1u64 << lane)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn contains(self, lane: usize) -> bool {
        self.0 & (1u64 << lane) != 0
    }

    /// Index of the lowest set lane.
    pub fn lowest(self) -> Option<usize> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as usize)
    }

    /// Index of the highest set lane.
    pub fn highest(self) -> Option<usize> {
        (self.0 != 0).then(|| (u64::BITS - 1 - self.0.leading_zeros()) as usize)
    }

    pub fn set(&mut self, lane: usize) {
        self.0 |= 1u64 << lane;
    }

    pub fn clear(&mut self, lane: usize) {
        self.0 &= !(1u64 << lane);
    }

    pub fn iter(self) -> Lanes {
        Lanes { remaining: self.0 }
    }

    /// Lanes of sub-packet `packet`, shifted down to local lane indices `0..width`.
    pub fn packet(self, packet: usize, width: usize) -> Self {
        Self((self.0 >> (packet * width)) & Self::first(width).0)
    }

    /// Inverse of [`LaneMask::packet`]: moves local packet lanes to their position in the stream.
    pub fn from_packet(local: Self, packet: usize, width: usize) -> Self {
        Self((local.0 & Self::first(width).0) << (packet * width))
    }

    /// Indices of the sub-packets that contain at least one set lane, in increasing order.
    pub fn packets(self, width: usize) -> impl Iterator<Item = usize> {
        let packet_mask = Self::first(width).0;
        let packet_count = Self::MAX_LANES.div_ceil(width);
        (0..packet_count).filter(move |p| (self.0 >> (p * width)) & packet_mask != 0)
    }
}

impl BitAnd for LaneMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for LaneMask {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOr for LaneMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LaneMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Not for LaneMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl IntoIterator for LaneMask {
    type Item = usize;
    type IntoIter = Lanes;

    fn into_iter(self) -> Lanes {
        self.iter()
    }
}

impl FromIterator<usize> for LaneMask {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut mask = Self::EMPTY;
        for lane in iter {
            mask.set(lane);
        }
        mask
    }
}
