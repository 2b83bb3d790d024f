//! Lane width abstraction on top of `simba`.
//!
//! Traversal code is generic over [`SimdFloat`]: plain `f32` is the one lane instance and the
//! reference for `WideF32x4` / `WideF32x8`. Vectors of lanes are `nalgebra::Vector3<W>`, which
//! `nalgebra` already treats as a SIMD value (`splat`, `extract`, `replace` per lane).

use std::fmt::Debug;

use simba::simd::{
    SimdBool as _, SimdRealField, SimdValue, WideBoolF32x4, WideBoolF32x8, WideF32x4, WideF32x8,
};

/// What `simba` is missing for traversal: unordered min/max, NaN tests, infinities,
/// conversions between lane masks and bits and per-lane integer storage.
pub trait SimdFloat: SimdRealField + SimdValue<Element = f32> + Copy {
    /// One `u32` per lane, used for the integer fields of ray packets.
    type Ints: Copy + Debug + Default + PartialEq + AsRef<[u32]> + AsMut<[u32]>;

    /// Loads the first `LANES` values of the slice.
    fn load(values: &[f32]) -> Self;

    /// Lane-wise minimum, NaN handling is unspecified.
    fn fast_min(self, rhs: Self) -> Self;

    /// Lane-wise maximum, NaN handling is unspecified.
    fn fast_max(self, rhs: Self) -> Self;

    fn is_nan(self) -> Self::SimdBool;

    /// Inverse of `SimdBool::bitmask`, bits above `LANES` are ignored.
    fn mask_from_bits(bits: u64) -> Self::SimdBool;

    /// `self * m - s`, deliberately not fused.
    #[inline(always)]
    fn mul_sub(self, m: Self, s: Self) -> Self {
        self * m - s
    }

    #[inline(always)]
    fn infinity() -> Self {
        Self::splat(f32::INFINITY)
    }

    #[inline(always)]
    fn neg_infinity() -> Self {
        Self::splat(f32::NEG_INFINITY)
    }
}

impl SimdFloat for f32 {
    type Ints = [u32; 1];

    #[inline(always)]
    fn load(values: &[f32]) -> Self {
        values[0]
    }

    #[inline(always)]
    fn fast_min(self, rhs: Self) -> Self {
        self.min(rhs)
    }

    #[inline(always)]
    fn fast_max(self, rhs: Self) -> Self {
        self.max(rhs)
    }

    #[inline(always)]
    fn is_nan(self) -> bool {
        f32::is_nan(self)
    }

    #[inline(always)]
    fn mask_from_bits(bits: u64) -> bool {
        bits & 1 != 0
    }
}

macro_rules! impl_wide_simd_float {
    ( $type:ident, $bool_type:ident, $lanes:literal ) => {
        impl SimdFloat for $type {
            type Ints = [u32; $lanes];

            #[inline(always)]
            fn load(values: &[f32]) -> Self {
                $type::from_arr(std::array::from_fn(|i| values[i]))
            }

            #[inline(always)]
            fn fast_min(self, rhs: Self) -> Self {
                $type(self.0.fast_min(rhs.0))
            }

            #[inline(always)]
            fn fast_max(self, rhs: Self) -> Self {
                $type(self.0.fast_max(rhs.0))
            }

            #[inline(always)]
            fn is_nan(self) -> $bool_type {
                $bool_type(self.0.is_nan())
            }

            #[inline(always)]
            fn mask_from_bits(bits: u64) -> $bool_type {
                let lanes: [bool; $lanes] = std::array::from_fn(|i| bits & (1 << i) != 0);
                $bool_type::from(lanes)
            }
        }
    };
}

impl_wide_simd_float!(WideF32x4, WideBoolF32x4, 4);
impl_wide_simd_float!(WideF32x8, WideBoolF32x8, 8);

/// Lane `i` of the mask becomes bit `i` of the result.
#[inline(always)]
pub fn bits<W: SimdFloat>(mask: W::SimdBool) -> u64 {
    mask.bitmask()
}

/// Returns `on_true` where the mask is set and `on_false` elsewhere.
#[inline(always)]
pub fn select<W: SimdFloat>(mask: W::SimdBool, on_true: W, on_false: W) -> W {
    on_true.select(mask, on_false)
}
