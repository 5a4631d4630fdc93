//! 16.16 fixed-point arithmetic
//!
//! Step timing runs in interrupt context where floating point is either
//! unavailable or too slow, so per-tick phase accumulation uses an
//! unsigned fixed-point type with 16 integer and 16 fractional bits.

use core::fmt;

/// Unsigned 16.16 fixed-point number
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Fixed16(u32);

impl Fixed16 {
    /// Number of fractional bits
    pub const FRAC_BITS: u32 = 16;
    /// Zero
    pub const ZERO: Self = Self(0);
    /// One
    pub const ONE: Self = Self(1 << Self::FRAC_BITS);
    /// Largest representable value (just under 65536)
    pub const MAX: Self = Self(u32::MAX);

    const FRAC_MASK: u32 = (1 << Self::FRAC_BITS) - 1;
    const SCALE: f32 = (1u32 << Self::FRAC_BITS) as f32;

    /// Build from the raw bit pattern
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bit pattern
    pub const fn to_bits(self) -> u32 {
        self.0
    }

    /// Build from an integer
    pub const fn from_int(value: u16) -> Self {
        Self((value as u32) << Self::FRAC_BITS)
    }

    /// Build from a float, saturating to `[0, MAX]`
    pub fn from_f32(value: f32) -> Self {
        if !(value > 0.0) {
            return Self::ZERO;
        }
        // `as` saturates on overflow
        Self((value * Self::SCALE) as u32)
    }

    /// Exact ratio `num / den`, or `None` if it does not fit or `den` is zero
    pub fn from_ratio(num: u32, den: u32) -> Option<Self> {
        if den == 0 {
            return None;
        }
        let raw = ((num as u64) << Self::FRAC_BITS) / den as u64;
        u32::try_from(raw).ok().map(Self)
    }

    /// Convert to a float
    pub fn to_f32(self) -> f32 {
        self.0 as f32 / Self::SCALE
    }

    /// Integer part (truncated)
    pub const fn int_part(self) -> u32 {
        self.0 >> Self::FRAC_BITS
    }

    /// Fractional part
    pub const fn frac(self) -> Self {
        Self(self.0 & Self::FRAC_MASK)
    }

    /// Checked addition
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    /// Saturating addition
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Checked subtraction
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    /// Saturating subtraction
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Debug for Fixed16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed16({})", self.to_f32())
    }
}
