//! Alignment arithmetic for device memory.
//!
//! The ray tracing extensions impose several power-of-two alignments on device addresses: the
//! scratch buffer of a build must start at a multiple of
//! `minAccelerationStructureScratchOffsetAlignment`, shader group handles are laid out at
//! multiples of `shaderGroupHandleAlignment`, and every region of a shader binding table starts at
//! a multiple of `shaderGroupBaseAlignment`.

use crate::DeviceSize;
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    num::NonZero,
};

/// Vulkan analog of std's [`Alignment`], stored as a [`DeviceSize`] that is guaranteed to be a
/// valid Vulkan alignment.
///
/// [`Alignment`]: std::ptr::Alignment
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAlignment(NonZero<DeviceSize>);

impl DeviceAlignment {
    /// The smallest possible alignment, 1.
    pub const MIN: Self = Self(NonZero::<DeviceSize>::MIN);

    /// Tries to create a `DeviceAlignment` from a [`DeviceSize`], returning [`None`] if it's not a
    /// power of two.
    #[inline]
    pub const fn new(alignment: DeviceSize) -> Option<Self> {
        if alignment.is_power_of_two() {
            // SAFETY: A power of two is never zero.
            Some(Self(unsafe { NonZero::new_unchecked(alignment) }))
        } else {
            None
        }
    }

    /// Creates a `DeviceAlignment` from a device limit, treating zero (a limit the implementation
    /// left unset) as [`DeviceAlignment::MIN`].
    ///
    /// Returns [`None`] if `alignment` is neither zero nor a power of two.
    #[inline]
    pub const fn from_limit(alignment: u32) -> Option<Self> {
        if alignment == 0 {
            Some(Self::MIN)
        } else {
            Self::new(alignment as DeviceSize)
        }
    }

    /// Returns the alignment as a [`DeviceSize`].
    #[inline]
    pub const fn as_devicesize(self) -> DeviceSize {
        self.0.get()
    }

    /// Returns the base-2 logarithm of the alignment.
    #[inline]
    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl Debug for DeviceAlignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:?} (1 << {:?})", self.0, self.log2())
    }
}

impl Default for DeviceAlignment {
    #[inline]
    fn default() -> Self {
        Self::MIN
    }
}

impl From<DeviceAlignment> for DeviceSize {
    #[inline]
    fn from(alignment: DeviceAlignment) -> Self {
        alignment.as_devicesize()
    }
}

/// Rounds `val` up to the next multiple of `alignment`.
#[inline]
pub const fn align_up(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    align_down(val + alignment.as_devicesize() - 1, alignment)
}

/// Rounds `val` down to the previous multiple of `alignment`.
#[inline]
pub const fn align_down(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    val & !(alignment.as_devicesize() - 1)
}
