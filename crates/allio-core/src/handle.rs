//! Native handle values and their flag word.
//!
//! A `NativeHandle` is plain data: the raw OS value plus flags. Ownership
//! (closing on drop) lives in the facade's handle types; the multiplexer
//! only ever borrows native handles.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{Error, Result};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// File descriptor.
        pub type RawHandle = std::os::fd::RawFd;
        pub const NULL_RAW_HANDLE: RawHandle = -1;
    } else {
        /// Kernel object handle, stored as an integer.
        pub type RawHandle = isize;
        pub const NULL_RAW_HANDLE: RawHandle = 0;
    }
}

/// Handle flag word.
///
/// Bits 0..8 are common to every handle, bits 8..16 belong to the concrete
/// handle type (see `HandleFlags::derived`) and bits 16.. are reserved for
/// platform and backend use (see `HandleFlags::platform`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct HandleFlags(u32);

impl HandleFlags {
    pub const NONE: HandleFlags = HandleFlags(0);
    /// The native value refers to an open resource.
    pub const NOT_NULL: HandleFlags = HandleFlags(1 << 0);
    /// The handle may be attached to a multiplexer for asynchronous use.
    pub const MULTIPLEXABLE: HandleFlags = HandleFlags(1 << 1);

    const DERIVED_SHIFT: u32 = 8;
    const PLATFORM_SHIFT: u32 = 16;

    /// Event: a successful wait consumes the signal.
    pub const EVENT_AUTO_RESET: HandleFlags = HandleFlags::derived(0);
    /// Process: refers to the calling process.
    pub const PROCESS_CURRENT: HandleFlags = HandleFlags::derived(0);
    /// File: opened for overlapped I/O (Windows).
    pub const FILE_OVERLAPPED: HandleFlags = HandleFlags::derived(0);

    /// A Winsock `SOCKET`, closed with `closesocket` (Windows).
    pub const SOCKET: HandleFlags = HandleFlags::platform(0);

    /// Flag `bit` (0..8) of the concrete handle type.
    pub const fn derived(bit: u32) -> HandleFlags {
        assert!(bit < Self::PLATFORM_SHIFT - Self::DERIVED_SHIFT);
        HandleFlags(1 << (Self::DERIVED_SHIFT + bit))
    }

    /// Platform flag `bit` (0..16).
    pub const fn platform(bit: u32) -> HandleFlags {
        assert!(bit < 32 - Self::PLATFORM_SHIFT);
        HandleFlags(1 << (Self::PLATFORM_SHIFT + bit))
    }

    pub const fn from_bits(bits: u32) -> Self {
        HandleFlags(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(&self, other: HandleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: HandleFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: HandleFlags) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub const fn with(self, other: HandleFlags) -> Self {
        HandleFlags(self.0 | other.0)
    }
}

impl BitOr for HandleFlags {
    type Output = HandleFlags;

    fn bitor(self, rhs: HandleFlags) -> HandleFlags {
        HandleFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for HandleFlags {
    fn bitor_assign(&mut self, rhs: HandleFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for HandleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleFlags(")?;
        let mut sep = "";
        if self.contains(Self::NOT_NULL) {
            write!(f, "NOT_NULL")?;
            sep = " | ";
        }
        if self.contains(Self::MULTIPLEXABLE) {
            write!(f, "{}MULTIPLEXABLE", sep)?;
            sep = " | ";
        }
        let rest = self.0 & !(Self::NOT_NULL.0 | Self::MULTIPLEXABLE.0);
        if rest != 0 {
            write!(f, "{}{:#x}", sep, rest)?;
        }
        write!(f, ")")
    }
}

/// Raw OS handle plus flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    pub flags: HandleFlags,
    pub raw: RawHandle,
}

impl NativeHandle {
    pub const fn null() -> Self {
        Self {
            flags: HandleFlags::NONE,
            raw: NULL_RAW_HANDLE,
        }
    }

    /// Wrap an open native value. `NOT_NULL` is always set.
    pub fn new(raw: RawHandle, flags: HandleFlags) -> Self {
        Self {
            flags: flags | HandleFlags::NOT_NULL,
            raw,
        }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        !self.flags.contains(HandleFlags::NOT_NULL)
    }

    #[inline]
    pub const fn is_multiplexable(&self) -> bool {
        self.flags.contains(HandleFlags::MULTIPLEXABLE)
    }

    /// `Err(HandleIsNull)` unless the handle is open.
    #[inline]
    pub fn check_not_null(&self) -> Result<RawHandle> {
        if self.is_null() {
            Err(Error::HandleIsNull)
        } else {
            Ok(self.raw)
        }
    }

    #[inline]
    pub fn check_multiplexable(&self) -> Result<RawHandle> {
        let raw = self.check_not_null()?;
        if self.is_multiplexable() {
            Ok(raw)
        } else {
            Err(Error::HandleIsNotMultiplexable)
        }
    }
}

impl Default for NativeHandle {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NativeHandle(null)")
        } else {
            write!(f, "NativeHandle({}, {:?})", self.raw, self.flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        let h = NativeHandle::null();
        assert!(h.is_null());
        assert_eq!(h.check_not_null(), Err(Error::HandleIsNull));
        assert_eq!(h.check_multiplexable(), Err(Error::HandleIsNull));
    }

    #[test]
    fn test_new_sets_not_null() {
        let h = NativeHandle::new(3, HandleFlags::NONE);
        assert!(!h.is_null());
        assert_eq!(h.check_not_null(), Ok(3));
        assert_eq!(h.check_multiplexable(), Err(Error::HandleIsNotMultiplexable));

        let m = NativeHandle::new(4, HandleFlags::MULTIPLEXABLE);
        assert_eq!(m.check_multiplexable(), Ok(4));
    }

    #[test]
    fn test_flag_ranges_do_not_overlap() {
        let d = HandleFlags::derived(0);
        let p = HandleFlags::platform(0);
        assert_eq!(d.bits(), 1 << 8);
        assert_eq!(p.bits(), 1 << 16);
        let all = HandleFlags::NOT_NULL | HandleFlags::MULTIPLEXABLE | d | p;
        assert!(all.contains(d));
        let mut f = all;
        f.remove(d);
        assert!(!f.contains(d));
        assert!(f.contains(p));
    }

    #[test]
    fn test_debug_names_common_bits() {
        let f = HandleFlags::NOT_NULL | HandleFlags::MULTIPLEXABLE;
        assert_eq!(format!("{:?}", f), "HandleFlags(NOT_NULL | MULTIPLEXABLE)");
    }
}
