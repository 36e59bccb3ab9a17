//! Page protection of sections and mappings.

/// Access allowed to mapped pages. Write-only and execute-only pages are
/// not portable and have no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protection {
    /// Reserved address space; any access faults.
    None,
    Read,
    #[default]
    ReadWrite,
}

impl Protection {
    #[inline]
    pub const fn is_readable(self) -> bool {
        !matches!(self, Protection::None)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite)
    }

    /// Whether every access `other` allows is also allowed by `self`.
    pub const fn allows(self, other: Protection) -> bool {
        (self as u8) >= (other as u8)
    }
}

/// Round `value` up to a multiple of `page`, a power of two.
#[inline]
pub const fn round_to_page(value: usize, page: usize) -> usize {
    (value + page - 1) & !(page - 1)
}

#[inline]
pub const fn is_page_aligned(value: u64, page: usize) -> bool {
    value & (page as u64 - 1) == 0
}
