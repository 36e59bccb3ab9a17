//! ABI-stable handle for crossing dynamic-library boundaries.
//!
//! A library can hand out an `AbiHandle` instead of its own Rust types. The
//! receiver polls `handle_value` with whatever event loop it has and calls
//! back through the function table: `notify` when the poll fires, `close`
//! when done. Layout matches the C struct `allio_abi_handle`.

use std::fmt;

use crate::error::{Error, Result};
use crate::handle::{NativeHandle, RawHandle, NULL_RAW_HANDLE};

pub const ABI_VERSION: u32 = 1;

/// Poll-interest bits stored in `handle_information` on unix.
#[cfg(unix)]
pub const POLL_READ: usize = libc::POLLIN as usize;
#[cfg(unix)]
pub const POLL_WRITE: usize = libc::POLLOUT as usize;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiResult {
    Success = 0,
    /// Not finished; poll the handle again.
    TryAgain = 1,
}

#[repr(C)]
pub struct AbiFunctions {
    pub close: unsafe extern "C" fn(handle: *mut AbiHandle),
    /// `information` is the poll result mask on unix, unused on Windows.
    pub notify: unsafe extern "C" fn(handle: *mut AbiHandle, information: usize) -> AbiResult,
}

#[repr(C)]
pub struct AbiHandle {
    pub version: u32,
    pub handle_value: usize,
    pub handle_information: usize,
    pub functions: *const AbiFunctions,
}

// Safety: the struct is plain data; the function table is 'static.
unsafe impl Send for AbiHandle {}

impl AbiHandle {
    pub fn new(raw: RawHandle, information: usize, functions: &'static AbiFunctions) -> Self {
        Self {
            version: ABI_VERSION,
            handle_value: raw as usize,
            handle_information: information,
            functions,
        }
    }

    pub const fn null() -> Self {
        Self {
            version: ABI_VERSION,
            handle_value: NULL_RAW_HANDLE as usize,
            handle_information: 0,
            functions: std::ptr::null(),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.functions.is_null() || self.raw() == NULL_RAW_HANDLE
    }

    pub fn check_version(&self) -> Result<()> {
        if self.version != ABI_VERSION {
            return Err(Error::UnsupportedOperation);
        }
        Ok(())
    }

    #[inline]
    pub fn raw(&self) -> RawHandle {
        self.handle_value as RawHandle
    }

    /// Borrowed view of the platform handle.
    pub fn native(&self, flags: crate::handle::HandleFlags) -> Result<NativeHandle> {
        self.check_version()?;
        if self.is_null() {
            return Err(Error::HandleIsNull);
        }
        Ok(NativeHandle::new(self.raw(), flags))
    }

    /// Forward a poll result to the owner.
    pub fn notify(&mut self, information: usize) -> Result<AbiResult> {
        self.check_version()?;
        if self.functions.is_null() {
            return Err(Error::HandleIsNull);
        }
        // Safety: non-null tables are 'static by construction.
        let notify = unsafe { (*self.functions).notify };
        Ok(unsafe { notify(self, information) })
    }

    /// Close through the function table and reset to null. A null handle
    /// is left alone.
    pub fn close(&mut self) {
        if self.functions.is_null() {
            return;
        }
        // Safety: see `notify`.
        let close = unsafe { (*self.functions).close };
        unsafe { close(self) };
        *self = AbiHandle::null();
    }
}

impl Default for AbiHandle {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for AbiHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbiHandle")
            .field("version", &self.version)
            .field("handle_value", &self.handle_value)
            .field("handle_information", &format_args!("{:#x}", self.handle_information))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CLOSED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn close(handle: *mut AbiHandle) {
        CLOSED.store((*handle).handle_value, Ordering::SeqCst);
    }

    unsafe extern "C" fn notify(_: *mut AbiHandle, information: usize) -> AbiResult {
        if information == 0 {
            AbiResult::TryAgain
        } else {
            AbiResult::Success
        }
    }

    static TABLE: AbiFunctions = AbiFunctions { close, notify };

    #[test]
    fn test_layout_is_four_words() {
        assert_eq!(std::mem::size_of::<AbiHandle>(), 4 * std::mem::size_of::<usize>());
    }

    #[test]
    fn test_notify_and_close() {
        let mut h = AbiHandle::new(11, 0, &TABLE);
        assert!(!h.is_null());
        assert_eq!(h.notify(0), Ok(AbiResult::TryAgain));
        assert_eq!(h.notify(1), Ok(AbiResult::Success));
        h.close();
        assert_eq!(CLOSED.load(Ordering::SeqCst), 11);
        assert!(h.is_null());
        h.close();
    }

    #[test]
    fn test_version_mismatch() {
        let mut h = AbiHandle::new(5, 0, &TABLE);
        h.version = 2;
        assert_eq!(h.notify(1), Err(Error::UnsupportedOperation));
        assert_eq!(h.native(Default::default()).err(), Some(Error::UnsupportedOperation));
    }

    #[test]
    fn test_null_handle() {
        let mut h = AbiHandle::null();
        assert!(h.is_null());
        assert_eq!(h.notify(1), Err(Error::HandleIsNull));
    }
}
