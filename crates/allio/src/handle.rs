//! Owned platform handles and their ABI form.

use std::fmt;
use std::mem;

use allio_core::abi::{AbiFunctions, AbiHandle, AbiResult};
use allio_core::{
    kdebug, Arguments, Connector, Deadline, HandleFlags, NativeHandle, ObjectKind, RawHandle,
    Request, Result,
};
use allio_module::sys;

use crate::context::Context;

/// A platform handle that is closed on drop, plus its multiplexer
/// registration.
pub struct OwnedHandle {
    native: NativeHandle,
    connector: Connector,
    attached_to: Option<Context>,
}

impl OwnedHandle {
    /// Take ownership of `raw`. Every handle allio creates is usable with
    /// a multiplexer, so `MULTIPLEXABLE` is always set.
    pub fn new(raw: RawHandle, flags: HandleFlags) -> Self {
        Self {
            native: NativeHandle::new(raw, flags | HandleFlags::MULTIPLEXABLE),
            connector: Connector::new(),
            attached_to: None,
        }
    }

    #[inline]
    pub fn native(&self) -> NativeHandle {
        self.native
    }

    #[inline]
    pub fn raw(&self) -> RawHandle {
        self.native.raw
    }

    #[inline]
    pub fn flags(&self) -> HandleFlags {
        self.native.flags
    }

    #[inline]
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn is_attached(&self) -> bool {
        self.connector.is_attached()
    }

    /// Register with `context`'s multiplexer. A handle is attached to at
    /// most one multiplexer at a time.
    pub fn attach(&mut self, context: &Context) -> Result<()> {
        context.multiplexer().attach(&self.native, &mut self.connector)?;
        self.attached_to = Some(context.clone());
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        match self.attached_to.take() {
            Some(context) => context.multiplexer().detach(&self.native, &mut self.connector),
            None => Ok(()),
        }
    }

    /// Request against this handle. The registration (fixed slot) is
    /// carried only when `context` is the one the handle is attached to.
    pub fn request(
        &self,
        object: ObjectKind,
        arguments: Arguments,
        deadline: Deadline,
        context: Option<&Context>,
    ) -> Request {
        let request = Request::new(object, self.native, arguments).deadline(deadline);
        match context {
            Some(context) if self.connector.owner() == Some(context.id()) => {
                request.connector(&self.connector)
            }
            _ => request,
        }
    }

    /// Give up ownership without closing.
    pub fn into_raw(mut self) -> RawHandle {
        if let Err(e) = self.detach() {
            kdebug!("allio: detach before release failed: {}", e);
        }
        let raw = self.native.raw;
        mem::forget(self);
        raw
    }

    /// Transfer ownership into an ABI handle. The receiver closes it
    /// through the function table.
    pub fn into_abi(self) -> AbiHandle {
        let flags = self.flags().bits() as usize;
        AbiHandle::new(self.into_raw(), flags, &OWNED_FUNCTIONS)
    }

    /// Take ownership back from an ABI handle produced by `into_abi`.
    /// The ABI value is reset to null.
    pub fn from_abi(abi: &mut AbiHandle) -> Result<Self> {
        let flags = HandleFlags::from_bits(abi.handle_information as u32);
        let native = abi.native(flags)?;
        *abi = AbiHandle::null();
        Ok(Self::new(native.raw, native.flags))
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            kdebug!("allio: detach on drop failed: {}", e);
        }
        close_raw(self.native.raw, self.native.flags);
    }
}

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("native", &self.native)
            .field("attached", &self.connector.is_attached())
            .finish()
    }
}

fn close_raw(raw: RawHandle, flags: HandleFlags) {
    cfg_if::cfg_if! {
        if #[cfg(windows)] {
            // Derived flags alias across object kinds, so the pseudo-handle
            // is recognized by value.
            if raw == sys::current_process() {
                return;
            }
            if flags.contains(HandleFlags::SOCKET) {
                sys::close_socket(raw);
                return;
            }
        } else {
            let _ = flags;
        }
    }
    sys::close(raw);
}

unsafe extern "C" fn abi_close(handle: *mut AbiHandle) {
    // Safety: called through AbiHandle::close with a live handle.
    let abi = unsafe { &*handle };
    close_raw(abi.raw(), HandleFlags::from_bits(abi.handle_information as u32));
}

unsafe extern "C" fn abi_notify(_handle: *mut AbiHandle, _information: usize) -> AbiResult {
    AbiResult::Success
}

static OWNED_FUNCTIONS: AbiFunctions = AbiFunctions {
    close: abi_close,
    notify: abi_notify,
};
