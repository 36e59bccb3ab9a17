//! Anonymous pipes.

use allio_core::{Arguments, Deadline, HandleFlags, ObjectKind, Result};
use allio_module::sys;

use crate::context::Context;
use crate::handle::OwnedHandle;
use crate::{block_operation, received, transferred};

/// One end of a pipe. `read` on the write end (or the reverse) fails with
/// the platform error.
#[derive(Debug)]
pub struct Pipe {
    handle: OwnedHandle,
}

impl Pipe {
    /// `(reader, writer)`.
    pub fn create() -> Result<(Pipe, Pipe)> {
        let (r, w) = sys::pipe()?;
        Ok((
            Pipe { handle: OwnedHandle::new(r, HandleFlags::NONE) },
            Pipe { handle: OwnedHandle::new(w, HandleFlags::NONE) },
        ))
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut OwnedHandle {
        &mut self.handle
    }

    /// Empty once every writer is closed.
    pub fn read(&self, buffer: Vec<u8>, deadline: Deadline) -> Result<Vec<u8>> {
        let args = Arguments::Read { buffer };
        received(block_operation(self.handle.request(ObjectKind::Pipe, args, deadline, None))?)
    }

    pub fn write(&self, buffer: Vec<u8>, deadline: Deadline) -> Result<usize> {
        let args = Arguments::Write { buffer };
        transferred(block_operation(self.handle.request(ObjectKind::Pipe, args, deadline, None))?)
    }

    pub async fn read_async(&self, context: &Context, buffer: Vec<u8>, deadline: Deadline) -> Result<Vec<u8>> {
        let args = Arguments::Read { buffer };
        let request = self.handle.request(ObjectKind::Pipe, args, deadline, Some(context));
        received(context.submit(request).await?)
    }

    pub async fn write_async(&self, context: &Context, buffer: Vec<u8>, deadline: Deadline) -> Result<usize> {
        let args = Arguments::Write { buffer };
        let request = self.handle.request(ObjectKind::Pipe, args, deadline, Some(context));
        transferred(context.submit(request).await?)
    }
}
