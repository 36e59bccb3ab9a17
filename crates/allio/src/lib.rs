//! # allio - Owned I/O objects over pluggable multiplexers
//!
//! Every object kind offers each of its operations twice: a blocking call
//! taking a `Deadline`, driven on a per-thread blocking multiplexer, and an
//! `_async` form returning a future bound to a `Context`.
//!
//! ## Quick Start
//!
//! ```ignore
//! use allio::{Context, Deadline, File};
//!
//! let context = Context::from_env()?;
//! let file = File::create("/tmp/allio.txt")?;
//! context.block_on(async {
//!     file.write_at_async(&context, 0, b"allio".to_vec(), Deadline::never()).await?;
//!     file.read_at_async(&context, 0, vec![0; 5], Deadline::never()).await
//! })??;
//! ```
//!
//! ## Objects
//!
//! | Object           | Operations                       | Platforms      |
//! |------------------|----------------------------------|----------------|
//! | `File`           | read_at, write_at                | linux, windows |
//! | `Pipe`           | read, write                      | linux, windows |
//! | `DatagramSocket` | send_to, receive_from            | linux, windows |
//! | `ListenSocket`   | accept                           | linux, windows |
//! | `StreamSocket`   | connect, read, write             | linux, windows |
//! | `Event`          | signal, reset, wait              | linux, windows |
//! | `Process`        | wait                             | linux, windows |
//! | `Section`, `Map` | map, commit, protect (no I/O)    | linux, windows |
//!
//! ## Architecture
//!
//! ```text
//!   File / Socket / Event / Process  (OwnedHandle + Connector)
//!                  │
//!        ┌─────────┴──────────┐
//!        ▼                    ▼
//!   blocking call        OperationFuture ──▶ Context (SynchronizedMultiplexer)
//!   (thread-local                                    │
//!    BlockingMultiplexer)               io_uring / epoll / IOCP / blocking
//! ```

pub mod handle;
pub mod context;
pub mod future;
pub mod file;
pub mod event;
pub mod process;
pub mod pipe;
pub mod socket;
pub mod section;

use std::cell::RefCell;

use allio_core::{Error, Multiplexer, OperationRef, Request};
use allio_module::BlockingMultiplexer;

pub use allio_core::{
    Completion, Deadline, Error as AllioError, HandleFlags, NativeHandle, OperationStatus,
    Protection, Result,
};
pub use allio_module::{MultiplexerConfig, MultiplexerKind};
pub use context::Context;
pub use event::Event;
pub use file::File;
pub use future::{block_on, OperationFuture};
pub use handle::OwnedHandle;
pub use pipe::Pipe;
pub use process::Process;
pub use section::{Map, Section};
pub use socket::{DatagramSocket, ListenSocket, StreamSocket};

thread_local! {
    static BLOCKING: RefCell<BlockingMultiplexer> = RefCell::new(BlockingMultiplexer::new());
}

/// Run `request` to conclusion on this thread's blocking multiplexer.
pub fn block_operation(request: Request) -> Result<OperationRef> {
    BLOCKING.with(|mux| mux.borrow_mut().block_operation(request))
}

/// Buffer of a concluded input operation, truncated to what was read.
pub(crate) fn received(operation: OperationRef) -> Result<Vec<u8>> {
    operation.outcome()?;
    Ok(operation.take_buffer().unwrap_or_default())
}

/// Byte count of a concluded transfer.
pub(crate) fn transferred(operation: OperationRef) -> Result<usize> {
    operation.outcome()?.transferred().ok_or(Error::UnknownFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use allio_core::{Arguments, ObjectKind};

    #[test]
    fn test_block_operation_rejects_null_handle() {
        let request = Request::new(ObjectKind::Event, NativeHandle::null(), Arguments::Wait);
        assert_eq!(block_operation(request).err(), Some(Error::HandleIsNull));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_block_operation_on_signaled_event() {
        let event = Event::new(true).unwrap();
        event.signal().unwrap();
        assert_eq!(event.wait(Deadline::never()), Ok(()));
        assert_eq!(event.wait(Deadline::instant()), Err(Error::AsyncOperationTimedOut));
    }
}
