//! The `Multiplexer` contract.
//!
//! # Implementors
//!
//! - `BlockingMultiplexer`: every operation runs to completion inside
//!   `start`; `poll` only replays callbacks. Works everywhere.
//! - `IoUringMultiplexer` (Linux): SQE per operation, linked timeouts for
//!   deadlines, CQE `user_data` is the operation address.
//! - `EpollMultiplexer` (Linux): readiness registration; the syscall is
//!   retried when the fd becomes ready.
//! - `IocpMultiplexer` (Windows): OVERLAPPED I/O plus thread-pool waits
//!   that post packets to the port.
//! - `SynchronizedMultiplexer<M>`: wraps any of the above behind a mutex.
//!
//! # Threading
//!
//! `poll` drives one instance from one thread at a time (`&mut self`).
//! Operations started on one instance must be cancelled and polled on that
//! same instance; operations carry their owner's id and a mismatch is
//! rejected with `InvalidArgument`. A backend that waits in the kernel
//! hands out an `Interrupt` so other threads can cut that wait short.

use std::alloc::Layout;
use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::handle::NativeHandle;
use crate::operation::{
    Completion, Listener, ObjectKind, Operation, OperationKind, OperationRef, Request,
};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Identity of one multiplexer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MultiplexerId(usize);

impl MultiplexerId {
    pub fn next() -> Self {
        MultiplexerId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for MultiplexerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mux#{}", self.0)
    }
}

/// Registration state of one handle with one multiplexer, created by
/// `attach` and torn down by `detach`.
#[derive(Debug, Default)]
pub struct Connector {
    owner: Option<MultiplexerId>,
    fixed_slot: Option<u32>,
}

impl Connector {
    pub const fn new() -> Self {
        Self {
            owner: None,
            fixed_slot: None,
        }
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.owner.is_some()
    }

    #[inline]
    pub fn owner(&self) -> Option<MultiplexerId> {
        self.owner
    }

    /// io_uring registered-file index.
    #[inline]
    pub fn fixed_slot(&self) -> Option<u32> {
        self.fixed_slot
    }

    /// Mark attached to `owner`. Attaching twice is an error; attach and
    /// detach are strictly paired.
    pub fn bind(&mut self, owner: MultiplexerId, fixed_slot: Option<u32>) -> Result<()> {
        if self.owner.is_some() {
            return Err(Error::InvalidArgument);
        }
        self.owner = Some(owner);
        self.fixed_slot = fixed_slot;
        Ok(())
    }

    /// Clear the registration made by `owner`, returning its fixed slot.
    pub fn unbind(&mut self, owner: MultiplexerId) -> Result<Option<u32>> {
        if self.owner != Some(owner) {
            return Err(Error::InvalidArgument);
        }
        self.owner = None;
        Ok(self.fixed_slot.take())
    }
}

/// Lifecycle transitions reported to listeners during one `poll`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStatistics {
    pub submitted: usize,
    pub completed: usize,
    pub concluded: usize,
}

impl PollStatistics {
    pub fn is_empty(&self) -> bool {
        self.submitted == 0 && self.completed == 0 && self.concluded == 0
    }
}

impl AddAssign for PollStatistics {
    fn add_assign(&mut self, rhs: Self) {
        self.submitted += rhs.submitted;
        self.completed += rhs.completed;
        self.concluded += rhs.concluded;
    }
}

/// Wakes a `poll` that is waiting in the kernel, or makes the next wait
/// return at once. Usable from any thread without the multiplexer.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// Result of `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    /// Issued to the kernel.
    Pending,
    /// The result is already stored; listeners hear about it on the next
    /// `poll`.
    Ready,
}

pub trait Multiplexer: Send {
    fn name(&self) -> &'static str;

    fn id(&self) -> MultiplexerId;

    /// Size and alignment of one operation's storage.
    fn storage_requirements(&self) -> Layout {
        Layout::new::<Operation>()
    }

    fn supports(&self, object: ObjectKind, operation: OperationKind) -> bool;

    /// `None` for backends whose `poll` never blocks.
    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }

    /// Register `handle` and fill in its connector. The handle must be
    /// flagged multiplexable.
    fn attach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()>;

    fn detach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()>;

    /// Allocate operation storage without starting it. Fails with
    /// `UnsupportedMultiplexerHandleRelation` if this backend has no
    /// implementation for the request's object and operation.
    fn construct(
        &mut self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<OperationRef>;

    /// Start a constructed operation. `Err` means nothing was issued and no
    /// listener callbacks will follow.
    fn start(&mut self, operation: &OperationRef) -> Result<Started>;

    fn construct_and_start(
        &mut self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<(OperationRef, Started)> {
        let operation = self.construct(request, listener)?;
        let started = self.start(&operation)?;
        Ok((operation, started))
    }

    /// Request cancellation. Returns once the request is issued; the
    /// operation still concludes through `poll`. A no-op if a result is
    /// already known, which is then kept.
    fn cancel(&mut self, operation: &OperationRef) -> Result<()>;

    /// Reap kernel completions, waiting up to `deadline` if none are ready,
    /// then replay status changes to listeners.
    fn poll(&mut self, deadline: Deadline) -> Result<PollStatistics>;

    fn submit_and_poll(
        &mut self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
        deadline: Deadline,
    ) -> Result<(OperationRef, PollStatistics)> {
        let (operation, _) = self.construct_and_start(request, listener)?;
        let statistics = self.poll(deadline)?;
        Ok((operation, statistics))
    }

    /// Run one request to conclusion on the calling thread and return the
    /// concluded operation (so owned buffers can be taken back).
    fn block_operation(&mut self, request: Request) -> Result<OperationRef> {
        let (operation, _) = self.construct_and_start(request, None)?;
        while !operation.is_concluded() {
            self.poll(Deadline::never())?;
        }
        Ok(operation)
    }

    fn block(&mut self, request: Request) -> Result<Completion> {
        self.block_operation(request)?.outcome()
    }
}

impl<M: Multiplexer + ?Sized> Multiplexer for Box<M> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn id(&self) -> MultiplexerId {
        (**self).id()
    }

    fn storage_requirements(&self) -> Layout {
        (**self).storage_requirements()
    }

    fn supports(&self, object: ObjectKind, operation: OperationKind) -> bool {
        (**self).supports(object, operation)
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        (**self).interrupter()
    }

    fn attach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        (**self).attach(handle, connector)
    }

    fn detach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        (**self).detach(handle, connector)
    }

    fn construct(
        &mut self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<OperationRef> {
        (**self).construct(request, listener)
    }

    fn start(&mut self, operation: &OperationRef) -> Result<Started> {
        (**self).start(operation)
    }

    fn construct_and_start(
        &mut self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<(OperationRef, Started)> {
        (**self).construct_and_start(request, listener)
    }

    fn cancel(&mut self, operation: &OperationRef) -> Result<()> {
        (**self).cancel(operation)
    }

    fn poll(&mut self, deadline: Deadline) -> Result<PollStatistics> {
        (**self).poll(deadline)
    }

    fn block_operation(&mut self, request: Request) -> Result<OperationRef> {
        (**self).block_operation(request)
    }
}
