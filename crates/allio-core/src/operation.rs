//! Operation storage.
//!
//! An `Operation` is the fixed-address record of one I/O request: captured
//! arguments (including owned buffers), the result slot, the lifecycle
//! status and a backend scratch area. It is always heap-allocated behind
//! an `Arc`, so its address (and the addresses of its buffers and scratch)
//! never change between submission and conclusion; backends hand that
//! address to the kernel as the completion token.
//!
//! ```text
//!  constructed ──start──▶ submitted ──kernel──▶ completed ──flush──▶ concluded
//! ```
//!
//! Cancellation and deadline expiry are alternate ways into `completed`
//! with an error result, not separate states.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::defer::{DeferLink, Deferred};
use crate::error::{Error, Result};
use crate::handle::{NativeHandle, RawHandle};
use crate::spinlock::SpinLock;

/// Lifecycle status. Monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum OperationStatus {
    Constructed = 0,
    Submitted = 1,
    Completed = 2,
    Concluded = 3,
}

impl OperationStatus {
    /// The following status; `Concluded` is terminal.
    pub const fn next(self) -> Self {
        match self {
            OperationStatus::Constructed => OperationStatus::Submitted,
            OperationStatus::Submitted => OperationStatus::Completed,
            OperationStatus::Completed | OperationStatus::Concluded => OperationStatus::Concluded,
        }
    }
}

impl From<u8> for OperationStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => OperationStatus::Constructed,
            1 => OperationStatus::Submitted,
            2 => OperationStatus::Completed,
            _ => OperationStatus::Concluded,
        }
    }
}

impl From<OperationStatus> for u8 {
    fn from(s: OperationStatus) -> u8 {
        s as u8
    }
}

/// Kind of object an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    File = 0,
    Pipe = 1,
    DatagramSocket = 2,
    ListenSocket = 3,
    StreamSocket = 4,
    Event = 5,
    Process = 6,
    /// Shareable memory object; mapped, never submitted.
    Section = 7,
}

impl ObjectKind {
    pub const COUNT: usize = 8;

    pub const ALL: [ObjectKind; Self::COUNT] = [
        ObjectKind::File,
        ObjectKind::Pipe,
        ObjectKind::DatagramSocket,
        ObjectKind::ListenSocket,
        ObjectKind::StreamSocket,
        ObjectKind::Event,
        ObjectKind::Process,
        ObjectKind::Section,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            ObjectKind::File => "file",
            ObjectKind::Pipe => "pipe",
            ObjectKind::DatagramSocket => "datagram_socket",
            ObjectKind::ListenSocket => "listen_socket",
            ObjectKind::StreamSocket => "stream_socket",
            ObjectKind::Event => "event",
            ObjectKind::Process => "process",
            ObjectKind::Section => "section",
        }
    }
}

/// Kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationKind {
    ReadAt = 0,
    WriteAt = 1,
    Read = 2,
    Write = 3,
    SendTo = 4,
    ReceiveFrom = 5,
    Accept = 6,
    Connect = 7,
    Wait = 8,
}

impl OperationKind {
    pub const COUNT: usize = 9;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            OperationKind::ReadAt => "read_at",
            OperationKind::WriteAt => "write_at",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::SendTo => "send_to",
            OperationKind::ReceiveFrom => "receive_from",
            OperationKind::Accept => "accept",
            OperationKind::Connect => "connect",
            OperationKind::Wait => "wait",
        }
    }

    /// Operations that consume data and are therefore read-direction for
    /// readiness backends.
    pub const fn is_input(self) -> bool {
        matches!(
            self,
            OperationKind::ReadAt
                | OperationKind::Read
                | OperationKind::ReceiveFrom
                | OperationKind::Accept
                | OperationKind::Wait
        )
    }
}

/// Captured arguments. Buffers are owned by the operation while it is in
/// flight and handed back through `Operation::take_buffer`.
#[derive(Debug)]
pub enum Arguments {
    /// Fill `buffer` (its full length) from `offset`.
    ReadAt { offset: u64, buffer: Vec<u8> },
    WriteAt { offset: u64, buffer: Vec<u8> },
    Read { buffer: Vec<u8> },
    Write { buffer: Vec<u8> },
    SendTo { buffer: Vec<u8>, address: SocketAddr },
    ReceiveFrom { buffer: Vec<u8> },
    Accept,
    Connect { address: SocketAddr },
    Wait,
}

impl Arguments {
    pub fn kind(&self) -> OperationKind {
        match self {
            Arguments::ReadAt { .. } => OperationKind::ReadAt,
            Arguments::WriteAt { .. } => OperationKind::WriteAt,
            Arguments::Read { .. } => OperationKind::Read,
            Arguments::Write { .. } => OperationKind::Write,
            Arguments::SendTo { .. } => OperationKind::SendTo,
            Arguments::ReceiveFrom { .. } => OperationKind::ReceiveFrom,
            Arguments::Accept => OperationKind::Accept,
            Arguments::Connect { .. } => OperationKind::Connect,
            Arguments::Wait => OperationKind::Wait,
        }
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        match self {
            Arguments::ReadAt { buffer, .. }
            | Arguments::WriteAt { buffer, .. }
            | Arguments::Read { buffer }
            | Arguments::Write { buffer }
            | Arguments::SendTo { buffer, .. }
            | Arguments::ReceiveFrom { buffer } => Some(buffer),
            _ => None,
        }
    }

    pub fn buffer_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            Arguments::ReadAt { buffer, .. }
            | Arguments::WriteAt { buffer, .. }
            | Arguments::Read { buffer }
            | Arguments::Write { buffer }
            | Arguments::SendTo { buffer, .. }
            | Arguments::ReceiveFrom { buffer } => Some(buffer),
            _ => None,
        }
    }
}

/// Successful outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Bytes read or written.
    Transferred(usize),
    Received { count: usize, address: SocketAddr },
    /// New connection; the caller takes ownership of `handle`.
    Accepted { handle: RawHandle, address: SocketAddr },
    Connected,
    Signaled,
    /// Process exit code; negative values are terminating signal numbers.
    Exited(i32),
}

impl Completion {
    pub fn transferred(&self) -> Option<usize> {
        match self {
            Completion::Transferred(n) => Some(*n),
            Completion::Received { count, .. } => Some(*count),
            _ => None,
        }
    }
}

/// Receives the lifecycle callbacks of one operation, always from the
/// multiplexer's driver thread inside `poll`.
///
/// Callbacks must not call back into the multiplexer that is polling.
pub trait Listener: Send + Sync {
    fn submitted(&self, _operation: &Operation) {}
    fn completed(&self, _operation: &Operation) {}
    fn concluded(&self, operation: &Operation);
}

/// What to construct: the target handle, its object kind, the arguments and
/// a deadline.
#[derive(Debug)]
pub struct Request {
    pub handle: NativeHandle,
    pub object: ObjectKind,
    pub arguments: Arguments,
    pub deadline: Deadline,
    /// Registered-file slot from the handle's connector, if any.
    pub fixed_slot: Option<u32>,
}

impl Request {
    pub fn new(object: ObjectKind, handle: NativeHandle, arguments: Arguments) -> Self {
        Self {
            handle,
            object,
            arguments,
            deadline: Deadline::never(),
            fixed_slot: None,
        }
    }

    #[must_use]
    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: &crate::multiplexer::Connector) -> Self {
        self.fixed_slot = connector.fixed_slot();
        self
    }

    #[inline]
    pub fn kind(&self) -> OperationKind {
        self.arguments.kind()
    }
}

pub type OperationRef = Arc<Operation>;

struct OperationState {
    arguments: Arguments,
    result: Option<Result<Completion>>,
    scratch: Option<Box<dyn Any + Send>>,
}

/// Storage of one in-flight operation.
pub struct Operation {
    link: DeferLink,
    handle: NativeHandle,
    object: ObjectKind,
    kind: OperationKind,
    deadline: Deadline,
    fixed_slot: Option<u32>,
    listener: Option<Arc<dyn Listener>>,
    owner: AtomicUsize,
    cancel_requested: AtomicBool,
    state: SpinLock<OperationState>,
}

impl Operation {
    /// Build storage for `request`. The deadline is started here, so time
    /// spent queued counts against it.
    pub fn new(request: Request, listener: Option<Arc<dyn Listener>>) -> OperationRef {
        let kind = request.kind();
        Arc::new(Operation {
            link: DeferLink::new(),
            handle: request.handle,
            object: request.object,
            kind,
            deadline: request.deadline.start(),
            fixed_slot: request.fixed_slot,
            listener,
            owner: AtomicUsize::new(0),
            cancel_requested: AtomicBool::new(false),
            state: SpinLock::new(OperationState {
                arguments: request.arguments,
                result: None,
                scratch: None,
            }),
        })
    }

    #[inline]
    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    #[inline]
    pub fn object(&self) -> ObjectKind {
        self.object
    }

    #[inline]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The started deadline.
    #[inline]
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    #[inline]
    pub fn fixed_slot(&self) -> Option<u32> {
        self.fixed_slot
    }

    #[inline]
    pub fn status(&self) -> OperationStatus {
        self.link.status()
    }

    #[inline]
    pub fn is_concluded(&self) -> bool {
        self.link.reported() == OperationStatus::Concluded
    }

    pub fn listener(&self) -> Option<&Arc<dyn Listener>> {
        self.listener.as_ref()
    }

    /// Id of the multiplexer that constructed this operation, 0 if none.
    #[inline]
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    pub fn set_owner(&self, id: usize) {
        self.owner.store(id, Ordering::Release);
    }

    /// Record a cancel request. True only for the first request.
    pub fn request_cancel(&self) -> bool {
        !self.cancel_requested.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub fn with_arguments<R>(&self, f: impl FnOnce(&mut Arguments) -> R) -> R {
        f(&mut self.state.lock().arguments)
    }

    /// Run `f` on the backend scratch of type `S`, creating it on first use.
    ///
    /// The scratch is boxed, so pointers into it stay valid until the
    /// operation is dropped. Asking for a different type than the one
    /// already stored replaces it.
    pub fn with_scratch<S, R>(&self, f: impl FnOnce(&mut S) -> R) -> R
    where
        S: Any + Send + Default,
    {
        let mut state = self.state.lock();
        // Moving the box keeps its heap address.
        let mut scratch: Box<S> = match state.scratch.take().map(|s| s.downcast::<S>()) {
            Some(Ok(existing)) => existing,
            _ => Box::new(S::default()),
        };
        let r = f(&mut scratch);
        state.scratch = Some(scratch);
        r
    }

    /// Store the result. Only the first result sticks; returns whether
    /// this call stored it.
    pub fn set_result(&self, result: Result<Completion>) -> bool {
        let mut state = self.state.lock();
        if state.result.is_some() {
            return false;
        }
        state.result = Some(result);
        true
    }

    /// Conclude with `error` without any listener callbacks. Used when
    /// `submit` fails synchronously and the caller gets the error directly.
    pub fn retire(&self, error: Error) {
        self.set_result(Err(error));
        self.link.retire();
    }

    #[inline]
    pub fn has_result(&self) -> bool {
        self.state.lock().result.is_some()
    }

    /// Copy of the stored result without consuming it.
    pub fn peek_result(&self) -> Option<Result<Completion>> {
        self.state.lock().result.clone()
    }

    pub fn take_result(&self) -> Option<Result<Completion>> {
        self.state.lock().result.take()
    }

    /// Hand back the operation's buffer, truncated to the transferred
    /// length for input operations.
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let transferred = match &state.result {
            Some(Ok(c)) => c.transferred(),
            _ => None,
        };
        let input = self.kind.is_input();
        let buffer = state.arguments.buffer_mut().map(std::mem::take)?;
        Some(match (input, transferred) {
            (true, Some(n)) => {
                let mut buffer = buffer;
                buffer.truncate(n);
                buffer
            }
            _ => buffer,
        })
    }

    /// Result to return to the caller once concluded.
    pub fn outcome(&self) -> Result<Completion> {
        match self.peek_result() {
            Some(r) => r,
            None => Err(Error::AsyncOperationPending),
        }
    }
}

impl Deferred for Operation {
    fn defer_link(&self) -> &DeferLink {
        &self.link
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("object", &self.object)
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .field("status", &self.status())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_request(len: usize) -> Request {
        Request::new(
            ObjectKind::File,
            NativeHandle::new(3, Default::default()),
            Arguments::ReadAt { offset: 0, buffer: vec![0; len] },
        )
    }

    #[test]
    fn test_status_order_and_next() {
        assert!(OperationStatus::Constructed < OperationStatus::Submitted);
        assert!(OperationStatus::Completed < OperationStatus::Concluded);
        assert_eq!(OperationStatus::Submitted.next(), OperationStatus::Completed);
        assert_eq!(OperationStatus::Concluded.next(), OperationStatus::Concluded);
        assert_eq!(OperationStatus::from(u8::from(OperationStatus::Completed)), OperationStatus::Completed);
    }

    #[test]
    fn test_result_is_set_once() {
        let op = Operation::new(read_request(4), None);
        assert!(op.set_result(Ok(Completion::Transferred(4))));
        assert!(!op.set_result(Err(Error::AsyncOperationCancelled)));
        assert_eq!(op.peek_result(), Some(Ok(Completion::Transferred(4))));
        assert_eq!(op.take_result(), Some(Ok(Completion::Transferred(4))));
        assert_eq!(op.take_result(), None);
    }

    #[test]
    fn test_take_buffer_truncates_reads() {
        let op = Operation::new(read_request(8), None);
        op.with_arguments(|args| {
            if let Some(buf) = args.buffer_mut() {
                buf[..3].copy_from_slice(b"abc");
            }
        });
        op.set_result(Ok(Completion::Transferred(3)));
        assert_eq!(op.take_buffer().as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_scratch_address_is_stable() {
        #[derive(Default)]
        struct Scratch {
            value: u64,
        }
        let op = Operation::new(read_request(1), None);
        let first = op.with_scratch(|s: &mut Scratch| {
            s.value = 9;
            s as *mut Scratch as usize
        });
        let second = op.with_scratch(|s: &mut Scratch| {
            assert_eq!(s.value, 9);
            s as *mut Scratch as usize
        });
        assert_eq!(first, second);
    }

    #[test]
    fn test_cancel_request_is_recorded_once() {
        let op = Operation::new(read_request(1), None);
        assert!(op.request_cancel());
        assert!(!op.request_cancel());
        assert!(op.is_cancel_requested());
    }

    #[test]
    fn test_deadline_started_on_construct() {
        let req = read_request(1).deadline(Deadline::relative(std::time::Duration::from_secs(5)));
        let op = Operation::new(req, None);
        assert!(op.deadline().is_absolute());
    }

    #[test]
    fn test_input_kinds() {
        assert!(OperationKind::ReceiveFrom.is_input());
        assert!(OperationKind::Wait.is_input());
        assert!(!OperationKind::Connect.is_input());
        assert!(!OperationKind::WriteAt.is_input());
    }
}
