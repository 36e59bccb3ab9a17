//! `UringMultiplexer`: completion-based backend on io_uring.
//!
//! Each in-flight operation owns one strong reference smuggled through
//! the SQE's `user_data` (`Arc::into_raw`) and reclaimed when its CQE is
//! reaped. Deadlines become a linked timeout SQE carrying the remaining
//! time. Operations that would block (event and process waits, and
//! anything the kernel reports `EAGAIN` for) go through a `PollAdd` phase
//! and are retried synchronously once the handle is ready.
//!
//! Opcodes missing from the kernel's probe fall back to synchronous
//! descriptors, so every relation of the platform stays available.
//!
//! While anything is in flight a `PollAdd` on an eventfd stays armed, so
//! another thread can end a blocked `poll` through `interrupter()`.

use std::collections::HashSet;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use io_uring::{opcode, squeue, types, IoUring, Probe};

use allio_core::{
    cancel_operation, construct_operation, kdebug, kinfo, ktrace, kwarn, notify_operation,
    start_operation, Arguments, Backend, Completion, Connector, Deadline, Descriptor,
    DeferringEngine, Driven, Error, Interrupt, Listener, Multiplexer, MultiplexerId, NativeHandle, Notified,
    ObjectKind, Operation, OperationKind, OperationRef, PollStatistics, RelationTable, Request,
    Result, Started, Submission, TimePoint,
};

use crate::config::MultiplexerConfig;
use crate::sys::{self, SockAddr};

/// user_data of AsyncCancel SQEs.
const CANCEL_USER_DATA: u64 = u64::MAX - 1;
/// user_data of linked timeouts.
const LINK_TIMEOUT_USER_DATA: u64 = u64::MAX - 2;
/// user_data of the wake-up timeout used when `IORING_FEAT_EXT_ARG` is missing.
const WAKE_USER_DATA: u64 = u64::MAX - 3;
/// user_data of the `PollAdd` on the interrupt eventfd.
const INTERRUPT_USER_DATA: u64 = u64::MAX - 4;
/// Rounds of cancel-and-reap on drop before giving up on the kernel.
const SHUTDOWN_ROUNDS: usize = 16;

/// Pick `types::Fixed` for registered files, `types::Fd` otherwise.
macro_rules! with_target {
    ($op:expr, $fd:expr, |$t:ident| $build:expr) => {
        match $op.fixed_slot() {
            Some(slot) => {
                let $t = types::Fixed(slot);
                $build
            }
            None => {
                let $t = types::Fd($fd);
                $build
            }
        }
    };
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
enum Phase {
    /// The operation's own opcode is in flight.
    #[default]
    Direct,
    /// A `PollAdd` is in flight; the operation is retried when it fires.
    Poll,
}

/// Kernel-visible state of one operation. Lives in the operation's boxed
/// scratch area, so its address is stable while the SQE is in flight.
struct UringScratch {
    phase: Phase,
    address: SockAddr,
    iov: libc::iovec,
    msg: libc::msghdr,
    timeout: types::Timespec,
}

// Safety: the raw pointers in iovec/msghdr point into the same operation's
// arguments and scratch, which travel with it.
unsafe impl Send for UringScratch {}

impl Default for UringScratch {
    fn default() -> Self {
        Self {
            phase: Phase::Direct,
            address: SockAddr::empty(),
            iov: libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            },
            // Safety: all-zero msghdr is valid.
            msg: unsafe { mem::zeroed() },
            timeout: types::Timespec::new(),
        }
    }
}

/// Buffer and address of the operation's arguments.
struct Target {
    ptr: *mut u8,
    len: u32,
    offset: u64,
    address: Option<SocketAddr>,
}

impl Target {
    /// Buffers longer than one SQE can describe are rejected.
    fn of(op: &Operation) -> Result<Target> {
        op.with_arguments(|args| {
            let (ptr, len, offset, address) = match args {
                Arguments::ReadAt { offset, buffer } => (buffer.as_mut_ptr(), buffer.len(), *offset, None),
                Arguments::WriteAt { offset, buffer } => (buffer.as_mut_ptr(), buffer.len(), *offset, None),
                Arguments::Read { buffer } | Arguments::Write { buffer } => {
                    (buffer.as_mut_ptr(), buffer.len(), u64::MAX, None)
                }
                Arguments::SendTo { buffer, address } => (buffer.as_mut_ptr(), buffer.len(), 0, Some(*address)),
                Arguments::ReceiveFrom { buffer } => (buffer.as_mut_ptr(), buffer.len(), 0, None),
                Arguments::Connect { address } => (std::ptr::null_mut(), 0, 0, Some(*address)),
                Arguments::Accept | Arguments::Wait => (std::ptr::null_mut(), 0, 0, None),
            };
            Ok(Target {
                ptr,
                len: u32::try_from(len).map_err(|_| Error::InvalidArgument)?,
                offset,
                address,
            })
        })
    }
}

/// The opcode a relation needs from the kernel.
fn required_opcode(object: ObjectKind, operation: OperationKind) -> u8 {
    match (object, operation) {
        (_, OperationKind::ReadAt) | (ObjectKind::Pipe, OperationKind::Read) => opcode::Read::CODE,
        (_, OperationKind::WriteAt) | (ObjectKind::Pipe, OperationKind::Write) => opcode::Write::CODE,
        (_, OperationKind::Read) => opcode::Recv::CODE,
        (_, OperationKind::Write) => opcode::Send::CODE,
        (_, OperationKind::SendTo) => opcode::SendMsg::CODE,
        (_, OperationKind::ReceiveFrom) => opcode::RecvMsg::CODE,
        (_, OperationKind::Accept) => opcode::Accept::CODE,
        (_, OperationKind::Connect) => opcode::Connect::CODE,
        (_, OperationKind::Wait) => opcode::PollAdd::CODE,
    }
}

pub struct UringMultiplexer {
    engine: DeferringEngine,
    relations: RelationTable<UringMultiplexer>,
    ring: IoUring,
    ext_arg: bool,
    /// Addresses of operations whose reference is held by the kernel.
    in_flight: HashSet<usize>,
    /// Free registered-file slots.
    fixed_slots: Option<ArrayQueue<u32>>,
    wake_timeout: types::Timespec,
    /// Expiry (monotonic nanos) of the last wake-up timeout armed.
    wake_expiry: Option<u64>,
    wakeup: Arc<sys::Wakeup>,
    wakeup_armed: bool,
    reaped: Vec<(u64, i32)>,
}

impl Backend for UringMultiplexer {
    /// CQE result.
    type Status = i32;
}

// ── Descriptors ──

fn submit_sync(_: &mut UringMultiplexer, op: &OperationRef) -> Result<Submission> {
    sys::validate(op)?;
    Ok(Submission::Ready(sys::execute(op)))
}

fn submit_async(mux: &mut UringMultiplexer, op: &OperationRef) -> Result<Submission> {
    sys::validate(op)?;
    let deadline = op.deadline();
    if deadline.is_instant() || deadline.has_expired() {
        return Ok(Submission::Ready(match sys::try_operation(op) {
            Err(e) if e.is_would_block() => Err(Error::AsyncOperationTimedOut),
            r => r,
        }));
    }
    let phase = if op.kind() == OperationKind::Wait { Phase::Poll } else { Phase::Direct };
    mux.arm(op, phase)?;
    Ok(Submission::Pending)
}

fn notify_async(mux: &mut UringMultiplexer, op: &OperationRef, res: i32) -> Notified {
    let phase = op.with_scratch(|s: &mut UringScratch| s.phase);
    ktrace!("io_uring: {:?} {:?} res={}", op.kind(), phase, res);
    if res < 0 {
        return match -res {
            libc::ECANCELED | libc::EINTR | libc::ETIME => Notified::Ready(Err(interrupted(op))),
            libc::EAGAIN | libc::EINPROGRESS | libc::EALREADY => mux.rearm(op),
            code => Notified::Ready(Err(Error::from_errno(code))),
        };
    }
    match phase {
        Phase::Direct => Notified::Ready(finish(op, res)),
        Phase::Poll => match sys::try_operation(op) {
            Err(e) if e.is_would_block() => mux.rearm(op),
            r => Notified::Ready(r),
        },
    }
}

fn cancel_async(mux: &mut UringMultiplexer, op: &OperationRef) {
    let sqe = opcode::AsyncCancel::new(Arc::as_ptr(op) as u64)
        .build()
        .user_data(CANCEL_USER_DATA);
    if let Err(e) = mux.push(&[sqe]) {
        kwarn!("io_uring: cancel of {:?} not queued: {}", op.kind(), e);
    }
}

/// Outcome of an operation the kernel stopped early.
fn interrupted(op: &Operation) -> Error {
    if op.is_cancel_requested() {
        Error::AsyncOperationCancelled
    } else {
        Error::AsyncOperationTimedOut
    }
}

/// Translate a successful CQE of the operation's own opcode.
fn finish(op: &Operation, res: i32) -> Result<Completion> {
    match op.kind() {
        OperationKind::Accept => {
            let address = op.with_scratch(|s: &mut UringScratch| s.address.to_socket_addr());
            match address {
                Ok(address) => Ok(Completion::Accepted { handle: res, address }),
                Err(e) => {
                    sys::close(res);
                    Err(e)
                }
            }
        }
        OperationKind::Connect => Ok(Completion::Connected),
        OperationKind::ReceiveFrom => {
            let address = op.with_scratch(|s: &mut UringScratch| {
                // Safety: the kernel wrote msg_namelen; len_mut points into the same scratch.
                unsafe { *s.address.len_mut() = s.msg.msg_namelen };
                s.address.to_socket_addr()
            })?;
            Ok(Completion::Received {
                count: res as usize,
                address,
            })
        }
        OperationKind::Wait => Ok(Completion::Signaled),
        _ => Ok(Completion::Transferred(res as usize)),
    }
}

impl UringMultiplexer {
    pub fn new(config: &MultiplexerConfig) -> Result<Self> {
        config.validate().map_err(|_| Error::InvalidArgument)?;
        let ring = IoUring::builder()
            .setup_cqsize(config.effective_cq_entries())
            .build(config.sq_entries)
            .map_err(Error::from)?;

        let mut probe = Probe::new();
        if let Err(e) = ring.submitter().register_probe(&mut probe) {
            kdebug!("io_uring: probe unavailable: {}", e);
        }
        let linkable = probe.is_supported(opcode::LinkTimeout::CODE);

        let mut relations = RelationTable::new();
        let mut fallbacks = 0;
        for &(object, operation) in sys::RELATIONS {
            let descriptor = if linkable && probe.is_supported(required_opcode(object, operation)) {
                Descriptor::new(object, operation, submit_async, notify_async, cancel_async)
            } else {
                fallbacks += 1;
                Descriptor::synchronous(object, operation, submit_sync)
            };
            relations.register(descriptor);
        }

        let fixed_slots = if config.fixed_files > 0 {
            ring.submitter()
                .register_files_sparse(config.fixed_files)
                .map_err(Error::from)?;
            let slots = ArrayQueue::new(config.fixed_files as usize);
            for slot in 0..config.fixed_files {
                let _ = slots.push(slot);
            }
            Some(slots)
        } else {
            None
        };

        let ext_arg = ring.params().is_feature_ext_arg();
        let engine = DeferringEngine::new();
        kinfo!(
            "io_uring: fd={} sq={} cq={} ext_arg={} fixed={} sync_fallbacks={} id={}",
            ring.as_raw_fd(),
            config.sq_entries,
            config.effective_cq_entries(),
            ext_arg,
            config.fixed_files,
            fallbacks,
            engine.id()
        );

        Ok(Self {
            engine,
            relations,
            ring,
            ext_arg,
            in_flight: HashSet::new(),
            fixed_slots,
            wake_timeout: types::Timespec::new(),
            wake_expiry: None,
            wakeup: Arc::new(sys::Wakeup::new()?),
            wakeup_armed: false,
            reaped: Vec::new(),
        })
    }

    /// Push SQEs as one group, flushing the queue once if it is full.
    fn push(&mut self, entries: &[squeue::Entry]) -> Result<()> {
        // Safety: every pointer in the entries outlives the submission
        // (operation scratch and arguments, or self).
        if unsafe { self.ring.submission().push_multiple(entries) }.is_ok() {
            return Ok(());
        }
        self.ring.submit().map_err(Error::from)?;
        unsafe { self.ring.submission().push_multiple(entries) }
            .map_err(|_| Error::TooManyConcurrentAsyncOperations)
    }

    /// Queue `op` in `phase`, with a linked timeout if it has a deadline.
    fn arm(&mut self, op: &OperationRef, phase: Phase) -> Result<()> {
        let remaining = op.deadline().remaining();
        if remaining == Some(Duration::ZERO) {
            return Err(Error::AsyncOperationTimedOut);
        }

        let fd = op.handle().raw;
        let target = Target::of(op)?;
        let kind = op.kind();
        let (address, address_len, msg, timeout) = op.with_scratch(|s: &mut UringScratch| {
            s.phase = phase;
            s.address = match target.address {
                Some(address) if kind != OperationKind::ReceiveFrom => SockAddr::from_socket_addr(&address),
                _ => SockAddr::empty(),
            };
            s.iov = libc::iovec {
                iov_base: target.ptr.cast(),
                iov_len: target.len as usize,
            };
            // Safety: all-zero msghdr is valid.
            s.msg = unsafe { mem::zeroed() };
            s.msg.msg_name = s.address.as_mut_ptr().cast();
            s.msg.msg_namelen = s.address.len();
            s.msg.msg_iov = &mut s.iov;
            s.msg.msg_iovlen = 1;
            if let Some(d) = remaining {
                s.timeout = types::Timespec::from(d);
            }
            (
                s.address.as_mut_ptr(),
                s.address.len_mut(),
                &mut s.msg as *mut libc::msghdr,
                &s.timeout as *const types::Timespec,
            )
        });

        let sqe = match phase {
            Phase::Poll => with_target!(op, fd, |t| {
                opcode::PollAdd::new(t, sys::interest(op) as u32).build()
            }),
            Phase::Direct => match (op.object(), kind) {
                (_, OperationKind::ReadAt) | (ObjectKind::Pipe, OperationKind::Read) => with_target!(op, fd, |t| {
                    opcode::Read::new(t, target.ptr, target.len).offset(target.offset).build()
                }),
                (_, OperationKind::WriteAt) | (ObjectKind::Pipe, OperationKind::Write) => with_target!(op, fd, |t| {
                    opcode::Write::new(t, target.ptr, target.len).offset(target.offset).build()
                }),
                (_, OperationKind::Read) => with_target!(op, fd, |t| {
                    opcode::Recv::new(t, target.ptr, target.len).build()
                }),
                (_, OperationKind::Write) => with_target!(op, fd, |t| {
                    opcode::Send::new(t, target.ptr, target.len).flags(libc::MSG_NOSIGNAL).build()
                }),
                (_, OperationKind::SendTo) => with_target!(op, fd, |t| {
                    opcode::SendMsg::new(t, msg).flags(libc::MSG_NOSIGNAL as u32).build()
                }),
                (_, OperationKind::ReceiveFrom) => with_target!(op, fd, |t| {
                    opcode::RecvMsg::new(t, msg).build()
                }),
                (_, OperationKind::Accept) => with_target!(op, fd, |t| {
                    opcode::Accept::new(t, address, address_len)
                        .flags(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
                        .build()
                }),
                (_, OperationKind::Connect) => with_target!(op, fd, |t| {
                    // Safety: address_len points into the scratch written above.
                    opcode::Connect::new(t, address, unsafe { *address_len }).build()
                }),
                (_, OperationKind::Wait) => with_target!(op, fd, |t| {
                    opcode::PollAdd::new(t, sys::interest(op) as u32).build()
                }),
            },
        };

        let user_data = Arc::into_raw(op.clone()) as u64;
        let sqe = sqe.user_data(user_data);
        let pushed = if remaining.is_some() {
            let link = opcode::LinkTimeout::new(timeout)
                .build()
                .user_data(LINK_TIMEOUT_USER_DATA);
            self.push(&[sqe.flags(squeue::Flags::IO_LINK), link])
        } else {
            self.push(&[sqe])
        };
        match pushed {
            Ok(()) => {
                self.in_flight.insert(user_data as usize);
                Ok(())
            }
            Err(e) => {
                // Safety: the SQE never reached the kernel; take the reference back.
                drop(unsafe { Arc::from_raw(user_data as *const Operation) });
                Err(e)
            }
        }
    }

    /// Wait for readiness again, unless a cancel is pending.
    fn rearm(&mut self, op: &OperationRef) -> Notified {
        if op.is_cancel_requested() {
            return Notified::Ready(Err(Error::AsyncOperationCancelled));
        }
        match self.arm(op, Phase::Poll) {
            Ok(()) => Notified::Resubmitted,
            Err(e) => Notified::Ready(Err(e)),
        }
    }

    /// Submit queued SQEs and wait until a CQE arrives or `deadline` passes.
    fn enter(&mut self, deadline: Deadline) -> Result<()> {
        let result = match deadline.remaining() {
            Some(Duration::ZERO) => self.ring.submit(),
            None => self.ring.submit_and_wait(1),
            Some(d) if self.ext_arg => {
                let ts = types::Timespec::from(d);
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            Some(d) => {
                self.arm_wake_timeout(d)?;
                self.ring.submit_and_wait(1)
            }
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) => match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => Ok(()),
                _ => Err(Error::from(e)),
            },
        }
    }

    /// Make sure a wake-up timeout fires within `d`. One armed earlier that
    /// is still pending and fires no later is reused; otherwise it is
    /// removed and replaced, so at most one is ever armed.
    fn arm_wake_timeout(&mut self, d: Duration) -> Result<()> {
        let now = TimePoint::now().as_nanos();
        let target = now.saturating_add(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        match self.wake_expiry {
            Some(at) if now < at && at <= target => return Ok(()),
            Some(_) => {
                let remove = opcode::TimeoutRemove::new(WAKE_USER_DATA)
                    .build()
                    .user_data(CANCEL_USER_DATA);
                self.push(&[remove])?;
            }
            None => {}
        }
        self.wake_timeout = types::Timespec::from(d);
        let sqe = opcode::Timeout::new(&self.wake_timeout)
            .build()
            .user_data(WAKE_USER_DATA);
        self.push(&[sqe])?;
        self.wake_expiry = Some(target);
        Ok(())
    }

    /// Keep a `PollAdd` on the interrupt eventfd in flight.
    fn arm_wakeup(&mut self) {
        if self.wakeup_armed {
            return;
        }
        let sqe = opcode::PollAdd::new(types::Fd(self.wakeup.fd()), libc::POLLIN as u32)
            .build()
            .user_data(INTERRUPT_USER_DATA);
        match self.push(&[sqe]) {
            Ok(()) => self.wakeup_armed = true,
            Err(e) => kdebug!("io_uring: interrupt poll not queued: {}", e),
        }
    }

    /// Hand every available CQE to its operation's descriptor.
    fn reap(&mut self) {
        let mut reaped = mem::take(&mut self.reaped);
        reaped.extend(self.ring.completion().map(|cqe| (cqe.user_data(), cqe.result())));
        for &(user_data, res) in &reaped {
            match user_data {
                CANCEL_USER_DATA | LINK_TIMEOUT_USER_DATA | WAKE_USER_DATA => continue,
                INTERRUPT_USER_DATA => {
                    self.wakeup_armed = false;
                    self.wakeup.drain();
                    continue;
                }
                _ => {}
            }
            if !self.in_flight.remove(&(user_data as usize)) {
                kwarn!("io_uring: unknown user_data {:#x}", user_data);
                continue;
            }
            // Safety: produced by Arc::into_raw in `arm`, reclaimed once.
            let op = unsafe { Arc::from_raw(user_data as *const Operation) };
            notify_operation(self, &op, res);
        }
        reaped.clear();
        self.reaped = reaped;
    }

    /// Another reference to an operation the kernel holds.
    fn in_flight_ref(addr: usize) -> OperationRef {
        let ptr = addr as *const Operation;
        // Safety: `addr` came from Arc::into_raw in `arm` and that reference
        // is still owned by the kernel, so the count is at least one.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Cancel everything in flight and reap it, so every listener hears a
    /// conclusion. Operations the kernel never gives back are concluded as
    /// cancelled; their storage is leaked, since the kernel may still write
    /// to it.
    fn shutdown(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let pending: Vec<OperationRef> = self.in_flight.iter().map(|&addr| Self::in_flight_ref(addr)).collect();
        kdebug!("io_uring: cancelling {} operations at drop", pending.len());
        for op in &pending {
            if let Err(e) = self.engine.cancel_action(op) {
                kdebug!("io_uring: {:?} not cancellable: {}", op.kind(), e);
                continue;
            }
            let sqe = opcode::AsyncCancel::new(Arc::as_ptr(op) as u64)
                .build()
                .user_data(CANCEL_USER_DATA);
            // A full queue with a full completion ring: reap, then retry.
            if self.push(&[sqe.clone()]).is_err() {
                self.reap();
                if let Err(e) = self.push(&[sqe]) {
                    kwarn!("io_uring: cancel of {:?} not queued at drop: {}", op.kind(), e);
                }
            }
        }
        drop(pending);

        for _ in 0..SHUTDOWN_ROUNDS {
            if self.in_flight.is_empty() {
                break;
            }
            if let Err(e) = self.enter(Deadline::relative(Duration::from_millis(100))) {
                kwarn!("io_uring: drain at drop failed: {}", e);
                break;
            }
            self.reap();
        }

        if !self.in_flight.is_empty() {
            kwarn!("io_uring: {} operations still in flight at drop", self.in_flight.len());
            for addr in mem::take(&mut self.in_flight) {
                let op = Self::in_flight_ref(addr);
                self.engine.complete(&op, Err(Error::AsyncOperationCancelled));
            }
        }
        self.engine.flush();
    }
}

impl Drop for UringMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Driven for UringMultiplexer {
    fn engine(&self) -> &DeferringEngine {
        &self.engine
    }

    fn engine_mut(&mut self) -> &mut DeferringEngine {
        &mut self.engine
    }

    fn relations(&self) -> &RelationTable<Self> {
        &self.relations
    }
}

impl Multiplexer for UringMultiplexer {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn id(&self) -> MultiplexerId {
        self.engine.id()
    }

    fn supports(&self, object: ObjectKind, operation: OperationKind) -> bool {
        self.relations.supports(object, operation)
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(self.wakeup.clone())
    }

    /// Registers the descriptor in a fixed-file slot when the table is
    /// enabled and has room.
    fn attach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        let fd: RawFd = handle.check_multiplexable()?;
        if connector.is_attached() {
            return Err(Error::InvalidArgument);
        }
        let slot = match self.fixed_slots.as_ref().and_then(|slots| slots.pop()) {
            Some(slot) => match self.ring.submitter().register_files_update(slot, &[fd]) {
                Ok(_) => Some(slot),
                Err(e) => {
                    kdebug!("io_uring: fixed slot {} for fd {} failed: {}", slot, fd, e);
                    self.release_slot(slot);
                    None
                }
            },
            None => None,
        };
        connector.bind(self.engine.id(), slot)
    }

    fn detach(&mut self, _handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        if let Some(slot) = connector.unbind(self.engine.id())? {
            if let Err(e) = self.ring.submitter().register_files_update(slot, &[-1]) {
                kwarn!("io_uring: clearing fixed slot {} failed: {}", slot, e);
            }
            self.release_slot(slot);
        }
        Ok(())
    }

    fn construct(
        &mut self,
        request: Request,
        listener: Option<Arc<dyn Listener>>,
    ) -> Result<OperationRef> {
        construct_operation(self, request, listener)
    }

    fn start(&mut self, operation: &OperationRef) -> Result<Started> {
        start_operation(self, operation)
    }

    fn cancel(&mut self, operation: &OperationRef) -> Result<()> {
        cancel_operation(self, operation)
    }

    fn poll(&mut self, deadline: Deadline) -> Result<PollStatistics> {
        if self.engine.outstanding() == 0 {
            return Ok(self.engine.flush());
        }
        let wait = if self.engine.has_deferred() || self.in_flight.is_empty() {
            Deadline::instant()
        } else {
            self.arm_wakeup();
            deadline.start()
        };
        self.enter(wait)?;
        self.reap();
        Ok(self.engine.flush())
    }
}

impl UringMultiplexer {
    fn release_slot(&self, slot: u32) {
        if let Some(slots) = &self.fixed_slots {
            let _ = slots.push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allio_core::HandleFlags;
    use std::os::fd::IntoRawFd;

    fn uring(config: MultiplexerConfig) -> Option<UringMultiplexer> {
        match UringMultiplexer::new(&config) {
            Ok(mux) => Some(mux),
            Err(e) => {
                eprintln!("io_uring unavailable, skipping: {}", e);
                None
            }
        }
    }

    fn handle(fd: RawFd) -> NativeHandle {
        NativeHandle::new(fd, HandleFlags::MULTIPLEXABLE)
    }

    fn run_until_concluded(mux: &mut UringMultiplexer, ops: &[&OperationRef]) {
        for _ in 0..1000 {
            if ops.iter().all(|op| op.is_concluded()) {
                return;
            }
            mux.poll(Deadline::relative(Duration::from_millis(100))).unwrap();
        }
        panic!("operations did not conclude");
    }

    #[test]
    fn test_required_opcodes() {
        assert_eq!(required_opcode(ObjectKind::File, OperationKind::ReadAt), opcode::Read::CODE);
        assert_eq!(required_opcode(ObjectKind::StreamSocket, OperationKind::Read), opcode::Recv::CODE);
        assert_eq!(required_opcode(ObjectKind::Process, OperationKind::Wait), opcode::PollAdd::CODE);
    }

    #[test]
    fn test_file_write_then_read_at_offset_zero() {
        let Some(mut mux) = uring(MultiplexerConfig::default()) else { return };
        let path = std::env::temp_dir().join(format!("allio-uring-{}", std::process::id()));
        let fd = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap()
            .into_raw_fd();

        let write = Request::new(ObjectKind::File, handle(fd), Arguments::WriteAt { offset: 0, buffer: b"allio".to_vec() });
        assert_eq!(mux.block(write), Ok(Completion::Transferred(5)));
        let read = Request::new(ObjectKind::File, handle(fd), Arguments::ReadAt { offset: 0, buffer: vec![0; 16] });
        let op = mux.block_operation(read).unwrap();
        assert_eq!(op.take_buffer().as_deref(), Some(&b"allio"[..]));

        sys::close(fd);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_linked_timeout_expires() {
        let Some(mut mux) = uring(MultiplexerConfig::default()) else { return };
        let (r, w) = sys::pipe().unwrap();
        let read = Request::new(ObjectKind::Pipe, handle(r), Arguments::Read { buffer: vec![0; 4] })
            .deadline(Deadline::relative(Duration::from_millis(20)));
        assert_eq!(mux.block(read), Err(Error::AsyncOperationTimedOut));
        assert!(mux.in_flight.is_empty());
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn test_cancel_in_flight() {
        let Some(mut mux) = uring(MultiplexerConfig::default()) else { return };
        let (r, w) = sys::pipe().unwrap();
        let read = Request::new(ObjectKind::Pipe, handle(r), Arguments::Read { buffer: vec![0; 4] });
        let (op, started) = mux.construct_and_start(read, None).unwrap();
        assert_eq!(started, Started::Pending);
        mux.poll(Deadline::instant()).unwrap();
        mux.cancel(&op).unwrap();
        run_until_concluded(&mut mux, &[&op]);
        assert_eq!(op.outcome(), Err(Error::AsyncOperationCancelled));
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn test_event_wait_through_poll_phase() {
        let Some(mut mux) = uring(MultiplexerConfig::default()) else { return };
        let ev = sys::event_create().unwrap();
        let waits: Vec<OperationRef> = (0..3)
            .map(|_| {
                let req = Request::new(
                    ObjectKind::Event,
                    NativeHandle::new(ev, HandleFlags::MULTIPLEXABLE | HandleFlags::EVENT_AUTO_RESET),
                    Arguments::Wait,
                );
                mux.construct_and_start(req, None).unwrap().0
            })
            .collect();
        mux.poll(Deadline::instant()).unwrap();
        sys::event_signal(ev).unwrap();
        for _ in 0..5 {
            mux.poll(Deadline::relative(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(waits.iter().filter(|w| w.is_concluded()).count(), 1);
        for w in &waits {
            mux.cancel(w).unwrap();
        }
        let refs: Vec<&OperationRef> = waits.iter().collect();
        run_until_concluded(&mut mux, &refs);
        assert_eq!(waits.iter().filter(|w| w.outcome() == Ok(Completion::Signaled)).count(), 1);
        sys::close(ev);
    }

    #[test]
    fn test_fixed_file_slots() {
        let Some(mut mux) = uring(MultiplexerConfig::default().fixed_files(1)) else { return };
        let (r, w) = sys::pipe().unwrap();
        let mut rc = Connector::new();
        let mut wc = Connector::new();
        mux.attach(&handle(r), &mut rc).unwrap();
        mux.attach(&handle(w), &mut wc).unwrap();
        assert_eq!(rc.fixed_slot(), Some(0));
        assert_eq!(wc.fixed_slot(), None);

        let write = Request::new(ObjectKind::Pipe, handle(w), Arguments::Write { buffer: b"ok".to_vec() }).connector(&wc);
        mux.block(write).unwrap();
        let read = Request::new(ObjectKind::Pipe, handle(r), Arguments::Read { buffer: vec![0; 2] }).connector(&rc);
        assert_eq!(mux.block(read), Ok(Completion::Transferred(2)));

        mux.detach(&handle(r), &mut rc).unwrap();
        mux.detach(&handle(w), &mut wc).unwrap();
        let mut again = Connector::new();
        mux.attach(&handle(w), &mut again).unwrap();
        assert_eq!(again.fixed_slot(), Some(0));
        sys::close(r);
        sys::close(w);
    }

    #[derive(Default)]
    struct Concluded(std::sync::atomic::AtomicUsize);

    impl Listener for Concluded {
        fn concluded(&self, _: &Operation) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_concludes_more_operations_than_sq_entries() {
        let Some(mut mux) = uring(MultiplexerConfig::default().sq_entries(4)) else { return };
        let (r, w) = sys::pipe().unwrap();
        let concluded = Arc::new(Concluded::default());
        let reads: Vec<OperationRef> = (0..12)
            .map(|_| {
                let read = Request::new(ObjectKind::Pipe, handle(r), Arguments::Read { buffer: vec![0; 1] });
                mux.construct_and_start(read, Some(concluded.clone())).unwrap().0
            })
            .collect();
        mux.poll(Deadline::instant()).unwrap();
        assert_eq!(mux.in_flight.len(), 12);

        drop(mux);
        assert_eq!(concluded.0.load(std::sync::atomic::Ordering::SeqCst), 12);
        for read in &reads {
            assert!(read.is_concluded());
            assert_eq!(read.outcome(), Err(Error::AsyncOperationCancelled));
        }
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn test_wake_timeout_is_reused() {
        let Some(mut mux) = uring(MultiplexerConfig::default()) else { return };
        mux.arm_wake_timeout(Duration::from_millis(50)).unwrap();
        let first = mux.wake_expiry.unwrap();
        mux.arm_wake_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(mux.wake_expiry, Some(first));
        mux.arm_wake_timeout(Duration::from_millis(1)).unwrap();
        assert!(mux.wake_expiry.unwrap() < first);
        mux.ring.submit().unwrap();
    }

    #[test]
    fn test_interrupt_ends_wait_from_another_thread() {
        let Some(mut mux) = uring(MultiplexerConfig::default()) else { return };
        let (r, w) = sys::pipe().unwrap();
        let read = Request::new(ObjectKind::Pipe, handle(r), Arguments::Read { buffer: vec![0; 1] });
        let (op, _) = mux.construct_and_start(read, None).unwrap();
        mux.poll(Deadline::instant()).unwrap();

        let interrupter = mux.interrupter().unwrap();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });
        mux.poll(Deadline::never()).unwrap();
        t.join().unwrap();
        assert!(!op.is_concluded());

        mux.cancel(&op).unwrap();
        run_until_concluded(&mut mux, &[&op]);
        assert_eq!(op.outcome(), Err(Error::AsyncOperationCancelled));
        sys::close(r);
        sys::close(w);
    }

    #[test]
    fn test_drop_reclaims_in_flight() {
        let Some(mut mux) = uring(MultiplexerConfig::default()) else { return };
        let (r, w) = sys::pipe().unwrap();
        let read = Request::new(ObjectKind::Pipe, handle(r), Arguments::Read { buffer: vec![0; 1] });
        let (op, _) = mux.construct_and_start(read, None).unwrap();
        mux.poll(Deadline::instant()).unwrap();
        let before = Arc::strong_count(&op);
        drop(mux);
        assert_eq!(Arc::strong_count(&op), before - 1);
        sys::close(r);
        sys::close(w);
    }
}
