//! `IocpMultiplexer`: completion-port backend for Windows.
//!
//! Overlapped transfers on files, pipes and sockets complete straight into
//! the port; the `OVERLAPPED` lives at the head of the operation's scratch
//! area and its address identifies the packet. Event and process waits are
//! registered with the thread-pool wait API, whose callback posts a packet
//! carrying the same address. Deadlines are kept in a timer map and
//! enforced with `CancelIoEx` or by unregistering the wait. Another thread
//! cuts a wait short by posting a packet with `INTERRUPT_KEY`.
//!
//! Handles are associated with the port on their first overlapped
//! transfer. Files opened without `FILE_FLAG_OVERLAPPED` (no
//! `FILE_OVERLAPPED` flag on the handle) run synchronously.

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_INVALID_PARAMETER, HANDLE, INVALID_HANDLE_VALUE,
    WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{
    RegisterWaitForSingleObject, UnregisterWaitEx, INFINITE, WT_EXECUTEONLYONCE,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED, OVERLAPPED_ENTRY,
};

use allio_core::{
    cancel_operation, construct_operation, kdebug, kinfo, ktrace, kwarn, notify_operation,
    start_operation, Backend, Completion, Connector, Deadline, Descriptor, DeferringEngine,
    Driven, Error, Interrupt, Listener, Multiplexer, MultiplexerId, NativeHandle, Notified,
    ObjectKind, Operation, OperationKind, OperationRef, PollStatistics, RawHandle,
    RelationTable, Request, Result, Started, Submission, TimePoint,
};

use crate::config::MultiplexerConfig;
use crate::sys;

/// Completion key of associated handles.
const TRANSFER_KEY: usize = 1;
/// Completion key of packets posted by wait callbacks.
const WAIT_KEY: usize = 2;
/// Completion key of interrupt packets, which carry no OVERLAPPED.
const INTERRUPT_KEY: usize = 3;

/// Drain rounds at drop before in-flight operations are given up.
const SHUTDOWN_ROUNDS: usize = 16;

type TimerKey = (u64, u64);

/// Per-operation kernel state. `io` must stay first.
#[repr(C)]
struct IocpScratch {
    io: sys::Overlapped,
    /// Registered wait handle, 0 when none.
    wait: usize,
    /// `Box<WaitContext>` owned by the registration, 0 when none.
    context: usize,
    timer: Option<TimerKey>,
}

// Safety: the handles and pointers are only touched from the driver thread
// and, for `context`, the wait callback, which synchronizes through `fired`.
unsafe impl Send for IocpScratch {}

impl Default for IocpScratch {
    fn default() -> Self {
        Self {
            io: sys::Overlapped::default(),
            wait: 0,
            context: 0,
            timer: None,
        }
    }
}

/// Shared with the thread-pool wait callback.
struct WaitContext {
    port: usize,
    overlapped: usize,
    fired: AtomicBool,
}

unsafe extern "system" fn wait_callback(context: *mut c_void, _timed_out: u8) {
    // Safety: the context outlives the registration (freed only after
    // UnregisterWaitEx has drained callbacks).
    let ctx = unsafe { &*(context as *const WaitContext) };
    if !ctx.fired.swap(true, Ordering::AcqRel) {
        unsafe {
            PostQueuedCompletionStatus(
                ctx.port as HANDLE,
                0,
                WAIT_KEY,
                ctx.overlapped as *mut OVERLAPPED,
            );
        }
    }
}

/// The completion port. Shared with interrupters, so it is closed only
/// when the last of them is gone.
struct Port(HANDLE);

// Safety: a port handle may be used from any thread.
unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Interrupt for Port {
    fn interrupt(&self) {
        // Safety: the port is open while self exists.
        if unsafe { PostQueuedCompletionStatus(self.0, 0, INTERRUPT_KEY, ptr::null_mut()) } == 0 {
            kdebug!("iocp: interrupt: {}", sys::last_error());
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        // Safety: the port is owned.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

pub struct IocpMultiplexer {
    engine: DeferringEngine,
    relations: RelationTable<IocpMultiplexer>,
    port: Arc<Port>,
    entries: Vec<OVERLAPPED_ENTRY>,
    /// Keyed by the address of the operation's OVERLAPPED.
    in_flight: HashMap<usize, OperationRef>,
    timers: BTreeMap<TimerKey, OperationRef>,
    timer_seq: u64,
}

impl Backend for IocpMultiplexer {
    /// Bytes transferred.
    type Status = u32;
}

fn interrupted(op: &Operation) -> Error {
    if op.is_cancel_requested() {
        Error::AsyncOperationCancelled
    } else {
        Error::AsyncOperationTimedOut
    }
}

fn io_of(op: &Operation) -> *mut sys::Overlapped {
    op.with_scratch(|s: &mut IocpScratch| &mut s.io as *mut sys::Overlapped)
}

fn overlapped_of(op: &Operation) -> *mut OVERLAPPED {
    io_of(op) as *mut OVERLAPPED
}

// ── Transfer descriptors ──

fn submit_transfer(mux: &mut IocpMultiplexer, op: &OperationRef) -> Result<Submission> {
    sys::validate(op)?;
    if !sys::is_overlapped(op) || op.deadline().is_instant() {
        return Ok(Submission::Ready(sys::execute(op)));
    }
    mux.associate(op.handle().raw)?;

    let io = op.with_scratch(|s: &mut IocpScratch| {
        s.io = sys::Overlapped::default();
        &mut s.io as *mut sys::Overlapped
    });
    // Safety: the scratch and buffer belong to `op`, which stays in
    // `in_flight` until the packet is dequeued.
    if let Some(done) = unsafe { sys::start(op, io)? } {
        return Ok(Submission::Ready(Ok(done)));
    }
    mux.track(op, io as *mut OVERLAPPED);
    Ok(Submission::Pending)
}

fn notify_transfer(_: &mut IocpMultiplexer, op: &OperationRef, bytes: u32) -> Notified {
    ktrace!("iocp: {:?} packet bytes={}", op.kind(), bytes);
    // Safety: the packet has been dequeued, so the kernel is done with the
    // scratch; it is not borrowed elsewhere while the driver runs.
    let io = unsafe { &mut *io_of(op) };
    Notified::Ready(match sys::finish(op, io) {
        Err(Error::AsyncOperationCancelled) => Err(interrupted(op)),
        r => r,
    })
}

fn cancel_transfer(_: &mut IocpMultiplexer, op: &OperationRef) {
    if let Err(e) = sys::cancel(op.handle().raw, overlapped_of(op)) {
        kdebug!("iocp: CancelIoEx: {}", e);
    }
}

// ── Wait descriptors ──

fn submit_wait(mux: &mut IocpMultiplexer, op: &OperationRef) -> Result<Submission> {
    sys::validate(op)?;
    if op.deadline().is_instant() || op.deadline().has_expired() {
        return Ok(Submission::Ready(sys::execute(op)));
    }
    let ov = overlapped_of(op);
    let context = Box::into_raw(Box::new(WaitContext {
        port: mux.port.0 as usize,
        overlapped: ov as usize,
        fired: AtomicBool::new(false),
    }));
    let mut wait: HANDLE = ptr::null_mut();
    // Safety: context stays alive until the wait is unregistered.
    let ok = unsafe {
        RegisterWaitForSingleObject(
            &mut wait,
            sys::as_handle(op.handle().raw),
            Some(wait_callback),
            context as *const c_void,
            INFINITE,
            WT_EXECUTEONLYONCE,
        )
    };
    if ok == 0 {
        let e = sys::last_error();
        drop(unsafe { Box::from_raw(context) });
        return Err(e);
    }
    op.with_scratch(|s: &mut IocpScratch| {
        s.wait = wait as usize;
        s.context = context as usize;
    });
    mux.track(op, ov);
    Ok(Submission::Pending)
}

fn notify_wait(_: &mut IocpMultiplexer, op: &OperationRef, _: u32) -> Notified {
    release_wait(op);
    let result = match op.object() {
        ObjectKind::Process => sys::exit_code(op.handle().raw).map(Completion::Exited),
        _ => Ok(Completion::Signaled),
    };
    Notified::Ready(result)
}

fn cancel_wait(mux: &mut IocpMultiplexer, op: &OperationRef) {
    mux.abandon_wait(op, Error::AsyncOperationCancelled);
}

/// Unregister the wait and free its context. Returns whether the callback
/// had already fired (a packet is then queued or was consumed).
fn release_wait(op: &Operation) -> bool {
    let (wait, context) = op.with_scratch(|s: &mut IocpScratch| {
        (mem::take(&mut s.wait), mem::take(&mut s.context))
    });
    if wait != 0 {
        // Safety: INVALID_HANDLE_VALUE makes this wait for running callbacks.
        unsafe {
            UnregisterWaitEx(wait as HANDLE, INVALID_HANDLE_VALUE);
        }
    }
    if context == 0 {
        return true;
    }
    // Safety: allocated in `submit_wait`; no callback can run any more.
    let ctx = unsafe { Box::from_raw(context as *mut WaitContext) };
    ctx.fired.swap(true, Ordering::AcqRel)
}

impl IocpMultiplexer {
    pub fn new(config: &MultiplexerConfig) -> Result<Self> {
        // Safety: creates a fresh port.
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) };
        if port.is_null() {
            return Err(sys::last_error());
        }

        let port = Arc::new(Port(port));

        let mut relations = RelationTable::new();
        for &(object, operation) in sys::RELATIONS {
            let descriptor = match operation {
                OperationKind::Wait => Descriptor::new(object, operation, submit_wait, notify_wait, cancel_wait),
                _ => Descriptor::new(object, operation, submit_transfer, notify_transfer, cancel_transfer),
            };
            relations.register(descriptor);
        }

        let capacity = config.event_capacity.max(1);
        let engine = DeferringEngine::new();
        kinfo!("iocp: port={:?} entries={} id={}", port.0, capacity, engine.id());
        Ok(Self {
            engine,
            relations,
            port,
            // Safety: all-zero OVERLAPPED_ENTRY is valid.
            entries: vec![unsafe { mem::zeroed() }; capacity],
            in_flight: HashMap::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
        })
    }

    /// Handle values are recycled after close, so nothing is cached; the
    /// kernel refuses a second association with `ERROR_INVALID_PARAMETER`.
    fn associate(&mut self, raw: RawHandle) -> Result<()> {
        // Safety: raw is an open overlapped handle.
        let ret = unsafe { CreateIoCompletionPort(sys::as_handle(raw), self.port.0, TRANSFER_KEY, 0) };
        if ret.is_null() {
            return match unsafe { GetLastError() } {
                ERROR_INVALID_PARAMETER => Ok(()),
                code => Err(Error::from_errno(code as i32)),
            };
        }
        Ok(())
    }

    fn track(&mut self, op: &OperationRef, ov: *mut OVERLAPPED) {
        self.in_flight.insert(ov as usize, op.clone());
        let deadline = op.deadline();
        if deadline.is_never() {
            return;
        }
        let at = if deadline.is_absolute() { deadline.absolute_time() } else { TimePoint::now() };
        self.timer_seq += 1;
        let key = (at.as_nanos(), self.timer_seq);
        op.with_scratch(|s: &mut IocpScratch| s.timer = Some(key));
        self.timers.insert(key, op.clone());
    }

    fn disarm_timer(&mut self, op: &OperationRef) {
        if let Some(key) = op.with_scratch(|s: &mut IocpScratch| s.timer.take()) {
            self.timers.remove(&key);
        }
    }

    fn next_timer(&self) -> Deadline {
        match self.timers.keys().next() {
            Some(&(nanos, _)) => Deadline::absolute(TimePoint::from_nanos(nanos)),
            None => Deadline::never(),
        }
    }

    /// Stop a wait before its callback fires; if it already fired, the
    /// queued packet delivers the signal instead.
    fn abandon_wait(&mut self, op: &OperationRef, error: Error) {
        if release_wait(op) {
            return;
        }
        self.disarm_timer(op);
        self.in_flight.remove(&(overlapped_of(op) as usize));
        self.engine.complete(op, Err(error));
    }

    fn expire_timers(&mut self) {
        let now = TimePoint::now().as_nanos();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let op = entry.remove();
            op.with_scratch(|s: &mut IocpScratch| s.timer = None);
            ktrace!("iocp: {:?} timed out", op.kind());
            match op.kind() {
                OperationKind::Wait => self.abandon_wait(&op, Error::AsyncOperationTimedOut),
                _ => cancel_transfer(self, &op),
            }
        }
    }

    fn dequeue(&mut self, deadline: Deadline) -> Result<usize> {
        let mut removed = 0u32;
        // Safety: the buffer holds `entries.len()` entries.
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port.0,
                self.entries.as_mut_ptr(),
                self.entries.len() as u32,
                &mut removed,
                sys::timeout_ms(deadline),
                0,
            )
        };
        if ok == 0 {
            return match unsafe { GetLastError() } {
                WAIT_TIMEOUT => Ok(0),
                code => Err(Error::from_errno(code as i32)),
            };
        }
        Ok(removed as usize)
    }

    fn dispatch(&mut self, n: usize) {
        for i in 0..n {
            let entry = self.entries[i];
            if entry.lpCompletionKey == INTERRUPT_KEY {
                ktrace!("iocp: interrupted");
                continue;
            }
            let key = entry.lpOverlapped as usize;
            let Some(op) = self.in_flight.remove(&key) else {
                kdebug!("iocp: packet for unknown operation (key {})", entry.lpCompletionKey);
                continue;
            };
            self.disarm_timer(&op);
            notify_operation(self, &op, entry.dwNumberOfBytesTransferred);
        }
    }

    /// Cancel everything in flight and conclude it, draining the packets
    /// the kernel still owes. Operations whose packet never arrives are
    /// concluded as cancelled and leaked, since the kernel may still write
    /// to their buffers.
    fn shutdown(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let pending: Vec<OperationRef> = self.in_flight.values().cloned().collect();
        kdebug!("iocp: cancelling {} operations at drop", pending.len());
        for op in &pending {
            if let Err(e) = self.engine.cancel_action(op) {
                kdebug!("iocp: {:?} not cancellable: {}", op.kind(), e);
                continue;
            }
            match op.kind() {
                OperationKind::Wait => self.abandon_wait(op, Error::AsyncOperationCancelled),
                _ => cancel_transfer(self, op),
            }
        }
        drop(pending);

        for _ in 0..SHUTDOWN_ROUNDS {
            if self.in_flight.is_empty() {
                break;
            }
            match self.dequeue(Deadline::relative(Duration::from_millis(100))) {
                Ok(n) => self.dispatch(n),
                Err(e) => {
                    kwarn!("iocp: drain at drop failed: {}", e);
                    break;
                }
            }
        }

        if !self.in_flight.is_empty() {
            kwarn!("iocp: {} operations still in flight at drop", self.in_flight.len());
            for (_, op) in mem::take(&mut self.in_flight) {
                self.disarm_timer(&op);
                self.engine.complete(&op, Err(Error::AsyncOperationCancelled));
                mem::forget(op);
            }
        }
        self.engine.flush();
    }
}

impl Drop for IocpMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Driven for IocpMultiplexer {
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

impl Multiplexer for IocpMultiplexer {
    fn name(&self) -> &'static str {
        "iocp"
    }

    fn id(&self) -> MultiplexerId {
        self.engine.id()
    }

    fn supports(&self, object: ObjectKind, operation: OperationKind) -> bool {
        self.relations.supports(object, operation)
    }

    /// The port association happens on the first overlapped transfer;
    /// flags alone cannot tell an overlapped file from an event here.
    fn attach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        handle.check_multiplexable()?;
        if connector.is_attached() {
            return Err(Error::InvalidArgument);
        }
        connector.bind(self.engine.id(), None)
    }

    fn detach(&mut self, _handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        connector.unbind(self.engine.id()).map(|_| ())
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

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(self.port.clone())
    }

    fn poll(&mut self, deadline: Deadline) -> Result<PollStatistics> {
        if self.engine.outstanding() == 0 {
            return Ok(self.engine.flush());
        }
        let wait = if self.engine.has_deferred() || self.in_flight.is_empty() {
            Deadline::instant()
        } else {
            deadline.start().min(self.next_timer())
        };
        let n = self.dequeue(wait)?;
        self.dispatch(n);
        self.expire_timers();
        Ok(self.engine.flush())
    }
}
