//! `EpollMultiplexer`: readiness-based backend for Linux.
//!
//! `start` first tries the syscall once. If it would block, the operation
//! joins the fd's reader or writer queue and the fd is registered with
//! epoll. When the fd reports ready, queued operations are retried in FIFO
//! order until one would block again, so an auto-reset event releases one
//! waiter per signal while a manual-reset event releases all of them.
//!
//! Registrations are `EPOLLONESHOT` and re-armed after every dispatch.
//! Auto-reset events register `EPOLLEXCLUSIVE` instead, which the kernel
//! does not allow together with oneshot or `EPOLL_CTL_MOD`, so those stay
//! level-triggered and are re-added whenever their interest changes.
//!
//! Deadlines live in a timer map ordered by expiry; `poll` never sleeps
//! past the earliest one. An eventfd registered level-triggered lets other
//! threads interrupt the wait. Regular files are not pollable and use
//! synchronous descriptors.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags};

use allio_core::{
    cancel_operation, construct_operation, kdebug, kinfo, ktrace, kwarn, notify_operation,
    start_operation, Backend, Connector, Deadline, Descriptor, DeferringEngine, Driven, Error,
    HandleFlags, Interrupt, Listener, Multiplexer, MultiplexerId, NativeHandle, Notified, ObjectKind,
    OperationKind, OperationRef, PollStatistics, RelationTable, Request, Result, Started,
    Submission, TimePoint,
};

use crate::config::MultiplexerConfig;
use crate::sys;

/// Interest and registration mode of one fd.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionFlags(u8);

impl SubscriptionFlags {
    pub const NONE: SubscriptionFlags = SubscriptionFlags(0);
    pub const READ: SubscriptionFlags = SubscriptionFlags(1 << 0);
    pub const WRITE: SubscriptionFlags = SubscriptionFlags(1 << 1);
    /// Wake one epoll instance per event (`EPOLLEXCLUSIVE`).
    pub const EXCLUSIVE: SubscriptionFlags = SubscriptionFlags(1 << 2);
    /// Registration persists across events instead of being oneshot.
    pub const MULTISHOT: SubscriptionFlags = SubscriptionFlags(1 << 3);

    const INTEREST: SubscriptionFlags = SubscriptionFlags(Self::READ.0 | Self::WRITE.0);

    #[inline]
    pub const fn contains(&self, other: SubscriptionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn interest(&self) -> SubscriptionFlags {
        SubscriptionFlags(self.0 & Self::INTEREST.0)
    }

    #[inline]
    pub const fn mode(&self) -> SubscriptionFlags {
        SubscriptionFlags(self.0 & !Self::INTEREST.0)
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// epoll event bits for this subscription.
    pub fn epoll_events(&self) -> u32 {
        let mut events = 0;
        if self.contains(Self::READ) {
            events |= libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32;
        }
        if self.contains(Self::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        if self.contains(Self::EXCLUSIVE) {
            events |= libc::EPOLLEXCLUSIVE as u32;
        } else if !self.contains(Self::MULTISHOT) {
            events |= libc::EPOLLONESHOT as u32;
        }
        events
    }
}

impl BitOr for SubscriptionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        SubscriptionFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for SubscriptionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::EXCLUSIVE, "EXCLUSIVE"),
            (Self::MULTISHOT, "MULTISHOT"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "SubscriptionFlags({})", set.join(" | "))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// Waiters on one fd.
struct Subscription {
    readers: VecDeque<OperationRef>,
    writers: VecDeque<OperationRef>,
    /// Registered interest plus mode; empty interest means not registered.
    flags: SubscriptionFlags,
}

impl Subscription {
    fn new(mode: SubscriptionFlags) -> Self {
        Self {
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            flags: mode,
        }
    }

    fn queue(&mut self, direction: Direction) -> &mut VecDeque<OperationRef> {
        match direction {
            Direction::Read => &mut self.readers,
            Direction::Write => &mut self.writers,
        }
    }

    fn wanted(&self) -> SubscriptionFlags {
        let mut interest = SubscriptionFlags::NONE;
        if !self.readers.is_empty() {
            interest = interest | SubscriptionFlags::READ;
        }
        if !self.writers.is_empty() {
            interest = interest | SubscriptionFlags::WRITE;
        }
        interest
    }

    fn remove(&mut self, op: &OperationRef) -> bool {
        let before = self.readers.len() + self.writers.len();
        self.readers.retain(|o| !Arc::ptr_eq(o, op));
        self.writers.retain(|o| !Arc::ptr_eq(o, op));
        before != self.readers.len() + self.writers.len()
    }
}

/// Per-operation state kept in the operation's scratch area.
#[derive(Default)]
struct EpollScratch {
    timer: Option<TimerKey>,
}

/// (expiry in monotonic nanoseconds, tie-breaking sequence number)
type TimerKey = (u64, u64);

pub struct EpollMultiplexer {
    engine: DeferringEngine,
    relations: RelationTable<EpollMultiplexer>,
    epoll: Epoll,
    events: Vec<libc::epoll_event>,
    subscriptions: HashMap<RawFd, Subscription>,
    timers: BTreeMap<TimerKey, OperationRef>,
    timer_seq: u64,
    wakeup: Arc<sys::Wakeup>,
}

impl Backend for EpollMultiplexer {
    /// epoll event bits.
    type Status = u32;
}

// ── Descriptors ──

fn submit_sync(_: &mut EpollMultiplexer, op: &OperationRef) -> Result<Submission> {
    sys::validate(op)?;
    Ok(Submission::Ready(sys::execute(op)))
}

fn submit_ready(mux: &mut EpollMultiplexer, op: &OperationRef) -> Result<Submission> {
    sys::validate(op)?;
    match sys::try_operation(op) {
        Err(e) if e.is_would_block() => {}
        r => return Ok(Submission::Ready(r)),
    }
    if op.deadline().is_instant() || op.deadline().has_expired() {
        return Ok(Submission::Ready(Err(Error::AsyncOperationTimedOut)));
    }
    mux.subscribe(op)?;
    Ok(Submission::Pending)
}

fn notify_ready(_: &mut EpollMultiplexer, op: &OperationRef, events: u32) -> Notified {
    ktrace!("epoll: {:?} ready {:#x}", op.kind(), events);
    match sys::try_operation(op) {
        Err(e) if e.is_would_block() => Notified::Resubmitted,
        r => Notified::Ready(r),
    }
}

fn cancel_ready(mux: &mut EpollMultiplexer, op: &OperationRef) {
    mux.unsubscribe(op);
    mux.engine.complete(op, Err(Error::AsyncOperationCancelled));
}

impl EpollMultiplexer {
    pub fn new(config: &MultiplexerConfig) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::from_errno(e as i32))?;

        let mut relations = RelationTable::new();
        for &(object, operation) in sys::RELATIONS {
            let descriptor = if object == ObjectKind::File {
                Descriptor::synchronous(object, operation, submit_sync)
            } else {
                Descriptor::new(object, operation, submit_ready, notify_ready, cancel_ready)
            };
            relations.register(descriptor);
        }

        let capacity = config.event_capacity.max(1);
        let engine = DeferringEngine::new();
        kinfo!("epoll: fd={} events={} id={}", epoll.0.as_raw_fd(), capacity, engine.id());

        let mux = Self {
            engine,
            relations,
            epoll,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            subscriptions: HashMap::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
            wakeup: Arc::new(sys::Wakeup::new()?),
        };
        mux.ctl(libc::EPOLL_CTL_ADD, mux.wakeup.fd(), libc::EPOLLIN as u32)?;
        Ok(mux)
    }

    fn epfd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut event = libc::epoll_event { events, u64: fd as u64 };
        // Safety: event outlives the call; DEL ignores it.
        let ret = unsafe { libc::epoll_ctl(self.epfd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(Error::from_errno(Errno::last_raw()));
        }
        Ok(())
    }

    fn subscribe(&mut self, op: &OperationRef) -> Result<()> {
        let fd = op.handle().raw;
        let direction = if op.kind().is_input() { Direction::Read } else { Direction::Write };
        let mode = if op.object() == ObjectKind::Event
            && op.handle().flags.contains(HandleFlags::EVENT_AUTO_RESET)
        {
            SubscriptionFlags::EXCLUSIVE | SubscriptionFlags::MULTISHOT
        } else {
            SubscriptionFlags::NONE
        };

        self.subscriptions
            .entry(fd)
            .or_insert_with(|| Subscription::new(mode))
            .queue(direction)
            .push_back(op.clone());

        if let Err(e) = self.update(fd) {
            if let Some(sub) = self.subscriptions.get_mut(&fd) {
                sub.remove(op);
            }
            let _ = self.update(fd);
            return Err(e);
        }
        self.arm_timer(op);
        Ok(())
    }

    fn unsubscribe(&mut self, op: &OperationRef) {
        let fd = op.handle().raw;
        self.disarm_timer(op);
        let removed = self
            .subscriptions
            .get_mut(&fd)
            .map_or(false, |sub| sub.remove(op));
        if removed {
            if let Err(e) = self.update(fd) {
                kwarn!("epoll: re-arm fd {} failed: {}", fd, e);
            }
        }
    }

    /// Bring the kernel registration of `fd` in line with its waiters.
    fn update(&mut self, fd: RawFd) -> Result<()> {
        let (current, wanted) = match self.subscriptions.get(&fd) {
            Some(sub) => (sub.flags, sub.wanted()),
            None => return Ok(()),
        };
        let mode = current.mode();
        let registered = !current.interest().is_empty();

        if wanted.is_empty() {
            self.subscriptions.remove(&fd);
            if registered {
                if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
                    kdebug!("epoll: DEL fd {}: {}", fd, e);
                }
            }
            return Ok(());
        }

        let next = wanted | mode;
        let events = next.epoll_events();
        if !registered {
            match self.ctl(libc::EPOLL_CTL_ADD, fd, events) {
                Err(Error::System(libc::EEXIST)) => self.ctl(libc::EPOLL_CTL_MOD, fd, events)?,
                r => r?,
            }
        } else if mode.contains(SubscriptionFlags::EXCLUSIVE) {
            if wanted != current.interest() {
                self.ctl(libc::EPOLL_CTL_DEL, fd, 0)?;
                self.ctl(libc::EPOLL_CTL_ADD, fd, events)?;
            }
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, events)?;
        }

        if let Some(sub) = self.subscriptions.get_mut(&fd) {
            sub.flags = next;
        }
        Ok(())
    }

    fn arm_timer(&mut self, op: &OperationRef) {
        let deadline = op.deadline();
        if deadline.is_never() {
            return;
        }
        let at = if deadline.is_absolute() {
            deadline.absolute_time()
        } else {
            TimePoint::now()
        };
        self.timer_seq += 1;
        let key = (at.as_nanos(), self.timer_seq);
        op.with_scratch(|s: &mut EpollScratch| s.timer = Some(key));
        self.timers.insert(key, op.clone());
    }

    fn disarm_timer(&mut self, op: &OperationRef) {
        if let Some(key) = op.with_scratch(|s: &mut EpollScratch| s.timer.take()) {
            self.timers.remove(&key);
        }
    }

    fn next_timer(&self) -> Deadline {
        match self.timers.keys().next() {
            Some(&(nanos, _)) => Deadline::absolute(TimePoint::from_nanos(nanos)),
            None => Deadline::never(),
        }
    }

    fn expire_timers(&mut self) {
        let now = TimePoint::now().as_nanos();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let op = entry.remove();
            op.with_scratch(|s: &mut EpollScratch| s.timer = None);
            ktrace!("epoll: {:?} timed out", op.kind());
            self.unsubscribe(&op);
            self.engine.complete(&op, Err(Error::AsyncOperationTimedOut));
        }
    }

    /// Retry the waiters of one direction until one would block.
    fn drain(&mut self, fd: RawFd, direction: Direction, events: u32) {
        loop {
            let op = match self
                .subscriptions
                .get_mut(&fd)
                .and_then(|sub| sub.queue(direction).front().cloned())
            {
                Some(op) => op,
                None => return,
            };
            if !notify_operation(self, &op, events) {
                return;
            }
            self.disarm_timer(&op);
            if let Some(sub) = self.subscriptions.get_mut(&fd) {
                sub.queue(direction).pop_front();
            }
        }
    }

    fn dispatch(&mut self, fd: RawFd, events: u32) {
        let failed = events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
        if failed || events & (libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32) != 0 {
            self.drain(fd, Direction::Read, events);
        }
        if failed || events & libc::EPOLLOUT as u32 != 0 {
            self.drain(fd, Direction::Write, events);
        }
        if let Err(e) = self.update(fd) {
            kwarn!("epoll: re-arm fd {} failed: {}", fd, e);
            self.fail_all(fd, e);
        }
    }

    /// Complete every waiter on `fd` with `error` and drop its registration.
    fn fail_all(&mut self, fd: RawFd, error: Error) {
        let Some(sub) = self.subscriptions.remove(&fd) else {
            return;
        };
        if !sub.flags.interest().is_empty() {
            let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        }
        for op in sub.readers.into_iter().chain(sub.writers) {
            self.disarm_timer(&op);
            self.engine.complete(&op, Err(error));
        }
    }

    fn wait(&mut self, deadline: Deadline) -> Result<usize> {
        let capacity = self.events.len() as libc::c_int;
        // Safety: the buffer holds `capacity` events.
        let n = unsafe {
            libc::epoll_wait(self.epfd(), self.events.as_mut_ptr(), capacity, deadline.poll_timeout_ms())
        };
        if n < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(0),
                e => Err(Error::from_errno(e as i32)),
            };
        }
        Ok(n as usize)
    }
}

impl Driven for EpollMultiplexer {
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

impl Multiplexer for EpollMultiplexer {
    fn name(&self) -> &'static str {
        "epoll"
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

    fn attach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        handle.check_multiplexable()?;
        connector.bind(self.engine.id(), None)
    }

    /// Waiters still queued on the handle conclude as cancelled.
    fn detach(&mut self, handle: &NativeHandle, connector: &mut Connector) -> Result<()> {
        connector.unbind(self.engine.id())?;
        self.fail_all(handle.raw, Error::AsyncOperationCancelled);
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
        let wait = if self.engine.has_deferred() {
            Deadline::instant()
        } else {
            deadline.start().min(self.next_timer())
        };

        let n = self.wait(wait)?;
        for i in 0..n {
            let event = self.events[i];
            let fd = event.u64 as RawFd;
            if fd == self.wakeup.fd() {
                self.wakeup.drain();
                continue;
            }
            self.dispatch(fd, event.events);
        }
        self.expire_timers();
        Ok(self.engine.flush())
    }
}
