//! Linux syscall layer.
//!
//! Every descriptor this crate creates is non-blocking, so each operation
//! has a single-attempt form (`try_operation`) that either finishes or
//! fails with `EAGAIN`. Readiness backends retry it when the fd becomes
//! ready; the blocking backend retries it after poll(2). Regular files
//! never report `EAGAIN` and simply block in pread/pwrite.

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

use nix::errno::Errno;

use super::{MapKind, SocketKind};

use allio_core::{
    Arguments, Completion, Deadline, Error, HandleFlags, Interrupt, ObjectKind, Operation,
    OperationKind, Protection, Result, StepDeadline,
};

/// `idtype_t` for waitid(2) on a pidfd (Linux 5.4+).
const P_PIDFD: libc::idtype_t = 3;

#[inline]
pub fn last_error() -> Error {
    Error::from_errno(Errno::last_raw())
}

#[inline]
pub fn would_block() -> Error {
    Error::System(libc::EAGAIN)
}

/// Run `f` until it stops failing with `EINTR`.
#[inline]
fn retry<F>(mut f: F) -> Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    loop {
        let ret = f();
        if ret >= 0 {
            return Ok(ret as usize);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(Error::from_errno(e as i32)),
        }
    }
}

#[inline]
fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(last_error())
    } else {
        Ok(ret)
    }
}

// ── Socket addresses ──

/// `sockaddr_storage` plus length, convertible to and from `SocketAddr`.
#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    /// Output buffer for accept/recvfrom.
    pub fn empty() -> Self {
        Self {
            // Safety: all-zero is a valid sockaddr_storage.
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub fn from_socket_addr(address: &SocketAddr) -> Self {
        let mut sa = Self::empty();
        match address {
            SocketAddr::V4(v4) => {
                // Safety: sockaddr_storage is large enough and aligned for sockaddr_in.
                let sin = unsafe { &mut *(&mut sa.storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                sa.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                // Safety: as above, for sockaddr_in6.
                let sin6 = unsafe { &mut *(&mut sa.storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                sa.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }
        sa
    }

    #[inline]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    #[inline]
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    #[inline]
    pub fn len_mut(&mut self) -> *mut libc::socklen_t {
        &mut self.len
    }

    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                // Safety: family checked.
                let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                // Safety: family checked.
                let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => Err(Error::InvalidAddress),
        }
    }
}

impl Default for SockAddr {
    fn default() -> Self {
        Self::empty()
    }
}

// ── Descriptor constructors ──

pub fn close(fd: RawFd) {
    if fd >= 0 {
        // Safety: the caller owns fd.
        unsafe {
            libc::close(fd);
        }
    }
}

/// Non-blocking close-on-exec pipe, `(read, write)`.
pub fn pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [-1; 2];
    // Safety: fds has room for two descriptors.
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })?;
    Ok((fds[0], fds[1]))
}

fn domain_of(address: &SocketAddr) -> libc::c_int {
    match address {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// Non-blocking socket of `kind` for `address`'s family.
pub fn socket(address: &SocketAddr, kind: SocketKind) -> Result<RawFd> {
    let ty = match kind {
        SocketKind::Datagram => libc::SOCK_DGRAM,
        SocketKind::Stream => libc::SOCK_STREAM,
    };
    // Safety: plain syscall.
    cvt(unsafe { libc::socket(domain_of(address), ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) })
}

pub fn bind(fd: RawFd, address: &SocketAddr) -> Result<()> {
    let sa = SockAddr::from_socket_addr(address);
    // Safety: sa outlives the call.
    match cvt(unsafe { libc::bind(fd, sa.as_ptr(), sa.len()) }) {
        Err(Error::System(libc::EADDRINUSE)) => Err(Error::SocketAlreadyBound),
        r => r.map(|_| ()),
    }
}

pub fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    // Safety: plain syscall.
    cvt(unsafe { libc::listen(fd, backlog) }).map(|_| ())
}

pub fn set_reuse_address(fd: RawFd) -> Result<()> {
    let on: libc::c_int = 1;
    // Safety: option value outlives the call.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(|_| ())
}

pub fn local_address(fd: RawFd) -> Result<SocketAddr> {
    let mut sa = SockAddr::empty();
    // Safety: sa is a valid output buffer.
    cvt(unsafe { libc::getsockname(fd, sa.as_mut_ptr(), sa.len_mut()) })?;
    sa.to_socket_addr()
}

/// Pending socket error (SO_ERROR), 0 if none.
pub fn socket_error(fd: RawFd) -> Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: err/len outlive the call.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(err)
}

/// eventfd with counter 0, non-blocking.
pub fn event_create() -> Result<RawFd> {
    // Safety: plain syscall.
    cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })
}

pub fn event_signal(fd: RawFd) -> Result<()> {
    let one: u64 = 1;
    let ret = retry(|| unsafe {
        libc::write(fd, &one as *const u64 as *const libc::c_void, mem::size_of::<u64>())
    });
    match ret {
        // Counter saturated: already signaled.
        Err(e) if e.is_would_block() => Ok(()),
        r => r.map(|_| ()),
    }
}

/// Clear the signal. Returns whether it was set.
pub fn event_reset(fd: RawFd) -> Result<bool> {
    let mut value: u64 = 0;
    let ret = retry(|| unsafe {
        libc::read(fd, &mut value as *mut u64 as *mut libc::c_void, mem::size_of::<u64>())
    });
    match ret {
        Ok(_) => Ok(true),
        Err(e) if e.is_would_block() => Ok(false),
        Err(e) => Err(e),
    }
}

/// eventfd that interrupts a backend's kernel wait. The backend watches
/// `fd()` for readability and drains it when it fires.
#[derive(Debug)]
pub struct Wakeup(RawFd);

impl Wakeup {
    pub fn new() -> Result<Self> {
        event_create().map(Wakeup)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.0
    }

    /// Returns whether an interrupt was pending.
    pub fn drain(&self) -> bool {
        event_reset(self.0).unwrap_or(false)
    }
}

impl Interrupt for Wakeup {
    fn interrupt(&self) {
        if let Err(e) = event_signal(self.0) {
            allio_core::kdebug!("wakeup: signal fd {} failed: {}", self.0, e);
        }
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        close(self.0);
    }
}

// ── Sections and maps ──

pub fn page_size() -> usize {
    // Safety: plain query.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Alignment of section offsets.
pub fn map_granularity() -> usize {
    page_size()
}

fn file_size(fd: RawFd) -> Result<u64> {
    // Safety: all-zero is a valid stat buffer.
    let mut st: libc::stat = unsafe { mem::zeroed() };
    cvt(unsafe { libc::fstat(fd, &mut st) })?;
    Ok(st.st_size as u64)
}

fn resize(fd: RawFd, size: u64) -> Result<()> {
    let size = libc::off_t::try_from(size).map_err(|_| Error::InvalidArgument)?;
    // Safety: plain syscall.
    cvt(unsafe { libc::ftruncate(fd, size) }).map(|_| ())
}

/// Anonymous section of `size` bytes, backed by a memfd.
pub fn section_anonymous(size: u64) -> Result<RawFd> {
    // Safety: the name is NUL-terminated.
    let fd = cvt(unsafe { libc::memfd_create(c"allio-section".as_ptr(), libc::MFD_CLOEXEC) })?;
    if let Err(e) = resize(fd, size) {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Section over the first `size` bytes of an open file. A writable
/// section grows a shorter file; a read-only one rejects it.
pub fn section_from_file(file: RawFd, size: u64, protection: Protection) -> Result<RawFd> {
    // Safety: plain syscall.
    let mode = cvt(unsafe { libc::fcntl(file, libc::F_GETFL) })? & libc::O_ACCMODE;
    let allowed = match mode {
        libc::O_RDWR => Protection::ReadWrite,
        libc::O_RDONLY => Protection::Read,
        _ => Protection::None,
    };
    if protection == Protection::None || !allowed.allows(protection) {
        return Err(Error::InvalidArgument);
    }
    if file_size(file)? < size {
        if !protection.is_writable() {
            return Err(Error::InvalidArgument);
        }
        resize(file, size)?;
    }
    // Safety: plain syscall.
    cvt(unsafe { libc::fcntl(file, libc::F_DUPFD_CLOEXEC, 0) })
}

fn page_protection(protection: Protection) -> libc::c_int {
    match protection {
        Protection::None => libc::PROT_NONE,
        Protection::Read => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

fn mmap(len: usize, protection: Protection, flags: libc::c_int, fd: RawFd, offset: u64) -> Result<*mut u8> {
    let offset = libc::off_t::try_from(offset).map_err(|_| Error::InvalidArgument)?;
    // Safety: a fresh mapping at a kernel-chosen address.
    let base = unsafe { libc::mmap(std::ptr::null_mut(), len, page_protection(protection), flags, fd, offset) };
    if base == libc::MAP_FAILED {
        return Err(last_error());
    }
    Ok(base as *mut u8)
}

/// Shared view of `len` bytes of a section from `offset`.
pub fn map_section(section: RawFd, offset: u64, len: usize, protection: Protection) -> Result<*mut u8> {
    mmap(len, protection, libc::MAP_SHARED, section, offset)
}

/// Private zeroed pages. With `Protection::None` only address space is
/// reserved; `protect` commits it.
pub fn map_anonymous(len: usize, protection: Protection) -> Result<*mut u8> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if protection == Protection::None {
        flags |= libc::MAP_NORESERVE;
    }
    mmap(len, protection, flags, -1, 0)
}

/// Change the protection of whole pages inside a mapping.
pub fn protect(base: *mut u8, len: usize, protection: Protection, _kind: MapKind) -> Result<()> {
    // Safety: the caller passes pages of a live mapping.
    cvt(unsafe { libc::mprotect(base as *mut libc::c_void, len, page_protection(protection)) }).map(|_| ())
}

pub fn unmap(base: *mut u8, len: usize, _kind: MapKind) {
    // Safety: the caller owns the mapping.
    if unsafe { libc::munmap(base as *mut libc::c_void, len) } != 0 {
        allio_core::kdebug!("munmap: {}", last_error());
    }
}

pub fn pidfd_open(pid: libc::pid_t) -> Result<RawFd> {
    // Safety: plain syscall; the kernel sets O_CLOEXEC on pidfds.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if ret < 0 {
        return Err(last_error());
    }
    Ok(ret as RawFd)
}

pub fn current_pid() -> libc::pid_t {
    // Safety: always succeeds.
    unsafe { libc::getpid() }
}

// ── Readiness ──

/// Wait until `fd` reports one of `events` or `deadline` passes.
/// Returns false on timeout or signal interruption.
pub fn wait_ready(fd: RawFd, events: libc::c_short, deadline: Deadline) -> Result<bool> {
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    // Safety: one valid pollfd.
    let ret = unsafe { libc::poll(&mut pfd, 1, deadline.poll_timeout_ms()) };
    if ret < 0 {
        return match Errno::last() {
            Errno::EINTR => Ok(false),
            e => Err(Error::from_errno(e as i32)),
        };
    }
    Ok(ret > 0)
}

/// Events an operation waits for when its attempt would block.
pub fn interest(op: &Operation) -> libc::c_short {
    if op.kind().is_input() {
        libc::POLLIN
    } else {
        libc::POLLOUT
    }
}

// ── Operations ──

/// Every (object, operation) pair this platform implements.
pub const RELATIONS: &[(ObjectKind, OperationKind)] = &[
    (ObjectKind::File, OperationKind::ReadAt),
    (ObjectKind::File, OperationKind::WriteAt),
    (ObjectKind::Pipe, OperationKind::Read),
    (ObjectKind::Pipe, OperationKind::Write),
    (ObjectKind::DatagramSocket, OperationKind::SendTo),
    (ObjectKind::DatagramSocket, OperationKind::ReceiveFrom),
    (ObjectKind::ListenSocket, OperationKind::Accept),
    (ObjectKind::StreamSocket, OperationKind::Connect),
    (ObjectKind::StreamSocket, OperationKind::Read),
    (ObjectKind::StreamSocket, OperationKind::Write),
    (ObjectKind::Event, OperationKind::Wait),
    (ObjectKind::Process, OperationKind::Wait),
];

/// Reject operations that can never be started on any backend.
pub fn validate(op: &Operation) -> Result<()> {
    if op.object() == ObjectKind::Process
        && op.kind() == OperationKind::Wait
        && op.handle().flags.contains(HandleFlags::PROCESS_CURRENT)
    {
        return Err(Error::ProcessIsCurrentProcess);
    }
    Ok(())
}

/// One non-blocking attempt. `EAGAIN` means wait for `interest(op)` and
/// try again.
pub fn try_operation(op: &Operation) -> Result<Completion> {
    let fd = op.handle().check_not_null()?;
    match (op.object(), op.kind()) {
        (ObjectKind::Event, OperationKind::Wait) => {
            event_try_wait(fd, op.handle().flags.contains(HandleFlags::EVENT_AUTO_RESET))
        }
        (ObjectKind::Process, OperationKind::Wait) => process_try_wait(fd),
        (ObjectKind::ListenSocket, OperationKind::Accept) => accept(fd),
        (object, _) => op.with_arguments(|args| transfer(fd, object, args)),
    }
}

/// Run `op` to completion on the calling thread, honoring its deadline.
pub fn execute(op: &Operation) -> Result<Completion> {
    validate(op)?;
    let fd = op.handle().check_not_null()?;
    let mut step = StepDeadline::new(op.deadline());
    loop {
        let budget = step.step()?;
        match try_operation(op) {
            Err(e) if e.is_would_block() => {}
            r => return r,
        }
        wait_ready(fd, interest(op), budget)?;
    }
}

fn transfer(fd: RawFd, object: ObjectKind, args: &mut Arguments) -> Result<Completion> {
    let stream = object == ObjectKind::StreamSocket;
    let n = match args {
        Arguments::ReadAt { offset, buffer } => retry(|| unsafe {
            libc::pread(fd, buffer.as_mut_ptr().cast(), buffer.len(), *offset as libc::off_t)
        })?,
        Arguments::WriteAt { offset, buffer } => retry(|| unsafe {
            libc::pwrite(fd, buffer.as_ptr().cast(), buffer.len(), *offset as libc::off_t)
        })?,
        Arguments::Read { buffer } if stream => retry(|| unsafe {
            libc::recv(fd, buffer.as_mut_ptr().cast(), buffer.len(), 0)
        })?,
        Arguments::Read { buffer } => retry(|| unsafe {
            libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len())
        })?,
        Arguments::Write { buffer } if stream => retry(|| unsafe {
            libc::send(fd, buffer.as_ptr().cast(), buffer.len(), libc::MSG_NOSIGNAL)
        })?,
        Arguments::Write { buffer } => retry(|| unsafe {
            libc::write(fd, buffer.as_ptr().cast(), buffer.len())
        })?,
        Arguments::SendTo { buffer, address } => {
            let sa = SockAddr::from_socket_addr(address);
            retry(|| unsafe {
                libc::sendto(
                    fd,
                    buffer.as_ptr().cast(),
                    buffer.len(),
                    libc::MSG_NOSIGNAL,
                    sa.as_ptr(),
                    sa.len(),
                )
            })?
        }
        Arguments::ReceiveFrom { buffer } => {
            let mut sa = SockAddr::empty();
            let count = retry(|| unsafe {
                libc::recvfrom(
                    fd,
                    buffer.as_mut_ptr().cast(),
                    buffer.len(),
                    0,
                    sa.as_mut_ptr(),
                    sa.len_mut(),
                )
            })?;
            return Ok(Completion::Received {
                count,
                address: sa.to_socket_addr()?,
            });
        }
        Arguments::Connect { address } => return connect(fd, address),
        Arguments::Accept | Arguments::Wait => return Err(Error::UnsupportedMultiplexerHandleRelation),
    };
    Ok(Completion::Transferred(n))
}

fn accept(fd: RawFd) -> Result<Completion> {
    let mut sa = SockAddr::empty();
    let client = retry(|| unsafe {
        libc::accept4(fd, sa.as_mut_ptr(), sa.len_mut(), libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) as libc::ssize_t
    })? as RawFd;
    match sa.to_socket_addr() {
        Ok(address) => Ok(Completion::Accepted { handle: client, address }),
        Err(e) => {
            close(client);
            Err(e)
        }
    }
}

/// Restartable connect: the first call starts the handshake, later calls
/// report its outcome.
fn connect(fd: RawFd, address: &SocketAddr) -> Result<Completion> {
    let pending = socket_error(fd)?;
    if pending != 0 {
        return Err(Error::from_errno(pending));
    }
    let sa = SockAddr::from_socket_addr(address);
    // Safety: sa outlives the call.
    match retry(|| unsafe { libc::connect(fd, sa.as_ptr(), sa.len()) as libc::ssize_t }) {
        Ok(_) => Ok(Completion::Connected),
        Err(Error::System(libc::EISCONN)) => Ok(Completion::Connected),
        Err(Error::System(libc::EINPROGRESS)) | Err(Error::System(libc::EALREADY)) => Err(would_block()),
        Err(e) => Err(e),
    }
}

/// Auto-reset: consume the signal, so exactly one waiter wins.
/// Manual-reset: observe it without consuming.
fn event_try_wait(fd: RawFd, auto_reset: bool) -> Result<Completion> {
    let signaled = if auto_reset {
        event_reset(fd)?
    } else {
        wait_ready(fd, libc::POLLIN, Deadline::instant())?
    };
    if signaled {
        Ok(Completion::Signaled)
    } else {
        Err(would_block())
    }
}

/// Reap the process behind a pidfd. Killed processes report the negated
/// signal number.
fn process_try_wait(fd: RawFd) -> Result<Completion> {
    // Safety: zeroed siginfo_t is a valid output buffer.
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    let ret = unsafe { libc::waitid(P_PIDFD, fd as libc::id_t, &mut info, libc::WEXITED | libc::WNOHANG) };
    if ret < 0 {
        return match Errno::last() {
            Errno::ECHILD => Err(Error::ProcessExitCodeNotAvailable),
            Errno::EINTR => Err(would_block()),
            e => Err(Error::from_errno(e as i32)),
        };
    }
    // Safety: waitid filled in the SIGCHLD fields.
    let (pid, status) = unsafe { (info.si_pid(), info.si_status()) };
    if pid == 0 {
        return Err(would_block());
    }
    let code = if info.si_code == libc::CLD_EXITED { status } else { -status };
    Ok(Completion::Exited(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use allio_core::{NativeHandle, Request};
    use std::time::Duration;

    fn op(object: ObjectKind, fd: RawFd, flags: HandleFlags, arguments: Arguments) -> allio_core::OperationRef {
        Operation::new(Request::new(object, NativeHandle::new(fd, flags), arguments), None)
    }

    #[test]
    fn test_sockaddr_roundtrip_v4_v6() {
        for text in ["127.0.0.1:4242", "[::1]:9"] {
            let addr: SocketAddr = text.parse().unwrap();
            assert_eq!(SockAddr::from_socket_addr(&addr).to_socket_addr(), Ok(addr));
        }
        assert_eq!(SockAddr::empty().to_socket_addr(), Err(Error::InvalidAddress));
    }

    #[test]
    fn test_pipe_read_would_block_then_data() {
        let (r, w) = pipe().unwrap();
        let read = op(ObjectKind::Pipe, r, HandleFlags::NONE, Arguments::Read { buffer: vec![0; 8] });
        assert!(try_operation(&read).unwrap_err().is_would_block());
        let write = op(ObjectKind::Pipe, w, HandleFlags::NONE, Arguments::Write { buffer: b"hi".to_vec() });
        assert_eq!(try_operation(&write), Ok(Completion::Transferred(2)));
        assert_eq!(try_operation(&read), Ok(Completion::Transferred(2)));
        read.set_result(Ok(Completion::Transferred(2)));
        assert_eq!(read.take_buffer().as_deref(), Some(&b"hi"[..]));
        close(r);
        close(w);
    }

    #[test]
    fn test_execute_times_out_on_empty_pipe() {
        let (r, w) = pipe().unwrap();
        let read = Operation::new(
            Request::new(ObjectKind::Pipe, NativeHandle::new(r, HandleFlags::NONE), Arguments::Read { buffer: vec![0; 1] })
                .deadline(Deadline::relative(Duration::from_millis(20))),
            None,
        );
        assert_eq!(execute(&read), Err(Error::AsyncOperationTimedOut));
        close(r);
        close(w);
    }

    #[test]
    fn test_auto_reset_event_is_consumed_once() {
        let fd = event_create().unwrap();
        let wait = op(ObjectKind::Event, fd, HandleFlags::EVENT_AUTO_RESET, Arguments::Wait);
        assert!(try_operation(&wait).unwrap_err().is_would_block());
        event_signal(fd).unwrap();
        event_signal(fd).unwrap();
        assert_eq!(try_operation(&wait), Ok(Completion::Signaled));
        assert!(try_operation(&wait).unwrap_err().is_would_block());
        close(fd);
    }

    #[test]
    fn test_manual_reset_event_stays_signaled() {
        let fd = event_create().unwrap();
        let wait = op(ObjectKind::Event, fd, HandleFlags::NONE, Arguments::Wait);
        event_signal(fd).unwrap();
        assert_eq!(try_operation(&wait), Ok(Completion::Signaled));
        assert_eq!(try_operation(&wait), Ok(Completion::Signaled));
        assert_eq!(event_reset(fd), Ok(true));
        assert!(try_operation(&wait).unwrap_err().is_would_block());
        close(fd);
    }

    #[test]
    fn test_wakeup_is_level_until_drained() {
        let wakeup = Wakeup::new().unwrap();
        assert!(!wakeup.drain());
        wakeup.interrupt();
        wakeup.interrupt();
        assert_eq!(wait_ready(wakeup.fd(), libc::POLLIN, Deadline::instant()), Ok(true));
        assert!(wakeup.drain());
        assert_eq!(wait_ready(wakeup.fd(), libc::POLLIN, Deadline::instant()), Ok(false));
    }

    #[test]
    fn test_current_process_wait_is_rejected() {
        let wait = op(ObjectKind::Process, 0, HandleFlags::PROCESS_CURRENT, Arguments::Wait);
        assert_eq!(validate(&wait), Err(Error::ProcessIsCurrentProcess));
        assert_eq!(execute(&wait), Err(Error::ProcessIsCurrentProcess));
    }

    #[test]
    fn test_child_exit_code() {
        let child = std::process::Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let fd = pidfd_open(child.id() as libc::pid_t).unwrap();
        let wait = op(ObjectKind::Process, fd, HandleFlags::NONE, Arguments::Wait);
        assert_eq!(execute(&wait), Ok(Completion::Exited(7)));
        assert_eq!(try_operation(&wait), Err(Error::ProcessExitCodeNotAvailable));
        close(fd);
    }

    #[test]
    fn test_bind_conflict_reports_already_bound() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = socket(&any, SocketKind::Datagram).unwrap();
        bind(a, &any).unwrap();
        let taken = local_address(a).unwrap();
        let b = socket(&taken, SocketKind::Datagram).unwrap();
        assert_eq!(bind(b, &taken), Err(Error::SocketAlreadyBound));
        close(a);
        close(b);
    }
}
