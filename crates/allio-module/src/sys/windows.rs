//! Win32 syscall layer: blocking forms of the supported operations,
//! Winsock sockets, overlapped pipes and event handles.
//!
//! Every socket and pipe this crate creates is overlapped. Transfers are
//! split in two halves shared with the completion-port backend: `start`
//! issues the overlapped call and `finish` turns the finished call into a
//! `Completion`. The blocking form waits on a private event in between and
//! sets the event's low bit so no packet reaches a port the handle may be
//! associated with.

use std::ffi::c_void;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use windows_sys::core::GUID;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, BOOL, ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_IO_PENDING,
    GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock as ws;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED,
    OPEN_EXISTING, PIPE_ACCESS_INBOUND,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, VirtualAlloc, VirtualFree,
    VirtualProtect, FILE_MAP_READ, FILE_MAP_WRITE, MEMORY_MAPPED_VIEW_ADDRESS, MEM_COMMIT,
    MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::Pipes::{
    CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_WAIT,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::Threading::{
    CreateEventW, GetCurrentProcess, GetExitCodeProcess, ResetEvent, SetEvent,
    WaitForSingleObject, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use allio_core::{
    kdebug, Arguments, Completion, Deadline, Error, HandleFlags, ObjectKind, Operation,
    OperationKind, Protection, RawHandle, Result, NULL_RAW_HANDLE,
};

use super::{MapKind, SocketKind};

/// Room AcceptEx needs for one address.
const ACCEPT_ADDRESS_LEN: usize = mem::size_of::<ws::SOCKADDR_STORAGE>() + 16;
const PIPE_BUFFER: u32 = 64 * 1024;

#[inline]
pub fn last_error() -> Error {
    // Safety: reads thread-local state.
    Error::from_errno(unsafe { GetLastError() } as i32)
}

#[inline]
fn wsa_error() -> Error {
    // Safety: reads thread-local state.
    Error::from_errno(unsafe { ws::WSAGetLastError() })
}

#[inline]
pub fn as_handle(raw: RawHandle) -> HANDLE {
    raw as HANDLE
}

#[inline]
fn as_socket(raw: RawHandle) -> ws::SOCKET {
    raw as ws::SOCKET
}

/// Millisecond timeout for Wait* calls.
pub fn timeout_ms(deadline: Deadline) -> u32 {
    match deadline.remaining() {
        None => INFINITE,
        Some(d) => u32::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(INFINITE - 1),
    }
}

/// Length argument of a single Win32 transfer.
pub fn transfer_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidArgument)
}

pub fn close(raw: RawHandle) {
    if raw != NULL_RAW_HANDLE {
        // Safety: the caller owns the handle.
        unsafe {
            CloseHandle(as_handle(raw));
        }
    }
}

pub fn close_socket(raw: RawHandle) {
    if raw != NULL_RAW_HANDLE {
        // Safety: the caller owns the socket.
        unsafe {
            ws::closesocket(as_socket(raw));
        }
    }
}

// ── Events and processes ──

pub fn event_create(manual_reset: bool) -> Result<RawHandle> {
    // Safety: anonymous event, default security.
    let h = unsafe { CreateEventW(ptr::null(), manual_reset as i32, 0, ptr::null()) };
    if h.is_null() {
        return Err(last_error());
    }
    Ok(h as RawHandle)
}

pub fn event_signal(raw: RawHandle) -> Result<()> {
    // Safety: valid event handle.
    if unsafe { SetEvent(as_handle(raw)) } == 0 {
        return Err(last_error());
    }
    Ok(())
}

/// Clear the event. Returns whether it was signaled.
pub fn event_reset(raw: RawHandle) -> Result<bool> {
    let was_signaled = wait_object(raw, Deadline::instant())?;
    // Safety: valid event handle.
    if unsafe { ResetEvent(as_handle(raw)) } == 0 {
        return Err(last_error());
    }
    Ok(was_signaled)
}

/// Pseudo-handle of the calling process; never needs closing.
pub fn current_process() -> RawHandle {
    // Safety: always succeeds.
    unsafe { GetCurrentProcess() as RawHandle }
}

/// Exit code of a signaled process handle.
pub fn exit_code(raw: RawHandle) -> Result<i32> {
    let mut code = 0u32;
    // Safety: code outlives the call.
    if unsafe { GetExitCodeProcess(as_handle(raw), &mut code) } == 0 {
        return Err(Error::ProcessExitCodeNotAvailable);
    }
    Ok(code as i32)
}

// ── Pipes ──

/// Overlapped byte pipe, `(read, write)`. Built from a uniquely named pipe
/// because anonymous pipes cannot do overlapped I/O.
pub fn pipe() -> Result<(RawHandle, RawHandle)> {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let name = format!(
        r"\\.\pipe\allio-{}-{}",
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    );
    let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();

    // Safety: wide is NUL-terminated and outlives both calls.
    let reader = unsafe {
        CreateNamedPipeW(
            wide.as_ptr(),
            PIPE_ACCESS_INBOUND | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
            1,
            PIPE_BUFFER,
            PIPE_BUFFER,
            0,
            ptr::null(),
        )
    };
    if reader == INVALID_HANDLE_VALUE {
        return Err(last_error());
    }
    let writer = unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_WRITE,
            0,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_OVERLAPPED,
            ptr::null_mut(),
        )
    };
    if writer == INVALID_HANDLE_VALUE {
        let e = last_error();
        close(reader as RawHandle);
        return Err(e);
    }
    Ok((reader as RawHandle, writer as RawHandle))
}

// ── Sections and maps ──

fn system_info() -> SYSTEM_INFO {
    // Safety: info is a valid output buffer.
    let mut info: SYSTEM_INFO = unsafe { mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info
}

pub fn page_size() -> usize {
    system_info().dwPageSize as usize
}

/// Alignment of section offsets.
pub fn map_granularity() -> usize {
    system_info().dwAllocationGranularity as usize
}

fn page_protection(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    match protection {
        Protection::None => PAGE_NOACCESS,
        Protection::Read => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
    }
}

fn create_mapping(file: HANDLE, size: u64, protection: Protection) -> Result<RawHandle> {
    if protection == Protection::None {
        return Err(Error::InvalidArgument);
    }
    // Safety: unnamed mapping, default security.
    let h = unsafe {
        CreateFileMappingW(
            file,
            ptr::null(),
            page_protection(protection),
            (size >> 32) as u32,
            size as u32,
            ptr::null(),
        )
    };
    if h.is_null() {
        return Err(last_error());
    }
    Ok(h as RawHandle)
}

/// Anonymous section of `size` bytes, backed by the paging file.
pub fn section_anonymous(size: u64) -> Result<RawHandle> {
    create_mapping(INVALID_HANDLE_VALUE, size, Protection::ReadWrite)
}

/// Section over the first `size` bytes of an open file. A writable
/// section grows a shorter file.
pub fn section_from_file(file: RawHandle, size: u64, protection: Protection) -> Result<RawHandle> {
    create_mapping(as_handle(file), size, protection)
}

/// View of `len` bytes of a section from `offset`.
pub fn map_section(section: RawHandle, offset: u64, len: usize, protection: Protection) -> Result<*mut u8> {
    let access = match protection {
        Protection::None => return Err(Error::InvalidArgument),
        Protection::Read => FILE_MAP_READ,
        Protection::ReadWrite => FILE_MAP_READ | FILE_MAP_WRITE,
    };
    // Safety: a fresh view at a system-chosen address.
    let view = unsafe { MapViewOfFile(as_handle(section), access, (offset >> 32) as u32, offset as u32, len) };
    if view.Value.is_null() {
        return Err(last_error());
    }
    Ok(view.Value as *mut u8)
}

/// Private zeroed pages. With `Protection::None` only address space is
/// reserved; `protect` commits it.
pub fn map_anonymous(len: usize, protection: Protection) -> Result<*mut u8> {
    let allocation = match protection {
        Protection::None => MEM_RESERVE,
        _ => MEM_RESERVE | MEM_COMMIT,
    };
    // Safety: a fresh allocation at a system-chosen address.
    let base = unsafe { VirtualAlloc(ptr::null(), len, allocation, page_protection(protection)) };
    if base.is_null() {
        return Err(last_error());
    }
    Ok(base as *mut u8)
}

/// Change the protection of whole pages inside a mapping, committing
/// reserved anonymous pages on the way.
pub fn protect(base: *mut u8, len: usize, protection: Protection, kind: MapKind) -> Result<()> {
    let flags = page_protection(protection);
    // Safety: the caller passes pages of a live reservation.
    if kind == MapKind::Anonymous && unsafe { VirtualAlloc(base as *const c_void, len, MEM_COMMIT, flags) }.is_null() {
        return Err(last_error());
    }
    let mut old: PAGE_PROTECTION_FLAGS = 0;
    // Safety: the pages are committed and belong to a live mapping.
    if unsafe { VirtualProtect(base as *const c_void, len, flags, &mut old) } == 0 {
        return Err(last_error());
    }
    Ok(())
}

pub fn unmap(base: *mut u8, _len: usize, kind: MapKind) {
    // Safety: the caller owns the mapping.
    let ok = match kind {
        MapKind::Section => unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: base as *mut c_void })
        },
        MapKind::Anonymous => unsafe { VirtualFree(base as *mut c_void, 0, MEM_RELEASE) },
    };
    if ok == 0 {
        kdebug!("unmap: {}", last_error());
    }
}

// ── Socket addresses ──

/// `SOCKADDR_STORAGE` plus length, convertible to and from `SocketAddr`.
#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: ws::SOCKADDR_STORAGE,
    len: i32,
}

impl SockAddr {
    pub fn empty() -> Self {
        Self {
            // Safety: all-zero is a valid SOCKADDR_STORAGE.
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<ws::SOCKADDR_STORAGE>() as i32,
        }
    }

    pub fn from_socket_addr(address: &SocketAddr) -> Self {
        let mut sa = Self::empty();
        match address {
            SocketAddr::V4(v4) => {
                // Safety: the storage is large enough and aligned for SOCKADDR_IN.
                let sin = unsafe { &mut *(&mut sa.storage as *mut _ as *mut ws::SOCKADDR_IN) };
                sin.sin_family = ws::AF_INET;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.S_un.S_addr = u32::from_ne_bytes(v4.ip().octets());
                sa.len = mem::size_of::<ws::SOCKADDR_IN>() as i32;
            }
            SocketAddr::V6(v6) => {
                // Safety: as above, for SOCKADDR_IN6.
                let sin6 = unsafe { &mut *(&mut sa.storage as *mut _ as *mut ws::SOCKADDR_IN6) };
                sin6.sin6_family = ws::AF_INET6;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.u.Byte = v6.ip().octets();
                sin6.Anonymous.sin6_scope_id = v6.scope_id();
                sa.len = mem::size_of::<ws::SOCKADDR_IN6>() as i32;
            }
        }
        sa
    }

    #[inline]
    pub fn as_ptr(&self) -> *const ws::SOCKADDR {
        &self.storage as *const _ as *const ws::SOCKADDR
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut ws::SOCKADDR {
        &mut self.storage as *mut _ as *mut ws::SOCKADDR
    }

    #[inline]
    pub fn len(&self) -> i32 {
        self.len
    }

    #[inline]
    pub fn len_mut(&mut self) -> *mut i32 {
        &mut self.len
    }

    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self.storage.ss_family {
            ws::AF_INET => {
                // Safety: family checked.
                let sin = unsafe { &*(&self.storage as *const _ as *const ws::SOCKADDR_IN) };
                let ip = Ipv4Addr::from(unsafe { sin.sin_addr.S_un.S_addr }.to_ne_bytes());
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            ws::AF_INET6 => {
                // Safety: family checked.
                let sin6 = unsafe { &*(&self.storage as *const _ as *const ws::SOCKADDR_IN6) };
                let (ip, scope) = unsafe { (sin6.sin6_addr.u.Byte, sin6.Anonymous.sin6_scope_id) };
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(ip),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    scope,
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

// ── Sockets ──

fn winsock() -> Result<()> {
    static STARTUP: OnceLock<i32> = OnceLock::new();
    let code = *STARTUP.get_or_init(|| {
        // Safety: data is a valid output buffer.
        let mut data: ws::WSADATA = unsafe { mem::zeroed() };
        unsafe { ws::WSAStartup(0x202, &mut data) }
    });
    if code != 0 {
        return Err(Error::from_errno(code));
    }
    Ok(())
}

#[inline]
fn cvt(ret: i32) -> Result<()> {
    if ret == ws::SOCKET_ERROR {
        Err(wsa_error())
    } else {
        Ok(())
    }
}

/// Overlapped, non-inheritable socket of `kind` for `address`'s family.
pub fn socket(address: &SocketAddr, kind: SocketKind) -> Result<RawHandle> {
    winsock()?;
    let family = match address {
        SocketAddr::V4(_) => ws::AF_INET,
        SocketAddr::V6(_) => ws::AF_INET6,
    };
    let ty = match kind {
        SocketKind::Datagram => ws::SOCK_DGRAM,
        SocketKind::Stream => ws::SOCK_STREAM,
    };
    // Safety: plain call, no protocol info.
    let s = unsafe {
        ws::WSASocketW(
            family as i32,
            ty,
            0,
            ptr::null(),
            0,
            ws::WSA_FLAG_OVERLAPPED | ws::WSA_FLAG_NO_HANDLE_INHERIT,
        )
    };
    if s == ws::INVALID_SOCKET {
        return Err(wsa_error());
    }
    Ok(s as RawHandle)
}

pub fn bind(raw: RawHandle, address: &SocketAddr) -> Result<()> {
    let sa = SockAddr::from_socket_addr(address);
    // Safety: sa outlives the call.
    match cvt(unsafe { ws::bind(as_socket(raw), sa.as_ptr(), sa.len()) }) {
        Err(Error::System(ws::WSAEADDRINUSE)) => Err(Error::SocketAlreadyBound),
        r => r,
    }
}

pub fn listen(raw: RawHandle, backlog: i32) -> Result<()> {
    // Safety: plain call.
    cvt(unsafe { ws::listen(as_socket(raw), backlog) })
}

fn set_option(raw: RawHandle, name: i32, value: &[u8]) -> Result<()> {
    // Safety: value outlives the call.
    cvt(unsafe {
        ws::setsockopt(as_socket(raw), ws::SOL_SOCKET, name, value.as_ptr(), value.len() as i32)
    })
}

pub fn set_reuse_address(raw: RawHandle) -> Result<()> {
    set_option(raw, ws::SO_REUSEADDR, &1i32.to_ne_bytes())
}

pub fn local_address(raw: RawHandle) -> Result<SocketAddr> {
    let mut sa = SockAddr::empty();
    // Safety: sa is a valid output buffer.
    cvt(unsafe { ws::getsockname(as_socket(raw), sa.as_mut_ptr(), sa.len_mut()) })?;
    sa.to_socket_addr()
}

pub fn peer_address(raw: RawHandle) -> Result<SocketAddr> {
    let mut sa = SockAddr::empty();
    // Safety: sa is a valid output buffer.
    cvt(unsafe { ws::getpeername(as_socket(raw), sa.as_mut_ptr(), sa.len_mut()) })?;
    sa.to_socket_addr()
}

/// ConnectEx only works on bound sockets.
fn ensure_bound(raw: RawHandle, peer: &SocketAddr) -> Result<()> {
    match local_address(raw) {
        Ok(_) => Ok(()),
        Err(Error::System(ws::WSAEINVAL)) => {
            let any = match peer {
                SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
            };
            bind(raw, &any)
        }
        Err(e) => Err(e),
    }
}

type ConnectEx = unsafe extern "system" fn(
    ws::SOCKET,
    *const ws::SOCKADDR,
    i32,
    *const c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> BOOL;

/// ConnectEx is only reachable through WSAIoctl.
fn connect_ex(raw: RawHandle) -> Result<ConnectEx> {
    static POINTER: OnceLock<usize> = OnceLock::new();
    let pointer = match POINTER.get() {
        Some(&p) => p,
        None => {
            let guid: GUID = ws::WSAID_CONNECTEX;
            let mut pointer = 0usize;
            let mut returned = 0u32;
            // Safety: in and out buffers outlive the synchronous call.
            let ret = unsafe {
                ws::WSAIoctl(
                    as_socket(raw),
                    ws::SIO_GET_EXTENSION_FUNCTION_POINTER,
                    &guid as *const GUID as *const c_void,
                    mem::size_of::<GUID>() as u32,
                    &mut pointer as *mut usize as *mut c_void,
                    mem::size_of::<usize>() as u32,
                    &mut returned,
                    ptr::null_mut(),
                    None,
                )
            };
            cvt(ret)?;
            if pointer == 0 {
                return Err(Error::UnsupportedOperation);
            }
            *POINTER.get_or_init(|| pointer)
        }
    };
    // Safety: the provider returned a ConnectEx entry point.
    Ok(unsafe { mem::transmute::<usize, ConnectEx>(pointer) })
}

// ── Relations ──

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

pub fn validate(op: &Operation) -> Result<()> {
    if op.object() == ObjectKind::Process
        && op.kind() == OperationKind::Wait
        && op.handle().flags.contains(HandleFlags::PROCESS_CURRENT)
    {
        return Err(Error::ProcessIsCurrentProcess);
    }
    Ok(())
}

#[inline]
fn is_socket(object: ObjectKind) -> bool {
    matches!(
        object,
        ObjectKind::DatagramSocket | ObjectKind::ListenSocket | ObjectKind::StreamSocket
    )
}

/// Whether `op` can complete into a port. Files only when opened with
/// `FILE_FLAG_OVERLAPPED`; sockets and pipes always.
pub fn is_overlapped(op: &Operation) -> bool {
    match op.object() {
        ObjectKind::File => op.handle().flags.contains(HandleFlags::FILE_OVERLAPPED),
        ObjectKind::Event | ObjectKind::Process | ObjectKind::Section => false,
        _ => true,
    }
}

// ── Overlapped transfers ──

/// State of one overlapped call. The kernel writes into it until the call
/// completes, so it must not move in between. `overlapped` stays first.
#[repr(C)]
pub struct Overlapped {
    pub overlapped: OVERLAPPED,
    /// Peer of ReceiveFrom, destination of SendTo and Connect.
    address: SockAddr,
    flags: u32,
    /// Socket created for AcceptEx until it is handed out.
    accepted: RawHandle,
    accept_buffer: [u8; 2 * ACCEPT_ADDRESS_LEN],
}

// Safety: the raw pointers inside OVERLAPPED are only dereferenced by the
// kernel while the call is in flight.
unsafe impl Send for Overlapped {}

impl Default for Overlapped {
    fn default() -> Self {
        Self {
            // Safety: all-zero OVERLAPPED is valid.
            overlapped: unsafe { mem::zeroed() },
            address: SockAddr::empty(),
            flags: 0,
            accepted: NULL_RAW_HANDLE,
            accept_buffer: [0; 2 * ACCEPT_ADDRESS_LEN],
        }
    }
}

impl Overlapped {
    fn release_accepted(&mut self) {
        close_socket(mem::replace(&mut self.accepted, NULL_RAW_HANDLE));
    }
}

pub fn set_offset(ov: &mut OVERLAPPED, offset: u64) {
    ov.Anonymous.Anonymous.Offset = offset as u32;
    ov.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
}

/// Buffer pointer and length of `op`'s transfer.
fn buffer_of(op: &Operation) -> Result<(*mut u8, u32)> {
    op.with_arguments(|args| match args.buffer_mut() {
        Some(buffer) => Ok((buffer.as_mut_ptr(), transfer_len(buffer.len())?)),
        None => Ok((ptr::null_mut(), 0)),
    })
}

/// Issue `op` as an overlapped call on `io`.
///
/// `Ok(None)` means the call is in flight and will complete through the
/// event or the port. `Ok(Some(_))` means it ended synchronously without
/// any completion to follow.
///
/// # Safety
///
/// `io` and `op`'s buffer must stay in place until the call completes.
pub unsafe fn start(op: &Operation, io: *mut Overlapped) -> Result<Option<Completion>> {
    let raw = op.handle().check_not_null()?;
    let io = unsafe { &mut *io };
    let (ptr, len) = buffer_of(op)?;
    let ov = &mut io.overlapped as *mut OVERLAPPED;
    let buf = ws::WSABUF { len, buf: ptr };
    let s = as_socket(raw);

    // Each arm yields whether the call failed; the code is then in the
    // thread's last error.
    let failed = match (op.object(), op.kind()) {
        (ObjectKind::File, OperationKind::ReadAt | OperationKind::WriteAt) => {
            let offset = op.with_arguments(|args| match args {
                Arguments::ReadAt { offset, .. } | Arguments::WriteAt { offset, .. } => *offset,
                _ => 0,
            });
            set_offset(&mut io.overlapped, offset);
            let ok = if op.kind() == OperationKind::ReadAt {
                unsafe { ReadFile(as_handle(raw), ptr, len, ptr::null_mut(), ov) }
            } else {
                unsafe { WriteFile(as_handle(raw), ptr, len, ptr::null_mut(), ov) }
            };
            ok == 0
        }
        (ObjectKind::Pipe, OperationKind::Read) => {
            unsafe { ReadFile(as_handle(raw), ptr, len, ptr::null_mut(), ov) == 0 }
        }
        (ObjectKind::Pipe, OperationKind::Write) => {
            unsafe { WriteFile(as_handle(raw), ptr, len, ptr::null_mut(), ov) == 0 }
        }
        (ObjectKind::StreamSocket, OperationKind::Read) => {
            io.flags = 0;
            let ret = unsafe { ws::WSARecv(s, &buf, 1, ptr::null_mut(), &mut io.flags, ov, None) };
            ret == ws::SOCKET_ERROR
        }
        (ObjectKind::StreamSocket, OperationKind::Write) => {
            let ret = unsafe { ws::WSASend(s, &buf, 1, ptr::null_mut(), 0, ov, None) };
            ret == ws::SOCKET_ERROR
        }
        (ObjectKind::DatagramSocket, OperationKind::ReceiveFrom) => {
            io.flags = 0;
            io.address = SockAddr::empty();
            let ret = unsafe {
                ws::WSARecvFrom(
                    s,
                    &buf,
                    1,
                    ptr::null_mut(),
                    &mut io.flags,
                    io.address.as_mut_ptr(),
                    io.address.len_mut(),
                    ov,
                    None,
                )
            };
            ret == ws::SOCKET_ERROR
        }
        (ObjectKind::DatagramSocket, OperationKind::SendTo) => {
            let to = op.with_arguments(|args| match args {
                Arguments::SendTo { address, .. } => Ok(*address),
                _ => Err(Error::InvalidArgument),
            })?;
            io.address = SockAddr::from_socket_addr(&to);
            let ret = unsafe {
                ws::WSASendTo(s, &buf, 1, ptr::null_mut(), 0, io.address.as_ptr(), io.address.len(), ov, None)
            };
            ret == ws::SOCKET_ERROR
        }
        (ObjectKind::ListenSocket, OperationKind::Accept) => {
            let accepted = socket(&local_address(raw)?, SocketKind::Stream)?;
            io.accepted = accepted;
            let mut received = 0u32;
            let ok = unsafe {
                ws::AcceptEx(
                    s,
                    as_socket(accepted),
                    io.accept_buffer.as_mut_ptr() as *mut c_void,
                    0,
                    ACCEPT_ADDRESS_LEN as u32,
                    ACCEPT_ADDRESS_LEN as u32,
                    &mut received,
                    ov,
                )
            };
            ok == 0
        }
        (ObjectKind::StreamSocket, OperationKind::Connect) => {
            let to = op.with_arguments(|args| match args {
                Arguments::Connect { address } => Ok(*address),
                _ => Err(Error::InvalidArgument),
            })?;
            ensure_bound(raw, &to)?;
            let connect = connect_ex(raw)?;
            io.address = SockAddr::from_socket_addr(&to);
            let ok = unsafe {
                connect(s, io.address.as_ptr(), io.address.len(), ptr::null(), 0, ptr::null_mut(), ov)
            };
            ok == 0
        }
        _ => return Err(Error::UnsupportedMultiplexerHandleRelation),
    };
    if !failed {
        return Ok(None);
    }
    // Safety: reads thread-local state; WSAGetLastError is the same slot.
    match unsafe { GetLastError() } {
        ERROR_IO_PENDING => Ok(None),
        ERROR_HANDLE_EOF | ERROR_BROKEN_PIPE => Ok(Some(Completion::Transferred(0))),
        code => {
            io.release_accepted();
            Err(Error::from_errno(code as i32))
        }
    }
}

/// Byte count of a finished overlapped call. End of file and a closed
/// pipe read as zero bytes.
fn overlapped_result(raw: RawHandle, object: ObjectKind, ov: &OVERLAPPED) -> Result<u32> {
    let mut n = 0u32;
    if is_socket(object) {
        let mut flags = 0u32;
        // Safety: the call has finished.
        if unsafe { ws::WSAGetOverlappedResult(as_socket(raw), ov, &mut n, 0, &mut flags) } != 0 {
            return Ok(n);
        }
        return match unsafe { ws::WSAGetLastError() } {
            // Datagram truncated to the buffer, as recvfrom does elsewhere.
            ws::WSAEMSGSIZE => Ok(n),
            code => Err(Error::from_errno(code)),
        };
    }
    // Safety: the call has finished.
    if unsafe { GetOverlappedResult(as_handle(raw), ov, &mut n, 0) } != 0 {
        return Ok(n);
    }
    match unsafe { GetLastError() } {
        ERROR_HANDLE_EOF | ERROR_BROKEN_PIPE => Ok(0),
        code => Err(Error::from_errno(code as i32)),
    }
}

/// Result of a call issued by `start` once it has completed. Cancelled
/// calls fail with `AsyncOperationCancelled`.
pub fn finish(op: &Operation, io: &mut Overlapped) -> Result<Completion> {
    let raw = op.handle().raw;
    let result = overlapped_result(raw, op.object(), &io.overlapped).and_then(|n| {
        let n = n as usize;
        match op.kind() {
            OperationKind::ReceiveFrom => Ok(Completion::Received {
                count: n,
                address: io.address.to_socket_addr()?,
            }),
            OperationKind::Accept => {
                let accepted = io.accepted;
                set_option(accepted, ws::SO_UPDATE_ACCEPT_CONTEXT, &raw.to_ne_bytes())?;
                let address = peer_address(accepted)?;
                io.accepted = NULL_RAW_HANDLE;
                Ok(Completion::Accepted { handle: accepted, address })
            }
            OperationKind::Connect => {
                set_option(raw, ws::SO_UPDATE_CONNECT_CONTEXT, &[])?;
                Ok(Completion::Connected)
            }
            _ => Ok(Completion::Transferred(n)),
        }
    });
    io.release_accepted();
    result
}

/// Cancel the call issued on `ov`. It still completes, with
/// `ERROR_OPERATION_ABORTED` unless it finished first.
pub fn cancel(raw: RawHandle, ov: *const OVERLAPPED) -> Result<()> {
    // Safety: ov identifies a call issued on this handle.
    if unsafe { CancelIoEx(as_handle(raw), ov) } == 0 {
        return Err(last_error());
    }
    Ok(())
}

/// Wait for an object handle. Ok(false) on timeout.
fn wait_object(raw: RawHandle, deadline: Deadline) -> Result<bool> {
    // Safety: valid waitable handle.
    match unsafe { WaitForSingleObject(as_handle(raw), timeout_ms(deadline)) } {
        WAIT_OBJECT_0 => Ok(true),
        WAIT_TIMEOUT => Ok(false),
        _ => Err(last_error()),
    }
}

/// Run an overlapped call on the calling thread with a private event.
fn transfer(op: &Operation, raw: RawHandle) -> Result<Completion> {
    let event = event_create(true)?;
    let mut io = Overlapped::default();
    // Low bit set: no completion packet for this call.
    io.overlapped.hEvent = (event as usize | 1) as HANDLE;
    let result = (|| {
        // Safety: io and the buffer outlive the call, which is waited for below.
        if let Some(done) = unsafe { start(op, &mut io)? } {
            return Ok(done);
        }
        let mut timed_out = false;
        if !wait_object(event, op.deadline())? {
            timed_out = true;
            let _ = cancel(raw, &io.overlapped);
            wait_object(event, Deadline::never())?;
        }
        match finish(op, &mut io) {
            Err(Error::AsyncOperationCancelled) if timed_out => Err(Error::AsyncOperationTimedOut),
            r => r,
        }
    })();
    close(event);
    result
}

/// Run `op` to completion on the calling thread, honoring its deadline.
pub fn execute(op: &Operation) -> Result<Completion> {
    validate(op)?;
    let raw = op.handle().check_not_null()?;
    match (op.object(), op.kind()) {
        (ObjectKind::Event, OperationKind::Wait) => {
            if wait_object(raw, op.deadline())? {
                Ok(Completion::Signaled)
            } else {
                Err(Error::AsyncOperationTimedOut)
            }
        }
        (ObjectKind::Process, OperationKind::Wait) => {
            if wait_object(raw, op.deadline())? {
                Ok(Completion::Exited(exit_code(raw)?))
            } else {
                Err(Error::AsyncOperationTimedOut)
            }
        }
        (object, kind) if RELATIONS.contains(&(object, kind)) => transfer(op, raw),
        _ => Err(Error::UnsupportedMultiplexerHandleRelation),
    }
}
