//! Processes as waitable handles.
//!
//! Linux uses pidfds, so only children of this process can report an exit
//! code. Waiting on `Process::current()` fails with
//! `ProcessIsCurrentProcess` before anything reaches the kernel.

use std::ffi::OsStr;
use std::process::Command;

use allio_core::{
    kdebug, Arguments, Completion, Deadline, Error, HandleFlags, ObjectKind, OperationRef,
    RawHandle, Request, Result,
};
use allio_module::sys;

use crate::block_operation;
use crate::context::Context;
use crate::handle::OwnedHandle;

#[derive(Debug)]
pub struct Process {
    handle: OwnedHandle,
    pid: u32,
}

impl Process {
    /// Handle to the running process `pid`.
    pub fn open(pid: u32) -> Result<Self> {
        Ok(Self {
            handle: OwnedHandle::new(open_raw(pid)?, HandleFlags::NONE),
            pid,
        })
    }

    /// Spawn `program` with `args`, inheriting stdio.
    pub fn launch<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(program).args(args).spawn()?;
        let pid = child.id();
        kdebug!("allio: launched process {}", pid);
        Ok(Self {
            handle: OwnedHandle::new(child_raw(child)?, HandleFlags::NONE),
            pid,
        })
    }

    /// The calling process. It cannot be waited on.
    pub fn current() -> Result<Self> {
        Ok(Self {
            handle: OwnedHandle::new(current_raw()?, HandleFlags::PROCESS_CURRENT),
            pid: std::process::id(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_current(&self) -> bool {
        self.handle.flags().contains(HandleFlags::PROCESS_CURRENT)
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut OwnedHandle {
        &mut self.handle
    }

    /// Wait for exit. Killed processes report the negated signal number.
    pub fn wait(&self, deadline: Deadline) -> Result<i32> {
        exit_code(block_operation(self.request(deadline, None))?)
    }

    pub async fn wait_async(&self, context: &Context, deadline: Deadline) -> Result<i32> {
        exit_code(context.submit(self.request(deadline, Some(context))).await?)
    }

    fn request(&self, deadline: Deadline, context: Option<&Context>) -> Request {
        self.handle.request(ObjectKind::Process, Arguments::Wait, deadline, context)
    }
}

fn exit_code(operation: OperationRef) -> Result<i32> {
    match operation.outcome()? {
        Completion::Exited(code) => Ok(code),
        _ => Err(Error::ProcessExitCodeNotAvailable),
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn open_raw(pid: u32) -> Result<RawHandle> {
            let pid = libc::pid_t::try_from(pid).map_err(|_| Error::InvalidArgument)?;
            sys::pidfd_open(pid)
        }

        fn child_raw(child: std::process::Child) -> Result<RawHandle> {
            // The pidfd reaps the child; the std handle is not waited on.
            open_raw(child.id())
        }

        fn current_raw() -> Result<RawHandle> {
            sys::pidfd_open(sys::current_pid())
        }
    } else if #[cfg(windows)] {
        fn open_raw(pid: u32) -> Result<RawHandle> {
            use windows_sys::Win32::System::Threading::{
                OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE,
            };

            // Safety: plain syscall.
            let h = unsafe {
                OpenProcess(PROCESS_SYNCHRONIZE | PROCESS_QUERY_LIMITED_INFORMATION, 0, pid)
            };
            if h.is_null() {
                return Err(sys::last_error());
            }
            Ok(h as RawHandle)
        }

        fn child_raw(child: std::process::Child) -> Result<RawHandle> {
            use std::os::windows::io::IntoRawHandle;
            Ok(child.into_raw_handle() as RawHandle)
        }

        fn current_raw() -> Result<RawHandle> {
            Ok(sys::current_process())
        }
    } else {
        fn open_raw(_pid: u32) -> Result<RawHandle> {
            Err(Error::UnsupportedOperation)
        }

        fn child_raw(_child: std::process::Child) -> Result<RawHandle> {
            Err(Error::UnsupportedOperation)
        }

        fn current_raw() -> Result<RawHandle> {
            Err(Error::UnsupportedOperation)
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::MultiplexerConfig;

    #[test]
    fn test_wait_on_current_process_fails() {
        let current = Process::current().unwrap();
        assert!(current.is_current());
        assert_eq!(current.pid(), std::process::id());
        assert_eq!(current.wait(Deadline::never()), Err(Error::ProcessIsCurrentProcess));

        let context = Context::new(&MultiplexerConfig::default()).unwrap();
        let waited = context.block_on(current.wait_async(&context, Deadline::never()));
        assert_eq!(waited, Ok(Err(Error::ProcessIsCurrentProcess)));
    }

    #[test]
    fn test_launch_and_wait_blocking() {
        let child = Process::launch("sh", ["-c", "exit 3"]).unwrap();
        assert_eq!(child.wait(Deadline::never()), Ok(3));
    }

    #[test]
    fn test_launch_and_wait_async() {
        let context = Context::new(&MultiplexerConfig::default()).unwrap();
        let child = Process::launch("true", std::iter::empty::<&str>()).unwrap();
        let code = context.block_on(child.wait_async(&context, Deadline::never())).unwrap();
        assert_eq!(code, Ok(0));
    }

    #[test]
    fn test_wait_times_out_while_running() {
        let child = Process::launch("sleep", ["1"]).unwrap();
        let wait = child.wait(Deadline::relative(Duration::from_millis(10)));
        assert_eq!(wait, Err(Error::AsyncOperationTimedOut));
        assert_eq!(child.wait(Deadline::never()), Ok(0));
    }
}
