//! Files with positioned reads and writes.

use std::fs::OpenOptions;
use std::path::Path;

use allio_core::{Arguments, Deadline, HandleFlags, ObjectKind, Result};

use crate::context::Context;
use crate::handle::OwnedHandle;
use crate::{block_operation, received, transferred};

#[derive(Debug)]
pub struct File {
    handle: OwnedHandle,
}

impl File {
    /// Open an existing file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, OpenOptions::new().read(true).write(true))
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, OpenOptions::new().read(true))
    }

    /// Create (or truncate) a file for reading and writing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(
            path,
            OpenOptions::new().read(true).write(true).create(true).truncate(true),
        )
    }

    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            fn with_options(path: impl AsRef<Path>, options: &mut OpenOptions) -> Result<Self> {
                use std::os::fd::IntoRawFd;
                use std::os::unix::fs::OpenOptionsExt;

                let file = options.custom_flags(libc::O_CLOEXEC).open(path)?;
                Ok(Self {
                    handle: OwnedHandle::new(file.into_raw_fd(), HandleFlags::NONE),
                })
            }
        } else if #[cfg(windows)] {
            fn with_options(path: impl AsRef<Path>, options: &mut OpenOptions) -> Result<Self> {
                use std::os::windows::fs::OpenOptionsExt;
                use std::os::windows::io::IntoRawHandle;
                use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_OVERLAPPED;

                let file = options.custom_flags(FILE_FLAG_OVERLAPPED).open(path)?;
                Ok(Self {
                    handle: OwnedHandle::new(
                        file.into_raw_handle() as isize,
                        HandleFlags::FILE_OVERLAPPED,
                    ),
                })
            }
        }
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut OwnedHandle {
        &mut self.handle
    }

    /// Read into `buffer` at `offset`. The returned buffer is truncated to
    /// the bytes read; empty at end of file.
    pub fn read_at(&self, offset: u64, buffer: Vec<u8>, deadline: Deadline) -> Result<Vec<u8>> {
        let args = Arguments::ReadAt { offset, buffer };
        received(block_operation(self.handle.request(ObjectKind::File, args, deadline, None))?)
    }

    pub fn write_at(&self, offset: u64, buffer: Vec<u8>, deadline: Deadline) -> Result<usize> {
        let args = Arguments::WriteAt { offset, buffer };
        transferred(block_operation(self.handle.request(ObjectKind::File, args, deadline, None))?)
    }

    pub async fn read_at_async(
        &self,
        context: &Context,
        offset: u64,
        buffer: Vec<u8>,
        deadline: Deadline,
    ) -> Result<Vec<u8>> {
        let args = Arguments::ReadAt { offset, buffer };
        let request = self.handle.request(ObjectKind::File, args, deadline, Some(context));
        received(context.submit(request).await?)
    }

    pub async fn write_at_async(
        &self,
        context: &Context,
        offset: u64,
        buffer: Vec<u8>,
        deadline: Deadline,
    ) -> Result<usize> {
        let args = Arguments::WriteAt { offset, buffer };
        let request = self.handle.request(ObjectKind::File, args, deadline, Some(context));
        transferred(context.submit(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("allio-file-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_blocking_write_then_read() {
        let path = scratch_path("blocking");
        let file = File::create(&path).unwrap();
        assert_eq!(file.write_at(0, b"allio".to_vec(), Deadline::never()), Ok(5));
        assert_eq!(file.read_at(0, vec![0; 5], Deadline::never()).unwrap(), b"allio");
        assert_eq!(file.read_at(2, vec![0; 16], Deadline::never()).unwrap(), b"lio");
        assert!(file.read_at(5, vec![0; 4], Deadline::never()).unwrap().is_empty());
        drop(file);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_async_round_trip_at_offset_zero() {
        let path = scratch_path("async");
        let context = Context::new(&crate::MultiplexerConfig::default()).unwrap();
        let mut file = File::create(&path).unwrap();
        file.handle_mut().attach(&context).unwrap();

        let data = context
            .block_on(async {
                let n = file.write_at_async(&context, 0, b"allio".to_vec(), Deadline::never()).await?;
                assert_eq!(n, 5);
                file.read_at_async(&context, 0, vec![0; 5], Deadline::never()).await
            })
            .unwrap()
            .unwrap();
        assert_eq!(data, b"allio");

        file.handle_mut().detach().unwrap();
        drop(file);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_open_missing_file_fails() {
        assert!(File::open(scratch_path("missing")).is_err());
    }
}
