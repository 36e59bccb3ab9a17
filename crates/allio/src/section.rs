//! Memory sections and the mappings that view them.
//!
//! A `Section` is a shareable memory object, either anonymous or backed by
//! a file. `Section::map` creates a shared view of it; every view of one
//! section sees the same bytes. `Map::anonymous` and `Map::reserve` create
//! private memory that belongs to no section.

use std::fmt;
use std::ptr::NonNull;
use std::slice;

use allio_core::memory::{is_page_aligned, round_to_page};
use allio_core::{kdebug, Error, HandleFlags, Protection, Result};
use allio_module::sys::{self, MapKind};

use crate::file::File;
use crate::handle::OwnedHandle;

#[derive(Debug)]
pub struct Section {
    handle: OwnedHandle,
    size: u64,
    protection: Protection,
}

impl Section {
    /// Zero-filled read-write section of `size` bytes.
    pub fn anonymous(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            handle: OwnedHandle::new(sys::section_anonymous(size)?, HandleFlags::NONE),
            size,
            protection: Protection::ReadWrite,
        })
    }

    /// Section over the first `size` bytes of `file`. `protection` may not
    /// exceed the file's own access; a writable section grows a shorter
    /// file.
    pub fn with_file(file: &File, size: u64, protection: Protection) -> Result<Self> {
        if size == 0 || protection == Protection::None {
            return Err(Error::InvalidArgument);
        }
        let raw = sys::section_from_file(file.handle().raw(), size, protection)?;
        Ok(Self {
            handle: OwnedHandle::new(raw, HandleFlags::NONE),
            size,
            protection,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    /// View `len` bytes from `offset` with the section's protection.
    pub fn map(&self, offset: u64, len: usize) -> Result<Map> {
        self.map_with(offset, len, self.protection)
    }

    /// View with a narrower protection than the section's. `offset` must
    /// be a multiple of `sys::map_granularity()`.
    pub fn map_with(&self, offset: u64, len: usize, protection: Protection) -> Result<Map> {
        if len == 0 || protection == Protection::None || !self.protection.allows(protection) {
            return Err(Error::InvalidArgument);
        }
        if !is_page_aligned(offset, sys::map_granularity()) {
            return Err(Error::InvalidArgument);
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => {}
            _ => return Err(Error::InvalidArgument),
        }
        let base = sys::map_section(self.handle.raw(), offset, len, protection)?;
        Map::new(base, len, protection, MapKind::Section)
    }
}

/// A mapped range of pages, unmapped on drop.
pub struct Map {
    base: NonNull<u8>,
    len: usize,
    protection: Protection,
    kind: MapKind,
}

// Safety: the mapping is owned; shared access only hands out `&[u8]`.
unsafe impl Send for Map {}
unsafe impl Sync for Map {}

impl Map {
    fn new(base: *mut u8, len: usize, protection: Protection, kind: MapKind) -> Result<Self> {
        let base = NonNull::new(base).ok_or(Error::VirtualAddressNotAvailable)?;
        Ok(Self { base, len, protection, kind })
    }

    /// Private zero-filled pages, `size` rounded up to whole pages.
    pub fn anonymous(size: usize, protection: Protection) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let len = round_to_page(size, sys::page_size());
        Self::new(sys::map_anonymous(len, protection)?, len, protection, MapKind::Anonymous)
    }

    /// Address space only; pages become usable through `commit`.
    pub fn reserve(size: usize) -> Result<Self> {
        Self::anonymous(size, Protection::None)
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_size(&self) -> usize {
        sys::page_size()
    }

    /// Protection of the whole map as last set by `protect`. Ranges given
    /// to `commit` are not reflected here.
    pub fn protection(&self) -> Protection {
        self.protection
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let page = sys::page_size();
        if offset % page != 0 || len == 0 {
            return Err(Error::InvalidArgument);
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Make the pages covering `[offset, offset + len)` usable with
    /// `protection`. `offset` must be page aligned.
    pub fn commit(&mut self, offset: usize, len: usize, protection: Protection) -> Result<()> {
        self.check_range(offset, len)?;
        let len = round_to_page(len, sys::page_size()).min(self.len - offset);
        // Safety: the range lies inside this mapping.
        let base = unsafe { self.base.as_ptr().add(offset) };
        sys::protect(base, len, protection, self.kind)
    }

    /// Change the protection of the whole map.
    pub fn protect(&mut self, protection: Protection) -> Result<()> {
        sys::protect(self.base.as_ptr(), self.len, protection, self.kind)?;
        self.protection = protection;
        Ok(())
    }

    /// The mapped bytes, if the whole map is readable.
    pub fn as_slice(&self) -> Result<&[u8]> {
        if !self.protection.is_readable() {
            return Err(Error::InvalidArgument);
        }
        // Safety: the whole range is mapped readable while self lives.
        Ok(unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) })
    }

    /// The mapped bytes, if the whole map is writable.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.protection.is_writable() {
            return Err(Error::InvalidArgument);
        }
        // Safety: as above, and `&mut self` makes the borrow unique.
        Ok(unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) })
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        kdebug!("allio: unmap {:p} len={}", self.base, self.len);
        sys::unmap(self.base.as_ptr(), self.len, self.kind);
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("protection", &self.protection)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allio_core::Deadline;

    #[cfg(target_pointer_width = "64")]
    const RESERVATION: usize = 1 << 40;
    #[cfg(not(target_pointer_width = "64"))]
    const RESERVATION: usize = 1 << 20;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("allio-section-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_reserved_pages_commit_one_at_a_time() {
        let mut map = Map::reserve(RESERVATION).unwrap();
        let page = map.page_size();
        assert!(map.len() >= RESERVATION);
        assert_eq!(map.len() % page, 0);
        assert!(map.as_slice().is_err());

        let base = map.base();
        map.commit(0, page, Protection::ReadWrite).unwrap();
        assert_eq!(map.base(), base);
        // Safety: page 0 was just committed read-write.
        unsafe { std::ptr::write_bytes(base, b'A', page) };

        map.commit(page, page, Protection::ReadWrite).unwrap();
        assert_eq!(map.base(), base);
        unsafe { std::ptr::write_bytes(base.add(page), b'B', page) };

        let (first, second) = unsafe {
            (slice::from_raw_parts(base, page), slice::from_raw_parts(base.add(page), page))
        };
        assert!(first.iter().all(|&b| b == b'A'));
        assert!(second.iter().all(|&b| b == b'B'));
    }

    #[test]
    fn test_commit_rejects_unaligned_or_outside_ranges() {
        let mut map = Map::reserve(1).unwrap();
        let page = map.page_size();
        assert_eq!(map.len(), page);
        assert_eq!(map.commit(1, 1, Protection::Read), Err(Error::InvalidArgument));
        assert_eq!(map.commit(0, page + 1, Protection::Read), Err(Error::InvalidArgument));
        assert_eq!(map.commit(0, 0, Protection::Read), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_protect_gates_slices() {
        let mut map = Map::anonymous(1, Protection::Read).unwrap();
        assert!(map.as_slice().unwrap().iter().all(|&b| b == 0));
        assert_eq!(map.as_mut_slice().err(), Some(Error::InvalidArgument));
        map.protect(Protection::ReadWrite).unwrap();
        map.as_mut_slice().unwrap()[0] = 1;
        assert_eq!(map.as_slice().unwrap()[0], 1);
    }

    #[test]
    fn test_two_views_of_one_section_share_bytes() {
        let page = sys::map_granularity() as u64;
        let section = Section::anonymous(2 * page).unwrap();
        let mut writer = section.map(0, 2 * page as usize).unwrap();
        let reader = section.map_with(page, page as usize, Protection::Read).unwrap();

        writer.as_mut_slice().unwrap()[page as usize..page as usize + 5].copy_from_slice(b"allio");
        assert_eq!(&reader.as_slice().unwrap()[..5], b"allio");
        assert_eq!(
            section.map_with(1, 8, Protection::Read).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(section.map(0, 3 * page as usize).err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn test_file_section_writes_through() {
        let path = temp_path("write");
        let file = File::create(&path).unwrap();
        file.write_at(0, b"check".to_vec(), Deadline::never()).unwrap();
        {
            let section = Section::with_file(&file, 5, Protection::ReadWrite).unwrap();
            let mut map = section.map(0, 5).unwrap();
            assert!(map.len() >= 5);
            assert_eq!(&map.as_slice().unwrap()[..5], b"check");
            map.as_mut_slice().unwrap()[..5].copy_from_slice(b"write");
        }
        assert_eq!(file.read_at(0, vec![0; 8], Deadline::never()).unwrap(), b"write");
        drop(file);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_read_only_section_refuses_writable_view() {
        let path = temp_path("read");
        std::fs::write(&path, b"check").unwrap();
        let file = File::open_read_only(&path).unwrap();
        assert!(Section::with_file(&file, 5, Protection::ReadWrite).is_err());
        let section = Section::with_file(&file, 5, Protection::Read).unwrap();
        assert_eq!(section.map_with(0, 5, Protection::ReadWrite).err(), Some(Error::InvalidArgument));
        let map = section.map(0, 5).unwrap();
        assert_eq!(&map.as_slice().unwrap()[..5], b"check");
        drop(map);
        drop(section);
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"check");
        let _ = std::fs::remove_file(path);
    }
}
