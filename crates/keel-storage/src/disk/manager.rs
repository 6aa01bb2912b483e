//! Disk manager implementation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use keel_common::constants::PAGE_SIZE;
use keel_common::types::PageId;
use parking_lot::Mutex;
use tracing::debug;

use super::error::{DiskError, DiskResult};

/// State guarded by the disk manager's mutex.
struct DiskInner {
    file: File,
    /// Next page id to hand out when the free list is empty.
    next_page_id: i32,
    /// Deallocated page ids available for reuse.
    free_ids: Vec<PageId>,
    shut_down: bool,
}

/// The disk manager moves whole page images between memory and a single
/// paged data file, and allocates page ids.
///
/// Page ids are handed out monotonically; an id is reused only after an
/// explicit [`deallocate_page`](DiskManager::deallocate_page). Reads past
/// the current end of file yield an all-zero page, so a freshly allocated
/// page reads as zeroes until its first write-back.
pub struct DiskManager {
    inner: Mutex<DiskInner>,
    path: PathBuf,
    page_size: usize,
}

impl DiskManager {
    /// Opens (or creates) the data file at `path` with the default page size.
    pub fn open(path: impl AsRef<Path>) -> DiskResult<Self> {
        Self::open_with_page_size(path, PAGE_SIZE)
    }

    /// Opens (or creates) the data file at `path` with an explicit page size.
    pub fn open_with_page_size(path: impl AsRef<Path>, page_size: usize) -> DiskResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| DiskError::io_at(e, &path))?;

        let len = file
            .metadata()
            .map_err(|e| DiskError::io_at(e, &path))?
            .len();
        let next_page_id = (len as usize / page_size) as i32;

        Ok(Self {
            inner: Mutex::new(DiskInner {
                file,
                next_page_id,
                free_ids: Vec::new(),
                shut_down: false,
            }),
            path,
            page_size,
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the page size this manager was opened with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocates a fresh page id.
    ///
    /// Deallocated ids are reused before the high-water mark advances.
    pub fn allocate_page(&self) -> DiskResult<PageId> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        if let Some(pid) = inner.free_ids.pop() {
            return Ok(pid);
        }
        let pid = PageId::new(inner.next_page_id);
        inner.next_page_id += 1;
        Ok(pid)
    }

    /// Returns `page_id` to the allocator for reuse.
    ///
    /// The file is not shrunk; the slot is simply available again.
    pub fn deallocate_page(&self, page_id: PageId) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        if !page_id.is_valid() || page_id.as_i32() >= inner.next_page_id {
            return Err(DiskError::InvalidPageId { page_id });
        }
        inner.free_ids.push(page_id);
        Ok(())
    }

    /// Reads the page image for `page_id` into `buf`.
    ///
    /// `buf` must be exactly one page long. Bytes past the current end of
    /// file read as zero.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> DiskResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if !page_id.is_valid() {
            return Err(DiskError::InvalidPageId { page_id });
        }

        let mut inner = self.inner.lock();
        inner.check_open()?;

        let offset = page_id.as_i32() as u64 * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match inner.file.read(&mut buf[filled..]) {
                Ok(0) => break, // EOF: remainder stays zeroed below
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled < buf.len() {
            debug!(page_id = %page_id, filled, "short read past EOF, zero-filling");
            buf[filled..].fill(0);
        }
        Ok(())
    }

    /// Writes the page image in `buf` to the slot for `page_id`.
    ///
    /// The file grows as needed; `buf` must be exactly one page long.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> DiskResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if !page_id.is_valid() {
            return Err(DiskError::InvalidPageId { page_id });
        }

        let mut inner = self.inner.lock();
        inner.check_open()?;

        let offset = page_id.as_i32() as u64 * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(buf)?;
        Ok(())
    }

    /// Flushes file metadata and refuses further I/O.
    pub fn shutdown(&self) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Ok(());
        }
        inner.file.sync_all()?;
        inner.shut_down = true;
        Ok(())
    }

    /// Returns the allocation high-water mark (ids handed out so far).
    pub fn num_pages(&self) -> usize {
        self.inner.lock().next_page_id as usize
    }
}

impl DiskInner {
    fn check_open(&self) -> DiskResult<()> {
        if self.shut_down {
            Err(DiskError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskManager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("num_pages", &self.num_pages())
            .finish()
    }
}
