//! Buffer pool implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_common::types::PageId;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::config::BufferPoolConfig;
use super::error::{BufferError, BufferResult};
use super::frame::{BufferFrame, FrameId};
use super::replacer::{ClockReplacer, Replacer};
use super::BufferPoolStats;
use crate::disk::DiskManager;

/// State guarded by the pool latch: the page table, the free list, the
/// replacer, and the disk manager.
///
/// Frame metadata lives in the frames themselves (atomics) but is only
/// mutated while this latch is held, so the invariants tie together:
/// a frame id is in exactly one of the page table (as a value), the free
/// list, or the replacer, and a pinned frame is never in the replacer.
struct PoolCore {
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    replacer: ClockReplacer,
    disk: DiskManager,
}

/// The buffer pool mediates all access to disk pages.
///
/// Callers fetch pages by id, receive a pinned frame, latch its data for
/// reading or writing, and must hand the pin back with exactly one
/// [`unpin_page`](BufferPool::unpin_page) per successful
/// [`fetch_page`](BufferPool::fetch_page) / [`new_page`](BufferPool::new_page).
/// Unpinned pages stay cached until the CLOCK replacer evicts them to
/// make room, writing dirty pages back to disk first.
pub struct BufferPool {
    config: BufferPoolConfig,
    frames: Vec<Arc<BufferFrame>>,
    core: Mutex<PoolCore>,
    // Statistics (monotonic, relaxed).
    fetch_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    eviction_count: AtomicU64,
    flush_count: AtomicU64,
}

impl BufferPool {
    /// Creates a buffer pool over `disk` with the given configuration.
    pub fn new(config: BufferPoolConfig, disk: DiskManager) -> BufferResult<Self> {
        config
            .validate()
            .map_err(|e| BufferError::config(e.to_string()))?;
        if disk.page_size() != config.page_size {
            return Err(BufferError::config(format!(
                "disk page size {} does not match pool page size {}",
                disk.page_size(),
                config.page_size
            )));
        }

        let num_frames = config.num_frames;
        let frames: Vec<Arc<BufferFrame>> = (0..num_frames)
            .map(|i| Arc::new(BufferFrame::new(FrameId::new(i), config.page_size)))
            .collect();
        // Initially every frame is free.
        let free_list: Vec<FrameId> = (0..num_frames).rev().map(FrameId::new).collect();

        Ok(Self {
            config,
            frames,
            core: Mutex::new(PoolCore {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
                replacer: ClockReplacer::new(num_frames),
                disk,
            }),
            fetch_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
        })
    }

    /// Fetches the page with id `page_id`, pinning its frame.
    ///
    /// On a hit the resident frame is pinned and returned. On a miss a
    /// frame is taken from the free list (or evicted, writing back dirty
    /// data) and filled from disk. Fails with
    /// [`BufferError::PoolExhausted`] when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> BufferResult<Arc<BufferFrame>> {
        if !page_id.is_valid() {
            return Err(BufferError::PageNotFound { page_id });
        }
        self.fetch_count.fetch_add(1, Ordering::Relaxed);

        let mut core = self.core.lock();

        if let Some(&frame_id) = core.page_table.get(&page_id) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            let frame = &self.frames[frame_id.index()];
            frame.pin();
            core.replacer.pin(frame_id);
            return Ok(Arc::clone(frame));
        }

        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let frame_id = self.take_frame(&mut core)?;
        let frame = &self.frames[frame_id.index()];

        core.page_table.insert(page_id, frame_id);
        core.replacer.pin(frame_id);
        frame.set_page_id(page_id);
        frame.set_dirty(false);
        frame.set_pin_count(1);

        // Fill the frame while still holding the pool latch, so a
        // concurrent fetch of the same page cannot observe stale bytes.
        let read_result = {
            let mut data = frame.data_mut();
            core.disk.read_page(page_id, &mut data)
        };
        if let Err(e) = read_result {
            // Undo the installation; the frame goes back to the free list.
            core.page_table.remove(&page_id);
            frame.reset();
            core.free_list.push(frame_id);
            return Err(e.into());
        }

        Ok(Arc::clone(frame))
    }

    /// Drops one pin on `page_id`, OR-ing `mark_dirty` into its dirty bit.
    ///
    /// Returns `false` if the page is not resident or its pin count is
    /// already zero (a double unpin). When the last pin is released the
    /// frame becomes an eviction candidate.
    pub fn unpin_page(&self, page_id: PageId, mark_dirty: bool) -> bool {
        let mut core = self.core.lock();

        let Some(&frame_id) = core.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.index()];

        if frame.pin_count() == 0 {
            debug!(page_id = %page_id, "double unpin detected");
            return false;
        }
        if mark_dirty {
            // Monotonic: unpinning clean never clears a dirty bit.
            frame.set_dirty(true);
        }
        if frame.unpin() == 0 {
            core.replacer.unpin(frame_id);
        }
        true
    }

    /// Writes the page back to disk if resident, clearing its dirty bit.
    ///
    /// Returns `Ok(false)` when the page is not in the pool; `Ok(true)`
    /// when it is, whether or not a write was needed. Residency and pin
    /// state are untouched.
    ///
    /// # Panics
    ///
    /// Panics if called with [`PageId::INVALID`].
    pub fn flush_page(&self, page_id: PageId) -> BufferResult<bool> {
        assert!(page_id.is_valid(), "flush_page on invalid page id");

        let core = self.core.lock();
        let Some(&frame_id) = core.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id.index()];

        if frame.is_dirty() {
            core.disk.write_page(page_id, &frame.data())?;
            frame.set_dirty(false);
            self.flush_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    /// Allocates a fresh page and pins it in a zeroed frame.
    ///
    /// The new page starts **dirty** so that the allocation survives a
    /// flush even if the caller never writes to it. Fails with
    /// [`BufferError::PoolExhausted`] when every frame is pinned.
    pub fn new_page(&self) -> BufferResult<(PageId, Arc<BufferFrame>)> {
        let mut core = self.core.lock();

        let frame_id = self.take_frame(&mut core)?;
        let frame = &self.frames[frame_id.index()];
        let page_id = match core.disk.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                frame.reset();
                core.free_list.push(frame_id);
                return Err(e.into());
            }
        };

        core.page_table.insert(page_id, frame_id);
        core.replacer.pin(frame_id);
        frame.data_mut().fill(0);
        frame.set_page_id(page_id);
        frame.set_dirty(true);
        frame.set_pin_count(1);

        Ok((page_id, Arc::clone(frame)))
    }

    /// Removes `page_id` from the pool and deallocates it on disk.
    ///
    /// Returns `Ok(true)` if the page is gone afterwards (including the
    /// case where it was never resident) and `Ok(false)` if it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> BufferResult<bool> {
        let mut core = self.core.lock();

        let Some(&frame_id) = core.page_table.get(&page_id) else {
            return Ok(true);
        };
        let frame = &self.frames[frame_id.index()];
        if frame.is_pinned() {
            return Ok(false);
        }

        core.page_table.remove(&page_id);
        core.replacer.pin(frame_id);
        frame.reset();
        core.free_list.push(frame_id);
        core.disk.deallocate_page(page_id)?;
        Ok(true)
    }

    /// Flushes every resident dirty page.
    ///
    /// The resident set is snapshotted first, then each page is flushed
    /// with its own latch acquisition, so concurrent single-page
    /// operations are never blocked for the whole sweep.
    pub fn flush_all_pages(&self) -> BufferResult<()> {
        let resident: Vec<PageId> = {
            let core = self.core.lock();
            core.page_table.keys().copied().collect()
        };
        for page_id in resident {
            // A page evicted or deleted since the snapshot flushes as
            // "not found", which is fine here.
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns true if `page_id` is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.core.lock().page_table.contains_key(&page_id)
    }

    /// Returns the number of frames on the free list.
    pub fn free_list_len(&self) -> usize {
        self.core.lock().free_list.len()
    }

    /// Returns the number of eviction candidates in the replacer.
    pub fn replacer_size(&self) -> usize {
        self.core.lock().replacer.size()
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned = 0;
        let mut dirty = 0;
        for frame in &self.frames {
            if frame.is_pinned() {
                pinned += 1;
            }
            if frame.is_dirty() {
                dirty += 1;
            }
        }

        BufferPoolStats {
            fetches: self.fetch_count.load(Ordering::Relaxed),
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            evictions: self.eviction_count.load(Ordering::Relaxed),
            flushes: self.flush_count.load(Ordering::Relaxed),
            pinned_frames: pinned,
            dirty_frames: dirty,
        }
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    /// Produces a frame ready for reuse: free list first, then a replacer
    /// victim whose old page is written back if dirty and unmapped.
    fn take_frame(&self, core: &mut MutexGuard<'_, PoolCore>) -> BufferResult<FrameId> {
        if let Some(frame_id) = core.free_list.pop() {
            return Ok(frame_id);
        }

        let frame_id = core.replacer.victim().ok_or(BufferError::PoolExhausted)?;
        let frame = &self.frames[frame_id.index()];

        // The victim has pin_count 0, so no client holds its data latch.
        let old_page_id = frame.page_id();
        if old_page_id.is_valid() {
            if frame.is_dirty() {
                trace!(page_id = %old_page_id, frame_id = frame_id.index(), "evicting dirty page");
                core.disk.write_page(old_page_id, &frame.data())?;
                frame.set_dirty(false);
            }
            core.page_table.remove(&old_page_id);
            self.eviction_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(frame_id)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("num_frames", &self.config.num_frames)
            .field("page_size", &self.config.page_size)
            .field("resident", &self.core.lock().page_table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_pool(num_frames: usize) -> (tempfile::TempDir, BufferPool) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("pool.db")).unwrap();
        let pool = BufferPool::new(BufferPoolConfig::new(num_frames), disk).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_pool_creation() {
        let (_dir, pool) = create_pool(10);
        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_list_len(), 10);
        assert_eq!(pool.replacer_size(), 0);
    }

    #[test]
    fn test_new_page_is_pinned_and_dirty() {
        let (_dir, pool) = create_pool(4);
        let (pid, frame) = pool.new_page().unwrap();
        assert_eq!(pid, PageId::new(0));
        assert_eq!(frame.pin_count(), 1);
        assert!(frame.is_dirty());
        assert!(pool.contains(pid));
    }

    #[test]
    fn test_fetch_hit_pins_again() {
        let (_dir, pool) = create_pool(4);
        let (pid, frame) = pool.new_page().unwrap();

        let again = pool.fetch_page(pid).unwrap();
        assert_eq!(again.pin_count(), 2);
        assert_eq!(again.page_id(), frame.page_id());

        assert!(pool.unpin_page(pid, false));
        assert!(pool.unpin_page(pid, false));
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_unpin_not_resident() {
        let (_dir, pool) = create_pool(4);
        assert!(!pool.unpin_page(PageId::new(99), false));
    }

    #[test]
    fn test_double_unpin_detected() {
        let (_dir, pool) = create_pool(4);
        let (pid, _frame) = pool.new_page().unwrap();
        assert!(pool.unpin_page(pid, false));
        assert!(!pool.unpin_page(pid, false));
    }

    #[test]
    fn test_dirty_bit_is_monotonic() {
        let (_dir, pool) = create_pool(4);
        let (pid, frame) = pool.new_page().unwrap();
        pool.flush_page(pid).unwrap();
        assert!(!frame.is_dirty());

        let _ = pool.fetch_page(pid).unwrap();
        let _ = pool.fetch_page(pid).unwrap();
        assert!(pool.unpin_page(pid, true));
        // Unpinning clean must not clear the dirty bit set above.
        assert!(pool.unpin_page(pid, false));
        assert!(pool.unpin_page(pid, false));
        assert!(frame.is_dirty());
    }

    #[test]
    fn test_pool_exhausted_when_all_pinned() {
        let (_dir, pool) = create_pool(1);
        let (_pid, _frame) = pool.new_page().unwrap();
        // Still pinned: no victim available.
        let err = pool.new_page().unwrap_err();
        assert!(matches!(err, BufferError::PoolExhausted));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() {
        let (_dir, pool) = create_pool(2);

        let (p1, frame) = pool.new_page().unwrap();
        frame.data_mut()[0..3].copy_from_slice(b"abc");
        assert!(pool.unpin_page(p1, true));

        let (p2, _) = pool.new_page().unwrap();
        assert!(pool.unpin_page(p2, false));
        let (p3, _) = pool.new_page().unwrap();
        assert!(pool.unpin_page(p3, false));

        // p1 or p2 was evicted to make room for p3; either way p1's bytes
        // must survive a round trip.
        let frame = pool.fetch_page(p1).unwrap();
        assert_eq!(&frame.data()[0..3], b"abc");
        assert!(pool.unpin_page(p1, false));
    }

    #[test]
    fn test_flush_page_not_found() {
        let (_dir, pool) = create_pool(2);
        assert!(!pool.flush_page(PageId::new(123)).unwrap());
    }

    #[test]
    #[should_panic(expected = "invalid page id")]
    fn test_flush_invalid_page_id_panics() {
        let (_dir, pool) = create_pool(2);
        let _ = pool.flush_page(PageId::INVALID);
    }

    #[test]
    fn test_flush_clean_page_reports_found() {
        let (_dir, pool) = create_pool(2);
        let (pid, _frame) = pool.new_page().unwrap();
        assert!(pool.flush_page(pid).unwrap());
        // Second flush: page is clean but still resident.
        assert!(pool.flush_page(pid).unwrap());
    }

    #[test]
    fn test_delete_page() {
        let (_dir, pool) = create_pool(4);
        let (pid, _frame) = pool.new_page().unwrap();

        // Pinned pages cannot be deleted.
        assert!(!pool.delete_page(pid).unwrap());
        assert!(pool.unpin_page(pid, false));

        assert!(pool.delete_page(pid).unwrap());
        assert!(!pool.contains(pid));
        assert_eq!(pool.free_list_len(), 4);

        // Deleting a non-resident page is vacuously true.
        assert!(pool.delete_page(pid).unwrap());
    }

    #[test]
    fn test_deleted_page_id_is_reused() {
        let (_dir, pool) = create_pool(4);
        let (pid, _frame) = pool.new_page().unwrap();
        assert!(pool.unpin_page(pid, false));
        assert!(pool.delete_page(pid).unwrap());

        let (pid2, _frame) = pool.new_page().unwrap();
        assert_eq!(pid2, pid);
    }

    #[test]
    fn test_flush_all_pages() {
        let (_dir, pool) = create_pool(8);
        let mut pids = Vec::new();
        for i in 0..5u8 {
            let (pid, frame) = pool.new_page().unwrap();
            frame.data_mut()[0] = i;
            assert!(pool.unpin_page(pid, true));
            pids.push(pid);
        }

        pool.flush_all_pages().unwrap();
        assert_eq!(pool.stats().dirty_frames, 0);
    }

    #[test]
    fn test_stats_counters() {
        let (_dir, pool) = create_pool(4);
        let (pid, _frame) = pool.new_page().unwrap();
        let _ = pool.fetch_page(pid).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert!((stats.hit_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_page_size_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open_with_page_size(dir.path().join("pool.db"), 8192).unwrap();
        let result = BufferPool::new(BufferPoolConfig::new(4), disk);
        assert!(matches!(result, Err(BufferError::Config { .. })));
    }

    #[test]
    fn test_frame_partition_invariant() {
        // Every frame is in exactly one of: page table, free list,
        // replacer.
        let (_dir, pool) = create_pool(4);
        let (p0, _) = pool.new_page().unwrap();
        let (p1, _) = pool.new_page().unwrap();
        assert!(pool.unpin_page(p1, false));

        // p0 pinned (page table only), p1 unpinned (page table +
        // replacer), two frames free.
        assert_eq!(pool.free_list_len(), 2);
        assert_eq!(pool.replacer_size(), 1);
        let core = pool.core.lock();
        assert_eq!(core.page_table.len(), 2);
        assert!(core.page_table.contains_key(&p0));
        assert!(core.page_table.contains_key(&p1));
    }
}
