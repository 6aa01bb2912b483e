//! Linear-probing hash table over buffer-pool pages.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_common::types::PageId;
use parking_lot::RwLock;
use tracing::debug;

use super::block::{block_capacity, BlockPage, BlockPageRef};
use super::codec::FixedCodec;
use super::error::{IndexError, IndexResult};
use super::hash::{FnvHasher, KeyComparator, KeyHasher, OrdComparator};
use super::header::{DirectoryHeader, DirectoryHeaderRef};
use crate::buffer::{BufferFrame, BufferPool};

/// Directory state guarded by the table latch.
///
/// Readers (point operations) share it; resize is the only writer and
/// swaps in a whole new directory.
struct Directory {
    header_page_id: PageId,
    num_buckets: usize,
}

/// Outcome of one probe pass over the directory.
enum ProbeOutcome {
    Inserted,
    Duplicate,
    Exhausted,
}

/// A hash table of fixed-width `(key, value)` pairs, stored in
/// buffer-pool pages and probed linearly.
///
/// Keys may repeat; exact `(key, value)` duplicates are refused. The
/// supplied comparator decides key equality and the supplied hasher
/// picks the home bucket, so both must be stable for the lifetime of the
/// on-disk data.
///
/// # Latching
///
/// Latches nest directory → header → block, a thread holds at most one
/// block latch, and the header latch is never held while a block latch
/// is taken. Point operations share the directory latch; `resize` takes
/// it exclusively.
pub struct LinearProbeHashTable<K, V, C = OrdComparator, H = FnvHasher> {
    name: String,
    pool: Arc<BufferPool>,
    directory: RwLock<Directory>,
    num_entries: AtomicU64,
    comparator: C,
    hasher: H,
    /// Slots per block page, fixed by the page size and codec widths.
    block_capacity: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C, H> LinearProbeHashTable<K, V, C, H>
where
    K: FixedCodec,
    V: FixedCodec + PartialEq,
    C: KeyComparator<K>,
    H: KeyHasher<K>,
{
    /// Creates a fresh index with `num_buckets` buckets.
    ///
    /// Allocates one header page and `ceil(num_buckets / N)` zeroed
    /// block pages through the buffer pool.
    pub fn new(
        name: impl Into<String>,
        pool: Arc<BufferPool>,
        comparator: C,
        num_buckets: usize,
        hasher: H,
    ) -> IndexResult<Self> {
        let name = name.into();
        let block_capacity = block_capacity(pool.page_size(), K::WIDTH + V::WIDTH);
        let num_blocks = num_buckets.div_ceil(block_capacity).max(1);

        let (header_page_id, header) = pool.new_page()?;
        let max_blocks = {
            let data = header.data();
            DirectoryHeaderRef::new(&data).max_blocks()
        };
        if num_blocks > max_blocks {
            pool.unpin_page(header_page_id, false);
            pool.delete_page(header_page_id)?;
            return Err(IndexError::DirectoryFull {
                required: num_blocks,
                capacity: max_blocks,
            });
        }

        let block_ids = match Self::allocate_blocks(&pool, num_blocks) {
            Ok(ids) => ids,
            Err(e) => {
                pool.unpin_page(header_page_id, false);
                return Err(e);
            }
        };

        {
            let mut data = header.data_mut();
            let mut hdr = DirectoryHeader::new(&mut data);
            hdr.init(header_page_id);
            hdr.set_num_buckets(num_buckets as u64);
            for &block_page_id in &block_ids {
                hdr.add_block_page_id(block_page_id);
            }
        }
        pool.unpin_page(header_page_id, true);

        debug!(
            name = %name,
            header_page_id = %header_page_id,
            num_buckets,
            num_blocks,
            "created hash index"
        );

        Ok(Self {
            name,
            pool,
            directory: RwLock::new(Directory {
                header_page_id,
                num_buckets,
            }),
            num_entries: AtomicU64::new(0),
            comparator,
            hasher,
            block_capacity,
            _marker: PhantomData,
        })
    }

    /// Reopens an index from an existing header page.
    ///
    /// Bucket and entry counts are read back from the header; the page
    /// size, codec widths, and hash function must match the ones the
    /// index was created with.
    pub fn open(
        name: impl Into<String>,
        pool: Arc<BufferPool>,
        comparator: C,
        header_page_id: PageId,
        hasher: H,
    ) -> IndexResult<Self> {
        let name = name.into();
        let block_capacity = block_capacity(pool.page_size(), K::WIDTH + V::WIDTH);

        let header = pool.fetch_page(header_page_id)?;
        let parsed = {
            let data = header.data();
            let hdr = DirectoryHeaderRef::new(&data);
            if hdr.is_valid_magic() {
                Some((hdr.num_buckets() as usize, hdr.num_entries()))
            } else {
                None
            }
        };
        pool.unpin_page(header_page_id, false);

        let Some((num_buckets, num_entries)) = parsed else {
            return Err(IndexError::BadDirectory {
                page_id: header_page_id,
            });
        };

        debug!(
            name = %name,
            header_page_id = %header_page_id,
            num_buckets,
            num_entries,
            "opened hash index"
        );

        Ok(Self {
            name,
            pool,
            directory: RwLock::new(Directory {
                header_page_id,
                num_buckets,
            }),
            num_entries: AtomicU64::new(num_entries),
            comparator,
            hasher,
            block_capacity,
            _marker: PhantomData,
        })
    }

    /// Collects every value stored under `key`, in probe order.
    pub fn get_value(&self, key: &K) -> IndexResult<Vec<V>> {
        let dir = self.directory.read();
        let (header_page_id, num_buckets) = (dir.header_page_id, dir.num_buckets);
        let (header, block_ids) = self.load_directory(header_page_id)?;

        let mut result = Vec::new();
        let out = (|| -> IndexResult<()> {
            let mut bucket = self.home_bucket(key, num_buckets);
            for _ in 0..num_buckets {
                let block_page_id = block_ids[bucket / self.block_capacity];
                let slot = bucket % self.block_capacity;

                let block = self.pool.fetch_page(block_page_id)?;
                let stop = {
                    let data = block.data();
                    let view = BlockPageRef::<K, V>::new(&data);
                    if !view.is_occupied(slot) {
                        true
                    } else {
                        if view.is_readable(slot)
                            && self.comparator.matches(key, &view.key_at(slot))
                        {
                            result.push(view.value_at(slot));
                        }
                        false
                    }
                };
                self.pool.unpin_page(block_page_id, false);
                if stop {
                    break;
                }
                bucket = (bucket + 1) % num_buckets;
            }
            Ok(())
        })();

        drop(header);
        self.pool.unpin_page(header_page_id, false);
        out.map(|()| result)
    }

    /// Inserts `(key, value)`.
    ///
    /// Returns `Ok(false)` only when the exact pair is already present.
    /// A full table (or a probe exhausted by tombstones) triggers a
    /// resize and a retry, so a non-duplicate insert always lands.
    pub fn insert(&self, key: &K, value: &V) -> IndexResult<bool> {
        loop {
            let observed = {
                let dir = self.directory.read();
                let (header_page_id, num_buckets) = (dir.header_page_id, dir.num_buckets);

                if self.size() >= num_buckets {
                    num_buckets
                } else {
                    let (header, block_ids) = self.load_directory(header_page_id)?;
                    let outcome = self.probe_insert(&block_ids, num_buckets, key, value);
                    match outcome {
                        Ok(ProbeOutcome::Inserted) => {
                            self.num_entries.fetch_add(1, Ordering::Relaxed);
                            {
                                let mut data = header.data_mut();
                                DirectoryHeader::new(&mut data)
                                    .set_num_entries(self.num_entries.load(Ordering::Relaxed));
                            }
                            self.pool.unpin_page(header_page_id, true);
                            return Ok(true);
                        }
                        Ok(ProbeOutcome::Duplicate) => {
                            drop(header);
                            self.pool.unpin_page(header_page_id, false);
                            return Ok(false);
                        }
                        Ok(ProbeOutcome::Exhausted) => {
                            drop(header);
                            self.pool.unpin_page(header_page_id, false);
                            num_buckets
                        }
                        Err(e) => {
                            drop(header);
                            self.pool.unpin_page(header_page_id, false);
                            return Err(e);
                        }
                    }
                }
                // Directory read latch drops here, before the resize.
            };
            self.resize(observed)?;
        }
    }

    /// Removes the exact pair `(key, value)`.
    ///
    /// Returns `Ok(true)` if a pair was tombstoned, `Ok(false)` if it
    /// was not present.
    pub fn remove(&self, key: &K, value: &V) -> IndexResult<bool> {
        let dir = self.directory.read();
        let (header_page_id, num_buckets) = (dir.header_page_id, dir.num_buckets);
        let (header, block_ids) = self.load_directory(header_page_id)?;

        let removed = (|| -> IndexResult<bool> {
            let mut bucket = self.home_bucket(key, num_buckets);
            for _ in 0..num_buckets {
                let block_page_id = block_ids[bucket / self.block_capacity];
                let slot = bucket % self.block_capacity;

                let block = self.pool.fetch_page(block_page_id)?;
                enum Step {
                    Stop,
                    Removed,
                    Continue,
                }
                let step = {
                    let mut data = block.data_mut();
                    let mut view = BlockPage::<K, V>::new(&mut data);
                    if !view.is_occupied(slot) {
                        Step::Stop
                    } else if view.is_readable(slot)
                        && self.comparator.matches(key, &view.key_at(slot))
                        && view.value_at(slot) == *value
                    {
                        view.remove(slot);
                        Step::Removed
                    } else {
                        Step::Continue
                    }
                };
                match step {
                    Step::Stop => {
                        self.pool.unpin_page(block_page_id, false);
                        return Ok(false);
                    }
                    Step::Removed => {
                        self.pool.unpin_page(block_page_id, true);
                        return Ok(true);
                    }
                    Step::Continue => {
                        self.pool.unpin_page(block_page_id, false);
                    }
                }
                bucket = (bucket + 1) % num_buckets;
            }
            Ok(false)
        })();

        match removed {
            Ok(true) => {
                self.num_entries.fetch_sub(1, Ordering::Relaxed);
                {
                    let mut data = header.data_mut();
                    DirectoryHeader::new(&mut data)
                        .set_num_entries(self.num_entries.load(Ordering::Relaxed));
                }
                self.pool.unpin_page(header_page_id, true);
                Ok(true)
            }
            other => {
                drop(header);
                self.pool.unpin_page(header_page_id, false);
                other
            }
        }
    }

    /// Grows the directory to at least `2 * observed_size` buckets.
    ///
    /// `observed_size` is the size the caller saw when it decided to
    /// resize; if a concurrent resize already grew past that, this call
    /// returns without work. All live pairs are re-homed into a fresh
    /// directory and the old pages are deleted.
    pub fn resize(&self, observed_size: usize) -> IndexResult<()> {
        let mut dir = self.directory.write();

        let new_num_buckets = observed_size.max(1) * 2;
        if new_num_buckets <= dir.num_buckets {
            // Another writer already resized past the observed size.
            return Ok(());
        }
        let old_header_page_id = dir.header_page_id;

        let (old_header, old_block_ids) = self.load_directory(old_header_page_id)?;
        drop(old_header);
        self.pool.unpin_page(old_header_page_id, false);

        // Build the new directory.
        let num_blocks = new_num_buckets.div_ceil(self.block_capacity);
        let (new_header_page_id, new_header) = self.pool.new_page()?;
        let max_blocks = {
            let data = new_header.data();
            DirectoryHeaderRef::new(&data).max_blocks()
        };
        if num_blocks > max_blocks {
            self.pool.unpin_page(new_header_page_id, false);
            self.pool.delete_page(new_header_page_id)?;
            return Err(IndexError::DirectoryFull {
                required: num_blocks,
                capacity: max_blocks,
            });
        }

        let new_block_ids = match Self::allocate_blocks(&self.pool, num_blocks) {
            Ok(ids) => ids,
            Err(e) => {
                self.pool.unpin_page(new_header_page_id, false);
                return Err(e);
            }
        };
        {
            let mut data = new_header.data_mut();
            let mut hdr = DirectoryHeader::new(&mut data);
            hdr.init(new_header_page_id);
            hdr.set_num_buckets(new_num_buckets as u64);
            for &block_page_id in &new_block_ids {
                hdr.add_block_page_id(block_page_id);
            }
        }

        // Swap the directory in, then migrate the old pairs into it.
        dir.header_page_id = new_header_page_id;
        dir.num_buckets = new_num_buckets;

        let mut migrated = 0u64;
        for &old_block_page_id in &old_block_ids {
            let block = self.pool.fetch_page(old_block_page_id)?;
            let pairs: Vec<(K, V)> = {
                let data = block.data();
                let view = BlockPageRef::<K, V>::new(&data);
                (0..view.capacity())
                    .filter(|&i| view.is_readable(i))
                    .map(|i| (view.key_at(i), view.value_at(i)))
                    .collect()
            };
            self.pool.unpin_page(old_block_page_id, false);

            for (key, value) in pairs {
                let outcome =
                    self.probe_insert(&new_block_ids, new_num_buckets, &key, &value)?;
                debug_assert!(matches!(outcome, ProbeOutcome::Inserted));
                migrated += 1;
            }
            self.pool.delete_page(old_block_page_id)?;
        }
        self.pool.delete_page(old_header_page_id)?;

        self.num_entries.store(migrated, Ordering::Relaxed);
        {
            let mut data = new_header.data_mut();
            DirectoryHeader::new(&mut data).set_num_entries(migrated);
        }
        self.pool.unpin_page(new_header_page_id, true);

        debug!(
            name = %self.name,
            old_header_page_id = %old_header_page_id,
            new_header_page_id = %new_header_page_id,
            new_num_buckets,
            migrated,
            "resized hash index"
        );
        Ok(())
    }

    /// Returns the number of live pairs.
    pub fn size(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed) as usize
    }

    /// Returns the current bucket count.
    pub fn num_buckets(&self) -> usize {
        self.directory.read().num_buckets
    }

    /// Returns the page id of the current directory header.
    ///
    /// A resize swaps in a fresh header page, so re-read this before
    /// persisting a reference to the index.
    pub fn header_page_id(&self) -> PageId {
        self.directory.read().header_page_id
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the per-block slot capacity.
    pub fn block_slot_capacity(&self) -> usize {
        self.block_capacity
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    /// Allocates `n` zeroed block pages, unpinned and marked dirty so
    /// their empty bitmaps persist.
    fn allocate_blocks(pool: &BufferPool, n: usize) -> IndexResult<Vec<PageId>> {
        let mut block_ids = Vec::with_capacity(n);
        for _ in 0..n {
            // new_page zeroes the frame, so both bitmaps start clear.
            let (block_page_id, _block) = pool.new_page()?;
            pool.unpin_page(block_page_id, true);
            block_ids.push(block_page_id);
        }
        Ok(block_ids)
    }

    #[inline]
    fn home_bucket(&self, key: &K, num_buckets: usize) -> usize {
        (self.hasher.hash_key(key) % num_buckets as u64) as usize
    }

    /// Fetches the header page and copies out the block id array.
    ///
    /// The header frame stays pinned; the caller owns exactly one unpin.
    fn load_directory(
        &self,
        header_page_id: PageId,
    ) -> IndexResult<(Arc<BufferFrame>, Vec<PageId>)> {
        let header = self.pool.fetch_page(header_page_id)?;
        let block_ids = {
            let data = header.data();
            DirectoryHeaderRef::new(&data).block_page_ids()
        };
        Ok((header, block_ids))
    }

    /// One probe pass trying to place `(key, value)`.
    ///
    /// Pins and write-latches one block page at a time. Does not touch
    /// the entry count; the caller settles accounting.
    fn probe_insert(
        &self,
        block_ids: &[PageId],
        num_buckets: usize,
        key: &K,
        value: &V,
    ) -> IndexResult<ProbeOutcome> {
        let mut bucket = self.home_bucket(key, num_buckets);
        for _ in 0..num_buckets {
            let block_page_id = block_ids[bucket / self.block_capacity];
            let slot = bucket % self.block_capacity;

            let block = self.pool.fetch_page(block_page_id)?;
            enum Step {
                Inserted,
                Duplicate,
                Continue,
            }
            let step = {
                let mut data = block.data_mut();
                let mut view = BlockPage::<K, V>::new(&mut data);
                if view.is_readable(slot)
                    && self.comparator.matches(key, &view.key_at(slot))
                    && view.value_at(slot) == *value
                {
                    Step::Duplicate
                } else if view.insert(slot, key, value) {
                    Step::Inserted
                } else {
                    Step::Continue
                }
            };
            match step {
                Step::Inserted => {
                    self.pool.unpin_page(block_page_id, true);
                    return Ok(ProbeOutcome::Inserted);
                }
                Step::Duplicate => {
                    self.pool.unpin_page(block_page_id, false);
                    return Ok(ProbeOutcome::Duplicate);
                }
                Step::Continue => {
                    self.pool.unpin_page(block_page_id, false);
                }
            }
            bucket = (bucket + 1) % num_buckets;
        }
        Ok(ProbeOutcome::Exhausted)
    }
}

impl<K, V, C, H> std::fmt::Debug for LinearProbeHashTable<K, V, C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dir = self.directory.read();
        f.debug_struct("LinearProbeHashTable")
            .field("name", &self.name)
            .field("header_page_id", &dir.header_page_id)
            .field("num_buckets", &dir.num_buckets)
            .field("num_entries", &self.num_entries.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolConfig;
    use crate::disk::DiskManager;
    use tempfile::tempdir;

    type IntTable = LinearProbeHashTable<i32, i32>;

    fn create_pool(num_frames: usize) -> (tempfile::TempDir, Arc<BufferPool>) {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(dir.path().join("index.db")).unwrap();
        let pool = BufferPool::new(BufferPoolConfig::new(num_frames), disk).unwrap();
        (dir, Arc::new(pool))
    }

    fn create_table(pool: &Arc<BufferPool>, num_buckets: usize) -> IntTable {
        IntTable::new(
            "test",
            Arc::clone(pool),
            OrdComparator,
            num_buckets,
            FnvHasher,
        )
        .unwrap()
    }

    #[test]
    fn test_new_table_is_empty() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 1000);
        assert_eq!(table.size(), 0);
        assert_eq!(table.num_buckets(), 1000);
        assert!(table.get_value(&1).unwrap().is_empty());
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 1000);

        assert!(table.insert(&1, &10).unwrap());
        assert_eq!(table.size(), 1);
        assert_eq!(table.get_value(&1).unwrap(), vec![10]);
        assert!(table.get_value(&2).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_pair_refused() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 1000);

        assert!(table.insert(&1, &10).unwrap());
        assert!(!table.insert(&1, &10).unwrap());
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn test_non_unique_keys() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 1000);

        assert!(table.insert(&1, &10).unwrap());
        assert!(table.insert(&1, &20).unwrap());
        let mut values = table.get_value(&1).unwrap();
        values.sort_unstable();
        assert_eq!(values, vec![10, 20]);
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn test_remove() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 1000);

        assert!(table.insert(&1, &10).unwrap());
        assert!(table.insert(&1, &20).unwrap());

        assert!(table.remove(&1, &10).unwrap());
        assert_eq!(table.get_value(&1).unwrap(), vec![20]);
        assert_eq!(table.size(), 1);

        // Removing again misses.
        assert!(!table.remove(&1, &10).unwrap());
        // Removing an absent key misses without probing far.
        assert!(!table.remove(&99, &99).unwrap());
    }

    #[test]
    fn test_probe_wraps_and_terminates() {
        let (_dir, pool) = create_pool(16);
        // Tiny directory: every bucket collides quickly.
        let table = create_table(&pool, 8);

        for i in 0..8 {
            assert!(table.insert(&i, &i).unwrap());
        }
        for i in 0..8 {
            assert_eq!(table.get_value(&i).unwrap(), vec![i]);
        }
    }

    #[test]
    fn test_insert_past_full_resizes() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 4);

        for i in 0..32 {
            assert!(table.insert(&i, &i).unwrap());
        }
        assert_eq!(table.size(), 32);
        assert!(table.num_buckets() >= 32);
        for i in 0..32 {
            assert_eq!(table.get_value(&i).unwrap(), vec![i]);
        }
    }

    #[test]
    fn test_tombstones_do_not_hide_entries() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 64);

        for i in 0..40 {
            assert!(table.insert(&i, &i).unwrap());
        }
        for i in 0..20 {
            assert!(table.remove(&i, &i).unwrap());
        }
        for i in 20..40 {
            assert_eq!(table.get_value(&i).unwrap(), vec![i], "key {i}");
        }
        assert_eq!(table.size(), 20);
    }

    #[test]
    fn test_resize_preserves_pairs() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 100);

        for i in 0..50 {
            assert!(table.insert(&i, &(i * 3)).unwrap());
        }
        let before = table.header_page_id();
        table.resize(100).unwrap();
        assert_ne!(table.header_page_id(), before);
        assert_eq!(table.num_buckets(), 200);
        assert_eq!(table.size(), 50);
        for i in 0..50 {
            assert_eq!(table.get_value(&i).unwrap(), vec![i * 3]);
        }
    }

    #[test]
    fn test_resize_with_stale_observation_is_noop() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 100);
        let header = table.header_page_id();

        // 2 * 10 <= 100: another resize "already happened".
        table.resize(10).unwrap();
        assert_eq!(table.num_buckets(), 100);
        assert_eq!(table.header_page_id(), header);
    }

    #[test]
    fn test_open_restores_counts() {
        let (_dir, pool) = create_pool(16);
        let table = create_table(&pool, 500);
        for i in 0..25 {
            assert!(table.insert(&i, &i).unwrap());
        }
        let header = table.header_page_id();
        drop(table);

        let reopened =
            IntTable::open("test", Arc::clone(&pool), OrdComparator, header, FnvHasher).unwrap();
        assert_eq!(reopened.num_buckets(), 500);
        assert_eq!(reopened.size(), 25);
        for i in 0..25 {
            assert_eq!(reopened.get_value(&i).unwrap(), vec![i]);
        }
    }

    #[test]
    fn test_open_rejects_non_directory_page() {
        let (_dir, pool) = create_pool(16);
        let (page_id, frame) = pool.new_page().unwrap();
        frame.data_mut()[0..2].copy_from_slice(&[0xAA, 0xBB]);
        pool.unpin_page(page_id, true);

        let result = IntTable::open("bad", Arc::clone(&pool), OrdComparator, page_id, FnvHasher);
        assert!(matches!(result, Err(IndexError::BadDirectory { .. })));
    }

    #[test]
    fn test_index_leaves_no_pins_behind() {
        let (_dir, pool) = create_pool(8);
        let table = create_table(&pool, 200);

        for i in 0..100 {
            assert!(table.insert(&i, &i).unwrap());
        }
        for i in 0..100 {
            let _ = table.get_value(&i).unwrap();
        }
        for i in 0..10 {
            assert!(table.remove(&i, &i).unwrap());
        }

        assert_eq!(pool.stats().pinned_frames, 0);
    }
}
