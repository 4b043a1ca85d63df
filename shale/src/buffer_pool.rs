//! The buffer pool: a fixed set of in-memory frames caching disk pages.
//!
//! The pool owns pages by id; callers hold lightweight RAII pins
//! (`PageGuard`) and pages never point back at the pool. Flushes obey the
//! WAL rule (the log is forced through the page LSN before the page image
//! is written), eviction is NO-STEAL (a frame dirtied by a live
//! transaction is never written out from under it), and the first write
//! access after a clean state preserves the page's before-image.

use crate::error::PoolError;
use crate::failpoint;
use crate::lock_manager::{LockError, LockManager, LockMode};
use crate::pager::DiskManager;
use crate::wal::WalWriter;
use crate::{Lsn, Page, PageId, TxnId, INVALID_TXN_ID, PAGE_SIZE};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_POOL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug)]
struct FrameMeta {
    page_id: Option<PageId>,
    is_dirty: bool,
    pin_count: u32,
    recently_used: bool,
    /// Transaction whose uncommitted write dirtied the frame, or
    /// `INVALID_TXN_ID` once the dirtier finished (or for recovery
    /// writes).
    dirtier: TxnId,
    /// Page image preserved before the first modification since the last
    /// clean state.
    before_image: Option<Box<[u8; PAGE_SIZE]>>,
}

impl FrameMeta {
    fn empty() -> Self {
        Self {
            page_id: None,
            is_dirty: false,
            pin_count: 0,
            recently_used: false,
            dirtier: INVALID_TXN_ID,
            before_image: None,
        }
    }
}

struct Frame {
    page: RwLock<Page>,
    meta: Mutex<FrameMeta>,
}

/// The buffer pool manager.
pub struct BufferPool {
    disk: Mutex<DiskManager>,
    wal: Arc<WalWriter>,
    locks: Arc<LockManager>,
    frames: Vec<Arc<Frame>>,
    page_table: RwLock<HashMap<PageId, usize>>,
    clock_hand: Mutex<usize>,
}

/// An RAII pin on a resident page.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame: Arc<Frame>,
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .finish()
    }
}

impl PageGuard<'_> {
    pub fn id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    /// Grants mutable access. The first write access after the last clean
    /// state captures the page's before-image.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        let page = self.frame.page.write();
        let mut meta = self.frame.meta.lock();
        if !meta.is_dirty && meta.before_image.is_none() {
            meta.before_image = Some(Box::new(page.data));
        }
        page
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin(&self.frame);
    }
}

impl BufferPool {
    pub fn new(
        disk: DiskManager,
        wal: Arc<WalWriter>,
        locks: Arc<LockManager>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let mut frames = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new(PageId::new(0, 0))),
                meta: Mutex::new(FrameMeta::empty()),
            }));
        }
        Self {
            disk: Mutex::new(disk),
            wal,
            locks,
            frames,
            page_table: RwLock::new(HashMap::new()),
            clock_hand: Mutex::new(0),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Registers a new backing file with the catalog.
    pub fn register_file<P: AsRef<std::path::Path>>(&self, file_id: u64, path: P) {
        self.disk.lock().register_file(file_id, path);
    }

    /// Returns a pinned page after acquiring the page lock in the
    /// requested mode through the lock manager. Blocks while conflicting
    /// holders run.
    pub fn get_page(
        &self,
        txn: TxnId,
        page_id: PageId,
        mode: AccessMode,
    ) -> Result<PageGuard<'_>, PoolError> {
        let lock_mode = match mode {
            AccessMode::Read => LockMode::Shared,
            AccessMode::Write => LockMode::Exclusive,
        };
        self.locks
            .acquire(txn, page_id, lock_mode)
            .map_err(|LockError::Deadlock| PoolError::Deadlock(page_id))?;
        self.fetch_page(page_id)
    }

    /// Pins a page without lock-manager involvement. Recovery runs
    /// single-threaded before the engine accepts work and uses this path.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>, PoolError> {
        // Fast path: already resident.
        {
            let page_table = self.page_table.read();
            if let Some(&idx) = page_table.get(&page_id) {
                let frame = self.frames[idx].clone();
                self.pin(&frame);
                return Ok(PageGuard {
                    pool: self,
                    page_id,
                    frame,
                });
            }
        }

        // Miss: serialize loads under the table write lock.
        let mut page_table = self.page_table.write();
        if let Some(&idx) = page_table.get(&page_id) {
            let frame = self.frames[idx].clone();
            self.pin(&frame);
            return Ok(PageGuard {
                pool: self,
                page_id,
                frame,
            });
        }

        let idx = self.find_victim().ok_or(PoolError::NoFreeFrames)?;
        let frame = self.frames[idx].clone();

        // Write out the old occupant if it is dirty (its dirtier has
        // finished, or NO-STEAL would have skipped the frame).
        let evicted = {
            let meta = frame.meta.lock();
            meta.page_id
        };
        if let Some(old_id) = evicted {
            page_table.remove(&old_id);
            let needs_write = frame.meta.lock().is_dirty;
            if needs_write {
                let image = frame.page.read().clone();
                self.wal.force(image.page_lsn())?;
                self.disk.lock().write_page(&image)?;
                self.wal.page_flushed(old_id);
            }
        }

        let loaded = self.disk.lock().read_page(page_id)?;
        {
            let mut page = frame.page.write();
            *page = loaded;
        }
        {
            let mut meta = frame.meta.lock();
            *meta = FrameMeta::empty();
            meta.page_id = Some(page_id);
            meta.pin_count = 1;
            meta.recently_used = true;
        }
        page_table.insert(page_id, idx);

        Ok(PageGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Allocates a fresh page in `file_id` and pins it.
    pub fn new_page(&self, file_id: u64) -> Result<PageGuard<'_>, PoolError> {
        let page_id = self.disk.lock().allocate_page(file_id)?;
        self.fetch_page(page_id)
    }

    /// Stamps the page LSN and records `txn` as the dirtier.
    pub fn mark_dirty(&self, guard: &PageGuard<'_>, txn: TxnId, new_page_lsn: Lsn) {
        {
            let mut page = guard.frame.page.write();
            page.set_page_lsn(new_page_lsn);
        }
        let mut meta = guard.frame.meta.lock();
        meta.is_dirty = true;
        meta.dirtier = txn;
    }

    /// Flushes one page, honoring the WAL rule: the log is forced through
    /// the page's LSN before the image goes to disk.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), PoolError> {
        let frame = {
            let page_table = self.page_table.read();
            let Some(&idx) = page_table.get(&page_id) else {
                return Ok(());
            };
            self.frames[idx].clone()
        };

        if !frame.meta.lock().is_dirty {
            return Ok(());
        }
        let image = frame.page.read().clone();
        self.wal.force(image.page_lsn())?;
        failpoint::maybe_fail("pool.flush.before_page")?;
        self.disk.lock().write_page(&image)?;

        let mut meta = frame.meta.lock();
        meta.is_dirty = false;
        meta.dirtier = INVALID_TXN_ID;
        meta.before_image = None;
        drop(meta);
        self.wal.page_flushed(page_id);
        Ok(())
    }

    /// Drops a page from the pool. Refuses while the page is pinned or
    /// dirtied by a live transaction (NO-STEAL); a dirty page whose
    /// dirtier finished is written out first.
    pub fn evict_page(&self, page_id: PageId) -> Result<(), PoolError> {
        let mut page_table = self.page_table.write();
        let Some(&idx) = page_table.get(&page_id) else {
            return Ok(());
        };
        let frame = self.frames[idx].clone();

        {
            let meta = frame.meta.lock();
            if meta.pin_count > 0 {
                return Err(PoolError::NoFreeFrames);
            }
            if meta.is_dirty && meta.dirtier != INVALID_TXN_ID {
                return Err(PoolError::NoFreeFrames);
            }
        }
        if frame.meta.lock().is_dirty {
            let image = frame.page.read().clone();
            self.wal.force(image.page_lsn())?;
            self.disk.lock().write_page(&image)?;
            self.wal.page_flushed(page_id);
        }

        page_table.remove(&page_id);
        *frame.meta.lock() = FrameMeta::empty();
        Ok(())
    }

    pub fn flush_all(&self) -> Result<(), PoolError> {
        let resident: Vec<PageId> = self.page_table.read().keys().copied().collect();
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Pages currently dirtied by `txn` and not yet flushed. FORCE commit
    /// flushes exactly these after the commit record is durable.
    pub fn pages_dirtied_by(&self, txn: TxnId) -> Vec<PageId> {
        let mut pages = Vec::new();
        for frame in &self.frames {
            let meta = frame.meta.lock();
            if meta.is_dirty && meta.dirtier == txn {
                if let Some(page_id) = meta.page_id {
                    pages.push(page_id);
                }
            }
        }
        pages
    }

    /// The dirtier finished without flushing (aborted chains end this
    /// way); its frames stay dirty but become evictable.
    pub fn release_dirtier(&self, txn: TxnId) {
        for frame in &self.frames {
            let mut meta = frame.meta.lock();
            if meta.dirtier == txn {
                meta.dirtier = INVALID_TXN_ID;
            }
        }
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        let page_table = self.page_table.read();
        page_table
            .get(&page_id)
            .map(|&idx| self.frames[idx].meta.lock().is_dirty)
            .unwrap_or(false)
    }

    /// The image preserved before the page's first modification since the
    /// last clean state, if any.
    pub fn preserved_before_image(&self, page_id: PageId) -> Option<Vec<u8>> {
        let page_table = self.page_table.read();
        let &idx = page_table.get(&page_id)?;
        self.frames[idx]
            .meta
            .lock()
            .before_image
            .as_ref()
            .map(|img| img.to_vec())
    }

    fn pin(&self, frame: &Arc<Frame>) {
        let mut meta = frame.meta.lock();
        meta.pin_count += 1;
        meta.recently_used = true;
    }

    fn unpin(&self, frame: &Arc<Frame>) {
        let mut meta = frame.meta.lock();
        if meta.pin_count > 0 {
            meta.pin_count -= 1;
        }
    }

    /// Clock sweep. A frame is a candidate when it is unpinned and not
    /// dirtied by a live transaction (NO-STEAL).
    fn find_victim(&self) -> Option<usize> {
        let frame_count = self.frames.len();
        let mut clock_hand = self.clock_hand.lock();

        // Two full passes: the first clears second-chance bits, the
        // second can pick a victim.
        for _ in 0..(frame_count * 2) {
            let idx = *clock_hand;
            *clock_hand = (*clock_hand + 1) % frame_count;

            let mut meta = self.frames[idx].meta.lock();
            if meta.pin_count != 0 {
                continue;
            }
            if meta.is_dirty && meta.dirtier != INVALID_TXN_ID {
                continue;
            }
            if meta.recently_used {
                meta.recently_used = false;
                continue;
            }
            return Some(idx);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::FileCatalog;
    use tempfile::tempdir;

    fn pool_with_capacity(dir: &std::path::Path, capacity: usize) -> BufferPool {
        let mut catalog = FileCatalog::new();
        catalog.register(1, dir.join("t.dat"));
        let disk = DiskManager::new(catalog);
        let wal = Arc::new(WalWriter::open(dir.join("wal.log"), 4096).unwrap());
        BufferPool::new(disk, wal, Arc::new(LockManager::new()), capacity)
    }

    #[test]
    fn write_access_preserves_the_before_image_once() {
        let dir = tempdir().unwrap();
        let pool = pool_with_capacity(dir.path(), 4);
        let page_id = PageId::new(1, 0);

        let guard = pool.fetch_page(page_id).unwrap();
        let original = guard.read().data.to_vec();
        {
            let mut page = guard.write();
            page.insert_record(b"first").unwrap();
        }
        pool.mark_dirty(&guard, 9, 100);
        {
            let mut page = guard.write();
            page.insert_record(b"second").unwrap();
        }

        let preserved = pool.preserved_before_image(page_id).unwrap();
        assert_eq!(preserved, original, "image predates the first write");
    }

    #[test]
    fn flush_forces_the_wal_through_the_page_lsn() {
        let dir = tempdir().unwrap();
        let pool = pool_with_capacity(dir.path(), 4);
        let page_id = PageId::new(1, 0);

        let lsn = {
            let wal = pool.wal.clone();
            wal.log_begin(5).unwrap();
            let guard = pool.fetch_page(page_id).unwrap();
            let before = guard.read().data.to_vec();
            guard.write().insert_record(b"durable").unwrap();
            let after = guard.read().data.to_vec();
            let lsn = wal.log_update(5, page_id, before, after).unwrap();
            pool.mark_dirty(&guard, 5, lsn);
            lsn
        };

        assert!(pool.wal.durable_lsn() <= lsn);
        pool.flush_page(page_id).unwrap();
        assert!(pool.wal.durable_lsn() > lsn, "WAL rule: log first");
        assert!(!pool.is_dirty(page_id));

        let (_, dpt) = pool.wal.snapshot_tables();
        assert!(!dpt.contains_key(&page_id));
    }

    #[test]
    fn no_steal_refuses_to_evict_uncommitted_pages() {
        let dir = tempdir().unwrap();
        let pool = pool_with_capacity(dir.path(), 2);

        // Dirty both frames on behalf of a live transaction.
        for n in 0..2u64 {
            let guard = pool.fetch_page(PageId::new(1, n)).unwrap();
            guard.write().insert_record(b"keep").unwrap();
            pool.mark_dirty(&guard, 7, 10 + n);
        }

        let err = pool.fetch_page(PageId::new(1, 5)).unwrap_err();
        assert!(matches!(err, PoolError::NoFreeFrames));

        // Once the dirtier finishes, the frames become fair game.
        pool.release_dirtier(7);
        assert!(pool.fetch_page(PageId::new(1, 5)).is_ok());
    }

    #[test]
    fn eviction_of_committed_dirty_page_writes_it_out() {
        let dir = tempdir().unwrap();
        let pool = pool_with_capacity(dir.path(), 1);
        let victim = PageId::new(1, 0);

        {
            let guard = pool.fetch_page(victim).unwrap();
            guard.write().insert_record(b"spilled").unwrap();
            pool.mark_dirty(&guard, INVALID_TXN_ID, 50);
        }
        // Loading another page evicts the dirty-but-unowned victim.
        let _other = pool.fetch_page(PageId::new(1, 3)).unwrap();

        let reread = pool.fetch_page(victim).unwrap();
        assert_eq!(reread.read().read_record(0).unwrap(), b"spilled");
    }

    #[test]
    fn explicit_eviction_respects_pins_and_no_steal() {
        let dir = tempdir().unwrap();
        let pool = pool_with_capacity(dir.path(), 4);
        let page_id = PageId::new(1, 0);

        let held = pool.fetch_page(page_id).unwrap();
        assert!(matches!(
            pool.evict_page(page_id),
            Err(PoolError::NoFreeFrames)
        ));

        held.write().insert_record(b"mine").unwrap();
        pool.mark_dirty(&held, 3, 40);
        drop(held);
        // Unpinned but still owned by a live transaction.
        assert!(matches!(
            pool.evict_page(page_id),
            Err(PoolError::NoFreeFrames)
        ));

        pool.release_dirtier(3);
        pool.evict_page(page_id).unwrap();
        // The eviction wrote the page out, so the record survives.
        let reread = pool.fetch_page(page_id).unwrap();
        assert_eq!(reread.read().read_record(0).unwrap(), b"mine");
    }

    #[test]
    fn pinned_pages_are_never_victims() {
        let dir = tempdir().unwrap();
        let pool = pool_with_capacity(dir.path(), 1);

        let _held = pool.fetch_page(PageId::new(1, 0)).unwrap();
        let err = pool.fetch_page(PageId::new(1, 1)).unwrap_err();
        assert!(matches!(err, PoolError::NoFreeFrames));
        drop(_held);
        assert!(pool.fetch_page(PageId::new(1, 1)).is_ok());
    }
}
