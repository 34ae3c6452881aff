//! Batch contexts: the copy-on-write boundary every page mutation goes through.
//!
//! Grounded in the teacher's `ReadTxn`/`WriteTxn` split and its `IdTracker`/`PageReadTracker`
//! pair for batch-id bookkeeping, adapted from the teacher's mpsc-channel-based page
//! rent/return protocol to a single-writer, synchronous `HashMap<DbAddress, Page>` write-back
//! cache - this engine allows only one writer batch at a time (see [`crate::root::Chain`]'s
//! `batch_lock`), so there's no need for the teacher's cross-thread channel plumbing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{DbError, DbResult};
use crate::manager::PageManager;
use crate::page::{Page, PageHeader, PageType};
use crate::root::AbandonedList;
use crate::tracking::IdTracker;
use crate::DbAddress;

/// Common read surface shared by [`ReadBatch`] and [`WriteBatch`], so tree-walking code that
/// only needs to read pages can work against either without caring which kind of batch it got.
pub trait PageSource {
    fn get_at(&self, addr: DbAddress) -> DbResult<Page>;
}

impl PageSource for ReadBatch {
    fn get_at(&self, addr: DbAddress) -> DbResult<Page> {
        ReadBatch::get_at(self, addr)
    }
}

impl PageSource for WriteBatch {
    fn get_at(&self, addr: DbAddress) -> DbResult<Page> {
        WriteBatch::get_at(self, addr)
    }
}

/// A read-only view of the database as of a specific batch id. Multiple `ReadBatch`es can be
/// outstanding concurrently; none of them ever block a writer, and a writer never blocks them -
/// each simply sees whatever `batch_id` it was handed at construction time. Checks itself out of
/// the owning [`IdTracker`] on construction and back in on drop, which is what lets
/// [`crate::root::Chain`] compute a safe `min_live_batch_id` for reclaiming abandoned pages.
pub struct ReadBatch {
    batch_id: u32,
    manager: Arc<dyn PageManager>,
    tracker: Arc<Mutex<IdTracker>>,
}

impl ReadBatch {
    pub(crate) fn new(batch_id: u32, manager: Arc<dyn PageManager>, tracker: Arc<Mutex<IdTracker>>) -> Self {
        tracker.lock().unwrap().checkout(batch_id);
        Self { batch_id, manager, tracker }
    }

    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }

    /// Fetch the page at `addr`. Fails with [`DbError::StaleRead`] if the page has since been
    /// overwritten by a batch newer than this reader's snapshot - that would mean the reader's
    /// snapshot has been reclaimed out from under it, which should never happen as long as the
    /// chain's min-live-batch-id bookkeeping is holding the page alive.
    pub fn get_at(&self, addr: DbAddress) -> DbResult<Page> {
        if addr.is_null() {
            return Err(DbError::CorruptedPage { addr, reason: "attempted to read the null address" });
        }
        let page = self.manager.get_at(addr)?;
        let header = page.header();
        if header.batch_id > self.batch_id {
            return Err(DbError::StaleRead { addr, page_batch_id: header.batch_id, reader_batch_id: self.batch_id });
        }
        Ok(page)
    }

    /// Hint that `addr` will likely be read soon. The in-memory and mmap-backed managers both
    /// resolve pages synchronously, so there's nothing to prefetch; kept for symmetry with the
    /// external `PageManager` contract and in case a future manager benefits from it.
    pub fn prefetch(&self, _addr: DbAddress) {}
}

impl Drop for ReadBatch {
    fn drop(&mut self) {
        self.tracker.lock().unwrap().checkin(self.batch_id);
    }
}

/// A single writer batch: the only place new pages get allocated or existing ones copied
/// forward. At most one `WriteBatch` exists at a time (enforced by [`crate::root::Chain`]'s
/// `batch_lock`).
pub struct WriteBatch {
    batch_id: u32,
    min_live_batch_id: u32,
    manager: Arc<dyn PageManager>,
    next_free_page: DbAddress,
    dirty: HashMap<DbAddress, Page>,
    abandoned_list: AbandonedList,
    /// Pages released this batch that are safe to reuse immediately (their prior contents were
    /// never visible outside this same batch).
    immediate_free: Vec<DbAddress>,
    /// Pages released this batch that must wait for `min_live_batch_id` to pass this batch's id
    /// before they're safe to recycle. Folded into `abandoned_list` at commit time.
    pending_abandon: Vec<DbAddress>,
}

impl WriteBatch {
    pub(crate) fn new(
        batch_id: u32,
        min_live_batch_id: u32,
        manager: Arc<dyn PageManager>,
        next_free_page: DbAddress,
        abandoned_list: AbandonedList,
    ) -> Self {
        Self {
            batch_id,
            min_live_batch_id,
            manager,
            next_free_page,
            dirty: HashMap::new(),
            abandoned_list,
            immediate_free: Vec::new(),
            pending_abandon: Vec::new(),
        }
    }

    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }

    pub fn get_at(&self, addr: DbAddress) -> DbResult<Page> {
        if addr.is_null() {
            return Err(DbError::CorruptedPage { addr, reason: "attempted to read the null address" });
        }
        if let Some(p) = self.dirty.get(&addr) {
            return Ok(p.clone());
        }
        let page = self.manager.get_at(addr)?;
        let header = page.header();
        if header.batch_id > self.batch_id {
            return Err(DbError::StaleRead { addr, page_batch_id: header.batch_id, reader_batch_id: self.batch_id });
        }
        Ok(page)
    }

    /// Resolve the next address to hand out: an immediately-free page from this very batch, a
    /// page reclaimed from the abandoned chain if `min_live_batch_id` allows it, or a brand new
    /// slot at the allocation frontier.
    fn allocate_fresh(&mut self) -> DbResult<DbAddress> {
        if let Some(addr) = self.immediate_free.pop() {
            return Ok(addr);
        }
        let mut abandoned = std::mem::take(&mut self.abandoned_list);
        let reused = abandoned.try_get(self.min_live_batch_id, self)?;
        self.abandoned_list = abandoned;
        if let Some(addr) = reused {
            return Ok(addr);
        }
        let addr = self.next_free_page;
        if addr.raw() == u32::MAX {
            return Err(DbError::OutOfAddressSpace(addr.raw()));
        }
        self.next_free_page = addr.next();
        self.manager.ensure_capacity(addr)?;
        Ok(addr)
    }

    /// Allocate a brand new page stamped with this batch's id.
    pub fn get_new_page(&mut self, page_type: PageType, level: u8) -> DbResult<(DbAddress, Page)> {
        let addr = self.allocate_fresh()?;
        let mut page = Page::zeroed();
        page.set_header(PageHeader::new(self.batch_id, page_type, level));
        self.dirty.insert(addr, page.clone());
        Ok((addr, page))
    }

    /// Return a copy of `page` (currently at `addr`) that this batch owns and may mutate
    /// in place, allocating a fresh page and abandoning the old one if necessary. If `page`
    /// already belongs to this batch, no copy is made.
    pub fn get_writable_copy(&mut self, addr: DbAddress, page: &Page) -> DbResult<(DbAddress, Page)> {
        let header = page.header();
        if header.batch_id == self.batch_id {
            return Ok((addr, page.clone()));
        }
        let new_addr = self.allocate_fresh()?;
        let mut new_page = page.clone();
        let mut new_header = header;
        new_header.batch_id = self.batch_id;
        new_page.set_header(new_header);
        self.dirty.insert(new_addr, new_page.clone());
        self.register_for_future_reuse(addr, false);
        Ok((new_addr, new_page))
    }

    /// Fetch the page at `*addr`, replace `*addr` with the address of a writable copy of it,
    /// and return that copy. A thin convenience wrapper combining `get_at` + `get_writable_copy`
    /// for the common "follow a pointer and prepare to mutate it" case.
    pub fn ensure_writable_copy(&mut self, addr: &mut DbAddress) -> DbResult<Page> {
        let page = self.get_at(*addr)?;
        let (new_addr, new_page) = self.get_writable_copy(*addr, &page)?;
        *addr = new_addr;
        Ok(new_page)
    }

    /// If `*addr` is null, allocate a brand new page of `page_type`/`level` and write its
    /// address into `*addr`. Otherwise behaves like [`Self::ensure_writable_copy`]. Used at
    /// tree-walk points where a child pointer may or may not exist yet.
    pub fn try_get_page_alloc(&mut self, addr: &mut DbAddress, page_type: PageType, level: u8) -> DbResult<Page> {
        if addr.is_null() {
            let (new_addr, page) = self.get_new_page(page_type, level)?;
            *addr = new_addr;
            Ok(page)
        } else {
            self.ensure_writable_copy(addr)
        }
    }

    /// Overwrite the contents at `addr` in this batch's write-back cache.
    pub fn put(&mut self, addr: DbAddress, page: Page) {
        self.dirty.insert(addr, page);
    }

    /// Whether `addr` has already been written (allocated or copied forward) by this batch.
    pub fn was_written(&self, addr: DbAddress) -> bool {
        self.dirty.get(&addr).map(|p| p.header().batch_id == self.batch_id).unwrap_or(false)
    }

    /// Stamp `page`'s header with this batch's id, without otherwise touching its contents.
    pub fn assign_batch_id(&self, page: &mut Page) {
        let mut header = page.header();
        header.batch_id = self.batch_id;
        page.set_header(header);
    }

    /// Mark `addr` as no longer referenced by the current tree. If `immediate_reuse_hint` is
    /// set, the caller is promising the page's previous contents were never visible outside
    /// this batch (e.g. a page this same batch allocated and then decided not to need), so it
    /// can be handed back out before this batch even commits. Otherwise it's queued for the
    /// persistent abandoned list, gated on `min_live_batch_id` catching up to this batch.
    pub fn register_for_future_reuse(&mut self, addr: DbAddress, immediate_reuse_hint: bool) {
        if immediate_reuse_hint {
            self.immediate_free.push(addr);
        } else {
            self.pending_abandon.push(addr);
        }
    }

    /// Fold this batch's `pending_abandon` pages into its abandoned-list index. Must be called
    /// once, after all tree mutations and before [`Self::into_parts`], so the list handed to the
    /// new root already accounts for everything this batch released.
    pub fn finalize(&mut self) -> DbResult<()> {
        let pending = std::mem::take(&mut self.pending_abandon);
        if pending.is_empty() {
            return Ok(());
        }
        let batch_id = self.batch_id;
        let mut list = std::mem::take(&mut self.abandoned_list);
        list.register(pending, batch_id, self)?;
        self.abandoned_list = list;
        Ok(())
    }

    /// Consume the batch, returning everything the commit path needs: the dirty page set (in
    /// no particular order), the advanced allocation frontier, the updated abandoned-list index,
    /// and the newly abandoned addresses still waiting to be folded into it.
    pub(crate) fn into_parts(self) -> WriteBatchOutcome {
        WriteBatchOutcome {
            dirty: self.dirty,
            next_free_page: self.next_free_page,
            abandoned_list: self.abandoned_list,
            pending_abandon: self.pending_abandon,
        }
    }
}

/// Everything a commit needs out of a finished [`WriteBatch`].
pub(crate) struct WriteBatchOutcome {
    pub dirty: HashMap<DbAddress, Page>,
    pub next_free_page: DbAddress,
    pub abandoned_list: AbandonedList,
    pub pending_abandon: Vec<DbAddress>,
}
