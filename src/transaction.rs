use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::bucket::Bucket;
use crate::cursor::Cursor;
use crate::db::{WeakDB, DB};
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::node::Node;
use crate::page::{OwnedPage, Page, PageId};

pub type TxId = u64;

struct Inner {
    db: WeakDB,
    writable: bool,
    meta: Mutex<Meta>,
    root: Mutex<Option<Bucket>>,
    pages: Mutex<HashMap<PageId, OwnedPage>>,
    closed: AtomicBool,
}

/// A snapshot of the store at a point in time. Read-only transactions see a
/// consistent view of whatever meta was active at `begin()`; a single
/// writable transaction at a time accumulates dirty pages in memory and
/// publishes them atomically at `commit()`.
#[derive(Clone)]
pub struct Transaction(Arc<Inner>);

#[derive(Clone)]
pub struct WeakTransaction(Weak<Inner>);

impl WeakTransaction {
    pub(crate) fn new() -> WeakTransaction {
        WeakTransaction(Weak::new())
    }
    pub(crate) fn upgrade(&self) -> Option<Transaction> {
        self.0.upgrade().map(Transaction)
    }
}

impl Transaction {
    pub(crate) fn begin(db: &DB, writable: bool) -> Result<Transaction> {
        let mut meta = db.meta()?;
        if writable {
            meta.txid += 1;
        }
        let tx = Transaction(Arc::new(Inner {
            db: db.downgrade(),
            writable,
            meta: Mutex::new(meta),
            root: Mutex::new(None),
            pages: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }));
        let root_pgid = tx.0.meta.lock().root_pgid;
        let root = Bucket::new(tx.downgrade(), root_pgid);
        *tx.0.root.lock() = Some(root);
        trace!("began {} transaction {}", if writable { "writable" } else { "read-only" }, tx.id());
        Ok(tx)
    }

    pub(crate) fn downgrade(&self) -> WeakTransaction {
        WeakTransaction(Arc::downgrade(&self.0))
    }

    pub fn id(&self) -> TxId {
        self.0.meta.lock().txid
    }

    pub fn writable(&self) -> bool {
        self.0.writable
    }

    pub fn page_size(&self) -> usize {
        self.db().expect("transaction outlived its store").page_size()
    }

    fn db(&self) -> Result<DB> {
        self.0.db.upgrade().ok_or_else(|| Error::InvalidPage("store no longer live".into()))
    }

    pub fn root_bucket(&self) -> Bucket {
        self.0.root.lock().clone().expect("root bucket always set at begin()")
    }

    pub fn bucket(&self, name: &[u8]) -> Option<Bucket> {
        self.root_bucket().bucket(name)
    }

    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket> {
        self.root_bucket().create_bucket(name)
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket> {
        self.root_bucket().create_bucket_if_not_exists(name)
    }

    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.root_bucket().delete_bucket(name)
    }

    pub fn cursor(&self) -> Cursor {
        self.root_bucket().cursor()
    }

    /// Hands `f` the page at `id`, preferring this transaction's own dirty
    /// page map over the store's mmap so a writer sees its own writes.
    pub(crate) fn with_page<T>(&self, id: PageId, f: impl FnOnce(&Page<'_>) -> Result<T>) -> Result<T> {
        let pages = self.0.pages.lock();
        if let Some(owned) = pages.get(&id) {
            return f(&owned.as_page()?);
        }
        drop(pages);
        let db = self.db()?;
        db.with_mapped_page(id, f)
    }

    /// Reserves `count` contiguous pages, preferring the store's freelist and
    /// falling back to growing the file. Tracked against this transaction's
    /// own high-water mark rather than the on-disk meta, which is not
    /// updated until commit.
    pub(crate) fn allocate(&self, count: usize) -> Result<PageId> {
        let db = self.db()?;
        let pgid = if let Some(id) = db.free_list().write().allocate(count) {
            id
        } else {
            let mut meta = self.0.meta.lock();
            let id = meta.max_pgid;
            meta.max_pgid += count as u64;
            let end = meta.max_pgid;
            drop(meta);
            db.ensure_capacity(end)?;
            let mut free_list = db.free_list().write();
            for i in 0..count as u64 {
                free_list.allocate_new(id + i);
            }
            id
        };
        Ok(pgid)
    }

    pub(crate) fn write_page(&self, page: OwnedPage) -> Result<()> {
        self.0.pages.lock().insert(page.id(), page);
        Ok(())
    }

    pub(crate) fn free_page(&self, id: PageId, overflow: u32) -> Result<()> {
        self.db()?.free_list().write().free(id, overflow)
    }

    pub(crate) fn free_node(&self, node: &Node) -> Result<()> {
        let id = node.page_id();
        if id != 0 {
            self.free_page(id, node.overflow(self.page_size()))?;
        }
        Ok(())
    }

    /// Walks every page reachable from the root bucket (recursing into
    /// nested buckets) and returns an error on a page id repeated across
    /// subtrees or one exceeding the transaction's own high-water mark.
    pub fn check(&self) -> Result<()> {
        let mut reachable: HashMap<PageId, ()> = HashMap::new();
        self.check_bucket(&self.root_bucket(), &mut reachable)
    }

    fn check_bucket(&self, bucket: &Bucket, reachable: &mut HashMap<PageId, ()>) -> Result<()> {
        let max_pgid = self.0.meta.lock().max_pgid;
        if bucket.root_pgid() != 0 {
            let mut stack = vec![bucket.root_pgid()];
            while let Some(id) = stack.pop() {
                let pn = bucket.page_node(id)?;
                if id > max_pgid {
                    return Err(Error::PageOutOfBounds(id));
                }
                if reachable.insert(id, ()).is_some() {
                    return Err(Error::DoubleFree(id));
                }
                if !pn.is_leaf() {
                    for i in 0..pn.count() {
                        if let Some(child) = pn.child_pgid_at(i) {
                            stack.push(child);
                        }
                    }
                }
            }
        }

        let mut c = bucket.cursor();
        let mut next = c.first_raw()?;
        while let Some((key, _, flags)) = next {
            if flags & crate::page::BUCKET_LEAF_FLAG != 0 {
                if let Some(child) = bucket.bucket(&key) {
                    self.check_bucket(&child, reachable)?;
                }
            }
            next = c.next_raw()?;
        }
        Ok(())
    }

    /// Rebalances and spills the dirty tree, folds the freelist, writes
    /// every dirty page and the new meta record, then closes the
    /// transaction.
    pub fn commit(self) -> Result<()> {
        if !self.writable() {
            return self.rollback();
        }
        if let Err(e) = self.commit_inner() {
            self.rollback_inner();
            self.close();
            return Err(e);
        }
        self.close();
        Ok(())
    }

    /// Rebalances and spills the dirty tree, folds the freelist, then
    /// publishes the result in two durably-ordered steps: every dirty data
    /// page is written and fsynced *before* the new meta page is written and
    /// fsynced. The meta flip is the only atomic commit point (whichever
    /// meta validates with the higher `txid` wins on reopen), so a crash
    /// between the two fsyncs must leave the previous meta — which only
    /// ever points at fully-durable pages — active.
    fn commit_inner(&self) -> Result<()> {
        let root = self.root_bucket();
        root.rebalance()?;
        root.spill()?;
        {
            let mut meta = self.0.meta.lock();
            meta.root_pgid = root.root_pgid();
            meta.sequence = root.sequence();
        }

        let db = self.db()?;
        let page_size = self.page_size();
        let free_size = db.free_list().read().byte_size();
        let free_pages = crate::utils::page_count(free_size, page_size);
        let free_pgid = self.allocate(free_pages)?;
        let mut owned = OwnedPage::with_capacity(page_size, (free_pages - 1) as u32);
        db.free_list().write().write(&mut owned, free_pgid);
        self.write_page(owned)?;
        self.0.meta.lock().freelist_pgid = free_pgid;

        self.write_dirty_pages()?;
        db.sync()?;
        self.write_meta()?;
        db.sync()?;
        debug!("committed transaction {}", self.id());
        Ok(())
    }

    fn write_dirty_pages(&self) -> Result<()> {
        let db = self.db()?;
        let mut pages: Vec<(PageId, OwnedPage)> = self.0.pages.lock().drain().collect();
        pages.sort_by_key(|(id, _)| *id);
        for (id, page) in pages {
            db.write_page_bytes(id, &page.buf)?;
        }
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let db = self.db()?;
        let page_size = self.page_size();
        let meta = {
            let mut m = self.0.meta.lock();
            m.checksum = m.compute_checksum();
            *m
        };
        let pgid = (meta.txid % 2) as PageId;
        let mut owned = OwnedPage::with_capacity(page_size, 0);
        meta.write(&mut owned, pgid);
        db.write_page_bytes(pgid, &owned.buf)?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.rollback_inner();
        self.close();
        Ok(())
    }

    fn rollback_inner(&self) {
        if self.writable() {
            if let Ok(db) = self.db() {
                db.free_list().write().rollback();
            }
            trace!("rolled back transaction {}", self.id());
        }
    }

    fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(db) = self.db() {
            if self.writable() {
                db.release_writer();
            } else {
                db.release_reader();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(db) = self.db.upgrade() {
            if self.writable {
                db.free_list().write().rollback();
                db.release_writer();
            } else {
                db.release_reader();
            }
        }
    }
}
