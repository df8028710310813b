use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fs2::FileExt;
use log::{debug, info, trace};
use memmap::Mmap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::free_list::FreeList;
use crate::meta::Meta;
use crate::page::{self, OwnedPage, Page, PageId, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG};
use crate::transaction::Transaction;

const DEFAULT_INITIAL_MMAP_PAGES: u64 = 32;
const DEFAULT_GROW_PAGES: u64 = 4;

/// Configuration for opening or creating a database file.
///
/// Builder-style configuration, with a configurable `grow_pages` padding
/// factor and a `read_only` mode that refuses to create a missing file.
pub struct DBBuilder {
    page_size: u64,
    initial_mmap_pages: u64,
    grow_pages: u64,
    read_only: bool,
}

impl Default for DBBuilder {
    fn default() -> DBBuilder {
        DBBuilder {
            page_size: page_size::get() as u64,
            initial_mmap_pages: DEFAULT_INITIAL_MMAP_PAGES,
            grow_pages: DEFAULT_GROW_PAGES,
            read_only: false,
        }
    }
}

impl DBBuilder {
    pub fn new() -> DBBuilder {
        DBBuilder::default()
    }

    pub fn page_size(mut self, size: u64) -> DBBuilder {
        self.page_size = size;
        self
    }

    pub fn initial_mmap_pages(mut self, pages: u64) -> DBBuilder {
        if pages < 4 {
            panic!("a database needs at least 4 pages (two metas, a freelist, a root leaf)");
        }
        self.initial_mmap_pages = pages;
        self
    }

    pub fn grow_pages(mut self, pages: u64) -> DBBuilder {
        self.grow_pages = pages.max(1);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> DBBuilder {
        self.read_only = read_only;
        self
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<DB> {
        let path = path.as_ref();
        let file = if !path.exists() {
            if self.read_only {
                return Err(Error::InvalidPage("cannot create a database in read-only mode".into()));
            }
            Idb::init_file(path, self.page_size, self.initial_mmap_pages)?
        } else {
            OpenOptions::new().read(true).write(!self.read_only).open(path)?
        };
        let db = Idb::open(file, self.read_only, self.grow_pages)?;
        Ok(DB(Arc::new(db)))
    }
}

struct Idb {
    file: Mutex<File>,
    mmap: RwLock<Arc<Mmap>>,
    page_size: u64,
    read_only: bool,
    grow_pages: u64,
    file_size: AtomicU64,
    free_list: RwLock<FreeList>,
    writer_active: Mutex<bool>,
    writer_released: Condvar,
    reader_count: AtomicU64,
}

/// A single-file, memory-mapped key/value store. `Send`/`Sync`: a `DB`
/// handle (and the transactions it opens) can be shared across threads,
/// with a single writer admitted at a time via a real blocking lock.
#[derive(Clone)]
pub struct DB(Arc<Idb>);

#[derive(Clone)]
pub struct WeakDB(Weak<Idb>);

impl WeakDB {
    pub(crate) fn upgrade(&self) -> Option<DB> {
        self.0.upgrade().map(DB)
    }
}

impl DB {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DB> {
        DBBuilder::default().open(path)
    }

    pub(crate) fn downgrade(&self) -> WeakDB {
        WeakDB(Arc::downgrade(&self.0))
    }

    pub fn page_size(&self) -> usize {
        self.0.page_size as usize
    }

    pub(crate) fn meta(&self) -> Result<Meta> {
        let mmap = self.0.mmap.read().clone();
        select_meta(&mmap, self.page_size())
    }

    pub(crate) fn with_mapped_page<T>(&self, id: PageId, f: impl FnOnce(&Page<'_>) -> Result<T>) -> Result<T> {
        let mmap = self.0.mmap.read().clone();
        let page = page::read_page_at(&mmap, id, self.page_size())?;
        f(&page)
    }

    pub(crate) fn free_list(&self) -> &RwLock<FreeList> {
        &self.0.free_list
    }

    /// Grows the file (and remaps it) so that page id `end_pgid` is backed
    /// by the mmap, padding by `grow_pages` on every out-of-space allocation.
    pub(crate) fn ensure_capacity(&self, end_pgid: PageId) -> Result<()> {
        let page_size = self.0.page_size;
        let needed = end_pgid * page_size;
        if needed <= self.0.file_size.load(Ordering::SeqCst) {
            return Ok(());
        }
        let new_size = needed + self.0.grow_pages * page_size;
        let file = self.0.file.lock();
        file.allocate(new_size)?;
        let new_mmap = unsafe { Mmap::map(&*file)? };
        *self.0.mmap.write() = Arc::new(new_mmap);
        self.0.file_size.store(new_size, Ordering::SeqCst);
        info!("grew database file to {} bytes", new_size);
        Ok(())
    }

    pub(crate) fn write_page_bytes(&self, id: PageId, bytes: &[u8]) -> Result<()> {
        let offset = id * self.0.page_size;
        let mut file = self.0.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        let file = self.0.file.lock();
        file.sync_data()?;
        Ok(())
    }

    pub(crate) fn release_writer(&self) {
        let mut active = self.0.writer_active.lock();
        *active = false;
        self.0.writer_released.notify_one();
    }

    pub(crate) fn release_reader(&self) {
        self.0.reader_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Opens a transaction. A second concurrent writer blocks on the store's
    /// writer lock until the transaction holding it commits, rolls back, or
    /// is dropped, rather than failing fast: the store is shared across
    /// `Send`/`Sync` handles, so a real OS-thread-blocking wait is both
    /// possible and the documented admission behavior.
    pub fn begin(&self, writable: bool) -> Result<Transaction> {
        if writable {
            if self.0.read_only {
                return Err(Error::ReadOnly);
            }
            let mut active = self.0.writer_active.lock();
            while *active {
                self.0.writer_released.wait(&mut active);
            }
            *active = true;
        } else {
            self.0.reader_count.fetch_add(1, Ordering::SeqCst);
        }
        match Transaction::begin(self, writable) {
            Ok(tx) => Ok(tx),
            Err(e) => {
                if writable {
                    self.release_writer();
                } else {
                    self.release_reader();
                }
                Err(e)
            }
        }
    }

    /// Runs `f` inside a writable transaction, committing on success and
    /// rolling back if `f` returns an error.
    pub fn update<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let tx = self.begin(true)?;
        match f(&tx) {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Runs `f` inside a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let tx = self.begin(false)?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }
}

impl Idb {
    fn open(file: File, read_only: bool, grow_pages: u64) -> Result<Idb> {
        if read_only {
            file.lock_shared()?;
        } else {
            file.lock_exclusive()?;
        }
        let file_size = file.metadata()?.len();
        let mmap = unsafe { Mmap::map(&file)? };
        let page_size = Meta::read(&page::read_page_at(&mmap, 0, page_size::get())?)
            .map(|m| m.page_size as u64)
            .unwrap_or_else(|_| page_size::get() as u64);

        let db = Idb {
            file: Mutex::new(file),
            mmap: RwLock::new(Arc::new(mmap)),
            page_size,
            read_only,
            grow_pages,
            file_size: AtomicU64::new(file_size),
            free_list: RwLock::new(FreeList::new()),
            writer_active: Mutex::new(false),
            writer_released: Condvar::new(),
            reader_count: AtomicU64::new(0),
        };

        let meta = select_meta(&db.mmap.read(), page_size as usize)?;
        let freelist_page = page::read_page_at(&db.mmap.read(), meta.freelist_pgid, page_size as usize)?;
        db.free_list.write().read(&freelist_page)?;
        trace!("opened database with {} free pages", db.free_list.read().count());
        Ok(db)
    }

    /// Lays down the initial four-page file: two meta pages (txid 0 and 1,
    /// both valid so either can serve as the active meta immediately), an
    /// empty freelist page, and an empty leaf root page.
    fn init_file(path: &Path, page_size: u64, initial_pages: u64) -> Result<File> {
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        file.allocate(page_size * initial_pages.max(4))?;

        let mut buf = vec![0u8; (page_size * 4) as usize];
        for i in 0..2u64 {
            let mut meta = Meta::new(page_size as u32);
            meta.txid = i;
            meta.root_pgid = 3;
            meta.freelist_pgid = 2;
            meta.max_pgid = 4;
            meta.checksum = meta.compute_checksum();
            let mut owned = OwnedPage::with_capacity(page_size as usize, 0);
            meta.write(&mut owned, i);
            let off = (i * page_size) as usize;
            buf[off..off + page_size as usize].copy_from_slice(&owned.buf);
        }
        {
            let mut owned = OwnedPage::with_capacity(page_size as usize, 0);
            owned.write_header(2, FREELIST_PAGE_FLAG, 0, 0);
            let off = (2 * page_size) as usize;
            buf[off..off + page_size as usize].copy_from_slice(&owned.buf);
        }
        {
            let mut owned = OwnedPage::with_capacity(page_size as usize, 0);
            owned.write_header(3, LEAF_PAGE_FLAG, 0, 0);
            let off = (3 * page_size) as usize;
            buf[off..off + page_size as usize].copy_from_slice(&owned.buf);
        }

        file.write_all(&buf)?;
        file.flush()?;
        file.sync_all()?;
        file.seek(SeekFrom::Start(0))?;
        debug!("initialized database file at {}", path.display());
        Ok(file)
    }
}

/// Picks whichever of the two meta pages validates and carries the higher
/// `txid`, falling back to the other if one fails validation.
fn select_meta(mmap: &[u8], page_size: usize) -> Result<Meta> {
    let meta0 = page::read_page_at(mmap, 0, page_size).ok().and_then(|p| Meta::read(&p).ok());
    let meta1 = page::read_page_at(mmap, 1, page_size).ok().and_then(|p| Meta::read(&p).ok());
    match (meta0, meta1) {
        (Some(m0), Some(m1)) => Ok(if m1.txid > m0.txid { m1 } else { m0 }),
        (Some(m0), None) => Ok(m0),
        (None, Some(m1)) => Ok(m1),
        (None, None) => Err(Error::Corrupt("neither meta page is valid".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_a_four_page_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = DB::open(&path).unwrap();
        assert_eq!(db.meta().unwrap().root_pgid, 3);
    }

    #[test]
    fn second_writer_blocks_until_first_releases() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = DB::open(&path).unwrap();
        let tx1 = db.begin(true).unwrap();

        let db2 = db.clone();
        let (about_to_block, blocked) = mpsc::channel();
        let handle = thread::spawn(move || {
            about_to_block.send(()).unwrap();
            let tx2 = db2.begin(true).unwrap();
            tx2.rollback().unwrap();
        });

        blocked.recv().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished(), "second writer should still be blocked on the first");

        tx1.rollback().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn freelist_rotates_between_two_pages_across_commits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = DB::open(&path).unwrap();

        db.update(|tx| tx.root_bucket().put(b"foo", b"bar")).unwrap();
        assert_eq!(db.0.free_list.read().ids(), &[3]);

        db.update(|tx| tx.root_bucket().put(b"foo", b"bar")).unwrap();
        assert_eq!(db.0.free_list.read().ids(), &[4]);
    }
}
