use std::collections::HashSet;

use log::trace;

use crate::error::{Error, Result};
use crate::page::{OwnedPage, Page, PageId};

/// Tracks free and pending-to-be-freed page ids for a single writer.
///
/// A flat model: `ids` is the sorted set of pages free to allocate from,
/// `pending` are pages released during
/// the in-progress transaction (not yet safe to reuse, since readers of the
/// previous meta may still see them), and `allocs`/`cache` track bookkeeping
/// needed to roll a failed transaction back cleanly.
#[derive(Debug, Default)]
pub struct FreeList {
    ids: Vec<PageId>,
    pending: Vec<PageId>,
    allocs: Vec<PageId>,
    cache: HashSet<PageId>,
}

impl FreeList {
    pub fn new() -> FreeList {
        FreeList::default()
    }

    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Size in bytes a page holding this freelist would occupy.
    pub fn byte_size(&self) -> usize {
        let mut n = self.count();
        if n >= u16::MAX as usize {
            n += 1;
        }
        crate::page::PAGE_HEADER_SIZE + 8 * n
    }

    /// Finds and removes `n` contiguous free page ids, returning the first id.
    pub fn allocate(&mut self, n: usize) -> Option<PageId> {
        if n == 0 || self.ids.is_empty() {
            return None;
        }
        let mut initial: PageId = 0;
        let mut previd: PageId = 0;
        for (i, &id) in self.ids.iter().enumerate() {
            if previd == 0 || id - previd != 1 {
                initial = id;
            }
            if id - initial + 1 == n as u64 {
                if i + 1 == n {
                    self.ids.drain(0..=i);
                } else {
                    self.ids.drain(i + 1 - n..=i);
                }
                for pid in initial..initial + n as u64 {
                    self.cache.remove(&pid);
                    self.allocs.push(pid);
                }
                return Some(initial);
            }
            previd = id;
        }
        None
    }

    /// Records a page allocated straight from the end of the file (no free
    /// run was available) so a rollback can return it to `ids`.
    pub fn allocate_new(&mut self, id: PageId) {
        self.allocs.push(id);
    }

    /// Marks a page (and its overflow run) as pending free for this txn.
    pub fn free(&mut self, id: PageId, overflow: u32) -> Result<()> {
        if id <= 1 {
            return Err(Error::InvalidPage(format!("cannot free meta page {}", id)));
        }
        for i in 0..=overflow as u64 {
            let pid = id + i;
            if self.cache.contains(&pid) {
                return Err(Error::DoubleFree(pid));
            }
            self.pending.push(pid);
            self.cache.insert(pid);
        }
        Ok(())
    }

    pub fn is_free(&self, id: PageId) -> bool {
        self.cache.contains(&id)
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> &[PageId] {
        &self.ids
    }

    pub fn rollback(&mut self) {
        self.ids.extend(self.allocs.drain(..));
        self.ids.sort_unstable();
        self.cache.clear();
        self.pending.clear();
        for &id in &self.ids {
            self.cache.insert(id);
        }
    }

    pub fn read(&mut self, page: &Page<'_>) -> Result<()> {
        if !page.is_freelist() {
            return Err(Error::InvalidPage("expected freelist page".into()));
        }
        self.ids = page.free_ids()?;
        self.cache = self.ids.iter().copied().collect();
        trace!("freelist read {} free pages", self.ids.len());
        Ok(())
    }

    /// Folds `pending` into `ids` and serializes the result, to be called
    /// once per commit after all other dirty pages have been allocated.
    pub fn write(&mut self, page: &mut OwnedPage, page_id: PageId) {
        self.ids.append(&mut self.pending);
        self.ids.sort_unstable();
        self.ids.dedup();
        self.allocs.clear();
        trace!("freelist write {} free pages", self.ids.len());
        page.write_ids(page_id, &self.ids);
    }
}
