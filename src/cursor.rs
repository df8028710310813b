use crate::bucket::{Bucket, PageNode};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::page::{PageId, BUCKET_LEAF_FLAG};

/// One level of cursor descent: the page or node visited at that depth, and
/// the index into it the cursor currently points at.
#[derive(Clone)]
struct ElemRef {
    page_node: PageNode,
    index: usize,
}

impl ElemRef {
    fn is_leaf(&self) -> bool {
        self.page_node.is_leaf()
    }
    fn count(&self) -> usize {
        self.page_node.count()
    }
}

/// Iterates a bucket's key/value pairs in sorted order, tracking a stack of
/// page/node positions from the bucket's root down to the current leaf
/// element.
pub struct Cursor {
    bucket: Bucket,
    stack: Vec<ElemRef>,
}

impl Cursor {
    pub(crate) fn new(bucket: Bucket) -> Cursor {
        Cursor { bucket, stack: Vec::new() }
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// Returns the in-memory node at the cursor's current leaf position,
    /// promoting pages to nodes down the whole stack as needed so the
    /// caller can mutate it. Must be called with the stack already
    /// positioned by [`Cursor::place`] (or another descent); an empty stack
    /// falls back to the first leaf.
    pub(crate) fn node(&mut self) -> Result<Node> {
        if self.stack.is_empty() {
            self.first_raw()?;
        }
        self.materialize(0)?;
        let top = self.stack.last().ok_or_else(|| Error::InvalidPage("empty cursor stack".into()))?;
        match &top.page_node {
            PageNode::Node(n) => Ok(n.clone()),
            PageNode::Page(_) => Err(Error::InvalidPage("cursor leaf did not materialize".into())),
        }
    }

    /// Walks the stack from `start` down, replacing each `PageNode::Page`
    /// with its promoted `Node`, so every frame from there on is mutable.
    fn materialize(&mut self, start: usize) -> Result<()> {
        let mut parent: Option<Node> = if start == 0 {
            None
        } else {
            match &self.stack[start - 1].page_node {
                PageNode::Node(n) => Some(n.clone()),
                PageNode::Page(_) => return Err(Error::InvalidPage("ancestor frame not materialized".into())),
            }
        };
        for i in start..self.stack.len() {
            let id = self.stack[i].page_node.page_id();
            let node = self.bucket.node(id, parent.as_ref())?;
            self.stack[i].page_node = PageNode::Node(node.clone());
            parent = Some(node);
        }
        Ok(())
    }

    fn push(&mut self, id: PageId, index: usize) -> Result<()> {
        let page_node = self.bucket.page_node(id)?;
        self.stack.push(ElemRef { page_node, index });
        Ok(())
    }

    /// Descends to the first leaf element reachable from the given page,
    /// pushing every branch frame visited onto the stack.
    fn descend_first(&mut self, id: PageId) -> Result<()> {
        self.push(id, 0)?;
        loop {
            let top = self.stack.last().expect("just pushed");
            if top.is_leaf() {
                return Ok(());
            }
            let child = top.page_node.child_pgid_at(0).ok_or_else(|| Error::Corrupt("empty branch page".into()))?;
            self.push(child, 0)?;
        }
    }

    fn descend_last(&mut self, id: PageId) -> Result<()> {
        self.push(id, 0)?;
        loop {
            let top = self.stack.last_mut().expect("just pushed");
            let last = top.count().saturating_sub(1);
            top.index = last;
            if top.is_leaf() {
                return Ok(());
            }
            let child = top.page_node.child_pgid_at(last).ok_or_else(|| Error::Corrupt("empty branch page".into()))?;
            self.push(child, 0)?;
        }
    }

    pub(crate) fn first_raw(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>, u32)>> {
        self.stack.clear();
        self.descend_first(self.bucket.root_pgid())?;
        Ok(self.current())
    }

    pub(crate) fn last_raw(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>, u32)>> {
        self.stack.clear();
        self.descend_last(self.bucket.root_pgid())?;
        Ok(self.current())
    }

    fn current(&self) -> Option<(Vec<u8>, Option<Vec<u8>>, u32)> {
        let top = self.stack.last()?;
        top.page_node.entry_at(top.index)
    }

    /// Advances to the next leaf element, popping back up the stack and
    /// descending into the next sibling subtree when the current frame is
    /// exhausted.
    pub(crate) fn next_raw(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>, u32)>> {
        loop {
            if self.stack.is_empty() {
                return Ok(None);
            }
            let depth = self.stack.len() - 1;
            if self.stack[depth].is_leaf() {
                self.stack[depth].index += 1;
                if self.stack[depth].index < self.stack[depth].count() {
                    return Ok(self.current());
                }
            }
            self.stack.pop();
            if self.stack.is_empty() {
                return Ok(None);
            }
            let parent_depth = self.stack.len() - 1;
            self.stack[parent_depth].index += 1;
            if self.stack[parent_depth].index >= self.stack[parent_depth].count() {
                continue;
            }
            let child = self.stack[parent_depth]
                .page_node
                .child_pgid_at(self.stack[parent_depth].index)
                .ok_or_else(|| Error::Corrupt("missing branch child".into()))?;
            self.descend_first(child)?;
            return Ok(self.current());
        }
    }

    /// Descends via binary search to the leaf that would hold `key`,
    /// leaving the cursor positioned there even if `key` isn't present
    /// (the index then lands on the insertion point, possibly past the
    /// last element). Used by bucket mutation ops, where the insertion
    /// target is always this leaf, never a sibling.
    pub(crate) fn place(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Option<Vec<u8>>, u32)>> {
        self.stack.clear();
        self.search(self.bucket.root_pgid(), key)?;
        Ok(self.current())
    }

    /// Positions the cursor at the first key >= `key`, crossing into a
    /// sibling subtree if `key` falls past the end of the leaf reached by
    /// binary search. This is the public range-scan `seek`'s behavior.
    pub(crate) fn seek_raw(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Option<Vec<u8>>, u32)>> {
        match self.place(key)? {
            Some(entry) => Ok(Some(entry)),
            None => self.next_raw(),
        }
    }

    fn search(&mut self, id: PageId, key: &[u8]) -> Result<()> {
        let page_node = self.bucket.page_node(id)?;
        let count = page_node.count();
        let mut index = count;
        let mut exact = false;
        for i in 0..count {
            if let Some(k) = page_node.key_at(i) {
                if k.as_slice() >= key {
                    index = i;
                    exact = k.as_slice() == key;
                    break;
                }
            }
        }
        let is_leaf = page_node.is_leaf();
        if is_leaf {
            self.stack.push(ElemRef { page_node: page_node.clone(), index });
            return Ok(());
        }
        // Branch separators name the first key of their subtree, so a
        // non-exact match landed one child too far right; step back.
        let child_index = if !exact && index > 0 { index - 1 } else { index.min(count.saturating_sub(1)) };
        self.stack.push(ElemRef { page_node: page_node.clone(), index: child_index });
        let child = page_node.child_pgid_at(child_index).ok_or_else(|| Error::Corrupt("empty branch page".into()))?;
        self.search(child, key)
    }

    /// Returns the first key/value pair, collapsing a nested-bucket entry's
    /// value to `None` the way a plain value iterator should.
    pub fn first(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.first_raw().ok().flatten().map(Self::collapse)
    }

    pub fn last(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.last_raw().ok().flatten().map(Self::collapse)
    }

    pub fn next(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.next_raw().ok().flatten().map(Self::collapse)
    }

    pub fn seek(&mut self, key: &[u8]) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.seek_raw(key).ok().flatten().map(Self::collapse)
    }

    fn collapse(entry: (Vec<u8>, Option<Vec<u8>>, u32)) -> (Vec<u8>, Option<Vec<u8>>) {
        let (k, v, flags) = entry;
        if flags & BUCKET_LEAF_FLAG != 0 {
            (k, None)
        } else {
            (k, v)
        }
    }

    /// Borrows the cursor as a forward iterator over the bucket's entries.
    pub fn iter(&mut self) -> CursorIter<'_> {
        CursorIter { cursor: self, started: false }
    }
}

/// Forward iterator adapter over a [`Cursor`], yielding `(key, value)` pairs
/// with nested-bucket entries collapsed to a `None` value.
pub struct CursorIter<'a> {
    cursor: &'a mut Cursor,
    started: bool,
}

impl<'a> Iterator for CursorIter<'a> {
    type Item = (Vec<u8>, Option<Vec<u8>>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.cursor.first()
        } else {
            self.cursor.next()
        }
    }
}
