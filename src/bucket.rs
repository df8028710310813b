use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::node::{Node, NodeType};
use crate::page::{BranchElement, LeafElement, Page, PageId, BUCKET_LEAF_FLAG};
use crate::transaction::{Transaction, WeakTransaction};

/// root_pgid (u64) + sequence (u64), stored ahead of an inline leaf page.
const BUCKET_HEADER_SIZE: usize = 16;
const MAX_INLINE_BUCKET_SIZE: usize = 1024;

/// A branch or leaf page decoded once from the mmap (or from an inline
/// bucket value) and shared via `Arc` across every cursor frame that visits
/// it during a transaction. Read-only: mutation always goes through a
/// promoted [`Node`].
pub(crate) struct DecodedPage {
    pub(crate) id: PageId,
    pub(crate) is_leaf: bool,
    pub(crate) overflow: u32,
    leaf: Vec<LeafElement>,
    branch: Vec<BranchElement>,
}

impl DecodedPage {
    fn from_page(page: &Page<'_>) -> Result<DecodedPage> {
        if page.is_leaf() {
            Ok(DecodedPage {
                id: page.id,
                is_leaf: true,
                overflow: page.overflow,
                leaf: page.leaf_elements()?,
                branch: Vec::new(),
            })
        } else if page.is_branch() {
            Ok(DecodedPage {
                id: page.id,
                is_leaf: false,
                overflow: page.overflow,
                leaf: Vec::new(),
                branch: page.branch_elements()?,
            })
        } else {
            Err(Error::InvalidPage(format!("page {} is neither branch nor leaf", page.id)))
        }
    }

    fn count(&self) -> usize {
        if self.is_leaf {
            self.leaf.len()
        } else {
            self.branch.len()
        }
    }

    fn key_at(&self, idx: usize) -> Option<&[u8]> {
        if self.is_leaf {
            self.leaf.get(idx).map(|e| e.key.as_slice())
        } else {
            self.branch.get(idx).map(|e| e.key.as_slice())
        }
    }

    fn child_pgid_at(&self, idx: usize) -> Option<PageId> {
        self.branch.get(idx).map(|e| e.page_id)
    }

    fn entry_at(&self, idx: usize) -> Option<(Vec<u8>, Option<Vec<u8>>, u32)> {
        self.leaf.get(idx).map(|e| (e.key.clone(), Some(e.value.clone()), e.flags))
    }
}

/// A cursor stack frame: either a cached decoded page, or a node already
/// promoted for mutation.
#[derive(Clone)]
pub(crate) enum PageNode {
    Page(Arc<DecodedPage>),
    Node(Node),
}

impl PageNode {
    pub(crate) fn is_leaf(&self) -> bool {
        match self {
            PageNode::Page(p) => p.is_leaf,
            PageNode::Node(n) => n.is_leaf(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        match self {
            PageNode::Page(p) => p.count(),
            PageNode::Node(n) => n.num_children(),
        }
    }

    pub(crate) fn key_at(&self, idx: usize) -> Option<Vec<u8>> {
        match self {
            PageNode::Page(p) => p.key_at(idx).map(|k| k.to_vec()),
            PageNode::Node(n) => n.inode_at(idx).map(|(k, ..)| k),
        }
    }

    pub(crate) fn child_pgid_at(&self, idx: usize) -> Option<PageId> {
        match self {
            PageNode::Page(p) => p.child_pgid_at(idx),
            PageNode::Node(n) => n.inode_at(idx).and_then(|(_, _, _, pgid)| pgid),
        }
    }

    pub(crate) fn entry_at(&self, idx: usize) -> Option<(Vec<u8>, Option<Vec<u8>>, u32)> {
        match self {
            PageNode::Page(p) => p.entry_at(idx),
            PageNode::Node(n) => n.inode_at(idx).map(|(k, v, f, _)| (k, v, f)),
        }
    }

    fn overflow(&self, page_size: usize) -> u32 {
        match self {
            PageNode::Page(p) => p.overflow,
            PageNode::Node(n) => n.overflow(page_size),
        }
    }

    fn page_id(&self) -> PageId {
        match self {
            PageNode::Page(p) => p.id,
            PageNode::Node(n) => n.page_id(),
        }
    }
}

struct Inner {
    tx: WeakTransaction,
    root_pgid: Mutex<PageId>,
    sequence: Mutex<u64>,
    root_node: Mutex<Option<Node>>,
    /// Raw bytes of an inline leaf page, set when this bucket was opened
    /// from a sub-bucket value whose header carries `root_pgid == 0`.
    inline_page: Mutex<Option<Vec<u8>>>,
    nodes: Mutex<HashMap<PageId, Node>>,
    page_cache: Mutex<HashMap<PageId, Arc<DecodedPage>>>,
    sub_buckets: Mutex<HashMap<Vec<u8>, Bucket>>,
}

/// A named B+tree: the unnamed root bucket of a transaction, or a nested
/// bucket opened by name from a parent bucket's bucket-leaf-flagged entry.
#[derive(Clone)]
pub struct Bucket(Arc<Inner>);

impl Bucket {
    pub(crate) fn new(tx: WeakTransaction, root_pgid: PageId) -> Bucket {
        Bucket(Arc::new(Inner {
            tx,
            root_pgid: Mutex::new(root_pgid),
            sequence: Mutex::new(0),
            root_node: Mutex::new(None),
            inline_page: Mutex::new(None),
            nodes: Mutex::new(HashMap::new()),
            page_cache: Mutex::new(HashMap::new()),
            sub_buckets: Mutex::new(HashMap::new()),
        }))
    }

    /// A bucket backed by a brand-new, empty leaf root node, as produced by
    /// `create_bucket` (and by a transaction's own root bucket when the
    /// store is freshly initialized).
    pub(crate) fn new_empty(tx: WeakTransaction) -> Bucket {
        let bucket = Bucket::new(tx.clone(), 0);
        let node = Node::new(tx, NodeType::Leaf);
        node.set_root(true);
        *bucket.0.root_node.lock() = Some(node);
        bucket
    }

    fn tx(&self) -> Result<Transaction> {
        self.0.tx.upgrade().ok_or_else(|| Error::InvalidPage("transaction no longer live".into()))
    }

    pub(crate) fn root_pgid(&self) -> PageId {
        *self.0.root_pgid.lock()
    }

    pub fn sequence(&self) -> u64 {
        *self.0.sequence.lock()
    }

    pub fn set_sequence(&self, v: u64) {
        *self.0.sequence.lock() = v;
    }

    pub fn next_sequence(&self) -> u64 {
        let mut seq = self.0.sequence.lock();
        *seq += 1;
        *seq
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.clone())
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut c = self.cursor();
        match c.place(key) {
            Ok(Some((k, v, flags))) if k == key && flags & BUCKET_LEAF_FLAG == 0 => v,
            _ => None,
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.tx()?.writable() {
            return Err(Error::ReadOnly);
        }
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        let mut c = self.cursor();
        let found = c.place(key)?;
        if let Some((k, _, flags)) = &found {
            if k.as_slice() == key && flags & BUCKET_LEAF_FLAG != 0 {
                return Err(Error::IncompatibleValue);
            }
        }
        let node = c.node()?;
        node.put(key, key.to_vec(), value.to_vec(), 0, 0);
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if !self.tx()?.writable() {
            return Err(Error::ReadOnly);
        }
        let mut c = self.cursor();
        match c.place(key)? {
            Some((k, _, flags)) if k.as_slice() == key => {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::IncompatibleValue);
                }
                c.node()?.del(key);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn bucket(&self, name: &[u8]) -> Option<Bucket> {
        if let Some(b) = self.0.sub_buckets.lock().get(name) {
            return Some(b.clone());
        }
        let mut c = self.cursor();
        let (k, v, flags) = c.place(name).ok().flatten()?;
        if k != name || flags & BUCKET_LEAF_FLAG == 0 {
            return None;
        }
        let child = self.open_inline(v?).ok()?;
        self.0.sub_buckets.lock().insert(name.to_vec(), child.clone());
        Some(child)
    }

    fn open_inline(&self, value: Vec<u8>) -> Result<Bucket> {
        if value.len() < BUCKET_HEADER_SIZE {
            return Err(Error::Corrupt("truncated bucket header".into()));
        }
        let root_pgid = u64::from_le_bytes(value[0..8].try_into().unwrap());
        let sequence = u64::from_le_bytes(value[8..16].try_into().unwrap());
        let child = Bucket::new(self.0.tx.clone(), root_pgid);
        child.set_sequence(sequence);
        if root_pgid == 0 {
            *child.0.inline_page.lock() = Some(value[BUCKET_HEADER_SIZE..].to_vec());
        }
        Ok(child)
    }

    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket> {
        if !self.tx()?.writable() {
            return Err(Error::ReadOnly);
        }
        if name.is_empty() {
            return Err(Error::KeyRequired);
        }
        let mut c = self.cursor();
        if let Some((k, _, flags)) = c.place(name)? {
            if k == name {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::BucketExists);
                }
                return Err(Error::IncompatibleValue);
            }
        }
        let child = Bucket::new_empty(self.0.tx.clone());
        let value = child.inline_value()?;
        c.node()?.put(name, name.to_vec(), value, 0, BUCKET_LEAF_FLAG);
        self.0.sub_buckets.lock().insert(name.to_vec(), child.clone());
        Ok(child)
    }

    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket> {
        match self.create_bucket(name) {
            Ok(b) => Ok(b),
            Err(Error::BucketExists) => self.bucket(name).ok_or(Error::BucketNotFound),
            Err(e) => Err(e),
        }
    }

    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        if !self.tx()?.writable() {
            return Err(Error::ReadOnly);
        }
        let child = self.bucket(name).ok_or(Error::BucketNotFound)?;
        child.free_recursive()?;
        self.0.sub_buckets.lock().remove(name);
        let mut c = self.cursor();
        c.place(name)?;
        c.node()?.del(name);
        Ok(())
    }

    /// Frees every page reachable from this bucket's subtree, recursing
    /// into nested buckets first.
    fn free_recursive(&self) -> Result<()> {
        let bucket_names = {
            let mut out = Vec::new();
            let mut c = self.cursor();
            let mut next = c.first_raw()?;
            while let Some((k, _, flags)) = next {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    out.push(k);
                }
                next = c.next_raw()?;
            }
            out
        };
        for name in &bucket_names {
            if let Some(child) = self.bucket(name) {
                child.free_recursive()?;
            }
        }
        if self.root_pgid() != 0 || self.0.root_node.lock().is_some() {
            let tx = self.tx()?;
            let page_size = tx.page_size();
            for pgid in self.reachable_pages()? {
                let pn = self.page_node(pgid)?;
                if pn.page_id() == 0 {
                    continue;
                }
                tx.free_page(pgid, pn.overflow(page_size))?;
            }
        }
        Ok(())
    }

    fn reachable_pages(&self) -> Result<Vec<PageId>> {
        let mut out = Vec::new();
        let root = self.root_pgid();
        if root == 0 {
            if let Some(node) = self.0.root_node.lock().clone() {
                if node.page_id() != 0 {
                    out.push(node.page_id());
                }
            }
            return Ok(out);
        }
        let mut stack = vec![root];
        while let Some(pgid) = stack.pop() {
            let pn = self.page_node(pgid)?;
            out.push(pgid);
            if !pn.is_leaf() {
                for i in 0..pn.count() {
                    if let Some(child) = pn.child_pgid_at(i) {
                        stack.push(child);
                    }
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn page_node(&self, id: PageId) -> Result<PageNode> {
        if self.root_pgid() == 0 {
            if let Some(root) = self.0.root_node.lock().clone() {
                return Ok(PageNode::Node(root));
            }
            if let Some(bytes) = self.0.inline_page.lock().clone() {
                let page = Page::from_bytes(&bytes)?;
                return Ok(PageNode::Page(Arc::new(DecodedPage::from_page(&page)?)));
            }
            return Err(Error::InvalidPage("bucket has no root".into()));
        }
        if let Some(node) = self.0.nodes.lock().get(&id) {
            return Ok(PageNode::Node(node.clone()));
        }
        if let Some(dp) = self.0.page_cache.lock().get(&id) {
            return Ok(PageNode::Page(dp.clone()));
        }
        let tx = self.tx()?;
        let dp = tx.with_page(id, DecodedPage::from_page)?;
        let arc = Arc::new(dp);
        self.0.page_cache.lock().insert(id, arc.clone());
        Ok(PageNode::Page(arc))
    }

    /// Promotes the page at `id` to a mutable [`Node`], caching it and
    /// linking it under `parent` (or installing it as this bucket's root
    /// node when `parent` is `None`).
    pub(crate) fn node(&self, id: PageId, parent: Option<&Node>) -> Result<Node> {
        if let Some(n) = self.0.nodes.lock().get(&id) {
            return Ok(n.clone());
        }
        let tx = self.tx()?;
        let node = Node::new(tx.downgrade(), NodeType::Leaf);
        if let Some(p) = parent {
            node.set_parent(p);
            p.add_child(node.clone());
        } else {
            node.set_root(true);
            *self.0.root_node.lock() = Some(node.clone());
        }
        if self.root_pgid() == 0 {
            let bytes = self
                .0
                .inline_page
                .lock()
                .clone()
                .ok_or_else(|| Error::InvalidPage("inline bucket has no backing page".into()))?;
            let page = Page::from_bytes(&bytes)?;
            node.read(&page)?;
        } else {
            tx.with_page(id, |page| node.read(page))?;
        }
        self.0.nodes.lock().insert(id, node.clone());
        Ok(node)
    }

    /// A bucket is inlineable iff its root is a leaf, holds no sub-bucket
    /// entries, and its serialized page is small.
    pub(crate) fn inlineable(&self) -> bool {
        let root = self.0.root_node.lock();
        let node = match root.as_ref() {
            Some(n) if n.is_leaf() => n,
            _ => return false,
        };
        for i in 0..node.num_children() {
            if let Some((_, _, flags, _)) = node.inode_at(i) {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return false;
                }
            }
        }
        let page_size = match self.tx() {
            Ok(tx) => tx.page_size(),
            Err(_) => return false,
        };
        let size = node.size();
        size <= MAX_INLINE_BUCKET_SIZE && size <= page_size / 4
    }

    /// Serializes the inline bucket header followed by the root leaf's
    /// page payload, for storing as a parent bucket's value.
    pub(crate) fn inline_value(&self) -> Result<Vec<u8>> {
        let root = self.0.root_node.lock();
        let node = root.as_ref().ok_or_else(|| Error::InvalidPage("bucket has no root node".into()))?;
        let mut out = Vec::with_capacity(BUCKET_HEADER_SIZE + node.size());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&self.sequence().to_le_bytes());
        out.extend_from_slice(&node.build_inline_page().buf);
        Ok(out)
    }

    /// Recurses into every sub-bucket, inlining it or spilling it and
    /// rewriting its parent entry, then spills this bucket's own root.
    pub(crate) fn spill(&self) -> Result<()> {
        let names: Vec<Vec<u8>> = self.0.sub_buckets.lock().keys().cloned().collect();
        for name in names {
            let child = self.0.sub_buckets.lock().get(&name).cloned().expect("name came from this map");
            let value = if child.inlineable() {
                child.0.page_cache.lock().clear();
                child.inline_value()?
            } else {
                child.spill()?;
                let mut v = Vec::with_capacity(BUCKET_HEADER_SIZE);
                v.extend_from_slice(&child.root_pgid().to_le_bytes());
                v.extend_from_slice(&child.sequence().to_le_bytes());
                v
            };
            if child.0.root_node.lock().is_none() {
                continue;
            }

            let mut c = self.cursor();
            match c.place(&name)? {
                Some((k, _, flags)) if k == name => {
                    if flags & BUCKET_LEAF_FLAG == 0 {
                        return Err(Error::InvalidPage("expected bucket-leaf entry".into()));
                    }
                }
                _ => return Err(Error::InvalidPage("misplaced bucket header".into())),
            }
            c.node()?.put(&name, name.clone(), value, 0, BUCKET_LEAF_FLAG);
        }

        let root = self.0.root_node.lock().clone();
        if let Some(root) = root {
            let new_root = root.spill()?;
            *self.0.root_pgid.lock() = new_root.page_id();
            *self.0.root_node.lock() = Some(new_root);
        }
        Ok(())
    }

    /// Propagates rebalance into every in-memory node, then recurses into
    /// sub-buckets.
    pub(crate) fn rebalance(&self) -> Result<()> {
        let nodes: Vec<Node> = self.0.nodes.lock().values().cloned().collect();
        for node in &nodes {
            node.rebalance()?;
        }
        let root = self.0.root_node.lock().clone();
        if let Some(root) = root {
            root.rebalance()?;
        }
        let children: Vec<Bucket> = self.0.sub_buckets.lock().values().cloned().collect();
        for child in &children {
            child.rebalance()?;
        }
        Ok(())
    }
}
