use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::inode::Inode;
use crate::page::{self, OwnedPage, Page, PageId};
use crate::transaction::{Transaction, WeakTransaction};

const MIN_KEYS_PER_PAGE: usize = 2;
const FILL_PERCENT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeType {
    Branch,
    Leaf,
}

pub(crate) struct InnerNode {
    tx: WeakTransaction,
    node_type: Mutex<NodeType>,
    is_root: Mutex<bool>,
    page_id: Mutex<PageId>,
    unbalanced: Mutex<bool>,
    spilled: Mutex<bool>,
    key: Mutex<Vec<u8>>,
    inodes: Mutex<Vec<Inode>>,
    parent: Mutex<WeakNode>,
    children: Mutex<Vec<Node>>,
}

/// An in-memory branch or leaf node, mutable behind `Arc<Mutex<_>>` so a
/// node can be reached both from its parent's `children` list and from a
/// bucket's lazily-populated node cache, and so a transaction (and every
/// node it owns) can move across threads. Holds a weak handle straight to
/// its owning transaction rather than to its bucket, since every
/// page/allocate operation a node needs lives on the transaction.
#[derive(Clone)]
pub(crate) struct Node(pub(crate) Arc<InnerNode>);

#[derive(Clone)]
pub(crate) struct WeakNode(Weak<InnerNode>);

impl WeakNode {
    pub(crate) fn new() -> WeakNode {
        WeakNode(Weak::new())
    }
    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(Node)
    }
}

impl Node {
    pub(crate) fn new(tx: WeakTransaction, node_type: NodeType) -> Node {
        Node(Arc::new(InnerNode {
            tx,
            node_type: Mutex::new(node_type),
            is_root: Mutex::new(false),
            page_id: Mutex::new(0),
            unbalanced: Mutex::new(false),
            spilled: Mutex::new(false),
            key: Mutex::new(Vec::new()),
            inodes: Mutex::new(Vec::new()),
            parent: Mutex::new(WeakNode::new()),
            children: Mutex::new(Vec::new()),
        }))
    }

    pub(crate) fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.0))
    }

    fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn node_type(&self) -> NodeType {
        *self.0.node_type.lock()
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.node_type() == NodeType::Leaf
    }

    pub(crate) fn min_keys(&self) -> usize {
        if self.is_leaf() {
            1
        } else {
            2
        }
    }

    pub(crate) fn page_id(&self) -> PageId {
        *self.0.page_id.lock()
    }
    pub(crate) fn set_page_id(&self, id: PageId) {
        *self.0.page_id.lock() = id;
    }

    pub(crate) fn set_root(&self, v: bool) {
        *self.0.is_root.lock() = v;
    }
    pub(crate) fn is_root(&self) -> bool {
        *self.0.is_root.lock()
    }

    pub(crate) fn mark_unbalanced(&self) {
        *self.0.unbalanced.lock() = true;
    }

    pub(crate) fn parent(&self) -> Option<Node> {
        self.0.parent.lock().upgrade()
    }
    pub(crate) fn set_parent(&self, p: &Node) {
        *self.0.parent.lock() = p.downgrade();
    }
    fn clear_parent(&self) {
        *self.0.parent.lock() = WeakNode::new();
    }

    pub(crate) fn key(&self) -> Vec<u8> {
        self.0.key.lock().clone()
    }
    pub(crate) fn set_key(&self, key: Vec<u8>) {
        *self.0.key.lock() = key;
    }

    pub(crate) fn num_children(&self) -> usize {
        self.0.inodes.lock().len()
    }

    pub(crate) fn children(&self) -> Vec<Node> {
        self.0.children.lock().clone()
    }
    pub(crate) fn add_child(&self, child: Node) {
        self.0.children.lock().push(child);
    }

    fn tx(&self) -> Result<Transaction> {
        self.0
            .tx
            .upgrade()
            .ok_or_else(|| Error::InvalidPage("transaction no longer live".into()))
    }

    /// Populates this node's inodes from a decoded page.
    pub(crate) fn read(&self, page: &Page<'_>) -> Result<()> {
        *self.0.node_type.lock() = if page.is_leaf() { NodeType::Leaf } else { NodeType::Branch };
        *self.0.page_id.lock() = page.id;
        let mut inodes = Vec::with_capacity(page.count as usize);
        if page.is_leaf() {
            for e in page.leaf_elements()? {
                inodes.push(Inode::leaf(e.flags, e.key, e.value));
            }
        } else {
            for e in page.branch_elements()? {
                inodes.push(Inode::branch(e.key, e.page_id));
            }
        }
        if let Some(first) = inodes.first() {
            *self.0.key.lock() = first.key().to_vec();
        }
        *self.0.inodes.lock() = inodes;
        Ok(())
    }

    fn elem_header_size(&self) -> usize {
        if self.is_leaf() {
            page::leaf_elem_header_size()
        } else {
            page::branch_elem_header_size()
        }
    }

    /// Estimated serialized size, including the page header.
    pub(crate) fn size(&self) -> usize {
        let header = self.elem_header_size();
        let mut sz = page::PAGE_HEADER_SIZE;
        for inode in self.0.inodes.lock().iter() {
            sz += header + inode.size();
        }
        sz
    }

    /// Inserts or updates a key. `old_key` identifies the inode to replace
    /// when a key is being renamed (e.g. after a child's first key shifts);
    /// pass the same value as `key` for a plain insert/update.
    pub(crate) fn put(&self, old_key: &[u8], key: Vec<u8>, value: Vec<u8>, page_id: PageId, flags: u32) {
        let mut inodes = self.0.inodes.lock();
        let idx = match inodes.binary_search_by(|n| n.key().cmp(old_key)) {
            Ok(i) => i,
            Err(i) => i,
        };
        let exact = inodes.get(idx).map(|n| n.key() == old_key).unwrap_or(false);
        let inode = if self.is_leaf() {
            Inode::leaf(flags, key, value)
        } else {
            Inode::branch(key, page_id)
        };
        if exact {
            inodes[idx] = inode;
        } else {
            inodes.insert(idx, inode);
        }
    }

    pub(crate) fn del(&self, key: &[u8]) {
        let mut inodes = self.0.inodes.lock();
        if let Ok(idx) = inodes.binary_search_by(|n| n.key().cmp(key)) {
            inodes.remove(idx);
            drop(inodes);
            self.mark_unbalanced();
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<(Vec<u8>, Option<Vec<u8>>, u32)> {
        let inodes = self.0.inodes.lock();
        inodes.binary_search_by(|n| n.key().cmp(key)).ok().map(|idx| {
            let n = &inodes[idx];
            (n.key().to_vec(), n.value().map(|v| v.to_vec()), n.flags())
        })
    }

    /// Returns `(key, value_or_none, flags, child_page_id_or_none)` at `idx`.
    pub(crate) fn inode_at(&self, idx: usize) -> Option<(Vec<u8>, Option<Vec<u8>>, u32, Option<PageId>)> {
        let inodes = self.0.inodes.lock();
        inodes
            .get(idx)
            .map(|n| (n.key().to_vec(), n.value().map(|v| v.to_vec()), n.flags(), n.page_id()))
    }

    fn take_child_by_key(&self, key: &[u8]) -> Option<Node> {
        let mut children = self.0.children.lock();
        children.iter().position(|c| c.key() == key).map(|pos| children.remove(pos))
    }

    fn split_index(&self, threshold: usize) -> usize {
        let inodes = self.0.inodes.lock();
        let header = self.elem_header_size();
        let mut sz = page::PAGE_HEADER_SIZE;
        for (i, inode) in inodes.iter().enumerate() {
            if i >= MIN_KEYS_PER_PAGE && sz > threshold {
                return i;
            }
            sz += header + inode.size();
        }
        inodes.len()
    }

    fn split_two(&self, page_size: usize) -> (Node, Option<Node>) {
        let too_few = self.0.inodes.lock().len() <= MIN_KEYS_PER_PAGE * 2;
        if too_few || self.size() < page_size {
            return (self.clone(), None);
        }
        let threshold = (page_size as f64 * FILL_PERCENT) as usize;
        let split_index = self.split_index(threshold).max(MIN_KEYS_PER_PAGE);
        if split_index >= self.0.inodes.lock().len() {
            return (self.clone(), None);
        }

        let sibling = Node::new(self.0.tx.clone(), self.node_type());
        let tail = {
            let mut inodes = self.0.inodes.lock();
            inodes.split_off(split_index)
        };
        let sibling_key = tail.first().map(|n| n.key().to_vec()).unwrap_or_default();
        *sibling.0.inodes.lock() = tail;
        sibling.set_key(sibling_key);

        if let Some(parent) = self.parent() {
            sibling.set_parent(&parent);
        }

        if !sibling.is_leaf() {
            let child_keys: Vec<Vec<u8>> = sibling.0.inodes.lock().iter().map(|i| i.key().to_vec()).collect();
            for key in child_keys {
                if let Some(child) = self.take_child_by_key(&key) {
                    child.set_parent(&sibling);
                    sibling.add_child(child);
                }
            }
        }
        (self.clone(), Some(sibling))
    }

    /// Splits this node into one or more pages' worth of node, if it has
    /// grown past a single page.
    fn split(&self, page_size: usize) -> Vec<Node> {
        let mut out = Vec::new();
        let mut current = self.clone();
        loop {
            let (first, rest) = current.split_two(page_size);
            out.push(first);
            match rest {
                Some(n) => current = n,
                None => break,
            }
        }
        out
    }

    /// Overflow page count this node would need if spilled at `page_size`.
    pub(crate) fn overflow(&self, page_size: usize) -> u32 {
        ((self.size().saturating_sub(1)) / page_size) as u32
    }

    /// Builds a tightly-sized leaf page (no page-size rounding, id 0) for
    /// embedding as an inline sub-bucket value.
    pub(crate) fn build_inline_page(&self) -> OwnedPage {
        let size = self.size();
        let mut owned = OwnedPage::exact(size);
        let items: Vec<(u32, Vec<u8>, Vec<u8>)> = self
            .0
            .inodes
            .lock()
            .iter()
            .map(|n| (n.flags(), n.key().to_vec(), n.value().unwrap_or(&[]).to_vec()))
            .collect();
        owned.write_leaf_inodes(0, 0, &items);
        owned
    }

    fn build_page(&self, page_size: usize, id: PageId) -> OwnedPage {
        let overflow = ((self.size().saturating_sub(1)) / page_size) as u32;
        let mut owned = OwnedPage::with_capacity(page_size, overflow);
        let inodes = self.0.inodes.lock();
        if self.is_leaf() {
            let items: Vec<(u32, Vec<u8>, Vec<u8>)> = inodes
                .iter()
                .map(|n| (n.flags(), n.key().to_vec(), n.value().unwrap_or(&[]).to_vec()))
                .collect();
            owned.write_leaf_inodes(id, overflow, &items);
        } else {
            let items: Vec<(Vec<u8>, PageId)> = inodes
                .iter()
                .map(|n| (n.key().to_vec(), n.page_id().expect("branch inode missing page id")))
                .collect();
            owned.write_branch_inodes(id, overflow, &items);
        }
        owned
    }

    /// Entry point used by a bucket on its root node: spills the whole
    /// subtree to newly allocated pages and, if the root itself had to
    /// split, wraps the results in a fresh branch root and returns it. The
    /// bucket is responsible for adopting the returned node as its new root.
    pub(crate) fn spill(&self) -> Result<Node> {
        let new_nodes = self.spill_inner()?;
        if new_nodes.len() > 1 {
            let new_root = Node::new(self.0.tx.clone(), NodeType::Branch);
            new_root.set_root(true);
            for node in &new_nodes {
                new_root.0.inodes.lock().push(Inode::branch(node.key(), node.page_id()));
                node.set_parent(&new_root);
                new_root.add_child(node.clone());
            }
            self.set_root(false);
            return new_root.spill();
        }
        Ok(new_nodes.into_iter().next().unwrap_or_else(|| self.clone()))
    }

    /// Writes this node (and any new siblings created by a split) to newly
    /// allocated pages, recursing into children first, and updates the
    /// parent's inode(s) for the resulting key(s)/page id(s) in place.
    /// Returns the sibling nodes this node split into (length 1 if it did
    /// not need to split).
    fn spill_inner(&self) -> Result<Vec<Node>> {
        if *self.0.spilled.lock() {
            return Ok(vec![self.clone()]);
        }
        for child in self.children() {
            child.spill_inner()?;
        }

        self.0.inodes.lock().sort_by(|a, b| a.key().cmp(&b.key()));

        let tx = self.tx()?;
        let page_size = tx.page_size();
        let new_nodes = self.split(page_size);

        let mut result = Vec::with_capacity(new_nodes.len());
        for node in &new_nodes {
            let old_key = node.key();
            if node.page_id() != 0 {
                tx.free_page(node.page_id(), 0)?;
            }
            let overflow = ((node.size().saturating_sub(1)) / page_size) as u32;
            let id = tx.allocate(1 + overflow as usize)?;
            node.set_page_id(id);
            let owned = node.build_page(page_size, id);
            tx.write_page(owned)?;
            *node.0.spilled.lock() = true;
            let new_key = node
                .0
                .inodes
                .lock()
                .first()
                .map(|i| i.key().to_vec())
                .unwrap_or_else(|| old_key.clone());
            node.set_key(new_key.clone());
            trace!("spilled node to page {}", id);

            if let Some(parent) = self.parent() {
                parent.put(&old_key, new_key, Vec::new(), id, 0);
                if !parent.children().iter().any(|c| c.ptr_eq(node)) {
                    node.set_parent(&parent);
                    parent.add_child(node.clone());
                }
            }
            result.push(node.clone());
        }
        Ok(result)
    }

    fn child_index(&self, child: &Node) -> Option<usize> {
        let key = child.key();
        self.0.inodes.lock().iter().position(|n| n.key() == key)
    }

    fn remove_child(&self, child: &Node) {
        let mut children = self.0.children.lock();
        if let Some(pos) = children.iter().position(|c| c.ptr_eq(child)) {
            children.remove(pos);
        }
        drop(children);
        let mut inodes = self.0.inodes.lock();
        if let Some(pos) = inodes.iter().position(|n| n.key() == child.key()) {
            inodes.remove(pos);
        }
    }

    fn sibling_at(&self, offset: isize) -> Option<Node> {
        let parent = self.parent()?;
        let idx = parent.child_index(self)? as isize;
        let target = idx + offset;
        if target < 0 {
            return None;
        }
        parent.children().get(target as usize).cloned()
    }

    fn next_sibling(&self) -> Option<Node> {
        self.sibling_at(1)
    }
    fn prev_sibling(&self) -> Option<Node> {
        self.sibling_at(-1)
    }

    /// Merges this node into a sibling (or collapses the root) if it has
    /// shrunk below the fill threshold, propagating the merge up the tree.
    pub(crate) fn rebalance(&self) -> Result<()> {
        if !*self.0.unbalanced.lock() {
            return Ok(());
        }
        *self.0.unbalanced.lock() = false;

        let tx = self.tx()?;
        let threshold = tx.page_size() / 4;
        if self.size() > threshold && self.num_children() >= self.min_keys() {
            return Ok(());
        }

        match self.parent() {
            None => {
                // Root: collapse a single-child branch into its child.
                if !self.is_leaf() && self.num_children() == 1 {
                    let child = self.0.children.lock()[0].clone();
                    *self.0.inodes.lock() = child.0.inodes.lock().clone();
                    let grandchildren = child.children();
                    *self.0.children.lock() = grandchildren.clone();
                    for gc in &grandchildren {
                        gc.set_parent(self);
                    }
                    *self.0.node_type.lock() = child.node_type();
                    tx.free_node(&child)?;
                }
            }
            Some(parent) => {
                if self.num_children() == 0 {
                    parent.remove_child(self);
                    self.clear_parent();
                    tx.free_node(self)?;
                    parent.mark_unbalanced();
                    return parent.rebalance();
                }

                let use_next = parent.child_index(self) == Some(0);
                let sibling = if use_next { self.next_sibling() } else { self.prev_sibling() };

                if let Some(sibling) = sibling {
                    if use_next {
                        for child in sibling.children() {
                            child.set_parent(self);
                            self.add_child(child);
                        }
                        let moved = std::mem::take(&mut *sibling.0.inodes.lock());
                        self.0.inodes.lock().extend(moved);
                        parent.remove_child(&sibling);
                        tx.free_node(&sibling)?;
                    } else {
                        for child in self.children() {
                            child.set_parent(&sibling);
                            sibling.add_child(child);
                        }
                        let moved = std::mem::take(&mut *self.0.inodes.lock());
                        sibling.0.inodes.lock().extend(moved);
                        parent.remove_child(self);
                        tx.free_node(self)?;
                    }
                    parent.mark_unbalanced();
                    return parent.rebalance();
                }
            }
        }
        Ok(())
    }
}
