use either::Either;

use crate::page::{PageId, BUCKET_LEAF_FLAG};

/// A single entry inside a node: either a branch pointer to a child page, or
/// a leaf key/value (possibly itself the header of a nested bucket, flagged
/// with `BUCKET_LEAF_FLAG`).
#[derive(Debug, Clone)]
pub(crate) struct Inode(pub(crate) Either<BranchINode, LeafINode>);

impl Inode {
    pub(crate) fn branch(key: Vec<u8>, page_id: PageId) -> Inode {
        Inode(Either::Left(BranchINode { key, page_id }))
    }

    pub(crate) fn leaf(flags: u32, key: Vec<u8>, value: Vec<u8>) -> Inode {
        Inode(Either::Right(LeafINode { flags, key, value }))
    }

    pub(crate) fn key(&self) -> &[u8] {
        match &self.0 {
            Either::Left(b) => &b.key,
            Either::Right(l) => &l.key,
        }
    }

    pub(crate) fn set_key(&mut self, key: Vec<u8>) {
        match &mut self.0 {
            Either::Left(b) => b.key = key,
            Either::Right(l) => l.key = key,
        }
    }

    pub(crate) fn value(&self) -> Option<&[u8]> {
        match &self.0 {
            Either::Left(_) => None,
            Either::Right(l) => Some(&l.value),
        }
    }

    pub(crate) fn page_id(&self) -> Option<PageId> {
        match &self.0 {
            Either::Left(b) => Some(b.page_id),
            Either::Right(_) => None,
        }
    }

    pub(crate) fn flags(&self) -> u32 {
        match &self.0 {
            Either::Left(_) => 0,
            Either::Right(l) => l.flags,
        }
    }

    pub(crate) fn is_bucket(&self) -> bool {
        self.flags() & BUCKET_LEAF_FLAG != 0
    }

    pub(crate) fn size(&self) -> usize {
        match &self.0 {
            Either::Left(b) => b.key.len(),
            Either::Right(l) => l.key.len() + l.value.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BranchINode {
    pub(crate) key: Vec<u8>,
    pub(crate) page_id: PageId,
}

#[derive(Debug, Clone)]
pub(crate) struct LeafINode {
    pub(crate) flags: u32,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
}
