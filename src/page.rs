use crate::error::{Error, Result};

pub type PageId = u64;

pub const PAGE_HEADER_SIZE: usize = 16;

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x10;

pub const BUCKET_LEAF_FLAG: u32 = 0x01;

const LEAF_ELEM_SIZE: usize = 16;
const BRANCH_ELEM_SIZE: usize = 16;

/// A key/value pair decoded from a leaf page.
#[derive(Debug, Clone)]
pub struct LeafElement {
    pub flags: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A key/child-page pair decoded from a branch page.
#[derive(Debug, Clone)]
pub struct BranchElement {
    pub key: Vec<u8>,
    pub page_id: PageId,
}

/// A read-only view over a page's bytes, borrowed from the mmap or from an
/// `OwnedPage` built during a write transaction.
pub struct Page<'a> {
    pub id: PageId,
    pub flags: u16,
    pub count: u16,
    pub overflow: u32,
    body: &'a [u8],
}

impl<'a> Page<'a> {
    pub fn from_bytes(buf: &'a [u8]) -> Result<Page<'a>> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::InvalidPage("page shorter than header".into()));
        }
        let id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let flags = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let count = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        let overflow = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        Ok(Page {
            id,
            flags,
            count,
            overflow,
            body: &buf[PAGE_HEADER_SIZE..],
        })
    }

    pub fn is_branch(&self) -> bool {
        self.flags & BRANCH_PAGE_FLAG != 0
    }
    pub fn is_leaf(&self) -> bool {
        self.flags & LEAF_PAGE_FLAG != 0
    }
    pub fn is_meta(&self) -> bool {
        self.flags & META_PAGE_FLAG != 0
    }
    pub fn is_freelist(&self) -> bool {
        self.flags & FREELIST_PAGE_FLAG != 0
    }

    pub fn meta_bytes(&self) -> &[u8] {
        self.body
    }

    pub fn leaf_elements(&self) -> Result<Vec<LeafElement>> {
        let mut out = Vec::with_capacity(self.count as usize);
        for i in 0..self.count as usize {
            let off = i * LEAF_ELEM_SIZE;
            let rec = self
                .body
                .get(off..off + LEAF_ELEM_SIZE)
                .ok_or_else(|| Error::InvalidPage("leaf element out of bounds".into()))?;
            let flags = u32::from_le_bytes(rec[0..4].try_into().unwrap());
            let pos = u32::from_le_bytes(rec[4..8].try_into().unwrap()) as usize;
            let ksize = u32::from_le_bytes(rec[8..12].try_into().unwrap()) as usize;
            let vsize = u32::from_le_bytes(rec[12..16].try_into().unwrap()) as usize;
            let data_off = off + pos;
            let key = self
                .body
                .get(data_off..data_off + ksize)
                .ok_or_else(|| Error::InvalidPage("leaf key out of bounds".into()))?
                .to_vec();
            let value = self
                .body
                .get(data_off + ksize..data_off + ksize + vsize)
                .ok_or_else(|| Error::InvalidPage("leaf value out of bounds".into()))?
                .to_vec();
            out.push(LeafElement { flags, key, value });
        }
        Ok(out)
    }

    pub fn branch_elements(&self) -> Result<Vec<BranchElement>> {
        let mut out = Vec::with_capacity(self.count as usize);
        for i in 0..self.count as usize {
            let off = i * BRANCH_ELEM_SIZE;
            let rec = self
                .body
                .get(off..off + BRANCH_ELEM_SIZE)
                .ok_or_else(|| Error::InvalidPage("branch element out of bounds".into()))?;
            let pos = u32::from_le_bytes(rec[0..4].try_into().unwrap()) as usize;
            let ksize = u32::from_le_bytes(rec[4..8].try_into().unwrap()) as usize;
            let page_id = u64::from_le_bytes(rec[8..16].try_into().unwrap());
            let data_off = off + pos;
            let key = self
                .body
                .get(data_off..data_off + ksize)
                .ok_or_else(|| Error::InvalidPage("branch key out of bounds".into()))?
                .to_vec();
            out.push(BranchElement { key, page_id });
        }
        Ok(out)
    }

    /// Decodes the freelist payload: an optional overflow count followed by
    /// the sorted page ids.
    pub fn free_ids(&self) -> Result<Vec<PageId>> {
        let mut count = self.count as usize;
        let mut begin = 0usize;
        if count == u16::MAX as usize {
            let raw = self
                .body
                .get(0..8)
                .ok_or_else(|| Error::InvalidPage("freelist overflow count missing".into()))?;
            count = u64::from_le_bytes(raw.try_into().unwrap()) as usize;
            begin = 1;
        }
        let mut out = Vec::with_capacity(count);
        for i in begin..begin + count {
            let off = i * 8;
            let raw = self
                .body
                .get(off..off + 8)
                .ok_or_else(|| Error::InvalidPage("freelist id out of bounds".into()))?;
            out.push(u64::from_le_bytes(raw.try_into().unwrap()));
        }
        Ok(out)
    }
}

/// An owned, writable page buffer built while spilling a dirty node or
/// serializing the freelist, ready to be written to the file at commit time.
pub struct OwnedPage {
    pub buf: Vec<u8>,
}

impl OwnedPage {
    pub fn with_capacity(page_size: usize, overflow: u32) -> OwnedPage {
        OwnedPage {
            buf: vec![0u8; page_size * (1 + overflow as usize)],
        }
    }

    /// Allocates a buffer exactly `size` bytes long, with no page-size
    /// rounding. Used for an inline sub-bucket's leaf page, which is
    /// embedded inside its parent's value rather than occupying a page slot.
    pub fn exact(size: usize) -> OwnedPage {
        OwnedPage {
            buf: vec![0u8; size.max(PAGE_HEADER_SIZE)],
        }
    }

    pub fn write_header(&mut self, id: PageId, flags: u16, count: u16, overflow: u32) {
        self.buf[0..8].copy_from_slice(&id.to_le_bytes());
        self.buf[8..10].copy_from_slice(&flags.to_le_bytes());
        self.buf[10..12].copy_from_slice(&count.to_le_bytes());
        self.buf[12..16].copy_from_slice(&overflow.to_le_bytes());
    }

    pub fn id(&self) -> PageId {
        u64::from_le_bytes(self.buf[0..8].try_into().unwrap())
    }

    pub fn overflow(&self) -> u32 {
        u32::from_le_bytes(self.buf[12..16].try_into().unwrap())
    }

    pub fn as_page(&self) -> Result<Page<'_>> {
        Page::from_bytes(&self.buf)
    }

    /// Writes a freelist page body from a sorted list of free page ids.
    pub fn write_ids(&mut self, id: PageId, ids: &[PageId]) {
        let count = ids.len();
        if count == 0 {
            self.write_header(id, FREELIST_PAGE_FLAG, 0, 0);
            return;
        }
        if count < u16::MAX as usize {
            self.write_header(id, FREELIST_PAGE_FLAG, count as u16, 0);
            let body = &mut self.buf[PAGE_HEADER_SIZE..];
            for (i, pid) in ids.iter().enumerate() {
                body[i * 8..i * 8 + 8].copy_from_slice(&pid.to_le_bytes());
            }
        } else {
            self.write_header(id, FREELIST_PAGE_FLAG, u16::MAX, 0);
            let body = &mut self.buf[PAGE_HEADER_SIZE..];
            body[0..8].copy_from_slice(&(count as u64).to_le_bytes());
            for (i, pid) in ids.iter().enumerate() {
                let off = 8 + (i + 1) * 8 - 8;
                body[off..off + 8].copy_from_slice(&pid.to_le_bytes());
            }
        }
    }

    /// Writes a leaf page body. `inodes` is `(flags, key, value)` triples.
    pub fn write_leaf_inodes(&mut self, id: PageId, overflow: u32, inodes: &[(u32, Vec<u8>, Vec<u8>)]) {
        let count = inodes.len();
        self.write_header(id, LEAF_PAGE_FLAG, count as u16, overflow);
        let header_len = PAGE_HEADER_SIZE;
        let mut off = LEAF_ELEM_SIZE * count;
        for (i, (flags, key, value)) in inodes.iter().enumerate() {
            let rec_off = i * LEAF_ELEM_SIZE;
            let pos = (off - rec_off) as u32;
            self.buf[header_len + rec_off..header_len + rec_off + 4].copy_from_slice(&flags.to_le_bytes());
            self.buf[header_len + rec_off + 4..header_len + rec_off + 8].copy_from_slice(&pos.to_le_bytes());
            self.buf[header_len + rec_off + 8..header_len + rec_off + 12]
                .copy_from_slice(&(key.len() as u32).to_le_bytes());
            self.buf[header_len + rec_off + 12..header_len + rec_off + 16]
                .copy_from_slice(&(value.len() as u32).to_le_bytes());
            self.buf[header_len + off..header_len + off + key.len()].copy_from_slice(key);
            self.buf[header_len + off + key.len()..header_len + off + key.len() + value.len()]
                .copy_from_slice(value);
            off += key.len() + value.len();
        }
    }

    /// Writes a branch page body. `inodes` is `(key, child_page_id)` pairs.
    pub fn write_branch_inodes(&mut self, id: PageId, overflow: u32, inodes: &[(Vec<u8>, PageId)]) {
        let count = inodes.len();
        self.write_header(id, BRANCH_PAGE_FLAG, count as u16, overflow);
        let header_len = PAGE_HEADER_SIZE;
        let mut off = BRANCH_ELEM_SIZE * count;
        for (i, (key, page_id)) in inodes.iter().enumerate() {
            let rec_off = i * BRANCH_ELEM_SIZE;
            let pos = (off - rec_off) as u32;
            self.buf[header_len + rec_off..header_len + rec_off + 4].copy_from_slice(&pos.to_le_bytes());
            self.buf[header_len + rec_off + 4..header_len + rec_off + 8]
                .copy_from_slice(&(key.len() as u32).to_le_bytes());
            self.buf[header_len + rec_off + 8..header_len + rec_off + 16].copy_from_slice(&page_id.to_le_bytes());
            self.buf[header_len + off..header_len + off + key.len()].copy_from_slice(key);
            off += key.len();
        }
    }
}

/// Slices a single page (header + overflow run) out of a raw mmap/file
/// buffer and interprets it. Shared by the store (meta selection) and a
/// transaction's page lookups (dirty-page-map miss path).
pub(crate) fn read_page_at(bytes: &[u8], id: PageId, page_size: usize) -> Result<Page<'_>> {
    let off = id as usize * page_size;
    let header = bytes
        .get(off..off + PAGE_HEADER_SIZE)
        .ok_or_else(|| Error::PageOutOfBounds(id))?;
    let overflow = u32::from_le_bytes(header[12..16].try_into().unwrap());
    let size = page_size * (1 + overflow as usize);
    let buf = bytes.get(off..off + size).ok_or_else(|| Error::PageOutOfBounds(id))?;
    Page::from_bytes(buf)
}

/// Byte size of a leaf element header (excludes the key/value bytes).
pub fn leaf_elem_header_size() -> usize {
    LEAF_ELEM_SIZE
}

/// Byte size of a branch element header (excludes the key bytes).
pub fn branch_elem_header_size() -> usize {
    BRANCH_ELEM_SIZE
}
