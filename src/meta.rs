use crate::error::{Error, Result};
use crate::page::{OwnedPage, Page, PageId, META_PAGE_FLAG};

pub const MAGIC: u32 = 0xED0C_DAED;
pub const VERSION: u32 = 2;

const META_SIZE: usize = 64;

/// The double-buffered meta record: root bucket pointer, freelist pointer,
/// transaction id and a checksum, selected at open time by whichever of the
/// two meta pages validates and carries the higher `txid`.
#[derive(Debug, Clone, Copy)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    pub root_pgid: PageId,
    pub sequence: u64,
    pub freelist_pgid: PageId,
    pub max_pgid: PageId,
    pub txid: u64,
    pub checksum: u64,
}

impl Meta {
    pub fn new(page_size: u32) -> Meta {
        Meta {
            magic: MAGIC,
            version: VERSION,
            page_size,
            flags: 0,
            root_pgid: 0,
            sequence: 0,
            freelist_pgid: 0,
            max_pgid: 0,
            txid: 0,
            checksum: 0,
        }
    }

    pub fn read(page: &Page<'_>) -> Result<Meta> {
        if !page.is_meta() {
            return Err(Error::InvalidPage("expected meta page".into()));
        }
        let b = page.meta_bytes();
        if b.len() < META_SIZE {
            return Err(Error::Corrupt("meta page truncated".into()));
        }
        let magic = u32::from_le_bytes(b[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(b[4..8].try_into().unwrap());
        let page_size = u32::from_le_bytes(b[8..12].try_into().unwrap());
        let flags = u32::from_le_bytes(b[12..16].try_into().unwrap());
        let root_pgid = u64::from_le_bytes(b[16..24].try_into().unwrap());
        let sequence = u64::from_le_bytes(b[24..32].try_into().unwrap());
        let freelist_pgid = u64::from_le_bytes(b[32..40].try_into().unwrap());
        let max_pgid = u64::from_le_bytes(b[40..48].try_into().unwrap());
        let txid = u64::from_le_bytes(b[48..56].try_into().unwrap());
        let checksum = u64::from_le_bytes(b[56..64].try_into().unwrap());
        let meta = Meta {
            magic,
            version,
            page_size,
            flags,
            root_pgid,
            sequence,
            freelist_pgid,
            max_pgid,
            txid,
            checksum,
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn write(&self, page: &mut OwnedPage, page_id: PageId) {
        page.write_header(page_id, META_PAGE_FLAG, 0, 0);
        let checksum = self.compute_checksum();
        let b = &mut page.buf[16..16 + META_SIZE];
        b[0..4].copy_from_slice(&self.magic.to_le_bytes());
        b[4..8].copy_from_slice(&self.version.to_le_bytes());
        b[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        b[12..16].copy_from_slice(&self.flags.to_le_bytes());
        b[16..24].copy_from_slice(&self.root_pgid.to_le_bytes());
        b[24..32].copy_from_slice(&self.sequence.to_le_bytes());
        b[32..40].copy_from_slice(&self.freelist_pgid.to_le_bytes());
        b[40..48].copy_from_slice(&self.max_pgid.to_le_bytes());
        b[48..56].copy_from_slice(&self.txid.to_le_bytes());
        b[56..64].copy_from_slice(&checksum.to_le_bytes());
    }

    /// FNV-1a over every field but the checksum itself.
    pub fn compute_checksum(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let prime: u64 = 0x0000_0100_0000_01B3;
        let mut feed = |bytes: &[u8]| {
            for b in bytes {
                hash ^= *b as u64;
                hash = hash.wrapping_mul(prime);
            }
        };
        feed(&self.magic.to_le_bytes());
        feed(&self.version.to_le_bytes());
        feed(&self.page_size.to_le_bytes());
        feed(&self.flags.to_le_bytes());
        feed(&self.root_pgid.to_le_bytes());
        feed(&self.sequence.to_le_bytes());
        feed(&self.freelist_pgid.to_le_bytes());
        feed(&self.max_pgid.to_le_bytes());
        feed(&self.txid.to_le_bytes());
        hash
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Corrupt("meta magic mismatch".into()));
        }
        if self.version != VERSION {
            return Err(Error::Corrupt(format!("unsupported meta version {}", self.version)));
        }
        if self.checksum != self.compute_checksum() {
            return Err(Error::Corrupt("meta checksum mismatch".into()));
        }
        Ok(())
    }
}
