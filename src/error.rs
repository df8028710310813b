use thiserror::Error as ThisError;

/// All failure modes a caller of this crate can observe.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("database is opened read-only")]
    ReadOnly,

    #[error("bucket already exists")]
    BucketExists,

    #[error("value is the wrong type for this key (bucket vs plain value)")]
    IncompatibleValue,

    #[error("bucket not found")]
    BucketNotFound,

    #[error("page {0} is out of bounds")]
    PageOutOfBounds(u64),

    #[error("page {0} freed more than once")]
    DoubleFree(u64),

    #[error("invalid page: {0}")]
    InvalidPage(String),

    #[error("database file is corrupt: {0}")]
    Corrupt(String),

    #[error("key is required")]
    KeyRequired,

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
