mod bucket;
mod cursor;
mod db;
mod error;
mod free_list;
mod inode;
mod meta;
mod node;
mod page;
mod transaction;
mod utils;

pub use bucket::Bucket;
pub use cursor::{Cursor, CursorIter};
pub use db::{DBBuilder, DB};
pub use error::{Error, Result};
pub use transaction::Transaction;
