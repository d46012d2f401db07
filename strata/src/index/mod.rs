//! Disk-resident B+ tree index keyed by composite tuple keys.

mod bplus_tree;
mod key;
mod roots;
mod tree_page;

pub use bplus_tree::{BPlusTree, IndexIterator};
pub use key::KeyManager;
pub use tree_page::{TreePageType, LEAF_PAGE_HEADER_SIZE, TREE_PAGE_HEADER_SIZE};

/// A unique identifier for an index across the database.
pub type IndexId = u32;
