pub mod b_plus_tree;
pub mod index_iterator;
pub mod key_manager;

pub use b_plus_tree::BPlusTree;
pub use index_iterator::IndexIterator;
pub use key_manager::KeyManager;
