pub mod error;
pub mod storage;
pub mod tree;

pub use error::{TreeError, TreeResult};
pub use storage::store::{BlockStore, StoreStream};
pub use tree::{BPlusTree, BytesTree, IndexTree, StringTree};
