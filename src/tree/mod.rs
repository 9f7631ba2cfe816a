pub mod bplus;
pub mod bytes;
pub mod node;

pub use bplus::BPlusTree;
pub use bytes::{BytesTree, StringTree};

use std::cmp::Ordering;

use crate::error::TreeResult;

/// The index contract shared by every tree flavor: keyed access, ordered
/// traversal, footprint control, and transaction boundaries.
///
/// `get` and `remove_key` are fail-fast (`TreeError::KeyNotFound` for an
/// absent key); `contains_key` is the non-throwing probe. `first_key` and
/// `next_key` return `None` at the end of the sequence.
pub trait IndexTree {
    type Value;

    fn set(&mut self, key: &str, value: Self::Value) -> TreeResult<()>;
    fn get(&mut self, key: &str) -> TreeResult<Self::Value>;
    fn contains_key(&mut self, key: &str) -> TreeResult<bool>;
    fn remove_key(&mut self, key: &str) -> TreeResult<()>;

    fn first_key(&mut self) -> TreeResult<Option<String>>;
    fn next_key(&mut self, after: &str) -> TreeResult<Option<String>>;

    /// The tree's total key order, for callers needing external sort
    /// consistency.
    fn compare(&self, left: &str, right: &str) -> Ordering;

    /// Bounds how many clean materialized leaf nodes stay resident.
    /// Eviction never touches dirty nodes and is invisible to callers.
    fn set_footprint_limit(&mut self, limit: usize);

    fn commit(&mut self) -> TreeResult<()>;
    fn abort(&mut self) -> TreeResult<()>;

    /// Flushes and releases the tree without committing or aborting.
    fn shutdown(self) -> TreeResult<()>
    where
        Self: Sized;

    /// Reconciles the free chain against the blocks reachable from the
    /// committed root. Only valid while no uncommitted changes exist.
    fn recover(&mut self, correct_errors: bool) -> TreeResult<()>;
}
