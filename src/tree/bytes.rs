//! Typed wrappers layering arbitrary byte-string and UTF-8 string values
//! over the core `i64` tree: each value lives in a chain of raw blocks
//! and the tree stores the chain's head block number.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use log::debug;

use crate::error::{TreeError, TreeResult};
use crate::storage::store::StoreStream;
use crate::tree::IndexTree;
use crate::tree::bplus::BPlusTree;

/// Head chain block: [next u64][total length u32][payload].
const HEAD_OVERHEAD: usize = 12;
/// Continuation chain block: [next u64][payload].
const LINK_OVERHEAD: usize = 8;

/// A B+Tree mapping string keys to arbitrary byte strings.
///
/// Values are stored out of line in block chains allocated from the same
/// store as the tree nodes, so they share the tree's transaction: chain
/// blocks are staged in memory until [`BytesTree::commit`].
pub struct BytesTree<S: StoreStream> {
    tree: BPlusTree<S>,
}

impl<S: StoreStream> BytesTree<S> {
    pub fn create(stream: S, key_length: usize, node_capacity: usize) -> TreeResult<Self> {
        Ok(BytesTree {
            tree: BPlusTree::create(stream, key_length, node_capacity)?,
        })
    }

    pub fn open(stream: S) -> TreeResult<Self> {
        Ok(BytesTree {
            tree: BPlusTree::open(stream)?,
        })
    }

    pub fn key_length(&self) -> usize {
        self.tree.key_length()
    }

    pub fn block_size(&self) -> usize {
        self.tree.block_size()
    }

    pub fn total_block_count(&self) -> u64 {
        self.tree.total_block_count()
    }

    pub fn free_block_count(&self) -> usize {
        self.tree.free_block_count()
    }

    /// Inserts or overwrites; an overwrite frees the old value's chain.
    pub fn set(&mut self, key: &str, value: &[u8]) -> TreeResult<()> {
        if key.len() > self.tree.key_length() {
            return Err(TreeError::BadKeyValue(format!(
                "key {key:?} is longer than {} bytes",
                self.tree.key_length()
            )));
        }
        let old_head = self.tree.lookup(key)?;
        let head = self.write_chain(value);
        self.tree.set(key, head as i64)?;
        if let Some(old) = old_head {
            self.free_chain(old as u64)?;
        }
        Ok(())
    }

    pub fn get(&mut self, key: &str) -> TreeResult<Vec<u8>> {
        let head = self.tree.get(key)?;
        self.read_chain(head as u64)
    }

    pub fn contains_key(&mut self, key: &str) -> TreeResult<bool> {
        self.tree.contains_key(key)
    }

    pub fn remove_key(&mut self, key: &str) -> TreeResult<()> {
        let head = self.tree.get(key)?;
        self.tree.remove_key(key)?;
        self.free_chain(head as u64)
    }

    pub fn first_key(&mut self) -> TreeResult<Option<String>> {
        self.tree.first_key()
    }

    pub fn next_key(&mut self, after: &str) -> TreeResult<Option<String>> {
        self.tree.next_key(after)
    }

    pub fn compare(&self, left: &str, right: &str) -> Ordering {
        self.tree.compare(left, right)
    }

    pub fn set_footprint_limit(&mut self, limit: usize) {
        self.tree.set_footprint_limit(limit);
    }

    pub fn commit(&mut self) -> TreeResult<()> {
        self.tree.commit()
    }

    pub fn abort(&mut self) -> TreeResult<()> {
        self.tree.abort()
    }

    pub fn shutdown(self) -> TreeResult<()> {
        self.tree.shutdown()
    }

    pub fn into_stream(self) -> S {
        self.tree.into_stream()
    }

    /// Like [`BPlusTree::recover`], with value chain blocks counted as
    /// reachable alongside the tree nodes.
    pub fn recover(&mut self, correct_errors: bool) -> TreeResult<()> {
        self.tree.ensure_recoverable()?;
        let (mut reachable, heads) = self.tree.reachable_blocks()?;
        for head in heads {
            self.chain_blocks(head as u64, &mut reachable)?;
        }
        self.tree.finish_recover(reachable, correct_errors)
    }

    /// Stages `value` into a fresh block chain and returns the head block.
    fn write_chain(&mut self, value: &[u8]) -> u64 {
        let block_size = self.tree.block_size();
        let head_payload = block_size - HEAD_OVERHEAD;
        let link_payload = block_size - LINK_OVERHEAD;

        // One head block always, plus continuations for the remainder.
        let rest = value.len().saturating_sub(head_payload);
        let links = rest.div_ceil(link_payload);
        let mut blocks = Vec::with_capacity(1 + links);
        for _ in 0..=links {
            blocks.push(self.tree.allocate_block());
        }

        let head = blocks[0];
        let mut offset = 0usize;
        for (i, &block) in blocks.iter().enumerate() {
            let next = blocks.get(i + 1).copied().unwrap_or(0);
            let mut image = vec![0u8; block_size];
            image[0..8].copy_from_slice(&next.to_le_bytes());
            let payload_at = if i == 0 {
                image[8..12].copy_from_slice(&(value.len() as u32).to_le_bytes());
                HEAD_OVERHEAD
            } else {
                LINK_OVERHEAD
            };
            let take = (value.len() - offset).min(block_size - payload_at);
            image[payload_at..payload_at + take].copy_from_slice(&value[offset..offset + take]);
            offset += take;
            self.tree.stage_block(block, image);
        }
        debug!("staged {} byte value across {} blocks", value.len(), blocks.len());
        head
    }

    fn read_chain(&mut self, head: u64) -> TreeResult<Vec<u8>> {
        let block_size = self.tree.block_size();
        let image = self.tree.read_raw_block(head)?;
        let mut next = u64::from_le_bytes(image[0..8].try_into().unwrap());
        let total = u32::from_le_bytes(image[8..12].try_into().unwrap()) as usize;

        let mut value = Vec::with_capacity(total);
        let take = total.min(block_size - HEAD_OVERHEAD);
        value.extend_from_slice(&image[HEAD_OVERHEAD..HEAD_OVERHEAD + take]);

        let mut visited = 1u64;
        while next != 0 {
            visited += 1;
            if visited > self.tree.total_block_count() {
                return Err(TreeError::BlockFile(format!(
                    "value chain starting at block {head} contains a cycle"
                )));
            }
            let image = self.tree.read_raw_block(next)?;
            next = u64::from_le_bytes(image[0..8].try_into().unwrap());
            let take = (total - value.len()).min(block_size - LINK_OVERHEAD);
            value.extend_from_slice(&image[LINK_OVERHEAD..LINK_OVERHEAD + take]);
        }
        if value.len() != total {
            return Err(TreeError::BlockFile(format!(
                "value chain starting at block {head} holds {} of {total} bytes",
                value.len()
            )));
        }
        Ok(value)
    }

    fn free_chain(&mut self, head: u64) -> TreeResult<()> {
        let mut block = head;
        let mut visited = 0u64;
        while block != 0 {
            visited += 1;
            if visited > self.tree.total_block_count() {
                return Err(TreeError::BlockFile(format!(
                    "value chain starting at block {head} contains a cycle"
                )));
            }
            let image = self.tree.read_raw_block(block)?;
            let next = u64::from_le_bytes(image[0..8].try_into().unwrap());
            self.tree.free_block(block);
            block = next;
        }
        Ok(())
    }

    /// Collects a committed value chain's blocks for recovery.
    fn chain_blocks(&mut self, head: u64, out: &mut HashSet<u64>) -> TreeResult<()> {
        let mut block = head;
        while block != 0 {
            if !out.insert(block) {
                return Err(TreeError::BlockFile(format!(
                    "chain block {block} is referenced more than once"
                )));
            }
            let image = self.tree.read_raw_block(block)?;
            block = u64::from_le_bytes(image[0..8].try_into().unwrap());
        }
        Ok(())
    }
}

impl BytesTree<File> {
    pub fn create_file<P: AsRef<Path>>(
        path: P,
        key_length: usize,
        node_capacity: usize,
    ) -> TreeResult<Self> {
        Ok(BytesTree {
            tree: BPlusTree::create_file(path, key_length, node_capacity)?,
        })
    }

    pub fn open_file<P: AsRef<Path>>(path: P) -> TreeResult<Self> {
        Ok(BytesTree {
            tree: BPlusTree::open_file(path)?,
        })
    }
}

impl<S: StoreStream> IndexTree for BytesTree<S> {
    type Value = Vec<u8>;

    fn set(&mut self, key: &str, value: Vec<u8>) -> TreeResult<()> {
        BytesTree::set(self, key, &value)
    }

    fn get(&mut self, key: &str) -> TreeResult<Vec<u8>> {
        BytesTree::get(self, key)
    }

    fn contains_key(&mut self, key: &str) -> TreeResult<bool> {
        BytesTree::contains_key(self, key)
    }

    fn remove_key(&mut self, key: &str) -> TreeResult<()> {
        BytesTree::remove_key(self, key)
    }

    fn first_key(&mut self) -> TreeResult<Option<String>> {
        BytesTree::first_key(self)
    }

    fn next_key(&mut self, after: &str) -> TreeResult<Option<String>> {
        BytesTree::next_key(self, after)
    }

    fn compare(&self, left: &str, right: &str) -> Ordering {
        BytesTree::compare(self, left, right)
    }

    fn set_footprint_limit(&mut self, limit: usize) {
        BytesTree::set_footprint_limit(self, limit)
    }

    fn commit(&mut self) -> TreeResult<()> {
        BytesTree::commit(self)
    }

    fn abort(&mut self) -> TreeResult<()> {
        BytesTree::abort(self)
    }

    fn shutdown(self) -> TreeResult<()> {
        BytesTree::shutdown(self)
    }

    fn recover(&mut self, correct_errors: bool) -> TreeResult<()> {
        BytesTree::recover(self, correct_errors)
    }
}

/// A B+Tree mapping string keys to UTF-8 string values, layered over
/// [`BytesTree`]. Stored bytes that are not valid UTF-8 surface as
/// `TreeError::BadKeyValue`.
pub struct StringTree<S: StoreStream> {
    tree: BytesTree<S>,
}

impl<S: StoreStream> StringTree<S> {
    pub fn create(stream: S, key_length: usize, node_capacity: usize) -> TreeResult<Self> {
        Ok(StringTree {
            tree: BytesTree::create(stream, key_length, node_capacity)?,
        })
    }

    pub fn open(stream: S) -> TreeResult<Self> {
        Ok(StringTree {
            tree: BytesTree::open(stream)?,
        })
    }

    pub fn set(&mut self, key: &str, value: &str) -> TreeResult<()> {
        self.tree.set(key, value.as_bytes())
    }

    pub fn get(&mut self, key: &str) -> TreeResult<String> {
        let bytes = self.tree.get(key)?;
        String::from_utf8(bytes).map_err(|_| {
            TreeError::BadKeyValue(format!("value for key {key:?} is not valid UTF-8"))
        })
    }

    pub fn contains_key(&mut self, key: &str) -> TreeResult<bool> {
        self.tree.contains_key(key)
    }

    pub fn remove_key(&mut self, key: &str) -> TreeResult<()> {
        self.tree.remove_key(key)
    }

    pub fn first_key(&mut self) -> TreeResult<Option<String>> {
        self.tree.first_key()
    }

    pub fn next_key(&mut self, after: &str) -> TreeResult<Option<String>> {
        self.tree.next_key(after)
    }

    pub fn compare(&self, left: &str, right: &str) -> Ordering {
        self.tree.compare(left, right)
    }

    pub fn set_footprint_limit(&mut self, limit: usize) {
        self.tree.set_footprint_limit(limit);
    }

    pub fn commit(&mut self) -> TreeResult<()> {
        self.tree.commit()
    }

    pub fn abort(&mut self) -> TreeResult<()> {
        self.tree.abort()
    }

    pub fn shutdown(self) -> TreeResult<()> {
        self.tree.shutdown()
    }

    pub fn into_stream(self) -> S {
        self.tree.into_stream()
    }

    pub fn recover(&mut self, correct_errors: bool) -> TreeResult<()> {
        self.tree.recover(correct_errors)
    }
}

impl StringTree<File> {
    pub fn create_file<P: AsRef<Path>>(
        path: P,
        key_length: usize,
        node_capacity: usize,
    ) -> TreeResult<Self> {
        Ok(StringTree {
            tree: BytesTree::create_file(path, key_length, node_capacity)?,
        })
    }

    pub fn open_file<P: AsRef<Path>>(path: P) -> TreeResult<Self> {
        Ok(StringTree {
            tree: BytesTree::open_file(path)?,
        })
    }
}

impl<S: StoreStream> IndexTree for StringTree<S> {
    type Value = String;

    fn set(&mut self, key: &str, value: String) -> TreeResult<()> {
        StringTree::set(self, key, &value)
    }

    fn get(&mut self, key: &str) -> TreeResult<String> {
        StringTree::get(self, key)
    }

    fn contains_key(&mut self, key: &str) -> TreeResult<bool> {
        StringTree::contains_key(self, key)
    }

    fn remove_key(&mut self, key: &str) -> TreeResult<()> {
        StringTree::remove_key(self, key)
    }

    fn first_key(&mut self) -> TreeResult<Option<String>> {
        StringTree::first_key(self)
    }

    fn next_key(&mut self, after: &str) -> TreeResult<Option<String>> {
        StringTree::next_key(self, after)
    }

    fn compare(&self, left: &str, right: &str) -> Ordering {
        StringTree::compare(self, left, right)
    }

    fn set_footprint_limit(&mut self, limit: usize) {
        StringTree::set_footprint_limit(self, limit)
    }

    fn commit(&mut self) -> TreeResult<()> {
        StringTree::commit(self)
    }

    fn abort(&mut self) -> TreeResult<()> {
        StringTree::abort(self)
    }

    fn shutdown(self) -> TreeResult<()> {
        StringTree::shutdown(self)
    }

    fn recover(&mut self, correct_errors: bool) -> TreeResult<()> {
        StringTree::recover(self, correct_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn memory_bytes_tree() -> BytesTree<Cursor<Vec<u8>>> {
        BytesTree::create(Cursor::new(Vec::new()), 16, 4).unwrap()
    }

    #[test]
    fn small_value_roundtrip() {
        let mut tree = memory_bytes_tree();
        tree.set("k", b"hello").unwrap();
        assert_eq!(tree.get("k").unwrap(), b"hello");
    }

    #[test]
    fn empty_value_roundtrip() {
        let mut tree = memory_bytes_tree();
        tree.set("empty", b"").unwrap();
        assert_eq!(tree.get("empty").unwrap(), Vec::<u8>::new());
        assert!(tree.contains_key("empty").unwrap());
    }

    #[test]
    fn multi_block_value_roundtrip() {
        let mut tree = memory_bytes_tree();
        let value: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        tree.set("big", &value).unwrap();
        assert_eq!(tree.get("big").unwrap(), value);

        tree.commit().unwrap();
        let mut tree = BytesTree::open(tree.into_stream()).unwrap();
        assert_eq!(tree.get("big").unwrap(), value);
    }

    #[test]
    fn overwrite_frees_old_chain() {
        let mut tree = memory_bytes_tree();
        let big: Vec<u8> = vec![7u8; 4000];
        tree.set("k", &big).unwrap();
        tree.commit().unwrap();

        tree.set("k", b"tiny").unwrap();
        tree.commit().unwrap();
        assert_eq!(tree.get("k").unwrap(), b"tiny");
        // The old chain's blocks are back on the free chain.
        assert!(tree.free_block_count() > 0);
    }

    #[test]
    fn remove_frees_chain_and_key() {
        let mut tree = memory_bytes_tree();
        tree.set("gone", &vec![1u8; 2000]).unwrap();
        tree.commit().unwrap();
        tree.remove_key("gone").unwrap();
        tree.commit().unwrap();
        assert!(!tree.contains_key("gone").unwrap());
        assert!(tree.free_block_count() > 0);
        assert!(matches!(
            tree.remove_key("gone"),
            Err(TreeError::KeyNotFound(_))
        ));
    }

    #[test]
    fn abort_discards_staged_chains() {
        let mut tree = memory_bytes_tree();
        tree.set("kept", b"v1").unwrap();
        tree.commit().unwrap();
        tree.set("kept", b"v2").unwrap();
        tree.set("new", b"x").unwrap();
        tree.abort().unwrap();
        assert_eq!(tree.get("kept").unwrap(), b"v1");
        assert!(!tree.contains_key("new").unwrap());
    }

    #[test]
    fn recover_accounts_for_chain_blocks() {
        let mut tree = memory_bytes_tree();
        tree.set("a", &vec![3u8; 3000]).unwrap();
        tree.set("b", b"short").unwrap();
        tree.commit().unwrap();
        let mut tree = BytesTree::open(tree.into_stream()).unwrap();
        tree.recover(true).unwrap();
        assert_eq!(tree.get("a").unwrap(), vec![3u8; 3000]);
        assert_eq!(tree.get("b").unwrap(), b"short");
        // A second pass finds nothing left to fix.
        tree.recover(false).unwrap();
    }

    #[test]
    fn string_tree_roundtrip() {
        let mut tree = StringTree::create(Cursor::new(Vec::new()), 16, 4).unwrap();
        tree.set("greet", "hello world").unwrap();
        tree.set("empty", "").unwrap();
        assert_eq!(tree.get("greet").unwrap(), "hello world");
        assert_eq!(tree.get("empty").unwrap(), "");
        assert_eq!(tree.first_key().unwrap().as_deref(), Some("empty"));
        assert_eq!(tree.next_key("empty").unwrap().as_deref(), Some("greet"));
        tree.remove_key("greet").unwrap();
        assert!(matches!(tree.get("greet"), Err(TreeError::KeyNotFound(_))));
    }
}
