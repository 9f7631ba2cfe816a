use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::Path;

use log::{debug, warn};

use crate::error::{TreeError, TreeResult};
use crate::storage::block::required_block_size;
use crate::storage::store::{BlockStore, StoreStream};
use crate::tree::IndexTree;
use crate::tree::node::Node;

/// Default bound on resident clean leaf nodes.
const DEFAULT_FOOTPRINT_LIMIT: usize = 512;

/// A B+Tree mapping bounded-length string keys to `i64` values over a
/// block store.
///
/// All mutations stay in the node cache until [`BPlusTree::commit`] makes
/// them durable in one atomic batch; [`BPlusTree::abort`] drops them. One
/// logical writer owns the tree and its stream at a time — there is no
/// internal locking.
///
/// The typed wrappers in [`crate::tree::bytes`] layer blob and string
/// values on top of the `i64` payload.
#[derive(Debug)]
pub struct BPlusTree<S: StoreStream> {
    store: BlockStore<S>,
    key_length: usize,
    capacity: usize,
    /// Working root; diverges from `committed_root` during a transaction.
    root: u64,
    committed_root: u64,
    cache: HashMap<u64, CachedNode>,
    pending: Pending,
    /// Journal blocks from the previous commit, reused as journal space
    /// by the next one.
    stale_journal: Vec<u64>,
    /// Sequential-scan position; cleared by any mutation or abort.
    cursor: Option<ScanCursor>,
    footprint_limit: usize,
    tick: u64,
}

#[derive(Debug)]
struct CachedNode {
    node: Node,
    dirty: bool,
    touch: u64,
}

/// Position of the last `first_key`/`next_key` result, letting a
/// sequential scan advance within its leaf or follow the leaf chain
/// without re-descending from the root.
#[derive(Debug)]
struct ScanCursor {
    key: String,
    block: u64,
    idx: usize,
}

/// Everything a transaction has done that a commit must persist or an
/// abort must forget.
#[derive(Debug, Default)]
struct Pending {
    /// Blocks handed out since the last commit.
    allocated: HashSet<u64>,
    /// Allocated-then-freed blocks, reusable within the transaction.
    recycled: Vec<u64>,
    /// Committed blocks freed by this transaction.
    freed: Vec<u64>,
    /// Raw block images staged by the typed wrappers (blob chains).
    staged: HashMap<u64, Vec<u8>>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.allocated.is_empty()
            && self.recycled.is_empty()
            && self.freed.is_empty()
            && self.staged.is_empty()
    }
}

impl<S: StoreStream> BPlusTree<S> {
    /// Initializes an empty tree on a fresh stream.
    pub fn create(stream: S, key_length: usize, node_capacity: usize) -> TreeResult<Self> {
        if node_capacity < 2 || node_capacity > u16::MAX as usize {
            return Err(TreeError::Config(format!(
                "node capacity {node_capacity} must be between 2 and {}",
                u16::MAX
            )));
        }
        if key_length == 0 || key_length > u16::MAX as usize {
            return Err(TreeError::Config(format!(
                "key length {key_length} must be between 1 and {}",
                u16::MAX
            )));
        }
        let block_size = required_block_size(key_length, node_capacity);
        let store = BlockStore::create(stream, block_size, key_length, node_capacity)?;
        Ok(Self::from_store(store, key_length, node_capacity))
    }

    /// Opens a tree from an existing stream, replaying an interrupted
    /// commit if one is pending.
    pub fn open(stream: S) -> TreeResult<Self> {
        let store = BlockStore::open(stream)?;
        let key_length = store.key_length();
        let capacity = store.node_capacity();
        if capacity < 2 || key_length == 0 {
            return Err(TreeError::BlockFile(format!(
                "header carries implausible parameters: key length {key_length}, capacity {capacity}"
            )));
        }
        let root = store.root();
        if root != 0 && !store.is_valid_block(root) {
            return Err(TreeError::BlockFile(format!(
                "header root {root} is out of range"
            )));
        }
        Ok(Self::from_store(store, key_length, capacity))
    }

    fn from_store(store: BlockStore<S>, key_length: usize, capacity: usize) -> Self {
        let root = store.root();
        BPlusTree {
            store,
            key_length,
            capacity,
            root,
            committed_root: root,
            cache: HashMap::new(),
            pending: Pending::default(),
            stale_journal: Vec::new(),
            cursor: None,
            footprint_limit: DEFAULT_FOOTPRINT_LIMIT,
            tick: 0,
        }
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn node_capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.store.block_size()
    }

    pub fn total_block_count(&self) -> u64 {
        self.store.total_blocks()
    }

    pub fn free_block_count(&self) -> usize {
        self.store.free_count()
    }

    /// Clean materialized leaves currently resident, the quantity the
    /// footprint limit bounds.
    pub fn cached_leaf_count(&self) -> usize {
        self.cache
            .values()
            .filter(|c| c.node.is_leaf() && !c.dirty)
            .count()
    }

    /// Non-throwing probe; `Ok(None)` for an absent key.
    pub fn lookup(&mut self, key: &str) -> TreeResult<Option<i64>> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut block = self.root;
        let found = loop {
            self.ensure_loaded(block)?;
            match &self.cache.get(&block).unwrap().node {
                Node::Interior { keys, children } => {
                    block = children[keys.partition_point(|s| s.as_str() <= key)];
                }
                Node::Leaf { keys, values, .. } => {
                    let idx = keys.partition_point(|k| k.as_str() < key);
                    break if idx < keys.len() && keys[idx] == key {
                        Some(values[idx])
                    } else {
                        None
                    };
                }
            }
        };
        self.enforce_footprint();
        Ok(found)
    }

    /// Fail-fast accessor.
    pub fn get(&mut self, key: &str) -> TreeResult<i64> {
        self.lookup(key)?
            .ok_or_else(|| TreeError::KeyNotFound(key.to_string()))
    }

    pub fn contains_key(&mut self, key: &str) -> TreeResult<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Inserts or overwrites. An existing key keeps a single entry; only
    /// its value changes.
    pub fn set(&mut self, key: &str, value: i64) -> TreeResult<()> {
        self.validate_key(key)?;
        self.cursor = None;
        if self.root == 0 {
            let block = self.allocate_block();
            self.insert_new_node(
                block,
                Node::Leaf {
                    keys: vec![key.to_string()],
                    values: vec![value],
                    next: 0,
                },
            );
            self.root = block;
            debug!("set: first key {key:?}, root leaf {block}");
        } else if let Some((separator, right)) = self.insert_at(self.root, key, value)? {
            let block = self.allocate_block();
            self.insert_new_node(
                block,
                Node::Interior {
                    keys: vec![separator],
                    children: vec![self.root, right],
                },
            );
            debug!("set: root split, new root {block}");
            self.root = block;
        }
        self.enforce_footprint();
        Ok(())
    }

    /// Removes a key; `TreeError::KeyNotFound` if absent.
    pub fn remove_key(&mut self, key: &str) -> TreeResult<()> {
        self.cursor = None;
        if self.root == 0 {
            return Err(TreeError::KeyNotFound(key.to_string()));
        }
        self.remove_at(self.root, key)?;
        loop {
            enum RootFix {
                Collapse(u64),
                Emptied,
                Done,
            }
            let fix = match self.peek(self.root)? {
                Node::Interior { keys, children } if keys.is_empty() => {
                    RootFix::Collapse(children[0])
                }
                Node::Leaf { keys, .. } if keys.is_empty() => RootFix::Emptied,
                _ => RootFix::Done,
            };
            match fix {
                RootFix::Collapse(child) => {
                    let old = self.root;
                    self.free_block(old);
                    self.root = child;
                    debug!("remove: root collapsed into {child}");
                }
                RootFix::Emptied => {
                    let old = self.root;
                    self.free_block(old);
                    self.root = 0;
                    debug!("remove: tree emptied");
                    break;
                }
                RootFix::Done => break,
            }
        }
        self.enforce_footprint();
        Ok(())
    }

    /// Smallest key, or `None` for an empty tree.
    pub fn first_key(&mut self) -> TreeResult<Option<String>> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut block = self.root;
        let first = loop {
            self.ensure_loaded(block)?;
            match &self.cache.get(&block).unwrap().node {
                Node::Interior { children, .. } => block = children[0],
                Node::Leaf { keys, .. } => break keys.first().cloned(),
            }
        };
        if let Some(key) = &first {
            self.cursor = Some(ScanCursor {
                key: key.clone(),
                block,
                idx: 0,
            });
        }
        self.enforce_footprint();
        Ok(first)
    }

    /// Smallest key strictly greater than `after`, or `None` past the
    /// end. A scan advances within the current leaf or follows the leaf
    /// chain via the cursor left by the previous call; it descends from
    /// the root only to (re)position when the cursor does not match
    /// `after`, after a mutation, or after the leaf was evicted.
    pub fn next_key(&mut self, after: &str) -> TreeResult<Option<String>> {
        let cursor = self.cursor.take();
        if self.root == 0 {
            return Ok(None);
        }
        let (block, idx) = match cursor.filter(|c| self.cursor_matches(c, after)) {
            Some(cur) => (cur.block, cur.idx + 1),
            None => self.position_after(after)?,
        };
        self.ensure_loaded(block)?;
        let (in_leaf, chain) = match &self.cache.get(&block).unwrap().node {
            Node::Leaf { keys, next, .. } => {
                if idx < keys.len() {
                    (Some(keys[idx].clone()), 0)
                } else {
                    (None, *next)
                }
            }
            // Positioning only ever lands on leaves.
            Node::Interior { .. } => {
                return Err(TreeError::BlockFile(format!(
                    "expected leaf node at block {block}"
                )));
            }
        };
        let result = match (in_leaf, chain) {
            (Some(key), _) => {
                self.cursor = Some(ScanCursor {
                    key: key.clone(),
                    block,
                    idx,
                });
                Some(key)
            }
            (None, 0) => None,
            (None, link) => {
                self.ensure_loaded(link)?;
                let first = match &self.cache.get(&link).unwrap().node {
                    Node::Leaf { keys, .. } => keys.first().cloned(),
                    Node::Interior { .. } => {
                        return Err(TreeError::BlockFile(format!(
                            "leaf chain points at non-leaf block {link}"
                        )));
                    }
                };
                if let Some(key) = &first {
                    self.cursor = Some(ScanCursor {
                        key: key.clone(),
                        block: link,
                        idx: 0,
                    });
                }
                first
            }
        };
        self.enforce_footprint();
        Ok(result)
    }

    /// Whether the scan cursor still points at `after` in a resident
    /// leaf. Mutations clear the cursor outright; this guards against
    /// eviction and out-of-sequence probes.
    fn cursor_matches(&self, cursor: &ScanCursor, after: &str) -> bool {
        if cursor.key != after {
            return false;
        }
        match self.cache.get(&cursor.block) {
            Some(cached) => match &cached.node {
                Node::Leaf { keys, .. } => keys.get(cursor.idx).is_some_and(|k| k == after),
                Node::Interior { .. } => false,
            },
            None => false,
        }
    }

    /// Root descent to the leaf slot of the smallest key greater than
    /// `after`.
    fn position_after(&mut self, after: &str) -> TreeResult<(u64, usize)> {
        let mut block = self.root;
        loop {
            self.ensure_loaded(block)?;
            match &self.cache.get(&block).unwrap().node {
                Node::Interior { keys, children } => {
                    block = children[keys.partition_point(|s| s.as_str() <= after)];
                }
                Node::Leaf { keys, .. } => {
                    return Ok((block, keys.partition_point(|k| k.as_str() <= after)));
                }
            }
        }
    }

    /// The tree's total key order: byte-wise ordinal comparison.
    pub fn compare(&self, left: &str, right: &str) -> Ordering {
        left.as_bytes().cmp(right.as_bytes())
    }

    pub fn set_footprint_limit(&mut self, limit: usize) {
        self.footprint_limit = limit;
        self.enforce_footprint();
    }

    /// Makes every mutation since the last commit durable: dirty node
    /// images, staged blob images, and the updated free chain go through
    /// the store's journaled batch, with the root pointer written last.
    pub fn commit(&mut self) -> TreeResult<()> {
        if !self.has_uncommitted() {
            debug!("commit: nothing to do");
            return Ok(());
        }
        let mut writes: Vec<(u64, Vec<u8>)> = Vec::new();
        for (&block, cached) in &self.cache {
            if cached.dirty {
                writes.push((
                    block,
                    cached.node.encode(self.store.block_size(), self.key_length)?,
                ));
            }
        }
        for (block, image) in self.pending.staged.drain() {
            writes.push((block, image));
        }
        let mut freed = std::mem::take(&mut self.pending.freed);
        freed.append(&mut self.pending.recycled);
        let pool = std::mem::take(&mut self.stale_journal);

        self.stale_journal = self.store.commit(writes, self.root, freed, pool)?;
        for cached in self.cache.values_mut() {
            cached.dirty = false;
        }
        self.pending.allocated.clear();
        self.committed_root = self.root;
        self.enforce_footprint();
        Ok(())
    }

    /// Discards every mutation since the last commit. The stream was
    /// never touched, so this only restores in-memory state.
    pub fn abort(&mut self) -> TreeResult<()> {
        self.cursor = None;
        let allocated = std::mem::take(&mut self.pending.allocated);
        self.cache
            .retain(|block, cached| !cached.dirty && !allocated.contains(block));
        self.pending = Pending::default();
        self.root = self.committed_root;
        self.store.reset_after_abort()?;
        debug!("abort: back to committed root {}", self.root);
        Ok(())
    }

    /// Flushes and releases the tree without committing or aborting.
    /// Uncommitted work simply vanishes; any committed-garbage blocks are
    /// left for [`BPlusTree::recover`] to reclaim.
    pub fn shutdown(mut self) -> TreeResult<()> {
        self.store.flush()?;
        Ok(())
    }

    /// Releases the backing stream (primarily for in-memory stores).
    pub fn into_stream(self) -> S {
        self.store.into_stream()
    }

    /// Reconciles the free chain against the blocks reachable from the
    /// committed root.
    ///
    /// Structural corruption — out-of-range or doubly referenced blocks,
    /// undecodable nodes — always errors. A free-chain/reachable overlap
    /// errors unless `correct_errors` is set, in which case the chain is
    /// rebuilt. Leaked blocks (unreachable and not free, e.g. journal
    /// garbage after a crash) are reclaimed when `correct_errors` is set
    /// and tolerated with a warning otherwise.
    pub fn recover(&mut self, correct_errors: bool) -> TreeResult<()> {
        self.ensure_recoverable()?;
        let (reachable, _values) = self.reachable_blocks()?;
        self.finish_recover(reachable, correct_errors)
    }

    pub(crate) fn ensure_recoverable(&self) -> TreeResult<()> {
        if self.has_uncommitted() {
            return Err(TreeError::Invalid(
                "recover requires a tree with no uncommitted changes".into(),
            ));
        }
        Ok(())
    }

    /// Walks the committed tree, returning every reachable node block and
    /// all leaf values (the typed wrappers chase blob chains through the
    /// values).
    pub(crate) fn reachable_blocks(&mut self) -> TreeResult<(HashSet<u64>, Vec<i64>)> {
        let mut reachable = HashSet::new();
        let mut values_out = Vec::new();
        if self.root == 0 {
            return Ok((reachable, values_out));
        }
        let mut stack = vec![self.root];
        while let Some(block) = stack.pop() {
            if !self.store.is_valid_block(block) {
                return Err(TreeError::BlockFile(format!(
                    "reachable block {block} is out of range"
                )));
            }
            if !reachable.insert(block) {
                return Err(TreeError::BlockFile(format!(
                    "block {block} is referenced more than once"
                )));
            }
            self.ensure_loaded(block)?;
            match &self.cache.get(&block).unwrap().node {
                Node::Interior { children, .. } => stack.extend(children.iter().copied()),
                // The next-leaf link is not followed: every leaf is
                // already reachable through its parent.
                Node::Leaf { values, .. } => values_out.extend(values.iter().copied()),
            }
        }
        self.enforce_footprint();
        Ok((reachable, values_out))
    }

    pub(crate) fn finish_recover(
        &mut self,
        reachable: HashSet<u64>,
        correct_errors: bool,
    ) -> TreeResult<()> {
        let free_now = self.store.free_set();
        let overlap: Vec<u64> = free_now.intersection(&reachable).copied().collect();
        if !overlap.is_empty() && !correct_errors {
            return Err(TreeError::BlockFile(format!(
                "free chain contains reachable blocks {overlap:?}"
            )));
        }
        let expected: Vec<u64> = (1..self.store.total_blocks())
            .filter(|b| !reachable.contains(b))
            .collect();
        let leaked = expected
            .iter()
            .filter(|b| !free_now.contains(*b))
            .count();
        if overlap.is_empty() && leaked == 0 {
            debug!("recover: free chain is consistent");
            return Ok(());
        }
        if !correct_errors {
            warn!("recover: {leaked} unreachable blocks are not on the free chain");
            return Ok(());
        }
        debug!(
            "recover: rebuilding free chain with {} blocks ({leaked} reclaimed)",
            expected.len()
        );
        self.store.rewrite_free_list(expected)?;
        self.stale_journal.clear();
        Ok(())
    }

    // ───────────────────────── internals ─────────────────────────

    fn validate_key(&self, key: &str) -> TreeResult<()> {
        if key.len() > self.key_length {
            return Err(TreeError::BadKeyValue(format!(
                "key {key:?} is longer than {} bytes",
                self.key_length
            )));
        }
        Ok(())
    }

    fn min_keys(&self) -> usize {
        self.capacity / 2
    }

    fn has_uncommitted(&self) -> bool {
        self.root != self.committed_root
            || !self.pending.is_empty()
            || self.cache.values().any(|c| c.dirty)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Materializes a node into the cache if needed and refreshes its
    /// recency tick.
    fn ensure_loaded(&mut self, block: u64) -> TreeResult<()> {
        if !self.cache.contains_key(&block) {
            let buf = self.store.read_block(block)?;
            let node = Node::decode(&buf, self.key_length, self.capacity)?;
            self.cache.insert(
                block,
                CachedNode {
                    node,
                    dirty: false,
                    touch: 0,
                },
            );
        }
        let tick = self.next_tick();
        // Safe to unwrap: just inserted or already present.
        self.cache.get_mut(&block).unwrap().touch = tick;
        Ok(())
    }

    fn take_node(&mut self, block: u64) -> TreeResult<CachedNode> {
        self.ensure_loaded(block)?;
        // Safe to unwrap: ensure_loaded put it there.
        Ok(self.cache.remove(&block).unwrap())
    }

    fn put_node(&mut self, block: u64, cached: CachedNode) {
        self.cache.insert(block, cached);
    }

    fn insert_new_node(&mut self, block: u64, node: Node) {
        let touch = self.next_tick();
        self.cache.insert(
            block,
            CachedNode {
                node,
                dirty: true,
                touch,
            },
        );
    }

    fn peek(&mut self, block: u64) -> TreeResult<&Node> {
        self.ensure_loaded(block)?;
        Ok(&self.cache.get(&block).unwrap().node)
    }

    fn key_count_of(&mut self, block: u64) -> TreeResult<usize> {
        Ok(self.peek(block)?.key_count())
    }

    fn is_leaf_node(&mut self, block: u64) -> TreeResult<bool> {
        Ok(self.peek(block)?.is_leaf())
    }

    pub(crate) fn allocate_block(&mut self) -> u64 {
        let block = match self.pending.recycled.pop() {
            Some(block) => block,
            None => self.store.allocate(),
        };
        self.pending.allocated.insert(block);
        block
    }

    pub(crate) fn free_block(&mut self, block: u64) {
        self.cache.remove(&block);
        self.pending.staged.remove(&block);
        if self.pending.allocated.remove(&block) {
            self.pending.recycled.push(block);
        } else {
            debug_assert!(!self.pending.freed.contains(&block));
            self.pending.freed.push(block);
        }
    }

    /// Stages a raw block image (blob chain data) for the next commit.
    pub(crate) fn stage_block(&mut self, block: u64, image: Vec<u8>) {
        debug_assert_eq!(image.len(), self.store.block_size());
        self.pending.staged.insert(block, image);
    }

    /// Reads a raw block, honoring staged images first so the wrappers
    /// get read-your-writes semantics before commit.
    pub(crate) fn read_raw_block(&mut self, block: u64) -> TreeResult<Vec<u8>> {
        if let Some(image) = self.pending.staged.get(&block) {
            return Ok(image.clone());
        }
        self.store.read_block(block)
    }

    /// Inserts into the subtree rooted at `block`; a split hands the
    /// separator and new right sibling up to the caller.
    fn insert_at(&mut self, block: u64, key: &str, value: i64) -> TreeResult<Option<(String, u64)>> {
        let mut cached = self.take_node(block)?;
        match &mut cached.node {
            Node::Leaf { keys, values, next } => {
                let idx = keys.partition_point(|k| k.as_str() < key);
                if idx < keys.len() && keys[idx] == key {
                    values[idx] = value;
                    cached.dirty = true;
                    self.put_node(block, cached);
                    return Ok(None);
                }
                keys.insert(idx, key.to_string());
                values.insert(idx, value);
                cached.dirty = true;
                if keys.len() <= self.capacity {
                    self.put_node(block, cached);
                    return Ok(None);
                }
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_values = values.split_off(mid);
                let separator = right_keys[0].clone();
                let right_node = Node::Leaf {
                    keys: right_keys,
                    values: right_values,
                    next: *next,
                };
                let right = self.allocate_block();
                *next = right;
                debug!("split leaf {block}, separator {separator:?}, new leaf {right}");
                self.put_node(block, cached);
                self.insert_new_node(right, right_node);
                Ok(Some((separator, right)))
            }
            Node::Interior { keys, children } => {
                let child = children[keys.partition_point(|s| s.as_str() <= key)];
                self.put_node(block, cached);
                let Some((separator, new_child)) = self.insert_at(child, key, value)? else {
                    return Ok(None);
                };
                let mut cached = self.take_node(block)?;
                let Node::Interior { keys, children } = &mut cached.node else {
                    self.put_node(block, cached);
                    return Err(TreeError::BlockFile(format!(
                        "node {block} changed kind mid-descent"
                    )));
                };
                let idx = keys.partition_point(|s| s.as_str() < separator.as_str());
                keys.insert(idx, separator);
                children.insert(idx + 1, new_child);
                cached.dirty = true;
                if keys.len() <= self.capacity {
                    self.put_node(block, cached);
                    return Ok(None);
                }
                let mid = keys.len() / 2;
                let mut right_keys = keys.split_off(mid);
                let separator_up = right_keys.remove(0);
                let right_children = children.split_off(mid + 1);
                let right = self.allocate_block();
                debug!("split interior {block}, separator {separator_up:?} moves up");
                self.put_node(block, cached);
                self.insert_new_node(
                    right,
                    Node::Interior {
                        keys: right_keys,
                        children: right_children,
                    },
                );
                Ok(Some((separator_up, right)))
            }
        }
    }

    /// Removes from the subtree rooted at `block`, repairing child
    /// underflow on the way back up. Returns whether this node is now
    /// below minimum occupancy.
    fn remove_at(&mut self, block: u64, key: &str) -> TreeResult<bool> {
        let descend = match self.peek(block)? {
            Node::Leaf { .. } => None,
            Node::Interior { keys, children } => {
                let idx = keys.partition_point(|s| s.as_str() <= key);
                Some((idx, children[idx]))
            }
        };
        match descend {
            None => {
                let mut cached = self.take_node(block)?;
                let Node::Leaf { keys, values, .. } = &mut cached.node else {
                    self.put_node(block, cached);
                    return Err(TreeError::BlockFile(format!(
                        "node {block} changed kind mid-descent"
                    )));
                };
                let idx = keys.partition_point(|k| k.as_str() < key);
                if idx >= keys.len() || keys[idx] != key {
                    self.put_node(block, cached);
                    return Err(TreeError::KeyNotFound(key.to_string()));
                }
                keys.remove(idx);
                values.remove(idx);
                cached.dirty = true;
                let under = keys.len() < self.min_keys();
                self.put_node(block, cached);
                Ok(under)
            }
            Some((idx, child)) => {
                if !self.remove_at(child, key)? {
                    return Ok(false);
                }
                self.repair_underflow(block, idx)?;
                Ok(self.key_count_of(block)? < self.min_keys())
            }
        }
    }

    /// Repairs an underflowing child: merge into the left sibling when
    /// the combined entries fit, else merge the right sibling into the
    /// child, else borrow from whichever sibling is above minimum.
    fn repair_underflow(&mut self, parent: u64, idx: usize) -> TreeResult<()> {
        let (child, left, right) = {
            let Node::Interior { children, .. } = self.peek(parent)? else {
                return Err(TreeError::BlockFile(format!(
                    "expected interior node at block {parent}"
                )));
            };
            (
                children[idx],
                idx.checked_sub(1).map(|i| children[i]),
                children.get(idx + 1).copied(),
            )
        };
        let child_len = self.key_count_of(child)?;
        // Merging interiors pulls the separator down, costing one slot.
        let separator_cost = if self.is_leaf_node(child)? { 0 } else { 1 };
        let left_len = match left {
            Some(b) => self.key_count_of(b)?,
            None => 0,
        };
        let right_len = match right {
            Some(b) => self.key_count_of(b)?,
            None => 0,
        };

        if left.is_some() && left_len + child_len + separator_cost <= self.capacity {
            self.merge_children(parent, idx - 1)
        } else if right.is_some() && child_len + right_len + separator_cost <= self.capacity {
            self.merge_children(parent, idx)
        } else if left.is_some() && left_len > self.min_keys() {
            self.borrow_from_left(parent, idx)
        } else if right.is_some() && right_len > self.min_keys() {
            self.borrow_from_right(parent, idx)
        } else {
            // A lone underflowing child only happens at the root, which
            // the facade collapses afterwards.
            Ok(())
        }
    }

    /// Merges `children[left_idx + 1]` into `children[left_idx]`. Always
    /// merges rightward-into-left so the leaf chain stays intact.
    fn merge_children(&mut self, parent: u64, left_idx: usize) -> TreeResult<()> {
        let (left_block, right_block, separator) = {
            let Node::Interior { keys, children } = self.peek(parent)? else {
                return Err(TreeError::BlockFile(format!(
                    "expected interior node at block {parent}"
                )));
            };
            (
                children[left_idx],
                children[left_idx + 1],
                keys[left_idx].clone(),
            )
        };
        let right_cached = self.take_node(right_block)?;
        let mut left_cached = self.take_node(left_block)?;
        match (&mut left_cached.node, right_cached.node) {
            (
                Node::Leaf { keys, values, next },
                Node::Leaf {
                    keys: right_keys,
                    values: right_values,
                    next: right_next,
                },
            ) => {
                keys.extend(right_keys);
                values.extend(right_values);
                *next = right_next;
            }
            (
                Node::Interior { keys, children },
                Node::Interior {
                    keys: right_keys,
                    children: right_children,
                },
            ) => {
                keys.push(separator);
                keys.extend(right_keys);
                children.extend(right_children);
            }
            _ => {
                return Err(TreeError::BlockFile(format!(
                    "sibling nodes {left_block} and {right_block} have different kinds"
                )));
            }
        }
        left_cached.dirty = true;
        self.put_node(left_block, left_cached);
        self.free_block(right_block);

        let mut parent_cached = self.take_node(parent)?;
        let Node::Interior { keys, children } = &mut parent_cached.node else {
            self.put_node(parent, parent_cached);
            return Err(TreeError::BlockFile(format!(
                "node {parent} changed kind mid-repair"
            )));
        };
        keys.remove(left_idx);
        children.remove(left_idx + 1);
        parent_cached.dirty = true;
        self.put_node(parent, parent_cached);
        debug!("merged node {right_block} into {left_block}");
        Ok(())
    }

    fn borrow_from_left(&mut self, parent: u64, idx: usize) -> TreeResult<()> {
        let (left_block, child_block, separator) = {
            let Node::Interior { keys, children } = self.peek(parent)? else {
                return Err(TreeError::BlockFile(format!(
                    "expected interior node at block {parent}"
                )));
            };
            (children[idx - 1], children[idx], keys[idx - 1].clone())
        };
        let mut left = self.take_node(left_block)?;
        let mut child = self.take_node(child_block)?;
        let new_separator = match (&mut left.node, &mut child.node) {
            (
                Node::Leaf { keys, values, .. },
                Node::Leaf {
                    keys: child_keys,
                    values: child_values,
                    ..
                },
            ) => {
                let (Some(key), Some(value)) = (keys.pop(), values.pop()) else {
                    return Err(TreeError::BlockFile(format!(
                        "cannot borrow from empty leaf {left_block}"
                    )));
                };
                child_keys.insert(0, key.clone());
                child_values.insert(0, value);
                key
            }
            (
                Node::Interior { keys, children },
                Node::Interior {
                    keys: child_keys,
                    children: child_children,
                },
            ) => {
                let (Some(key), Some(grandchild)) = (keys.pop(), children.pop()) else {
                    return Err(TreeError::BlockFile(format!(
                        "cannot borrow from empty interior {left_block}"
                    )));
                };
                child_keys.insert(0, separator);
                child_children.insert(0, grandchild);
                key
            }
            _ => {
                return Err(TreeError::BlockFile(format!(
                    "sibling nodes {left_block} and {child_block} have different kinds"
                )));
            }
        };
        left.dirty = true;
        child.dirty = true;
        self.put_node(left_block, left);
        self.put_node(child_block, child);
        self.replace_separator(parent, idx - 1, new_separator)?;
        debug!("borrowed one entry from {left_block} into {child_block}");
        Ok(())
    }

    fn borrow_from_right(&mut self, parent: u64, idx: usize) -> TreeResult<()> {
        let (child_block, right_block, separator) = {
            let Node::Interior { keys, children } = self.peek(parent)? else {
                return Err(TreeError::BlockFile(format!(
                    "expected interior node at block {parent}"
                )));
            };
            (children[idx], children[idx + 1], keys[idx].clone())
        };
        let mut child = self.take_node(child_block)?;
        let mut right = self.take_node(right_block)?;
        let new_separator = match (&mut child.node, &mut right.node) {
            (
                Node::Leaf { keys, values, .. },
                Node::Leaf {
                    keys: right_keys,
                    values: right_values,
                    ..
                },
            ) => {
                if right_keys.is_empty() {
                    return Err(TreeError::BlockFile(format!(
                        "cannot borrow from empty leaf {right_block}"
                    )));
                }
                keys.push(right_keys.remove(0));
                values.push(right_values.remove(0));
                let Some(first) = right_keys.first() else {
                    return Err(TreeError::BlockFile(format!(
                        "leaf {right_block} drained below minimum while borrowing"
                    )));
                };
                first.clone()
            }
            (
                Node::Interior { keys, children },
                Node::Interior {
                    keys: right_keys,
                    children: right_children,
                },
            ) => {
                if right_keys.is_empty() || right_children.is_empty() {
                    return Err(TreeError::BlockFile(format!(
                        "cannot borrow from empty interior {right_block}"
                    )));
                }
                keys.push(separator);
                children.push(right_children.remove(0));
                right_keys.remove(0)
            }
            _ => {
                return Err(TreeError::BlockFile(format!(
                    "sibling nodes {child_block} and {right_block} have different kinds"
                )));
            }
        };
        child.dirty = true;
        right.dirty = true;
        self.put_node(child_block, child);
        self.put_node(right_block, right);
        self.replace_separator(parent, idx, new_separator)?;
        debug!("borrowed one entry from {right_block} into {child_block}");
        Ok(())
    }

    fn replace_separator(&mut self, parent: u64, idx: usize, separator: String) -> TreeResult<()> {
        let mut cached = self.take_node(parent)?;
        let Node::Interior { keys, .. } = &mut cached.node else {
            self.put_node(parent, cached);
            return Err(TreeError::BlockFile(format!(
                "expected interior node at block {parent}"
            )));
        };
        keys[idx] = separator;
        cached.dirty = true;
        self.put_node(parent, cached);
        Ok(())
    }

    /// Evicts the oldest clean leaves until at most `footprint_limit`
    /// remain resident. Dirty nodes are never evicted; a later access
    /// re-materializes from the store.
    fn enforce_footprint(&mut self) {
        loop {
            let mut clean_leaves = 0usize;
            let mut oldest: Option<(u64, u64)> = None;
            for (&block, cached) in &self.cache {
                if cached.dirty || !cached.node.is_leaf() {
                    continue;
                }
                clean_leaves += 1;
                if oldest.is_none_or(|(touch, _)| cached.touch < touch) {
                    oldest = Some((cached.touch, block));
                }
            }
            if clean_leaves <= self.footprint_limit {
                return;
            }
            if let Some((_, block)) = oldest {
                self.cache.remove(&block);
                debug!("footprint: evicted clean leaf {block}");
            } else {
                return;
            }
        }
    }
}

impl BPlusTree<File> {
    /// Creates a fresh tree file at `path`, truncating anything there.
    pub fn create_file<P: AsRef<Path>>(
        path: P,
        key_length: usize,
        node_capacity: usize,
    ) -> TreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::create(file, key_length, node_capacity)
    }

    /// Opens an existing tree file.
    pub fn open_file<P: AsRef<Path>>(path: P) -> TreeResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::open(file)
    }
}

impl<S: StoreStream> IndexTree for BPlusTree<S> {
    type Value = i64;

    fn set(&mut self, key: &str, value: i64) -> TreeResult<()> {
        BPlusTree::set(self, key, value)
    }

    fn get(&mut self, key: &str) -> TreeResult<i64> {
        BPlusTree::get(self, key)
    }

    fn contains_key(&mut self, key: &str) -> TreeResult<bool> {
        BPlusTree::contains_key(self, key)
    }

    fn remove_key(&mut self, key: &str) -> TreeResult<()> {
        BPlusTree::remove_key(self, key)
    }

    fn first_key(&mut self) -> TreeResult<Option<String>> {
        BPlusTree::first_key(self)
    }

    fn next_key(&mut self, after: &str) -> TreeResult<Option<String>> {
        BPlusTree::next_key(self, after)
    }

    fn compare(&self, left: &str, right: &str) -> Ordering {
        BPlusTree::compare(self, left, right)
    }

    fn set_footprint_limit(&mut self, limit: usize) {
        BPlusTree::set_footprint_limit(self, limit)
    }

    fn commit(&mut self) -> TreeResult<()> {
        BPlusTree::commit(self)
    }

    fn abort(&mut self) -> TreeResult<()> {
        BPlusTree::abort(self)
    }

    fn shutdown(self) -> TreeResult<()> {
        BPlusTree::shutdown(self)
    }

    fn recover(&mut self, correct_errors: bool) -> TreeResult<()> {
        BPlusTree::recover(self, correct_errors)
    }
}
