use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use log::debug;

use crate::error::{TreeError, TreeResult};
use crate::storage::block::{HEADER_LEN, StoreHeader, required_block_size};
use crate::storage::journal;

/// The backing stream contract: seekable byte storage supplied by the
/// caller, plus a durability barrier. The default barrier is a plain
/// flush, which is all an in-memory stream has to offer.
pub trait StoreStream: Read + Write + Seek {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl StoreStream for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl StoreStream for Cursor<Vec<u8>> {}

/// Fixed-size block allocator over a seekable stream.
///
/// Blocks are numbered from 0 (the header) and addressed at
/// `block * block_size`. Free blocks form a chain through their first
/// 8 bytes, headed by the header's free-head field. The store never
/// writes data blocks outside of [`BlockStore::commit`] and
/// [`BlockStore::rewrite_free_list`]; callers buffer everything else in
/// memory so an uncommitted transaction leaves the stream untouched.
#[derive(Debug)]
pub struct BlockStore<S: StoreStream> {
    stream: S,
    header: StoreHeader,
    block_size: usize,
    /// Total blocks the store knows about, including ones allocated by
    /// growth that have not been written yet.
    total_blocks: u64,
    /// In-memory mirror of the on-disk free chain, head at the front.
    free: VecDeque<u64>,
}

impl<S: StoreStream> BlockStore<S> {
    /// Initializes an empty store on a fresh stream.
    pub fn create(
        mut stream: S,
        block_size: usize,
        key_length: usize,
        node_capacity: usize,
    ) -> TreeResult<Self> {
        if block_size < required_block_size(key_length, node_capacity) {
            return Err(TreeError::Config(format!(
                "block size {block_size} cannot hold {node_capacity} keys of {key_length} bytes"
            )));
        }
        let header = StoreHeader {
            block_size: block_size as u32,
            key_length: key_length as u32,
            node_capacity: node_capacity as u32,
            root: 0,
            free_head: 0,
            journal_head: 0,
        };
        stream.seek(SeekFrom::Start(0))?;
        stream.write_all(&header.encode(block_size))?;
        stream.sync()?;
        debug!("created block store: block_size={block_size}, key_length={key_length}, capacity={node_capacity}");
        Ok(BlockStore {
            stream,
            header,
            block_size,
            total_blocks: 1,
            free: VecDeque::new(),
        })
    }

    /// Opens an existing store, replaying a pending commit journal first
    /// if the previous session crashed mid-commit.
    pub fn open(mut stream: S) -> TreeResult<Self> {
        let mut prefix = [0u8; HEADER_LEN];
        stream.seek(SeekFrom::Start(0))?;
        stream
            .read_exact(&mut prefix)
            .map_err(|e| TreeError::BlockFile(format!("cannot read header block: {e}")))?;
        let header = StoreHeader::decode(&prefix)?;
        let block_size = header.block_size as usize;
        if block_size < HEADER_LEN {
            return Err(TreeError::BlockFile(format!(
                "implausible block size {block_size}"
            )));
        }

        let len = stream.seek(SeekFrom::End(0))?;
        // A crash while growing the journal can leave a ragged tail; the
        // partial block is unreferenced and gets overwritten later.
        let total_blocks = len / block_size as u64;
        if total_blocks == 0 {
            return Err(TreeError::BlockFile("file shorter than one block".into()));
        }

        let mut store = BlockStore {
            stream,
            header,
            block_size,
            total_blocks,
            free: VecDeque::new(),
        };
        if store.header.journal_head != 0 {
            store.replay_journal()?;
        }
        store.reload_free_list()?;
        debug!(
            "opened block store: root={}, {} blocks, {} free",
            store.header.root,
            store.total_blocks,
            store.free.len()
        );
        Ok(store)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn key_length(&self) -> usize {
        self.header.key_length as usize
    }

    pub fn node_capacity(&self) -> usize {
        self.header.node_capacity as usize
    }

    pub fn root(&self) -> u64 {
        self.header.root
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn free_set(&self) -> HashSet<u64> {
        self.free.iter().copied().collect()
    }

    /// Whether `block` addresses a data block inside the file.
    pub fn is_valid_block(&self, block: u64) -> bool {
        block != 0 && block < self.total_blocks
    }

    /// Hands out a block number, preferring the free chain over growth.
    /// Growth does not touch the stream; the file only extends when the
    /// block is eventually written by a commit.
    pub fn allocate(&mut self) -> u64 {
        if let Some(block) = self.free.pop_front() {
            self.header.free_head = self.free.front().copied().unwrap_or(0);
            debug!("allocate: reusing free block {block}");
            block
        } else {
            let block = self.total_blocks;
            self.total_blocks += 1;
            block
        }
    }

    /// Reads a full block image.
    pub fn read_block(&mut self, block: u64) -> TreeResult<Vec<u8>> {
        if !self.is_valid_block(block) {
            return Err(TreeError::BlockFile(format!(
                "block {} out of range (store has {} blocks)",
                block, self.total_blocks
            )));
        }
        let mut buf = vec![0u8; self.block_size];
        self.stream
            .seek(SeekFrom::Start(block * self.block_size as u64))?;
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| TreeError::BlockFile(format!("short read of block {block}: {e}")))?;
        Ok(buf)
    }

    fn write_block_raw(&mut self, block: u64, image: &[u8]) -> TreeResult<()> {
        if image.len() != self.block_size {
            return Err(TreeError::Invalid(format!(
                "block image is {} bytes, expected {}",
                image.len(),
                self.block_size
            )));
        }
        self.stream
            .seek(SeekFrom::Start(block * self.block_size as u64))?;
        self.stream.write_all(image)?;
        Ok(())
    }

    /// Atomically applies a commit batch.
    ///
    /// `writes` are full block images (dirty nodes, staged blobs);
    /// `freed` are blocks whose death becomes durable with this commit —
    /// they are pushed onto the front of the free chain. The batch plus
    /// the new header is journaled and synced before any in-place write
    /// happens, so a crash at any point either preserves the previous
    /// committed state or is repaired by replay.
    ///
    /// `journal_pool` holds the previous commit's journal blocks. They
    /// are unreferenced by the committed state, so they can be
    /// overwritten before the commit point; the journal draws from the
    /// pool first and grows the file only for the remainder. The returned
    /// pool (blocks used this time plus any leftovers) goes back in at
    /// the next commit, keeping journal space at a steady state.
    pub fn commit(
        &mut self,
        mut writes: Vec<(u64, Vec<u8>)>,
        new_root: u64,
        freed: Vec<u64>,
        mut journal_pool: Vec<u64>,
    ) -> TreeResult<Vec<u64>> {
        // Freed blocks become free-chain links pointing at the old chain.
        let new_free_head = freed.first().copied().unwrap_or(self.header.free_head);
        for (i, &block) in freed.iter().enumerate() {
            let next = freed
                .get(i + 1)
                .copied()
                .unwrap_or(self.header.free_head);
            let mut image = vec![0u8; self.block_size];
            image[..8].copy_from_slice(&next.to_le_bytes());
            writes.push((block, image));
        }
        let new_header = StoreHeader {
            root: new_root,
            free_head: new_free_head,
            journal_head: 0,
            ..self.header.clone()
        };
        // The header image goes last so the root pointer is the final
        // in-place write of the batch.
        writes.push((0, new_header.encode(self.block_size)));

        let frames = journal::frames_needed(writes.len(), self.block_size);
        let reused = frames.min(journal_pool.len());
        let mut journal_blocks: Vec<u64> = journal_pool.drain(..reused).collect();
        // Growth blocks are past the committed end of file, so writing
        // them before the commit point is as safe as reusing the pool.
        for _ in reused..frames {
            journal_blocks.push(self.total_blocks);
            self.total_blocks += 1;
        }

        for (block, image) in journal::encode_frames(&writes, &journal_blocks, self.block_size) {
            self.write_block_raw(block, &image)?;
        }
        self.stream.sync()?;

        // Commit point: a single header write flips the journal head.
        let armed = StoreHeader {
            journal_head: journal_blocks[0],
            ..self.header.clone()
        };
        self.write_block_raw(0, &armed.encode(self.block_size))?;
        self.stream.sync()?;

        for (block, image) in &writes {
            self.write_block_raw(*block, image)?;
        }
        self.stream.sync()?;

        self.header = new_header;
        for &block in freed.iter().rev() {
            self.free.push_front(block);
        }
        debug!(
            "commit: root={new_root}, {} images, {} freed, {frames} journal blocks ({reused} reused)",
            writes.len(),
            freed.len()
        );
        journal_blocks.extend(journal_pool);
        Ok(journal_blocks)
    }

    /// Replays a pending commit journal left by a crash.
    fn replay_journal(&mut self) -> TreeResult<()> {
        debug!("replaying commit journal from block {}", self.header.journal_head);
        let mut payload = Vec::new();
        let mut seen = 0u64;
        let mut next = self.header.journal_head;
        while next != 0 {
            if seen >= self.total_blocks {
                return Err(TreeError::BlockFile("journal chain cycle".into()));
            }
            let image = self.read_block(next)?;
            next = u64::from_le_bytes(image[..8].try_into().unwrap());
            payload.extend_from_slice(&image[8..]);
            seen += 1;
        }
        let writes = journal::decode_frames(&payload, self.block_size)?;
        for (block, image) in &writes {
            // The commit may have grown the file for new nodes and then
            // crashed before the in-place phase wrote them; recreate the
            // growth here.
            if *block >= self.total_blocks {
                self.total_blocks = *block + 1;
            }
            self.write_block_raw(*block, image)?;
        }
        self.stream.sync()?;

        // The last entry was the post-commit header; pick it up.
        let prefix = self.read_header_prefix()?;
        self.header = StoreHeader::decode(&prefix)?;
        if self.header.journal_head != 0 {
            return Err(TreeError::BlockFile(
                "journal replay did not clear the journal head".into(),
            ));
        }
        Ok(())
    }

    fn read_header_prefix(&mut self) -> TreeResult<[u8; HEADER_LEN]> {
        let mut prefix = [0u8; HEADER_LEN];
        self.stream.seek(SeekFrom::Start(0))?;
        self.stream
            .read_exact(&mut prefix)
            .map_err(|e| TreeError::BlockFile(format!("cannot read header block: {e}")))?;
        Ok(prefix)
    }

    /// Rebuilds the in-memory free chain from disk.
    pub fn reload_free_list(&mut self) -> TreeResult<()> {
        let mut chain = VecDeque::new();
        let mut next = self.header.free_head;
        while next != 0 {
            if chain.len() as u64 >= self.total_blocks {
                return Err(TreeError::BlockFile("free chain cycle".into()));
            }
            let image = self.read_block(next)?;
            chain.push_back(next);
            next = u64::from_le_bytes(image[..8].try_into().unwrap());
        }
        self.free = chain;
        Ok(())
    }

    /// Forgets uncommitted growth and reloads the free chain; the stream
    /// itself was never touched by the aborted transaction.
    pub fn reset_after_abort(&mut self) -> TreeResult<()> {
        let len = self.stream.seek(SeekFrom::End(0))?;
        self.total_blocks = (len / self.block_size as u64).max(1);
        // Allocations moved the in-memory free head; the on-disk header
        // still carries the committed chain, so pick it back up.
        let prefix = self.read_header_prefix()?;
        self.header = StoreHeader::decode(&prefix)?;
        self.reload_free_list()
    }

    /// Replaces the entire free chain. Recovery-only: the rewrite is not
    /// journaled because recovery is idempotent — a crash mid-rewrite is
    /// repaired by running recovery again.
    pub fn rewrite_free_list(&mut self, free: Vec<u64>) -> TreeResult<()> {
        for (i, &block) in free.iter().enumerate() {
            let next = free.get(i + 1).copied().unwrap_or(0);
            let mut image = vec![0u8; self.block_size];
            image[..8].copy_from_slice(&next.to_le_bytes());
            self.write_block_raw(block, &image)?;
        }
        let new_header = StoreHeader {
            free_head: free.first().copied().unwrap_or(0),
            ..self.header.clone()
        };
        self.write_block_raw(0, &new_header.encode(self.block_size))?;
        self.stream.sync()?;
        self.header = new_header;
        self.free = free.into_iter().collect();
        Ok(())
    }

    /// Flushes stream buffers without committing or aborting anything.
    pub fn flush(&mut self) -> TreeResult<()> {
        self.stream.sync()?;
        Ok(())
    }

    /// Releases the backing stream.
    pub fn into_stream(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store(block_size: usize) -> BlockStore<Cursor<Vec<u8>>> {
        BlockStore::create(Cursor::new(Vec::new()), block_size, 8, 4).unwrap()
    }

    #[test]
    fn create_and_reopen_header() {
        let store = memory_store(128);
        let stream = store.into_stream();
        let store = BlockStore::open(stream).unwrap();
        assert_eq!(store.block_size(), 128);
        assert_eq!(store.key_length(), 8);
        assert_eq!(store.node_capacity(), 4);
        assert_eq!(store.root(), 0);
        assert_eq!(store.total_blocks(), 1);
    }

    #[test]
    fn block_size_too_small_rejected() {
        let result = BlockStore::create(Cursor::new(Vec::new()), 16, 32, 8);
        assert!(matches!(result, Err(TreeError::Config(_))));
    }

    #[test]
    fn allocate_grows_then_reuses_free_chain() {
        let mut store = memory_store(128);
        let a = store.allocate();
        let b = store.allocate();
        assert_eq!((a, b), (1, 2));

        let image = vec![7u8; 128];
        store
            .commit(vec![(a, image.clone()), (b, image)], a, vec![], vec![])
            .unwrap();

        // Free `b` in a second commit, then reopen and reuse it.
        store.commit(vec![], a, vec![b], vec![]).unwrap();
        assert_eq!(store.free_count(), 1);

        let mut store = BlockStore::open(store.into_stream()).unwrap();
        assert_eq!(store.root(), a);
        assert_eq!(store.free_count(), 1);
        assert_eq!(store.allocate(), b);
    }

    #[test]
    fn commit_persists_images_across_reopen() {
        let mut store = memory_store(128);
        let a = store.allocate();
        let mut image = vec![0u8; 128];
        image[10] = 0xCD;
        store.commit(vec![(a, image)], a, vec![], vec![]).unwrap();

        let mut store = BlockStore::open(store.into_stream()).unwrap();
        assert_eq!(store.read_block(a).unwrap()[10], 0xCD);
    }

    #[test]
    fn read_out_of_range_is_block_file_error() {
        let mut store = memory_store(128);
        assert!(matches!(
            store.read_block(0),
            Err(TreeError::BlockFile(_))
        ));
        assert!(matches!(
            store.read_block(99),
            Err(TreeError::BlockFile(_))
        ));
    }

    #[test]
    fn abort_reset_forgets_uncommitted_growth() {
        let mut store = memory_store(128);
        let a = store.allocate();
        store.commit(vec![(a, vec![1u8; 128])], a, vec![], vec![]).unwrap();
        let committed_total = store.total_blocks();

        store.allocate();
        store.allocate();
        assert!(store.total_blocks() > committed_total);
        store.reset_after_abort().unwrap();
        assert_eq!(store.total_blocks(), committed_total);
    }

    #[test]
    fn abort_reset_restores_consumed_free_head() {
        let mut store = memory_store(128);
        let blocks: Vec<u64> = (0..3).map(|_| store.allocate()).collect();
        let writes = blocks.iter().map(|&b| (b, vec![1u8; 128])).collect();
        store.commit(writes, blocks[0], vec![], vec![]).unwrap();
        store
            .commit(vec![], blocks[0], vec![blocks[1], blocks[2]], vec![])
            .unwrap();
        assert_eq!(store.free_count(), 2);

        // Drawing from the chain moves the in-memory head; an abort must
        // restore the full committed chain.
        assert_eq!(store.allocate(), blocks[1]);
        store.reset_after_abort().unwrap();
        assert_eq!(store.free_count(), 2);
        assert_eq!(store.free_set(), [blocks[1], blocks[2]].into());
    }

    #[test]
    fn armed_journal_is_replayed_on_open() {
        // Commit state A, then hand-write a journal for state B and arm
        // the header without applying it — simulating a crash between the
        // commit point and the in-place phase.
        let mut store = memory_store(128);
        let a = store.allocate();
        store.commit(vec![(a, vec![0xAAu8; 128])], a, vec![], vec![]).unwrap();

        let mut image_b = vec![0xBBu8; 128];
        image_b[..8].copy_from_slice(&0u64.to_le_bytes());
        let header_b = StoreHeader {
            root: a,
            journal_head: 0,
            ..store.header.clone()
        };
        let writes = vec![(a, image_b.clone()), (0, header_b.encode(128))];
        let frames = journal::frames_needed(writes.len(), 128);
        let journal_blocks: Vec<u64> = (0..frames as u64)
            .map(|i| store.total_blocks + i)
            .collect();
        store.total_blocks += frames as u64;
        for (block, image) in journal::encode_frames(&writes, &journal_blocks, 128) {
            store.write_block_raw(block, &image).unwrap();
        }
        let armed = StoreHeader {
            journal_head: journal_blocks[0],
            ..store.header.clone()
        };
        store.write_block_raw(0, &armed.encode(128)).unwrap();

        let mut store = BlockStore::open(store.into_stream()).unwrap();
        assert_eq!(store.read_block(a).unwrap()[20], 0xBB);
        assert_eq!(store.header.journal_head, 0);
    }

    #[test]
    fn rewrite_free_list_roundtrips() {
        let mut store = memory_store(128);
        let blocks: Vec<u64> = (0..4).map(|_| store.allocate()).collect();
        let writes = blocks.iter().map(|&b| (b, vec![1u8; 128])).collect();
        store.commit(writes, blocks[0], vec![], vec![]).unwrap();

        store.rewrite_free_list(vec![blocks[2], blocks[3]]).unwrap();
        let store2 = BlockStore::open(store.into_stream()).unwrap();
        assert_eq!(store2.free_set(), [blocks[2], blocks[3]].into());
    }
}
