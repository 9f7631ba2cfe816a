// ┌──────────────────────────────────────────────────────────────────────┐
// │ Header block (block 0)                                               │
// │ Offset │ Length │ Description                                        │
// │────────┼────────┼────────────────────────────────────────────────────│
// │   0    │   4    │ MAGIC ("BPLT")                                     │
// │   4    │   4    │ FORMAT_VERSION (u32)                               │
// │   8    │   4    │ BLOCK_SIZE (u32)                                   │
// │  12    │   4    │ KEY_LENGTH (u32) – max key bytes                   │
// │  16    │   4    │ NODE_CAPACITY (u32) – max keys per node            │
// │  20    │   8    │ ROOT (u64) – root node block, 0 = empty tree       │
// │  28    │   8    │ FREE_HEAD (u64) – head of the free chain, 0 = none │
// │  36    │   8    │ JOURNAL_HEAD (u64) – pending commit journal, 0 =   │
// │        │        │ none; non-zero means replay is required at open    │
// └──────────────────────────────────────────────────────────────────────┘
//
// Every block after the header is block-number addressed at
// `block * BLOCK_SIZE`. A free block stores the next free block number in
// its first 8 bytes; the rest of its content is undefined.

use crate::error::{TreeError, TreeResult};

pub const MAGIC: u32 = 0x42504C54; // "BPLT"
pub const FORMAT_VERSION: u32 = 1;

/// Serialized size of the header fields at the front of block 0.
pub const HEADER_LEN: usize = 44;

/// Per-node on-block overhead: kind byte, key count, first child pointer
/// (interior) or next-leaf pointer (leaf).
pub const NODE_HEADER_LEN: usize = 1 + 2 + 8;

/// Per-cell overhead besides the padded key bytes: stored key length plus
/// a child pointer or value.
pub const CELL_OVERHEAD: usize = 2 + 8;

/// Smallest block size that can hold a full node, the header fields, and
/// a free-chain link for the given tree parameters.
pub fn required_block_size(key_length: usize, node_capacity: usize) -> usize {
    let node = NODE_HEADER_LEN + node_capacity * (CELL_OVERHEAD + key_length);
    node.max(HEADER_LEN)
}

/// The persisted file header. Lives in block 0 and is rewritten (last) on
/// every commit; the root and journal-head fields are the commit points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub block_size: u32,
    pub key_length: u32,
    pub node_capacity: u32,
    pub root: u64,
    pub free_head: u64,
    pub journal_head: u64,
}

impl StoreHeader {
    /// Serializes the header into a full block image.
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; block_size];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.key_length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.node_capacity.to_le_bytes());
        buf[20..28].copy_from_slice(&self.root.to_le_bytes());
        buf[28..36].copy_from_slice(&self.free_head.to_le_bytes());
        buf[36..44].copy_from_slice(&self.journal_head.to_le_bytes());
        buf
    }

    /// Deserializes the header from the front of block 0.
    pub fn decode(buf: &[u8]) -> TreeResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(TreeError::BlockFile(
                "file too short to hold a header block".into(),
            ));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(TreeError::BlockFile(format!(
                "bad magic {magic:#010x}, not a block index file"
            )));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(TreeError::BlockFile(format!(
                "unsupported format version {version}"
            )));
        }
        Ok(StoreHeader {
            block_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            key_length: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            node_capacity: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            root: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            free_head: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
            journal_head: u64::from_le_bytes(buf[36..44].try_into().unwrap()),
        })
    }
}
