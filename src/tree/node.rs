// ┌──────────────────────────────────────────────────────────────────────┐
// │ Node block                                                           │
// │ Offset │ Length │ Description                                        │
// │────────┼────────┼────────────────────────────────────────────────────│
// │   0    │   1    │ KIND (0 = interior, 1 = leaf)                      │
// │   1    │   2    │ KEY_COUNT (u16)                                    │
// │   3    │   8    │ leaf: NEXT_LEAF block (u64, 0 = end of chain)      │
// │        │        │ interior: CHILD_0 block (u64)                      │
// │  11    │  ...   │ Cells                                              │
// └──────────────────────────────────────────────────────────────────────┘
//
// Cell, both kinds: [KEY_LEN u16][key bytes zero-padded to KEY_LENGTH]
// followed by an i64 value (leaf) or a u64 child block (interior).
// Interior child i holds keys k with key[i-1] <= k < key[i].

use crate::error::{TreeError, TreeResult};
use crate::storage::block::NODE_HEADER_LEN;

pub const KIND_INTERIOR: u8 = 0;
pub const KIND_LEAF: u8 = 1;

/// A materialized tree node. Interior nodes carry `keys.len() + 1`
/// children; leaves carry one value per key plus the next-leaf link that
/// forms the ordered leaf chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Interior {
        keys: Vec<String>,
        children: Vec<u64>,
    },
    Leaf {
        keys: Vec<String>,
        values: Vec<i64>,
        next: u64,
    },
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn key_count(&self) -> usize {
        match self {
            Node::Interior { keys, .. } | Node::Leaf { keys, .. } => keys.len(),
        }
    }

    /// Serializes this node into a full block image.
    pub fn encode(&self, block_size: usize, key_length: usize) -> TreeResult<Vec<u8>> {
        let mut buf = vec![0u8; block_size];
        let count = self.key_count();
        buf[1..3].copy_from_slice(&(count as u16).to_le_bytes());

        let write_key = |buf: &mut [u8], offset: usize, key: &str| -> TreeResult<usize> {
            let bytes = key.as_bytes();
            if bytes.len() > key_length {
                return Err(TreeError::BadKeyValue(format!(
                    "key {key:?} exceeds the configured key length {key_length}"
                )));
            }
            buf[offset..offset + 2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
            buf[offset + 2..offset + 2 + bytes.len()].copy_from_slice(bytes);
            Ok(offset + 2 + key_length)
        };

        match self {
            Node::Interior { keys, children } => {
                if children.len() != keys.len() + 1 {
                    return Err(TreeError::Invalid(format!(
                        "interior node with {} keys has {} children",
                        keys.len(),
                        children.len()
                    )));
                }
                buf[0] = KIND_INTERIOR;
                buf[3..11].copy_from_slice(&children[0].to_le_bytes());
                let mut offset = NODE_HEADER_LEN;
                for (key, &child) in keys.iter().zip(children[1..].iter()) {
                    offset = write_key(&mut buf, offset, key)?;
                    buf[offset..offset + 8].copy_from_slice(&child.to_le_bytes());
                    offset += 8;
                }
            }
            Node::Leaf { keys, values, next } => {
                if values.len() != keys.len() {
                    return Err(TreeError::Invalid(format!(
                        "leaf node with {} keys has {} values",
                        keys.len(),
                        values.len()
                    )));
                }
                buf[0] = KIND_LEAF;
                buf[3..11].copy_from_slice(&next.to_le_bytes());
                let mut offset = NODE_HEADER_LEN;
                for (key, &value) in keys.iter().zip(values.iter()) {
                    offset = write_key(&mut buf, offset, key)?;
                    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
                    offset += 8;
                }
            }
        }
        Ok(buf)
    }

    /// Deserializes a node from a block image. Any malformed content is a
    /// storage integrity error, never a panic.
    pub fn decode(buf: &[u8], key_length: usize, node_capacity: usize) -> TreeResult<Node> {
        if buf.len() < NODE_HEADER_LEN {
            return Err(TreeError::BlockFile("node block truncated".into()));
        }
        let kind = buf[0];
        let count = u16::from_le_bytes(buf[1..3].try_into().unwrap()) as usize;
        if count > node_capacity {
            return Err(TreeError::BlockFile(format!(
                "node claims {count} keys but capacity is {node_capacity}"
            )));
        }
        let cell = 2 + key_length + 8;
        if NODE_HEADER_LEN + count * cell > buf.len() {
            return Err(TreeError::BlockFile(format!(
                "node with {count} keys does not fit in a {} byte block",
                buf.len()
            )));
        }

        let read_key = |offset: usize| -> TreeResult<String> {
            let len = u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize;
            if len > key_length {
                return Err(TreeError::BlockFile(format!(
                    "stored key length {len} exceeds the configured maximum {key_length}"
                )));
            }
            let bytes = &buf[offset + 2..offset + 2 + len];
            String::from_utf8(bytes.to_vec())
                .map_err(|_| TreeError::BlockFile("stored key is not valid UTF-8".into()))
        };

        let mut keys = Vec::with_capacity(count);
        let mut offset = NODE_HEADER_LEN;
        match kind {
            KIND_INTERIOR => {
                let mut children = Vec::with_capacity(count + 1);
                children.push(u64::from_le_bytes(buf[3..11].try_into().unwrap()));
                for _ in 0..count {
                    keys.push(read_key(offset)?);
                    offset += 2 + key_length;
                    children.push(u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap()));
                    offset += 8;
                }
                Ok(Node::Interior { keys, children })
            }
            KIND_LEAF => {
                let next = u64::from_le_bytes(buf[3..11].try_into().unwrap());
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(read_key(offset)?);
                    offset += 2 + key_length;
                    values.push(i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap()));
                    offset += 8;
                }
                Ok(Node::Leaf { keys, values, next })
            }
            other => Err(TreeError::BlockFile(format!(
                "unknown node kind byte {other}"
            ))),
        }
    }
}
