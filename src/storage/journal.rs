//! Commit journal frames.
//!
//! A commit is made atomic by writing every in-place block image into a
//! chain of journal blocks first — the previous commit's journal blocks
//! where possible, freshly grown blocks for the rest; neither kind is
//! referenced by the committed state. Once those are synced the
//! header's journal head is pointed at the chain (a single-block write),
//! the images are applied in place, and the final header image — which
//! carries a zero journal head — lands last. Opening a store with a
//! non-zero journal head replays the chain before anything else.
//!
//! Journal block layout: `[next journal block u64][payload bytes]`.
//! The logical payload, spliced across the chain, is:
//! `[entry count u32]` then per entry `[block u64][image BLOCK_SIZE bytes]`.

use crate::error::{TreeError, TreeResult};

/// Usable payload bytes per journal block.
fn payload_per_block(block_size: usize) -> usize {
    block_size - 8
}

fn payload_len(entry_count: usize, block_size: usize) -> usize {
    4 + entry_count * (8 + block_size)
}

/// Number of journal blocks a batch of `entry_count` images needs.
pub(crate) fn frames_needed(entry_count: usize, block_size: usize) -> usize {
    payload_len(entry_count, block_size).div_ceil(payload_per_block(block_size))
}

/// Lays a write batch out across the given journal blocks, chaining them
/// in order. Returns one full block image per journal block.
pub(crate) fn encode_frames(
    writes: &[(u64, Vec<u8>)],
    journal_blocks: &[u64],
    block_size: usize,
) -> Vec<(u64, Vec<u8>)> {
    let mut payload = Vec::with_capacity(payload_len(writes.len(), block_size));
    payload.extend_from_slice(&(writes.len() as u32).to_le_bytes());
    for (block, image) in writes {
        debug_assert_eq!(image.len(), block_size);
        payload.extend_from_slice(&block.to_le_bytes());
        payload.extend_from_slice(image);
    }

    let per_block = payload_per_block(block_size);
    debug_assert_eq!(journal_blocks.len(), payload.len().div_ceil(per_block));

    let mut frames = Vec::with_capacity(journal_blocks.len());
    for (i, chunk) in payload.chunks(per_block).enumerate() {
        let next = journal_blocks.get(i + 1).copied().unwrap_or(0);
        let mut image = vec![0u8; block_size];
        image[..8].copy_from_slice(&next.to_le_bytes());
        image[8..8 + chunk.len()].copy_from_slice(chunk);
        frames.push((journal_blocks[i], image));
    }
    frames
}

/// Reassembles a write batch from the concatenated payload bytes of a
/// journal chain. Order is preserved; the caller applies entries front to
/// back so the header image (always last in a batch) lands last.
pub(crate) fn decode_frames(payload: &[u8], block_size: usize) -> TreeResult<Vec<(u64, Vec<u8>)>> {
    if payload.len() < 4 {
        return Err(TreeError::BlockFile("journal payload truncated".into()));
    }
    let count = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
    let entry_len = 8 + block_size;
    if payload.len() < 4 + count * entry_len {
        return Err(TreeError::BlockFile(format!(
            "journal payload truncated: {} entries do not fit in {} bytes",
            count,
            payload.len()
        )));
    }
    let mut writes = Vec::with_capacity(count);
    let mut offset = 4;
    for _ in 0..count {
        let block = u64::from_le_bytes(payload[offset..offset + 8].try_into().unwrap());
        let image = payload[offset + 8..offset + entry_len].to_vec();
        writes.push((block, image));
        offset += entry_len;
    }
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_writes(n: usize, block_size: usize) -> Vec<(u64, Vec<u8>)> {
        (0..n)
            .map(|i| {
                let mut image = vec![i as u8; block_size];
                image[0] = 0xA0 + i as u8;
                (10 + i as u64, image)
            })
            .collect()
    }

    #[test]
    fn frames_roundtrip_single_block() {
        let bs = 512;
        let writes = sample_writes(1, bs);
        let n = frames_needed(writes.len(), bs);
        assert_eq!(n, 2); // 4 + 8 + 512 bytes > 504 payload bytes
        let jblocks: Vec<u64> = (100..100 + n as u64).collect();
        let frames = encode_frames(&writes, &jblocks, bs);
        assert_eq!(frames.len(), n);

        let mut payload = Vec::new();
        for (_, image) in &frames {
            payload.extend_from_slice(&image[8..]);
        }
        let decoded = decode_frames(&payload, bs).unwrap();
        assert_eq!(decoded, writes);
    }

    #[test]
    fn frames_roundtrip_many_entries() {
        let bs = 64;
        let writes = sample_writes(9, bs);
        let n = frames_needed(writes.len(), bs);
        let jblocks: Vec<u64> = (200..200 + n as u64).collect();
        let frames = encode_frames(&writes, &jblocks, bs);

        // Chain pointers link the frames in order, 0-terminated.
        for (i, (block, image)) in frames.iter().enumerate() {
            assert_eq!(*block, jblocks[i]);
            let next = u64::from_le_bytes(image[..8].try_into().unwrap());
            assert_eq!(next, jblocks.get(i + 1).copied().unwrap_or(0));
        }

        let mut payload = Vec::new();
        for (_, image) in &frames {
            payload.extend_from_slice(&image[8..]);
        }
        assert_eq!(decode_frames(&payload, bs).unwrap(), writes);
    }

    #[test]
    fn truncated_payload_rejected() {
        let bs = 64;
        let writes = sample_writes(2, bs);
        let n = frames_needed(writes.len(), bs);
        let jblocks: Vec<u64> = (300..300 + n as u64).collect();
        let frames = encode_frames(&writes, &jblocks, bs);
        let mut payload = Vec::new();
        for (_, image) in &frames {
            payload.extend_from_slice(&image[8..]);
        }
        payload.truncate(bs); // lose the tail
        assert!(matches!(
            decode_frames(&payload, bs),
            Err(TreeError::BlockFile(_))
        ));
        assert!(matches!(
            decode_frames(&[0, 1], bs),
            Err(TreeError::BlockFile(_))
        ));
    }
}
