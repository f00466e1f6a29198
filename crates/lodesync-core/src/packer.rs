use std::collections::{HashMap, HashSet};

use lodesync_types::{ChunkHash, HashIdentifier, Result};

use crate::block::{Chunk, StoredBlock};
use crate::hash;
use crate::store_index::BlockIndexEntry;

/// Groups new chunks into blocks honoring a target block size and a
/// chunks-per-block cap.
///
/// The grouping is deterministic: the same chunk sequence and limits always
/// produce the same blocks, and therefore the same block hashes.
#[derive(Debug, Clone, Copy)]
pub struct ContentPacker {
    pub target_block_size: u32,
    pub max_chunks_per_block: u32,
}

impl ContentPacker {
    pub fn new(target_block_size: u32, max_chunks_per_block: u32) -> Self {
        Self {
            target_block_size,
            max_chunks_per_block,
        }
    }

    /// Plan block layouts for a sequence of `(chunk hash, size)` pairs.
    ///
    /// Input is deduplicated by chunk hash with first-occurrence order
    /// preserved. Every block except possibly the last stays within the
    /// target size and chunk cap; an oversized chunk gets a block of its
    /// own. The final block may be arbitrarily small: sealing never applies
    /// a utilization threshold, that is a read-side filter.
    pub fn plan(
        &self,
        hash_identifier: HashIdentifier,
        tag: u32,
        chunks: &[(ChunkHash, u32)],
    ) -> Vec<BlockIndexEntry> {
        let mut seen = HashSet::with_capacity(chunks.len());
        let mut blocks = Vec::new();
        let mut current: Vec<(ChunkHash, u32)> = Vec::new();
        let mut current_size: u64 = 0;

        for &(chunk_hash, size) in chunks {
            if !seen.insert(chunk_hash) {
                continue;
            }
            let fits = current_size + u64::from(size) <= u64::from(self.target_block_size)
                && (current.len() as u32) < self.max_chunks_per_block;
            if !current.is_empty() && !fits {
                blocks.push(self.seal(hash_identifier, tag, &current));
                current.clear();
                current_size = 0;
            }
            current_size += u64::from(size);
            current.push((chunk_hash, size));
        }
        if !current.is_empty() {
            blocks.push(self.seal(hash_identifier, tag, &current));
        }
        blocks
    }

    /// Group chunk payloads into sealed blocks.
    pub fn pack(
        &self,
        hash_identifier: HashIdentifier,
        tag: u32,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<StoredBlock>> {
        let pairs: Vec<(ChunkHash, u32)> = chunks.iter().map(|c| (c.hash, c.size)).collect();
        let mut by_hash: HashMap<ChunkHash, Chunk> = HashMap::with_capacity(chunks.len());
        for chunk in chunks {
            by_hash.entry(chunk.hash).or_insert(chunk);
        }

        let layouts = self.plan(hash_identifier, tag, &pairs);
        let mut blocks = Vec::with_capacity(layouts.len());
        for layout in layouts {
            let mut members = Vec::with_capacity(layout.chunk_hashes.len());
            for chunk_hash in layout.chunk_hashes {
                let chunk = by_hash.remove(&chunk_hash).ok_or_else(|| {
                    lodesync_types::LodeError::Other(format!(
                        "planned chunk {chunk_hash} has no payload"
                    ))
                })?;
                members.push(chunk);
            }
            blocks.push(StoredBlock::build(hash_identifier, tag, members)?);
        }
        Ok(blocks)
    }

    fn seal(
        &self,
        hash_identifier: HashIdentifier,
        tag: u32,
        members: &[(ChunkHash, u32)],
    ) -> BlockIndexEntry {
        let chunk_hashes: Vec<ChunkHash> = members.iter().map(|&(h, _)| h).collect();
        let chunk_sizes: Vec<u32> = members.iter().map(|&(_, s)| s).collect();
        let block_hash = hash::block_hash(hash_identifier, &chunk_hashes, &chunk_sizes);
        BlockIndexEntry {
            block_hash,
            tag,
            chunk_hashes,
            chunk_sizes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: HashIdentifier = HashIdentifier(0xb1a3e001);

    fn pairs(raw: &[(u64, u32)]) -> Vec<(ChunkHash, u32)> {
        raw.iter().map(|&(h, s)| (ChunkHash(h), s)).collect()
    }

    #[test]
    fn respects_target_size() {
        let packer = ContentPacker::new(100, 1024);
        let layouts = packer.plan(ID, 0, &pairs(&[(1, 60), (2, 60), (3, 30), (4, 30)]));
        assert_eq!(layouts.len(), 3);
        assert_eq!(layouts[0].chunk_hashes, vec![ChunkHash(1)]);
        assert_eq!(layouts[1].chunk_hashes, vec![ChunkHash(2), ChunkHash(3)]);
        assert_eq!(layouts[2].chunk_hashes, vec![ChunkHash(4)]);
    }

    #[test]
    fn respects_chunk_cap() {
        let packer = ContentPacker::new(u32::MAX, 2);
        let layouts = packer.plan(ID, 0, &pairs(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)]));
        assert_eq!(layouts.len(), 3);
        assert_eq!(layouts[0].chunk_hashes.len(), 2);
        assert_eq!(layouts[1].chunk_hashes.len(), 2);
        assert_eq!(layouts[2].chunk_hashes.len(), 1);
    }

    #[test]
    fn oversized_chunk_gets_its_own_block() {
        let packer = ContentPacker::new(100, 1024);
        let layouts = packer.plan(ID, 0, &pairs(&[(1, 500), (2, 10)]));
        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[0].chunk_sizes, vec![500]);
        assert_eq!(layouts[1].chunk_sizes, vec![10]);
    }

    #[test]
    fn dedups_preserving_first_occurrence() {
        let packer = ContentPacker::new(1000, 1024);
        let layouts = packer.plan(ID, 0, &pairs(&[(1, 10), (2, 20), (1, 10), (3, 30), (2, 20)]));
        assert_eq!(layouts.len(), 1);
        assert_eq!(
            layouts[0].chunk_hashes,
            vec![ChunkHash(1), ChunkHash(2), ChunkHash(3)]
        );
    }

    #[test]
    fn grouping_is_deterministic() {
        let packer = ContentPacker::new(256, 4);
        let input = pairs(&[(9, 100), (8, 100), (7, 100), (6, 50), (5, 50)]);
        let a = packer.plan(ID, 3, &input);
        let b = packer.plan(ID, 3, &input);
        assert_eq!(a, b);
    }

    #[test]
    fn non_terminal_blocks_stay_within_bounds() {
        let packer = ContentPacker::new(128, 3);
        let input: Vec<(ChunkHash, u32)> =
            (1..=20).map(|i| (ChunkHash(i), (i as u32 % 7) * 16 + 8)).collect();
        let layouts = packer.plan(ID, 0, &input);

        for layout in &layouts[..layouts.len() - 1] {
            let size: u64 = layout.chunk_sizes.iter().map(|&s| u64::from(s)).sum();
            let single_oversized =
                layout.chunk_sizes.len() == 1 && layout.chunk_sizes[0] > packer.target_block_size;
            assert!(size <= 128 || single_oversized, "block too large: {size}");
            assert!(layout.chunk_hashes.len() <= 3);
        }
        // Every input chunk appears exactly once.
        let total: usize = layouts.iter().map(|l| l.chunk_hashes.len()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn pack_produces_blocks_matching_plan() {
        let packer = ContentPacker::new(64, 1024);
        let chunks = vec![
            Chunk::new(ChunkHash(1), vec![0xAA; 40]),
            Chunk::new(ChunkHash(2), vec![0xBB; 40]),
            Chunk::new(ChunkHash(3), vec![0xCC; 10]),
        ];
        let pairs: Vec<(ChunkHash, u32)> = chunks.iter().map(|c| (c.hash, c.size)).collect();

        let layouts = packer.plan(ID, 5, &pairs);
        let blocks = packer.pack(ID, 5, chunks).unwrap();

        assert_eq!(blocks.len(), layouts.len());
        for (block, layout) in blocks.iter().zip(layouts.iter()) {
            assert_eq!(block.block_hash, layout.block_hash);
            assert_eq!(block.chunk_hashes(), layout.chunk_hashes);
            assert_eq!(block.tag, 5);
        }
    }

    #[test]
    fn empty_input_produces_no_blocks() {
        let packer = ContentPacker::new(100, 10);
        assert!(packer.plan(ID, 0, &[]).is_empty());
        assert!(packer.pack(ID, 0, Vec::new()).unwrap().is_empty());
    }
}
