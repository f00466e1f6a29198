use std::collections::HashSet;

use lodesync_types::ChunkHash;

use crate::store_index::StoreIndex;

/// Select blocks from `index` that cover as many of the requested chunks as
/// possible while staying above the utilization threshold.
///
/// Utilization is the fraction of a block's chunks that were requested. At
/// a threshold of 0 every block touching any wanted chunk is returned
/// (maximum reuse, potentially high fetch overhead); higher thresholds
/// prefer re-chunking over fetching sparsely useful blocks.
///
/// Selection is greedy: candidates ordered by useful-chunk count
/// descending (ties broken by ascending block hash), each selected only if
/// it still contributes an uncovered chunk. Selected blocks are returned
/// with their full chunk lists.
pub fn select_blocks(
    index: &StoreIndex,
    chunk_hashes: &[ChunkHash],
    min_block_usage_percent: u32,
) -> StoreIndex {
    let required: HashSet<ChunkHash> = chunk_hashes.iter().copied().collect();

    // (useful count, ordinal) for every block passing the utilization filter.
    let mut candidates: Vec<(usize, usize)> = Vec::new();
    for ordinal in 0..index.block_count() {
        let chunks = index.chunk_hashes_for(ordinal);
        let useful = chunks.iter().filter(|h| required.contains(h)).count();
        if useful == 0 {
            continue;
        }
        let passes = (useful as u64) * 100
            >= u64::from(min_block_usage_percent) * chunks.len() as u64;
        if passes {
            candidates.push((useful, ordinal));
        }
    }

    // Ordinals ascend with block hash, so sorting by (useful desc, ordinal
    // asc) breaks ties by ascending block hash.
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut covered: HashSet<ChunkHash> = HashSet::with_capacity(required.len());
    let mut selected = Vec::new();
    for (_, ordinal) in candidates {
        let chunks = index.chunk_hashes_for(ordinal);
        let contributes = chunks
            .iter()
            .any(|h| required.contains(h) && !covered.contains(h));
        if !contributes {
            continue;
        }
        for h in chunks {
            if required.contains(h) {
                covered.insert(*h);
            }
        }
        selected.push(index.entry_at(ordinal));
    }

    StoreIndex::from_entries(index.hash_identifier(), selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_index::BlockIndexEntry;
    use lodesync_types::{BlockHash, HashIdentifier};

    const ID: HashIdentifier = HashIdentifier(0xb1a3e001);

    fn entry(block: u64, chunks: &[u64]) -> BlockIndexEntry {
        BlockIndexEntry {
            block_hash: BlockHash(block),
            tag: 0,
            chunk_hashes: chunks.iter().map(|&h| ChunkHash(h)).collect(),
            chunk_sizes: chunks.iter().map(|_| 16).collect(),
        }
    }

    fn wanted(hashes: &[u64]) -> Vec<ChunkHash> {
        hashes.iter().map(|&h| ChunkHash(h)).collect()
    }

    #[test]
    fn empty_index_selects_nothing() {
        let index = StoreIndex::empty();
        let selected = select_blocks(&index, &wanted(&[1, 2, 3, 4]), 0);
        assert_eq!(selected.block_count(), 0);
    }

    #[test]
    fn every_touching_block_selected_at_zero_threshold() {
        let index = StoreIndex::from_entries(
            ID,
            vec![
                entry(1, &[11, 12, 13]),
                entry(2, &[21, 22, 23]),
                entry(3, &[31, 32, 33]),
            ],
        );
        let selected = select_blocks(&index, &wanted(&[11, 22, 33]), 0);
        assert_eq!(selected.block_count(), 3);
        // Full chunk lists come back, not just the useful chunks.
        assert_eq!(selected.chunk_count(), 9);
    }

    #[test]
    fn untouched_blocks_never_selected() {
        let index = StoreIndex::from_entries(
            ID,
            vec![entry(1, &[11, 12]), entry(2, &[21, 22])],
        );
        let selected = select_blocks(&index, &wanted(&[11]), 0);
        assert_eq!(selected.block_hashes(), &[BlockHash(1)]);
    }

    #[test]
    fn utilization_threshold_filters_sparse_blocks() {
        let index = StoreIndex::from_entries(
            ID,
            vec![entry(1, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])],
        );
        // One useful chunk of ten: 10% usage.
        assert_eq!(select_blocks(&index, &wanted(&[1]), 50).block_count(), 0);
        assert_eq!(select_blocks(&index, &wanted(&[1]), 11).block_count(), 0);
        assert_eq!(select_blocks(&index, &wanted(&[1]), 10).block_count(), 1);
        assert_eq!(select_blocks(&index, &wanted(&[1]), 5).block_count(), 1);
    }

    #[test]
    fn redundant_blocks_are_skipped() {
        // Block 2 duplicates a subset of block 1's chunks.
        let index = StoreIndex::from_entries(
            ID,
            vec![entry(1, &[11, 12, 13]), entry(2, &[11, 12])],
        );
        let selected = select_blocks(&index, &wanted(&[11, 12, 13]), 0);
        assert_eq!(selected.block_hashes(), &[BlockHash(1)]);
    }

    #[test]
    fn prefers_more_useful_blocks() {
        let index = StoreIndex::from_entries(
            ID,
            vec![
                entry(1, &[11, 99]),
                entry(2, &[11, 12, 13]),
            ],
        );
        // Block 2 covers all three wanted chunks; block 1 then adds nothing.
        let selected = select_blocks(&index, &wanted(&[11, 12, 13]), 0);
        assert_eq!(selected.block_hashes(), &[BlockHash(2)]);
    }

    #[test]
    fn ties_break_by_ascending_block_hash() {
        // Both blocks carry the same single wanted chunk.
        let index = StoreIndex::from_entries(
            ID,
            vec![entry(7, &[11]), entry(3, &[11])],
        );
        let selected = select_blocks(&index, &wanted(&[11]), 0);
        assert_eq!(selected.block_hashes(), &[BlockHash(3)]);
    }

    #[test]
    fn every_selected_block_meets_the_threshold() {
        let index = StoreIndex::from_entries(
            ID,
            vec![
                entry(1, &[11, 12]),
                entry(2, &[21, 91, 92, 93]),
                entry(3, &[31]),
            ],
        );
        let threshold = 50;
        let selected = select_blocks(&index, &wanted(&[11, 12, 21, 31]), threshold);
        for ordinal in 0..selected.block_count() {
            let chunks = selected.chunk_hashes_for(ordinal);
            let useful = chunks
                .iter()
                .filter(|h| wanted(&[11, 12, 21, 31]).contains(h))
                .count();
            assert!(useful as u64 * 100 >= u64::from(threshold) * chunks.len() as u64);
        }
        // Block 2 is 25% useful and must be filtered out.
        assert!(!selected.contains_block(BlockHash(2)));
        assert!(selected.contains_block(BlockHash(1)));
        assert!(selected.contains_block(BlockHash(3)));
    }

    #[test]
    fn duplicate_requested_hashes_are_deduplicated() {
        let index = StoreIndex::from_entries(ID, vec![entry(1, &[11])]);
        let selected = select_blocks(&index, &wanted(&[11, 11, 11]), 0);
        assert_eq!(selected.block_count(), 1);
    }
}
