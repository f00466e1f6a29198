use std::collections::HashSet;

use lodesync_types::ChunkHash;

use crate::packer::ContentPacker;
use crate::store_index::StoreIndex;

/// The slice of a version index this store consumes: the version's ordered
/// chunk multiset with sizes. File paths, permissions and chunk ranges are
/// the sync layer's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionContent {
    pub chunk_hashes: Vec<ChunkHash>,
    pub chunk_sizes: Vec<u32>,
}

impl VersionContent {
    pub fn new(chunk_hashes: Vec<ChunkHash>, chunk_sizes: Vec<u32>) -> Self {
        Self {
            chunk_hashes,
            chunk_sizes,
        }
    }
}

/// Plan the blocks that must be uploaded to make `version` fully resolvable.
///
/// Chunks already covered by `existing` (typically the result of resolving
/// the version's chunks against the remote index) are skipped; the rest are
/// grouped into block layouts in version order. The returned index carries
/// no payloads, only the layouts the write pipeline will fill and upload.
pub fn missing_content(
    hash_identifier: lodesync_types::HashIdentifier,
    existing: &StoreIndex,
    version: &VersionContent,
    packer: &ContentPacker,
    tag: u32,
) -> StoreIndex {
    let covered: HashSet<ChunkHash> = existing.chunk_hashes().iter().copied().collect();

    let missing: Vec<(ChunkHash, u32)> = version
        .chunk_hashes
        .iter()
        .zip(version.chunk_sizes.iter())
        .filter(|(h, _)| !covered.contains(h))
        .map(|(&h, &s)| (h, s))
        .collect();

    let layouts = packer.plan(hash_identifier, tag, &missing);
    StoreIndex::from_entries(hash_identifier, layouts)
}
