use std::collections::{HashMap, HashSet};

use lodesync_types::{BlockHash, ChunkHash, HashIdentifier, LodeError, Result};

/// Magic bytes at the start of a serialized store index.
pub const STORE_INDEX_MAGIC: u32 = 0x5CB9_1B48;
/// Store index format version.
pub const STORE_INDEX_VERSION: u32 = 1;
/// Fixed header size: magic, version, hash identifier, block count, chunk count.
const STORE_INDEX_HEADER_SIZE: usize = 20;

/// One block's row in the store index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub block_hash: BlockHash,
    pub tag: u32,
    pub chunk_hashes: Vec<ChunkHash>,
    pub chunk_sizes: Vec<u32>,
}

/// The consolidated directory of every block resident in a store.
///
/// Stored as parallel arrays ordered by ascending block hash (the arena is
/// exactly the serialized layout), with per-block chunk ranges resolved
/// through prefix offsets and a hash → ordinal map for lookups. Instances
/// are immutable; merge/subtract/project produce new indexes.
#[derive(Debug, Clone)]
pub struct StoreIndex {
    hash_identifier: HashIdentifier,
    block_hashes: Vec<BlockHash>,
    tags: Vec<u32>,
    chunk_counts: Vec<u32>,
    /// Start offset of each block's chunk range; one extra trailing entry
    /// holding the total chunk count.
    chunk_starts: Vec<usize>,
    chunk_hashes: Vec<ChunkHash>,
    chunk_sizes: Vec<u32>,
    ordinals: HashMap<BlockHash, usize>,
}

impl StoreIndex {
    /// An index with no blocks and an unset hash identifier.
    pub fn empty() -> Self {
        Self::from_entries(HashIdentifier(0), Vec::new())
    }

    /// Build an index from block entries. Entries are ordered by block hash;
    /// duplicate hashes keep the first occurrence.
    pub fn from_entries(hash_identifier: HashIdentifier, mut entries: Vec<BlockIndexEntry>) -> Self {
        entries.sort_by_key(|e| e.block_hash);
        entries.dedup_by_key(|e| e.block_hash);

        let block_count = entries.len();
        let total_chunks: usize = entries.iter().map(|e| e.chunk_hashes.len()).sum();

        let mut index = StoreIndex {
            hash_identifier,
            block_hashes: Vec::with_capacity(block_count),
            tags: Vec::with_capacity(block_count),
            chunk_counts: Vec::with_capacity(block_count),
            chunk_starts: Vec::with_capacity(block_count + 1),
            chunk_hashes: Vec::with_capacity(total_chunks),
            chunk_sizes: Vec::with_capacity(total_chunks),
            ordinals: HashMap::with_capacity(block_count),
        };

        for (ordinal, entry) in entries.into_iter().enumerate() {
            index.block_hashes.push(entry.block_hash);
            index.tags.push(entry.tag);
            index.chunk_counts.push(entry.chunk_hashes.len() as u32);
            index.chunk_starts.push(index.chunk_hashes.len());
            index.chunk_hashes.extend(entry.chunk_hashes);
            index.chunk_sizes.extend(entry.chunk_sizes);
            index.ordinals.insert(entry.block_hash, ordinal);
        }
        index.chunk_starts.push(index.chunk_hashes.len());
        index
    }

    pub fn hash_identifier(&self) -> HashIdentifier {
        self.hash_identifier
    }

    pub fn block_count(&self) -> usize {
        self.block_hashes.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_hashes.is_empty()
    }

    /// All block hashes, ascending.
    pub fn block_hashes(&self) -> &[BlockHash] {
        &self.block_hashes
    }

    /// All chunk hashes, concatenated in block order.
    pub fn chunk_hashes(&self) -> &[ChunkHash] {
        &self.chunk_hashes
    }

    pub fn contains_block(&self, block_hash: BlockHash) -> bool {
        self.ordinals.contains_key(&block_hash)
    }

    /// The chunk hashes of the block at `ordinal`.
    pub fn chunk_hashes_for(&self, ordinal: usize) -> &[ChunkHash] {
        &self.chunk_hashes[self.chunk_starts[ordinal]..self.chunk_starts[ordinal + 1]]
    }

    /// The chunk sizes of the block at `ordinal`.
    pub fn chunk_sizes_for(&self, ordinal: usize) -> &[u32] {
        &self.chunk_sizes[self.chunk_starts[ordinal]..self.chunk_starts[ordinal + 1]]
    }

    pub(crate) fn entry_at(&self, ordinal: usize) -> BlockIndexEntry {
        BlockIndexEntry {
            block_hash: self.block_hashes[ordinal],
            tag: self.tags[ordinal],
            chunk_hashes: self.chunk_hashes_for(ordinal).to_vec(),
            chunk_sizes: self.chunk_sizes_for(ordinal).to_vec(),
        }
    }

    /// Materialize the entry for one block.
    pub fn get_block(&self, block_hash: BlockHash) -> Option<BlockIndexEntry> {
        self.ordinals.get(&block_hash).map(|&o| self.entry_at(o))
    }

    /// Materialize all entries in block order.
    pub fn entries(&self) -> Vec<BlockIndexEntry> {
        (0..self.block_count()).map(|o| self.entry_at(o)).collect()
    }

    /// Union by block hash; on collision `self`'s entry wins.
    ///
    /// Indexes written with different hash families cannot be merged.
    pub fn merge(&self, other: &StoreIndex) -> Result<StoreIndex> {
        let hash_identifier = match (self.is_empty(), other.is_empty()) {
            (true, _) => other.hash_identifier,
            (false, true) => self.hash_identifier,
            (false, false) => {
                if self.hash_identifier != other.hash_identifier {
                    return Err(LodeError::InvalidFormat(format!(
                        "cannot merge store indexes with hash identifiers {} and {}",
                        self.hash_identifier, other.hash_identifier
                    )));
                }
                self.hash_identifier
            }
        };

        let mut entries = self.entries();
        for (ordinal, &block_hash) in other.block_hashes.iter().enumerate() {
            if !self.contains_block(block_hash) {
                entries.push(other.entry_at(ordinal));
            }
        }
        Ok(StoreIndex::from_entries(hash_identifier, entries))
    }

    /// A new index without the listed blocks.
    pub fn subtract(&self, block_hashes: &HashSet<BlockHash>) -> StoreIndex {
        let entries = (0..self.block_count())
            .filter(|&o| !block_hashes.contains(&self.block_hashes[o]))
            .map(|o| self.entry_at(o))
            .collect();
        StoreIndex::from_entries(self.hash_identifier, entries)
    }

    /// Select the blocks worth fetching for the requested chunks, honoring
    /// the minimum block utilization threshold.
    pub fn project(
        &self,
        chunk_hashes: &[ChunkHash],
        min_block_usage_percent: u32,
    ) -> StoreIndex {
        crate::resolver::select_blocks(self, chunk_hashes, min_block_usage_percent)
    }

    /// Stable binary encoding: identical logical content always produces
    /// identical bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let n = self.block_count();
        let m = self.chunk_count();
        let mut buf = Vec::with_capacity(STORE_INDEX_HEADER_SIZE + 16 * n + 12 * m);

        buf.extend_from_slice(&STORE_INDEX_MAGIC.to_le_bytes());
        buf.extend_from_slice(&STORE_INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.hash_identifier.0.to_le_bytes());
        buf.extend_from_slice(&(n as u32).to_le_bytes());
        buf.extend_from_slice(&(m as u32).to_le_bytes());

        for h in &self.block_hashes {
            buf.extend_from_slice(&h.0.to_le_bytes());
        }
        for t in &self.tags {
            buf.extend_from_slice(&t.to_le_bytes());
        }
        for c in &self.chunk_counts {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        for h in &self.chunk_hashes {
            buf.extend_from_slice(&h.0.to_le_bytes());
        }
        for s in &self.chunk_sizes {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf
    }

    /// Bit-exact reverse of [`serialize`], with structural validation.
    ///
    /// [`serialize`]: StoreIndex::serialize
    pub fn parse(data: &[u8]) -> Result<StoreIndex> {
        let mut pos = 0usize;

        let magic = read_u32(data, &mut pos)?;
        if magic != STORE_INDEX_MAGIC {
            return Err(LodeError::IndexCorrupt(format!(
                "bad magic {magic:#010x}, expected {STORE_INDEX_MAGIC:#010x}"
            )));
        }
        let version = read_u32(data, &mut pos)?;
        if version != STORE_INDEX_VERSION {
            return Err(LodeError::IndexCorrupt(format!(
                "unknown version {version}"
            )));
        }
        let hash_identifier = HashIdentifier(read_u32(data, &mut pos)?);
        let n = read_u32(data, &mut pos)? as usize;
        let m = read_u32(data, &mut pos)? as usize;

        let expected_len = STORE_INDEX_HEADER_SIZE as u64 + 16 * n as u64 + 12 * m as u64;
        if data.len() as u64 != expected_len {
            return Err(LodeError::IndexCorrupt(format!(
                "length {} does not match declared content ({expected_len})",
                data.len()
            )));
        }

        let mut block_hashes = Vec::with_capacity(n);
        for _ in 0..n {
            block_hashes.push(BlockHash(read_u64(data, &mut pos)?));
        }
        for pair in block_hashes.windows(2) {
            if pair[0] >= pair[1] {
                return Err(LodeError::IndexCorrupt(format!(
                    "block hashes not strictly ascending at {}",
                    pair[1]
                )));
            }
        }

        let mut tags = Vec::with_capacity(n);
        for _ in 0..n {
            tags.push(read_u32(data, &mut pos)?);
        }

        let mut chunk_counts = Vec::with_capacity(n);
        let mut total: u64 = 0;
        for _ in 0..n {
            let c = read_u32(data, &mut pos)?;
            total += u64::from(c);
            chunk_counts.push(c);
        }
        if total != m as u64 {
            return Err(LodeError::IndexCorrupt(format!(
                "per-block chunk counts sum to {total}, header declares {m}"
            )));
        }

        let mut chunk_hashes = Vec::with_capacity(m);
        for _ in 0..m {
            chunk_hashes.push(ChunkHash(read_u64(data, &mut pos)?));
        }
        let mut chunk_sizes = Vec::with_capacity(m);
        for _ in 0..m {
            chunk_sizes.push(read_u32(data, &mut pos)?);
        }

        let mut chunk_starts = Vec::with_capacity(n + 1);
        let mut ordinals = HashMap::with_capacity(n);
        let mut start = 0usize;
        for (ordinal, (&block_hash, &count)) in
            block_hashes.iter().zip(chunk_counts.iter()).enumerate()
        {
            chunk_starts.push(start);
            start += count as usize;
            ordinals.insert(block_hash, ordinal);
        }
        chunk_starts.push(start);

        Ok(StoreIndex {
            hash_identifier,
            block_hashes,
            tags,
            chunk_counts,
            chunk_starts,
            chunk_hashes,
            chunk_sizes,
            ordinals,
        })
    }
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let end = pos
        .checked_add(4)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| LodeError::IndexCorrupt("truncated input".into()))?;
    let value = u32::from_le_bytes(
        data[*pos..end]
            .try_into()
            .map_err(|_| LodeError::IndexCorrupt("truncated input".into()))?,
    );
    *pos = end;
    Ok(value)
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64> {
    let end = pos
        .checked_add(8)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| LodeError::IndexCorrupt("truncated input".into()))?;
    let value = u64::from_le_bytes(
        data[*pos..end]
            .try_into()
            .map_err(|_| LodeError::IndexCorrupt("truncated input".into()))?,
    );
    *pos = end;
    Ok(value)
}
