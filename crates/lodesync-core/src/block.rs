use lodesync_types::{BlockHash, ChunkHash, HashIdentifier, LodeError, Result};

use crate::compress::{self, Compression, CompressionRegistry};
use crate::hash;
use crate::store_index::BlockIndexEntry;

/// Magic bytes at the start of a serialized stored block.
pub const STORED_BLOCK_MAGIC: u32 = 0x5CB9_B10C;
/// Stored block format version.
pub const STORED_BLOCK_VERSION: u32 = 1;
/// Fixed header size up to (not including) the chunk hash array.
const STORED_BLOCK_HEADER_SIZE: usize = 32;

/// One chunk's fingerprint and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub hash: ChunkHash,
    pub size: u32,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(hash: ChunkHash, data: Vec<u8>) -> Self {
        Self {
            hash,
            size: data.len() as u32,
            data,
        }
    }
}

/// An immutable, content-addressed container of one or more chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub block_hash: BlockHash,
    pub hash_identifier: HashIdentifier,
    pub tag: u32,
    pub chunks: Vec<Chunk>,
}

impl StoredBlock {
    /// Assemble a block from chunks, deriving its content address.
    pub fn build(
        hash_identifier: HashIdentifier,
        tag: u32,
        chunks: Vec<Chunk>,
    ) -> Result<StoredBlock> {
        if chunks.is_empty() {
            return Err(LodeError::InvalidFormat(
                "a stored block must contain at least one chunk".into(),
            ));
        }
        for chunk in &chunks {
            if chunk.size as usize != chunk.data.len() {
                return Err(LodeError::InvalidFormat(format!(
                    "chunk {} declares size {} but carries {} bytes",
                    chunk.hash,
                    chunk.size,
                    chunk.data.len()
                )));
            }
        }
        let chunk_hashes: Vec<ChunkHash> = chunks.iter().map(|c| c.hash).collect();
        let chunk_sizes: Vec<u32> = chunks.iter().map(|c| c.size).collect();
        let block_hash = hash::block_hash(hash_identifier, &chunk_hashes, &chunk_sizes);
        Ok(StoredBlock {
            block_hash,
            hash_identifier,
            tag,
            chunks,
        })
    }

    pub fn chunk_hashes(&self) -> Vec<ChunkHash> {
        self.chunks.iter().map(|c| c.hash).collect()
    }

    pub fn chunk_sizes(&self) -> Vec<u32> {
        self.chunks.iter().map(|c| c.size).collect()
    }

    /// Total payload bytes across all chunks.
    pub fn uncompressed_size(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    pub fn index_entry(&self) -> BlockIndexEntry {
        BlockIndexEntry {
            block_hash: self.block_hash,
            tag: self.tag,
            chunk_hashes: self.chunk_hashes(),
            chunk_sizes: self.chunk_sizes(),
        }
    }
}

/// Parsed block header: everything except the chunk payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_hash: BlockHash,
    pub hash_identifier: HashIdentifier,
    pub tag: u32,
    pub compression_id: u32,
    pub chunk_hashes: Vec<ChunkHash>,
    pub chunk_sizes: Vec<u32>,
}

impl BlockHeader {
    pub fn index_entry(&self) -> BlockIndexEntry {
        BlockIndexEntry {
            block_hash: self.block_hash,
            tag: self.tag,
            chunk_hashes: self.chunk_hashes.clone(),
            chunk_sizes: self.chunk_sizes.clone(),
        }
    }
}

/// Storage key for a block: `chunks/<h4>/0x<h16>.lsb`.
pub fn block_path(block_hash: BlockHash) -> String {
    format!(
        "chunks/{}/0x{}.lsb",
        block_hash.shard_prefix(),
        block_hash.to_hex()
    )
}

/// Recover the block hash encoded in a block's storage key.
///
/// Returns `None` for keys that do not name a block object.
pub fn block_hash_from_key(key: &str) -> Option<BlockHash> {
    let name = key.rsplit('/').next()?;
    let hex = name.strip_prefix("0x")?.strip_suffix(".lsb")?;
    BlockHash::from_hex(hex)
}

/// Serialize a block: header followed by the compressed chunk concatenation.
pub fn encode(block: &StoredBlock, compression: Compression) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(block.uncompressed_size());
    for chunk in &block.chunks {
        body.extend_from_slice(&chunk.data);
    }
    let compressed = compress::compress(compression, &body)?;

    let chunk_count = block.chunks.len();
    let mut buf =
        Vec::with_capacity(STORED_BLOCK_HEADER_SIZE + 12 * chunk_count + 8 + compressed.len());
    buf.extend_from_slice(&STORED_BLOCK_MAGIC.to_le_bytes());
    buf.extend_from_slice(&STORED_BLOCK_VERSION.to_le_bytes());
    buf.extend_from_slice(&block.block_hash.0.to_le_bytes());
    buf.extend_from_slice(&block.hash_identifier.0.to_le_bytes());
    buf.extend_from_slice(&block.tag.to_le_bytes());
    buf.extend_from_slice(&compression.compression_id().to_le_bytes());
    buf.extend_from_slice(&(chunk_count as u32).to_le_bytes());
    for chunk in &block.chunks {
        buf.extend_from_slice(&chunk.hash.0.to_le_bytes());
    }
    for chunk in &block.chunks {
        buf.extend_from_slice(&chunk.size.to_le_bytes());
    }
    buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&compressed);
    Ok(buf)
}

/// Parse a block header and locate the body, without decompressing.
fn parse_header(data: &[u8]) -> Result<(BlockHeader, u32, &[u8])> {
    let mut pos = 0usize;

    let magic = read_u32(data, &mut pos)?;
    if magic != STORED_BLOCK_MAGIC {
        return Err(LodeError::InvalidFormat(format!(
            "bad block magic {magic:#010x}, expected {STORED_BLOCK_MAGIC:#010x}"
        )));
    }
    let version = read_u32(data, &mut pos)?;
    if version != STORED_BLOCK_VERSION {
        return Err(LodeError::InvalidFormat(format!(
            "unknown block version {version}"
        )));
    }
    let block_hash = BlockHash(read_u64(data, &mut pos)?);
    let hash_identifier = HashIdentifier(read_u32(data, &mut pos)?);
    let tag = read_u32(data, &mut pos)?;
    let compression_id = read_u32(data, &mut pos)?;
    let chunk_count = read_u32(data, &mut pos)? as usize;

    if chunk_count == 0 {
        return Err(LodeError::InvalidFormat("block declares zero chunks".into()));
    }

    let mut chunk_hashes = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        chunk_hashes.push(ChunkHash(read_u64(data, &mut pos)?));
    }
    let mut chunk_sizes = Vec::with_capacity(chunk_count);
    for _ in 0..chunk_count {
        chunk_sizes.push(read_u32(data, &mut pos)?);
    }

    let compressed_body_size = read_u32(data, &mut pos)?;
    let uncompressed_body_size = read_u32(data, &mut pos)?;

    let declared_total: u64 = chunk_sizes.iter().map(|&s| u64::from(s)).sum();
    if declared_total != u64::from(uncompressed_body_size) {
        return Err(LodeError::InvalidFormat(format!(
            "chunk sizes sum to {declared_total} but body declares {uncompressed_body_size}"
        )));
    }

    let body_end = pos
        .checked_add(compressed_body_size as usize)
        .ok_or_else(|| LodeError::InvalidFormat("block body length overflow".into()))?;
    if body_end != data.len() {
        return Err(LodeError::InvalidFormat(format!(
            "block length {} does not match declared content ({body_end})",
            data.len()
        )));
    }

    Ok((
        BlockHeader {
            block_hash,
            hash_identifier,
            tag,
            compression_id,
            chunk_hashes,
            chunk_sizes,
        },
        uncompressed_body_size,
        &data[pos..body_end],
    ))
}

/// Header-only decode, used by recovery scans to rebuild a store index
/// without touching chunk payloads.
pub fn decode_header(data: &[u8]) -> Result<BlockHeader> {
    let (header, _, _) = parse_header(data)?;
    Ok(header)
}

/// Decode a serialized block, verifying its content address.
pub fn decode(data: &[u8], registry: &CompressionRegistry) -> Result<StoredBlock> {
    let (header, uncompressed_body_size, body) = parse_header(data)?;

    let payload = registry.decompress(
        header.compression_id,
        body,
        uncompressed_body_size as usize,
    )?;
    if payload.len() != uncompressed_body_size as usize {
        return Err(LodeError::BadBlock(header.block_hash));
    }

    let expected =
        hash::block_hash(header.hash_identifier, &header.chunk_hashes, &header.chunk_sizes);
    if expected != header.block_hash {
        return Err(LodeError::BadBlock(header.block_hash));
    }

    let mut chunks = Vec::with_capacity(header.chunk_hashes.len());
    let mut offset = 0usize;
    for (&chunk_hash, &size) in header.chunk_hashes.iter().zip(header.chunk_sizes.iter()) {
        let end = offset + size as usize;
        chunks.push(Chunk {
            hash: chunk_hash,
            size,
            data: payload[offset..end].to_vec(),
        });
        offset = end;
    }

    Ok(StoredBlock {
        block_hash: header.block_hash,
        hash_identifier: header.hash_identifier,
        tag: header.tag,
        chunks,
    })
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let end = pos
        .checked_add(4)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| LodeError::InvalidFormat("truncated block".into()))?;
    let value = u32::from_le_bytes(
        data[*pos..end]
            .try_into()
            .map_err(|_| LodeError::InvalidFormat("truncated block".into()))?,
    );
    *pos = end;
    Ok(value)
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64> {
    let end = pos
        .checked_add(8)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| LodeError::InvalidFormat("truncated block".into()))?;
    let value = u64::from_le_bytes(
        data[*pos..end]
            .try_into()
            .map_err(|_| LodeError::InvalidFormat("truncated block".into()))?,
    );
    *pos = end;
    Ok(value)
}
