use std::sync::Arc;

use lodesync_storage::{BlobBackend, MemoryBackend};
use lodesync_types::{ChunkHash, HashIdentifier};

use crate::block::{Chunk, StoredBlock};

/// Hash family tag used throughout the unit tests.
pub const TEST_HASH_IDENTIFIER: HashIdentifier = HashIdentifier(0xb1a3e001);

/// Deterministic three-chunk block: chunk hashes `seed+1..=seed+3`, sizes
/// 10/20/30, payload bytes equal to the chunk ordinal.
pub fn block_from_seed(seed: u64) -> StoredBlock {
    let chunks: Vec<Chunk> = (0u64..3)
        .map(|i| {
            Chunk::new(
                ChunkHash(seed + i + 1),
                vec![(i + 1) as u8; ((i as usize) + 1) * 10],
            )
        })
        .collect();
    StoredBlock::build(TEST_HASH_IDENTIFIER, 0, chunks).expect("seeded block is well-formed")
}

/// A memory backend plus a second handle to the same objects, so tests can
/// inspect or damage storage behind the store's back.
pub fn shared_memory_backend() -> (Box<dyn BlobBackend>, Arc<dyn BlobBackend>) {
    let shared: Arc<dyn BlobBackend> = Arc::new(MemoryBackend::new());
    (Box::new(shared.clone()), shared)
}
