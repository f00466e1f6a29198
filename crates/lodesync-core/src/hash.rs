use std::collections::HashMap;

use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use lodesync_types::hash_id::{BLAKE3_64, XXH3_64};
use lodesync_types::{BlockHash, ChunkHash, HashIdentifier, LodeError, Result};

/// Derive a block's content address from its ordered chunk lists.
///
/// The digest covers the little-endian serialization of the chunk hashes
/// followed by the chunk sizes, seeded with the store's hash family tag so
/// that stores written with different families never alias. This is the one
/// derivation shared by the packer, the block codec and the recovery scan;
/// two blocks with the same ordered contents always produce the same
/// address, on any platform.
pub fn block_hash(
    hash_identifier: HashIdentifier,
    chunk_hashes: &[ChunkHash],
    chunk_sizes: &[u32],
) -> BlockHash {
    let mut buf = Vec::with_capacity(8 * chunk_hashes.len() + 4 * chunk_sizes.len());
    for h in chunk_hashes {
        buf.extend_from_slice(&h.0.to_le_bytes());
    }
    for s in chunk_sizes {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    BlockHash(xxh3_64_with_seed(&buf, u64::from(hash_identifier.0)))
}

/// A 64-bit content digest function, one per registered hash family.
pub trait ContentHasher: Send + Sync {
    fn digest64(&self, data: &[u8]) -> u64;
}

struct Blake3Hasher;

impl ContentHasher for Blake3Hasher {
    fn digest64(&self, data: &[u8]) -> u64 {
        let digest = blake3::hash(data);
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(first)
    }
}

struct Xxh3Hasher;

impl ContentHasher for Xxh3Hasher {
    fn digest64(&self, data: &[u8]) -> u64 {
        xxh3_64(data)
    }
}

/// Runtime lookup from hash family tag to digest function.
///
/// The store itself never fingerprints chunk payloads (that is the
/// chunker's job), but collaborators and tests resolve hashers here so
/// that adding a family stays a registry insert, not a type change.
pub struct HashRegistry {
    entries: HashMap<HashIdentifier, Box<dyn ContentHasher>>,
}

impl HashRegistry {
    /// Registry with every built-in family registered.
    pub fn full() -> Self {
        let mut registry = Self {
            entries: HashMap::new(),
        };
        registry.register(BLAKE3_64, Box::new(Blake3Hasher));
        registry.register(XXH3_64, Box::new(Xxh3Hasher));
        registry
    }

    pub fn register(&mut self, id: HashIdentifier, hasher: Box<dyn ContentHasher>) {
        self.entries.insert(id, hasher);
    }

    pub fn contains(&self, id: HashIdentifier) -> bool {
        self.entries.contains_key(&id)
    }

    /// Fingerprint a chunk payload with the identified family.
    pub fn chunk_hash(&self, id: HashIdentifier, data: &[u8]) -> Result<ChunkHash> {
        let hasher = self.entries.get(&id).ok_or(LodeError::UnknownHash(id))?;
        Ok(ChunkHash(hasher.digest64(data)))
    }
}

impl Default for HashRegistry {
    fn default() -> Self {
        Self::full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_hash_is_deterministic() {
        let id = HashIdentifier(0xb1a3e001);
        let hashes = [ChunkHash(101), ChunkHash(102), ChunkHash(103)];
        let sizes = [10, 20, 30];
        let a = block_hash(id, &hashes, &sizes);
        let b = block_hash(id, &hashes, &sizes);
        assert_eq!(a, b);
    }

    #[test]
    fn block_hash_depends_on_order() {
        let id = HashIdentifier(1);
        let a = block_hash(id, &[ChunkHash(1), ChunkHash(2)], &[10, 20]);
        let b = block_hash(id, &[ChunkHash(2), ChunkHash(1)], &[20, 10]);
        assert_ne!(a, b);
    }

    #[test]
    fn block_hash_depends_on_sizes() {
        let id = HashIdentifier(1);
        let a = block_hash(id, &[ChunkHash(1)], &[10]);
        let b = block_hash(id, &[ChunkHash(1)], &[11]);
        assert_ne!(a, b);
    }

    #[test]
    fn block_hash_depends_on_family() {
        let hashes = [ChunkHash(1)];
        let sizes = [10];
        let a = block_hash(BLAKE3_64, &hashes, &sizes);
        let b = block_hash(XXH3_64, &hashes, &sizes);
        assert_ne!(a, b);
    }

    #[test]
    fn block_hash_across_threads() {
        let id = HashIdentifier(7);
        let hashes: Vec<ChunkHash> = (0..64).map(ChunkHash).collect();
        let sizes: Vec<u32> = (1..=64).collect();
        let expected = block_hash(id, &hashes, &sizes);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let hashes = hashes.clone();
                let sizes = sizes.clone();
                std::thread::spawn(move || block_hash(id, &hashes, &sizes))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }

    #[test]
    fn registry_resolves_builtin_families() {
        let registry = HashRegistry::full();
        let a = registry.chunk_hash(BLAKE3_64, b"payload").unwrap();
        let b = registry.chunk_hash(XXH3_64, b"payload").unwrap();
        assert_ne!(a, b);
        // Same family, same payload: stable.
        assert_eq!(registry.chunk_hash(BLAKE3_64, b"payload").unwrap(), a);
    }

    #[test]
    fn registry_rejects_unknown_family() {
        let registry = HashRegistry::full();
        let err = registry
            .chunk_hash(HashIdentifier(0xdead), b"payload")
            .unwrap_err();
        assert!(matches!(err, LodeError::UnknownHash(_)));
    }

    #[test]
    fn registry_insert_adds_family() {
        struct FixedHasher;
        impl ContentHasher for FixedHasher {
            fn digest64(&self, _data: &[u8]) -> u64 {
                42
            }
        }

        let mut registry = HashRegistry::full();
        let id = HashIdentifier(0x0fa57);
        assert!(!registry.contains(id));
        registry.register(id, Box::new(FixedHasher));
        assert_eq!(registry.chunk_hash(id, b"anything").unwrap(), ChunkHash(42));
    }
}
