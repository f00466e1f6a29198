use serde::{Deserialize, Serialize};
use std::fmt;

/// A 64-bit content fingerprint of a single chunk, produced by the chunker.
///
/// Opaque to the store: the store never recomputes chunk fingerprints, it
/// only matches them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkHash(pub u64);

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash(0x{:016x})", self.0)
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}
