use serde::{Deserialize, Serialize};
use std::fmt;

/// A 64-bit content address for a stored block, derived from the block's
/// ordered chunk hashes and sizes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub u64);

impl BlockHash {
    /// Lowercase hex, zero-padded to 16 digits, for use in storage keys.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// First four hex digits, used for the shard directory.
    pub fn shard_prefix(&self) -> String {
        format!("{:04x}", self.0 >> 48)
    }

    /// Parse the 16-digit lowercase hex produced by [`to_hex`].
    ///
    /// [`to_hex`]: BlockHash::to_hex
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(BlockHash)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash(0x{})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_hex_is_padded() {
        assert_eq!(BlockHash(0x1a2b).to_hex(), "0000000000001a2b");
        assert_eq!(BlockHash(u64::MAX).to_hex(), "ffffffffffffffff");
    }

    #[test]
    fn shard_prefix_is_leading_digits() {
        assert_eq!(BlockHash(0xdeadbeef500177aa).shard_prefix(), "dead");
        assert_eq!(BlockHash(7).shard_prefix(), "0000");
    }

    #[test]
    fn from_hex_roundtrip() {
        let h = BlockHash(0xdeadbeef500177aa);
        assert_eq!(BlockHash::from_hex(&h.to_hex()), Some(h));
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert_eq!(BlockHash::from_hex("shorty"), None);
        assert_eq!(BlockHash::from_hex("000000000000XYZW"), None);
        // Uppercase is not a storage-key form.
        assert_eq!(BlockHash::from_hex("DEADBEEF500177AA"), None);
    }
}
