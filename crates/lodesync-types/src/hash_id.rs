use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag identifying the hash function family a store was written with.
///
/// Persisted in every stored block and in the store index header. The tag
/// is data, not a type: adding a family is a registry insert at runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashIdentifier(pub u32);

/// BLAKE3 truncated to 64 bits.
pub const BLAKE3_64: HashIdentifier = HashIdentifier(u32::from_be_bytes(*b"blk3"));

/// XXH3, native 64-bit output.
pub const XXH3_64: HashIdentifier = HashIdentifier(u32::from_be_bytes(*b"xxh3"));

impl HashIdentifier {
    /// Render four-byte ASCII tags as text, anything else as hex.
    pub fn as_label(&self) -> String {
        let bytes = self.0.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            format!("{:#010x}", self.0)
        }
    }
}

impl fmt::Debug for HashIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashIdentifier({})", self.as_label())
    }
}

impl fmt::Display for HashIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_render_as_text() {
        assert_eq!(BLAKE3_64.as_label(), "blk3");
        assert_eq!(XXH3_64.as_label(), "xxh3");
    }

    #[test]
    fn opaque_tags_render_as_hex() {
        assert_eq!(HashIdentifier(0xb1a3e001).as_label(), "0xb1a3e001");
    }
}
