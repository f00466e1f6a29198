use std::collections::HashMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use lodesync_types::{LodeError, Result};

/// Codec id for uncompressed bodies.
pub const COMPRESSION_NONE: u32 = 0;
/// Codec id for LZ4 (size-prefixed block format).
pub const COMPRESSION_LZ4: u32 = 1;
/// Codec id for zstd.
pub const COMPRESSION_ZSTD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    /// Parse from a config string like "lz4", "zstd", "none".
    pub fn from_config(algorithm: &str, zstd_level: i32) -> Result<Self> {
        match algorithm {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd { level: zstd_level }),
            other => Err(LodeError::Config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    /// The numeric codec id persisted in block headers.
    pub fn compression_id(&self) -> u32 {
        match self {
            Compression::None => COMPRESSION_NONE,
            Compression::Lz4 => COMPRESSION_LZ4,
            Compression::Zstd { .. } => COMPRESSION_ZSTD,
        }
    }
}

/// Compress a block body with the selected codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Zstd { level } => {
            use std::cell::RefCell;
            thread_local! {
                static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
                    const { RefCell::new(None) };
            }

            ZSTD_CX.with(|cell| {
                let mut slot = cell.borrow_mut();

                // Lazily init or reinit if the compression level changed.
                if !matches!(slot.as_ref(), Some((l, _)) if *l == level) {
                    let cx = zstd::bulk::Compressor::new(level)
                        .map_err(|e| LodeError::Other(format!("zstd init: {e}")))?;
                    *slot = Some((level, cx));
                }
                let (_, cx) = slot.as_mut().ok_or_else(|| {
                    LodeError::Other("zstd compressor slot unexpectedly empty".into())
                })?;

                cx.compress(data)
                    .map_err(|e| LodeError::Other(format!("zstd compress: {e}")))
            })
        }
    }
}

/// Decompress a block body.
///
/// `expected_size` is the uncompressed body size declared by the block
/// header; it bounds output growth so a garbled or hostile body cannot
/// consume unbounded memory. Callers still verify the exact length.
fn decompress(compression: Compression, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => {
            if data.len() < 4 {
                return Err(LodeError::InvalidFormat("lz4: payload too short".into()));
            }
            let declared = u32::from_le_bytes(
                data[..4]
                    .try_into()
                    .map_err(|_| LodeError::InvalidFormat("lz4: bad size prefix".into()))?,
            ) as usize;
            if declared > expected_size {
                return Err(LodeError::InvalidFormat(format!(
                    "lz4: declared size {declared} exceeds expected body size {expected_size}"
                )));
            }
            lz4_flex::decompress_size_prepended(data)
                .map_err(|e| LodeError::InvalidFormat(format!("lz4: {e}")))
        }
        Compression::Zstd { .. } => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(data))
                .map_err(|e| LodeError::InvalidFormat(format!("zstd init: {e}")))?;
            let mut output = Vec::with_capacity(expected_size);
            decoder
                .by_ref()
                .take(expected_size as u64 + 1)
                .read_to_end(&mut output)
                .map_err(|e| LodeError::InvalidFormat(format!("zstd: {e}")))?;
            if output.len() > expected_size {
                return Err(LodeError::InvalidFormat(format!(
                    "zstd: decompressed size exceeds expected body size {expected_size}"
                )));
            }
            Ok(output)
        }
    }
}

/// Runtime lookup from persisted codec id to codec.
///
/// Decode-side counterpart of [`Compression::compression_id`]; an id with
/// no registered codec surfaces as `UnknownCodec`.
pub struct CompressionRegistry {
    entries: HashMap<u32, Compression>,
}

impl CompressionRegistry {
    /// Registry with every built-in codec registered.
    pub fn full() -> Self {
        let mut registry = Self {
            entries: HashMap::new(),
        };
        registry.register(Compression::None);
        registry.register(Compression::Lz4);
        registry.register(Compression::Zstd { level: 0 });
        registry
    }

    pub fn register(&mut self, compression: Compression) {
        self.entries.insert(compression.compression_id(), compression);
    }

    pub fn get(&self, id: u32) -> Option<Compression> {
        self.entries.get(&id).copied()
    }

    /// Decompress a block body by codec id.
    pub fn decompress(&self, id: u32, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let compression = self.get(id).ok_or(LodeError::UnknownCodec(id))?;
        decompress(compression, data, expected_size)
    }
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self::full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(compression: Compression, payload: &[u8]) {
        let registry = CompressionRegistry::full();
        let encoded = compress(compression, payload).unwrap();
        let decoded = registry
            .decompress(compression.compression_id(), &encoded, payload.len())
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn roundtrip_all_codecs() {
        let payloads: &[&[u8]] = &[b"", b"short", b"this payload is long enough to compress"];
        for codec in [
            Compression::None,
            Compression::Lz4,
            Compression::Zstd { level: 3 },
        ] {
            for payload in payloads {
                roundtrip(codec, payload);
            }
        }
    }

    #[test]
    fn unknown_codec_id_rejected() {
        let registry = CompressionRegistry::full();
        let err = registry.decompress(0x77, b"data", 4).unwrap_err();
        assert!(matches!(err, LodeError::UnknownCodec(0x77)));
    }

    #[test]
    fn lz4_bomb_rejected() {
        // Huge size prefix, tiny compressed data.
        let mut bomb = (1u32 << 30).to_le_bytes().to_vec();
        bomb.extend_from_slice(&[0u8; 10]);
        let registry = CompressionRegistry::full();
        assert!(registry.decompress(COMPRESSION_LZ4, &bomb, 64).is_err());
    }

    #[test]
    fn lz4_short_payload_rejected() {
        let registry = CompressionRegistry::full();
        assert!(registry.decompress(COMPRESSION_LZ4, &[0x00, 0x00], 64).is_err());
    }

    #[test]
    fn zstd_oversized_output_rejected() {
        let payload = vec![0xAB; 1024];
        let encoded = compress(Compression::Zstd { level: 3 }, &payload).unwrap();
        let registry = CompressionRegistry::full();
        // Expected size smaller than the real output: must be rejected, not
        // silently truncated.
        assert!(registry.decompress(COMPRESSION_ZSTD, &encoded, 100).is_err());
    }

    #[test]
    fn compression_ids_are_stable() {
        assert_eq!(Compression::None.compression_id(), 0);
        assert_eq!(Compression::Lz4.compression_id(), 1);
        assert_eq!(Compression::Zstd { level: 9 }.compression_id(), 2);
    }

    #[test]
    fn from_config_parses_known_names() {
        assert_eq!(Compression::from_config("lz4", 3).unwrap(), Compression::Lz4);
        assert_eq!(
            Compression::from_config("zstd", 7).unwrap(),
            Compression::Zstd { level: 7 }
        );
        assert!(Compression::from_config("brotli", 3).is_err());
    }
}
