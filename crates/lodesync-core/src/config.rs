use serde::{Deserialize, Serialize};

use crate::compress::Compression;

/// Typical block target: 8 MiB of chunk payload per block.
pub fn default_target_block_size() -> u32 {
    8 * 1024 * 1024
}

pub fn default_max_chunks_per_block() -> u32 {
    1024
}

pub fn default_min_block_usage_percent() -> u32 {
    0
}

/// One worker per core, capped so a big machine doesn't hammer the backend.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(32)
}

/// Tuning knobs for a remote block store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_target_block_size")]
    pub target_block_size: u32,
    #[serde(default = "default_max_chunks_per_block")]
    pub max_chunks_per_block: u32,
    /// Read-side utilization threshold in percent, 0..=100.
    #[serde(default = "default_min_block_usage_percent")]
    pub min_block_usage_percent: u32,
    #[serde(default)]
    pub compression: Compression,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            target_block_size: default_target_block_size(),
            max_chunks_per_block: default_max_chunks_per_block(),
            min_block_usage_percent: default_min_block_usage_percent(),
            compression: Compression::default(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> lodesync_types::Result<()> {
        if self.workers == 0 {
            return Err(lodesync_types::LodeError::Config(
                "workers must be positive".into(),
            ));
        }
        if self.target_block_size == 0 {
            return Err(lodesync_types::LodeError::Config(
                "target_block_size must be positive".into(),
            ));
        }
        if self.max_chunks_per_block == 0 {
            return Err(lodesync_types::LodeError::Config(
                "max_chunks_per_block must be positive".into(),
            ));
        }
        if self.min_block_usage_percent > 100 {
            return Err(lodesync_types::LodeError::Config(format!(
                "min_block_usage_percent must be within 0..=100, got {}",
                self.min_block_usage_percent
            )));
        }
        Ok(())
    }
}
