use thiserror::Error;

use crate::block_hash::BlockHash;
use crate::hash_id::HashIdentifier;

pub type Result<T> = std::result::Result<T, LodeError>;

#[derive(Debug, Error)]
pub enum LodeError {
    #[error("block {0} is not present in the store")]
    BlockMissing(BlockHash),

    #[error("block {0} failed content verification")]
    BadBlock(BlockHash),

    #[error("unknown compression id: {0:#010x}")]
    UnknownCodec(u32),

    #[error("unknown hash identifier: {0}")]
    UnknownHash(HashIdentifier),

    #[error("store index is corrupt: {0}")]
    IndexCorrupt(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store index write lost {0} consecutive version races")]
    FlushContention(u32),

    #[error("store is not initialized (store index missing)")]
    StoreUninitialized,

    #[error("operation not permitted: {0}")]
    PermissionDenied(String),

    #[error("store is locked by another writer: {0}")]
    Locked(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl LodeError {
    /// Whether the error is worth retrying at the store layer.
    ///
    /// Permanent errors (missing or corrupt data, permission problems,
    /// configuration mistakes) propagate immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            LodeError::Transport(_) => true,
            LodeError::Io(e) => is_retryable_io(e),
            _ => false,
        }
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_transient() {
        assert!(LodeError::Transport("connection reset".into()).is_transient());
    }

    #[test]
    fn permanent_errors_are_not_transient() {
        assert!(!LodeError::BlockMissing(BlockHash(1)).is_transient());
        assert!(!LodeError::IndexCorrupt("bad magic".into()).is_transient());
        assert!(!LodeError::PermissionDenied("read-only store".into()).is_transient());
    }

    #[test]
    fn io_kind_classification() {
        let retryable = std::io::Error::new(std::io::ErrorKind::TimedOut, "t");
        assert!(LodeError::Io(retryable).is_transient());

        let permanent = std::io::Error::new(std::io::ErrorKind::NotFound, "n");
        assert!(!LodeError::Io(permanent).is_transient());
    }
}
