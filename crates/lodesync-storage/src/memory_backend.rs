use std::collections::HashMap;
use std::sync::Mutex;

use lodesync_types::Result;

use crate::{BlobBackend, BlobProperties, VersionToken, WriteOutcome};

/// One stored object plus its write generation.
#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    generation: u64,
}

/// In-memory blob backend for tests. Thread-safe via Mutex.
///
/// Tracks a per-key write generation so the version-locking contract can be
/// exercised without touching a real backend. Construct with
/// [`without_locking`] to simulate backends (like S3) that cannot do
/// conditional writes, which drives the store down its last-writer-wins
/// flush path.
///
/// [`without_locking`]: MemoryBackend::without_locking
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, Entry>>,
    locking: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            locking: true,
        }
    }

    /// A backend that reports `supports_locking() == false`.
    pub fn without_locking() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            locking: false,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.objects.lock().unwrap();
        Ok(map.get(key).map(|e| e.data.clone()))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut map = self.objects.lock().unwrap();
        let next_gen = map.get(key).map(|e| e.generation + 1).unwrap_or(1);
        map.insert(
            key.to_string(),
            Entry {
                data: data.to_vec(),
                generation: next_gen,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.objects.lock().unwrap();
        map.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let map = self.objects.lock().unwrap();
        Ok(map.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobProperties>> {
        let map = self.objects.lock().unwrap();
        let mut out: Vec<BlobProperties> = map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| BlobProperties {
                key: k.clone(),
                size: e.data.len() as u64,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn supports_locking(&self) -> bool {
        self.locking
    }

    fn lock_write_version(&self, key: &str) -> Result<VersionToken> {
        if !self.locking {
            return Err(lodesync_types::LodeError::UnsupportedBackend(
                "version-conditioned writes".into(),
            ));
        }
        let map = self.objects.lock().unwrap();
        Ok(match map.get(key) {
            Some(entry) => VersionToken::new(entry.generation, true),
            None => VersionToken::absent(),
        })
    }

    fn write_if_unchanged(
        &self,
        key: &str,
        data: &[u8],
        token: &VersionToken,
    ) -> Result<WriteOutcome> {
        if !self.locking {
            return Err(lodesync_types::LodeError::UnsupportedBackend(
                "version-conditioned writes".into(),
            ));
        }
        let mut map = self.objects.lock().unwrap();
        let current = match map.get(key) {
            Some(entry) => VersionToken::new(entry.generation, true),
            None => VersionToken::absent(),
        };
        if current != *token {
            return Ok(WriteOutcome::Conflict);
        }
        let next_gen = token.version() + 1;
        map.insert(
            key.to_string(),
            Entry {
                data: data.to_vec(),
                generation: next_gen,
            },
        );
        Ok(WriteOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_list() {
        let backend = MemoryBackend::new();
        backend.write("a/x", b"1").unwrap();
        backend.write("a/y", b"22").unwrap();
        backend.write("b/z", b"333").unwrap();

        let listed = backend.list("a/").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, "a/x");
        assert_eq!(listed[1].size, 2);

        backend.delete("a/x").unwrap();
        assert!(!backend.exists("a/x").unwrap());
    }

    #[test]
    fn conditional_write_follows_generations() {
        let backend = MemoryBackend::new();
        let token = backend.lock_write_version("k").unwrap();
        assert!(!token.exists());
        assert_eq!(
            backend.write_if_unchanged("k", b"v1", &token).unwrap(),
            WriteOutcome::Committed
        );

        let stale = token;
        assert_eq!(
            backend.write_if_unchanged("k", b"v2", &stale).unwrap(),
            WriteOutcome::Conflict
        );

        let fresh = backend.lock_write_version("k").unwrap();
        assert_eq!(
            backend.write_if_unchanged("k", b"v2", &fresh).unwrap(),
            WriteOutcome::Committed
        );
        assert_eq!(backend.read("k").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn without_locking_refuses_conditional_ops() {
        let backend = MemoryBackend::without_locking();
        assert!(!backend.supports_locking());
        assert!(backend.lock_write_version("k").is_err());
    }

    #[test]
    fn unconditional_write_bumps_generation() {
        let backend = MemoryBackend::new();
        let t0 = backend.lock_write_version("k").unwrap();
        backend.write("k", b"v1").unwrap();
        // A token locked before the write must now conflict.
        assert_eq!(
            backend.write_if_unchanged("k", b"v2", &t0).unwrap(),
            WriteOutcome::Conflict
        );
    }
}
