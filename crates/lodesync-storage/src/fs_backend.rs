use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use lodesync_types::{LodeError, Result};

use crate::{BlobBackend, BlobProperties, VersionToken, WriteOutcome};

/// Sidecar suffix for the per-object mutex guarding conditional writes.
const LOCK_SUFFIX: &str = ".lck";

/// A sidecar lock older than this is considered abandoned and swept.
const LOCK_STALE_SECS: i64 = 60;

/// How long a conditional write waits for a contended sidecar lock.
const LOCK_WAIT_ATTEMPTS: u32 = 100;
const LOCK_WAIT_STEP: Duration = Duration::from_millis(20);

/// Owner metadata written into the sidecar lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

/// Blob backend for a local filesystem directory, with version-conditioned
/// writes built on sidecar lock files and content fingerprints.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Create a backend rooted at the given directory path.
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        // Canonicalize if the path already exists for clearer errors and
        // correct behavior with symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self { root })
    }

    /// Reject storage keys that could escape the store root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(LodeError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(LodeError::InvalidFormat(format!(
                "unsafe storage key: absolute path '{key}'"
            )));
        }
        if key.contains('\\') {
            return Err(LodeError::InvalidFormat(format!(
                "unsafe storage key: contains backslash '{key}'"
            )));
        }
        let path = Path::new(key);
        for component in path.components() {
            if component == Component::ParentDir {
                return Err(LodeError::InvalidFormat(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a `/`-separated storage key to a filesystem path under the root.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Recursively list all files under `dir`, adding their paths relative
    /// to `self.root` as `/`-separated keys.
    fn list_recursive(&self, dir: &Path, out: &mut Vec<BlobProperties>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), out)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.ends_with(LOCK_SUFFIX) {
                        continue;
                    }
                    out.push(BlobProperties {
                        key,
                        size: entry.metadata()?.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fingerprint the current on-disk version of an object.
    fn fingerprint(&self, key: &str) -> Result<VersionToken> {
        match self.read(key)? {
            Some(data) => Ok(VersionToken::new(xxh3_64(&data), true)),
            None => Ok(VersionToken::absent()),
        }
    }

    /// Acquire the sidecar lock for `key`, sweeping abandoned locks.
    fn acquire_sidecar(&self, key: &str) -> Result<SidecarGuard> {
        let lock_path = self.resolve(&format!("{key}{LOCK_SUFFIX}"))?;
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entry = LockEntry {
            hostname: hostname(),
            pid: std::process::id(),
            time: Utc::now().to_rfc3339(),
        };
        let data = serde_json::to_vec(&entry)
            .map_err(|e| LodeError::Other(format!("lock serialize: {e}")))?;

        for _ in 0..LOCK_WAIT_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    file.write_all(&data)?;
                    return Ok(SidecarGuard { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.sweep_stale_lock(&lock_path);
                    std::thread::sleep(LOCK_WAIT_STEP);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LodeError::Locked(lock_path.display().to_string()))
    }

    /// Remove a sidecar lock left behind by a dead writer.
    fn sweep_stale_lock(&self, lock_path: &Path) {
        let Ok(data) = fs::read(lock_path) else {
            return;
        };
        let Ok(entry) = serde_json::from_slice::<LockEntry>(&data) else {
            // Unreadable lock contents: age out by mtime instead.
            if let Ok(meta) = fs::metadata(lock_path) {
                if let Ok(modified) = meta.modified() {
                    if modified.elapsed().map(|d| d.as_secs()).unwrap_or(0)
                        > LOCK_STALE_SECS as u64
                    {
                        warn!("removing unreadable stale lock {}", lock_path.display());
                        let _ = fs::remove_file(lock_path);
                    }
                }
            }
            return;
        };
        let Ok(acquired) = chrono::DateTime::parse_from_rfc3339(&entry.time) else {
            return;
        };
        let age = Utc::now().signed_duration_since(acquired.with_timezone(&Utc));
        if age.num_seconds() > LOCK_STALE_SECS {
            warn!(
                "removing stale lock {} held by {}:{}",
                lock_path.display(),
                entry.hostname,
                entry.pid
            );
            let _ = fs::remove_file(lock_path);
        }
    }
}

/// Removes the sidecar lock file on drop.
struct SidecarGuard {
    path: PathBuf,
}

impl Drop for SidecarGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

impl BlobBackend for FsBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobProperties>> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let mut out = Vec::new();
                self.list_recursive(&dir, &mut out)?;
                Ok(out)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn supports_locking(&self) -> bool {
        true
    }

    fn lock_write_version(&self, key: &str) -> Result<VersionToken> {
        self.fingerprint(key)
    }

    fn write_if_unchanged(
        &self,
        key: &str,
        data: &[u8],
        token: &VersionToken,
    ) -> Result<WriteOutcome> {
        let _guard = self.acquire_sidecar(key)?;
        let current = self.fingerprint(key)?;
        if current != *token {
            return Ok(WriteOutcome::Conflict);
        }
        self.write(key, data)?;
        Ok(WriteOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, FsBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_str().unwrap()).unwrap();
        (dir, backend)
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(FsBackend::validate_key("/etc/passwd").is_err());
        assert!(FsBackend::validate_key("../../outside").is_err());
        assert!(FsBackend::validate_key("foo/../../etc/passwd").is_err());
        assert!(FsBackend::validate_key("foo\\bar").is_err());
        assert!(FsBackend::validate_key("").is_err());
    }

    #[test]
    fn validate_key_accepts_safe_keys() {
        assert!(FsBackend::validate_key("store.lsi").is_ok());
        assert!(FsBackend::validate_key("chunks/dead/0xdeadbeef00000000.lsb").is_ok());
    }

    #[test]
    fn read_write_delete_roundtrip() {
        let (_dir, backend) = backend();
        assert_eq!(backend.read("a/b").unwrap(), None);
        backend.write("a/b", b"payload").unwrap();
        assert_eq!(backend.read("a/b").unwrap().as_deref(), Some(&b"payload"[..]));
        assert!(backend.exists("a/b").unwrap());
        backend.delete("a/b").unwrap();
        assert!(!backend.exists("a/b").unwrap());
        // Deleting a missing key is a success.
        backend.delete("a/b").unwrap();
    }

    #[test]
    fn list_reports_sizes_and_skips_locks() {
        let (_dir, backend) = backend();
        backend.write("chunks/aa/one", b"12345").unwrap();
        backend.write("chunks/bb/two", b"123").unwrap();
        backend.write("chunks/bb/two.lck", b"{}").unwrap();

        let mut listed = backend.list("chunks/").unwrap();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(
            listed,
            vec![
                BlobProperties {
                    key: "chunks/aa/one".into(),
                    size: 5
                },
                BlobProperties {
                    key: "chunks/bb/two".into(),
                    size: 3
                },
            ]
        );
    }

    #[test]
    fn list_returns_empty_for_missing_dir() {
        let (_dir, backend) = backend();
        assert!(backend.list("no_such_dir").unwrap().is_empty());
    }

    #[test]
    fn conditional_write_commits_when_unchanged() {
        let (_dir, backend) = backend();
        backend.write("store.lsi", b"v1").unwrap();

        let token = backend.lock_write_version("store.lsi").unwrap();
        assert!(token.exists());
        assert_eq!(
            backend.write_if_unchanged("store.lsi", b"v2", &token).unwrap(),
            WriteOutcome::Committed
        );
        assert_eq!(backend.read("store.lsi").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn conditional_write_conflicts_when_changed() {
        let (_dir, backend) = backend();
        backend.write("store.lsi", b"v1").unwrap();

        let token = backend.lock_write_version("store.lsi").unwrap();
        backend.write("store.lsi", b"interloper").unwrap();
        assert_eq!(
            backend.write_if_unchanged("store.lsi", b"v2", &token).unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(
            backend.read("store.lsi").unwrap().as_deref(),
            Some(&b"interloper"[..])
        );
    }

    #[test]
    fn conditional_write_on_absent_object() {
        let (_dir, backend) = backend();
        let token = backend.lock_write_version("store.lsi").unwrap();
        assert!(!token.exists());
        assert_eq!(
            backend.write_if_unchanged("store.lsi", b"v1", &token).unwrap(),
            WriteOutcome::Committed
        );

        // A second writer holding the same absent token now conflicts.
        assert_eq!(
            backend.write_if_unchanged("store.lsi", b"v1b", &token).unwrap(),
            WriteOutcome::Conflict
        );
    }

    #[test]
    fn sidecar_lock_is_released_after_write() {
        let (_dir, backend) = backend();
        let token = backend.lock_write_version("k").unwrap();
        backend.write_if_unchanged("k", b"x", &token).unwrap();
        assert!(!backend.exists(&format!("k{LOCK_SUFFIX}")).unwrap());
    }
}
