pub mod fs_backend;
pub mod gcs_backend;
pub mod memory_backend;
pub mod retry;
pub mod s3_backend;

use std::sync::Arc;

use url::Url;

use lodesync_types::{LodeError, Result};

pub use fs_backend::FsBackend;
pub use gcs_backend::GcsBackend;
pub use memory_backend::MemoryBackend;
pub use s3_backend::S3Backend;

/// Name and size of one stored object, as returned by [`BlobBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub key: String,
    pub size: u64,
}

/// Outcome of a version-conditioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The object was written; the locked version was still current.
    Committed,
    /// The object changed after the version was locked; nothing was written.
    Conflict,
}

/// Opaque snapshot of an object's version, taken by
/// [`BlobBackend::lock_write_version`].
///
/// `version` is backend-defined: a content fingerprint for the filesystem
/// backend, an object generation for GCS, a bump counter for the in-memory
/// backend. A token for an absent object has `exists == false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionToken {
    version: u64,
    exists: bool,
}

impl VersionToken {
    pub fn new(version: u64, exists: bool) -> Self {
        Self { version, exists }
    }

    pub fn absent() -> Self {
        Self {
            version: 0,
            exists: false,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn exists(&self) -> bool {
        self.exists
    }
}

/// Abstract object storage for one store prefix.
/// Keys are `/`-separated string paths (e.g. "chunks/dead/0xdeadbeef....lsb").
///
/// All methods must be safe under concurrent calls from multiple threads.
pub trait BlobBackend: Send + Sync {
    /// Read an object by key. Returns `None` if not found.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object. Overwrites unconditionally.
    fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Delete an object. Deleting a missing key is a success.
    fn delete(&self, key: &str) -> Result<()>;

    /// Check whether an object exists.
    fn exists(&self, key: &str) -> Result<bool>;

    /// List all objects under a prefix. Returns full key paths with sizes.
    fn list(&self, prefix: &str) -> Result<Vec<BlobProperties>>;

    /// Whether this backend can perform version-conditioned writes.
    ///
    /// When `false`, [`lock_write_version`] and [`write_if_unchanged`]
    /// return `UnsupportedBackend` and callers must fall back to
    /// unconditional last-writer-wins writes.
    ///
    /// [`lock_write_version`]: BlobBackend::lock_write_version
    /// [`write_if_unchanged`]: BlobBackend::write_if_unchanged
    fn supports_locking(&self) -> bool {
        false
    }

    /// Snapshot the current version of an object (including "absent") for a
    /// later conditional write.
    fn lock_write_version(&self, _key: &str) -> Result<VersionToken> {
        Err(LodeError::UnsupportedBackend(
            "version-conditioned writes".into(),
        ))
    }

    /// Write `data` only if the object still matches `token`.
    fn write_if_unchanged(
        &self,
        _key: &str,
        _data: &[u8],
        _token: &VersionToken,
    ) -> Result<WriteOutcome> {
        Err(LodeError::UnsupportedBackend(
            "version-conditioned writes".into(),
        ))
    }
}

impl BlobBackend for Arc<dyn BlobBackend> {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).read(key)
    }
    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        (**self).write(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }
    fn list(&self, prefix: &str) -> Result<Vec<BlobProperties>> {
        (**self).list(prefix)
    }
    fn supports_locking(&self) -> bool {
        (**self).supports_locking()
    }
    fn lock_write_version(&self, key: &str) -> Result<VersionToken> {
        (**self).lock_write_version(key)
    }
    fn write_if_unchanged(
        &self,
        key: &str,
        data: &[u8],
        token: &VersionToken,
    ) -> Result<WriteOutcome> {
        (**self).write_if_unchanged(key, data, token)
    }
}

/// Parsed store URL.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedUrl {
    /// Local filesystem directory.
    Fs { path: String },
    /// S3 bucket and key prefix.
    S3 { bucket: String, root: String },
    /// GCS bucket and key prefix.
    Gcs { bucket: String, root: String },
}

/// Credentials and endpoint overrides consumed by [`backend_from_url`].
///
/// Credential *discovery* is the caller's concern; this struct only carries
/// what was already discovered.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub gcs_bearer_token: Option<String>,
    pub retry: retry::RetryConfig,
}

/// Parse a store URL into its components.
///
/// Supported formats:
/// - Bare path (`/stores/game`, `./rel`, `rel`) -> `Fs`
/// - `fsblob:///stores/game` or `file:///stores/game` -> `Fs`
/// - `s3://bucket/prefix` -> `S3`
/// - `gs://bucket/prefix` -> `Gcs`
pub fn parse_store_url(raw: &str) -> Result<ParsedUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LodeError::Config("store URL must not be empty".into()));
    }

    // Anything without a scheme is a local path.
    if !trimmed.contains("://") {
        return Ok(ParsedUrl::Fs {
            path: trimmed.to_string(),
        });
    }

    let url = Url::parse(trimmed)
        .map_err(|e| LodeError::Config(format!("invalid store URL '{trimmed}': {e}")))?;

    match url.scheme() {
        "file" | "fsblob" => {
            let path = url.path().to_string();
            if path.is_empty() {
                return Err(LodeError::Config(format!(
                    "{}:// URL has empty path",
                    url.scheme()
                )));
            }
            Ok(ParsedUrl::Fs { path })
        }
        "s3" => parse_bucket_url(&url).map(|(bucket, root)| ParsedUrl::S3 { bucket, root }),
        "gs" => parse_bucket_url(&url).map(|(bucket, root)| ParsedUrl::Gcs { bucket, root }),
        other => Err(LodeError::UnsupportedBackend(format!(
            "unsupported URL scheme: '{other}'"
        ))),
    }
}

/// `scheme://bucket/prefix` -> (bucket, prefix). The prefix may be empty.
fn parse_bucket_url(url: &Url) -> Result<(String, String)> {
    let bucket = url
        .host_str()
        .ok_or_else(|| LodeError::Config(format!("{} URL is missing a bucket", url.scheme())))?;
    let root = url.path().trim_matches('/').to_string();
    Ok((bucket.to_string(), root))
}

/// Build a blob backend for a store URL.
pub fn backend_from_url(raw: &str, opts: &BackendOptions) -> Result<Box<dyn BlobBackend>> {
    match parse_store_url(raw)? {
        ParsedUrl::Fs { path } => Ok(Box::new(FsBackend::new(&path)?)),
        ParsedUrl::S3 { bucket, root } => {
            let endpoint = opts.s3_endpoint.as_deref().unwrap_or("https://s3.amazonaws.com");
            let region = opts.s3_region.as_deref().unwrap_or("us-east-1");
            let access_key_id = opts.s3_access_key_id.as_deref().ok_or_else(|| {
                LodeError::Config("S3 store requires an access key id".into())
            })?;
            let secret_access_key = opts.s3_secret_access_key.as_deref().ok_or_else(|| {
                LodeError::Config("S3 store requires a secret access key".into())
            })?;
            Ok(Box::new(S3Backend::new(
                &bucket,
                region,
                &root,
                endpoint,
                access_key_id,
                secret_access_key,
                opts.retry.clone(),
            )?))
        }
        ParsedUrl::Gcs { bucket, root } => {
            let token = opts.gcs_bearer_token.as_deref().ok_or_else(|| {
                LodeError::Config("GCS store requires a bearer token".into())
            })?;
            Ok(Box::new(GcsBackend::new(
                &bucket,
                &root,
                token,
                opts.retry.clone(),
            )?))
        }
    }
}

/// Split a full object URI into (store URL, object name) at the last slash.
fn split_uri(uri: &str) -> (&str, &str) {
    match uri.rfind('/') {
        Some(i) => (&uri[..i], &uri[i + 1..]),
        None => ("", uri),
    }
}

/// One-shot read of a single object addressed by a full URI.
///
/// Returns `None` if the object does not exist. Used by collaborators to
/// fetch version indexes published next to a store.
pub fn read_from_uri(uri: &str, opts: &BackendOptions) -> Result<Option<Vec<u8>>> {
    let (parent, name) = split_uri(uri);
    let backend = backend_from_url(parent, opts)?;
    backend.read(name)
}

/// One-shot write of a single object addressed by a full URI.
pub fn write_to_uri(uri: &str, data: &[u8], opts: &BackendOptions) -> Result<()> {
    let (parent, name) = split_uri(uri);
    let backend = backend_from_url(parent, opts)?;
    backend.write(name, data)
}
