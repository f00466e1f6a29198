use std::io::Read;
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use lodesync_types::{LodeError, Result};

use crate::retry::{HttpRetryError, RetryConfig};
use crate::{BlobBackend, BlobProperties};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// Blob backend for S3 and S3-compatible object stores.
///
/// S3 has no generation preconditions, so `supports_locking()` stays
/// `false` and store-index writes fall back to last-writer-wins.
#[derive(Debug)]
pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryConfig,
    /// Prefix (root path) prepended to all keys.
    root: String,
}

impl S3Backend {
    pub fn new(
        bucket_name: &str,
        region: &str,
        root: &str,
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        retry: RetryConfig,
    ) -> Result<Self> {
        let base_url = endpoint
            .parse()
            .map_err(|e| LodeError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}")))?;

        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| LodeError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let credentials = Credentials::new(access_key_id, secret_access_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let root = root.trim_matches('/').to_string();

        Ok(Self {
            bucket,
            credentials,
            agent,
            retry,
            root,
        })
    }

    /// Prepend the root prefix to a key.
    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    #[allow(clippy::result_large_err)]
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        crate::retry::retry_http(&self.retry, op_name, "S3", f)
    }

    fn retry_call_body<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, HttpRetryError>,
    ) -> std::result::Result<T, HttpRetryError> {
        crate::retry::retry_http_body(&self.retry, op_name, "S3", f)
    }
}

impl BlobBackend for S3Backend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        self.retry_call_body(&format!("GET {key}"), || {
            match self.agent.get(url.as_str()).call() {
                Ok(resp) => {
                    let mut buf = Vec::new();
                    resp.into_reader()
                        .read_to_end(&mut buf)
                        .map_err(HttpRetryError::BodyIo)?;
                    Ok(Some(buf))
                }
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })
        .map_err(|e| LodeError::Transport(format!("S3 GET {key}: {e}")))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        self.retry_call(&format!("PUT {key}"), || {
            self.agent.put(url.as_str()).send_bytes(data)
        })
        .map_err(|e| LodeError::Transport(format!("S3 PUT {key}: {e}")))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(&format!("DELETE {key}"), || {
            self.agent.delete(url.as_str()).call()
        }) {
            Ok(_) => Ok(()),
            // S3 DELETE of a missing key already returns 204, but some
            // compatible stores answer 404.
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(LodeError::Transport(format!("S3 DELETE {key}: {e}"))),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        match self.retry_call(&format!("HEAD {key}"), || {
            self.agent.head(url.as_str()).call()
        }) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(LodeError::Transport(format!("S3 HEAD {key}: {e}"))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobProperties>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1 // +1 for the '/'
        };

        let mut out = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let parsed = self
                .retry_call_body(&format!("LIST {prefix}"), || {
                    let resp = self
                        .agent
                        .get(url.as_str())
                        .call()
                        .map_err(HttpRetryError::http)?;
                    let mut body = Vec::new();
                    resp.into_reader()
                        .read_to_end(&mut body)
                        .map_err(HttpRetryError::BodyIo)?;
                    let body_str = std::str::from_utf8(&body).map_err(|e| {
                        HttpRetryError::Permanent(format!(
                            "S3 LIST {prefix}: failed to parse response: {e}"
                        ))
                    })?;
                    ListObjectsV2::parse_response(body_str).map_err(|e| {
                        HttpRetryError::Permanent(format!(
                            "S3 LIST {prefix}: failed to parse response: {e}"
                        ))
                    })
                })
                .map_err(|e| LodeError::Transport(format!("S3 LIST {prefix}: {e}")))?;

            for obj in &parsed.contents {
                // Skip directory markers.
                if obj.key.ends_with('/') {
                    continue;
                }
                // Strip root prefix to return store-relative keys.
                let key = if root_prefix_len > 0 && obj.key.len() > root_prefix_len {
                    obj.key[root_prefix_len..].to_string()
                } else {
                    obj.key.clone()
                };
                out.push(BlobProperties {
                    key,
                    size: obj.size,
                });
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(out)
    }
}
