use std::io::Read;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use lodesync_types::{LodeError, Result};

use crate::retry::{HttpRetryError, RetryConfig};
use crate::{BlobBackend, BlobProperties, VersionToken, WriteOutcome};

const STORAGE_BASE: &str = "https://storage.googleapis.com/storage/v1/b";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/b";

/// Blob backend for Google Cloud Storage over the JSON API.
///
/// Conditional writes use object generation preconditions
/// (`ifGenerationMatch`), so this backend supports version locking.
/// Takes an already-discovered OAuth bearer token; credential discovery is
/// the caller's concern.
#[derive(Debug)]
pub struct GcsBackend {
    bucket: String,
    root: String,
    bearer: String,
    agent: ureq::Agent,
    retry: RetryConfig,
}

/// Object metadata subset returned by the JSON API. GCS encodes int64
/// fields as strings.
#[derive(Debug, Deserialize)]
struct ObjectMeta {
    generation: String,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

impl GcsBackend {
    pub fn new(bucket: &str, root: &str, bearer_token: &str, retry: RetryConfig) -> Result<Self> {
        if bucket.is_empty() {
            return Err(LodeError::Config("GCS bucket must not be empty".into()));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();
        Ok(Self {
            bucket: bucket.to_string(),
            root: root.trim_matches('/').to_string(),
            bearer: format!("Bearer {bearer_token}"),
            agent,
            retry,
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    /// `.../b/<bucket>/o/<percent-encoded object>` with optional query pairs.
    fn object_url(&self, key: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{STORAGE_BASE}/{}/o", self.bucket))
            .map_err(|e| LodeError::Config(format!("GCS url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| LodeError::Config("GCS url cannot be a base".into()))?
            .push(&self.full_key(key));
        for (k, v) in query {
            url.query_pairs_mut().append_pair(k, v);
        }
        Ok(url)
    }

    fn upload_url(&self, key: &str, if_generation_match: Option<u64>) -> Result<Url> {
        let mut url = Url::parse(&format!("{UPLOAD_BASE}/{}/o", self.bucket))
            .map_err(|e| LodeError::Config(format!("GCS url: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("uploadType", "media");
            pairs.append_pair("name", &self.full_key(key));
            if let Some(generation) = if_generation_match {
                pairs.append_pair("ifGenerationMatch", &generation.to_string());
            }
        }
        Ok(url)
    }

    #[allow(clippy::result_large_err)]
    fn retry_call<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, ureq::Error>,
    ) -> std::result::Result<T, ureq::Error> {
        crate::retry::retry_http(&self.retry, op_name, "GCS", f)
    }

    fn retry_call_body<T>(
        &self,
        op_name: &str,
        f: impl Fn() -> std::result::Result<T, HttpRetryError>,
    ) -> std::result::Result<T, HttpRetryError> {
        crate::retry::retry_http_body(&self.retry, op_name, "GCS", f)
    }

    /// Fetch object metadata; `None` when the object does not exist.
    fn stat(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let url = self.object_url(key, &[])?;
        self.retry_call_body(&format!("STAT {key}"), || {
            match self
                .agent
                .get(url.as_str())
                .set("Authorization", &self.bearer)
                .call()
            {
                Ok(resp) => {
                    let mut body = Vec::new();
                    resp.into_reader()
                        .read_to_end(&mut body)
                        .map_err(HttpRetryError::BodyIo)?;
                    let meta: ObjectMeta = serde_json::from_slice(&body).map_err(|e| {
                        HttpRetryError::Permanent(format!("GCS STAT {key}: bad metadata: {e}"))
                    })?;
                    Ok(Some(meta))
                }
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })
        .map_err(|e| LodeError::Transport(format!("GCS STAT {key}: {e}")))
    }

    fn parse_generation(meta: &ObjectMeta, key: &str) -> Result<u64> {
        meta.generation
            .parse::<u64>()
            .map_err(|_| LodeError::Transport(format!("GCS {key}: bad generation field")))
    }
}

impl BlobBackend for GcsBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.object_url(key, &[("alt", "media")])?;
        self.retry_call_body(&format!("GET {key}"), || {
            match self
                .agent
                .get(url.as_str())
                .set("Authorization", &self.bearer)
                .call()
            {
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
        .map_err(|e| LodeError::Transport(format!("GCS GET {key}: {e}")))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let url = self.upload_url(key, None)?;
        self.retry_call(&format!("PUT {key}"), || {
            self.agent
                .post(url.as_str())
                .set("Authorization", &self.bearer)
                .set("Content-Type", "application/octet-stream")
                .send_bytes(data)
        })
        .map_err(|e| LodeError::Transport(format!("GCS PUT {key}: {e}")))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let url = self.object_url(key, &[])?;
        match self.retry_call(&format!("DELETE {key}"), || {
            self.agent
                .delete(url.as_str())
                .set("Authorization", &self.bearer)
                .call()
        }) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(LodeError::Transport(format!("GCS DELETE {key}: {e}"))),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.stat(key)?.is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobProperties>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut out = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = Url::parse(&format!("{STORAGE_BASE}/{}/o", self.bucket))
                .map_err(|e| LodeError::Config(format!("GCS url: {e}")))?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("prefix", &full_prefix);
                if let Some(ref token) = page_token {
                    pairs.append_pair("pageToken", token);
                }
            }

            let parsed = self
                .retry_call_body(&format!("LIST {prefix}"), || {
                    let resp = self
                        .agent
                        .get(url.as_str())
                        .set("Authorization", &self.bearer)
                        .call()
                        .map_err(HttpRetryError::http)?;
                    let mut body = Vec::new();
                    resp.into_reader()
                        .read_to_end(&mut body)
                        .map_err(HttpRetryError::BodyIo)?;
                    serde_json::from_slice::<ListResponse>(&body).map_err(|e| {
                        HttpRetryError::Permanent(format!(
                            "GCS LIST {prefix}: failed to parse response: {e}"
                        ))
                    })
                })
                .map_err(|e| LodeError::Transport(format!("GCS LIST {prefix}: {e}")))?;

            for item in &parsed.items {
                if item.name.ends_with('/') {
                    continue;
                }
                let key = if root_prefix_len > 0 && item.name.len() > root_prefix_len {
                    item.name[root_prefix_len..].to_string()
                } else {
                    item.name.clone()
                };
                let size = item
                    .size
                    .as_deref()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                out.push(BlobProperties { key, size });
            }

            match parsed.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(out)
    }

    fn supports_locking(&self) -> bool {
        true
    }

    fn lock_write_version(&self, key: &str) -> Result<VersionToken> {
        match self.stat(key)? {
            Some(meta) => Ok(VersionToken::new(
                Self::parse_generation(&meta, key)?,
                true,
            )),
            None => Ok(VersionToken::absent()),
        }
    }

    fn write_if_unchanged(
        &self,
        key: &str,
        data: &[u8],
        token: &VersionToken,
    ) -> Result<WriteOutcome> {
        // Generation 0 means "only if the object does not exist".
        let precondition = if token.exists() { token.version() } else { 0 };
        let url = self.upload_url(key, Some(precondition))?;

        match self.retry_call(&format!("PUT-IF {key}"), || {
            self.agent
                .post(url.as_str())
                .set("Authorization", &self.bearer)
                .set("Content-Type", "application/octet-stream")
                .send_bytes(data)
        }) {
            Ok(_) => Ok(WriteOutcome::Committed),
            Err(ureq::Error::Status(412, _)) => Ok(WriteOutcome::Conflict),
            Err(e) => Err(LodeError::Transport(format!("GCS PUT-IF {key}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backend(root: &str) -> GcsBackend {
        GcsBackend::new("bucket", root, "token", RetryConfig::default()).unwrap()
    }

    #[test]
    fn object_url_percent_encodes_slashes() {
        let backend = test_backend("stores/game");
        let url = backend.object_url("chunks/dead/x.lsb", &[]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bucket/o/stores%2Fgame%2Fchunks%2Fdead%2Fx.lsb"
        );
    }

    #[test]
    fn upload_url_carries_generation_precondition() {
        let backend = test_backend("");
        let url = backend.upload_url("store.lsi", Some(7)).unwrap();
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("uploadType".into(), "media".into())));
        assert!(query.contains(&("name".into(), "store.lsi".into())));
        assert!(query.contains(&("ifGenerationMatch".into(), "7".into())));
    }

    #[test]
    fn locking_is_supported() {
        assert!(test_backend("").supports_locking());
    }

    #[test]
    fn empty_bucket_rejected() {
        let err = GcsBackend::new("", "", "token", RetryConfig::default()).unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }
}
