//! Encryption key localization.
//!
//! `#EXT-X-KEY` URIs usually point at the resolving host, which rate limits
//! and expires aggressively. Each key is downloaded once into the artifact
//! directory and the manifest rewritten to serve it from this service.

use crate::error::ArtifactError;
use crate::rewrite::absolutize;
use md5::{Digest, Md5};
use regex::Regex;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

const KEY_TAG_PREFIX: &str = "#EXT-X-KEY";

// The URI cannot contain either quote character, so matching the closing
// quote as a class instead of a backreference is equivalent.
static URI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"URI=(?P<q>["'])(?P<uri>[^"']+)["']"#).unwrap());

fn key_id(key_url: &str) -> String {
    hex::encode(Md5::digest(key_url.as_bytes()))[..16].to_owned()
}

fn key_filename(id: &str) -> String {
    format!("key_{id}.key")
}

pub struct KeyRewriter {
    client: Client,
    artifact_dir: PathBuf,
    /// Public base under which stored artifacts are served back out.
    public_base_url: String,
}

impl KeyRewriter {
    pub fn new(client: Client, artifact_dir: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            client,
            artifact_dir: artifact_dir.into(),
            public_base_url: public_base_url.into(),
        }
    }

    // Artifacts are served by content id; the on-disk name is an
    // implementation detail of the store.
    fn local_key_url(&self, id: &str) -> String {
        format!("{}/{id}", self.public_base_url.trim_end_matches('/'))
    }

    async fn cache_key(&self, key_url: &str, dest: &Path) -> Result<(), ArtifactError> {
        if tokio::fs::try_exists(dest).await.unwrap_or(false)
            && tokio::fs::metadata(dest).await.map(|m| m.len() > 0).unwrap_or(false)
        {
            return Ok(());
        }

        let response = self.client.get(key_url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ArtifactError::NotAPlaylist(format!(
                "empty key body from {key_url}"
            )));
        }
        tokio::fs::write(dest, &bytes).await?;
        info!(file = %dest.display(), size = bytes.len(), "cached encryption key");
        Ok(())
    }

    /// Rewrite every `#EXT-X-KEY` URI to a locally served copy, caching the
    /// key bytes on first sight. A line whose key cannot be downloaded keeps
    /// its original URI rather than pointing at a local 404.
    pub async fn rewrite(&self, content: &str, manifest_url: &str) -> (String, usize) {
        if !content.contains(KEY_TAG_PREFIX) {
            return (content.to_owned(), 0);
        }

        let mut rewritten = 0usize;
        let mut out_lines = Vec::new();
        for line in content.split('\n') {
            if !line.trim().starts_with(KEY_TAG_PREFIX) {
                out_lines.push(line.to_owned());
                continue;
            }
            let Some(caps) = URI_REGEX.captures(line) else {
                out_lines.push(line.to_owned());
                continue;
            };

            let original_uri = &caps["uri"];
            let key_url = absolutize(original_uri, manifest_url);
            let id = key_id(&key_url);
            let dest = self.artifact_dir.join(key_filename(&id));

            if let Err(e) = self.cache_key(&key_url, &dest).await {
                warn!(url = %key_url, error = %e, "key download failed, keeping original uri");
                out_lines.push(line.to_owned());
                continue;
            }

            let quote = &caps["q"];
            let replacement = format!("URI={quote}{}{quote}", self.local_key_url(&id));
            out_lines.push(URI_REGEX.replace(line, replacement.as_str()).into_owned());
            rewritten += 1;
        }

        if rewritten > 0 {
            info!(rewritten, "rewrote encryption key uris to local copies");
        }
        (out_lines.join("\n"), rewritten)
    }
}
