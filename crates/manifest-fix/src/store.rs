//! Local manifest artifact store.
//!
//! A stored artifact is the end product of a resolution: a media playlist on
//! local disk, fully absolutized, cleaned, with its encryption keys cached
//! alongside it. Artifacts are keyed by content id, so resolving the same
//! video twice reuses the first artifact instead of re-downloading.

use crate::cleaner::clean_manifest;
use crate::error::ArtifactError;
use crate::key_rewriter::KeyRewriter;
use crate::rewrite::{absolutize, absolutize_manifest, content_id};
use reqwest::Client;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Master playlists can point at further master playlists; three levels is
/// already more than upstream serves.
const MAX_NESTING: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredManifest {
    pub content_id: String,
    pub file_name: String,
    pub path: PathBuf,
    /// URL under which this service serves the artifact back out.
    pub public_url: String,
    /// True when an existing artifact was reused without any network work.
    pub reused: bool,
}

pub struct ArtifactStore {
    client: Client,
    artifact_dir: PathBuf,
    public_base_url: String,
    key_rewriter: KeyRewriter,
}

impl ArtifactStore {
    pub fn new(
        client: Client,
        artifact_dir: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Result<Self, ArtifactError> {
        let artifact_dir = artifact_dir.into();
        let public_base_url = public_base_url.into();
        std::fs::create_dir_all(&artifact_dir)?;
        Ok(Self {
            key_rewriter: KeyRewriter::new(client.clone(), &artifact_dir, &public_base_url),
            client,
            artifact_dir,
            public_base_url,
        })
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// Artifacts are referenced by content id; the timestamped file name
    /// stays internal.
    pub fn local_ref(&self, content_id: &str) -> String {
        format!(
            "{}/{content_id}",
            self.public_base_url.trim_end_matches('/')
        )
    }

    fn find_existing(&self, id: &str) -> Option<String> {
        let prefix = format!("manifest_{id}_");
        let entries = std::fs::read_dir(&self.artifact_dir).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".m3u8") {
                return Some(name.into_owned());
            }
        }
        None
    }

    /// Fetch stored artifact bytes by content id, manifest or key. This is
    /// what an HTTP front-end serves from.
    pub async fn read(&self, content_id: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        if let Some(file_name) = self.find_existing(content_id) {
            let bytes = tokio::fs::read(self.artifact_dir.join(file_name)).await?;
            return Ok(Some(bytes));
        }
        let key_path = self.artifact_dir.join(format!("key_{content_id}.key"));
        match tokio::fs::read(&key_path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the playlist at `manifest_url`, drilling through master
    /// playlists to the first variant's media playlist.
    async fn fetch_media_playlist(
        &self,
        manifest_url: &str,
    ) -> Result<(String, String), ArtifactError> {
        let mut current = manifest_url.to_owned();

        for _ in 0..MAX_NESTING {
            let response = self.client.get(&current).send().await?.error_for_status()?;
            let body = response.text().await?;

            if !body.trim_start().starts_with("#EXTM3U") {
                return Err(ArtifactError::NotAPlaylist(current));
            }

            match m3u8_rs::parse_playlist_res(body.as_bytes()) {
                Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
                    let variant = master.variants.first().ok_or_else(|| {
                        ArtifactError::ParseError(format!(
                            "master playlist {current} has no variants"
                        ))
                    })?;
                    let next = absolutize(&variant.uri, &current);
                    debug!(master = %current, variant = %next, "descending into variant playlist");
                    current = next;
                }
                // Unparseable-but-playlist bodies are common with upstream's
                // nonstandard tags; treat them as media playlists.
                Ok(m3u8_rs::Playlist::MediaPlaylist(_)) | Err(_) => {
                    return Ok((body, current));
                }
            }
        }

        Err(ArtifactError::TooDeeplyNested(MAX_NESTING))
    }

    async fn process(&self, content: &str, manifest_url: &str) -> String {
        let absolutized = absolutize_manifest(content, manifest_url);
        let (keyed, _) = self.key_rewriter.rewrite(&absolutized, manifest_url).await;
        clean_manifest(&keyed)
    }

    /// Store the manifest behind `manifest_url` as a local artifact.
    pub async fn store_manifest(
        &self,
        manifest_url: &str,
    ) -> Result<StoredManifest, ArtifactError> {
        let id = content_id(manifest_url);

        if let Some(file_name) = self.find_existing(&id) {
            debug!(content_id = %id, file = %file_name, "reusing existing artifact");
            return Ok(StoredManifest {
                public_url: self.local_ref(&id),
                content_id: id,
                path: self.artifact_dir.join(&file_name),
                file_name,
                reused: true,
            });
        }

        let (raw, final_url) = self.fetch_media_playlist(manifest_url).await?;
        let processed = self.process(&raw, &final_url).await;

        let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let file_name = format!("manifest_{id}_{timestamp}.m3u8");
        let path = self.artifact_dir.join(&file_name);
        tokio::fs::write(&path, processed.as_bytes()).await?;
        info!(content_id = %id, file = %file_name, "stored manifest artifact");

        Ok(StoredManifest {
            public_url: self.local_ref(&id),
            content_id: id,
            path,
            file_name,
            reused: false,
        })
    }
}
