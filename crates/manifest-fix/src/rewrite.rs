//! URL normalization for fetched manifests.

use regex::Regex;
use std::sync::LazyLock;

/// CDN cache URLs embed a content hash in their path; reusing it keeps the
/// artifact name stable across re-resolutions of the same video.
static CACHE_HASH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/Cache/[^/]+/([a-f0-9]+)\.m3u8").unwrap());

/// Stable 16-character identifier for a manifest URL.
///
/// Prefers the content hash embedded in CDN cache paths, falling back to a
/// digest of the full URL.
pub fn content_id(manifest_url: &str) -> String {
    if let Some(caps) = CACHE_HASH_REGEX.captures(manifest_url)
        && let Some(hash) = caps.get(1)
        && hash.as_str().len() >= 16
    {
        return hash.as_str()[..16].to_owned();
    }
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(manifest_url.as_bytes()))[..16].to_owned()
}

/// Join a possibly relative reference against the manifest URL it came from.
pub fn absolutize(reference: &str, base_url: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reference.to_owned();
    }
    if let Some(rest) = reference.strip_prefix("//") {
        return format!("https://{rest}");
    }
    url::Url::parse(base_url)
        .and_then(|base| base.join(reference))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| reference.to_owned())
}

/// Rewrite every segment reference in a media playlist to an absolute URL.
///
/// Tag lines pass through untouched; key URIs are handled separately because
/// they also need downloading.
pub fn absolutize_manifest(content: &str, manifest_url: &str) -> String {
    let mut out = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push(line.to_owned());
        } else {
            out.push(absolutize(trimmed, manifest_url));
        }
    }
    // Manifests end with a newline; lines() drops it.
    let mut joined = out.join("\n");
    if content.ends_with('\n') {
        joined.push('\n');
    }
    joined
}
