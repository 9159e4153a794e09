//! Segment-list cleanup.
//!
//! Some upstream mirrors splice foreign-host segments (ads or tracking
//! beacons) into an otherwise single-host playlist. A frequency vote over the
//! hosts of absolute segment URLs identifies the legitimate host set; every
//! minority-host segment goes, along with its `#EXTINF` tag.

use std::collections::HashMap;
use tracing::{debug, info};

fn host_of(line: &str) -> Option<String> {
    url::Url::parse(line).ok().and_then(|u| u.host_str().map(ToOwned::to_owned))
}

fn is_absolute(line: &str) -> bool {
    line.starts_with("http://") || line.starts_with("https://")
}

/// Remove minority-host segments from a media playlist.
///
/// Playlists with no absolute URLs (purely relative, or already local) come
/// back unchanged. Ties at the top of the frequency vote all survive.
pub fn clean_manifest(content: &str) -> String {
    let lines: Vec<&str> = content.split('\n').collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for line in &lines {
        let trimmed = line.trim();
        if is_absolute(trimmed)
            && let Some(host) = host_of(trimmed)
        {
            *counts.entry(host).or_default() += 1;
        }
    }
    if counts.is_empty() {
        return content.to_owned();
    }

    let max_count = counts.values().copied().max().unwrap_or(0);
    let majority: Vec<&str> = counts
        .iter()
        .filter(|(_, c)| **c == max_count)
        .map(|(h, _)| h.as_str())
        .collect();

    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    let mut removed = 0usize;
    for line in &lines {
        let trimmed = line.trim();
        let minority = is_absolute(trimmed)
            && host_of(trimmed).is_none_or(|h| !majority.contains(&h.as_str()));
        if minority {
            // The segment's #EXTINF goes with it.
            if kept
                .last()
                .is_some_and(|prev| prev.trim().starts_with("#EXTINF"))
            {
                kept.pop();
            }
            removed += 1;
            continue;
        }
        kept.push(line);
    }

    // Second pass: drop any #EXTINF no longer followed by a segment line.
    let mut final_lines: Vec<&str> = Vec::with_capacity(kept.len());
    let mut i = 0;
    while i < kept.len() {
        let trimmed = kept[i].trim();
        if trimmed.starts_with("#EXTINF") {
            let next = kept.get(i + 1).map(|l| l.trim());
            let followed_by_segment =
                next.is_some_and(|n| is_absolute(n) || (!n.is_empty() && !n.starts_with('#')));
            if !followed_by_segment {
                debug!(line = i, "dropping orphaned #EXTINF tag");
                i += 1;
                continue;
            }
        }
        final_lines.push(kept[i]);
        i += 1;
    }

    if removed > 0 {
        info!(removed, "removed minority-host lines from manifest");
    }

    final_lines.join("\n")
}
