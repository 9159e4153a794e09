//! HLS manifest normalization and local artifact storage.
//!
//! Remote manifests arrive with relative segment paths, mixed-host segment
//! lists from flaky CDN mirrors, and encryption key URIs pointing at hosts
//! that rate limit. This crate rewrites a fetched manifest into a
//! self-contained local artifact: segments absolutized, minority-host noise
//! removed, key URIs swapped for locally cached copies.

pub mod cleaner;
pub mod error;
pub mod key_rewriter;
pub mod rewrite;
pub mod store;

pub use cleaner::clean_manifest;
pub use error::ArtifactError;
pub use key_rewriter::KeyRewriter;
pub use rewrite::{absolutize_manifest, content_id};
pub use store::{ArtifactStore, StoredManifest};
