use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Invalid manifest URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Manifest parse error: {0}")]
    ParseError(String),

    #[error("Fetched document is not an HLS playlist: {0}")]
    NotAPlaylist(String),

    #[error("Variant playlist nesting exceeds depth {0}")]
    TooDeeplyNested(u32),
}
