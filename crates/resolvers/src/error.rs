use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("no usable credentials in the pool")]
    CredentialsExhausted,
    #[error("shared parameter unavailable: {0}")]
    ParamUnavailable(String),
    #[error("decryption failed: {0}")]
    DecryptFailed(String),
    #[error("no manifest found")]
    NoManifestFound,
    #[error("cancelled")]
    Cancelled,
    #[error("other: {0}")]
    Other(String),
}
