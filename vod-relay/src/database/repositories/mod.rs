pub mod credentials;
pub mod parse_cache;

pub use credentials::CredentialRepository;
pub use parse_cache::{CacheEntry, ParseCacheRepository};

/// Current time as Unix milliseconds, the timestamp unit all tables use.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
