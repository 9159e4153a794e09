//! Video URL to HLS manifest resolution service.
//!
//! Takes a video page URL and returns a playable manifest reference,
//! resolving through a staged race of upstream strategies (paid endpoint,
//! shared-parameter API, key derivation), storing the winning manifest as a
//! cleaned local artifact, and caching results in SQLite.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod services;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, Resolution, ResolveError};
pub use services::ServiceContainer;
