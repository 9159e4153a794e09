//! Resolution strategies for turning an opaque video page URL into a stream
//! manifest URL.
//!
//! Each strategy talks to a different third-party resolution path and is
//! wrapped behind the [`StrategyResolver`] trait so callers can order, race
//! and fall back between them without knowing which variant they hold.

pub mod derivation;
pub mod error;
pub mod extract;
pub mod paid_key;
pub mod resolver;
pub mod shared_param;

pub use derivation::DerivationResolver;
pub use error::ResolverError;
pub use paid_key::{ApiCredential, CredentialPool, PaidKeyResolver};
pub use resolver::{ResolveMethod, Resolver, StrategyResolver, install_tls_provider};
pub use shared_param::{
    BrowserCapture, CommandCapture, SharedParam, SharedParamResolver, SharedParamState,
};
