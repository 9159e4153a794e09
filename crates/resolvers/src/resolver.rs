use crate::error::ResolverError;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Install the process-wide rustls crypto provider.
///
/// Must run before the first TLS client is built. Idempotent.
pub fn install_tls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Which strategy produced a manifest. Serialized into cache entries and
/// resolution payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMethod {
    PaidKey,
    SharedParam,
    Derived,
}

impl ResolveMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveMethod::PaidKey => "paid_key",
            ResolveMethod::SharedParam => "shared_param",
            ResolveMethod::Derived => "derived",
        }
    }
}

impl std::fmt::Display for ResolveMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolveMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paid_key" => Ok(ResolveMethod::PaidKey),
            "shared_param" => Ok(ResolveMethod::SharedParam),
            "derived" => Ok(ResolveMethod::Derived),
            other => Err(format!("unknown resolve method: {other}")),
        }
    }
}

/// Shared base for all strategy resolvers.
///
/// Holds the reqwest client plus the upstream-specific headers and query
/// parameters a strategy attaches to every request.
#[derive(Debug, Clone)]
pub struct Resolver {
    // name of the strategy, e.g. "PaidKey"
    pub name: String,
    pub client: Client,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
}

impl Resolver {
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            client,
            headers: HashMap::new(),
            params: HashMap::new(),
        }
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn add_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.request_with(&self.client, method, url)
    }

    /// Same defaults, different client. Used where a strategy keeps a
    /// separate client (no-redirect) but still wants its header set applied.
    pub fn get_with(&self, client: &Client, url: &str) -> RequestBuilder {
        self.request_with(client, Method::GET, url)
    }

    pub fn request_with(&self, client: &Client, method: Method, url: &str) -> RequestBuilder {
        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &self.headers {
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::from_str(key),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        client
            .request(method, url)
            .headers(headers)
            .query(&self.params)
    }
}

/// Build a client that never follows redirects.
///
/// The paid-key endpoint answers with a 3xx whose Location is the manifest
/// URL itself, and the derivation strategy walks redirect chains hop by hop;
/// both must observe the raw response instead of the followed one.
pub fn no_redirect_client(timeout: std::time::Duration) -> Result<Client, ResolverError> {
    install_tls_provider();
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(ResolverError::from)
}

/// Cooperative cancellation checkpoint.
///
/// Strategies call this before each network request and after each response;
/// a signalled token means another strategy already won.
pub fn checkpoint(token: &CancellationToken) -> Result<(), ResolverError> {
    if token.is_cancelled() {
        Err(ResolverError::Cancelled)
    } else {
        Ok(())
    }
}

/// A single resolution strategy.
///
/// `resolve` returns the remote manifest URL on success. Ordinary upstream
/// failures (timeouts, unparseable pages, stale parameters) are `Err` values
/// the orchestrator absorbs before moving to the next strategy.
#[async_trait]
pub trait StrategyResolver: Send + Sync {
    fn method(&self) -> ResolveMethod;

    async fn resolve(
        &self,
        video_url: &str,
        token: &CancellationToken,
    ) -> Result<String, ResolverError>;
}
