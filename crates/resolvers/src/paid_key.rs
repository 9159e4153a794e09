//! Paid-endpoint strategy.
//!
//! Calls a commercial resolution endpoint with a rotating `(client_id,
//! secret)` credential pair. The endpoint is rate limited per credential, so
//! every attempt pulls the next credential from the pool and a failed
//! attempt retries with a fresh one.

use crate::error::ResolverError;
use crate::extract;
use crate::resolver::{ResolveMethod, Resolver, StrategyResolver, checkpoint, no_redirect_client};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_MAX_RETRIES: u32 = 2;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// One usable credential for the paid endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredential {
    pub client_id: String,
    pub secret: String,
}

/// Rotating credential source.
///
/// `next` advances the rotation cursor and returns the next active,
/// unexpired credential, or `None` when the pool is empty.
#[async_trait]
pub trait CredentialPool: Send + Sync {
    async fn next(&self) -> Option<ApiCredential>;
}

pub struct PaidKeyResolver {
    resolver: Resolver,
    no_redirect: Client,
    endpoint: String,
    pool: Arc<dyn CredentialPool>,
    max_retries: u32,
}

impl PaidKeyResolver {
    pub fn new(
        endpoint: impl Into<String>,
        client: Client,
        pool: Arc<dyn CredentialPool>,
    ) -> Result<Self, ResolverError> {
        let mut resolver = Resolver::new("PaidKey", client);
        resolver.add_header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8");
        Ok(Self {
            resolver,
            // The endpoint answers some credentials with a 302 whose target
            // serves an expired certificate; the Location itself is the
            // answer, so redirects must never be followed.
            no_redirect: no_redirect_client(REQUEST_TIMEOUT)?,
            endpoint: endpoint.into(),
            pool,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn request_url(&self, credential: &ApiCredential, video_url: &str) -> String {
        format!(
            "{}?type=app&uid={}&key={}&url={}",
            self.endpoint,
            credential.client_id,
            credential.secret,
            urlencoding::encode(video_url)
        )
    }

    async fn attempt(
        &self,
        credential: &ApiCredential,
        video_url: &str,
    ) -> Result<String, ResolverError> {
        let url = self.request_url(credential, video_url);
        let response = self
            .resolver
            .get_with(&self.no_redirect, &url)
            .send()
            .await?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        let body = if status.is_redirection() {
            String::new()
        } else {
            response.text().await?
        };

        interpret_response(status.as_u16(), location.as_deref(), &body, &url)
            .ok_or(ResolverError::NoManifestFound)
    }
}

/// Interpret a paid-endpoint response.
///
/// Three success shapes, in order:
/// 1. a redirect whose Location is the manifest URL;
/// 2. a body that is itself an HLS playlist, in which case the endpoint URL
///    doubles as the manifest URL;
/// 3. a manifest URL embedded somewhere in an HTML/JSON body.
pub fn interpret_response(
    status: u16,
    location: Option<&str>,
    body: &str,
    endpoint_url: &str,
) -> Option<String> {
    if (300..400).contains(&status) {
        return location.map(ToOwned::to_owned);
    }
    if status != 200 {
        return None;
    }
    if body.contains("#EXTM3U") {
        return Some(endpoint_url.to_owned());
    }
    extract::manifest_url(body)
}

#[async_trait]
impl StrategyResolver for PaidKeyResolver {
    fn method(&self) -> ResolveMethod {
        ResolveMethod::PaidKey
    }

    async fn resolve(
        &self,
        video_url: &str,
        token: &CancellationToken,
    ) -> Result<String, ResolverError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            checkpoint(token)?;

            let Some(credential) = self.pool.next().await else {
                // An empty pool will not refill mid-request; retrying other
                // credentials is pointless.
                warn!(strategy = %self.resolver.name, "credential pool is empty");
                return Err(ResolverError::CredentialsExhausted);
            };

            debug!(
                strategy = %self.resolver.name,
                client_id = %credential.client_id,
                attempt,
                "calling paid endpoint"
            );

            match self.attempt(&credential, video_url).await {
                Ok(manifest_url) => {
                    checkpoint(token)?;
                    debug!(
                        strategy = %self.resolver.name,
                        client_id = %credential.client_id,
                        "paid endpoint produced a manifest url"
                    );
                    return Ok(manifest_url);
                }
                Err(e) => {
                    warn!(
                        strategy = %self.resolver.name,
                        client_id = %credential.client_id,
                        attempt,
                        error = %e,
                        "paid endpoint attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(ResolverError::NoManifestFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const ENDPOINT: &str = "https://api.example.com/home/api?type=app&uid=1&key=k&url=x";

    #[test]
    fn redirect_uses_location() {
        let out = interpret_response(
            302,
            Some("https://cache.example.com/Cache/qq/abc.m3u8"),
            "",
            ENDPOINT,
        );
        assert_eq!(out.as_deref(), Some("https://cache.example.com/Cache/qq/abc.m3u8"));
    }

    #[test]
    fn redirect_without_location_fails() {
        assert_eq!(interpret_response(302, None, "", ENDPOINT), None);
    }

    #[test]
    fn playlist_body_returns_endpoint_url() {
        let body = "#EXTM3U\n#EXTINF:10,\nhttps://cdn.example.com/0.ts\n";
        assert_eq!(
            interpret_response(200, None, body, ENDPOINT).as_deref(),
            Some(ENDPOINT)
        );
    }

    #[test]
    fn html_body_with_embedded_link() {
        let body = r#"<html><script>var url = "https://cdn.example.com/v.m3u8";</script></html>"#;
        assert_eq!(
            interpret_response(200, None, body, ENDPOINT).as_deref(),
            Some("https://cdn.example.com/v.m3u8")
        );
    }

    #[test]
    fn unusable_responses_fail() {
        assert_eq!(interpret_response(200, None, "<html>nothing</html>", ENDPOINT), None);
        assert_eq!(interpret_response(500, None, "", ENDPOINT), None);
        assert_eq!(interpret_response(403, None, "denied", ENDPOINT), None);
    }

    struct ScriptedPool {
        credentials: Mutex<Vec<Option<ApiCredential>>>,
    }

    #[async_trait]
    impl CredentialPool for ScriptedPool {
        async fn next(&self) -> Option<ApiCredential> {
            let mut creds = self.credentials.lock().unwrap();
            if creds.is_empty() { None } else { creds.remove(0) }
        }
    }

    #[test]
    fn endpoint_request_carries_the_accept_header() {
        let pool = Arc::new(ScriptedPool {
            credentials: Mutex::new(vec![]),
        });
        let resolver =
            PaidKeyResolver::new("https://api.invalid/home/api", Client::new(), pool).unwrap();

        let request = resolver
            .resolver
            .get_with(&resolver.no_redirect, "https://api.invalid/home/api")
            .build()
            .unwrap();
        let accept = request.headers().get("Accept").unwrap().to_str().unwrap();
        assert!(accept.starts_with("text/html"));
    }

    #[tokio::test]
    async fn empty_pool_fails_fast() {
        let pool = Arc::new(ScriptedPool {
            credentials: Mutex::new(vec![]),
        });
        let resolver =
            PaidKeyResolver::new("https://api.invalid/home/api", Client::new(), pool).unwrap();
        let token = CancellationToken::new();

        let err = resolver.resolve("https://video.example.com/v_1", &token).await;
        assert!(matches!(err, Err(ResolverError::CredentialsExhausted)));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_network_call() {
        let pool = Arc::new(ScriptedPool {
            credentials: Mutex::new(vec![Some(ApiCredential {
                client_id: "u".into(),
                secret: "s".into(),
            })]),
        });
        let resolver =
            PaidKeyResolver::new("https://api.invalid/home/api", Client::new(), pool.clone())
                .unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = resolver.resolve("https://video.example.com/v_1", &token).await;
        assert!(matches!(err, Err(ResolverError::Cancelled)));
        // The credential was never consumed.
        assert_eq!(pool.credentials.lock().unwrap().len(), 1);
    }
}
