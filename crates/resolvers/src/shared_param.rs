//! Shared-parameter strategy.
//!
//! The free resolution API authenticates with a 32-hex parameter that every
//! client of the upstream player shares and that rotates roughly daily. The
//! parameter is scraped from the player pages when possible, captured via an
//! external browser-automation command when scraping fails, and persisted so
//! restarts keep a warm value.

use crate::error::ResolverError;
use crate::extract;
use crate::resolver::{ResolveMethod, Resolver, StrategyResolver, checkpoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Parameter validity window.
const DEFAULT_MAX_AGE_SECS: i64 = 24 * 60 * 60;

const DEFAULT_S1IG: &str = "11397";

/// Markers the API serves instead of JSON once the parameter has rotated.
const STALE_MARKERS: [&str; 2] = ["联系QQ", "获取json版api地址"];

/// The persisted shared parameter plus its companion query values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedParam {
    pub value: String,
    #[serde(default = "default_s1ig")]
    pub s1ig: String,
    #[serde(default)]
    pub g: String,
    pub refreshed_at: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
}

fn default_s1ig() -> String {
    DEFAULT_S1IG.to_string()
}

impl SharedParam {
    pub fn scraped(value: String) -> Self {
        Self {
            value,
            s1ig: default_s1ig(),
            g: String::new(),
            refreshed_at: Utc::now(),
            source: "scrape".to_string(),
        }
    }

    fn age_secs(&self) -> i64 {
        (Utc::now() - self.refreshed_at).num_seconds()
    }
}

/// Process-wide shared-parameter cell with file persistence.
///
/// The browser-capture lane is a single-slot mutex: concurrent refreshes
/// queue behind one capture run instead of launching a browser each.
pub struct SharedParamState {
    path: PathBuf,
    cell: RwLock<Option<SharedParam>>,
    browser_lane: Mutex<()>,
    max_age_secs: i64,
}

impl SharedParamState {
    /// Load persisted state from `path`; a missing or unreadable file simply
    /// starts the cell empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let initial = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<SharedParam>(&raw).ok());
        if initial.is_some() {
            info!(path = %path.display(), "loaded persisted shared parameter");
        }
        Self {
            path,
            cell: RwLock::new(initial),
            browser_lane: Mutex::new(()),
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }

    pub fn with_max_age_secs(mut self, secs: i64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// The current parameter if it is still inside the validity window.
    pub fn current(&self) -> Option<SharedParam> {
        let guard = self.cell.read();
        guard
            .as_ref()
            .filter(|p| p.age_secs() <= self.max_age_secs)
            .cloned()
    }

    /// The current parameter regardless of age. Used as a last resort when a
    /// refresh fails: a stale value sometimes still works.
    pub fn current_any_age(&self) -> Option<SharedParam> {
        self.cell.read().clone()
    }

    /// Store a freshly acquired parameter, in memory and on disk.
    pub fn store(&self, param: SharedParam) {
        if let Ok(json) = serde_json::to_string_pretty(&param)
            && let Err(e) = std::fs::write(&self.path, json)
        {
            warn!(path = %self.path.display(), error = %e, "failed to persist shared parameter");
        }
        *self.cell.write() = Some(param);
    }

    pub fn invalidate(&self) {
        *self.cell.write() = None;
    }
}

/// Seam to external browser automation.
///
/// Implementations drive a real browser against the gateway page and watch
/// for the API call that carries the parameter. The shipped implementation
/// delegates to an external command; the automation itself is not this
/// crate's concern.
#[async_trait]
pub trait BrowserCapture: Send + Sync {
    async fn capture(&self, page_url: &str) -> Result<SharedParam, ResolverError>;
}

#[derive(Debug, Clone, Deserialize)]
struct CaptureOutput {
    param: String,
    #[serde(default = "default_s1ig")]
    s1ig: String,
    #[serde(default)]
    g: String,
}

/// [`BrowserCapture`] backed by an external capture command.
///
/// The command is invoked with the gateway page URL as its final argument
/// and must print `{"param": "<32 hex>", "s1ig": "...", "g": "..."}` JSON on
/// stdout.
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl BrowserCapture for CommandCapture {
    async fn capture(&self, page_url: &str) -> Result<SharedParam, ResolverError> {
        let out = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(page_url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                ResolverError::ParamUnavailable(format!("failed to spawn capture command: {e}"))
            })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(ResolverError::ParamUnavailable(format!(
                "capture command failed: {stderr}"
            )));
        }

        let stdout = String::from_utf8_lossy(&out.stdout);
        let parsed: CaptureOutput = serde_json::from_str(stdout.trim()).map_err(|e| {
            ResolverError::ParamUnavailable(format!("unparseable capture output: {e}"))
        })?;

        Ok(SharedParam {
            value: parsed.param.to_lowercase(),
            s1ig: parsed.s1ig,
            g: parsed.g,
            refreshed_at: Utc::now(),
            source: "browser".to_string(),
        })
    }
}

pub struct SharedParamResolver {
    resolver: Resolver,
    state: Arc<SharedParamState>,
    capture: Option<Arc<dyn BrowserCapture>>,
    /// Gateway page prefix; the video URL is appended verbatim.
    gateway_url: String,
    /// Resolution API endpoint, e.g. `https://host/api/v/`.
    api_url: String,
}

impl SharedParamResolver {
    pub fn new(
        gateway_url: impl Into<String>,
        api_url: impl Into<String>,
        client: reqwest::Client,
        state: Arc<SharedParamState>,
        capture: Option<Arc<dyn BrowserCapture>>,
    ) -> Self {
        let api_url = api_url.into();
        let mut resolver = Resolver::new("SharedParam", client);
        if let Ok(api) = url::Url::parse(&api_url)
            && let Some(host) = api.host_str()
        {
            let origin = format!("{}://{}", api.scheme(), host);
            resolver.add_header("Referer", format!("{origin}/"));
            resolver.add_header("Origin", origin);
        }
        Self {
            resolver,
            state,
            capture,
            gateway_url: gateway_url.into(),
            api_url,
        }
    }

    fn gateway_page(&self, video_url: &str) -> String {
        format!("{}{}", self.gateway_url, video_url)
    }

    fn api_request(&self, param: &SharedParam, video_url: &str) -> String {
        format!(
            "{}?z={}&jx={}&s1ig={}&g={}",
            self.api_url, param.value, video_url, param.s1ig, param.g
        )
    }

    /// Fast refresh path: fetch the gateway page (following one iframe hop)
    /// and scrape the parameter out of the markup.
    async fn refresh_via_scrape(
        &self,
        video_url: &str,
        token: &CancellationToken,
    ) -> Result<SharedParam, ResolverError> {
        checkpoint(token)?;
        let page_url = self.gateway_page(video_url);
        let response = self.resolver.get(&page_url).send().await?;
        let mut html = response.text().await?;
        checkpoint(token)?;

        if extract::shared_param(&html).is_none()
            && let Some(inner) = extract::iframe_url(&html, &page_url)
        {
            debug!(url = %inner, "following gateway iframe");
            if let Ok(inner_response) = self.resolver.get(&inner).send().await
                && let Ok(inner_html) = inner_response.text().await
            {
                html = inner_html;
            }
        }

        let value = extract::shared_param(&html).ok_or_else(|| {
            ResolverError::ParamUnavailable("parameter not present in gateway markup".to_string())
        })?;
        Ok(SharedParam::scraped(value))
    }

    /// Get a parameter to call the API with, refreshing if the stored one is
    /// absent or past its validity window.
    async fn ensure_param(
        &self,
        video_url: &str,
        token: &CancellationToken,
    ) -> Result<SharedParam, ResolverError> {
        if let Some(param) = self.state.current() {
            return Ok(param);
        }
        self.refresh(video_url, token).await
    }

    async fn refresh(
        &self,
        video_url: &str,
        token: &CancellationToken,
    ) -> Result<SharedParam, ResolverError> {
        match self.refresh_via_scrape(video_url, token).await {
            Ok(param) => {
                info!(source = %param.source, "shared parameter refreshed");
                self.state.store(param.clone());
                return Ok(param);
            }
            Err(e) => {
                debug!(error = %e, "scrape refresh failed");
            }
        }

        if let Some(capture) = &self.capture {
            let _slot = self.state.browser_lane.lock().await;
            // A queued caller may find the parameter already refreshed by
            // whoever held the lane before it.
            if let Some(param) = self.state.current() {
                return Ok(param);
            }
            checkpoint(token)?;
            let param = capture.capture(&self.gateway_page(video_url)).await?;
            info!(source = %param.source, "shared parameter refreshed");
            self.state.store(param.clone());
            return Ok(param);
        }

        // A stale parameter occasionally outlives its nominal window.
        self.state.current_any_age().ok_or_else(|| {
            ResolverError::ParamUnavailable("no parameter available and refresh failed".to_string())
        })
    }

    fn is_stale_response(body: &str) -> bool {
        STALE_MARKERS.iter().any(|m| body.contains(m))
    }

    async fn call_api(
        &self,
        param: &SharedParam,
        video_url: &str,
        token: &CancellationToken,
    ) -> Result<ApiOutcome, ResolverError> {
        checkpoint(token)?;
        let url = self.api_request(param, video_url);
        let response = self.resolver.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ResolverError::Other(format!(
                "api returned status {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        checkpoint(token)?;

        if Self::is_stale_response(&body) {
            return Ok(ApiOutcome::StaleParam);
        }

        let manifest = match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(json) => extract::manifest_in_json(&json),
            Err(_) => extract::manifest_url(&body),
        };

        match manifest {
            Some(url) => Ok(ApiOutcome::Manifest(url)),
            None => Err(ResolverError::NoManifestFound),
        }
    }
}

enum ApiOutcome {
    Manifest(String),
    StaleParam,
}

#[async_trait]
impl StrategyResolver for SharedParamResolver {
    fn method(&self) -> ResolveMethod {
        ResolveMethod::SharedParam
    }

    async fn resolve(
        &self,
        video_url: &str,
        token: &CancellationToken,
    ) -> Result<String, ResolverError> {
        let param = self.ensure_param(video_url, token).await?;

        match self.call_api(&param, video_url, token).await? {
            ApiOutcome::Manifest(url) => Ok(url),
            ApiOutcome::StaleParam => {
                // One refresh-and-retry; a second stale answer means the
                // upstream is rejecting us for another reason.
                warn!("api rejected the shared parameter, refreshing once");
                self.state.invalidate();
                let fresh = self.refresh(video_url, token).await?;
                match self.call_api(&fresh, video_url, token).await? {
                    ApiOutcome::Manifest(url) => Ok(url),
                    ApiOutcome::StaleParam => Err(ResolverError::ParamUnavailable(
                        "api rejected a freshly acquired parameter".to_string(),
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_in(dir: &TempDir) -> SharedParamState {
        SharedParamState::load(dir.path().join("shared_param.json"))
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir);
        assert!(state.current().is_none());
        assert!(state.current_any_age().is_none());
    }

    #[test]
    fn store_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir);
        state.store(SharedParam::scraped(
            "0123456789abcdef0123456789abcdef".to_string(),
        ));

        let reloaded = state_in(&dir);
        assert_eq!(
            reloaded.current().unwrap().value,
            "0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn expired_param_is_filtered_but_kept_as_last_resort() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir).with_max_age_secs(60);
        let mut param = SharedParam::scraped("0123456789abcdef0123456789abcdef".to_string());
        param.refreshed_at = Utc::now() - chrono::Duration::hours(2);
        state.store(param);

        assert!(state.current().is_none());
        assert!(state.current_any_age().is_some());
    }

    #[test]
    fn stale_markers_detected() {
        assert!(SharedParamResolver::is_stale_response(
            "请联系QQ获取最新地址"
        ));
        assert!(!SharedParamResolver::is_stale_response(
            r#"{"url":"https://x/y.m3u8"}"#
        ));
    }

    #[test]
    fn capture_output_defaults() {
        let parsed: CaptureOutput =
            serde_json::from_str(r#"{"param":"ABCDEF0123456789abcdef0123456789"}"#).unwrap();
        assert_eq!(parsed.s1ig, DEFAULT_S1IG);
        assert_eq!(parsed.g, "");
    }

    #[test]
    fn api_request_carries_all_query_values() {
        let dir = TempDir::new().unwrap();
        let resolver = SharedParamResolver::new(
            "https://gw.example.com/play.html?src=",
            "https://api.example.com/api/v/",
            reqwest::Client::new(),
            Arc::new(state_in(&dir)),
            None,
        );
        let param = SharedParam::scraped("0123456789abcdef0123456789abcdef".to_string());
        let url = resolver.api_request(&param, "https://video.example.com/v_1.html");
        assert_eq!(
            url,
            "https://api.example.com/api/v/?z=0123456789abcdef0123456789abcdef&jx=https://video.example.com/v_1.html&s1ig=11397&g="
        );
    }
}
