//! Resolution orchestration.
//!
//! A request flows: normalize the URL, consult the cache, run the staged
//! strategy race, store the winning manifest as a local artifact, cache the
//! result. Strategies are ordered cheapest-first; the first gets a head
//! start, the second joins if the first is slow, the last runs only after
//! both have failed.

use crate::database::repositories::ParseCacheRepository;
use manifest_fix::ArtifactStore;
use resolvers::{ResolveMethod, ResolverError, StrategyResolver};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid video URL: {0}")]
    InvalidUrl(String),

    #[error("All resolution strategies failed")]
    Exhausted,

    #[error("Database error: {0}")]
    Database(#[from] crate::Error),
}

/// A completed resolution, as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    /// Local artifact URL, or the remote manifest URL when storage failed.
    pub manifest_ref: String,
    pub method: ResolveMethod,
    pub cached: bool,
}

/// Normalize a raw video URL.
///
/// Multi-part listings concatenate episode URLs with `$` separators; only
/// the first URL resolves. Validation is purely syntactic, no network.
pub fn normalize_video_url(raw: &str) -> Result<String, ResolveError> {
    let mut s = raw.trim();

    for marker in ["$http://", "$https://"] {
        if let Some(pos) = s.find(marker) {
            s = &s[..pos];
        }
    }
    let s = s.trim_end_matches('/');

    let parsed =
        url::Url::parse(s).map_err(|_| ResolveError::InvalidUrl(raw.trim().to_owned()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ResolveError::InvalidUrl(raw.trim().to_owned()));
    }
    Ok(s.to_owned())
}

fn spawn_strategy(
    strategy: &Arc<dyn StrategyResolver>,
    video_url: &str,
    token: &CancellationToken,
) -> JoinHandle<(ResolveMethod, Result<String, ResolverError>)> {
    let strategy = Arc::clone(strategy);
    let video_url = video_url.to_owned();
    let token = token.clone();
    tokio::spawn(async move {
        let method = strategy.method();
        (method, strategy.resolve(&video_url, &token).await)
    })
}

fn settle(
    joined: Result<(ResolveMethod, Result<String, ResolverError>), tokio::task::JoinError>,
) -> Option<(ResolveMethod, String)> {
    match joined {
        Ok((method, Ok(url))) => Some((method, url)),
        Ok((method, Err(e))) => {
            debug!(%method, error = %e, "strategy failed");
            None
        }
        Err(e) => {
            warn!(error = %e, "strategy task panicked");
            None
        }
    }
}

/// Run every strategy after `start` to completion, one at a time.
async fn run_sequential(
    strategies: &[Arc<dyn StrategyResolver>],
    start: usize,
    video_url: &str,
    token: &CancellationToken,
) -> Option<(ResolveMethod, String)> {
    for strategy in &strategies[start.min(strategies.len())..] {
        let method = strategy.method();
        match strategy.resolve(video_url, token).await {
            Ok(url) => return Some((method, url)),
            Err(e) => debug!(%method, error = %e, "strategy failed"),
        }
    }
    None
}

/// The staged race over an ordered strategy list.
///
/// Stage one runs alone for `window`. If it fails inside the window the
/// remaining strategies run sequentially; if it is merely slow, stage two
/// starts alongside it and the first success of the pair wins. The token is
/// cancelled as soon as a winner exists, so losers stop at their next
/// checkpoint instead of finishing doomed requests.
pub async fn race_strategies(
    strategies: &[Arc<dyn StrategyResolver>],
    video_url: &str,
    window: Duration,
    token: &CancellationToken,
) -> Option<(ResolveMethod, String)> {
    let Some(first) = strategies.first() else {
        return None;
    };

    let mut first_handle = spawn_strategy(first, video_url, token);
    let winner = match tokio::time::timeout(window, &mut first_handle).await {
        Ok(joined) => match settle(joined) {
            Some(win) => Some(win),
            None => run_sequential(strategies, 1, video_url, token).await,
        },
        Err(_) => {
            debug!(window_ms = window.as_millis() as u64, "stage window elapsed");
            if strategies.len() < 2 {
                return settle(first_handle.await).inspect(|_| token.cancel());
            }

            let mut second_handle = spawn_strategy(&strategies[1], video_url, token);
            let mut first_done = false;
            let mut second_done = false;
            let mut win = None;
            while !(first_done && second_done) {
                tokio::select! {
                    joined = &mut first_handle, if !first_done => {
                        first_done = true;
                        if let Some(w) = settle(joined) {
                            win = Some(w);
                            break;
                        }
                    }
                    joined = &mut second_handle, if !second_done => {
                        second_done = true;
                        if let Some(w) = settle(joined) {
                            win = Some(w);
                            break;
                        }
                    }
                }
            }

            match win {
                Some(w) => Some(w),
                None => run_sequential(strategies, 2, video_url, token).await,
            }
        }
    };

    if winner.is_some() {
        token.cancel();
    }
    winner
}

pub struct Orchestrator {
    strategies: Vec<Arc<dyn StrategyResolver>>,
    cache: ParseCacheRepository,
    artifacts: Arc<ArtifactStore>,
    stage_window: Duration,
}

impl Orchestrator {
    pub fn new(
        strategies: Vec<Arc<dyn StrategyResolver>>,
        cache: ParseCacheRepository,
        artifacts: Arc<ArtifactStore>,
        stage_window: Duration,
    ) -> Self {
        Self {
            strategies,
            cache,
            artifacts,
            stage_window,
        }
    }

    pub async fn resolve(&self, raw_url: &str) -> Result<Resolution, ResolveError> {
        let video_url = normalize_video_url(raw_url)?;

        if let Some(entry) = self.cache.get(&video_url).await?
            && let Ok(method) = ResolveMethod::from_str(&entry.method)
        {
            info!(url = %video_url, %method, hits = entry.hit_count, "cache hit");
            return Ok(Resolution {
                manifest_ref: entry.manifest_ref,
                method,
                cached: true,
            });
        }

        let token = CancellationToken::new();
        let Some((method, manifest_url)) =
            race_strategies(&self.strategies, &video_url, self.stage_window, &token).await
        else {
            return Err(ResolveError::Exhausted);
        };
        info!(url = %video_url, %method, manifest = %manifest_url, "resolved");

        // Degrade to the remote manifest URL when local storage fails; the
        // resolution itself still succeeded.
        let manifest_ref = match self.artifacts.store_manifest(&manifest_url).await {
            Ok(stored) => stored.public_url,
            Err(e) => {
                warn!(error = %e, "artifact storage failed, serving remote manifest url");
                manifest_url
            }
        };

        if let Err(e) = self.cache.put(&video_url, &manifest_ref, method.as_str()).await {
            warn!(error = %e, "failed to cache resolution");
        }

        Ok(Resolution {
            manifest_ref,
            method,
            cached: false,
        })
    }
}
