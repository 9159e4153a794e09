//! Service wiring.
//!
//! Builds the pools, repositories, strategies and orchestrator from an
//! [`AppConfig`]. Strategies whose endpoints are unconfigured simply drop
//! out of the race order.

use crate::config::AppConfig;
use crate::database::repositories::{CredentialRepository, ParseCacheRepository};
use crate::database::{self, DbPool, WritePool};
use crate::orchestrator::Orchestrator;
use manifest_fix::ArtifactStore;
use resolvers::{
    CommandCapture, DerivationResolver, PaidKeyResolver, SharedParamResolver, SharedParamState,
    StrategyResolver,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ServiceContainer {
    pub config: AppConfig,
    pub read_pool: DbPool,
    pub write_pool: WritePool,
    pub credentials: Arc<CredentialRepository>,
    pub orchestrator: Arc<Orchestrator>,
}

impl ServiceContainer {
    pub async fn build(config: AppConfig) -> crate::Result<Self> {
        let read_pool = database::init_pool(&config.database_url).await?;
        let write_pool = database::init_write_pool(&config.database_url).await?;
        database::run_migrations(&read_pool).await?;

        let credentials = Arc::new(CredentialRepository::new(
            read_pool.clone(),
            write_pool.clone(),
        ));
        credentials.deactivate_expired().await?;

        let cache = ParseCacheRepository::new(
            read_pool.clone(),
            write_pool.clone(),
            config.cache_ttl_secs,
        );
        cache.purge_expired().await?;

        resolvers::install_tls_provider();
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()?;

        let mut strategies: Vec<Arc<dyn StrategyResolver>> = Vec::new();

        if !config.paid_endpoint.is_empty() {
            strategies.push(Arc::new(
                PaidKeyResolver::new(
                    config.paid_endpoint.clone(),
                    client.clone(),
                    credentials.clone(),
                )?
                .with_max_retries(config.paid_max_retries),
            ));
        }

        if !config.shared_api_url.is_empty() && !config.shared_gateway_url.is_empty() {
            if let Some(parent) = std::path::Path::new(&config.shared_param_file).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let state = Arc::new(
                SharedParamState::load(&config.shared_param_file)
                    .with_max_age_secs(config.shared_param_max_age_secs),
            );
            let capture = config
                .capture_parts()
                .map(|(program, args)| {
                    Arc::new(CommandCapture::new(program, args)) as Arc<dyn resolvers::BrowserCapture>
                });
            strategies.push(Arc::new(SharedParamResolver::new(
                config.shared_gateway_url.clone(),
                config.shared_api_url.clone(),
                client.clone(),
                state,
                capture,
            )));
        }

        if !config.derive_gateway_url.is_empty() {
            strategies.push(Arc::new(
                DerivationResolver::new(config.derive_gateway_url.clone(), client.clone())?
                    .with_max_hops(config.derive_max_hops),
            ));
        }

        info!(
            strategies = strategies.len(),
            "service container built"
        );

        let artifacts = Arc::new(ArtifactStore::new(
            client,
            &config.artifact_dir,
            &config.public_base_url,
        )?);

        let orchestrator = Arc::new(Orchestrator::new(
            strategies,
            cache,
            artifacts,
            Duration::from_millis(config.stage_window_ms),
        ));

        Ok(Self {
            config,
            read_pool,
            write_pool,
            credentials,
            orchestrator,
        })
    }
}
