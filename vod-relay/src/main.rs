use vod_relay::{AppConfig, ServiceContainer, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let _guard = logging::init_logging(&config.log_dir)?;

    let Some(video_url) = std::env::args().nth(1) else {
        eprintln!("usage: vod-relay <video-url>");
        std::process::exit(2);
    };

    let services = ServiceContainer::build(config).await?;

    match services.orchestrator.resolve(&video_url).await {
        Ok(resolution) => {
            println!("{}", serde_json::to_string_pretty(&resolution)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, url = %video_url, "resolution failed");
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
