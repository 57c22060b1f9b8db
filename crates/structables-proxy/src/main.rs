//! Structables asset proxy
//!
//! Streams images and files from the Instructables CDN to the front-end,
//! keeping a size-bounded copy of each asset on local disk.

use std::sync::Arc;
use structables_proxy::{
    start_server, AssetProxy, Config, Result, ServerState, SharedState,
};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("structables_proxy=info".parse()?)
        .add_directive("asset_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Structables asset proxy...");

    let config = Config::from_env();
    info!("Listen: {}:{}", config.listen_host, config.port);
    info!("Cache enabled: {}", config.cache_enabled);
    if config.cache_enabled {
        info!("Cache dir: {:?}", config.cache.dir);
        info!("Max cache size: {} MB", config.cache.max_size / (1024 * 1024));
        info!("Cache max age: {} seconds", config.cache.max_age.as_secs());
        info!(
            "Cache cleanup interval: {} seconds",
            config.cache.cleanup_interval.as_secs()
        );
    }

    let proxy = AssetProxy::from_config(&config).await?;
    let state: SharedState = Arc::new(ServerState::new(proxy));

    start_server(state, &config.listen_host, config.port).await?;

    Ok(())
}
