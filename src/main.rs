use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ioc_exchange::api::{self, AppState};
use ioc_exchange::cache::IocCache;
use ioc_exchange::config::Settings;
use ioc_exchange::db::PostgresThreatStore;
use ioc_exchange::enrichment::{GeoEnricher, ReputationClient};
use ioc_exchange::workers::IocProcessor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Arc::new(Settings::from_env()?);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let cache = Arc::new(IocCache::connect(settings.redis_url.as_deref()).await);
    let store = Arc::new(PostgresThreatStore::connect_lazy(&settings.database_url)?);
    let reputation = Arc::new(ReputationClient::new(
        settings.reputation_api_url.clone(),
        settings.reputation_api_key.clone(),
        settings.reputation_daily_limit,
        cache.clone(),
        settings.reputation_cache_ttl(),
    )?);
    let geo = Arc::new(GeoEnricher::with_default_providers(
        settings.geo_request_delay(),
        cache.clone(),
        settings.geo_cache_ttl(),
    )?);

    let processor = Arc::new(IocProcessor::new(
        store,
        reputation,
        geo,
        cache.clone(),
        settings.clone(),
    )?);

    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    tokio::spawn(processor.clone().run(trigger_rx));

    let state = Arc::new(AppState {
        settings: settings.clone(),
        cache,
        collections: api::default_collections(),
        processor,
        rebuild_trigger: trigger_tx,
    });

    let app = api::router(state);
    let addr: SocketAddr = format!("{}:{}", settings.listen_addr, settings.listen_port).parse()?;
    info!(%addr, "ioc-exchange listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
