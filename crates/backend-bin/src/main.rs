use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use backend_lib::{
    auth::FingerprintProvider,
    bridge::{FanoutBridge, MemoryBridge, RedisBridge},
    config::Settings,
    storage::FlatFileStore,
    ws_router, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load()?;

    let store = Arc::new(FlatFileStore::new(&settings.data_dir)?);

    let bridge: Arc<dyn FanoutBridge> = match &settings.redis_url {
        Some(url) => {
            info!(url = %url, "using redis fan-out bridge");
            Arc::new(RedisBridge::connect(url).await?)
        }
        None => {
            info!("no redis url configured, using in-memory fan-out bridge");
            Arc::new(MemoryBridge::new())
        }
    };

    let identity = Arc::new(FingerprintProvider::new(settings.fingerprint_salt.clone()));

    let bind_addr = settings.bind_addr;
    let state = AppState::new(settings, store, bridge, identity);
    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(bind_addr).await?;
    info!("listening on {bind_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
