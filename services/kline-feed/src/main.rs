use std::sync::Arc;

use kline_feed::api::{create_router, ApiState};
use kline_feed::{FeedConfig, FeedEngine, RestKlineFetcher, WsConnector};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = FeedConfig::from_env()?;
    tracing::info!(
        version = kline_feed::SERVICE_VERSION,
        symbol = %config.symbol,
        stream = %config.stream_url(),
        "Starting kline feed service"
    );

    let fetcher = Arc::new(RestKlineFetcher::new(&config)?);
    let listen_addr = config.listen_addr;
    let mut engine = FeedEngine::new(config, fetcher, Arc::new(WsConnector)).start();

    let app = create_router(ApiState::new(engine.view()));
    let listener = TcpListener::bind(listen_addr).await?;

    tracing::info!("Listening on {}", listen_addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    engine.stop().await;
    served?;

    Ok(())
}
