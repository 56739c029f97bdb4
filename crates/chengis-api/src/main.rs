//! Chengis server.

use chengis_api::{System, routes};
use chengis_config::SystemConfig;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SystemConfig::from_env();
    let listen_addr = config.listen_addr.clone();

    info!("assembling system");
    let system = System::start(config).await?;

    let app = routes::router(system.state.clone()).layer(TraceLayer::new_for_http());

    info!(addr = %listen_addr, "starting server");
    let listener = TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    system.shutdown().await;
    Ok(())
}
