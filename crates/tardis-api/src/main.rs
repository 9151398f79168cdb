//! TARDIS REST API server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tardis_api::config::TardisConfig;
use tardis_api::server::{self, AppState};
use tardis_llm::{FallbackManager, OpenAiCompatibleProvider};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = TardisConfig::from_env();
    let together = Arc::new(OpenAiCompatibleProvider::from_env());
    let llm = FallbackManager::new(together)
        .with_strategies(FallbackManager::default_strategies(
            cfg.fallback_model.clone(),
            &[],
        ))
        .with_timeout(Duration::from_secs(60));

    let state = Arc::new(AppState::open(&cfg, llm).await?);
    let flusher = Arc::clone(&state.usage).spawn_flusher(cfg.usage_flush_interval);
    let maintenance = server::spawn_maintenance(Arc::clone(&state), Duration::from_secs(3600));

    let app = server::router(Arc::clone(&state));
    let addr: SocketAddr = cfg.listen.parse()?;
    tracing::info!(data_dir = %cfg.data_dir.display(), "TARDIS API listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .await?;

    flusher.abort();
    maintenance.abort();
    state.usage.flush().await?;
    Ok(())
}
