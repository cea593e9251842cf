mod config;
mod routes;
mod state;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use keepsake_contracts::events::Notifier;
use keepsake_contracts::tasks::TaskRegistry;
use keepsake_engine::generate::OpenAiImages;
use keepsake_engine::pipeline::Pipeline;
use keepsake_engine::store::{ArtifactStore, UploadStore};
use keepsake_engine::vision::AnthropicVision;

use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let state = build_state(&config)?;
    let app = routes::router(state, config.public_dir.clone());

    let addr = ("0.0.0.0", config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, "listening");
    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}

fn build_state(config: &ServerConfig) -> Result<AppState> {
    let registry = Arc::new(TaskRegistry::new());
    let notifier = Notifier::default();
    let analyzer = Arc::new(AnthropicVision::new(&config.anthropic_api_key)?);
    let generator = Arc::new(OpenAiImages::new(&config.openai_api_key)?);
    let artifacts = ArtifactStore::new(&config.public_dir)?;
    let uploads = Arc::new(UploadStore::new(&config.upload_dir)?);
    let pipeline = Arc::new(Pipeline::new(
        analyzer,
        generator,
        registry.clone(),
        notifier.clone(),
        artifacts,
        config.card_caption.clone(),
    ));
    Ok(AppState {
        registry,
        notifier,
        pipeline,
        uploads,
    })
}
