//! Main entry point for the forge gateway harness
//!
//! Connects the configured instance pool and keeps it alive until ctrl-c.
//! The chat-platform command surface drives the same client through the
//! library API.

use std::sync::Arc;

use forge_gateway::{config::Settings, GenerationClient, HookManager};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    if settings.logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("Starting forge gateway");
    settings.validate()?;

    let hooks = Arc::new(HookManager::new());
    let client = GenerationClient::new(&settings, hooks);
    client.connect().await?;

    for instance in client.instances() {
        info!(
            instance = %instance.base_url(),
            connected = instance.is_connected(),
            weight = instance.weight(),
            "Pool member"
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    client.close().await;

    Ok(())
}
