use anyhow::{Context, Result};
use signage_backend::config::SignageConfig;
use signage_backend::server::serve_generation_api;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,signage_backend=debug")),
        )
        .init();

    let config = SignageConfig::load();
    tracing::info!(
        "Starting signage generation API (bind via SIGNAGE_BIND, ComfyUI at {})",
        config.comfyui.api_url
    );

    let runtime = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    runtime.block_on(serve_generation_api(config))
}
