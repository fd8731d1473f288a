use anyhow::{Context, Result};
use clap::Parser;
use signage_backend::config::SignageConfig;
use signage_backend::context::WeatherCollector;
use signage_backend::controller::{Controller, HttpGenerationClient};
use tracing_subscriber::EnvFilter;

/// Periodically renders a new signage image from the current weather.
#[derive(Parser, Debug)]
#[command(name = "signage_controller")]
struct Args {
    /// Seconds between generations (never less than 60)
    #[arg(long, default_value_t = 900)]
    interval: u64,

    /// Run one cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,signage_backend=debug")),
        )
        .init();

    let args = Args::parse();
    let config = SignageConfig::load();
    tracing::info!(
        "Controller for {} talking to {} (state in {})",
        config.location.city,
        config.api_base,
        config.state_dir
    );

    let controller = Controller::new(
        WeatherCollector::new(config.location.clone()),
        HttpGenerationClient::new(config.api_base.clone()),
        config.generation.clone(),
        &config.state_dir,
    )
    .context("failed to set up controller")?;

    if args.once {
        let record = controller.run_once().await?;
        tracing::info!("Wrote {:?} ({})", controller.state_path(), record.result.url);
        return Ok(());
    }

    controller.run_loop(args.interval).await;
    Ok(())
}
