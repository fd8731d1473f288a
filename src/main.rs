mod api;
mod ui;

use tracing_subscriber::EnvFilter;

use api::DisplayClient;
use signage_backend::config::SignageConfig;
use ui::app::SignageApp;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,signage=debug")),
        )
        .init();

    tracing::info!("Signage display starting...");

    let config = SignageConfig::load();
    let client = DisplayClient::from_config(&config);
    tracing::info!(
        "Watching {:?} (images from {}), refreshing every {}s",
        client.state_path(),
        client.api_base(),
        config.display_refresh_secs
    );

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([800.0, 900.0])
            .with_title("Generative Signage"),
        ..Default::default()
    };

    let refresh_secs = config.display_refresh_secs;
    if let Err(e) = eframe::run_native(
        "Generative Signage",
        native_options,
        Box::new(move |_cc| Ok(Box::new(SignageApp::new(client, refresh_secs)?))),
    ) {
        tracing::error!("UI error: {}", e);
        std::process::exit(1);
    }
}
