use anyhow::{Context, Result};
use flume::{Receiver, Sender};
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Duration};

use signage_backend::config::SignageConfig;
use signage_backend::controller::{load_cycle_record, CycleRecord, STATE_FILE_NAME};
use signage_backend::http_client::build_http_client_with_timeout;

pub const NO_IMAGE_MESSAGE: &str =
    "No image yet. Click Generate in controller or wait for next cycle.";

const IMAGE_FETCH_TIMEOUT_SECS: u64 = 30;

/// What the background poller hands the window after each look at the state file.
#[derive(Debug, Clone)]
pub enum DisplayEvent {
    Updated(Snapshot),
    Empty,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub record: CycleRecord,
    /// Identifies the image so the window only re-uploads a texture when it changes
    pub image_key: String,
    pub image: Option<Vec<u8>>,
    pub subtitle: String,
}

/// Reads the controller's state file and fetches the image it points at.
#[derive(Clone)]
pub struct DisplayClient {
    http: reqwest::Client,
    api_base: String,
    state_path: PathBuf,
}

impl DisplayClient {
    pub fn from_config(config: &SignageConfig) -> Self {
        Self::new(
            &config.api_base,
            Path::new(&config.state_dir).join(STATE_FILE_NAME),
        )
    }

    pub fn new(api_base: &str, state_path: PathBuf) -> Self {
        Self {
            http: build_http_client_with_timeout(Some(Duration::from_secs(
                IMAGE_FETCH_TIMEOUT_SECS,
            ))),
            api_base: normalize_base_url(api_base),
            state_path,
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub async fn load_snapshot(&self) -> DisplayEvent {
        let record = match load_cycle_record(&self.state_path) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!("No displayable state: {:#}", e);
                return DisplayEvent::Empty;
            }
        };

        let url = resolve_image_url(&record.result.url, &self.api_base);
        let image = match self.fetch_image(&url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("{:#}; trying local file {}", e, record.result.metadata.path);
                match tokio::fs::read(&record.result.metadata.path).await {
                    Ok(bytes) => Some(bytes),
                    Err(local) => {
                        tracing::warn!(
                            "Local image {} unreadable: {}",
                            record.result.metadata.path,
                            local
                        );
                        None
                    }
                }
            }
        };

        DisplayEvent::Updated(Snapshot {
            image_key: format!("{}@{}", url, record.timestamp),
            subtitle: format_subtitle(&record),
            image,
            record,
        })
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?
            .error_for_status()
            .with_context(|| format!("GET {} failed", url))?
            .bytes()
            .await
            .context("Failed to read image body")?;
        Ok(bytes.to_vec())
    }

    /// Poll until the window goes away. A message on `refresh_rx` triggers an
    /// immediate reload.
    pub async fn poll_forever(
        self,
        event_tx: Sender<DisplayEvent>,
        refresh_rx: Receiver<()>,
        every: Duration,
    ) {
        loop {
            let event = self.load_snapshot().await;
            if event_tx.send(event).is_err() {
                break;
            }
            tokio::select! {
                _ = sleep(every) => {}
                trigger = refresh_rx.recv_async() => {
                    if trigger.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Display poller stopped");
    }
}

/// Relative URLs (as returned by the generate endpoint) are served by the API.
pub fn resolve_image_url(url: &str, api_base: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("{}{}", normalize_base_url(api_base), url)
    }
}

pub fn format_subtitle(record: &CycleRecord) -> String {
    let meta = &record.result.metadata;
    format!(
        "Model: {} | Latency: {}s | Device: {} | NSFW blocked: {}\nPrompt: {}\nCondition: {} | Temp: {}°C",
        meta.model_key,
        meta.latency_sec,
        meta.device,
        meta.nsfw_blocked,
        record.prompt,
        record.context.condition,
        record.context.temp_c
    )
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8000".to_string()
    } else {
        trimmed.to_string()
    }
}
