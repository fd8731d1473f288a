//! One signage cycle: collect context, compose a prompt, ask the generation
//! API for an image and persist the outcome for the display client.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::composer::compose_prompt;
use crate::config::GenerationDefaults;
use crate::context::{Context, ContextSource};
use crate::http_client::build_http_client_with_timeout;
use crate::inference::{GenerationRequest, GenerationResponse};

pub const STATE_FILE_NAME: &str = "current.json";
pub const MIN_INTERVAL_SECS: u64 = 60;
const GENERATE_TIMEOUT_SECS: u64 = 900;

/// Snapshot of the latest cycle. Overwritten every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub context: Context,
    pub prompt: String,
    pub negative: String,
    pub result: GenerationResponse,
    /// Unix seconds
    pub timestamp: i64,
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

/// Talks to a running generation server over HTTP.
pub struct HttpGenerationClient {
    client: Client,
    api_base: String,
}

impl HttpGenerationClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            client: build_http_client_with_timeout(Some(Duration::from_secs(
                GENERATE_TIMEOUT_SECS,
            ))),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let url = format!("{}/generate", self.api_base);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .error_for_status()
            .context("Generation API returned an error status")?;

        response
            .json::<GenerationResponse>()
            .await
            .context("Failed to parse generation response")
    }
}

pub struct Controller<S, C> {
    source: S,
    client: C,
    defaults: GenerationDefaults,
    state_dir: PathBuf,
}

impl<S: ContextSource, C: GenerationClient> Controller<S, C> {
    pub fn new(
        source: S,
        client: C,
        defaults: GenerationDefaults,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory {:?}", state_dir))?;
        Ok(Self {
            source,
            client,
            defaults,
            state_dir,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE_NAME)
    }

    pub async fn run_once(&self) -> Result<CycleRecord> {
        let context = self.source.collect().await;
        let composed = compose_prompt(&context);
        tracing::info!(
            "Cycle for {}: {} at {:.1}°C, hour {} -> {}",
            context.city,
            context.condition,
            context.temp_c,
            context.hour,
            composed.model_key
        );

        let request = GenerationRequest {
            negative_prompt: Some(composed.negative_prompt.clone()),
            model_key: composed.model_key,
            width: self.defaults.width,
            height: self.defaults.height,
            steps: self.defaults.steps,
            guidance: self.defaults.guidance,
            safety: self.defaults.safety,
            ..GenerationRequest::new(composed.prompt.clone())
        };

        let result = self.client.generate(&request).await?;
        tracing::debug!(
            "Generated {} in {}s on {}",
            result.metadata.filename,
            result.metadata.latency_sec,
            result.metadata.device
        );

        let record = CycleRecord {
            context,
            prompt: composed.prompt,
            negative: composed.negative_prompt,
            result,
            timestamp: chrono::Utc::now().timestamp(),
        };
        write_cycle_record(&self.state_path(), &record).await?;
        Ok(record)
    }

    /// Runs cycles forever. A failed cycle is logged and the next one still
    /// happens after the usual pause.
    pub async fn run_loop(&self, interval_secs: u64) {
        let pause = Duration::from_secs(interval_secs.max(MIN_INTERVAL_SECS));
        loop {
            match self.run_once().await {
                Ok(record) => tracing::info!("Cycle done: {}", record.result.url),
                Err(e) => tracing::error!("Controller cycle failed: {:#}", e),
            }
            tokio::time::sleep(pause).await;
        }
    }
}

/// Replace the state file in one step so readers never see a partial write.
pub async fn write_cycle_record(path: &Path, record: &CycleRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record).context("Failed to serialize cycle record")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {:?} into place", tmp))?;
    Ok(())
}

pub fn load_cycle_record(path: &Path) -> Result<CycleRecord> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
}
