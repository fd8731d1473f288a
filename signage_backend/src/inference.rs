//! Generation service: turns a [`GenerationRequest`] into a PNG on disk plus
//! the metadata the HTTP layer and the controller report.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OnceCell};

use crate::model::{Device, ModelKey};
use crate::pipeline::{DiffusionPipeline, PipelineLoader, PipelineParams};

const PLACEHOLDER_RGB: [u8; 3] = [32, 32, 32];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default, deserialize_with = "lenient_model_key")]
    pub model_key: ModelKey,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance")]
    pub guidance: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_safety")]
    pub safety: bool,
}

fn default_dimension() -> u32 {
    512
}

fn default_steps() -> u32 {
    28
}

fn default_guidance() -> f32 {
    7.0
}

fn default_safety() -> bool {
    true
}

/// Unknown or missing model keys coerce to the default instead of failing
/// the request.
fn lenient_model_key<'de, D>(deserializer: D) -> Result<ModelKey, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .as_deref()
        .map(ModelKey::parse_or_default)
        .unwrap_or_default())
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            model_key: ModelKey::default(),
            width: default_dimension(),
            height: default_dimension(),
            steps: default_steps(),
            guidance: default_guidance(),
            seed: None,
            device: None,
            safety: default_safety(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    pub latency_sec: f64,
    pub device: Device,
    pub model_key: ModelKey,
    pub nsfw_blocked: bool,
    pub path: String,
    pub filename: String,
}

/// JSON body of the generate endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub url: String,
    #[serde(flatten)]
    pub metadata: GenerationMetadata,
}

impl GenerationResponse {
    pub fn from_metadata(metadata: GenerationMetadata) -> Self {
        Self {
            url: format!("/outputs/{}", metadata.filename),
            metadata,
        }
    }
}

/// Process-wide owner of loaded pipelines and the auto-detected device.
///
/// Load-or-fetch runs under one lock, so concurrent first requests for a
/// model wait for a single load. Pipelines are never evicted.
pub struct PipelineRegistry {
    loader: Arc<dyn PipelineLoader>,
    pipelines: Mutex<HashMap<ModelKey, Arc<dyn DiffusionPipeline>>>,
    auto_device: OnceCell<Device>,
}

impl PipelineRegistry {
    pub fn new(loader: Arc<dyn PipelineLoader>) -> Self {
        Self {
            loader,
            pipelines: Mutex::new(HashMap::new()),
            auto_device: OnceCell::new(),
        }
    }

    /// A recognized explicit device wins; otherwise the runtime is probed
    /// once and that answer is reused for every model.
    pub async fn resolve_device(&self, preference: Option<&str>) -> Device {
        if let Some(device) = preference.and_then(Device::parse) {
            return device;
        }
        *self
            .auto_device
            .get_or_init(|| async { self.loader.detect_device().await })
            .await
    }

    pub async fn pipeline(
        &self,
        model_key: ModelKey,
        device: Device,
    ) -> Result<Arc<dyn DiffusionPipeline>> {
        let mut pipelines = self.pipelines.lock().await;
        if let Some(pipeline) = pipelines.get(&model_key) {
            return Ok(pipeline.clone());
        }

        let pipeline = self
            .loader
            .load(model_key, device)
            .await
            .with_context(|| format!("Failed to load pipeline for {}", model_key))?;
        pipelines.insert(model_key, pipeline.clone());
        Ok(pipeline)
    }

    pub async fn loaded_models(&self) -> Vec<ModelKey> {
        let pipelines = self.pipelines.lock().await;
        let mut keys: Vec<ModelKey> = pipelines.keys().copied().collect();
        keys.sort_by_key(|key| key.as_str());
        keys
    }
}

pub struct GenerationService {
    registry: PipelineRegistry,
    output_dir: PathBuf,
    device_override: Option<String>,
}

impl GenerationService {
    /// Creates the output directory if needed and stores it as an absolute path.
    pub fn new(
        loader: Arc<dyn PipelineLoader>,
        output_dir: impl AsRef<Path>,
        device_override: Option<String>,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;
        let output_dir = std::fs::canonicalize(output_dir)
            .with_context(|| format!("Failed to resolve output directory {:?}", output_dir))?;

        Ok(Self {
            registry: PipelineRegistry::new(loader),
            output_dir,
            device_override,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<(PathBuf, GenerationMetadata)> {
        let preference = request
            .device
            .as_deref()
            .or(self.device_override.as_deref());
        let device = self.registry.resolve_device(preference).await;
        let pipeline = self.registry.pipeline(request.model_key, device).await?;

        if !request.safety && pipeline.safety_checker_enabled() {
            // Shared pipeline: later requests for this model lose the checker too.
            tracing::warn!(
                "Disabling safety checker on cached {} pipeline for the rest of the process",
                request.model_key
            );
            pipeline.disable_safety_checker();
        }

        let params = PipelineParams {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone().unwrap_or_default(),
            width: request.width,
            height: request.height,
            steps: request.steps,
            guidance: request.guidance,
            seed: request.seed.unwrap_or_else(random_seed),
        };

        let started = Instant::now();
        let output = pipeline.generate(&params).await?;
        let latency = started.elapsed().as_secs_f64();

        let filename = output_filename(
            &chrono::Local::now().naive_local(),
            request.model_key,
            request.width,
            request.height,
        );
        let path = self.output_dir.join(&filename);
        let nsfw = output.nsfw_content_detected;

        let image = if nsfw {
            tracing::warn!("NSFW content detected; saving placeholder {}", filename);
            placeholder(request.width, request.height)
        } else {
            fit_to_request(output.image, request.width, request.height)
        };
        save_png(image, path.clone()).await?;

        tracing::info!(
            "Generated {} with {} on {} in {:.3}s",
            filename,
            request.model_key,
            device,
            latency
        );

        let metadata = GenerationMetadata {
            latency_sec: round_millis(latency),
            device,
            model_key: request.model_key,
            nsfw_blocked: nsfw,
            path: path.to_string_lossy().to_string(),
            filename,
        };
        Ok((path, metadata))
    }
}

/// `{timestamp}_{model}_{W}x{H}.png`; repeated identical calls within one
/// second overwrite each other.
pub fn output_filename(
    timestamp: &NaiveDateTime,
    model_key: ModelKey,
    width: u32,
    height: u32,
) -> String {
    format!(
        "{}_{}_{}x{}.png",
        timestamp.format("%Y%m%d-%H%M%S"),
        model_key,
        width,
        height
    )
}

fn placeholder(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(PLACEHOLDER_RGB)))
}

/// Backends may round dimensions (ComfyUI latents are width/8 x height/8);
/// the saved file always has the requested size.
fn fit_to_request(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if image.width() == width && image.height() == height {
        return image;
    }
    tracing::debug!(
        "Resizing backend output {}x{} to requested {}x{}",
        image.width(),
        image.height(),
        width,
        height
    );
    image.resize_exact(width, height, FilterType::Lanczos3)
}

async fn save_png(image: DynamicImage, path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        image
            .save_with_format(&path, ImageFormat::Png)
            .with_context(|| format!("Failed to write image to {:?}", path))
    })
    .await
    .context("Image writer task panicked")?
}

fn random_seed() -> u64 {
    uuid::Uuid::new_v4().as_u128() as u64
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}
