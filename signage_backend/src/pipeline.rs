//! The seam between the generation service and whatever actually runs the
//! diffusion model. Production uses a ComfyUI server; tests use an in-process
//! fake.

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::comfy_client::ComfyUIClient;
use crate::comfy_workflow::{ComfyWorkflow, WorkflowInputs};
use crate::config::{ComfyUIConfig, ModelIds};
use crate::model::{Device, ModelKey};

/// Fully resolved sampling parameters for one image
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f32,
    pub seed: u64,
}

pub struct PipelineOutput {
    pub image: DynamicImage,
    pub nsfw_content_detected: bool,
}

/// A loaded model, ready to render.
#[async_trait]
pub trait DiffusionPipeline: Send + Sync {
    async fn generate(&self, params: &PipelineParams) -> Result<PipelineOutput>;

    /// Turn off the model's own NSFW checker. There is no way back: the
    /// pipeline is shared, so this holds for every later request on it.
    fn disable_safety_checker(&self);

    fn safety_checker_enabled(&self) -> bool;
}

/// Loads pipelines and answers which device the runtime computes on.
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(&self, model_key: ModelKey, device: Device) -> Result<Arc<dyn DiffusionPipeline>>;

    async fn detect_device(&self) -> Device;
}

pub struct ComfyPipelineLoader {
    client: Arc<ComfyUIClient>,
    workflow: ComfyWorkflow,
    models: ModelIds,
    sampler: String,
    scheduler: String,
    wait_timeout_secs: u64,
}

impl ComfyPipelineLoader {
    pub fn from_config(comfyui: &ComfyUIConfig, models: &ModelIds) -> Result<Self> {
        let workflow = match comfyui.workflow_path.as_deref() {
            Some(path) => ComfyWorkflow::from_json_file(path)
                .with_context(|| format!("Failed to load ComfyUI workflow {}", path))?,
            None => ComfyWorkflow::txt2img()?,
        };
        tracing::info!(
            "Using ComfyUI at {} with workflow '{}'",
            comfyui.api_url,
            workflow.name
        );

        Ok(Self {
            client: Arc::new(ComfyUIClient::new(comfyui.api_url.clone())),
            workflow,
            models: models.clone(),
            sampler: comfyui.sampler.clone(),
            scheduler: comfyui.scheduler.clone(),
            wait_timeout_secs: comfyui.wait_timeout_secs,
        })
    }
}

#[async_trait]
impl PipelineLoader for ComfyPipelineLoader {
    async fn load(&self, model_key: ModelKey, device: Device) -> Result<Arc<dyn DiffusionPipeline>> {
        let checkpoint = self.models.checkpoint_for(model_key).to_string();

        match self.client.available_checkpoints().await {
            Ok(names) if !names.is_empty() && !names.contains(&checkpoint) => {
                anyhow::bail!(
                    "Checkpoint '{}' for model {} is not available on ComfyUI ({} known)",
                    checkpoint,
                    model_key,
                    names.len()
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Could not verify checkpoint '{}': {:#}", checkpoint, e);
            }
        }

        tracing::info!(
            "Loaded pipeline {} (checkpoint '{}', device {})",
            model_key,
            checkpoint,
            device
        );

        Ok(Arc::new(ComfyPipeline {
            client: self.client.clone(),
            workflow: self.workflow.clone(),
            checkpoint,
            model_key,
            sampler: self.sampler.clone(),
            scheduler: self.scheduler.clone(),
            wait_timeout_secs: self.wait_timeout_secs,
            safety_checker: AtomicBool::new(true),
        }))
    }

    async fn detect_device(&self) -> Device {
        match self.client.system_stats().await {
            Ok(stats) => {
                let detected = stats
                    .devices
                    .iter()
                    .find_map(|d| Device::parse(&d.device_type))
                    .unwrap_or(Device::Cpu);
                tracing::info!("ComfyUI reports compute device {}", detected);
                detected
            }
            Err(e) => {
                tracing::warn!("Device detection failed ({:#}); assuming cpu", e);
                Device::Cpu
            }
        }
    }
}

/// One checkpoint on a ComfyUI server. The server decides where it runs, so
/// the resolved device is only carried for reporting.
pub struct ComfyPipeline {
    client: Arc<ComfyUIClient>,
    workflow: ComfyWorkflow,
    checkpoint: String,
    model_key: ModelKey,
    sampler: String,
    scheduler: String,
    wait_timeout_secs: u64,
    safety_checker: AtomicBool,
}

#[async_trait]
impl DiffusionPipeline for ComfyPipeline {
    async fn generate(&self, params: &PipelineParams) -> Result<PipelineOutput> {
        let inputs = WorkflowInputs {
            checkpoint: &self.checkpoint,
            prompt: &params.prompt,
            negative_prompt: &params.negative_prompt,
            width: params.width,
            height: params.height,
            steps: params.steps,
            cfg: params.guidance,
            seed: params.seed,
            sampler: &self.sampler,
            scheduler: &self.scheduler,
        };
        let graph = self.workflow.prepare_for_execution(&inputs)?;

        let prompt_id = self
            .client
            .queue_prompt(graph)
            .await
            .context("Failed to queue prompt")?;
        tracing::debug!("Queued {} generation: prompt_id={}", self.model_key, prompt_id);

        let completed = self
            .client
            .wait_for_completion(
                &prompt_id,
                Some(self.workflow.output_node_id.as_str()),
                self.wait_timeout_secs,
            )
            .await
            .context("Failed to wait for completion")?;

        let bytes = self
            .client
            .fetch_image(&completed.image)
            .await
            .context("Failed to download generated image")?;
        let image = image::load_from_memory(&bytes).context("ComfyUI returned an undecodable image")?;

        Ok(PipelineOutput {
            image,
            nsfw_content_detected: completed.nsfw_detected && self.safety_checker_enabled(),
        })
    }

    fn disable_safety_checker(&self) {
        self.safety_checker.store(false, Ordering::SeqCst);
    }

    fn safety_checker_enabled(&self) -> bool {
        self.safety_checker.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-in for a diffusion runtime.

    use super::*;
    use image::{Rgb, RgbImage};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::atomic::AtomicUsize;

    pub struct FakeLoader {
        pub detected: Device,
        pub loads: AtomicUsize,
        pub device_probes: AtomicUsize,
        pub nsfw: Arc<AtomicBool>,
        pub fail: Arc<AtomicBool>,
        /// Round output sizes down to multiples of 8, like a latent-space backend
        pub floor_to_latent_grid: Arc<AtomicBool>,
    }

    impl FakeLoader {
        pub fn new(detected: Device) -> Self {
            Self {
                detected,
                loads: AtomicUsize::new(0),
                device_probes: AtomicUsize::new(0),
                nsfw: Arc::new(AtomicBool::new(false)),
                fail: Arc::new(AtomicBool::new(false)),
                floor_to_latent_grid: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl PipelineLoader for FakeLoader {
        async fn load(
            &self,
            model_key: ModelKey,
            device: Device,
        ) -> Result<Arc<dyn DiffusionPipeline>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakePipeline {
                model_key,
                device,
                nsfw: self.nsfw.clone(),
                fail: self.fail.clone(),
                floor_to_latent_grid: self.floor_to_latent_grid.clone(),
                safety_checker: AtomicBool::new(true),
            }))
        }

        async fn detect_device(&self) -> Device {
            self.device_probes.fetch_add(1, Ordering::SeqCst);
            self.detected
        }
    }

    pub struct FakePipeline {
        model_key: ModelKey,
        device: Device,
        nsfw: Arc<AtomicBool>,
        fail: Arc<AtomicBool>,
        floor_to_latent_grid: Arc<AtomicBool>,
        safety_checker: AtomicBool,
    }

    #[async_trait]
    impl DiffusionPipeline for FakePipeline {
        async fn generate(&self, params: &PipelineParams) -> Result<PipelineOutput> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("simulated pipeline failure");
            }

            let mut hasher = DefaultHasher::new();
            self.model_key.hash(&mut hasher);
            self.device.hash(&mut hasher);
            params.prompt.hash(&mut hasher);
            params.negative_prompt.hash(&mut hasher);
            (params.width, params.height, params.steps).hash(&mut hasher);
            params.guidance.to_bits().hash(&mut hasher);
            params.seed.hash(&mut hasher);
            let mut state = hasher.finish() | 1;

            let (width, height) = if self.floor_to_latent_grid.load(Ordering::SeqCst) {
                (params.width / 8 * 8, params.height / 8 * 8)
            } else {
                (params.width, params.height)
            };
            let image = RgbImage::from_fn(width, height, |_, _| {
                // xorshift64
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let [r, g, b, ..] = state.to_le_bytes();
                Rgb([r, g, b])
            });

            Ok(PipelineOutput {
                image: DynamicImage::ImageRgb8(image),
                nsfw_content_detected: self.nsfw.load(Ordering::SeqCst)
                    && self.safety_checker_enabled(),
            })
        }

        fn disable_safety_checker(&self) {
            self.safety_checker.store(false, Ordering::SeqCst);
        }

        fn safety_checker_enabled(&self) -> bool {
            self.safety_checker.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeLoader;
    use super::*;

    fn params(seed: u64) -> PipelineParams {
        PipelineParams {
            prompt: "city street, overcast sky, golden hour, cinematic lighting, ultra-detailed"
                .to_string(),
            negative_prompt: String::new(),
            width: 32,
            height: 24,
            steps: 4,
            guidance: 7.0,
            seed,
        }
    }

    #[tokio::test]
    async fn fake_pipeline_is_reproducible_per_seed() {
        let loader = FakeLoader::new(Device::Cpu);
        let pipeline = loader.load(ModelKey::Sd15, Device::Cpu).await.unwrap();

        let a = pipeline.generate(&params(7)).await.unwrap().image;
        let b = pipeline.generate(&params(7)).await.unwrap().image;
        let c = pipeline.generate(&params(8)).await.unwrap().image;
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert_eq!((a.width(), a.height()), (32, 24));
    }

    #[tokio::test]
    async fn disabling_safety_checker_suppresses_nsfw_flag() {
        let loader = FakeLoader::new(Device::Cpu);
        loader.nsfw.store(true, Ordering::SeqCst);
        let pipeline = loader.load(ModelKey::Sdxl, Device::Cpu).await.unwrap();

        assert!(pipeline.generate(&params(1)).await.unwrap().nsfw_content_detected);
        pipeline.disable_safety_checker();
        assert!(!pipeline.safety_checker_enabled());
        assert!(!pipeline.generate(&params(1)).await.unwrap().nsfw_content_detected);
    }

    #[test]
    fn comfy_loader_rejects_missing_workflow_file() {
        let comfyui = ComfyUIConfig {
            workflow_path: Some("/nonexistent/workflow.json".to_string()),
            ..ComfyUIConfig::default()
        };
        assert!(ComfyPipelineLoader::from_config(&comfyui, &ModelIds::default()).is_err());
    }
}
