use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::ModelKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComfyUIConfig {
    #[serde(default = "default_comfyui_url")]
    pub api_url: String,
    /// Optional API-format workflow JSON used instead of the built-in graph
    #[serde(default)]
    pub workflow_path: Option<String>,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_comfyui_url() -> String {
    "http://127.0.0.1:8188".to_string()
}

fn default_sampler() -> String {
    "dpmpp_2m".to_string()
}

fn default_scheduler() -> String {
    "karras".to_string()
}

fn default_wait_timeout_secs() -> u64 {
    900
}

impl Default for ComfyUIConfig {
    fn default() -> Self {
        Self {
            api_url: default_comfyui_url(),
            workflow_path: None,
            sampler: default_sampler(),
            scheduler: default_scheduler(),
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

/// Checkpoint identifiers per model key, as ComfyUI knows them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelIds {
    #[serde(default = "default_sd15_id")]
    pub sd15: String,
    #[serde(default = "default_sdxl_id")]
    pub sdxl: String,
    #[serde(default = "default_leosam_id")]
    pub leosam: String,
}

fn default_sd15_id() -> String {
    "v1-5-pruned-emaonly.safetensors".to_string()
}

fn default_sdxl_id() -> String {
    "sd_xl_base_1.0.safetensors".to_string()
}

fn default_leosam_id() -> String {
    "leosam-helloworld-xl.safetensors".to_string()
}

impl Default for ModelIds {
    fn default() -> Self {
        Self {
            sd15: default_sd15_id(),
            sdxl: default_sdxl_id(),
            leosam: default_leosam_id(),
        }
    }
}

impl ModelIds {
    pub fn checkpoint_for(&self, key: ModelKey) -> &str {
        match key {
            ModelKey::Sd15 => &self.sd15,
            ModelKey::Sdxl => &self.sdxl,
            ModelKey::Leosam => &self.leosam,
        }
    }
}

/// Parameters the controller sends with every cycle's generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance")]
    pub guidance: f32,
    #[serde(default = "default_safety")]
    pub safety: bool,
}

fn default_width() -> u32 {
    512
}

fn default_height() -> u32 {
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

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            steps: default_steps(),
            guidance: default_guidance(),
            safety: default_safety(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(default = "default_city")]
    pub city: String,
    #[serde(default = "default_lat")]
    pub lat: f64,
    #[serde(default = "default_lon")]
    pub lon: f64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_weather_url")]
    pub weather_url: String,
}

fn default_city() -> String {
    "Logan, UT".to_string()
}

fn default_lat() -> f64 {
    41.7355
}

fn default_lon() -> f64 {
    -111.8344
}

fn default_timezone() -> String {
    "America/Denver".to_string()
}

fn default_weather_url() -> String {
    "https://api.open-meteo.com/v1/forecast".to_string()
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            city: default_city(),
            lat: default_lat(),
            lon: default_lon(),
            timezone: default_timezone(),
            weather_url: default_weather_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignageConfig {
    // Generation server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    /// Device override applied when a request names none (cuda | cpu | mps)
    #[serde(default)]
    pub device: Option<String>,

    // Controller
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    // Display client
    #[serde(default = "default_display_refresh_secs")]
    pub display_refresh_secs: u64,

    #[serde(default)]
    pub comfyui: ComfyUIConfig,
    #[serde(default)]
    pub models: ModelIds,
    #[serde(default)]
    pub generation: GenerationDefaults,
    #[serde(default)]
    pub location: LocationConfig,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_output_dir() -> String {
    "outputs".to_string()
}

fn default_api_base() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_display_refresh_secs() -> u64 {
    15
}

impl Default for SignageConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            output_dir: default_output_dir(),
            device: None,
            api_base: default_api_base(),
            state_dir: default_state_dir(),
            display_refresh_secs: default_display_refresh_secs(),
            comfyui: ComfyUIConfig::default(),
            models: ModelIds::default(),
            generation: GenerationDefaults::default(),
            location: LocationConfig::default(),
        }
    }
}

impl SignageConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("signage_config.toml")
    }

    /// Load signage_config.toml (next to the executable) if present, then
    /// overlay environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = match Self::from_file(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Ok(None) => {
                tracing::debug!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
            Err(e) => {
                tracing::error!("{:#}", e);
                Self::default()
            }
        };
        config.apply_overrides(|name| env::var(name).ok());
        config
    }

    pub fn from_file(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {:?}", path));
            }
        };
        let config = toml::from_str::<SignageConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(Some(config))
    }

    /// Overlay values from an environment-style lookup. Unparseable numbers
    /// keep whatever was configured before.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        // Older deployments still export the HF_ID_* / TORCH_DEVICE names.
        let with_alias = |name: &str, alias: &str| non_empty(name).or_else(|| non_empty(alias));

        if let Some(url) = non_empty("API_BASE") {
            self.api_base = url;
        }
        if let Some(dir) = non_empty("STATE_DIR") {
            self.state_dir = dir;
        }
        if let Some(dir) = non_empty("OUTPUT_DIR") {
            self.output_dir = dir;
        }
        if let Some(bind) = non_empty("SIGNAGE_BIND") {
            self.bind_addr = bind;
        }
        if let Some(device) = with_alias("SIGNAGE_DEVICE", "TORCH_DEVICE") {
            self.device = Some(device);
        }
        if let Some(secs) = non_empty("DISPLAY_REFRESH_SECS").and_then(|v| v.parse().ok()) {
            self.display_refresh_secs = secs;
        }

        if let Some(url) = non_empty("COMFYUI_URL") {
            self.comfyui.api_url = url;
        }
        if let Some(path) = non_empty("COMFYUI_WORKFLOW_PATH") {
            self.comfyui.workflow_path = Some(path);
        }

        if let Some(width) = non_empty("GEN_WIDTH").and_then(|v| v.parse().ok()) {
            self.generation.width = width;
        }
        if let Some(height) = non_empty("GEN_HEIGHT").and_then(|v| v.parse().ok()) {
            self.generation.height = height;
        }
        if let Some(steps) = non_empty("GEN_STEPS").and_then(|v| v.parse().ok()) {
            self.generation.steps = steps;
        }
        if let Some(guidance) = non_empty("GEN_GUIDANCE").and_then(|v| v.parse().ok()) {
            self.generation.guidance = guidance;
        }
        if let Some(safety) = non_empty("GEN_SAFETY") {
            // Only an explicit "false" turns the checker off.
            self.generation.safety = !safety.trim().eq_ignore_ascii_case("false");
        }

        if let Some(city) = non_empty("CITY") {
            self.location.city = city;
        }
        if let Some(lat) = non_empty("LAT").and_then(|v| v.parse().ok()) {
            self.location.lat = lat;
        }
        if let Some(lon) = non_empty("LON").and_then(|v| v.parse().ok()) {
            self.location.lon = lon;
        }
        if let Some(tz) = non_empty("TZ") {
            self.location.timezone = tz;
        }
        if let Some(url) = non_empty("WEATHER_URL") {
            self.location.weather_url = url;
        }

        if let Some(id) = with_alias("MODEL_ID_SD15", "HF_ID_SD15") {
            self.models.sd15 = id;
        }
        if let Some(id) = with_alias("MODEL_ID_SDXL", "HF_ID_SDXL") {
            self.models.sdxl = id;
        }
        if let Some(id) = with_alias("MODEL_ID_LEOSAM", "HF_ID_LEOSAM") {
            self.models.leosam = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_controller_payload() {
        let config = SignageConfig::default();
        assert_eq!(config.generation.width, 512);
        assert_eq!(config.generation.height, 512);
        assert_eq!(config.generation.steps, 28);
        assert_eq!(config.generation.guidance, 7.0);
        assert!(config.generation.safety);
        assert_eq!(config.api_base, "http://127.0.0.1:8000");
        assert_eq!(config.state_dir, "state");
    }

    #[test]
    fn env_overrides_replace_values() {
        let mut config = SignageConfig::default();
        config.apply_overrides(lookup_from(&[
            ("GEN_WIDTH", "768"),
            ("GEN_GUIDANCE", "5.5"),
            ("CITY", "Oslo"),
            ("LAT", "59.91"),
            ("MODEL_ID_SDXL", "custom-xl.safetensors"),
            ("SIGNAGE_DEVICE", "cuda"),
        ]));
        assert_eq!(config.generation.width, 768);
        assert_eq!(config.generation.guidance, 5.5);
        assert_eq!(config.location.city, "Oslo");
        assert_eq!(config.location.lat, 59.91);
        assert_eq!(config.models.checkpoint_for(ModelKey::Sdxl), "custom-xl.safetensors");
        assert_eq!(config.device.as_deref(), Some("cuda"));
    }

    #[test]
    fn unparseable_numbers_keep_defaults() {
        let mut config = SignageConfig::default();
        config.apply_overrides(lookup_from(&[("GEN_STEPS", "many"), ("LON", "west")]));
        assert_eq!(config.generation.steps, 28);
        assert_eq!(config.location.lon, -111.8344);
    }

    #[test]
    fn safety_only_disabled_by_explicit_false() {
        let mut config = SignageConfig::default();
        config.apply_overrides(lookup_from(&[("GEN_SAFETY", "no")]));
        assert!(config.generation.safety);

        config.apply_overrides(lookup_from(&[("GEN_SAFETY", "FALSE")]));
        assert!(!config.generation.safety);
    }

    #[test]
    fn partial_toml_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signage_config.toml");
        fs::write(
            &path,
            "output_dir = \"/srv/outputs\"\n[generation]\nsteps = 40\n[comfyui]\napi_url = \"http://gpu:8188\"\n",
        )
        .unwrap();

        let config = SignageConfig::from_file(&path).unwrap().unwrap();
        assert_eq!(config.output_dir, "/srv/outputs");
        assert_eq!(config.generation.steps, 40);
        assert_eq!(config.generation.width, 512);
        assert_eq!(config.comfyui.api_url, "http://gpu:8188");
        assert_eq!(config.comfyui.sampler, "dpmpp_2m");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SignageConfig::from_file(&dir.path().join("absent.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn legacy_model_and_device_names_are_accepted() {
        let mut config = SignageConfig::default();
        config.apply_overrides(lookup_from(&[
            ("HF_ID_SD15", "legacy-sd15.safetensors"),
            ("HF_ID_SDXL", "legacy-xl.safetensors"),
            ("MODEL_ID_SDXL", "current-xl.safetensors"),
            ("HF_ID_LEOSAM", "legacy-leosam.safetensors"),
            ("TORCH_DEVICE", "mps"),
        ]));
        assert_eq!(config.models.sd15, "legacy-sd15.safetensors");
        assert_eq!(config.models.sdxl, "current-xl.safetensors");
        assert_eq!(config.models.leosam, "legacy-leosam.safetensors");
        assert_eq!(config.device.as_deref(), Some("mps"));
    }
}
