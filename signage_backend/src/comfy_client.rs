use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

use crate::http_client::build_http_client;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Bound for the quick metadata queries made while loading a pipeline
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct QueuePromptRequest {
    pub prompt: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueuePromptResponse {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub outputs: HashMap<String, OutputNode>,
    pub status: Option<StatusInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputNode {
    pub images: Option<Vec<ImageInfo>>,
    /// Reported by safety-checker custom nodes, one flag per image
    #[serde(default)]
    pub nsfw_detected: Option<Vec<bool>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type")]
    pub image_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusInfo {
    pub status_str: Option<String>,
    pub completed: Option<bool>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Finished prompt: the first output image plus any NSFW verdict the graph reported.
#[derive(Debug, Clone)]
pub struct CompletedPrompt {
    pub image: ImageInfo,
    pub nsfw_detected: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub devices: Vec<DeviceStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceStats {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

/// Client for the ComfyUI HTTP API
pub struct ComfyUIClient {
    api_url: String,
    client: Client,
    client_id: String,
    metadata_timeout: Duration,
}

impl ComfyUIClient {
    pub fn new(api_url: String) -> Self {
        Self::with_client(api_url, build_http_client())
    }

    pub fn with_client(api_url: String, client: Client) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
            client_id: uuid::Uuid::new_v4().to_string(),
            metadata_timeout: METADATA_TIMEOUT,
        }
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue a workflow for execution
    pub async fn queue_prompt(&self, workflow: Value) -> Result<String> {
        let url = format!("{}/prompt", self.api_url);

        let request = QueuePromptRequest {
            prompt: workflow,
            client_id: Some(self.client_id.clone()),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send prompt to ComfyUI")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ComfyUI API error {}: {}", status, body);
        }

        let result: QueuePromptResponse = response
            .json()
            .await
            .context("Failed to parse ComfyUI response")?;

        Ok(result.prompt_id)
    }

    /// Check the status of a queued prompt
    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>> {
        let url = format!("{}/history/{}", self.api_url, prompt_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to get history from ComfyUI")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to get history: {}", response.status());
        }

        let mut history: HashMap<String, HistoryEntry> = response
            .json()
            .await
            .context("Failed to parse history response")?;

        Ok(history.remove(prompt_id))
    }

    /// Poll history until the prompt finishes, fails, or the timeout elapses.
    /// The image comes from `output_node` when that node saved one.
    pub async fn wait_for_completion(
        &self,
        prompt_id: &str,
        output_node: Option<&str>,
        timeout_secs: u64,
    ) -> Result<CompletedPrompt> {
        let start = std::time::Instant::now();
        let timeout = Duration::from_secs(timeout_secs);

        loop {
            if start.elapsed() > timeout {
                anyhow::bail!(
                    "Timeout waiting for ComfyUI prompt {} after {}s",
                    prompt_id,
                    timeout_secs
                );
            }

            if let Some(history) = self.get_history(prompt_id).await? {
                if let Some(status) = &history.status {
                    if status.status_str.as_deref() == Some("error") {
                        anyhow::bail!(
                            "ComfyUI prompt {} failed: {}",
                            prompt_id,
                            summarize_messages(&status.messages)
                        );
                    }
                    if status.completed == Some(true) {
                        return completed_from_history(prompt_id, &history, output_node);
                    }
                }
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    /// Download an output image into memory
    pub async fn fetch_image(&self, image_info: &ImageInfo) -> Result<Vec<u8>> {
        let url = format!("{}/view", self.api_url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("filename", image_info.filename.as_str()),
                ("subfolder", image_info.subfolder.as_str()),
                ("type", image_info.image_type.as_str()),
            ])
            .send()
            .await
            .context("Failed to download image from ComfyUI")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to download image {}: {}",
                image_info.filename,
                response.status()
            );
        }

        let bytes = response
            .bytes()
            .await
            .context("Failed to read image bytes")?;
        Ok(bytes.to_vec())
    }

    /// Devices the ComfyUI server is running on
    pub async fn system_stats(&self) -> Result<SystemStats> {
        let url = format!("{}/system_stats", self.api_url);
        self.client
            .get(&url)
            .timeout(self.metadata_timeout)
            .send()
            .await
            .context("Failed to reach ComfyUI system_stats")?
            .error_for_status()
            .context("ComfyUI system_stats returned an error")?
            .json::<SystemStats>()
            .await
            .context("Failed to parse ComfyUI system_stats")
    }

    /// Checkpoint names the server can load
    pub async fn available_checkpoints(&self) -> Result<Vec<String>> {
        let url = format!("{}/object_info/CheckpointLoaderSimple", self.api_url);
        let info: Value = self
            .client
            .get(&url)
            .timeout(self.metadata_timeout)
            .send()
            .await
            .context("Failed to query ComfyUI object_info")?
            .error_for_status()
            .context("ComfyUI object_info returned an error")?
            .json()
            .await
            .context("Failed to parse ComfyUI object_info")?;
        Ok(checkpoint_names(&info))
    }
}

fn completed_from_history(
    prompt_id: &str,
    history: &HistoryEntry,
    output_node: Option<&str>,
) -> Result<CompletedPrompt> {
    let nsfw_detected = history
        .outputs
        .values()
        .filter_map(|output| output.nsfw_detected.as_ref())
        .any(|flags| flags.first().copied().unwrap_or(false));

    // Configured save node first, then the rest sorted so the pick is stable.
    let mut node_ids: Vec<&String> = history.outputs.keys().collect();
    let rank = |id: &str| Some(id) != output_node;
    node_ids.sort_by(|a, b| (rank(a), a.as_str()).cmp(&(rank(b), b.as_str())));
    for node_id in node_ids {
        let images = history.outputs[node_id].images.as_deref().unwrap_or(&[]);
        if let Some(image) = images.first() {
            tracing::debug!(
                "ComfyUI prompt {} produced {} (node {})",
                prompt_id,
                image.filename,
                node_id
            );
            return Ok(CompletedPrompt {
                image: image.clone(),
                nsfw_detected,
            });
        }
    }

    anyhow::bail!("ComfyUI prompt {} completed but no image found", prompt_id)
}

fn summarize_messages(messages: &[Value]) -> String {
    let errors: Vec<String> = messages
        .iter()
        .filter_map(|message| {
            let kind = message.get(0).and_then(Value::as_str)?;
            if kind != "execution_error" {
                return None;
            }
            let detail = message.get(1)?;
            Some(format!(
                "{} ({})",
                detail
                    .get("exception_message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .trim(),
                detail
                    .get("node_type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown node")
            ))
        })
        .collect();
    if errors.is_empty() {
        "no error detail reported".to_string()
    } else {
        errors.join("; ")
    }
}

/// Pull checkpoint names from an object_info response. Handles both the
/// legacy `[[names...], {..}]` layout and the `["COMBO", {"options": [...]}]` one.
fn checkpoint_names(info: &Value) -> Vec<String> {
    let Some(ckpt_input) = info
        .pointer("/CheckpointLoaderSimple/input/required/ckpt_name")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let names = match ckpt_input.first() {
        Some(Value::Array(names)) => Some(names),
        Some(Value::String(_)) => ckpt_input
            .get(1)
            .and_then(|opts| opts.get("options"))
            .and_then(Value::as_array),
        _ => None,
    };

    names
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
