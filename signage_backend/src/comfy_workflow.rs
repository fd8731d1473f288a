use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// What a node contributes to a text-to-image request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Checkpoint,
    Latent,
    Sampler,
    PositivePrompt,
    NegativePrompt,
}

/// A node in the workflow whose inputs are filled per request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllableNode {
    pub node_id: String,
    pub class_type: String,
    pub role: NodeRole,
}

/// Per-request values written into the graph
#[derive(Debug, Clone)]
pub struct WorkflowInputs<'a> {
    pub checkpoint: &'a str,
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f32,
    pub seed: u64,
    pub sampler: &'a str,
    pub scheduler: &'a str,
}

/// ComfyUI API-format graph plus the nodes we know how to drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComfyWorkflow {
    pub name: String,
    pub workflow_json: Value,
    pub controllable_nodes: HashMap<String, ControllableNode>,
    pub output_node_id: String,
}

impl ComfyWorkflow {
    /// The stock checkpoint → sampler → decode → save graph. Works for both
    /// SD 1.5 and SDXL checkpoints.
    pub fn txt2img() -> Result<Self> {
        let graph = json!({
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": ""}},
            "5": {"class_type": "EmptyLatentImage", "inputs": {"width": 512, "height": 512, "batch_size": 1}},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
            "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
            "3": {"class_type": "KSampler", "inputs": {
                "seed": 0,
                "steps": 28,
                "cfg": 7.0,
                "sampler_name": "dpmpp_2m",
                "scheduler": "karras",
                "denoise": 1.0,
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            }},
            "8": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0], "vae": ["4", 2]}},
            "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "signage", "images": ["8", 0]}}
        });

        let mut workflow = Self::from_workflow_json(graph)?;
        workflow.name = "Built-in txt2img".to_string();
        Ok(workflow)
    }

    /// Import an API-format workflow exported from ComfyUI
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read workflow JSON from {:?}", path_ref))?;

        let workflow_json: Value =
            serde_json::from_str(&contents).context("Failed to parse workflow JSON")?;

        let mut workflow = Self::from_workflow_json(workflow_json)?;
        workflow.name = path_ref
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "Imported Workflow".to_string());
        Ok(workflow)
    }

    /// Create workflow from parsed JSON
    pub fn from_workflow_json(workflow_json: Value) -> Result<Self> {
        let controllable_nodes = detect_controllable_nodes(&workflow_json)?;
        let output_node_id = find_output_node(&workflow_json)?;

        Ok(Self {
            name: "Imported Workflow".to_string(),
            workflow_json,
            controllable_nodes,
            output_node_id,
        })
    }

    pub fn node_for(&self, role: NodeRole) -> Option<&ControllableNode> {
        let mut matches: Vec<&ControllableNode> = self
            .controllable_nodes
            .values()
            .filter(|node| node.role == role)
            .collect();
        matches.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        matches.into_iter().next()
    }

    /// Copy the graph and write the request's values into every controllable node
    pub fn prepare_for_execution(&self, inputs: &WorkflowInputs<'_>) -> Result<Value> {
        let mut workflow = self.workflow_json.clone();

        for (node_id, node) in &self.controllable_nodes {
            let node_inputs = workflow
                .get_mut(node_id)
                .and_then(|n| n.get_mut("inputs"))
                .and_then(Value::as_object_mut)
                .with_context(|| format!("Workflow node {} has no inputs object", node_id))?;

            match node.role {
                NodeRole::Checkpoint => {
                    node_inputs.insert("ckpt_name".into(), json!(inputs.checkpoint));
                }
                NodeRole::Latent => {
                    node_inputs.insert("width".into(), json!(inputs.width));
                    node_inputs.insert("height".into(), json!(inputs.height));
                    node_inputs.insert("batch_size".into(), json!(1));
                }
                NodeRole::Sampler => {
                    let seed_key = if node.class_type == "KSamplerAdvanced" {
                        "noise_seed"
                    } else {
                        "seed"
                    };
                    node_inputs.insert(seed_key.into(), json!(inputs.seed));
                    node_inputs.insert("steps".into(), json!(inputs.steps));
                    node_inputs.insert("cfg".into(), json!(inputs.cfg));
                    node_inputs.insert("sampler_name".into(), json!(inputs.sampler));
                    node_inputs.insert("scheduler".into(), json!(inputs.scheduler));
                }
                NodeRole::PositivePrompt => {
                    node_inputs.insert("text".into(), json!(inputs.prompt));
                }
                NodeRole::NegativePrompt => {
                    node_inputs.insert("text".into(), json!(inputs.negative_prompt));
                }
            }
        }

        Ok(workflow)
    }
}

/// Find the nodes a text-to-image request drives. Prompt nodes are told apart
/// by following the sampler's `positive` / `negative` links.
fn detect_controllable_nodes(workflow: &Value) -> Result<HashMap<String, ControllableNode>> {
    let nodes = workflow
        .as_object()
        .context("Workflow JSON must be an object keyed by node id")?;

    let mut controllable = HashMap::new();
    let mut sampler_links: Vec<(String, NodeRole)> = Vec::new();

    for (node_id, node) in nodes {
        let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
            continue;
        };

        let role = match class_type {
            "CheckpointLoaderSimple" => NodeRole::Checkpoint,
            "EmptyLatentImage" => NodeRole::Latent,
            "KSampler" | "KSamplerAdvanced" => {
                for (input_name, role) in [
                    ("positive", NodeRole::PositivePrompt),
                    ("negative", NodeRole::NegativePrompt),
                ] {
                    if let Some(source) = linked_node(node, input_name) {
                        sampler_links.push((source, role));
                    }
                }
                NodeRole::Sampler
            }
            _ => continue,
        };

        controllable.insert(
            node_id.clone(),
            ControllableNode {
                node_id: node_id.clone(),
                class_type: class_type.to_string(),
                role,
            },
        );
    }

    if !controllable
        .values()
        .any(|node| node.role == NodeRole::Sampler)
    {
        anyhow::bail!("No KSampler node found in workflow");
    }

    for (source_id, role) in sampler_links {
        let Some(class_type) = nodes
            .get(&source_id)
            .and_then(|n| n.get("class_type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if class_type != "CLIPTextEncode" {
            tracing::debug!(
                "Sampler conditioning comes from {} ({}); leaving it untouched",
                source_id,
                class_type
            );
            continue;
        }
        controllable.insert(
            source_id.clone(),
            ControllableNode {
                node_id: source_id,
                class_type: class_type.to_string(),
                role,
            },
        );
    }

    Ok(controllable)
}

/// `["6", 0]` style link → source node id
fn linked_node(node: &Value, input_name: &str) -> Option<String> {
    let link = node.get("inputs")?.get(input_name)?.as_array()?;
    match link.first()? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Find the output node in the workflow
fn find_output_node(workflow: &Value) -> Result<String> {
    let mut candidates: Vec<&String> = workflow
        .as_object()
        .map(|nodes| {
            nodes
                .iter()
                .filter(|(_, node)| {
                    matches!(
                        node.get("class_type").and_then(Value::as_str),
                        Some("SaveImage" | "PreviewImage")
                    )
                })
                .map(|(node_id, _)| node_id)
                .collect()
        })
        .unwrap_or_default();
    candidates.sort();

    candidates
        .first()
        .map(|id| id.to_string())
        .ok_or_else(|| anyhow::anyhow!("No output node (SaveImage/PreviewImage) found in workflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> WorkflowInputs<'static> {
        WorkflowInputs {
            checkpoint: "sd_xl_base_1.0.safetensors",
            prompt: "city street, fresh snowfall, night scene, moody lighting, ultra-detailed",
            negative_prompt: "low quality",
            width: 1024,
            height: 768,
            steps: 30,
            cfg: 6.5,
            seed: 42,
            sampler: "euler",
            scheduler: "normal",
        }
    }

    #[test]
    fn builtin_graph_detects_all_roles() {
        let workflow = ComfyWorkflow::txt2img().unwrap();
        assert_eq!(workflow.output_node_id, "9");
        assert_eq!(workflow.node_for(NodeRole::Checkpoint).unwrap().node_id, "4");
        assert_eq!(workflow.node_for(NodeRole::Latent).unwrap().node_id, "5");
        assert_eq!(workflow.node_for(NodeRole::Sampler).unwrap().node_id, "3");
        assert_eq!(workflow.node_for(NodeRole::PositivePrompt).unwrap().node_id, "6");
        assert_eq!(workflow.node_for(NodeRole::NegativePrompt).unwrap().node_id, "7");
    }

    #[test]
    fn prepare_writes_request_values() {
        let prepared = ComfyWorkflow::txt2img()
            .unwrap()
            .prepare_for_execution(&inputs())
            .unwrap();
        assert_eq!(prepared["4"]["inputs"]["ckpt_name"], "sd_xl_base_1.0.safetensors");
        assert_eq!(prepared["5"]["inputs"]["width"], 1024);
        assert_eq!(prepared["5"]["inputs"]["height"], 768);
        assert_eq!(prepared["3"]["inputs"]["seed"], 42);
        assert_eq!(prepared["3"]["inputs"]["steps"], 30);
        assert_eq!(prepared["3"]["inputs"]["sampler_name"], "euler");
        assert_eq!(prepared["6"]["inputs"]["text"], inputs().prompt);
        assert_eq!(prepared["7"]["inputs"]["text"], "low quality");
        // links are untouched
        assert_eq!(prepared["3"]["inputs"]["positive"], json!(["6", 0]));
    }

    #[test]
    fn advanced_sampler_uses_noise_seed() {
        let graph = json!({
            "1": {"class_type": "KSamplerAdvanced", "inputs": {"noise_seed": 0, "positive": ["2", 0], "negative": ["3", 0]}},
            "2": {"class_type": "CLIPTextEncode", "inputs": {"text": "a"}},
            "3": {"class_type": "CLIPTextEncode", "inputs": {"text": "b"}},
            "4": {"class_type": "PreviewImage", "inputs": {}}
        });
        let workflow = ComfyWorkflow::from_workflow_json(graph).unwrap();
        let prepared = workflow.prepare_for_execution(&inputs()).unwrap();
        assert_eq!(prepared["1"]["inputs"]["noise_seed"], 42);
        assert!(prepared["1"]["inputs"].get("seed").is_none());
        assert_eq!(prepared["3"]["inputs"]["text"], "low quality");
    }

    #[test]
    fn workflow_without_sampler_or_output_is_rejected() {
        let no_sampler = json!({"9": {"class_type": "SaveImage", "inputs": {}}});
        assert!(ComfyWorkflow::from_workflow_json(no_sampler).is_err());

        let no_output = json!({"3": {"class_type": "KSampler", "inputs": {}}});
        assert!(ComfyWorkflow::from_workflow_json(no_output).is_err());
    }

    #[test]
    fn imports_workflow_file_named_after_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("night_city.json");
        fs::write(&path, ComfyWorkflow::txt2img().unwrap().workflow_json.to_string()).unwrap();

        let workflow = ComfyWorkflow::from_json_file(&path).unwrap();
        assert_eq!(workflow.name, "night_city");
        assert_eq!(workflow.controllable_nodes.len(), 5);
    }
}
