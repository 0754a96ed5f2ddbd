// Workflow templates and the prompts that get poured into them.
//
// The template is an API-format ComfyUI workflow: a map of node id -> node, where each node
// carries an "inputs" map. We never interpret the graph, we only overwrite a handful of inputs.

use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::NodeIds;

/// Seeds are drawn from [1, MAX_SEED].
pub const MAX_SEED: u64 = 1 << 48;

/// One entry of prompts.json.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PromptItem {
    #[serde(default)]
    pub positive: String,
    /// Read but never used; every job gets the configured negative prompt instead.
    #[serde(default)]
    pub negative: Option<String>,
}

impl PromptItem {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).context("malformed prompt item")
    }
}

/// Everything that varies per item.
#[derive(Clone, Debug)]
pub struct JobParams<'a> {
    pub index: usize,
    pub seed: u64,
    pub style_suffix: &'a str,
    pub negative_prompt: &'a str,
}

/// A fully specified job, ready to queue.
#[derive(Debug)]
pub struct DerivedJob {
    pub workflow: Value,
    pub seed: u64,
    pub prefix: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobTemplate {
    nodes: Map<String, Value>,
}

impl JobTemplate {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workflow {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse workflow {}", path.display()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(nodes) => Ok(Self { nodes }),
            other => bail!("workflow must be a JSON object, got {}", type_name(&other)),
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn input(&self, node: &str, key: &str) -> Option<&Value> {
        self.nodes.get(node)?.get("inputs")?.get(key)
    }

    /// Applies the per-run knobs in place.
    ///
    /// The guidance and steps nodes are required; the batch node is optional.
    pub fn prepare(&mut self, nodes: &NodeIds, batch_size: u32, guidance_scale: f64, steps: u32) -> Result<()> {
        if !self.contains(&nodes.guidance) {
            bail!("CFG guidance node {} not found in workflow", nodes.guidance);
        }
        if !self.contains(&nodes.steps) {
            bail!("Scheduler node {} not found in workflow", nodes.steps);
        }

        match self.nodes.get_mut(&nodes.batch).and_then(|n| n.get_mut("inputs")).and_then(Value::as_object_mut) {
            Some(inputs) => {
                inputs.insert("batch_size".to_string(), batch_size.into());
            }
            None => debug!("No batch node {}, leaving batch size alone", nodes.batch),
        }

        set_input(&mut self.nodes, &nodes.guidance, "cfg", guidance_scale.into())?;
        set_input(&mut self.nodes, &nodes.steps, "steps", steps.into())?;
        Ok(())
    }

    /// Builds the job for one prompt item. The template itself is left untouched.
    pub fn derive(&self, nodes: &NodeIds, item: &PromptItem, params: &JobParams) -> Result<DerivedJob> {
        if item.negative.is_some() {
            debug!("Prompt item {} has its own negative prompt; ignoring it", params.index);
        }
        let mut workflow = self.nodes.clone();
        let positive = format!("{} {}", item.positive, params.style_suffix);
        let prefix = output_prefix(params.index, params.seed);

        set_input(&mut workflow, &nodes.positive, "text", positive.into())?;
        set_input(&mut workflow, &nodes.negative, "text", params.negative_prompt.into())?;
        set_input(&mut workflow, &nodes.seed, "noise_seed", params.seed.into())?;
        set_input(&mut workflow, &nodes.save, "filename_prefix", prefix.clone().into())?;

        Ok(DerivedJob {
            workflow: Value::Object(workflow),
            seed: params.seed,
            prefix,
        })
    }
}

fn set_input(nodes: &mut Map<String, Value>, node: &str, key: &str, value: Value) -> Result<()> {
    let inputs = nodes
        .get_mut(node)
        .with_context(|| format!("node {node} not found in workflow"))?
        .get_mut("inputs")
        .and_then(Value::as_object_mut)
        .with_context(|| format!("node {node} has no inputs"))?;
    inputs.insert(key.to_string(), value);
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Output filename prefix. The index alone keeps these unique within a run.
pub fn output_prefix(index: usize, seed: u64) -> String {
    format!("batch_{index:04}_seed{seed}")
}

pub fn random_seed<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    rng.gen_range(1..=MAX_SEED)
}

/// Loads prompts.json. Items stay raw so that one malformed entry only sinks itself.
pub fn load_prompts(path: impl AsRef<Path>) -> Result<Vec<Value>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read prompts {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse prompts {}", path.display()))?;
    match value {
        Value::Array(items) => Ok(items),
        other => bail!("prompts must be a JSON array, got {}", type_name(&other)),
    }
}

#[cfg(test)]
pub fn test_template() -> Value {
    serde_json::json!({
        "694": { "class_type": "CFGGuider", "inputs": { "cfg": 1.0 } },
        "751": { "class_type": "BetaSamplingScheduler", "inputs": { "steps": 10 } },
        "737": { "class_type": "EmptySD3LatentImage", "inputs": { "batch_size": 1, "width": 1024 } },
        "748": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } },
        "749": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } },
        "718": { "class_type": "RandomNoise", "inputs": { "noise_seed": 0 } },
        "740": { "class_type": "SaveImage", "inputs": { "filename_prefix": "ComfyUI" } }
    })
}
