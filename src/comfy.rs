// Client for the ComfyUI prompt queue.
//
// We only ever queue prompts here. Nobody waits for the images; they land in ComfyUI's output
// directory and are picked up from there.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, trace, warn};
use serde::Serialize;
use serde_json::Value;

use crate::config::ServerConfig;

/// What the server said about a queued prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Accepted { prompt_id: String },
    Rejected { status: u16, body: String },
}

/// Anything that accepts workflows.
/// Network failures and timeouts are errors; a non-200 answer is a `Rejected` outcome.
#[allow(async_fn_in_trait)]
pub trait PromptQueue {
    async fn queue_prompt(&self, workflow: &Value) -> Result<QueueOutcome>;
}

pub struct ComfyClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ComfyClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.submit_timeout_secs),
        })
    }
}

impl PromptQueue for ComfyClient {
    async fn queue_prompt(&self, workflow: &Value) -> Result<QueueOutcome> {
        #[derive(Debug, Serialize)]
        struct Request<'a> {
            prompt: &'a Value,
        }

        let url = format!("{}/prompt", self.base_url);
        debug!("Queueing prompt at {}", url);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&Request { prompt: workflow })
            .send()
            .await
            .context("failed to send request")?;
        let status = response.status();
        let text = response.text().await.context("failed to read response")?;
        trace!("Response: {} {}", status, text);

        if status != reqwest::StatusCode::OK {
            return Ok(QueueOutcome::Rejected { status: status.as_u16(), body: text });
        }
        Ok(QueueOutcome::Accepted { prompt_id: prompt_id_from_response(&text) })
    }
}

/// Pulls `prompt_id` out of a /prompt response, falling back to "unknown".
pub fn prompt_id_from_response(text: &str) -> String {
    let parsed = match serde_json::from_str::<Value>(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Unparsable /prompt response ({}): {}", e, text);
            return "unknown".to_string();
        }
    };
    match parsed.get("prompt_id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => "unknown".to_string(),
    }
}
