// The batch submitter.
//
// One call = one pass over prompts.json with a fixed cfg/steps/style. Every item is queued
// independently: whatever goes wrong with one item is logged and the loop moves on.
// Only a broken workflow (or unreadable input files) stops the batch, and that happens
// before anything is sent.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info};
use rand::Rng;
use serde_json::Value;

use crate::{
    comfy::{PromptQueue, QueueOutcome},
    config::Config,
    pacing::Pacer,
    workflow::{self, JobParams, JobTemplate, PromptItem},
};

pub struct BatchSubmitter<Q, P> {
    pub(crate) config: Config,
    pub(crate) queue: Q,
    pub(crate) pacer: P,
}

/// Result of a single successfully sent item.
#[derive(Debug)]
struct Receipt {
    seed: u64,
    outcome: QueueOutcome,
}

impl<Q: PromptQueue, P: Pacer> BatchSubmitter<Q, P> {
    pub fn new(config: Config, queue: Q, pacer: P) -> Self {
        Self { config, queue, pacer }
    }

    pub async fn submit_batch<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        guidance_scale: f64,
        steps: u32,
        style_suffix: &str,
    ) -> Result<()> {
        let config = &self.config;
        let mut template = JobTemplate::load(&config.files.workflow)?;
        template
            .prepare(&config.nodes, config.batch.batch_size, guidance_scale, steps)
            .context("workflow is missing required nodes")?;
        debug!("Batch size is now {:?}", template.input(&config.nodes.batch, "batch_size"));
        let prompts = workflow::load_prompts(&config.files.prompts)?;
        let total = prompts.len();
        info!("Loaded {} prompts. Starting batch submission...", total);

        let pause = Duration::from_secs(config.batch.item_pause_secs);
        let mut accepted = 0;
        for (index, raw) in prompts.iter().enumerate() {
            let position = index + 1;
            match self.submit_item(rng, &template, raw, index, style_suffix).await {
                Ok(Receipt { seed, outcome: QueueOutcome::Accepted { prompt_id } }) => {
                    accepted += 1;
                    info!("[{}/{}] Submitted | seed={} | prompt_id={}", position, total, seed, prompt_id);
                }
                Ok(Receipt { outcome: QueueOutcome::Rejected { status, body }, .. }) => {
                    error!("[{}] Submission failed: {} - {}", position, status, body);
                }
                Err(e) => {
                    error!("[{}] Item error: {:#}", position, e);
                }
            }
            // Give the GPU a break, no matter how that went.
            self.pacer.pause(pause).await;
        }

        info!("All tasks submitted ({}/{} accepted). Results land in ComfyUI's output directory.", accepted, total);
        Ok(())
    }

    async fn submit_item<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        template: &JobTemplate,
        raw: &Value,
        index: usize,
        style_suffix: &str,
    ) -> Result<Receipt> {
        let item = PromptItem::from_value(raw)?;
        let params = JobParams {
            index,
            seed: workflow::random_seed(rng),
            style_suffix,
            negative_prompt: &self.config.batch.negative_prompt,
        };
        let job = template.derive(&self.config.nodes, &item, &params)?;
        debug!("Item {} -> {}", index, job.prefix);
        let outcome = self.queue.queue_prompt(&job.workflow).await?;
        Ok(Receipt { seed: job.seed, outcome })
    }
}

#[cfg(test)]
pub mod fakes {
    use std::{collections::VecDeque, sync::Mutex};

    use anyhow::{anyhow, Result};
    use serde_json::Value;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Event {
        Queued(Value),
        Paused(Duration),
    }

    /// Shared, ordered log of what the submitter did.
    #[derive(Default)]
    pub struct Journal(Mutex<Vec<Event>>);

    impl Journal {
        pub fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }

        pub fn queued(&self) -> Vec<Value> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Queued(v) => Some(v),
                    _ => None,
                })
                .collect()
        }

        pub fn pauses(&self) -> Vec<Duration> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Paused(d) => Some(d),
                    _ => None,
                })
                .collect()
        }
    }

    pub enum Scripted {
        Ok(QueueOutcome),
        NetworkError,
    }

    /// Replays scripted answers, then accepts everything.
    pub struct FakeQueue<'a> {
        pub journal: &'a Journal,
        pub script: Mutex<VecDeque<Scripted>>,
    }

    impl<'a> FakeQueue<'a> {
        pub fn new(journal: &'a Journal, script: Vec<Scripted>) -> Self {
            Self { journal, script: Mutex::new(script.into()) }
        }
    }

    impl PromptQueue for FakeQueue<'_> {
        async fn queue_prompt(&self, workflow: &Value) -> Result<QueueOutcome> {
            self.journal.0.lock().unwrap().push(Event::Queued(workflow.clone()));
            match self.script.lock().unwrap().pop_front() {
                Some(Scripted::Ok(outcome)) => Ok(outcome),
                Some(Scripted::NetworkError) => Err(anyhow!("connection reset by peer")),
                None => Ok(QueueOutcome::Accepted { prompt_id: "fake".to_string() }),
            }
        }
    }

    pub struct FakePacer<'a> {
        pub journal: &'a Journal,
    }

    impl Pacer for FakePacer<'_> {
        async fn pause(&self, duration: Duration) {
            self.journal.0.lock().unwrap().push(Event::Paused(duration));
        }
    }
}
