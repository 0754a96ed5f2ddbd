// The outer loop: pick a random point in the sweep, run a batch with it, cool down, repeat.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::info;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{
    comfy::PromptQueue,
    config::{SweepConfig, SweepParam},
    pacing::Pacer,
    submitter::BatchSubmitter,
};

/// One point of the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct RunChoice {
    pub param: SweepParam,
    pub style: String,
}

/// Pair and style are drawn independently.
pub fn choose<R: Rng + ?Sized>(rng: &mut R, sweep: &SweepConfig) -> Result<RunChoice> {
    let param = *sweep.params.choose(rng).context("no sweep params configured")?;
    let style = sweep.styles.choose(rng).context("no styles configured")?.clone();
    Ok(RunChoice { param, style })
}

/// A fresh RNG seeded from the wall clock.
pub fn wall_clock_rng() -> StdRng {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    StdRng::seed_from_u64(nanos)
}

impl<Q: PromptQueue, P: Pacer> BatchSubmitter<Q, P> {
    /// Runs `runs` batches back to back. Stops early only if a batch can't start at all.
    pub async fn run_sweep(&self, runs: u32) -> Result<()> {
        let cooldown = Duration::from_secs(self.config.sweep.cooldown_secs);
        for run in 1..=runs {
            let mut rng = wall_clock_rng();
            let RunChoice { param, style } = choose(&mut rng, &self.config.sweep)?;
            let SweepParam { guidance_scale, steps } = param;

            info!("=== Run config: cfg={}, steps={}, style suffix='{}', run {}/{} ===", guidance_scale, steps, style, run, runs);
            self.submit_batch(&mut rng, guidance_scale, steps, &style)
                .await
                .with_context(|| format!("run {run} failed"))?;
            info!("=== Completed config: cfg={}, steps={}, style suffix='{}', run {}/{} ===", guidance_scale, steps, style, run, runs);

            self.pacer.pause(cooldown).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::{
        config::Config,
        submitter::fakes::{FakePacer, FakeQueue, Journal},
        workflow::test_template,
    };

    #[test]
    fn test_choose_covers_everything() {
        let sweep = SweepConfig::default();
        let mut rng = StdRng::seed_from_u64(11);
        let mut params = HashSet::new();
        let mut styles = HashSet::new();
        for _ in 0..500 {
            let choice = choose(&mut rng, &sweep).unwrap();
            assert!(sweep.params.contains(&choice.param));
            assert!(sweep.styles.contains(&choice.style));
            params.insert(choice.param.steps);
            styles.insert(choice.style);
        }
        assert_eq!(params.len(), sweep.params.len());
        assert_eq!(styles.len(), sweep.styles.len());
    }

    #[test]
    fn test_choose_empty() {
        let sweep = SweepConfig { styles: vec![], ..SweepConfig::default() };
        assert!(choose(&mut StdRng::seed_from_u64(0), &sweep).is_err());
        let sweep = SweepConfig { params: vec![], ..SweepConfig::default() };
        assert!(choose(&mut StdRng::seed_from_u64(0), &sweep).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_run_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.files.workflow = dir.path().join("workflow.json").display().to_string();
        config.files.prompts = dir.path().join("prompts.json").display().to_string();
        std::fs::write(&config.files.workflow, test_template().to_string()).unwrap();
        std::fs::write(&config.files.prompts, json!([{ "positive": "a cat" }]).to_string()).unwrap();
        let sweep = config.sweep.clone();

        let journal = Journal::default();
        let submitter = BatchSubmitter::new(config, FakeQueue::new(&journal, vec![]), FakePacer { journal: &journal });
        submitter.run_sweep(2).await.unwrap();

        let item_pause = Duration::from_secs(360);
        let cooldown = Duration::from_secs(120);
        assert_eq!(journal.pauses(), vec![item_pause, cooldown, item_pause, cooldown]);

        for workflow in journal.queued() {
            let cfg = workflow["694"]["inputs"]["cfg"].as_f64().unwrap();
            let steps = workflow["751"]["inputs"]["steps"].as_u64().unwrap() as u32;
            assert!(sweep.params.contains(&SweepParam { guidance_scale: cfg, steps }));
            let text = workflow["748"]["inputs"]["text"].as_str().unwrap();
            let suffix = text.strip_prefix("a cat ").unwrap();
            assert!(sweep.styles.iter().any(|s| s == suffix));
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_run_sweep_stops_on_broken_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.files.workflow = dir.path().join("workflow.json").display().to_string();
        config.files.prompts = dir.path().join("prompts.json").display().to_string();
        std::fs::write(&config.files.workflow, json!({ "1": { "inputs": {} } }).to_string()).unwrap();
        std::fs::write(&config.files.prompts, "[]").unwrap();

        let journal = Journal::default();
        let submitter = BatchSubmitter::new(config, FakeQueue::new(&journal, vec![]), FakePacer { journal: &journal });
        assert!(submitter.run_sweep(3).await.is_err());
        assert!(journal.events().is_empty());
    }
}
