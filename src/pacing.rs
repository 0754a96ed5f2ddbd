// GPU pacing. ComfyUI gives us no backpressure, so we just wait between jobs.

use std::time::Duration;

use log::debug;

#[allow(async_fn_in_trait)]
pub trait Pacer {
    async fn pause(&self, duration: Duration);
}

/// Sleeps for real.
pub struct SleepPacer;

impl Pacer for SleepPacer {
    async fn pause(&self, duration: Duration) {
        debug!("Sleeping for {:?}", duration);
        tokio::time::sleep(duration).await;
    }
}
