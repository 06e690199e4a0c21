//! Fixed-interval driver for the update pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dataset::DatasetOpener;
use crate::fetch::Fetch;
use crate::update::UpdatePipeline;

/// Fires all update jobs on a fixed wall-clock interval, plus once at
/// startup when dataset files are missing.
#[derive(Clone)]
pub struct Scheduler<O: DatasetOpener, F: Fetch> {
    pipeline: Arc<UpdatePipeline<O, F>>,
    interval: Duration,
}

impl<O: DatasetOpener, F: Fetch> Scheduler<O, F> {
    pub fn new(pipeline: Arc<UpdatePipeline<O, F>>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    /// First-run bootstrap: if any canonical dataset file is missing,
    /// run every job once and wait for completion before serving starts.
    /// Returns whether a download pass was performed.
    pub async fn bootstrap(&self) -> bool {
        if !self.pipeline.any_dataset_missing() {
            debug!("all dataset files present, skipping initial download");
            return false;
        }
        info!("dataset files missing, performing initial download");
        self.pipeline.run_all().await;
        true
    }

    /// Run until the token is cancelled. Individual job failures are
    /// logged by the pipeline and never stop the loop; a tick missed
    /// while a pass is still running is skipped, not caught up.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval completes immediately;
        // consume it so the first scheduled pass lands one full interval
        // after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("update scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    info!("starting scheduled dataset update");
                    self.pipeline.run_all().await;
                }
            }
        }
    }
}
