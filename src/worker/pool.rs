//! Worker pool coordinator: keeps N workers looping, watches queue depth,
//! and scales the pool between its configured bounds. The control loop runs
//! at a much slower cadence than individual processing cycles and is the
//! only place pool membership changes.

use std::collections::VecDeque;
use std::time::Duration;

use metrics::gauge;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

use super::{Worker, WorkerContext};

/// How many dead-letter records to mirror into the job store per tick.
const DEAD_LETTER_DRAIN_CHUNK: usize = 64;

#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_high_water: u64,
    pub queue_low_water: u64,
    pub sample_interval: Duration,
    pub sample_window: usize,
}

impl ScalingConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            queue_high_water: config.queue_high_water,
            queue_low_water: config.queue_low_water,
            sample_interval: Duration::from_secs(config.scale_sample_interval_secs),
            sample_window: config.scale_sample_window,
        }
    }
}

struct WorkerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct WorkerPool {
    ctx: WorkerContext,
    scaling: ScalingConfig,
    spawned: usize,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, scaling: ScalingConfig) -> Self {
        Self { ctx, scaling, spawned: 0 }
    }

    /// Run until `shutdown` is cancelled. Scale-out requires the depth to
    /// exceed the high-water mark for a full sampling window; scale-in
    /// requires a full window below the low-water mark. The window resets
    /// after every scaling action so bursts cannot trigger a ramp in one
    /// tick.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut workers: Vec<WorkerHandle> = Vec::new();
        for _ in 0..self.scaling.min_workers {
            self.spawn_worker(&mut workers, &shutdown);
        }
        tracing::info!(
            workers = workers.len(),
            backend = self.ctx.backend.name(),
            "worker pool started"
        );

        let mut window: VecDeque<u64> = VecDeque::new();
        let mut ticker = tokio::time::interval(self.scaling.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.ctx.queue.depth().await {
                Ok(depth) => {
                    gauge!("pod_queue_depth").set(depth as f64);
                    window.push_back(depth);
                    if window.len() > self.scaling.sample_window {
                        window.pop_front();
                    }
                    if window.len() == self.scaling.sample_window {
                        let sustained_high =
                            window.iter().all(|d| *d > self.scaling.queue_high_water);
                        let sustained_low =
                            window.iter().all(|d| *d < self.scaling.queue_low_water);
                        if sustained_high && workers.len() < self.scaling.max_workers {
                            tracing::info!(depth, workers = workers.len() + 1, "queue depth sustained above high water, scaling out");
                            self.spawn_worker(&mut workers, &shutdown);
                            window.clear();
                        } else if sustained_low && workers.len() > self.scaling.min_workers {
                            if let Some(handle) = workers.pop() {
                                tracing::info!(depth, workers = workers.len(), "queue depth sustained below low water, scaling in");
                                handle.token.cancel();
                            }
                            window.clear();
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to sample queue depth"),
            }
            gauge!("pod_worker_count").set(workers.len() as f64);

            self.drain_dead_letters().await;
        }

        tracing::info!("worker pool shutting down");
        for handle in &workers {
            handle.token.cancel();
        }
        for handle in workers {
            let _ = handle.task.await;
        }
        tracing::info!("worker pool stopped");
    }

    fn spawn_worker(&mut self, workers: &mut Vec<WorkerHandle>, shutdown: &CancellationToken) {
        let token = shutdown.child_token();
        let worker = Worker::new(self.spawned, self.ctx.clone());
        self.spawned += 1;
        let task = tokio::spawn(worker.run(token.clone()));
        workers.push(WorkerHandle { token, task });
    }

    /// Mirror dead-letter sink records into the job store so read-back can
    /// report failed jobs, including ones dead-lettered by visibility-expiry
    /// recovery with no worker attached.
    async fn drain_dead_letters(&self) {
        match self.ctx.queue.drain_dead_letters(DEAD_LETTER_DRAIN_CHUNK).await {
            Ok(records) => {
                for record in records {
                    if let Err(e) = self.ctx.results.record_failure(&record).await {
                        tracing::warn!(job_id = %record.job_id, error = %e, "failed to mirror dead-letter record");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to drain dead-letter sink"),
        }
    }
}
