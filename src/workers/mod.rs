mod delayed_reward;

pub use delayed_reward::{
    DelayedRewardWorker, DelayedRewardWorkerConfig, RewardApplier, TickSummary, UserStateProvider,
    UserTickSummary, WorkerSnapshot,
};

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::amas::reward::RewardError;

/// Drives [`DelayedRewardWorker`] on its cron schedule.
pub struct WorkerManager {
    scheduler: Mutex<Option<JobScheduler>>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Arc<DelayedRewardWorker>,
}

impl WorkerManager {
    pub fn new(worker: Arc<DelayedRewardWorker>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            scheduler: Mutex::new(None),
            shutdown_tx,
            worker,
        }
    }

    pub fn worker(&self) -> &Arc<DelayedRewardWorker> {
        &self.worker
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        let config = self.worker.config();
        if !config.enabled {
            info!("ENABLE_DELAYED_REWARD_WORKER is off, skipping worker startup");
            return Ok(());
        }
        cron::Schedule::from_str(&config.schedule)
            .map_err(|e| WorkerError::InvalidSchedule(format!("{}: {e}", config.schedule)))?;

        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            warn!("delayed reward worker already running");
            return Ok(());
        }

        let scheduler = JobScheduler::new().await?;
        let worker = Arc::clone(&self.worker);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let job = Job::new_async(config.schedule.as_str(), move |_uuid, _lock| {
            let worker = Arc::clone(&worker);
            let mut rx = shutdown_rx.resubscribe();
            Box::pin(async move {
                tokio::select! {
                    _ = rx.recv() => {},
                    summary = worker.process_once() => {
                        if summary.is_none() {
                            info!("previous delayed reward tick still running");
                        }
                    }
                }
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        *slot = Some(scheduler);

        info!(schedule = %config.schedule, "Delayed reward worker scheduled");
        Ok(())
    }

    pub async fn stop(&self) {
        let Some(mut scheduler) = self.scheduler.lock().await.take() else {
            return;
        };
        info!("Stopping workers...");
        let _ = self.shutdown_tx.send(());
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Error shutting down scheduler");
        }
        info!("Workers stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("Reward rejected: {0}")]
    Reward(#[from] RewardError),
    #[error("Apply failed: {0}")]
    Apply(String),
    #[error("User state unavailable: {0}")]
    UserState(String),
}
