pub mod amas;
pub mod config;
pub mod logging;
pub mod workers;

use std::sync::Arc;

use crate::amas::AmasEngine;
use crate::config::Config;
use crate::workers::{DelayedRewardWorker, RewardApplier, UserStateProvider, WorkerManager};

/// The engine with its delayed-reward loop closed in-process.
pub struct AmasRuntime {
    pub engine: Arc<AmasEngine>,
    pub worker: Arc<DelayedRewardWorker>,
    pub workers: WorkerManager,
}

impl AmasRuntime {
    pub fn new(config: &Config) -> Self {
        let engine = Arc::new(AmasEngine::new(config.amas.clone()));
        let applier: Arc<dyn RewardApplier> = engine.clone();
        let provider: Arc<dyn UserStateProvider> = engine.clone();
        let worker = Arc::new(DelayedRewardWorker::new(
            config.delayed_reward.clone(),
            applier,
            Some(provider),
        ));
        let workers = WorkerManager::new(Arc::clone(&worker));
        Self {
            engine,
            worker,
            workers,
        }
    }
}
