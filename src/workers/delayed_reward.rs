use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::amas::config::RewardPipelineConfig;
use crate::amas::reward::{
    AddRewardOptions, AggregatorState, DelayedRewardAggregator, RewardBreakdown, RewardEvaluator,
};
use crate::amas::types::UserState;

use super::WorkerError;

/// Feeds validated reward back into the models.
#[async_trait]
pub trait RewardApplier: Send + Sync {
    async fn apply_reward(
        &self,
        user_id: &str,
        reward: f64,
        feature_vector: Option<&[f64]>,
        action_index: Option<usize>,
    ) -> Result<(), WorkerError>;
}

/// Source of the learner's current state. `Ok(None)` and `Err` both mean
/// fatigue filtering is skipped for that user.
#[async_trait]
pub trait UserStateProvider: Send + Sync {
    async fn get_user_state(&self, user_id: &str) -> Result<Option<UserState>, WorkerError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedRewardWorkerConfig {
    /// Six-field cron expression.
    pub schedule: String,
    pub enabled: bool,
    pub pipeline: RewardPipelineConfig,
}

impl Default for DelayedRewardWorkerConfig {
    fn default() -> Self {
        Self {
            schedule: "0 * * * * *".to_string(),
            enabled: true,
            pipeline: RewardPipelineConfig::default(),
        }
    }
}

impl DelayedRewardWorkerConfig {
    pub fn from_env(pipeline: RewardPipelineConfig) -> Self {
        let defaults = Self::default();
        Self {
            schedule: std::env::var("DELAYED_REWARD_SCHEDULE").unwrap_or(defaults.schedule),
            enabled: std::env::var("ENABLE_DELAYED_REWARD_WORKER")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            pipeline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTickSummary {
    pub user_id: String,
    /// Increments applied in this tick.
    pub update_count: usize,
    pub total_reward: f64,
    pub avg_confidence: f64,
    pub success: bool,
    /// Dropped for fatigue before evaluation.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub total_users: usize,
    pub total_rewards: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub filtered_count: usize,
    /// Increments put back for a later attempt after an apply failure.
    pub requeued_count: usize,
    /// Increments abandoned after exhausting their retries.
    pub dropped_count: usize,
    pub users: Vec<UserTickSummary>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub processor: AggregatorState,
    pub config: DelayedRewardWorkerConfig,
}

struct UserOutcome {
    summary: UserTickSummary,
    filtered: usize,
    /// Increments not applied because an earlier apply for the user failed.
    unapplied: Vec<RewardBreakdown>,
}

/// Clears the single-flight flag however the tick ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DelayedRewardWorker {
    config: RwLock<DelayedRewardWorkerConfig>,
    aggregator: Mutex<DelayedRewardAggregator>,
    applier: Arc<dyn RewardApplier>,
    state_provider: Option<Arc<dyn UserStateProvider>>,
    processing: AtomicBool,
}

impl DelayedRewardWorker {
    pub fn new(
        config: DelayedRewardWorkerConfig,
        applier: Arc<dyn RewardApplier>,
        state_provider: Option<Arc<dyn UserStateProvider>>,
    ) -> Self {
        let aggregator = DelayedRewardAggregator::from_config(&config.pipeline);
        Self {
            config: RwLock::new(config),
            aggregator: Mutex::new(aggregator),
            applier,
            state_provider,
            processing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> DelayedRewardWorkerConfig {
        self.config.read().clone()
    }

    pub fn add_reward(
        &self,
        user_id: &str,
        reward: f64,
        timestamp_ms: Option<i64>,
        options: AddRewardOptions,
    ) -> Result<String, WorkerError> {
        let id = self
            .aggregator
            .lock()
            .add_reward(user_id, reward, timestamp_ms, options)?;
        Ok(id)
    }

    pub fn pending_count(&self, user_id: Option<&str>) -> usize {
        self.aggregator.lock().pending_count(user_id)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub async fn process_once(&self) -> Option<TickSummary> {
        self.process_at(Utc::now().timestamp_millis()).await
    }

    /// Runs one tick against an explicit clock. Returns `None` when another
    /// tick is already in flight.
    pub async fn process_at(&self, now_ms: i64) -> Option<TickSummary> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("delayed reward tick already running, skipping");
            return None;
        }
        let _in_flight = InFlight(&self.processing);
        let start = Instant::now();

        let due = self.aggregator.lock().aggregate(now_ms, None);
        if due.breakdown.is_empty() {
            debug!(pending = due.pending_count, "no delayed rewards due");
            return Some(TickSummary {
                duration_ms: start.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }

        let config = self.config();
        let evaluator = RewardEvaluator::new(config.pipeline.evaluator.clone());
        let fatigue_threshold = config.pipeline.fatigue_threshold;
        let max_retries = config.pipeline.max_retries;
        let backoff_ms = config.pipeline.retry_backoff_ms;
        let total_rewards = due.breakdown.len();

        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<RewardBreakdown>> = HashMap::new();
        for item in due.breakdown {
            if !grouped.contains_key(&item.user_id) {
                order.push(item.user_id.clone());
            }
            grouped.entry(item.user_id.clone()).or_default().push(item);
        }

        let batches = order.into_iter().map(|user_id| {
            let items = grouped.remove(&user_id).unwrap_or_default();
            self.process_user(user_id, items, &evaluator, fatigue_threshold)
        });
        let outcomes = join_all(batches).await;

        let mut summary = TickSummary {
            total_users: outcomes.len(),
            total_rewards,
            ..Default::default()
        };
        let mut unapplied = Vec::new();
        for outcome in outcomes {
            summary.filtered_count += outcome.filtered;
            unapplied.extend(outcome.unapplied);
            if !outcome.summary.skipped {
                if outcome.summary.success {
                    summary.success_count += 1;
                } else {
                    summary.failure_count += 1;
                }
            }
            summary.users.push(outcome.summary);
        }
        if !unapplied.is_empty() {
            let mut aggregator = self.aggregator.lock();
            for item in &unapplied {
                if item.retry_count >= max_retries {
                    error!(
                        user_id = %item.user_id,
                        event_id = %item.event_id,
                        attempts = item.retry_count + 1,
                        "delayed reward retries exhausted, dropping increment"
                    );
                    summary.dropped_count += 1;
                    continue;
                }
                let due_ms = now_ms.saturating_add(retry_delay_ms(backoff_ms, item.retry_count));
                let retry_id = aggregator.requeue(item, due_ms);
                debug!(
                    user_id = %item.user_id,
                    event_id = %item.event_id,
                    retry_id = %retry_id,
                    due_ms,
                    "delayed reward requeued"
                );
                summary.requeued_count += 1;
            }
        }
        summary.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            users = summary.total_users,
            rewards = summary.total_rewards,
            success = summary.success_count,
            failure = summary.failure_count,
            filtered = summary.filtered_count,
            requeued = summary.requeued_count,
            dropped = summary.dropped_count,
            duration_ms = summary.duration_ms,
            "Delayed reward cycle completed"
        );
        Some(summary)
    }

    async fn process_user(
        &self,
        user_id: String,
        items: Vec<RewardBreakdown>,
        evaluator: &RewardEvaluator,
        fatigue_threshold: f64,
    ) -> UserOutcome {
        let state = match &self.state_provider {
            Some(provider) => match provider.get_user_state(&user_id).await {
                Ok(state) => state,
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "user state unavailable, skipping fatigue filter");
                    None
                }
            },
            None => None,
        };

        if let Some(state) = state.as_ref().filter(|s| s.fatigue > fatigue_threshold) {
            info!(
                user_id = %user_id,
                fatigue = state.fatigue,
                dropped = items.len(),
                "user too fatigued, dropping delayed rewards for this cycle"
            );
            return UserOutcome {
                filtered: items.len(),
                unapplied: Vec::new(),
                summary: UserTickSummary {
                    user_id,
                    update_count: 0,
                    total_reward: 0.0,
                    avg_confidence: 0.0,
                    success: true,
                    skipped: true,
                },
            };
        }

        let mut filtered = 0;
        let mut applied = 0;
        let mut total_reward = 0.0;
        let mut confidence_sum = 0.0;
        let mut unapplied = Vec::new();

        for (pos, item) in items.iter().enumerate() {
            let evaluation = evaluator.evaluate_reward(item, state.as_ref());
            if !evaluation.is_valid {
                debug!(
                    user_id = %user_id,
                    event_id = %item.event_id,
                    reason = evaluation.reason.as_str(),
                    "delayed reward filtered"
                );
                filtered += 1;
                continue;
            }
            match self
                .applier
                .apply_reward(
                    &user_id,
                    evaluation.adjusted_reward,
                    item.feature_vector.as_deref(),
                    item.action_index,
                )
                .await
            {
                Ok(()) => {
                    applied += 1;
                    total_reward += evaluation.adjusted_reward;
                    confidence_sum += evaluation.confidence;
                }
                Err(err) => {
                    error!(
                        user_id = %user_id,
                        event_id = %item.event_id,
                        remaining = items.len() - pos,
                        error = %err,
                        "failed to apply delayed reward"
                    );
                    unapplied = items[pos..].to_vec();
                    break;
                }
            }
        }

        UserOutcome {
            filtered,
            summary: UserTickSummary {
                user_id,
                update_count: applied,
                total_reward,
                avg_confidence: if applied > 0 { confidence_sum / applied as f64 } else { 0.0 },
                success: unapplied.is_empty(),
                skipped: false,
            },
            unapplied,
        }
    }

    pub fn get_state(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            processor: self.aggregator.lock().get_state(),
            config: self.config(),
        }
    }

    pub fn set_state(&self, snapshot: WorkerSnapshot) {
        let mut aggregator = DelayedRewardAggregator::from_config(&snapshot.config.pipeline);
        aggregator.set_state(snapshot.processor);
        *self.aggregator.lock() = aggregator;
        *self.config.write() = snapshot.config;
    }
}

/// Exponential backoff: `base`, then doubled per earlier failure.
fn retry_delay_ms(base_ms: u64, retry_count: u32) -> i64 {
    let delay = base_ms.saturating_mul(1u64 << retry_count.min(20));
    i64::try_from(delay).unwrap_or(i64::MAX)
}
