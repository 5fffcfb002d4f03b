//! Multi-timescale delivery of delayed rewards.
//!
//! Each reward is split across a schedule of horizons (by default
//! 0s/1h/6h/24h/7d weighted 0.30/0.20/0.15/0.20/0.15). `aggregate` releases
//! whatever share has become due since the previous call, so repeated calls
//! with the same clock deliver nothing new.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::amas::config::RewardPipelineConfig;

use super::{RewardError, ScheduleEntry};

const SECONDS_PER_DAY: u64 = 86_400;
/// Longest accepted delivery horizon; longer delays are capped.
pub const MAX_DELAY_SEC: u64 = 365 * SECONDS_PER_DAY;
const FULLY_DELIVERED: f64 = 1.0 - 1e-9;

pub fn default_schedule() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry::new(0, 0.30, "immediate"),
        ScheduleEntry::new(3_600, 0.20, "1h"),
        ScheduleEntry::new(21_600, 0.15, "6h"),
        ScheduleEntry::new(86_400, 0.20, "24h"),
        ScheduleEntry::new(604_800, 0.15, "7d"),
    ]
}

/// Sorts by delay, zeroes unusable weights and rescales to a unit sum.
/// Falls back to [`default_schedule`] when nothing positive remains.
pub fn normalize_schedule(entries: Vec<ScheduleEntry>) -> Vec<ScheduleEntry> {
    let mut entries: Vec<ScheduleEntry> = entries
        .into_iter()
        .map(|mut e| {
            if !e.weight.is_finite() || e.weight < 0.0 {
                e.weight = 0.0;
            }
            e.delay_sec = e.delay_sec.min(MAX_DELAY_SEC);
            e
        })
        .collect();
    let total: f64 = entries.iter().map(|e| e.weight).sum();
    if entries.is_empty() || total <= 0.0 {
        tracing::warn!("reward schedule has no positive weight, using default");
        return default_schedule();
    }
    entries.sort_by_key(|e| e.delay_sec);
    if (total - 1.0).abs() > 1e-12 {
        for entry in entries.iter_mut() {
            entry.weight /= total;
        }
    }
    entries
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedRewardEvent {
    pub id: String,
    pub user_id: String,
    pub reward: f64,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub delivered_weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_vector: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
    /// Non-zero for a requeued increment: `reward` is already weighted and is
    /// released whole once `created_at` is reached.
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AddRewardOptions {
    pub feature_vector: Option<Vec<f64>>,
    pub action_index: Option<usize>,
    pub id: Option<String>,
}

/// The share of one event released by a single `aggregate` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardBreakdown {
    pub event_id: String,
    pub user_id: String,
    pub increment: f64,
    /// Cumulative delivered weight after this release.
    pub delivered_weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_vector: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
    /// Failed apply attempts behind this increment.
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub total_increment: f64,
    pub breakdown: Vec<RewardBreakdown>,
    pub pending_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorState {
    pub schedule: Vec<ScheduleEntry>,
    pub events: Vec<DelayedRewardEvent>,
}

pub struct DelayedRewardAggregator {
    schedule: Vec<ScheduleEntry>,
    queue: VecDeque<DelayedRewardEvent>,
    max_queue_size: usize,
    max_age_ms: i64,
}

impl DelayedRewardAggregator {
    pub fn new(schedule: Option<Vec<ScheduleEntry>>, max_queue_size: usize) -> Self {
        let schedule = normalize_schedule(schedule.unwrap_or_else(default_schedule));
        let max_age_ms = Self::max_age_for(&schedule);
        Self {
            schedule,
            queue: VecDeque::new(),
            max_queue_size: max_queue_size.max(1),
            max_age_ms,
        }
    }

    pub fn from_config(config: &RewardPipelineConfig) -> Self {
        Self::new(config.schedule.clone(), config.max_queue_size)
    }

    fn max_age_for(schedule: &[ScheduleEntry]) -> i64 {
        let max_delay = schedule.iter().map(|e| e.delay_sec).max().unwrap_or(0);
        i64::try_from(max_delay.saturating_add(SECONDS_PER_DAY).saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    pub fn schedule(&self) -> &[ScheduleEntry] {
        &self.schedule
    }

    /// Queues a reward and returns its event id. `timestamp_ms` defaults to now.
    pub fn add_reward(
        &mut self,
        user_id: &str,
        reward: f64,
        timestamp_ms: Option<i64>,
        options: AddRewardOptions,
    ) -> Result<String, RewardError> {
        if !reward.is_finite() {
            return Err(RewardError::InvalidReward(reward));
        }
        if options.feature_vector.as_ref().is_some_and(|v| v.is_empty()) {
            return Err(RewardError::EmptyFeatureVector);
        }

        let id = options
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.enqueue(DelayedRewardEvent {
            id: id.clone(),
            user_id: user_id.to_string(),
            reward: reward.clamp(-1.0, 1.0),
            created_at: timestamp_ms.unwrap_or_else(|| Utc::now().timestamp_millis()),
            delivered_weight: 0.0,
            feature_vector: options.feature_vector,
            action_index: options.action_index,
            retry_count: 0,
        });
        Ok(id)
    }

    /// Queues an increment that could not be applied so it is released whole
    /// at `due_ms`, with its attempt count bumped. Returns the new event id.
    pub fn requeue(&mut self, item: &RewardBreakdown, due_ms: i64) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.enqueue(DelayedRewardEvent {
            id: id.clone(),
            user_id: item.user_id.clone(),
            reward: item.increment.clamp(-1.0, 1.0),
            created_at: due_ms,
            delivered_weight: 0.0,
            feature_vector: item.feature_vector.clone(),
            action_index: item.action_index,
            retry_count: item.retry_count.saturating_add(1),
        });
        id
    }

    fn enqueue(&mut self, event: DelayedRewardEvent) {
        self.queue.push_back(event);

        let mut pruned = 0usize;
        while self.queue.len() > self.max_queue_size {
            self.queue.pop_front();
            pruned += 1;
        }
        if pruned > 0 {
            tracing::warn!(pruned, max = self.max_queue_size, "delayed reward queue full, dropped oldest");
        }
    }

    fn cumulative_weight(&self, elapsed_sec: u64) -> f64 {
        match self.schedule.last() {
            Some(last) if elapsed_sec >= last.delay_sec => 1.0,
            _ => self
                .schedule
                .iter()
                .filter(|e| e.delay_sec <= elapsed_sec)
                .map(|e| e.weight)
                .sum(),
        }
    }

    /// Releases every share due at `now_ms`, optionally for one user only.
    pub fn aggregate(&mut self, now_ms: i64, user_id: Option<&str>) -> AggregateResult {
        let mut result = AggregateResult::default();
        let mut expired = 0usize;
        let queue = std::mem::take(&mut self.queue);
        let mut kept = VecDeque::with_capacity(queue.len());

        for mut event in queue {
            if user_id.is_some_and(|u| u != event.user_id) {
                kept.push_back(event);
                continue;
            }
            let age_ms = now_ms.saturating_sub(event.created_at);
            if age_ms > self.max_age_ms {
                expired += 1;
                continue;
            }
            if age_ms < 0 {
                kept.push_back(event);
                continue;
            }

            let target = if event.retry_count > 0 {
                1.0
            } else {
                self.cumulative_weight((age_ms / 1000) as u64)
            };
            let delta = target - event.delivered_weight;
            if delta > 1e-12 {
                let increment = delta * event.reward;
                event.delivered_weight = target;
                result.total_increment += increment;
                result.breakdown.push(RewardBreakdown {
                    event_id: event.id.clone(),
                    user_id: event.user_id.clone(),
                    increment,
                    delivered_weight: event.delivered_weight,
                    feature_vector: event.feature_vector.clone(),
                    action_index: event.action_index,
                    retry_count: event.retry_count,
                });
            }
            if event.delivered_weight < FULLY_DELIVERED {
                kept.push_back(event);
            }
        }

        self.queue = kept;
        if expired > 0 {
            tracing::debug!(expired, "discarded expired delayed reward events");
        }
        result.pending_count = self.pending_count(user_id);
        result
    }

    pub fn pending_count(&self, user_id: Option<&str>) -> usize {
        match user_id {
            Some(user) => self.queue.iter().filter(|e| e.user_id == user).count(),
            None => self.queue.len(),
        }
    }

    /// Removes queued events and returns how many were dropped.
    pub fn clear(&mut self, user_id: Option<&str>) -> usize {
        let before = self.queue.len();
        match user_id {
            Some(user) => self.queue.retain(|e| e.user_id != user),
            None => self.queue.clear(),
        }
        before - self.queue.len()
    }

    pub fn get_state(&self) -> AggregatorState {
        AggregatorState {
            schedule: self.schedule.clone(),
            events: self.queue.iter().cloned().collect(),
        }
    }

    pub fn set_state(&mut self, state: AggregatorState) {
        if !state.schedule.is_empty() {
            self.schedule = normalize_schedule(state.schedule);
            self.max_age_ms = Self::max_age_for(&self.schedule);
        }
        self.queue = state
            .events
            .into_iter()
            .filter(|e| e.reward.is_finite() && e.delivered_weight.is_finite())
            .map(|mut e| {
                e.reward = e.reward.clamp(-1.0, 1.0);
                e.delivered_weight = e.delivered_weight.clamp(0.0, 1.0);
                e
            })
            .collect();
        while self.queue.len() > self.max_queue_size {
            self.queue.pop_front();
        }
    }
}

impl Default for DelayedRewardAggregator {
    fn default() -> Self {
        Self::new(None, RewardPipelineConfig::default().max_queue_size)
    }
}
