pub mod aggregator;
pub mod evaluator;

pub use aggregator::{
    AddRewardOptions, AggregateResult, AggregatorState, DelayedRewardAggregator,
    DelayedRewardEvent, RewardBreakdown,
};
pub use evaluator::{EvaluationReason, RewardEvaluation, RewardEvaluator};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RewardError {
    #[error("reward must be finite, got {0}")]
    InvalidReward(f64),
    #[error("feature vector must not be empty")]
    EmptyFeatureVector,
}

/// One delivery horizon of the delayed-reward schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub delay_sec: u64,
    pub weight: f64,
    pub label: String,
}

impl ScheduleEntry {
    pub fn new(delay_sec: u64, weight: f64, label: impl Into<String>) -> Self {
        Self {
            delay_sec,
            weight,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// When false every breakdown passes with full confidence.
    pub enabled: bool,
    pub min_confidence: f64,
    /// Share of a positive increment discounted at full fatigue.
    pub fatigue_dampening: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.3,
            fatigue_dampening: 0.3,
        }
    }
}
