use serde::{Deserialize, Serialize};

use crate::amas::types::UserState;

use super::{EvaluatorConfig, RewardBreakdown};

const NO_SIGNAL: f64 = 1e-6;
const THRESHOLD_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
    QualityControlDisabled,
    NoSignal,
    NegativeSignal,
    Accepted,
    LowConfidence,
}

impl EvaluationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QualityControlDisabled => "quality_control_disabled",
            Self::NoSignal => "no_signal",
            Self::NegativeSignal => "negative_signal",
            Self::Accepted => "accepted",
            Self::LowConfidence => "low_confidence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardEvaluation {
    pub is_valid: bool,
    pub adjusted_reward: f64,
    pub confidence: f64,
    pub reason: EvaluationReason,
}

/// Quality gate between the aggregator and the models.
#[derive(Debug, Clone, Default)]
pub struct RewardEvaluator {
    config: EvaluatorConfig,
}

impl RewardEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn evaluate_reward(
        &self,
        breakdown: &RewardBreakdown,
        user_state: Option<&UserState>,
    ) -> RewardEvaluation {
        let increment = breakdown.increment;

        if !self.config.enabled {
            return RewardEvaluation {
                is_valid: true,
                adjusted_reward: increment,
                confidence: 1.0,
                reason: EvaluationReason::QualityControlDisabled,
            };
        }

        if !increment.is_finite() || increment.abs() < NO_SIGNAL {
            return RewardEvaluation {
                is_valid: false,
                adjusted_reward: 0.0,
                confidence: 0.0,
                reason: EvaluationReason::NoSignal,
            };
        }

        // Negative feedback is always trusted.
        if increment < 0.0 {
            return RewardEvaluation {
                is_valid: true,
                adjusted_reward: increment,
                confidence: 1.0,
                reason: EvaluationReason::NegativeSignal,
            };
        }

        let fatigue_factor = user_state
            .map(|s| 1.0 - s.fatigue.clamp(0.0, 1.0) * self.config.fatigue_dampening)
            .unwrap_or(1.0);
        let confidence = (increment.abs() * fatigue_factor).clamp(0.0, 1.0);

        if confidence + THRESHOLD_EPSILON >= self.config.min_confidence {
            RewardEvaluation {
                is_valid: true,
                adjusted_reward: increment,
                confidence,
                reason: EvaluationReason::Accepted,
            }
        } else {
            RewardEvaluation {
                is_valid: false,
                adjusted_reward: 0.0,
                confidence,
                reason: EvaluationReason::LowConfidence,
            }
        }
    }

    pub fn evaluate_batch(
        &self,
        items: &[(RewardBreakdown, Option<UserState>)],
    ) -> Vec<RewardEvaluation> {
        items
            .iter()
            .map(|(breakdown, state)| self.evaluate_reward(breakdown, state.as_ref()))
            .collect()
    }
}
