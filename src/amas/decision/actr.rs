//! ACT-R memory learner.
//!
//! Activation over the review trace: `A = ln(Σ w_j · t_j^(-d))`, with
//! `w_j = 1` for correct reviews and [`ERROR_PENALTY`] otherwise. Recall
//! probability: `P = 1 / (1 + exp(-(A - τ) / s))`.
//!
//! High recall favours longer review intervals and harder material; low
//! recall favours shorter intervals, easier items and more hints. Rewards
//! nudge the personal decay rate.

use serde::{Deserialize, Serialize};

use crate::amas::config::ActrConfig;
use crate::amas::types::{DifficultyLevel, MemoryTrace, StrategyParams, UserState};

use super::{ensure_candidates, Learner, LearnerContext, LearnerError, LearnerKind, LearnerOutput};

const ERROR_PENALTY: f64 = 0.3;
const MIN_TIME: f64 = 1e-3;
const MIN_DECAY: f64 = 0.3;
const MAX_DECAY: f64 = 0.8;
const DECAY_STEP: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActrMemoryLearner {
    config: ActrConfig,
    decay: f64,
    update_count: u64,
}

impl ActrMemoryLearner {
    pub fn new(config: ActrConfig) -> Self {
        let decay = config.decay.clamp(MIN_DECAY, MAX_DECAY);
        Self {
            config,
            decay,
            update_count: 0,
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn activation(&self, traces: &[MemoryTrace]) -> Result<f64, LearnerError> {
        let mut sum = 0.0;
        for trace in traces {
            if !trace.seconds_ago.is_finite() || trace.seconds_ago < 0.0 {
                return Err(LearnerError::Numerical {
                    learner: "actr".to_string(),
                    detail: format!("invalid trace age {}", trace.seconds_ago),
                });
            }
            let weight = if trace.is_correct { 1.0 } else { ERROR_PENALTY };
            sum += weight * trace.seconds_ago.max(MIN_TIME).powf(-self.decay);
        }
        if sum <= 0.0 {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(sum.ln())
    }

    pub fn recall_probability(&self, activation: f64) -> f64 {
        if activation == f64::NEG_INFINITY {
            return 0.0;
        }
        let s = self.config.noise_scale.max(1e-6);
        1.0 / (1.0 + (-(activation - self.config.threshold) / s).exp())
    }

    fn action_score(recall: f64, action: &StrategyParams) -> f64 {
        let desired_scale = 0.5 + recall;
        let interval_fit = 1.0 - (action.interval_scale - desired_scale).abs().min(1.0);
        let desired_difficulty = if recall >= 0.75 {
            DifficultyLevel::Hard
        } else if recall >= 0.4 {
            DifficultyLevel::Mid
        } else {
            DifficultyLevel::Easy
        };
        let gap = (action.difficulty.index() as f64 - desired_difficulty.index() as f64).abs();
        let difficulty_fit = 1.0 - gap / 2.0;
        let desired_hint = ((1.0 - recall) * 2.0).round();
        let hint_fit = 1.0 - (action.hint_level as f64 - desired_hint).abs() / 2.0;
        0.5 * interval_fit + 0.35 * difficulty_fit + 0.15 * hint_fit
    }
}

impl Default for ActrMemoryLearner {
    fn default() -> Self {
        Self::new(ActrConfig::default())
    }
}

impl Learner for ActrMemoryLearner {
    fn name(&self) -> &str {
        "actr"
    }

    fn version(&self) -> &str {
        "1.2.0"
    }

    fn kind(&self) -> LearnerKind {
        LearnerKind::Actr
    }

    fn select_action(
        &mut self,
        _state: &UserState,
        actions: &[StrategyParams],
        ctx: &LearnerContext<'_>,
    ) -> Result<LearnerOutput, LearnerError> {
        ensure_candidates(actions)?;
        let trace = ctx.review_trace.ok_or_else(|| LearnerError::Unavailable {
            learner: self.name().to_string(),
            detail: "no review trace supplied".to_string(),
        })?;

        let activation = self.activation(trace)?;
        let recall = self.recall_probability(activation);

        let mut best_idx = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, action) in actions.iter().enumerate() {
            let score = Self::action_score(recall, action);
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }

        let confidence = (1.0 - (-(trace.len() as f64) / 3.0).exp()).clamp(0.1, 0.95);
        Ok(LearnerOutput {
            action: actions[best_idx].clone(),
            score: best_score,
            confidence,
            meta: Some(serde_json::json!({
                "activation": if activation.is_finite() { activation } else { -1e9 },
                "recall": recall,
                "decay": self.decay,
            })),
        })
    }

    fn update(
        &mut self,
        _state: &UserState,
        _action: &StrategyParams,
        reward: f64,
        _ctx: &LearnerContext<'_>,
    ) -> Result<(), LearnerError> {
        // Poor outcomes suggest faster forgetting than assumed.
        self.decay = (self.decay - DECAY_STEP * reward).clamp(MIN_DECAY, MAX_DECAY);
        self.update_count += 1;
        Ok(())
    }
}
