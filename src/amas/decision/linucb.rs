use serde::{Deserialize, Serialize};

use crate::amas::types::{DifficultyLevel, StrategyParams, UserState};

use super::{ensure_candidates, Learner, LearnerContext, LearnerError, LearnerKind, LearnerOutput};

pub const CONTEXT_FEATURE_DIM: usize = 8;
pub const ACTION_FEATURE_DIM: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinUCBModel {
    d: usize,
    alpha: f64,
    a: Vec<Vec<f64>>,
    b: Vec<f64>,
    context_dim: usize,
    action_dim: usize,
    #[serde(default)]
    update_count: u64,
}

impl LinUCBModel {
    pub fn new(context_dim: usize, action_dim: usize, alpha: f64) -> Self {
        let d = context_dim + action_dim;
        let mut a = vec![vec![0.0; d]; d];
        for (i, row) in a.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            d,
            alpha,
            a,
            b: vec![0.0; d],
            context_dim,
            action_dim,
            update_count: 0,
        }
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn context_features(state: &UserState, ctx: &LearnerContext<'_>) -> Vec<f64> {
        vec![
            state.attention.clamp(0.0, 1.0),
            state.fatigue.clamp(0.0, 1.0),
            state.cognitive.mem.clamp(0.0, 1.0),
            state.cognitive.speed.clamp(0.0, 1.0),
            ((state.motivation + 1.0) / 2.0).clamp(0.0, 1.0),
            ctx.recent_error_rate.clamp(0.0, 1.0),
            (ctx.recent_response_time / 10_000.0).clamp(0.0, 1.0),
            f64::from(ctx.time_bucket.min(23)) / 23.0,
        ]
    }

    pub fn build_features(&self, context: &[f64], strategy: &StrategyParams) -> Vec<f64> {
        let mut x = vec![0.0; self.d];
        let context_len = self.context_dim.min(context.len());
        x[..context_len].copy_from_slice(&context[..context_len]);
        let action_features = Self::strategy_to_action_features(strategy);
        let action_len = self.action_dim.min(action_features.len());
        x[self.context_dim..self.context_dim + action_len]
            .copy_from_slice(&action_features[..action_len]);
        x
    }

    fn strategy_to_action_features(strategy: &StrategyParams) -> Vec<f64> {
        let difficulty_val = match strategy.difficulty {
            DifficultyLevel::Easy => 0.3,
            DifficultyLevel::Mid => 0.6,
            DifficultyLevel::Hard => 0.9,
        };

        vec![
            difficulty_val,
            strategy.new_ratio,
            strategy.batch_size as f64 / 20.0,
            strategy.interval_scale,
            strategy.hint_level as f64 / 2.0,
        ]
    }

    /// Returns (ucb score, exploration width).
    fn score(&self, a_inv: &[Vec<f64>], theta: &[f64], x: &[f64]) -> (f64, f64) {
        let exploitation = Self::dot_product(theta, x);
        let temp = Self::matrix_vector_mul(a_inv, x);
        let width = Self::dot_product(x, &temp).max(0.0).sqrt();
        (exploitation + self.alpha * width, width)
    }

    pub fn get_confidence_with_params(
        &self,
        width: f64,
        exploration_scale: f64,
        min_conf: f64,
        max_conf: f64,
    ) -> f64 {
        (max_conf - exploration_scale * width).clamp(min_conf, max_conf)
    }

    fn invert_matrix(m: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let n = m.len();
        let mut aug = vec![vec![0.0; 2 * n]; n];
        for i in 0..n {
            aug[i][..n].copy_from_slice(&m[i][..n]);
            aug[i][n + i] = 1.0;
        }

        let mut is_singular = false;

        for i in 0..n {
            let mut max_row = i;
            for k in (i + 1)..n {
                if aug[k][i].abs() > aug[max_row][i].abs() {
                    max_row = k;
                }
            }
            aug.swap(i, max_row);

            if aug[i][i].abs() < 1e-10 {
                is_singular = true;
                aug[i][i] = 1e-10;
            }

            let pivot = aug[i][i];
            for value in aug[i].iter_mut() {
                *value /= pivot;
            }

            for k in 0..n {
                if k != i {
                    let factor = aug[k][i];
                    if factor == 0.0 {
                        continue;
                    }
                    for j in 0..(2 * n) {
                        aug[k][j] -= factor * aug[i][j];
                    }
                }
            }
        }

        let mut result = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                let val = aug[i][n + j];
                result[i][j] = if val.is_finite() {
                    val
                } else if i == j {
                    1.0
                } else {
                    0.0
                };
            }
        }

        if is_singular {
            for (i, row) in result.iter_mut().enumerate() {
                row[i] = row[i].max(1e-6);
            }
        }

        result
    }

    fn matrix_vector_mul(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
        m.iter().map(|row| Self::dot_product(row, v)).collect()
    }

    fn dot_product(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    pub fn update_with_features(&mut self, x: &[f64], reward: f64) {
        if x.len() != self.d {
            return;
        }
        for i in 0..self.d {
            for j in 0..self.d {
                self.a[i][j] += x[i] * x[j];
            }
            self.b[i] += reward * x[i];
        }
        self.update_count += 1;
    }
}

impl Default for LinUCBModel {
    fn default() -> Self {
        Self::new(CONTEXT_FEATURE_DIM, ACTION_FEATURE_DIM, 0.3)
    }
}

impl Learner for LinUCBModel {
    fn name(&self) -> &str {
        "linucb"
    }

    fn version(&self) -> &str {
        "2.1.0"
    }

    fn kind(&self) -> LearnerKind {
        LearnerKind::LinUcb
    }

    fn select_action(
        &mut self,
        state: &UserState,
        actions: &[StrategyParams],
        ctx: &LearnerContext<'_>,
    ) -> Result<LearnerOutput, LearnerError> {
        ensure_candidates(actions)?;
        let context = Self::context_features(state, ctx);
        let a_inv = Self::invert_matrix(&self.a);
        let theta = Self::matrix_vector_mul(&a_inv, &self.b);

        let mut best: Option<(usize, f64, f64)> = None;
        for (idx, candidate) in actions.iter().enumerate() {
            let x = self.build_features(&context, candidate);
            let (score, width) = self.score(&a_inv, &theta, &x);
            if !score.is_finite() {
                return Err(LearnerError::Numerical {
                    learner: self.name().to_string(),
                    detail: format!("non-finite UCB score for candidate {idx}"),
                });
            }
            match best {
                Some((_, best_score, _)) if score <= best_score => {}
                _ => best = Some((idx, score, width)),
            }
        }

        let (idx, score, width) = best.ok_or(LearnerError::EmptyActionSpace)?;
        Ok(LearnerOutput {
            action: actions[idx].clone(),
            score,
            confidence: self.get_confidence_with_params(width, 0.3, 0.4, 1.0),
            meta: Some(serde_json::json!({ "exploration": width, "updates": self.update_count })),
        })
    }

    fn update(
        &mut self,
        state: &UserState,
        action: &StrategyParams,
        reward: f64,
        ctx: &LearnerContext<'_>,
    ) -> Result<(), LearnerError> {
        let context = Self::context_features(state, ctx);
        let x = self.build_features(&context, action);
        self.update_with_features(&x, reward);
        Ok(())
    }
}
