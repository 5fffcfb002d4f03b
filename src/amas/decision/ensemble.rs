use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::amas::config::{AMASConfig, EnsembleConfig};
use crate::amas::types::{
    strategy_similarity, ColdStartPhase, DecisionContext, DecisionMeta, DecisionResult,
    DifficultyLevel, MemberVote, MemoryTrace, StrategyError, StrategyParams, UserState,
};

use super::coldstart::ColdStartManager;
use super::{build_learners, Learner, LearnerContext};

const WEIGHT_FLOOR: f64 = 1e-6;
const MIN_WEIGHT_SUM: f64 = 1e-3;
const MAX_WEIGHT_SUM: f64 = 1e3;

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("action space is empty")]
    EmptyActionSpace,
    #[error("invalid candidate at index {index}: {source}")]
    InvalidAction {
        index: usize,
        #[source]
        source: StrategyError,
    },
    #[error("reward must be finite, got {0}")]
    InvalidReward(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleSnapshot {
    pub cold_start: serde_json::Value,
    pub weights: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateReport {
    pub phase: ColdStartPhase,
    pub learner_failures: usize,
}

pub struct EnsembleDecision {
    config: EnsembleConfig,
    cold_start: ColdStartManager,
    learners: Vec<Box<dyn Learner>>,
    weights: HashMap<String, f64>,
    last_round: Vec<MemberVote>,
}

impl EnsembleDecision {
    pub fn new(config: &AMASConfig, seed: u64) -> Self {
        Self::with_learners(config, build_learners(&config.learners, seed))
    }

    pub fn with_learners(config: &AMASConfig, learners: Vec<Box<dyn Learner>>) -> Self {
        let weights = learners
            .iter()
            .map(|l| (l.name().to_string(), config.ensemble.base_weight(l.name())))
            .collect();
        Self {
            config: config.ensemble.clone(),
            cold_start: ColdStartManager::new(config.cold_start.clone()),
            learners,
            weights,
            last_round: Vec::new(),
        }
    }

    pub fn select_action(
        &mut self,
        state: &UserState,
        actions: &[StrategyParams],
        context: &DecisionContext,
    ) -> Result<DecisionResult, DecisionError> {
        let started = Instant::now();
        if actions.is_empty() {
            return Err(DecisionError::EmptyActionSpace);
        }
        for (index, action) in actions.iter().enumerate() {
            action
                .validate()
                .map_err(|source| DecisionError::InvalidAction { index, source })?;
        }

        let phase = self.cold_start.phase();
        let mut meta = DecisionMeta {
            phase,
            user_type: self.cold_start.user_type(),
            ..Default::default()
        };

        let (action, confidence) = if phase != ColdStartPhase::Normal {
            let action = self
                .cold_start
                .select_action(actions)
                .ok_or(DecisionError::EmptyActionSpace)?;
            let confidence = if phase == ColdStartPhase::Classify { 0.3 } else { 0.5 };
            (action, confidence)
        } else {
            let (votes, errors) = self.collect_votes(state, actions, context);
            meta.weights = Some(self.weights.clone());
            meta.errors = errors;
            let blended = if votes.is_empty() {
                tracing::warn!(
                    user_id = %context.user_id,
                    errors = meta.errors.len(),
                    "every learner failed, falling back to first candidate"
                );
                (actions[0].clone(), 0.0)
            } else {
                blend(&votes)
            };
            self.last_round = votes.clone();
            meta.votes = votes;
            blended
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > self.config.decision_budget_ms {
            tracing::warn!(
                user_id = %context.user_id,
                elapsed_ms,
                budget_ms = self.config.decision_budget_ms,
                "decision exceeded time budget"
            );
        }
        meta.elapsed_ms = elapsed_ms;

        let explanation = explain(phase, state, &action, meta.weights.as_ref());
        Ok(DecisionResult {
            action,
            confidence,
            explanation,
            meta,
        })
    }

    fn collect_votes(
        &mut self,
        state: &UserState,
        actions: &[StrategyParams],
        context: &DecisionContext,
    ) -> (Vec<MemberVote>, Vec<String>) {
        let baseline = self.cold_start.settled_strategy().cloned();
        let trace = review_trace_for(context);
        let mut votes = Vec::with_capacity(self.learners.len());
        let mut errors = Vec::new();

        for learner in self.learners.iter_mut() {
            let mut view = LearnerContext::shared(context, baseline.as_ref());
            if learner.kind().needs_review_trace() {
                view = view.with_trace(&trace);
            }
            let name = learner.name().to_string();
            match learner.select_action(state, actions, &view) {
                Ok(output) if is_admissible(&output.action, actions) => {
                    let weight = self
                        .weights
                        .get(&name)
                        .copied()
                        .unwrap_or_else(|| self.config.base_weight(&name));
                    votes.push(MemberVote {
                        learner: name,
                        action: output.action,
                        score: output.score,
                        confidence: output.confidence.clamp(0.0, 1.0),
                        weight,
                    });
                }
                Ok(_) => {
                    tracing::warn!(learner = %name, "learner proposed an action outside the action space");
                    errors.push(format!("{name}: proposed an action outside the action space"));
                }
                Err(err) => {
                    tracing::warn!(learner = %name, error = %err, "learner failed during selection");
                    errors.push(format!("{name}: {err}"));
                }
            }
        }

        (votes, errors)
    }

    /// Applies `reward` for `action`, crediting the members of the most recent round.
    pub fn update(
        &mut self,
        state: &UserState,
        action: &StrategyParams,
        reward: f64,
        context: &DecisionContext,
    ) -> Result<UpdateReport, DecisionError> {
        let votes = self.last_round.clone();
        self.update_with_votes(state, action, reward, context, &votes)
    }

    /// Same as [`update`](Self::update) but credits an explicit set of member votes,
    /// e.g. those recorded with an older decision.
    pub fn update_with_votes(
        &mut self,
        state: &UserState,
        action: &StrategyParams,
        reward: f64,
        context: &DecisionContext,
        votes: &[MemberVote],
    ) -> Result<UpdateReport, DecisionError> {
        let reward = checked_reward(reward)?;
        let phase = self.cold_start.phase();
        let learner_failures = self.update_learners(state, action, reward, context);

        if phase == ColdStartPhase::Normal {
            self.reweight(action, reward, votes);
        } else {
            let next = self
                .cold_start
                .update(reward, context.accuracy(), context.recent_response_time);
            if next != phase {
                tracing::info!(
                    user_id = %context.user_id,
                    from = phase.as_str(),
                    to = next.as_str(),
                    "cold start phase advanced"
                );
            }
        }

        Ok(UpdateReport {
            phase: self.cold_start.phase(),
            learner_failures,
        })
    }

    /// Credits a delayed share of reward for an earlier decision. Learners and
    /// member weights see it; the cold-start manager does not, since it counts
    /// served interactions and those arrive through [`update`](Self::update).
    pub fn credit_delayed(
        &mut self,
        state: &UserState,
        action: &StrategyParams,
        reward: f64,
        context: &DecisionContext,
        votes: &[MemberVote],
    ) -> Result<UpdateReport, DecisionError> {
        let reward = checked_reward(reward)?;
        let learner_failures = self.update_learners(state, action, reward, context);
        if !votes.is_empty() {
            self.reweight(action, reward, votes);
        }
        Ok(UpdateReport {
            phase: self.cold_start.phase(),
            learner_failures,
        })
    }

    fn update_learners(
        &mut self,
        state: &UserState,
        action: &StrategyParams,
        reward: f64,
        context: &DecisionContext,
    ) -> usize {
        let baseline = self.cold_start.settled_strategy().cloned();
        let trace = review_trace_for(context);
        let mut learner_failures = 0;

        for learner in self.learners.iter_mut() {
            let mut view = LearnerContext::shared(context, baseline.as_ref());
            if learner.kind().needs_review_trace() {
                view = view.with_trace(&trace);
            }
            if let Err(err) = learner.update(state, action, reward, &view) {
                learner_failures += 1;
                tracing::warn!(learner = learner.name(), error = %err, "learner failed during update");
            }
        }
        learner_failures
    }

    /// Multiplicative-weights step; a member is penalised for agreeing with a
    /// poorly rewarded action or for disagreeing with a well rewarded one.
    fn reweight(&mut self, action: &StrategyParams, reward: f64, votes: &[MemberVote]) {
        let eta = self.config.learning_rate;
        for vote in votes {
            let agreement = strategy_similarity(&vote.action, action);
            let loss = agreement * (1.0 - reward) / 2.0 + (1.0 - agreement) * (1.0 + reward) / 2.0;
            let base = self.config.base_weight(&vote.learner);
            let weight = self.weights.entry(vote.learner.clone()).or_insert(base);
            *weight = (*weight * (-eta * loss).exp()).max(0.0);
        }

        if self.weights.values().all(|w| *w < WEIGHT_FLOOR) {
            tracing::debug!("ensemble weights collapsed, restoring base weights");
            self.reset_weights();
            return;
        }
        let total: f64 = self.weights.values().sum();
        if !(MIN_WEIGHT_SUM..=MAX_WEIGHT_SUM).contains(&total) {
            for w in self.weights.values_mut() {
                *w /= total;
            }
        }
    }

    fn reset_weights(&mut self) {
        for (name, weight) in self.weights.iter_mut() {
            *weight = self.config.base_weight(name);
        }
    }

    pub fn snapshot(&self) -> EnsembleSnapshot {
        EnsembleSnapshot {
            cold_start: self.cold_start.snapshot(),
            weights: self.weights.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: &EnsembleSnapshot) {
        self.cold_start.restore(&snapshot.cold_start);
        for (name, weight) in self.weights.iter_mut() {
            *weight = snapshot
                .weights
                .get(name)
                .copied()
                .filter(|w| w.is_finite() && *w >= 0.0)
                .unwrap_or_else(|| self.config.base_weight(name));
        }
        self.last_round.clear();
    }

    pub fn cold_start(&self) -> &ColdStartManager {
        &self.cold_start
    }

    pub fn cold_start_mut(&mut self) -> &mut ColdStartManager {
        &mut self.cold_start
    }

    pub fn phase(&self) -> ColdStartPhase {
        self.cold_start.phase()
    }

    pub fn weights(&self) -> &HashMap<String, f64> {
        &self.weights
    }

    pub fn learner_names(&self) -> Vec<&str> {
        self.learners.iter().map(|l| l.name()).collect()
    }
}

/// A proposal must keep the discrete fields of some candidate; its continuous
/// fields may be tuned freely within their valid ranges.
fn is_admissible(proposal: &StrategyParams, actions: &[StrategyParams]) -> bool {
    proposal.validate().is_ok() && actions.iter().any(|a| a.same_discrete_fields(proposal))
}

fn checked_reward(reward: f64) -> Result<f64, DecisionError> {
    if reward.is_finite() {
        Ok(reward.clamp(-1.0, 1.0))
    } else {
        Err(DecisionError::InvalidReward(reward))
    }
}

fn review_trace_for(context: &DecisionContext) -> Vec<MemoryTrace> {
    if context.review_trace.is_empty() {
        synthesize_review_trace(context.recent_error_rate)
    } else {
        context.review_trace.clone()
    }
}

/// Five reviews at widening horizons with roughly `error_rate` of them failed.
pub fn synthesize_review_trace(error_rate: f64) -> Vec<MemoryTrace> {
    const HORIZONS: [f64; 5] = [3_600.0, 21_600.0, 86_400.0, 259_200.0, 604_800.0];
    let error_rate = if error_rate.is_finite() { error_rate.clamp(0.0, 1.0) } else { 0.5 };
    HORIZONS
        .iter()
        .enumerate()
        .map(|(i, &seconds_ago)| MemoryTrace {
            seconds_ago,
            is_correct: (i as f64 + 0.5) / HORIZONS.len() as f64 >= error_rate,
        })
        .collect()
}

/// Weighted blend of the surviving votes. Continuous fields are weighted
/// means; discrete fields are weighted pluralities with ties going to the
/// earliest member.
fn blend(votes: &[MemberVote]) -> (StrategyParams, f64) {
    let mut shares: Vec<f64> = votes.iter().map(|v| v.weight * v.confidence).collect();
    if shares.iter().sum::<f64>() < 1e-9 {
        shares = votes.iter().map(|v| v.weight).collect();
    }
    if shares.iter().sum::<f64>() < 1e-9 {
        shares = vec![1.0; votes.len()];
    }
    let total: f64 = shares.iter().sum();

    let interval_scale = weighted_mean(votes.iter().map(|v| v.action.interval_scale), &shares, total);
    let new_ratio = weighted_mean(votes.iter().map(|v| v.action.new_ratio), &shares, total);
    let difficulty: DifficultyLevel =
        plurality(votes.iter().map(|v| v.action.difficulty).zip(shares.iter().copied()));
    let batch_size = plurality(votes.iter().map(|v| v.action.batch_size).zip(shares.iter().copied()));
    let hint_level = plurality(votes.iter().map(|v| v.action.hint_level).zip(shares.iter().copied()));
    let confidence = votes
        .iter()
        .zip(&shares)
        .map(|(v, s)| v.confidence * s)
        .sum::<f64>()
        / total;

    (
        StrategyParams {
            interval_scale,
            new_ratio,
            difficulty,
            batch_size,
            hint_level,
        },
        confidence.clamp(0.0, 1.0),
    )
}

fn weighted_mean(values: impl Iterator<Item = f64>, shares: &[f64], total: f64) -> f64 {
    let values: Vec<f64> = values.collect();
    if values.windows(2).all(|pair| pair[0] == pair[1]) {
        return values.first().copied().unwrap_or_default();
    }
    values.iter().zip(shares).map(|(v, s)| v * s).sum::<f64>() / total
}

fn plurality<T: PartialEq + Copy + Default>(items: impl Iterator<Item = (T, f64)>) -> T {
    let mut tally: Vec<(T, f64)> = Vec::new();
    for (value, share) in items {
        match tally.iter_mut().find(|(v, _)| *v == value) {
            Some((_, sum)) => *sum += share,
            None => tally.push((value, share)),
        }
    }
    let mut best: Option<(T, f64)> = None;
    for (value, sum) in tally {
        match best {
            Some((_, best_sum)) if sum <= best_sum => {}
            _ => best = Some((value, sum)),
        }
    }
    best.map(|(value, _)| value).unwrap_or_default()
}

fn explain(
    phase: ColdStartPhase,
    state: &UserState,
    action: &StrategyParams,
    weights: Option<&HashMap<String, f64>>,
) -> String {
    let lead = match phase {
        ColdStartPhase::Classify => "cold start: classifying learner profile".to_string(),
        ColdStartPhase::Explore => "cold start: probing candidate strategies".to_string(),
        ColdStartPhase::Normal => {
            // Equal weights go to the alphabetically first learner.
            let dominant = weights.and_then(|w| {
                w.iter()
                    .max_by(|a, b| {
                        a.1.partial_cmp(b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.0.cmp(a.0))
                    })
                    .map(|(name, _)| name.clone())
            });
            match dominant {
                Some(name) => format!("ensemble decision led by {name}"),
                None => "ensemble decision".to_string(),
            }
        }
    };

    let mut factors = Vec::new();
    if state.fatigue > 0.5 {
        factors.push(format!("fatigue {:.2}", state.fatigue));
    }
    if state.attention < 0.5 {
        factors.push(format!("low attention {:.2}", state.attention));
    }
    if state.motivation < 0.0 {
        factors.push(format!("low motivation {:.2}", state.motivation));
    }
    if (action.interval_scale - 1.0).abs() > 1e-9 {
        factors.push(format!("interval x{:.2}", action.interval_scale));
    }
    if action.difficulty != DifficultyLevel::Mid {
        factors.push(format!("difficulty {}", action.difficulty.as_str()));
    }

    if factors.is_empty() {
        lead
    } else {
        format!("{lead}; {}", factors.join(", "))
    }
}
