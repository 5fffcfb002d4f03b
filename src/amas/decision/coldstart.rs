use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::amas::config::ColdStartConfig;
use crate::amas::types::{nearest_candidate, ColdStartPhase, StrategyParams, UserType};

/// Beta posterior over one explore-phase probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutcome {
    pub alpha: f64,
    pub beta: f64,
    pub trials: u32,
}

impl Default for ProbeOutcome {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            trials: 0,
        }
    }
}

impl ProbeOutcome {
    fn observe(&mut self, reward: f64) {
        let r = reward.clamp(-1.0, 1.0);
        self.alpha += (r + 1.0) / 2.0;
        self.beta += (1.0 - r) / 2.0;
        self.trials += 1;
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta).max(1e-10)
    }

    fn variance(&self) -> f64 {
        let total = self.alpha + self.beta;
        (self.alpha * self.beta) / (total * total * (total + 1.0)).max(1e-10)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColdStartState {
    pub phase: ColdStartPhase,
    pub user_type: Option<UserType>,
    pub probe_index: usize,
    pub settled_strategy: Option<StrategyParams>,
    pub update_count: u64,
    pub classification_scores: [f64; 3],
    #[serde(default)]
    pub probes: Vec<StrategyParams>,
    #[serde(default)]
    pub probe_outcomes: Vec<ProbeOutcome>,
}

impl Default for ColdStartState {
    fn default() -> Self {
        Self {
            phase: ColdStartPhase::Classify,
            user_type: None,
            probe_index: 0,
            settled_strategy: None,
            update_count: 0,
            classification_scores: [0.0; 3],
            probes: Vec::new(),
            probe_outcomes: Vec::new(),
        }
    }
}

impl ColdStartState {
    /// Rebuilds a state from persisted JSON, replacing anything invalid with
    /// a safe default instead of failing.
    pub fn restore(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        let field = |camel: &str, snake: &str| obj.get(camel).or_else(|| obj.get(snake));

        let phase = field("phase", "phase")
            .and_then(Value::as_str)
            .and_then(ColdStartPhase::parse)
            .unwrap_or_default();
        let user_type = field("userType", "user_type")
            .and_then(Value::as_str)
            .and_then(UserType::parse);
        let probe_index = non_negative(field("probeIndex", "probe_index")) as usize;
        let update_count = non_negative(field("updateCount", "update_count"));
        let settled_strategy = field("settledStrategy", "settled_strategy")
            .and_then(parse_strategy);

        let mut classification_scores = [0.0; 3];
        if let Some(scores) = field("classificationScores", "classification_scores")
            .and_then(Value::as_array)
            .filter(|s| s.len() == 3)
        {
            for (slot, score) in classification_scores.iter_mut().zip(scores) {
                *slot = score
                    .as_f64()
                    .filter(|v| v.is_finite() && *v >= 0.0)
                    .unwrap_or(0.0);
            }
        }

        let probes: Vec<StrategyParams> = field("probes", "probes")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_strategy).collect())
            .unwrap_or_default();
        let mut probe_outcomes: Vec<ProbeOutcome> = field("probeOutcomes", "probe_outcomes")
            .and_then(|v| serde_json::from_value::<Vec<ProbeOutcome>>(v.clone()).ok())
            .unwrap_or_default();
        let outcomes_usable = probe_outcomes.len() == probes.len()
            && probe_outcomes
                .iter()
                .all(|o| o.alpha.is_finite() && o.beta.is_finite() && o.alpha > 0.0 && o.beta > 0.0);
        if !outcomes_usable {
            probe_outcomes = vec![ProbeOutcome::default(); probes.len()];
        }
        let probe_index = if probes.is_empty() {
            probe_index
        } else {
            probe_index.min(probes.len())
        };

        Self {
            phase,
            user_type,
            probe_index,
            settled_strategy,
            update_count,
            classification_scores,
            probes,
            probe_outcomes,
        }
    }
}

fn non_negative(value: Option<&Value>) -> u64 {
    match value {
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        None => 0,
    }
}

fn parse_strategy(value: &Value) -> Option<StrategyParams> {
    serde_json::from_value::<StrategyParams>(value.clone())
        .ok()
        .filter(|s| s.validate().is_ok())
}

pub struct ColdStartManager {
    config: ColdStartConfig,
    state: ColdStartState,
}

impl ColdStartManager {
    pub fn new(config: ColdStartConfig) -> Self {
        Self {
            config,
            state: ColdStartState::default(),
        }
    }

    pub fn from_state(config: ColdStartConfig, state: ColdStartState) -> Self {
        Self { config, state }
    }

    /// Picks the action for the current phase. `None` only for an empty action space.
    pub fn select_action(&mut self, actions: &[StrategyParams]) -> Option<StrategyParams> {
        if actions.is_empty() {
            return None;
        }
        let target = match self.state.phase {
            ColdStartPhase::Classify => StrategyParams::for_user_type(self.provisional_type()),
            ColdStartPhase::Explore => {
                if self.state.probes.is_empty() {
                    self.build_probes(Some(actions));
                }
                match self.state.probes.get(self.state.probe_index) {
                    Some(probe) => probe.clone(),
                    None => self.fallback_strategy(),
                }
            }
            ColdStartPhase::Normal => self.fallback_strategy(),
        };
        let idx = nearest_candidate(&target, actions).unwrap_or(0);
        Some(actions[idx].clone())
    }

    /// Feeds one observed outcome and returns the phase afterwards.
    pub fn update(&mut self, reward: f64, accuracy: f64, response_time_ms: f64) -> ColdStartPhase {
        self.state.update_count = self.state.update_count.saturating_add(1);
        match self.state.phase {
            ColdStartPhase::Classify => self.handle_classify(accuracy, response_time_ms),
            ColdStartPhase::Explore => self.handle_explore(reward),
            ColdStartPhase::Normal => {}
        }
        self.state.phase
    }

    fn handle_classify(&mut self, accuracy: f64, response_time_ms: f64) {
        let fast = response_time_ms < self.config.fast_response_ms && accuracy > 0.8;
        let stable = (0.6..=0.85).contains(&accuracy);
        let cautious = response_time_ms > self.config.slow_response_ms || accuracy < 0.6;

        for (slot, hit) in self
            .state
            .classification_scores
            .iter_mut()
            .zip([fast, stable, cautious])
        {
            if hit {
                *slot += 1.0;
            }
        }

        let seen = self.state.update_count;
        if seen >= u64::from(self.config.min_classify_samples) {
            if let Some(user_type) = self.classify_confident_user_type() {
                self.enter_explore(user_type);
                return;
            }
        }
        if seen >= u64::from(self.config.classify_samples) {
            let user_type = self.provisional_type();
            self.enter_explore(user_type);
        }
    }

    fn enter_explore(&mut self, user_type: UserType) {
        tracing::debug!(user_type = user_type.as_str(), "cold start classified user");
        self.state.user_type = Some(user_type);
        self.state.phase = ColdStartPhase::Explore;
        self.state.probe_index = 0;
        self.state.probes.clear();
        self.state.probe_outcomes.clear();
    }

    fn handle_explore(&mut self, reward: f64) {
        if self.state.probes.is_empty() {
            self.build_probes(None);
        }
        if let Some(outcome) = self.state.probe_outcomes.get_mut(self.state.probe_index) {
            outcome.observe(reward);
        }
        self.state.probe_index += 1;

        let observed = self.state.probe_index;
        if observed >= self.state.probes.len() {
            self.finish_explore();
            return;
        }
        if observed >= self.config.min_probes
            && self.leader_confidence() >= self.config.early_stop_confidence
        {
            tracing::debug!(probes = observed, "cold start exploration stopped early");
            self.finish_explore();
        }
    }

    /// Probe strategies for each configured user type, snapped to `actions`
    /// when an action space is known; duplicates are dropped.
    fn build_probes(&mut self, actions: Option<&[StrategyParams]>) {
        let mut probes: Vec<StrategyParams> = Vec::new();
        for &type_idx in &self.config.probe_sequence {
            let default = StrategyParams::for_user_type(UserType::from_index(type_idx));
            let probe = match actions {
                Some(actions) => nearest_candidate(&default, actions)
                    .map(|idx| actions[idx].clone())
                    .unwrap_or(default),
                None => default,
            };
            if !probes.contains(&probe) {
                probes.push(probe);
            }
        }
        if probes.is_empty() {
            probes.push(self.fallback_strategy());
        }
        self.state.probe_outcomes = vec![ProbeOutcome::default(); probes.len()];
        self.state.probes = probes;
    }

    /// Normal-approximation probability that the leading probe beats the
    /// runner-up. Only served outcomes take part; unserved ones carry no evidence.
    fn leader_confidence(&self) -> f64 {
        let mut ranked: Vec<&ProbeOutcome> = self
            .state
            .probe_outcomes
            .iter()
            .filter(|o| o.trials > 0)
            .collect();
        if ranked.len() < 2 {
            return 0.0;
        }
        ranked.sort_by(|a, b| b.mean().partial_cmp(&a.mean()).unwrap_or(Ordering::Equal));
        let (leader, runner_up) = (ranked[0], ranked[1]);
        let spread = (leader.variance() + runner_up.variance()).sqrt();
        if spread <= 1e-12 {
            return if leader.mean() > runner_up.mean() { 1.0 } else { 0.5 };
        }
        standard_normal_cdf((leader.mean() - runner_up.mean()) / spread)
    }

    fn finish_explore(&mut self) {
        let mut best: Option<(usize, f64)> = None;
        for (idx, outcome) in self.state.probe_outcomes.iter().enumerate() {
            let mean = outcome.mean();
            match best {
                Some((_, best_mean)) if mean <= best_mean => {}
                _ => best = Some((idx, mean)),
            }
        }
        let settled = best
            .and_then(|(idx, _)| self.state.probes.get(idx).cloned())
            .unwrap_or_else(|| self.fallback_strategy());
        self.state.settled_strategy = Some(settled);
        self.state.phase = ColdStartPhase::Normal;
        tracing::debug!(update_count = self.state.update_count, "cold start settled");
    }

    fn classify_confident_user_type(&self) -> Option<UserType> {
        let total: f64 = self.state.classification_scores.iter().sum();
        if total <= 1e-6 {
            return None;
        }
        let mut indexed: Vec<(usize, f64)> = self
            .state
            .classification_scores
            .iter()
            .copied()
            .enumerate()
            .collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let (top_idx, top_score) = indexed[0];
        let second_score = indexed.get(1).map(|(_, s)| *s).unwrap_or(0.0);
        let margin = (top_score - second_score) / total.max(1e-6);
        if margin < self.config.classify_confidence_margin {
            return None;
        }
        Some(UserType::from_index(top_idx))
    }

    fn provisional_type(&self) -> UserType {
        if let Some(user_type) = self.state.user_type {
            return user_type;
        }
        let scores = &self.state.classification_scores;
        let total: f64 = scores.iter().sum();
        if total <= 1e-6 {
            return UserType::Stable;
        }
        // Stable wins ties so ambiguous users start in the middle.
        let mut best = 1;
        for idx in [0, 2] {
            if scores[idx] > scores[best] {
                best = idx;
            }
        }
        UserType::from_index(best)
    }

    fn fallback_strategy(&self) -> StrategyParams {
        self.state
            .settled_strategy
            .clone()
            .unwrap_or_else(|| StrategyParams::for_user_type(self.state.user_type.unwrap_or_default()))
    }

    pub fn reset(&mut self) {
        self.state = ColdStartState::default();
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(&self.state).unwrap_or_default()
    }

    pub fn restore(&mut self, snapshot: &Value) {
        self.state = ColdStartState::restore(snapshot);
    }

    pub fn phase(&self) -> ColdStartPhase {
        self.state.phase
    }

    pub fn state(&self) -> &ColdStartState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state.phase, ColdStartPhase::Normal)
    }

    pub fn user_type(&self) -> Option<UserType> {
        self.state.user_type
    }

    pub fn settled_strategy(&self) -> Option<&StrategyParams> {
        self.state.settled_strategy.as_ref()
    }

    pub fn update_count(&self) -> u64 {
        self.state.update_count
    }
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz-Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amas::types::DifficultyLevel;

    fn full_space() -> Vec<StrategyParams> {
        vec![
            StrategyParams::for_user_type(UserType::Fast),
            StrategyParams::for_user_type(UserType::Stable),
            StrategyParams::for_user_type(UserType::Cautious),
        ]
    }

    #[test]
    fn confident_fast_user_leaves_classify_early() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        for _ in 0..3 {
            manager.update(1.0, 0.95, 1200.0);
        }
        assert_eq!(manager.phase(), ColdStartPhase::Explore);
        assert_eq!(manager.user_type(), Some(UserType::Fast));
        assert_eq!(manager.update_count(), 3);
    }

    #[test]
    fn ambiguous_user_classified_after_max_samples() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        let observations = [(0.9, 1500.0), (0.5, 3000.0), (0.9, 1500.0), (0.5, 3000.0)];
        for (accuracy, rt) in observations {
            manager.update(0.0, accuracy, rt);
            assert_eq!(manager.phase(), ColdStartPhase::Classify);
        }
        manager.update(0.0, 0.7, 3000.0);
        assert_eq!(manager.phase(), ColdStartPhase::Explore);
        assert!(manager.user_type().is_some());
    }

    #[test]
    fn classify_serves_nearest_provisional_candidate() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        manager.update(0.0, 0.3, 6000.0);
        let chosen = manager.select_action(&full_space()).unwrap();
        assert_eq!(chosen.difficulty, DifficultyLevel::Easy);
    }

    #[test]
    fn explore_settles_on_best_probe() {
        let mut manager = ColdStartManager::new(ColdStartConfig {
            early_stop_confidence: 1.1,
            ..Default::default()
        });
        for _ in 0..3 {
            manager.update(0.0, 0.3, 6000.0);
        }
        assert_eq!(manager.phase(), ColdStartPhase::Explore);

        let actions = full_space();
        let rewards = [-0.5, 0.9, -0.2];
        for reward in rewards {
            let probe = manager.select_action(&actions).unwrap();
            assert!(actions.contains(&probe));
            manager.update(reward, 0.7, 3000.0);
        }
        assert_eq!(manager.phase(), ColdStartPhase::Normal);
        assert_eq!(manager.settled_strategy(), Some(&actions[1]));
        assert_eq!(manager.select_action(&actions), Some(actions[1].clone()));
    }

    #[test]
    fn clear_winner_stops_exploration_early() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        for _ in 0..3 {
            manager.update(0.0, 0.3, 6000.0);
        }
        let actions = full_space();

        let first = manager.select_action(&actions).unwrap();
        manager.update(1.0, 0.95, 1500.0);
        assert_eq!(manager.phase(), ColdStartPhase::Explore);
        manager.select_action(&actions).unwrap();
        manager.update(-1.0, 0.2, 7000.0);

        assert_eq!(manager.phase(), ColdStartPhase::Normal);
        assert_eq!(manager.state().probe_index, 2);
        assert_eq!(manager.state().probes.len(), 3);
        assert_eq!(manager.state().probe_outcomes[2].trials, 0);
        assert_eq!(manager.settled_strategy(), Some(&first));
    }

    #[test]
    fn close_outcomes_keep_exploring() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        for _ in 0..3 {
            manager.update(0.0, 0.3, 6000.0);
        }
        let actions = full_space();
        for reward in [0.6, 0.2] {
            manager.select_action(&actions).unwrap();
            manager.update(reward, 0.7, 3000.0);
        }
        assert_eq!(manager.phase(), ColdStartPhase::Explore);
        manager.select_action(&actions).unwrap();
        manager.update(0.0, 0.7, 3000.0);
        assert_eq!(manager.phase(), ColdStartPhase::Normal);
    }

    #[test]
    fn duplicate_probes_collapse_on_small_action_space() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        for _ in 0..3 {
            manager.update(0.0, 0.95, 1000.0);
        }
        let only = vec![StrategyParams::default()];
        manager.select_action(&only);
        assert_eq!(manager.state().probes.len(), 1);
        manager.update(1.0, 0.9, 1000.0);
        assert_eq!(manager.phase(), ColdStartPhase::Normal);
    }

    #[test]
    fn normal_phase_ignores_updates_but_counts_them() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        for _ in 0..10 {
            manager.update(0.5, 0.95, 1000.0);
        }
        assert_eq!(manager.phase(), ColdStartPhase::Normal);
        let before = manager.update_count();
        manager.update(-1.0, 0.1, 9000.0);
        assert_eq!(manager.phase(), ColdStartPhase::Normal);
        assert_eq!(manager.update_count(), before + 1);
    }

    #[test]
    fn snapshot_round_trip_keeps_counting() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        for _ in 0..4 {
            manager.update(0.2, 0.95, 1000.0);
        }
        let snapshot = manager.snapshot();
        let mut restored = ColdStartManager::new(ColdStartConfig::default());
        restored.restore(&snapshot);
        assert_eq!(restored.state(), manager.state());
        restored.update(0.2, 0.95, 1000.0);
        assert_eq!(restored.update_count(), 5);
    }

    #[test]
    fn restore_heals_corrupted_fields() {
        let corrupted = serde_json::json!({
            "phase": "warmup",
            "userType": "speedy",
            "probeIndex": -3,
            "updateCount": -7,
            "settledStrategy": { "intervalScale": -1.0, "newRatio": 0.2, "difficulty": "mid", "batchSize": 8, "hintLevel": 1 }
        });
        let state = ColdStartState::restore(&corrupted);
        assert_eq!(state.phase, ColdStartPhase::Classify);
        assert_eq!(state.user_type, None);
        assert_eq!(state.probe_index, 0);
        assert_eq!(state.update_count, 0);
        assert_eq!(state.settled_strategy, None);

        assert_eq!(ColdStartState::restore(&serde_json::json!([1, 2])), ColdStartState::default());
    }

    #[test]
    fn reset_returns_to_classify() {
        let mut manager = ColdStartManager::new(ColdStartConfig::default());
        for _ in 0..10 {
            manager.update(0.5, 0.95, 1000.0);
        }
        manager.reset();
        assert_eq!(manager.phase(), ColdStartPhase::Classify);
        assert_eq!(manager.update_count(), 0);
    }

    #[test]
    fn erf_matches_known_values() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((standard_normal_cdf(-1.0) - 0.158_655_25).abs() < 1e-6);
    }
}
