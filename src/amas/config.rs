use serde::{Deserialize, Serialize};

use crate::amas::reward::{EvaluatorConfig, ScheduleEntry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdStartConfig {
    pub classify_samples: u32,
    pub min_classify_samples: u32,
    pub classify_confidence_margin: f64,
    /// User-type indices (0 fast, 1 stable, 2 cautious) probed during explore.
    pub probe_sequence: Vec<usize>,
    pub min_probes: usize,
    pub early_stop_confidence: f64,
    pub fast_response_ms: f64,
    pub slow_response_ms: f64,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            classify_samples: 5,
            min_classify_samples: 3,
            classify_confidence_margin: 0.4,
            probe_sequence: vec![0, 1, 2],
            min_probes: 2,
            early_stop_confidence: 0.8,
            fast_response_ms: 2000.0,
            slow_response_ms: 4000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub linucb_base_weight: f64,
    pub thompson_base_weight: f64,
    pub actr_base_weight: f64,
    pub heuristic_base_weight: f64,
    /// Multiplicative-weights learning rate.
    pub learning_rate: f64,
    pub decision_budget_ms: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            linucb_base_weight: 0.3,
            thompson_base_weight: 0.3,
            actr_base_weight: 0.2,
            heuristic_base_weight: 0.2,
            learning_rate: 0.5,
            decision_budget_ms: 50.0,
        }
    }
}

impl EnsembleConfig {
    pub fn base_weight(&self, learner: &str) -> f64 {
        match learner {
            "linucb" => self.linucb_base_weight,
            "thompson" => self.thompson_base_weight,
            "actr" => self.actr_base_weight,
            "heuristic" => self.heuristic_base_weight,
            _ => 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub linucb_enabled: bool,
    pub thompson_enabled: bool,
    pub actr_memory_enabled: bool,
    pub heuristic_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            linucb_enabled: true,
            thompson_enabled: true,
            actr_memory_enabled: true,
            heuristic_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    pub alpha: f64,
    pub prior_alpha: f64,
    pub prior_beta: f64,
    pub thompson_context_bins: usize,
    pub thompson_context_weight: f64,
    pub thompson_ess_k: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            prior_alpha: 1.0,
            prior_beta: 1.0,
            thompson_context_bins: 3,
            thompson_context_weight: 0.7,
            thompson_ess_k: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActrConfig {
    pub decay: f64,
    pub threshold: f64,
    pub noise_scale: f64,
}

impl Default for ActrConfig {
    fn default() -> Self {
        Self {
            decay: 0.5,
            threshold: 0.3,
            noise_scale: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LearnerConfig {
    pub feature_flags: FeatureFlags,
    pub bandit: BanditConfig,
    pub actr: ActrConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardPipelineConfig {
    /// `None` selects the canonical 0s/1h/6h/24h/7d schedule.
    pub schedule: Option<Vec<ScheduleEntry>>,
    pub max_queue_size: usize,
    pub evaluator: EvaluatorConfig,
    pub fatigue_threshold: f64,
    /// Failed applies an increment may accumulate before it is dropped.
    pub max_retries: u32,
    /// First retry delay; doubles with every further failure.
    pub retry_backoff_ms: u64,
}

impl Default for RewardPipelineConfig {
    fn default() -> Self {
        Self {
            schedule: None,
            max_queue_size: 10_000,
            evaluator: EvaluatorConfig::default(),
            fatigue_threshold: 0.8,
            max_retries: 3,
            retry_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AMASConfig {
    pub cold_start: ColdStartConfig,
    pub ensemble: EnsembleConfig,
    pub learners: LearnerConfig,
    pub reward: RewardPipelineConfig,
    /// Base seed for every per-user random generator.
    pub seed: u64,
    pub decision_history_size: usize,
}

impl Default for AMASConfig {
    fn default() -> Self {
        Self {
            cold_start: ColdStartConfig::default(),
            ensemble: EnsembleConfig::default(),
            learners: LearnerConfig::default(),
            reward: RewardPipelineConfig::default(),
            seed: 0x5eed,
            decision_history_size: 32,
        }
    }
}

impl AMASConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("AMAS_LINUCB_ENABLED") {
            config.learners.feature_flags.linucb_enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("AMAS_THOMPSON_ENABLED") {
            config.learners.feature_flags.thompson_enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("AMAS_ACTR_ENABLED") {
            config.learners.feature_flags.actr_memory_enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("AMAS_HEURISTIC_ENABLED") {
            config.learners.feature_flags.heuristic_enabled = val.parse().unwrap_or(true);
        }
        if let Some(seed) = std::env::var("AMAS_SEED").ok().and_then(|v| v.parse().ok()) {
            config.seed = seed;
        }
        if let Some(budget) = std::env::var("AMAS_DECISION_BUDGET_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.ensemble.decision_budget_ms = budget;
        }
        if let Ok(val) = std::env::var("REWARD_QUALITY_CONTROL") {
            config.reward.evaluator.enabled = val != "false" && val != "0";
        }
        if let Some(min_conf) = std::env::var("REWARD_MIN_CONFIDENCE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.reward.evaluator.min_confidence = min_conf;
        }
        if let Some(threshold) = std::env::var("DELAYED_REWARD_FATIGUE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.reward.fatigue_threshold = threshold;
        }
        if let Some(max_retries) = std::env::var("DELAYED_REWARD_MAX_RETRY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.reward.max_retries = max_retries;
        }

        config
    }
}
