use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyLevel {
    Easy,
    #[default]
    Mid,
    Hard,
}

impl DifficultyLevel {
    pub const ALL: [DifficultyLevel; 3] = [Self::Easy, Self::Mid, Self::Hard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Mid => "mid",
            Self::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "easy" => Some(Self::Easy),
            "mid" => Some(Self::Mid),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }

    pub fn harder(&self) -> Self {
        match self {
            Self::Easy => Self::Mid,
            _ => Self::Hard,
        }
    }

    pub fn easier(&self) -> Self {
        match self {
            Self::Hard => Self::Mid,
            _ => Self::Easy,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Easy => 0,
            Self::Mid => 1,
            Self::Hard => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Fast,
    #[default]
    Stable,
    Cautious,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Stable => "stable",
            Self::Cautious => "cautious",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "stable" => Some(Self::Stable),
            "cautious" => Some(Self::Cautious),
            _ => None,
        }
    }

    /// Maps a classification/probe index (0 fast, 1 stable, 2 cautious).
    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Fast,
            2 => Self::Cautious,
            _ => Self::Stable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColdStartPhase {
    #[default]
    Classify,
    Explore,
    Normal,
}

impl ColdStartPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Explore => "explore",
            Self::Normal => "normal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "classify" => Some(Self::Classify),
            "explore" => Some(Self::Explore),
            "normal" => Some(Self::Normal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitiveProfile {
    pub mem: f64,
    pub speed: f64,
    pub stability: f64,
}

impl Default for CognitiveProfile {
    fn default() -> Self {
        Self {
            mem: 0.5,
            speed: 0.5,
            stability: 0.5,
        }
    }
}

/// Learner state as estimated by the online modeling loop. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    #[serde(rename = "A")]
    pub attention: f64,
    #[serde(rename = "F")]
    pub fatigue: f64,
    #[serde(rename = "C")]
    pub cognitive: CognitiveProfile,
    #[serde(rename = "M")]
    pub motivation: f64,
    pub conf: f64,
    pub ts: i64,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            attention: 0.7,
            fatigue: 0.0,
            cognitive: CognitiveProfile::default(),
            motivation: 0.5,
            conf: 0.5,
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StrategyError {
    #[error("interval_scale must be finite and positive, got {0}")]
    IntervalScale(f64),
    #[error("new_ratio must be within [0, 1], got {0}")]
    NewRatio(f64),
    #[error("batch_size must be at least 1, got {0}")]
    BatchSize(i32),
    #[error("hint_level must be within [0, 2], got {0}")]
    HintLevel(i32),
}

/// One candidate action: the tuning parameters of the next study batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyParams {
    pub interval_scale: f64,
    pub new_ratio: f64,
    pub difficulty: DifficultyLevel,
    pub batch_size: i32,
    pub hint_level: i32,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            interval_scale: 1.0,
            new_ratio: 0.2,
            difficulty: DifficultyLevel::Mid,
            batch_size: 8,
            hint_level: 1,
        }
    }
}

impl StrategyParams {
    pub fn for_user_type(user_type: UserType) -> Self {
        match user_type {
            UserType::Fast => Self {
                interval_scale: 1.2,
                new_ratio: 0.3,
                difficulty: DifficultyLevel::Hard,
                batch_size: 12,
                hint_level: 0,
            },
            UserType::Stable => Self::default(),
            UserType::Cautious => Self {
                interval_scale: 0.8,
                new_ratio: 0.1,
                difficulty: DifficultyLevel::Easy,
                batch_size: 5,
                hint_level: 2,
            },
        }
    }

    pub fn validate(&self) -> Result<(), StrategyError> {
        if !self.interval_scale.is_finite() || self.interval_scale <= 0.0 {
            return Err(StrategyError::IntervalScale(self.interval_scale));
        }
        if !self.new_ratio.is_finite() || !(0.0..=1.0).contains(&self.new_ratio) {
            return Err(StrategyError::NewRatio(self.new_ratio));
        }
        if self.batch_size < 1 {
            return Err(StrategyError::BatchSize(self.batch_size));
        }
        if !(0..=2).contains(&self.hint_level) {
            return Err(StrategyError::HintLevel(self.hint_level));
        }
        Ok(())
    }

    pub fn same_discrete_fields(&self, other: &StrategyParams) -> bool {
        self.difficulty == other.difficulty
            && self.batch_size == other.batch_size
            && self.hint_level == other.hint_level
    }

    /// Stable key over the discrete fields plus the rounded new-word ratio.
    pub fn action_key(&self) -> String {
        format!(
            "{}_{:.2}_{:.2}_{}_{}",
            self.difficulty.as_str(),
            self.interval_scale,
            self.new_ratio,
            self.batch_size,
            self.hint_level
        )
    }
}

/// Similarity in [0, 1] between two strategies; 1 means identical.
pub fn strategy_similarity(a: &StrategyParams, b: &StrategyParams) -> f64 {
    let diff = if a.difficulty == b.difficulty { 1.0 } else { 0.0 };
    let ratio = 1.0 - (a.new_ratio - b.new_ratio).abs();
    let batch = 1.0 - ((a.batch_size - b.batch_size).abs() as f64 / 15.0);
    let interval = 1.0 - (a.interval_scale - b.interval_scale).abs();
    let hint = 1.0 - ((a.hint_level - b.hint_level).abs() as f64 / 2.0);
    (0.3 * diff + 0.2 * ratio + 0.2 * batch + 0.2 * interval + 0.1 * hint).clamp(0.0, 1.0)
}

/// Index of the candidate most similar to `target`; the first one wins ties.
pub fn nearest_candidate(target: &StrategyParams, candidates: &[StrategyParams]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        let sim = strategy_similarity(target, candidate);
        match best {
            Some((_, best_sim)) if sim <= best_sim => {}
            _ => best = Some((idx, sim)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// A single past review of the item set, used by memory-model learners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTrace {
    pub seconds_ago: f64,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    pub recent_error_rate: f64,
    /// Mean response time in milliseconds.
    pub recent_response_time: f64,
    pub time_bucket: u8,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub review_trace: Vec<MemoryTrace>,
}

impl DecisionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            recent_error_rate: 0.2,
            recent_response_time: 3000.0,
            time_bucket: 12,
            user_id: user_id.into(),
            interaction_count: None,
            review_trace: Vec::new(),
        }
    }

    pub fn accuracy(&self) -> f64 {
        (1.0 - self.recent_error_rate).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberVote {
    pub learner: String,
    pub action: StrategyParams,
    pub score: f64,
    pub confidence: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DecisionMeta {
    pub phase: ColdStartPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_type: Option<UserType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<HashMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub votes: Vec<MemberVote>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResult {
    pub action: StrategyParams,
    pub confidence: f64,
    pub explanation: String,
    pub meta: DecisionMeta,
}
