pub mod actr;
pub mod coldstart;
pub mod ensemble;
pub mod heuristic;
pub mod linucb;
pub mod thompson;

pub use actr::ActrMemoryLearner;
pub use coldstart::ColdStartManager;
pub use ensemble::{DecisionError, EnsembleDecision, EnsembleSnapshot};
pub use heuristic::HeuristicLearner;
pub use linucb::LinUCBModel;
pub use thompson::ThompsonSamplingModel;

use serde::{Deserialize, Serialize};

use crate::amas::config::LearnerConfig;
use crate::amas::types::{DecisionContext, MemoryTrace, StrategyParams, UserState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnerKind {
    LinUcb,
    Thompson,
    Actr,
    Heuristic,
}

impl LearnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinUcb => "linucb",
            Self::Thompson => "thompson",
            Self::Actr => "actr",
            Self::Heuristic => "heuristic",
        }
    }

    pub fn needs_review_trace(&self) -> bool {
        matches!(self, Self::Actr)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LearnerError {
    #[error("action space is empty")]
    EmptyActionSpace,
    #[error("numerical failure in {learner}: {detail}")]
    Numerical { learner: String, detail: String },
    #[error("{learner} is unavailable: {detail}")]
    Unavailable { learner: String, detail: String },
}

/// Context view handed to a single learner.
#[derive(Debug, Clone)]
pub struct LearnerContext<'a> {
    pub recent_error_rate: f64,
    pub recent_response_time: f64,
    pub time_bucket: u8,
    /// Working default, e.g. the strategy settled during cold start.
    pub baseline: Option<&'a StrategyParams>,
    /// Only populated for memory-model learners.
    pub review_trace: Option<&'a [MemoryTrace]>,
}

impl<'a> LearnerContext<'a> {
    pub fn shared(context: &DecisionContext, baseline: Option<&'a StrategyParams>) -> Self {
        Self {
            recent_error_rate: context.recent_error_rate,
            recent_response_time: context.recent_response_time,
            time_bucket: context.time_bucket,
            baseline,
            review_trace: None,
        }
    }

    pub fn with_trace(mut self, trace: &'a [MemoryTrace]) -> Self {
        self.review_trace = Some(trace);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LearnerOutput {
    pub action: StrategyParams,
    pub score: f64,
    pub confidence: f64,
    pub meta: Option<serde_json::Value>,
}

/// Contract every ensemble member satisfies.
pub trait Learner: Send {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn kind(&self) -> LearnerKind;

    /// Returns one of `actions`, or a variant of one with only `interval_scale`
    /// and `new_ratio` adjusted. Never mutates its inputs.
    fn select_action(
        &mut self,
        state: &UserState,
        actions: &[StrategyParams],
        ctx: &LearnerContext<'_>,
    ) -> Result<LearnerOutput, LearnerError>;

    /// `reward` is already clamped to [-1, 1].
    fn update(
        &mut self,
        state: &UserState,
        action: &StrategyParams,
        reward: f64,
        ctx: &LearnerContext<'_>,
    ) -> Result<(), LearnerError>;
}

/// Builds the enabled learners. Each gets its own generator derived from `seed`.
pub fn build_learners(config: &LearnerConfig, seed: u64) -> Vec<Box<dyn Learner>> {
    let flags = &config.feature_flags;
    let mut learners: Vec<Box<dyn Learner>> = Vec::new();

    if flags.linucb_enabled {
        learners.push(Box::new(LinUCBModel::new(
            linucb::CONTEXT_FEATURE_DIM,
            linucb::ACTION_FEATURE_DIM,
            config.bandit.alpha,
        )));
    }
    if flags.thompson_enabled {
        let mut thompson = ThompsonSamplingModel::with_seed(
            config.bandit.prior_alpha,
            config.bandit.prior_beta,
            seed,
        );
        thompson.set_context_config(
            config.bandit.thompson_context_bins,
            config.bandit.thompson_context_weight,
        );
        thompson.set_ess_k(config.bandit.thompson_ess_k);
        learners.push(Box::new(thompson));
    }
    if flags.actr_memory_enabled {
        learners.push(Box::new(ActrMemoryLearner::new(config.actr.clone())));
    }
    if flags.heuristic_enabled {
        learners.push(Box::new(HeuristicLearner::default()));
    }

    learners
}

pub(crate) fn ensure_candidates(actions: &[StrategyParams]) -> Result<(), LearnerError> {
    if actions.is_empty() {
        return Err(LearnerError::EmptyActionSpace);
    }
    Ok(())
}
