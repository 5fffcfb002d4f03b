use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::amas::config::AMASConfig;
use crate::amas::decision::coldstart::ColdStartState;
use crate::amas::decision::ensemble::UpdateReport;
use crate::amas::decision::{DecisionError, EnsembleDecision, EnsembleSnapshot};
use crate::amas::types::{
    nearest_candidate, DecisionContext, DecisionResult, MemberVote, StrategyParams, UserState,
};
use crate::workers::{RewardApplier, UserStateProvider, WorkerError};

/// A decision kept around so delayed rewards can be credited to it later.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub state: UserState,
    pub action: StrategyParams,
    pub context: DecisionContext,
    /// Index of the closest supplied candidate.
    pub action_index: Option<usize>,
    pub votes: Vec<MemberVote>,
}

struct UserSlot {
    ensemble: EnsembleDecision,
    history: VecDeque<DecisionRecord>,
    applied_rewards: u64,
}

/// Per-user ensembles. Different users never share a lock once their slot exists.
pub struct AmasEngine {
    config: AMASConfig,
    users: RwLock<HashMap<String, Arc<Mutex<UserSlot>>>>,
}

impl AmasEngine {
    pub fn new(config: AMASConfig) -> Self {
        Self {
            config,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AMASConfig {
        &self.config
    }

    fn seed_for(&self, user_id: &str) -> u64 {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in user_id.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        self.config.seed ^ hash
    }

    fn slot(&self, user_id: &str) -> Arc<Mutex<UserSlot>> {
        if let Some(slot) = self.users.read().get(user_id) {
            return Arc::clone(slot);
        }
        let mut users = self.users.write();
        let slot = users.entry(user_id.to_string()).or_insert_with(|| {
            tracing::debug!(user_id = %user_id, "creating ensemble for new user");
            Arc::new(Mutex::new(UserSlot {
                ensemble: EnsembleDecision::new(&self.config, self.seed_for(user_id)),
                history: VecDeque::new(),
                applied_rewards: 0,
            }))
        });
        Arc::clone(slot)
    }

    fn existing_slot(&self, user_id: &str) -> Option<Arc<Mutex<UserSlot>>> {
        self.users.read().get(user_id).map(Arc::clone)
    }

    pub fn select_action(
        &self,
        state: &UserState,
        actions: &[StrategyParams],
        context: &DecisionContext,
    ) -> Result<DecisionResult, DecisionError> {
        let slot = self.slot(&context.user_id);
        let mut slot = slot.lock();
        let result = slot.ensemble.select_action(state, actions, context)?;

        slot.history.push_back(DecisionRecord {
            state: state.clone(),
            action: result.action.clone(),
            context: context.clone(),
            action_index: nearest_candidate(&result.action, actions),
            votes: result.meta.votes.clone(),
        });
        while slot.history.len() > self.config.decision_history_size.max(1) {
            slot.history.pop_front();
        }

        Ok(result)
    }

    /// Immediate feedback for the user's latest decision.
    pub fn update(
        &self,
        state: &UserState,
        action: &StrategyParams,
        reward: f64,
        context: &DecisionContext,
    ) -> Result<UpdateReport, DecisionError> {
        let slot = self.slot(&context.user_id);
        let mut slot = slot.lock();
        let report = slot.ensemble.update(state, action, reward, context)?;
        slot.applied_rewards += 1;
        Ok(report)
    }

    /// Credits a delayed reward to the recorded decision with `action_index`,
    /// or to the latest decision when no index matches. Cold start is not
    /// advanced: one served decision must count as one interaction.
    pub fn apply_delayed_reward(
        &self,
        user_id: &str,
        reward: f64,
        action_index: Option<usize>,
    ) -> Result<UpdateReport, WorkerError> {
        let slot = self
            .existing_slot(user_id)
            .ok_or_else(|| WorkerError::Apply(format!("unknown user {user_id}")))?;
        let mut slot = slot.lock();

        let record = action_index
            .and_then(|idx| {
                slot.history
                    .iter()
                    .rev()
                    .find(|r| r.action_index == Some(idx))
            })
            .or_else(|| slot.history.back())
            .cloned()
            .ok_or_else(|| WorkerError::Apply(format!("no recorded decision for user {user_id}")))?;

        let report = slot
            .ensemble
            .credit_delayed(&record.state, &record.action, reward, &record.context, &record.votes)
            .map_err(|err| WorkerError::Apply(err.to_string()))?;
        slot.applied_rewards += 1;
        Ok(report)
    }

    pub fn applied_rewards(&self, user_id: &str) -> u64 {
        self.existing_slot(user_id)
            .map(|slot| slot.lock().applied_rewards)
            .unwrap_or(0)
    }

    pub fn latest_state(&self, user_id: &str) -> Option<UserState> {
        let slot = self.existing_slot(user_id)?;
        let slot = slot.lock();
        slot.history.back().map(|r| r.state.clone())
    }

    pub fn cold_start_state(&self, user_id: &str) -> Option<ColdStartState> {
        let slot = self.existing_slot(user_id)?;
        let slot = slot.lock();
        Some(slot.ensemble.cold_start().state().clone())
    }

    pub fn restore_cold_start(&self, user_id: &str, snapshot: &serde_json::Value) {
        let slot = self.slot(user_id);
        slot.lock().ensemble.cold_start_mut().restore(snapshot);
    }

    pub fn snapshot(&self, user_id: &str) -> Option<EnsembleSnapshot> {
        let slot = self.existing_slot(user_id)?;
        let slot = slot.lock();
        Some(slot.ensemble.snapshot())
    }

    pub fn restore(&self, user_id: &str, snapshot: &EnsembleSnapshot) {
        let slot = self.slot(user_id);
        slot.lock().ensemble.restore(snapshot);
    }

    /// Drops everything known about the user. Returns false for unknown users.
    pub fn reset_user(&self, user_id: &str) -> bool {
        self.users.write().remove(user_id).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }
}

#[async_trait]
impl RewardApplier for AmasEngine {
    async fn apply_reward(
        &self,
        user_id: &str,
        reward: f64,
        _feature_vector: Option<&[f64]>,
        action_index: Option<usize>,
    ) -> Result<(), WorkerError> {
        self.apply_delayed_reward(user_id, reward, action_index)
            .map(|_| ())
    }
}

#[async_trait]
impl UserStateProvider for AmasEngine {
    async fn get_user_state(&self, user_id: &str) -> Result<Option<UserState>, WorkerError> {
        Ok(self.latest_state(user_id))
    }
}
