use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::amas::types::{StrategyParams, UserState};

use super::{ensure_candidates, Learner, LearnerContext, LearnerError, LearnerKind, LearnerOutput};

const MAX_PARAMS_CACHE_SIZE: usize = 1000;
const MAX_GAMMA_ITERATIONS: usize = 10000;
const DEFAULT_CONTEXT_BINS: usize = 3;
const DEFAULT_CONTEXT_WEIGHT: f64 = 0.7;
const DEFAULT_ESS_K: f64 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BetaParams {
    alpha: f64,
    beta: f64,
    last_used: u64,
}

impl BetaParams {
    fn new(prior_alpha: f64, prior_beta: f64) -> Self {
        Self {
            alpha: prior_alpha,
            beta: prior_beta,
            last_used: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThompsonSamplingModel {
    prior_alpha: f64,
    prior_beta: f64,
    #[serde(default)]
    global_params: HashMap<String, BetaParams>,
    #[serde(default)]
    context_params: HashMap<String, BetaParams>,
    #[serde(default = "default_context_bins")]
    context_bins: usize,
    #[serde(default = "default_context_weight")]
    context_weight: f64,
    #[serde(default = "default_ess_k")]
    ess_k: f64,
    access_counter: u64,
    #[serde(skip, default = "unseeded_rng")]
    rng: ChaCha8Rng,
}

impl ThompsonSamplingModel {
    pub fn with_seed(prior_alpha: f64, prior_beta: f64, seed: u64) -> Self {
        Self {
            prior_alpha,
            prior_beta,
            global_params: HashMap::new(),
            context_params: HashMap::new(),
            context_bins: DEFAULT_CONTEXT_BINS,
            context_weight: DEFAULT_CONTEXT_WEIGHT,
            ess_k: DEFAULT_ESS_K,
            access_counter: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn set_context_config(&mut self, bins: usize, weight: f64) {
        self.context_bins = bins.max(2);
        self.context_weight = weight.clamp(0.0, 1.0);
    }

    pub fn set_ess_k(&mut self, k: f64) {
        self.ess_k = if k.is_finite() && k > 0.0 { k } else { DEFAULT_ESS_K };
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Posterior mean of the global arm for `strategy`.
    pub fn expected_value(&self, strategy: &StrategyParams) -> f64 {
        self.global_params
            .get(&strategy.action_key())
            .map(|p| p.alpha / (p.alpha + p.beta).max(1e-10))
            .unwrap_or(self.prior_alpha / (self.prior_alpha + self.prior_beta).max(1e-10))
    }

    fn confidence_for(&self, strategy: &StrategyParams) -> f64 {
        let observed = self
            .global_params
            .get(&strategy.action_key())
            .map(|p| (p.alpha + p.beta - self.prior_alpha - self.prior_beta).max(0.0))
            .unwrap_or(0.0);
        (observed / (observed + self.ess_k)).clamp(0.1, 1.0)
    }

    fn ensure_params(&mut self, action_key: &str) -> BetaParams {
        self.access_counter += 1;
        let counter = self.access_counter;
        Self::evict_if_needed(&mut self.global_params);
        Self::ensure_params_in(
            &mut self.global_params,
            action_key,
            self.prior_alpha,
            self.prior_beta,
            counter,
        )
    }

    fn ensure_context_params(&mut self, full_key: &str) -> BetaParams {
        self.access_counter += 1;
        let counter = self.access_counter;
        Self::evict_if_needed(&mut self.context_params);
        Self::ensure_params_in(
            &mut self.context_params,
            full_key,
            self.prior_alpha,
            self.prior_beta,
            counter,
        )
    }

    fn ensure_params_in(
        map: &mut HashMap<String, BetaParams>,
        key: &str,
        prior_alpha: f64,
        prior_beta: f64,
        counter: u64,
    ) -> BetaParams {
        map.entry(key.to_string())
            .and_modify(|p| p.last_used = counter)
            .or_insert_with(|| {
                let mut p = BetaParams::new(prior_alpha, prior_beta);
                p.last_used = counter;
                p
            })
            .clone()
    }

    fn evict_if_needed(map: &mut HashMap<String, BetaParams>) {
        if map.len() <= MAX_PARAMS_CACHE_SIZE {
            return;
        }

        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.last_used)).collect();
        entries.sort_by_key(|(_, lu)| *lu);

        let to_remove = map.len() - MAX_PARAMS_CACHE_SIZE / 2;
        for (key, _) in entries.into_iter().take(to_remove) {
            map.remove(&key);
        }
    }

    fn sample_beta(&mut self, alpha: f64, beta: f64) -> f64 {
        if alpha <= 0.0 || beta <= 0.0 {
            return 0.5;
        }

        let gamma1 = self.sample_gamma(alpha);
        let gamma2 = self.sample_gamma(beta);

        if gamma1 + gamma2 == 0.0 {
            return 0.5;
        }

        gamma1 / (gamma1 + gamma2)
    }

    /// Marsaglia-Tsang with the shape<1 boost.
    fn sample_gamma(&mut self, shape: f64) -> f64 {
        if shape < 1.0 {
            let u: f64 = self.rng.random();
            return self.sample_gamma(shape + 1.0) * u.powf(1.0 / shape);
        }

        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();

        for _ in 0..MAX_GAMMA_ITERATIONS {
            let z = self.random_normal();
            let v = (1.0 + c * z).powi(3);

            if v <= 0.0 {
                continue;
            }

            let u: f64 = self.rng.random();
            let z_sq = z * z;

            if u < 1.0 - 0.0331 * z_sq * z_sq {
                return d * v;
            }

            if u.ln() < 0.5 * z_sq + d * (1.0 - v + v.ln()) {
                return d * v;
            }
        }

        d
    }

    fn random_normal(&mut self) -> f64 {
        let u1: f64 = self.rng.random::<f64>().max(1e-10);
        let u2: f64 = self.rng.random();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    fn context_signature(&self, state: &UserState, ctx: &LearnerContext<'_>) -> String {
        let bins = self.context_bins.max(2);
        let max_idx = (bins - 1) as i32;
        let attention = state.attention.clamp(0.0, 1.0);
        let fatigue = state.fatigue.clamp(0.0, 1.0);
        let motivation = ((state.motivation + 1.0) / 2.0).clamp(0.0, 1.0);
        let time_of_day = f64::from(ctx.time_bucket.min(23)) / 24.0;

        let bin = |value: f64| -> i32 {
            let idx = (value * bins as f64).floor() as i32;
            idx.clamp(0, max_idx)
        };

        format!(
            "a{}_f{}_m{}_t{}",
            bin(attention),
            bin(fatigue),
            bin(motivation),
            bin(time_of_day)
        )
    }
}

impl Learner for ThompsonSamplingModel {
    fn name(&self) -> &str {
        "thompson"
    }

    fn version(&self) -> &str {
        "2.0.0"
    }

    fn kind(&self) -> LearnerKind {
        LearnerKind::Thompson
    }

    fn select_action(
        &mut self,
        state: &UserState,
        actions: &[StrategyParams],
        ctx: &LearnerContext<'_>,
    ) -> Result<LearnerOutput, LearnerError> {
        ensure_candidates(actions)?;
        let context_key = self.context_signature(state, ctx);
        let mut best: Option<(usize, f64)> = None;

        for (idx, candidate) in actions.iter().enumerate() {
            let action_key = candidate.action_key();
            let params = self.ensure_params(&action_key);
            let context_params = self.ensure_context_params(&format!("{context_key}|{action_key}"));
            let global_sample = self.sample_beta(params.alpha, params.beta);
            let context_sample = self.sample_beta(context_params.alpha, context_params.beta);
            let sample = (1.0 - self.context_weight) * global_sample
                + self.context_weight * context_sample;

            match best {
                Some((_, best_score)) if sample <= best_score => {}
                _ => best = Some((idx, sample)),
            }
        }

        let (idx, score) = best.ok_or(LearnerError::EmptyActionSpace)?;
        let action = actions[idx].clone();
        let confidence = self.confidence_for(&action);
        Ok(LearnerOutput {
            action,
            score,
            confidence,
            meta: Some(serde_json::json!({ "context": context_key })),
        })
    }

    fn update(
        &mut self,
        state: &UserState,
        action: &StrategyParams,
        reward: f64,
        ctx: &LearnerContext<'_>,
    ) -> Result<(), LearnerError> {
        let action_key = action.action_key();
        let full_key = format!("{}|{}", self.context_signature(state, ctx), action_key);
        let success = ((reward.clamp(-1.0, 1.0) + 1.0) / 2.0).clamp(0.0, 1.0);
        let failure = 1.0 - success;

        let mut params = self.ensure_params(&action_key);
        params.alpha += success;
        params.beta += failure;
        params.last_used = self.access_counter;
        self.global_params.insert(action_key, params);

        let mut context_params = self.ensure_context_params(&full_key);
        context_params.alpha += success;
        context_params.beta += failure;
        context_params.last_used = self.access_counter;
        self.context_params.insert(full_key, context_params);

        Ok(())
    }
}

impl Default for ThompsonSamplingModel {
    fn default() -> Self {
        Self::with_seed(1.0, 1.0, 0)
    }
}

fn default_context_bins() -> usize {
    DEFAULT_CONTEXT_BINS
}

fn default_context_weight() -> f64 {
    DEFAULT_CONTEXT_WEIGHT
}

fn default_ess_k() -> f64 {
    DEFAULT_ESS_K
}

fn unseeded_rng() -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(0)
}
