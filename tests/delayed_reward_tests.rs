use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

use danci_amas_core::amas::config::AMASConfig;
use danci_amas_core::amas::config::RewardPipelineConfig;
use danci_amas_core::amas::reward::{
    AddRewardOptions, DelayedRewardAggregator, EvaluationReason, RewardBreakdown, RewardEvaluator,
    ScheduleEntry,
};
use danci_amas_core::amas::types::ColdStartPhase;
use danci_amas_core::amas::types::{DecisionContext, StrategyParams, UserState};
use danci_amas_core::amas::AmasEngine;
use danci_amas_core::config::Config;
use danci_amas_core::logging::LoggingConfig;
use danci_amas_core::workers::{
    DelayedRewardWorker, DelayedRewardWorkerConfig, RewardApplier, UserStateProvider, WorkerError,
};
use danci_amas_core::AmasRuntime;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

fn no_options() -> AddRewardOptions {
    AddRewardOptions::default()
}

fn user_state(fatigue: f64) -> UserState {
    UserState {
        fatigue,
        ts: 0,
        ..Default::default()
    }
}

#[derive(Default)]
struct RecordingApplier {
    calls: Mutex<Vec<(String, f64)>>,
    failing_user: Option<String>,
}

#[async_trait]
impl RewardApplier for RecordingApplier {
    async fn apply_reward(
        &self,
        user_id: &str,
        reward: f64,
        _feature_vector: Option<&[f64]>,
        _action_index: Option<usize>,
    ) -> Result<(), WorkerError> {
        self.calls.lock().push((user_id.to_string(), reward));
        if self.failing_user.as_deref() == Some(user_id) {
            return Err(WorkerError::Apply("model store unavailable".to_string()));
        }
        Ok(())
    }
}

struct FixedStates(HashMap<String, UserState>);

#[async_trait]
impl UserStateProvider for FixedStates {
    async fn get_user_state(&self, user_id: &str) -> Result<Option<UserState>, WorkerError> {
        match user_id {
            "broken" => Err(WorkerError::UserState("timeout".to_string())),
            _ => Ok(self.0.get(user_id).cloned()),
        }
    }
}

fn worker_with(applier: Arc<dyn RewardApplier>) -> DelayedRewardWorker {
    DelayedRewardWorker::new(DelayedRewardWorkerConfig::default(), applier, None)
}

#[test]
fn out_of_range_reward_is_clamped() {
    let mut clamped = DelayedRewardAggregator::default();
    let mut unit = DelayedRewardAggregator::default();
    clamped.add_reward("u1", 5.0, Some(0), no_options()).unwrap();
    unit.add_reward("u1", 1.0, Some(0), no_options()).unwrap();
    assert_eq!(
        clamped.aggregate(0, None).total_increment,
        unit.aggregate(0, None).total_increment
    );
}

#[test]
fn immediate_share_is_thirty_percent() {
    let mut aggregator = DelayedRewardAggregator::default();
    aggregator.add_reward("u1", 1.0, Some(0), no_options()).unwrap();
    let result = aggregator.aggregate(0, None);
    assert!((result.total_increment - 0.30).abs() < 1e-9);
    assert_eq!(result.breakdown.len(), 1);
    assert_eq!(result.pending_count, 1);
}

#[test]
fn full_schedule_delivers_the_whole_reward() {
    let mut aggregator = DelayedRewardAggregator::default();
    aggregator.add_reward("u1", 1.0, Some(0), no_options()).unwrap();
    let total: f64 = [0, HOUR_MS, 6 * HOUR_MS, DAY_MS, 7 * DAY_MS]
        .into_iter()
        .map(|now| aggregator.aggregate(now, None).total_increment)
        .sum();
    assert!((total - 1.0).abs() < 1e-9);
    assert_eq!(aggregator.pending_count(None), 0);
}

#[test]
fn many_rewards_aggregate_together() {
    let mut aggregator = DelayedRewardAggregator::default();
    for _ in 0..50 {
        aggregator.add_reward("u1", 0.5, Some(0), no_options()).unwrap();
    }
    let result = aggregator.aggregate(0, None);
    assert!((result.total_increment - 7.5).abs() < 1e-9);
}

#[test]
fn evaluator_gates_breakdowns() {
    let evaluator = RewardEvaluator::default();
    let eval = |increment: f64| {
        evaluator.evaluate_reward(
            &RewardBreakdown {
                increment,
                ..Default::default()
            },
            None,
        )
    };

    let zero = eval(0.0);
    assert!(!zero.is_valid);
    assert_eq!(zero.reason, EvaluationReason::NoSignal);

    let negative = eval(-0.5);
    assert!(negative.is_valid);
    assert_eq!(negative.adjusted_reward, -0.5);

    let weak = eval(0.2);
    assert!(!weak.is_valid);
    assert_eq!(weak.adjusted_reward, 0.0);

    let strong = eval(0.8);
    assert!(strong.is_valid);
    assert_eq!(strong.adjusted_reward, 0.8);

    let batch = evaluator.evaluate_batch(&[
        (
            RewardBreakdown {
                increment: 0.8,
                ..Default::default()
            },
            Some(user_state(1.0)),
        ),
        (RewardBreakdown::default(), None),
    ]);
    assert_eq!(batch.len(), 2);
    assert!(batch[0].is_valid);
    assert!(!batch[1].is_valid);
}

#[tokio::test]
async fn tick_applies_due_rewards_and_reports() {
    let applier = Arc::new(RecordingApplier::default());
    let worker = worker_with(applier.clone());
    worker.add_reward("u1", 1.0, Some(0), no_options()).unwrap();
    worker.add_reward("u2", -1.0, Some(0), no_options()).unwrap();

    let summary = worker.process_at(0).await.unwrap();
    assert_eq!(summary.total_users, 2);
    assert_eq!(summary.total_rewards, 2);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.failure_count, 0);
    assert_eq!(summary.filtered_count, 0);

    let calls = applier.calls.lock().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().any(|(u, r)| u == "u1" && (r - 0.3).abs() < 1e-9));
    assert!(calls.iter().any(|(u, r)| u == "u2" && (r + 0.3).abs() < 1e-9));

    let u1 = summary.users.iter().find(|u| u.user_id == "u1").unwrap();
    assert_eq!(u1.update_count, 1);
    assert!((u1.avg_confidence - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn low_confidence_increments_are_filtered() {
    let applier = Arc::new(RecordingApplier::default());
    let worker = worker_with(applier.clone());
    worker.add_reward("u1", 0.5, Some(0), no_options()).unwrap();

    let summary = worker.process_at(0).await.unwrap();
    assert_eq!(summary.filtered_count, 1);
    assert!(applier.calls.lock().is_empty());
    assert_eq!(summary.users[0].update_count, 0);
    assert!(summary.users[0].success);
}

#[tokio::test]
async fn fatigued_user_is_skipped_without_touching_the_model() {
    let engine = Arc::new(AmasEngine::new(AMASConfig::default()));
    let actions = vec![StrategyParams::default()];
    for user in ["tired", "fresh"] {
        engine
            .select_action(&user_state(0.0), &actions, &DecisionContext::new(user))
            .unwrap();
    }

    let states = FixedStates(HashMap::from([
        ("tired".to_string(), user_state(0.9)),
        ("fresh".to_string(), user_state(0.0)),
    ]));
    let worker = DelayedRewardWorker::new(
        DelayedRewardWorkerConfig::default(),
        engine.clone(),
        Some(Arc::new(states)),
    );
    worker.add_reward("tired", 1.0, Some(0), no_options()).unwrap();
    worker.add_reward("fresh", 1.0, Some(0), no_options()).unwrap();

    let summary = worker.process_at(0).await.unwrap();
    assert_eq!(summary.filtered_count, 1);
    assert_eq!(summary.success_count, 1);
    let tired = summary.users.iter().find(|u| u.user_id == "tired").unwrap();
    assert!(tired.skipped);

    assert_eq!(engine.applied_rewards("tired"), 0);
    assert_eq!(engine.applied_rewards("fresh"), 1);

    // Skipped shares are gone, not requeued.
    let next = worker.process_at(0).await.unwrap();
    assert_eq!(next.total_rewards, 0);
}

#[tokio::test]
async fn state_provider_errors_skip_fatigue_filtering() {
    let applier = Arc::new(RecordingApplier::default());
    let worker = DelayedRewardWorker::new(
        DelayedRewardWorkerConfig::default(),
        applier.clone(),
        Some(Arc::new(FixedStates(HashMap::new()))),
    );
    worker.add_reward("broken", 1.0, Some(0), no_options()).unwrap();

    let summary = worker.process_at(0).await.unwrap();
    assert_eq!(summary.success_count, 1);
    assert_eq!(applier.calls.lock().len(), 1);
}

#[tokio::test]
async fn apply_failure_stops_only_that_user() {
    let applier = Arc::new(RecordingApplier {
        failing_user: Some("bad".to_string()),
        ..Default::default()
    });
    let worker = worker_with(applier.clone());
    worker.add_reward("bad", 1.0, Some(0), no_options()).unwrap();
    worker.add_reward("bad", 1.0, Some(0), no_options()).unwrap();
    worker.add_reward("good", 1.0, Some(0), no_options()).unwrap();

    let summary = worker.process_at(0).await.unwrap();
    assert_eq!(summary.failure_count, 1);
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.requeued_count, 2);
    assert_eq!(summary.dropped_count, 0);

    let calls = applier.calls.lock().clone();
    assert_eq!(calls.iter().filter(|(u, _)| u == "bad").count(), 1);
    assert_eq!(calls.iter().filter(|(u, _)| u == "good").count(), 1);

    let bad = summary.users.iter().find(|u| u.user_id == "bad").unwrap();
    assert!(!bad.success);
    assert_eq!(bad.update_count, 0);
}

struct BlockingApplier {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl RewardApplier for BlockingApplier {
    async fn apply_reward(
        &self,
        _user_id: &str,
        _reward: f64,
        _feature_vector: Option<&[f64]>,
        _action_index: Option<usize>,
    ) -> Result<(), WorkerError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn concurrent_tick_is_rejected() {
    let applier = Arc::new(BlockingApplier {
        started: Notify::new(),
        release: Notify::new(),
    });
    let worker = Arc::new(worker_with(applier.clone()));
    worker.add_reward("u1", 1.0, Some(0), no_options()).unwrap();

    let running = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.process_at(0).await })
    };
    applier.started.notified().await;
    assert!(worker.is_processing());
    assert!(worker.process_at(0).await.is_none());

    applier.release.notify_one();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.success_count, 1);
    assert!(!worker.is_processing());
}

#[tokio::test]
async fn snapshot_round_trip_does_not_pay_twice() {
    let first_applier = Arc::new(RecordingApplier::default());
    let first = worker_with(first_applier.clone());
    first.add_reward("u1", 1.0, Some(0), no_options()).unwrap();
    first.process_at(0).await.unwrap();
    let snapshot = first.get_state();

    let second_applier = Arc::new(RecordingApplier::default());
    let second = worker_with(second_applier.clone());
    second.set_state(snapshot.clone());
    assert_eq!(second.get_state(), snapshot);

    let replay = second.process_at(0).await.unwrap();
    assert_eq!(replay.total_rewards, 0);

    let later = second.process_at(HOUR_MS).await.unwrap();
    assert_eq!(later.total_rewards, 1);
    let calls = second_applier.calls.lock().clone();
    assert_eq!(calls.len(), 0, "0.2 share is below the confidence floor");
    assert_eq!(later.filtered_count, 1);
}

#[tokio::test]
async fn process_once_uses_the_wall_clock() {
    let applier = Arc::new(RecordingApplier::default());
    let worker = worker_with(applier.clone());
    worker.add_reward("u1", 1.0, None, no_options()).unwrap();
    let summary = worker.process_once().await.unwrap();
    assert_eq!(summary.total_rewards, 1);
    assert_eq!(worker.pending_count(None), 1);
}

#[tokio::test]
async fn runtime_closes_the_loop_in_process() {
    let config = Config {
        logging: LoggingConfig::default(),
        amas: AMASConfig::default(),
        delayed_reward: DelayedRewardWorkerConfig::default(),
    };
    let runtime = AmasRuntime::new(&config);
    let actions = vec![
        StrategyParams::default(),
        StrategyParams::for_user_type(danci_amas_core::amas::types::UserType::Cautious),
    ];
    let context = DecisionContext::new("learner-1");
    runtime
        .engine
        .select_action(&user_state(0.1), &actions, &context)
        .unwrap();

    runtime
        .worker
        .add_reward(
            "learner-1",
            1.0,
            Some(0),
            AddRewardOptions {
                action_index: Some(0),
                feature_vector: Some(vec![0.5, 0.2]),
                ..Default::default()
            },
        )
        .unwrap();
    let summary = runtime.worker.process_at(0).await.unwrap();

    // Fatigue 0.1 dampens 0.3 below the floor, so the immediate share is filtered.
    assert_eq!(summary.filtered_count, 1);
    let summary = runtime.worker.process_at(DAY_MS).await.unwrap();
    assert_eq!(summary.success_count, 1);
    assert_eq!(runtime.engine.applied_rewards("learner-1"), 1);
}

#[tokio::test]
async fn invalid_reward_is_rejected_at_the_boundary() {
    let worker = worker_with(Arc::new(RecordingApplier::default()));
    assert!(matches!(
        worker.add_reward("u1", f64::INFINITY, None, no_options()),
        Err(WorkerError::Reward(_))
    ));
    assert_eq!(worker.pending_count(None), 0);
}

#[tokio::test]
async fn delayed_fractions_do_not_count_as_interactions() {
    let runtime = AmasRuntime::new(&Config {
        logging: LoggingConfig::default(),
        amas: AMASConfig::default(),
        delayed_reward: DelayedRewardWorkerConfig::default(),
    });
    let actions = vec![StrategyParams::default()];
    let context = DecisionContext::new("u");
    let decision = runtime
        .engine
        .select_action(&user_state(0.0), &actions, &context)
        .unwrap();
    runtime
        .worker
        .add_reward("u", -1.0, Some(0), no_options())
        .unwrap();

    for now in [0, HOUR_MS, 6 * HOUR_MS, DAY_MS, 7 * DAY_MS] {
        let summary = runtime.worker.process_at(now).await.unwrap();
        assert_eq!(summary.success_count, 1);
    }
    assert_eq!(runtime.engine.applied_rewards("u"), 5);

    let cold_start = runtime.engine.cold_start_state("u").unwrap();
    assert_eq!(cold_start.update_count, 0);
    assert_eq!(cold_start.phase, ColdStartPhase::Classify);
    assert_eq!(cold_start.user_type, None);

    runtime
        .engine
        .update(&user_state(0.0), &decision.action, -1.0, &context)
        .unwrap();
    assert_eq!(runtime.engine.cold_start_state("u").unwrap().update_count, 1);
}

/// Fails the first `failures` applies, then succeeds.
struct FlakyApplier {
    failures: usize,
    calls: Mutex<Vec<f64>>,
}

#[async_trait]
impl RewardApplier for FlakyApplier {
    async fn apply_reward(
        &self,
        _user_id: &str,
        reward: f64,
        _feature_vector: Option<&[f64]>,
        _action_index: Option<usize>,
    ) -> Result<(), WorkerError> {
        let mut calls = self.calls.lock();
        calls.push(reward);
        if calls.len() <= self.failures {
            return Err(WorkerError::Apply("store briefly unavailable".to_string()));
        }
        Ok(())
    }
}

fn immediate_only_config() -> DelayedRewardWorkerConfig {
    DelayedRewardWorkerConfig {
        pipeline: RewardPipelineConfig {
            schedule: Some(vec![ScheduleEntry::new(0, 1.0, "immediate")]),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn failed_increment_is_retried_after_backoff() {
    let applier = Arc::new(FlakyApplier {
        failures: 1,
        calls: Mutex::new(Vec::new()),
    });
    let worker = DelayedRewardWorker::new(immediate_only_config(), applier.clone(), None);
    worker.add_reward("u1", 0.8, Some(0), no_options()).unwrap();

    let first = worker.process_at(0).await.unwrap();
    assert_eq!(first.failure_count, 1);
    assert_eq!(first.requeued_count, 1);
    assert_eq!(worker.pending_count(Some("u1")), 1);

    let early = worker.process_at(59_999).await.unwrap();
    assert_eq!(early.total_rewards, 0);

    let retry = worker.process_at(60_000).await.unwrap();
    assert_eq!(retry.total_rewards, 1);
    assert_eq!(retry.success_count, 1);
    assert_eq!(worker.pending_count(None), 0);

    let calls = applier.calls.lock().clone();
    assert_eq!(calls.len(), 2);
    assert!((calls[1] - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn retries_stop_after_the_configured_cap() {
    let applier = Arc::new(FlakyApplier {
        failures: usize::MAX,
        calls: Mutex::new(Vec::new()),
    });
    let worker = DelayedRewardWorker::new(immediate_only_config(), applier.clone(), None);
    worker.add_reward("u1", 0.8, Some(0), no_options()).unwrap();

    // Backoff doubles: due at 1, 3 and 7 minutes.
    let mut dropped = 0;
    for now in [0, 60_000, 180_000, 420_000] {
        let summary = worker.process_at(now).await.unwrap();
        assert_eq!(summary.total_rewards, 1, "nothing due at {now}");
        dropped += summary.dropped_count;
    }
    assert_eq!(dropped, 1);
    assert_eq!(applier.calls.lock().len(), 4);
    assert_eq!(worker.pending_count(None), 0);
    assert_eq!(worker.process_at(10 * DAY_MS).await.unwrap().total_rewards, 0);
}

#[tokio::test]
async fn requeued_increments_survive_a_snapshot() {
    let applier = Arc::new(FlakyApplier {
        failures: 1,
        calls: Mutex::new(Vec::new()),
    });
    let worker = DelayedRewardWorker::new(immediate_only_config(), applier.clone(), None);
    worker.add_reward("u1", -0.6, Some(0), no_options()).unwrap();
    worker.process_at(0).await.unwrap();

    let snapshot = worker.get_state();
    assert_eq!(snapshot.processor.events.len(), 1);
    assert_eq!(snapshot.processor.events[0].retry_count, 1);

    let recovered_applier = Arc::new(RecordingApplier::default());
    let recovered = DelayedRewardWorker::new(immediate_only_config(), recovered_applier.clone(), None);
    recovered.set_state(snapshot);
    let summary = recovered.process_at(60_000).await.unwrap();
    assert_eq!(summary.success_count, 1);
    let calls = recovered_applier.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert!((calls[0].1 + 0.6).abs() < 1e-9);
}
