//! Delayed submission scheduler.
//!
//! Answers are queued the moment they arrive and written to storage later,
//! in batches, at randomized times.  Each tick walks every survey with queued
//! answers: surveys below the minimum batch size are left alone, the others
//! roll against their current flush probability.  A hit on the leader
//! anonymizes, shuffles and persists the survey's whole batch in one write.
//! A hit on a follower does nothing; its queue waits until it leads (or
//! forever, if it never does).

use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::policy::{Dice, FlushPolicy};
use super::queue::PendingQueue;
use super::response::{SubmittedAnswer, SurveyId};
use crate::anonymize::{anonymize_batch, Anonymizer};
use crate::cluster::{LeaderCoordinator, LeadershipState};
use crate::metrics::{FLUSHED_RESPONSES_TOTAL, FLUSH_FAILURES_TOTAL, PENDING_RESPONSES};
use crate::storage::ResponseSink;

/// Outcome of an explicit flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct FlushResult {
    pub persisted: usize,
}

/// What one scheduled tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Surveys that met the minimum batch size.
    pub eligible: usize,
    /// Surveys whose batch was persisted.
    pub flushed: usize,
    /// Answers persisted across all surveys.
    pub persisted: usize,
    /// Flush attempts that failed and left their batch queued.
    pub failed: usize,
    /// Idle survey states discarded.
    pub pruned: usize,
}

/// Per-survey line of [`DssStatus`].
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SurveyStatus {
    pub survey_id: SurveyId,
    pub pending: usize,
    pub probability: u32,
}

/// Read-only snapshot of the scheduler, built on demand.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DssStatus {
    pub pending: usize,
    pub is_leader: bool,
    pub instance: String,
    pub state: LeadershipState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    pub surveys: Vec<SurveyStatus>,
}

struct RunningTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Releases queued answers to storage, on the leader only.
pub struct FlushScheduler {
    queue: PendingQueue,
    policy: FlushPolicy,
    coordinator: Arc<LeaderCoordinator>,
    anonymizer: Arc<dyn Anonymizer>,
    sink: Arc<dyn ResponseSink>,
    dice: Arc<dyn Dice>,
    /// Serializes flushes so a tick and an explicit close never persist the
    /// same snapshot twice.
    flush_lock: tokio::sync::Mutex<()>,
    tick_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<RunningTask>>,
}

impl FlushScheduler {
    pub fn new(
        policy: FlushPolicy,
        coordinator: Arc<LeaderCoordinator>,
        anonymizer: Arc<dyn Anonymizer>,
        sink: Arc<dyn ResponseSink>,
        dice: Arc<dyn Dice>,
    ) -> Self {
        Self {
            queue: PendingQueue::new(policy.min_percentage()),
            policy,
            coordinator,
            anonymizer,
            sink,
            dice,
            flush_lock: tokio::sync::Mutex::new(()),
            tick_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &FlushPolicy {
        &self.policy
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Queue answers for a later flush.  Always succeeds, on any instance.
    pub fn enqueue(&self, survey_id: SurveyId, answers: Vec<SubmittedAnswer>) -> usize {
        let count = self.queue.enqueue(survey_id, answers);
        debug!(survey_id, count, "Queued responses");
        metrics::gauge!(PENDING_RESPONSES).set(self.queue.total_pending() as f64);
        count
    }

    /// Run one scheduled pass over every survey.
    ///
    /// Returns `None` when the previous tick is still running.
    pub async fn tick(&self) -> Option<TickReport> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("Previous flush tick still running; skipping");
            return None;
        };

        let mut report = TickReport::default();
        for survey_id in self.queue.survey_ids() {
            let Some(state) = self.queue.state(survey_id) else {
                continue;
            };
            if state.pending == 0 || !self.policy.is_eligible(state.pending) {
                continue;
            }
            report.eligible += 1;

            let draw = self.dice.roll();
            if !self.policy.should_flush(state.probability, draw) {
                let next = self
                    .queue
                    .update_probability(survey_id, |p| self.policy.after_miss(p));
                debug!(survey_id, draw, probability = ?next, "No flush this tick");
                continue;
            }

            if !self.coordinator.is_leader() {
                debug!(survey_id, "Flush drawn on a follower; leaving queue untouched");
                continue;
            }

            match self.flush_survey(survey_id, "scheduled").await {
                Ok(0) => {}
                Ok(persisted) => {
                    let skip = self.policy.should_skip_reset(self.dice.roll());
                    self.queue
                        .update_probability(survey_id, |p| self.policy.after_flush(p, skip));
                    report.flushed += 1;
                    report.persisted += persisted;
                }
                Err(e) => {
                    metrics::counter!(FLUSH_FAILURES_TOTAL).increment(1);
                    warn!(survey_id, error = %e, "Flush failed; batch stays queued");
                    report.failed += 1;
                }
            }
        }

        report.pruned = self.queue.prune_idle(self.policy.idle_state_ttl());
        if report.pruned > 0 {
            debug!(count = report.pruned, "Discarded idle survey state");
        }
        metrics::gauge!(PENDING_RESPONSES).set(self.queue.total_pending() as f64);
        Some(report)
    }

    /// Persist everything queued for `survey_id` now, ignoring the draw and
    /// the minimum batch size.  A non-leader persists nothing and leaves the
    /// queue alone.  Once drained, the survey's state is discarded.
    pub async fn flush_now(&self, survey_id: SurveyId) -> anyhow::Result<FlushResult> {
        if !self.coordinator.is_leader() {
            debug!(survey_id, "Explicit flush on a non-leader; nothing persisted");
            return Ok(FlushResult { persisted: 0 });
        }

        let persisted = match self.flush_survey(survey_id, "explicit").await {
            Ok(persisted) => persisted,
            Err(e) => {
                metrics::counter!(FLUSH_FAILURES_TOTAL).increment(1);
                warn!(survey_id, error = %e, "Explicit flush failed; batch stays queued");
                return Err(e);
            }
        };
        self.queue.discard_if_empty(survey_id);
        metrics::gauge!(PENDING_RESPONSES).set(self.queue.total_pending() as f64);
        Ok(FlushResult { persisted })
    }

    async fn flush_survey(&self, survey_id: SurveyId, trigger: &'static str) -> anyhow::Result<usize> {
        let _guard = self.flush_lock.lock().await;
        // Leadership may have moved while we waited for the lock.
        if !self.coordinator.is_leader() {
            return Ok(0);
        }

        let batch = self.queue.snapshot_batch(survey_id);
        let Some(max_seq) = batch.iter().map(|p| p.seq).max() else {
            return Ok(0);
        };

        let mut rows = anonymize_batch(self.anonymizer.as_ref(), survey_id, &batch).await;
        rows.shuffle(&mut rand::thread_rng());

        let persisted = self.sink.persist_batch(survey_id, rows).await?;
        let removed = self.queue.remove_through(survey_id, max_seq);
        if removed != batch.len() {
            warn!(survey_id, expected = batch.len(), removed, "Queue changed underneath a flush");
        }

        metrics::counter!(FLUSHED_RESPONSES_TOTAL, "trigger" => trigger).increment(persisted as u64);
        info!(survey_id, count = persisted, trigger, "Flushed responses to storage");
        Ok(persisted)
    }

    pub fn status(&self) -> DssStatus {
        let surveys: Vec<SurveyStatus> = self
            .queue
            .survey_ids()
            .into_iter()
            .filter_map(|survey_id| {
                self.queue.state(survey_id).map(|s| SurveyStatus {
                    survey_id,
                    pending: s.pending,
                    probability: s.probability,
                })
            })
            .collect();
        DssStatus {
            pending: surveys.iter().map(|s| s.pending).sum(),
            is_leader: self.coordinator.is_leader(),
            instance: self.coordinator.identity().to_string(),
            state: self.coordinator.state(),
            leader: self.coordinator.current_leader(),
            surveys,
        }
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Start the periodic flush loop.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().expect("mutex poisoned");
        if guard.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            scheduler.run_loop(stop_rx).await;
        });
        *guard = Some(RunningTask {
            stop: stop_tx,
            handle,
        });
        info!(
            interval_secs = self.policy.check_interval().as_secs(),
            min_batch = self.policy.min_batch_size(),
            "Flush scheduler started"
        );
    }

    /// Stop the loop.  A flush already in progress runs to completion; the
    /// queue itself is dropped with the process, never persisted.
    pub async fn stop(&self) {
        let task = self.task.lock().expect("mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Flush scheduler task ended abnormally");
            }
            let pending = self.queue.total_pending();
            if pending > 0 {
                info!(pending, "Flush scheduler stopped; unflushed responses are discarded");
            } else {
                info!("Flush scheduler stopped");
            }
        }
    }

    async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.policy.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut leadership = self.coordinator.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(report) = self.tick().await {
                        if report.flushed > 0 || report.failed > 0 {
                            debug!(?report, "Flush tick finished");
                        }
                    }
                }
                Ok(()) = leadership.changed() => {
                    let state = *leadership.borrow_and_update();
                    match state {
                        LeadershipState::Leader => info!("Write duties start on this instance"),
                        LeadershipState::Follower => info!("Write duties end on this instance"),
                        LeadershipState::Uninitialized => {}
                    }
                }
                _ = stop.changed() => break,
            }
        }
        debug!("Flush loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymize::{PassThroughAnonymizer, PatternAnonymizer};
    use crate::cluster::{InstanceIdentity, PeerClient};
    use crate::config::{DeploymentMode, ElectionConfig, FlushConfig};
    use crate::coordination::memory::MemorySettingsStore;
    use crate::coordination::store::now_iso8601;
    use crate::coordination::{keys, SettingsStore};
    use crate::dss::policy::FixedDice;
    use crate::dss::response::QuestionType;
    use crate::storage::memory::MemoryResponseSink;
    use std::time::Duration;

    fn flush_config(min: u32, max: u32, step: u32, skip: u32, batch: usize) -> FlushConfig {
        FlushConfig {
            min_percentage: min,
            max_percentage: max,
            percentage_increment: step,
            reset_skip_percentage: skip,
            min_batch_size: batch,
            ..FlushConfig::default()
        }
    }

    fn peer(identity: &InstanceIdentity) -> Arc<PeerClient> {
        Arc::new(PeerClient::new(identity.clone(), "secret", Duration::from_secs(1)).unwrap())
    }

    async fn leader() -> Arc<LeaderCoordinator> {
        let identity = InstanceIdentity::new("solo", 8480);
        let c = Arc::new(LeaderCoordinator::new(
            identity.clone(),
            DeploymentMode::Single,
            Arc::new(MemorySettingsStore::new()),
            peer(&identity),
            ElectionConfig::default(),
        ));
        c.start().await.unwrap();
        c
    }

    async fn follower() -> Arc<LeaderCoordinator> {
        let store = Arc::new(MemorySettingsStore::new());
        store.set(keys::LEADER_ID, "other:8480").await.unwrap();
        store.set(keys::LEADER_HEARTBEAT, &now_iso8601()).await.unwrap();
        let identity = InstanceIdentity::new("me", 8480);
        let c = Arc::new(LeaderCoordinator::new(
            identity.clone(),
            DeploymentMode::Multi,
            store,
            peer(&identity),
            ElectionConfig::default(),
        ));
        assert_eq!(c.run_check().await, Some(LeadershipState::Follower));
        c
    }

    fn scheduler(
        coordinator: Arc<LeaderCoordinator>,
        config: FlushConfig,
        dice: u32,
        sink: Arc<MemoryResponseSink>,
    ) -> FlushScheduler {
        FlushScheduler::new(
            FlushPolicy::from_config(&config).unwrap(),
            coordinator,
            Arc::new(PassThroughAnonymizer),
            sink,
            Arc::new(FixedDice(dice)),
        )
    }

    fn answers(n: usize) -> Vec<SubmittedAnswer> {
        (0..n)
            .map(|i| SubmittedAnswer {
                question_id: i as i64 + 1,
                question_type: QuestionType::Rating,
                answer: "3".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_leader_flush_persists_exact_batch() {
        let sink = Arc::new(MemoryResponseSink::new());
        let s = scheduler(leader().await, flush_config(10, 80, 5, 0, 3), 0, sink.clone());
        s.enqueue(1, answers(4));
        s.enqueue(2, answers(1));
        assert_eq!(s.status().pending, 5);

        let report = s.tick().await.unwrap();
        assert_eq!(report.eligible, 1);
        assert_eq!(report.persisted, 4);
        assert_eq!(sink.count_responses(1).await.unwrap(), 4);
        assert_eq!(s.status().pending, 1);
        assert_eq!(s.queue().state(1).unwrap().probability, 10);
    }

    #[tokio::test]
    async fn test_below_min_batch_never_scheduled() {
        let sink = Arc::new(MemoryResponseSink::new());
        let s = scheduler(leader().await, flush_config(100, 100, 5, 0, 3), 0, sink.clone());
        s.enqueue(1, answers(2));
        for _ in 0..20 {
            let report = s.tick().await.unwrap();
            assert_eq!(report.eligible, 0);
        }
        assert_eq!(sink.batch_count(), 0);
        assert_eq!(s.queue().state(1).unwrap().probability, 100);

        let result = s.flush_now(1).await.unwrap();
        assert_eq!(result.persisted, 2);
        assert_eq!(sink.count_responses(1).await.unwrap(), 2);
        assert!(s.queue().state(1).is_none());
    }

    #[tokio::test]
    async fn test_probability_ramps_to_cap() {
        let sink = Arc::new(MemoryResponseSink::new());
        let s = scheduler(leader().await, flush_config(10, 42, 7, 0, 1), 99, sink.clone());
        s.enqueue(1, answers(1));
        for n in 1..=8u32 {
            s.tick().await.unwrap();
            assert_eq!(s.queue().state(1).unwrap().probability, (10 + n * 7).min(42));
        }
        assert_eq!(sink.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_skipped_reset_carries_probability() {
        let sink = Arc::new(MemoryResponseSink::new());
        // Draw 15: misses at 10, hits at 20, and is below the 50% skip chance.
        let s = scheduler(leader().await, flush_config(10, 80, 10, 50, 1), 15, sink.clone());
        s.enqueue(1, answers(1));

        let report = s.tick().await.unwrap();
        assert_eq!(report.flushed, 0);
        assert_eq!(s.queue().state(1).unwrap().probability, 20);

        let report = s.tick().await.unwrap();
        assert_eq!(report.persisted, 1);
        assert_eq!(s.queue().state(1).unwrap().probability, 20);
    }

    #[tokio::test]
    async fn test_follower_never_flushes() {
        let sink = Arc::new(MemoryResponseSink::new());
        let s = scheduler(follower().await, flush_config(100, 100, 5, 0, 1), 0, sink.clone());
        s.enqueue(1, answers(3));

        let report = s.tick().await.unwrap();
        assert_eq!(report.eligible, 1);
        assert_eq!(report.flushed, 0);
        assert_eq!(s.flush_now(1).await.unwrap().persisted, 0);

        assert_eq!(sink.batch_count(), 0);
        let status = s.status();
        assert_eq!(status.pending, 3);
        assert!(!status.is_leader);
        assert_eq!(status.leader.as_deref(), Some("other:8480"));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch_and_probability() {
        let sink = Arc::new(MemoryResponseSink::new());
        sink.set_failing(true);
        let s = scheduler(leader().await, flush_config(100, 100, 5, 0, 1), 0, sink.clone());
        s.enqueue(1, answers(2));

        let report = s.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(s.queue().pending_count(1), 2);
        assert!(s.flush_now(1).await.is_err());
        assert_eq!(s.queue().pending_count(1), 2);

        sink.set_failing(false);
        let report = s.tick().await.unwrap();
        assert_eq!(report.persisted, 2);
        assert_eq!(s.queue().pending_count(1), 0);
    }

    #[tokio::test]
    async fn test_free_text_anonymized_on_flush() {
        let sink = Arc::new(MemoryResponseSink::new());
        let s = FlushScheduler::new(
            FlushPolicy::from_config(&flush_config(10, 80, 5, 0, 1)).unwrap(),
            leader().await,
            Arc::new(PatternAnonymizer::new().unwrap()),
            sink.clone(),
            Arc::new(FixedDice(0)),
        );
        s.enqueue(
            3,
            vec![SubmittedAnswer {
                question_id: 1,
                question_type: QuestionType::FreeText,
                answer: "write to me at amy@example.com".to_string(),
            }],
        );
        s.flush_now(3).await.unwrap();
        assert_eq!(sink.rows().await[0].answer, "write to me at [email]");
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let sink = Arc::new(MemoryResponseSink::new());
        let s = scheduler(leader().await, flush_config(10, 80, 5, 0, 1), 0, sink);
        let _held = s.tick_lock.lock().await;
        assert!(s.tick().await.is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop_loop() {
        let sink = Arc::new(MemoryResponseSink::new());
        let s = Arc::new(scheduler(
            leader().await,
            flush_config(100, 100, 5, 0, 1),
            0,
            sink.clone(),
        ));
        s.enqueue(1, answers(2));
        s.start();
        // The first interval tick fires immediately.
        for _ in 0..50 {
            if sink.batch_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        s.stop().await;
        assert_eq!(sink.count_responses(1).await.unwrap(), 2);
    }
}
