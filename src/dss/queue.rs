//! In-memory pending response queue.
//!
//! Answers are grouped per survey.  Each survey bucket has its own mutex, so
//! submissions to unrelated surveys never contend; the outer map lock is only
//! taken for writing when a bucket is created or discarded.  Nothing here is
//! ever persisted: a crash loses the queue, and that is intended.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::response::{PendingResponse, SubmittedAnswer, SurveyId};

/// Per-survey bookkeeping as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurveyQueueState {
    pub pending: usize,
    pub probability: u32,
}

#[derive(Debug)]
struct SurveyBucket {
    items: Vec<PendingResponse>,
    probability: u32,
    last_activity: Instant,
}

/// Thread-safe buffer of not-yet-persisted answers.
#[derive(Debug)]
pub struct PendingQueue {
    buckets: RwLock<HashMap<SurveyId, Arc<Mutex<SurveyBucket>>>>,
    next_seq: AtomicU64,
    initial_probability: u32,
}

impl PendingQueue {
    /// `initial_probability` seeds the flush probability of new buckets.
    pub fn new(initial_probability: u32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            initial_probability,
        }
    }

    /// Queue `answers` for `survey_id`.  Never fails; returns how many were
    /// queued.
    pub fn enqueue(&self, survey_id: SurveyId, answers: Vec<SubmittedAnswer>) -> usize {
        if answers.is_empty() {
            return 0;
        }
        let now = Instant::now();
        let count = answers.len();
        let entries: Vec<PendingResponse> = answers
            .into_iter()
            .map(|a| PendingResponse {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                survey_id,
                question_id: a.question_id,
                question_type: a.question_type,
                answer: a.answer,
                enqueued_at: now,
            })
            .collect();

        // Push while holding the map lock (shared or exclusive) so a
        // concurrent prune can never discard the bucket we are writing to.
        {
            let buckets = self.buckets.read().expect("rwlock poisoned");
            if let Some(bucket) = buckets.get(&survey_id) {
                let mut bucket = bucket.lock().expect("mutex poisoned");
                bucket.items.extend(entries);
                bucket.last_activity = now;
                return count;
            }
        }

        let mut buckets = self.buckets.write().expect("rwlock poisoned");
        let bucket = buckets.entry(survey_id).or_insert_with(|| {
            Arc::new(Mutex::new(SurveyBucket {
                items: Vec::new(),
                probability: self.initial_probability,
                last_activity: now,
            }))
        });
        let mut bucket = bucket.lock().expect("mutex poisoned");
        bucket.items.extend(entries);
        bucket.last_activity = now;
        count
    }

    fn bucket(&self, survey_id: SurveyId) -> Option<Arc<Mutex<SurveyBucket>>> {
        self.buckets
            .read()
            .expect("rwlock poisoned")
            .get(&survey_id)
            .cloned()
    }

    /// Surveys that currently have state, in ascending id order.
    pub fn survey_ids(&self) -> Vec<SurveyId> {
        let mut ids: Vec<SurveyId> = self
            .buckets
            .read()
            .expect("rwlock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn state(&self, survey_id: SurveyId) -> Option<SurveyQueueState> {
        let bucket = self.bucket(survey_id)?;
        let bucket = bucket.lock().expect("mutex poisoned");
        Some(SurveyQueueState {
            pending: bucket.items.len(),
            probability: bucket.probability,
        })
    }

    pub fn pending_count(&self, survey_id: SurveyId) -> usize {
        self.state(survey_id).map(|s| s.pending).unwrap_or(0)
    }

    /// Pending answers across every survey.
    pub fn total_pending(&self) -> usize {
        let buckets = self.buckets.read().expect("rwlock poisoned");
        buckets
            .values()
            .map(|b| b.lock().expect("mutex poisoned").items.len())
            .sum()
    }

    /// Copy of everything currently queued for `survey_id`, oldest first.
    /// The queue is left untouched; see [`PendingQueue::remove_through`].
    pub fn snapshot_batch(&self, survey_id: SurveyId) -> Vec<PendingResponse> {
        match self.bucket(survey_id) {
            Some(bucket) => bucket.lock().expect("mutex poisoned").items.clone(),
            None => Vec::new(),
        }
    }

    /// Drop every entry with `seq <= max_seq`.  Entries queued after the
    /// snapshot was taken survive.  Returns how many were removed.
    pub fn remove_through(&self, survey_id: SurveyId, max_seq: u64) -> usize {
        let Some(bucket) = self.bucket(survey_id) else {
            return 0;
        };
        let mut bucket = bucket.lock().expect("mutex poisoned");
        let before = bucket.items.len();
        bucket.items.retain(|item| item.seq > max_seq);
        bucket.last_activity = Instant::now();
        before - bucket.items.len()
    }

    /// Apply `f` to the survey's flush probability and return the new value.
    pub fn update_probability<F>(&self, survey_id: SurveyId, f: F) -> Option<u32>
    where
        F: FnOnce(u32) -> u32,
    {
        let bucket = self.bucket(survey_id)?;
        let mut bucket = bucket.lock().expect("mutex poisoned");
        bucket.probability = f(bucket.probability);
        Some(bucket.probability)
    }

    /// Discard the survey's state if nothing is queued for it.
    pub fn discard_if_empty(&self, survey_id: SurveyId) -> bool {
        let mut buckets = self.buckets.write().expect("rwlock poisoned");
        let empty = buckets
            .get(&survey_id)
            .map(|b| b.lock().expect("mutex poisoned").items.is_empty())
            .unwrap_or(false);
        if empty {
            buckets.remove(&survey_id);
        }
        empty
    }

    /// Discard empty survey states untouched for at least `ttl`.
    pub fn prune_idle(&self, ttl: Duration) -> usize {
        let mut buckets = self.buckets.write().expect("rwlock poisoned");
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let bucket = bucket.lock().expect("mutex poisoned");
            !bucket.items.is_empty() || bucket.last_activity.elapsed() < ttl
        });
        before - buckets.len()
    }
}
