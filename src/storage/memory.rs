//! In-memory response sink for tests and throwaway runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::sink::{ResponseSink, StoredResponse};
use crate::dss::response::SurveyId;

/// Keeps persisted rows in a `tokio::sync::RwLock<Vec<..>>`.
///
/// [`MemoryResponseSink::set_failing`] makes every subsequent
/// `persist_batch` fail without storing anything.
#[derive(Default)]
pub struct MemoryResponseSink {
    rows: tokio::sync::RwLock<Vec<StoredResponse>>,
    failing: AtomicBool,
    batches: AtomicUsize,
}

impl MemoryResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `persist_batch` calls.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Copy of every stored row, in write order.
    pub async fn rows(&self) -> Vec<StoredResponse> {
        self.rows.read().await.clone()
    }
}

impl ResponseSink for MemoryResponseSink {
    fn persist_batch(
        &self,
        survey_id: SurveyId,
        responses: Vec<StoredResponse>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("response sink unavailable (survey {survey_id})");
            }
            let count = responses.len();
            self.rows.write().await.extend(responses);
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(count)
        })
    }

    fn count_responses(
        &self,
        survey_id: SurveyId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(rows.iter().filter(|r| r.survey_id == survey_id).count() as u64)
        })
    }
}
