//! Durable response sink contract.
//!
//! The flush scheduler hands each released batch to a [`ResponseSink`] in
//! one call.  A sink either stores the whole batch or nothing.

use std::future::Future;
use std::pin::Pin;

use crate::dss::response::{QuestionType, SurveyId};

/// One answer as it is written to durable storage.
///
/// Deliberately carries no enqueue time: the only timestamp a persisted row
/// gets is the time of the flush that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub survey_id: SurveyId,
    pub question_id: i64,
    pub question_type: QuestionType,
    pub answer: String,
}

/// Async, all-or-nothing response persistence.
pub trait ResponseSink: Send + Sync + 'static {
    /// Persist `responses` for `survey_id` atomically, returning how many
    /// rows were written.
    fn persist_batch(
        &self,
        survey_id: SurveyId,
        responses: Vec<StoredResponse>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>>;

    /// Number of persisted responses for `survey_id`.
    fn count_responses(
        &self,
        survey_id: SurveyId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;
}
