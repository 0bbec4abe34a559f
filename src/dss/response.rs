//! Answer types flowing through the delayed-submission pipeline.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Survey identifier.
pub type SurveyId = i64;

/// Kind of question an answer belongs to.  Only free text is anonymized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    FreeText,
    SingleChoice,
    MultipleChoice,
    Rating,
    YesNo,
    Number,
    Date,
}

impl QuestionType {
    pub fn is_free_text(self) -> bool {
        matches!(self, QuestionType::FreeText)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::FreeText => "free_text",
            QuestionType::SingleChoice => "single_choice",
            QuestionType::MultipleChoice => "multiple_choice",
            QuestionType::Rating => "rating",
            QuestionType::YesNo => "yes_no",
            QuestionType::Number => "number",
            QuestionType::Date => "date",
        }
    }
}

/// One answer as submitted by a participant (or handed over by a peer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubmittedAnswer {
    pub question_id: i64,
    pub question_type: QuestionType,
    pub answer: String,
}

/// An answer waiting in memory for its survey's next flush.
///
/// `seq` is unique per process and increases with enqueue order; a flush
/// removes exactly the entries up to the highest `seq` it persisted.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub seq: u64,
    pub survey_id: SurveyId,
    pub question_id: i64,
    pub question_type: QuestionType,
    pub answer: String,
    pub enqueued_at: Instant,
}
