//! Free-text anonymization before persistence.
//!
//! Only answers to free-text questions pass through an [`Anonymizer`].  A
//! failing anonymizer never blocks a flush: the original text is kept and a
//! warning is logged.

use std::future::Future;
use std::pin::Pin;

use regex::Regex;
use tracing::warn;

use crate::dss::response::{PendingResponse, SurveyId};
use crate::storage::StoredResponse;

/// Async text scrubber.
pub trait Anonymizer: Send + Sync + 'static {
    fn anonymize<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;
}

/// Returns the text unchanged.  Selected when anonymization is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughAnonymizer;

impl Anonymizer for PassThroughAnonymizer {
    fn anonymize<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move { Ok(text.to_string()) })
    }
}

/// Redacts links, e-mail addresses and phone-like digit runs.
#[derive(Debug, Clone)]
pub struct PatternAnonymizer {
    rules: Vec<(Regex, &'static str)>,
}

impl PatternAnonymizer {
    pub fn new() -> anyhow::Result<Self> {
        // Order matters: a URL may contain something that looks like an
        // address or a number.
        let rules = vec![
            (Regex::new(r"(?i)\b(?:https?://|www\.)[^\s<>]+")?, "[link]"),
            (
                Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b")?,
                "[email]",
            ),
            (Regex::new(r"\+?\d[\d\s().-]{6,}\d")?, "[number]"),
        ];
        Ok(Self { rules })
    }

    fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, placeholder) in &self.rules {
            out = pattern.replace_all(&out, *placeholder).into_owned();
        }
        out
    }
}

impl Anonymizer for PatternAnonymizer {
    fn anonymize<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move { Ok(self.redact(text)) })
    }
}

/// Turn a pending batch into rows ready for the sink, anonymizing free
/// text on the way.
pub async fn anonymize_batch(
    anonymizer: &dyn Anonymizer,
    survey_id: SurveyId,
    batch: &[PendingResponse],
) -> Vec<StoredResponse> {
    let mut rows = Vec::with_capacity(batch.len());
    for pending in batch {
        let answer = if pending.question_type.is_free_text() {
            match anonymizer.anonymize(&pending.answer).await {
                Ok(clean) => clean,
                Err(e) => {
                    warn!(
                        survey_id,
                        question_id = pending.question_id,
                        error = %e,
                        "Anonymization failed; keeping original answer"
                    );
                    pending.answer.clone()
                }
            }
        } else {
            pending.answer.clone()
        };
        rows.push(StoredResponse {
            survey_id,
            question_id: pending.question_id,
            question_type: pending.question_type,
            answer,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dss::response::QuestionType;
    use std::time::Instant;

    struct BrokenAnonymizer;

    impl Anonymizer for BrokenAnonymizer {
        fn anonymize<'a>(
            &'a self,
            _text: &'a str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(async { Err(anyhow::anyhow!("model offline")) })
        }
    }

    fn pending(seq: u64, question_type: QuestionType, answer: &str) -> PendingResponse {
        PendingResponse {
            seq,
            survey_id: 1,
            question_id: seq as i64,
            question_type,
            answer: answer.to_string(),
            enqueued_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_pattern_redacts_contact_details() {
        let a = PatternAnonymizer::new().unwrap();
        let out = a
            .anonymize("Mail jane.doe@example.org or see https://example.org/x?y=1")
            .await
            .unwrap();
        assert_eq!(out, "Mail [email] or see [link]");

        let out = a.anonymize("Call me at +1 (555) 123-4567 please").await.unwrap();
        assert_eq!(out, "Call me at [number] please");
    }

    #[tokio::test]
    async fn test_pattern_keeps_ordinary_text() {
        let a = PatternAnonymizer::new().unwrap();
        let text = "The course was great, 10 out of 10.";
        assert_eq!(a.anonymize(text).await.unwrap(), text);
    }

    #[tokio::test]
    async fn test_only_free_text_is_anonymized() {
        let a = PatternAnonymizer::new().unwrap();
        let batch = vec![
            pending(1, QuestionType::FreeText, "ping me: bob@example.com"),
            pending(2, QuestionType::SingleChoice, "bob@example.com"),
        ];
        let rows = anonymize_batch(&a, 1, &batch).await;
        assert_eq!(rows[0].answer, "ping me: [email]");
        assert_eq!(rows[1].answer, "bob@example.com");
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_original() {
        let batch = vec![pending(1, QuestionType::FreeText, "raw text")];
        let rows = anonymize_batch(&BrokenAnonymizer, 1, &batch).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].answer, "raw text");
    }

    #[tokio::test]
    async fn test_pass_through() {
        let out = PassThroughAnonymizer.anonymize("a@b.io").await.unwrap();
        assert_eq!(out, "a@b.io");
    }
}
