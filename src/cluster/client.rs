//! HTTP client for calls from one instance to another (usually the leader).

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::identity::{base_url_for, InstanceIdentity};
use super::protocol::{
    close_path, sign, Envelope, TransferRequest, HEADER_INSTANCE, HEADER_SIGNATURE,
    HEADER_TIMESTAMP, PING_PATH, TRANSFER_PATH,
};
use crate::dss::SubmittedAnswer;

/// Signed inter-instance client.
///
/// Failures are reported, never retried; the caller decides what to do.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    identity: InstanceIdentity,
    secret: String,
}

impl PeerClient {
    pub fn new(identity: InstanceIdentity, secret: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            identity,
            secret: secret.to_string(),
        })
    }

    /// No-op request proving `peer` is reachable and shares our secret.
    pub async fn ping(&self, peer: &str) -> anyhow::Result<()> {
        self.post(peer, PING_PATH, &serde_json::json!({})).await?;
        Ok(())
    }

    /// Hand a batch of answers to `leader`.  Returns how many it queued.
    pub async fn transfer_responses(
        &self,
        leader: &str,
        survey_id: i64,
        answers: &[SubmittedAnswer],
    ) -> anyhow::Result<usize> {
        let body = TransferRequest {
            survey_id,
            answers: answers.to_vec(),
        };
        let envelope = self.post(leader, TRANSFER_PATH, &body).await?;
        Ok(envelope.count().unwrap_or(answers.len()))
    }

    /// Ask `leader` to close (drain) a survey.  Returns how many responses it
    /// persisted.
    pub async fn close_survey(&self, leader: &str, survey_id: i64) -> anyhow::Result<usize> {
        let envelope = self
            .post(leader, &close_path(survey_id), &serde_json::json!({}))
            .await?;
        Ok(envelope.count().unwrap_or(0))
    }

    async fn post<B>(&self, peer: &str, path: &str, body: &B) -> anyhow::Result<Envelope>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", base_url_for(peer), path);
        let timestamp = chrono::Utc::now().to_rfc3339();
        let signature = sign(&self.secret, self.identity.as_str(), &timestamp);

        debug!(%url, "Sending inter-instance request");
        let response = self
            .http
            .post(&url)
            .header(HEADER_INSTANCE, self.identity.as_str())
            .header(HEADER_TIMESTAMP, &timestamp)
            .header(HEADER_SIGNATURE, signature)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("{url} answered {status} with an unreadable body: {e}"))?;

        if !status.is_success() || !envelope.success {
            anyhow::bail!("{url} answered {status}: {}", envelope.message);
        }
        Ok(envelope)
    }
}
