//! Inter-instance wire protocol.
//!
//! Every call between instances is a `POST` carrying three headers:
//! the sender's identity, an RFC 3339 timestamp, and an HMAC-SHA256
//! signature over both, keyed by the fleet's shared secret.  Replies use the
//! same [`Envelope`] as the public API.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use utoipa::ToSchema;

use crate::dss::SubmittedAnswer;

type HmacSha256 = Hmac<Sha256>;

/// Sender identity header.
pub const HEADER_INSTANCE: &str = "x-shield-instance";
/// Signing timestamp header.
pub const HEADER_TIMESTAMP: &str = "x-shield-timestamp";
/// Hex HMAC-SHA256 signature header.
pub const HEADER_SIGNATURE: &str = "x-shield-signature";

/// Maximum allowed clock skew for signed requests (5 minutes).
pub const CLOCK_SKEW_SECONDS: i64 = 300;

/// Connectivity check path.
pub const PING_PATH: &str = "/internal/ping";
/// Response hand-off path.
pub const TRANSFER_PATH: &str = "/internal/responses";

/// Survey close path for `survey_id`.
pub fn close_path(survey_id: i64) -> String {
    format!("/internal/surveys/{survey_id}/close")
}

/// Uniform success/message/data reply.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Read `data.count`, the convention for "how many responses" replies.
    pub fn count(&self) -> Option<usize> {
        self.data
            .as_ref()
            .and_then(|d| d.get("count"))
            .and_then(|c| c.as_u64())
            .map(|c| c as usize)
    }
}

/// Batch of answers handed from one instance to the leader.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransferRequest {
    pub survey_id: i64,
    pub answers: Vec<SubmittedAnswer>,
}

/// Compute the hex signature for `instance` at `timestamp`.
pub fn sign(secret: &str, instance: &str, timestamp: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(instance.as_bytes());
    mac.update(b"\n");
    mac.update(timestamp.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check a signed request.  Returns a human-readable reason on failure.
pub fn verify(
    secret: &str,
    instance: &str,
    timestamp: &str,
    signature: &str,
    now: DateTime<Utc>,
) -> Result<(), String> {
    if instance.is_empty() {
        return Err("missing sender identity".to_string());
    }
    let sent_at = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| format!("malformed timestamp '{timestamp}'"))?
        .with_timezone(&Utc);
    let skew = (now - sent_at).num_seconds().abs();
    if skew > CLOCK_SKEW_SECONDS {
        return Err(format!("clock skew of {skew}s exceeds {CLOCK_SKEW_SECONDS}s"));
    }
    let expected = sign(secret, instance, timestamp);
    if !constant_time_eq(&expected, signature) {
        return Err("signature mismatch".to_string());
    }
    Ok(())
}

/// Constant-time string comparison to prevent timing attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
