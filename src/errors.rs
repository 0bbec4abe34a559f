//! Error types surfaced to callers and HTTP clients.
//!
//! Component traits (stores, sinks, anonymizers) return `anyhow::Result`;
//! anything that crosses a public boundary is converted into
//! [`ShieldError`].  The enum implements [`axum::response::IntoResponse`]
//! so handlers can simply return `Err(ShieldError::NotLeader { .. })` and
//! the client receives the uniform JSON envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::cluster::protocol::Envelope;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors visible outside a single component.
#[derive(Debug, Error)]
pub enum ShieldError {
    /// A follower could not verify connectivity to the recorded leader.
    /// Fatal at startup: the instance must not join the fleet.
    #[error("cannot reach leader {leader}: {reason}")]
    LeaderUnreachable { leader: String, reason: String },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An inter-instance request carried a bad or missing signature.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A leader-only operation reached a follower.
    #[error("this instance is not the leader")]
    NotLeader { leader: Option<String> },

    /// The request body or parameters were malformed.
    #[error("{0}")]
    BadRequest(String),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ShieldError {
    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShieldError::LeaderUnreachable { .. } => StatusCode::BAD_GATEWAY,
            ShieldError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ShieldError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ShieldError::NotLeader { .. } => StatusCode::CONFLICT,
            ShieldError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ShieldError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ShieldError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        let data = match &self {
            ShieldError::NotLeader {
                leader: Some(leader),
            } => Some(serde_json::json!({ "leader": leader })),
            _ => None,
        };
        let body = Envelope {
            success: false,
            message: self.to_string(),
            data,
        };

        (status, [("x-request-id", request_id)], Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ShieldError::NotLeader { leader: None }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ShieldError::Unauthorized("bad signature".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ShieldError::Internal(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_into_response_sets_request_id() {
        let response = ShieldError::BadRequest("empty batch".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key("x-request-id"));
    }
}
