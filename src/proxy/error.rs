use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

/// Status reported to the client when no fragment arrived in time.
pub const TIMEOUT_STATUS: u16 = 504;

/// Failures of a single request mailbox.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("timed out waiting for a relay message")]
    Timeout,

    #[error("message queue closed")]
    Closed,
}

/// Failures of the identity rotation state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RotationError {
    #[error("only one account is available, nothing to switch to")]
    OnlyOneAccount,

    #[error("an account switch is already in progress")]
    AlreadySwitching,

    #[error("account #{0} is not in the validated pool")]
    UnknownIndex(u32),

    #[error("credentials for account #{0} could not be read")]
    CredentialUnavailable(u32),

    #[error("activating account #{index} failed: {reason}")]
    ActivationFailed { index: u32, reason: String },

    /// Both the target and the fallback identity failed to activate.
    #[error("activating account #{target} failed and fallback to #{fallback} also failed: {reason}")]
    Fatal {
        target: u32,
        fallback: u32,
        reason: String,
    },
}

/// Failures building the credential pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("no valid credentials found in {0}")]
    NoValidCredentials(String),
}

/// Terminal request errors, rendered to clients as Google-style error bodies.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("service unavailable: {0}")]
    AdmissionRejected(String),

    #[error("no bridging peer is connected")]
    NoPeer,

    #[error("bridging connection lost")]
    ConnectionLost,

    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("request cancelled by client")]
    ClientCancelled,

    #[error("failed to serialize relay message: {0}")]
    Serialize(String),

    #[error(transparent)]
    Rotation(#[from] RotationError),
}

impl From<QueueError> for RelayError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Timeout => RelayError::Upstream {
                status: TIMEOUT_STATUS,
                message: "timed out waiting for the browser to respond".to_string(),
            },
            QueueError::Closed => RelayError::ConnectionLost,
        }
    }
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AdmissionRejected(_) | Self::NoPeer | Self::ConnectionLost => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            // nginx-style "client closed request"
            Self::ClientCancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Rotation(RotationError::AlreadySwitching) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Rotation(RotationError::OnlyOneAccount | RotationError::UnknownIndex(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Rotation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Status reported by the upstream service, if this error came from it.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Builds an upstream error from a non-success peer response, preferring the
    /// service's own `error.message`.
    pub fn from_upstream_body(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                let body = body.trim();
                if body.is_empty() {
                    format!("upstream returned status {}", status)
                } else {
                    body.to_string()
                }
            });
        Self::Upstream { status, message }
    }

    /// JSON error payload shared by plain responses and SSE error events.
    pub fn to_payload(&self) -> serde_json::Value {
        let status = self.status_code();
        json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "status": status_text(status),
            }
        })
    }
}

fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("UNKNOWN")
        .to_ascii_uppercase()
        .replace(' ', "_")
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_payload())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_timeout_maps_to_upstream_504() {
        let err: RelayError = QueueError::Timeout.into();
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert!(matches!(err, RelayError::Upstream { status: 504, .. }));
    }

    #[test]
    fn test_queue_closed_maps_to_connection_lost() {
        let err: RelayError = QueueError::Closed.into();
        assert!(matches!(err, RelayError::ConnectionLost));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_payload_shape() {
        let err = RelayError::Upstream {
            status: 429,
            message: "quota".to_string(),
        };
        let payload = err.to_payload();
        assert_eq!(payload["error"]["code"], 429);
        assert_eq!(payload["error"]["message"], "quota");
        assert_eq!(payload["error"]["status"], "TOO_MANY_REQUESTS");
    }

    #[test]
    fn test_from_upstream_body_extracts_message() {
        let err = RelayError::from_upstream_body(
            429,
            r#"{"error": {"code": 429, "message": "Resource has been exhausted"}}"#,
        );
        assert_eq!(err.upstream_status(), Some(429));
        assert_eq!(err.to_string(), "Resource has been exhausted");

        let err = RelayError::from_upstream_body(500, "");
        assert_eq!(err.to_string(), "upstream returned status 500");
        assert_eq!(RelayError::NoPeer.upstream_status(), None);
    }

    #[test]
    fn test_unknown_upstream_status_falls_back_to_bad_gateway() {
        let err = RelayError::Upstream {
            status: 42,
            message: "weird".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
