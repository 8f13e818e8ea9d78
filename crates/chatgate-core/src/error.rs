//! Client-facing error taxonomy (spec §7).

use serde::Serialize;

/// The gateway's error kinds, carrying enough detail to map to any
/// dialect's envelope shape.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication required or invalid: {0}")]
    Authentication(String),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("provider or model not found: {0}")]
    NotFound(String),
    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("upstream error: {0}")]
    UpstreamError(String),
    #[error("upstream timed out")]
    UpstreamTimeout,
    #[error("upstream overloaded")]
    UpstreamOverloaded,
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The HTTP status code this error maps to (spec §7 table).
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::Authentication(_) => 401,
            GatewayError::InsufficientBalance => 402,
            GatewayError::NotFound(_) => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::UpstreamError(_) => 502,
            GatewayError::UpstreamTimeout => 504,
            GatewayError::UpstreamOverloaded => 503,
            GatewayError::UnsupportedFeature(_) => 400,
            GatewayError::Internal(_) => 500,
        }
    }

    /// The vendor-neutral error-type tag shared by both dialects' envelopes
    /// (spec §7: the two dialect columns are identical in this repo).
    pub fn dialect_error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::UnsupportedFeature(_) => {
                "invalid_request_error"
            }
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::InsufficientBalance => "invalid_request_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::UpstreamError(_)
            | GatewayError::UpstreamTimeout
            | GatewayError::UpstreamOverloaded
            | GatewayError::Internal(_) => "api_error",
        }
    }

    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

/// The vendor error envelope shared by both dialects: `{"error": {...}}`.
#[derive(Debug, Serialize)]
pub struct DialectErrorBody {
    pub error: DialectErrorPayload,
}

#[derive(Debug, Serialize)]
pub struct DialectErrorPayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
}

impl From<&GatewayError> for DialectErrorBody {
    fn from(err: &GatewayError) -> Self {
        DialectErrorBody {
            error: DialectErrorPayload {
                kind: err.dialect_error_type(),
                message: err.client_message(),
            },
        }
    }
}

impl GatewayError {
    /// Render this error as the vendor envelope JSON bytes. Both dialects
    /// use the same `{"error": {"type", "message"}}` shape in this repo's
    /// error surface (spec §7's two dialect columns never diverge).
    pub fn to_dialect_body(&self) -> Vec<u8> {
        serde_json::to_vec(&DialectErrorBody::from(self)).unwrap_or_else(|_| b"{}".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(GatewayError::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(GatewayError::Authentication("x".into()).status_code(), 401);
        assert_eq!(GatewayError::InsufficientBalance.status_code(), 402);
        assert_eq!(GatewayError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            GatewayError::RateLimited {
                retry_after_secs: Some(5)
            }
            .status_code(),
            429
        );
        assert_eq!(GatewayError::UpstreamError("x".into()).status_code(), 502);
        assert_eq!(GatewayError::UpstreamTimeout.status_code(), 504);
        assert_eq!(GatewayError::UpstreamOverloaded.status_code(), 503);
        assert_eq!(GatewayError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn dialect_body_serializes_vendor_envelope() {
        let err = GatewayError::NotFound("model xyz".into());
        let body = err.to_dialect_body();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"]["type"], "not_found_error");
    }
}
