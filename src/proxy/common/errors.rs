// Unified client-facing error formatting for the three protocols.
// Anthropic: {"type":"error","error":{"type":..,"message":..}}
// OpenAI:    {"error":{"message":..,"type":..,"code":..}}
// Gemini:    {"error":{"code":..,"message":..,"status":..}}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ProxyError;
use crate::proxy::mappers::Protocol;

/// HTTP status for a surfaced error, per the propagation policy.
pub fn http_status(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        ProxyError::NoAccountAvailable => StatusCode::SERVICE_UNAVAILABLE,
        ProxyError::ContentTooLong(_) => StatusCode::BAD_REQUEST,
        ProxyError::AuthExpired | ProxyError::InvalidRefreshToken => StatusCode::UNAUTHORIZED,
        ProxyError::UpstreamServerError { .. } | ProxyError::Network(_) => StatusCode::BAD_GATEWAY,
        ProxyError::ProtocolTranslation(_) | ProxyError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        // 客户端已断开，实际不会发出响应；给个占位状态
        ProxyError::ClientCancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn anthropic_error_type(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::QuotaExceeded(_) => "rate_limit_error",
        ProxyError::NoAccountAvailable => "overloaded_error",
        ProxyError::ContentTooLong(_) | ProxyError::ProtocolTranslation(_) => {
            "invalid_request_error"
        }
        ProxyError::AuthExpired | ProxyError::InvalidRefreshToken => "authentication_error",
        _ => "api_error",
    }
}

fn openai_error_type(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::QuotaExceeded(_) => "rate_limit_error",
        ProxyError::ContentTooLong(_) | ProxyError::ProtocolTranslation(_) => {
            "invalid_request_error"
        }
        ProxyError::AuthExpired | ProxyError::InvalidRefreshToken => "authentication_error",
        _ => "api_error",
    }
}

fn gemini_status(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::QuotaExceeded(_) => "RESOURCE_EXHAUSTED",
        ProxyError::NoAccountAvailable => "UNAVAILABLE",
        ProxyError::ContentTooLong(_) | ProxyError::ProtocolTranslation(_) => "INVALID_ARGUMENT",
        ProxyError::AuthExpired | ProxyError::InvalidRefreshToken => "UNAUTHENTICATED",
        _ => "INTERNAL",
    }
}

/// Build the protocol-appropriate HTTP error response.
pub fn error_response(protocol: Protocol, err: &ProxyError) -> Response {
    let status = http_status(err);
    let message = err.to_string();

    let body = match protocol {
        Protocol::Anthropic => json!({
            "type": "error",
            "error": {
                "type": anthropic_error_type(err),
                "message": message,
            }
        }),
        Protocol::OpenAi => json!({
            "error": {
                "message": message,
                "type": openai_error_type(err),
                "code": err.kind(),
            }
        }),
        Protocol::Gemini => json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": gemini_status(err),
            }
        }),
    };

    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            http_status(&ProxyError::QuotaExceeded("MONTHLY_REQUEST_COUNT".into())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            http_status(&ProxyError::NoAccountAvailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            http_status(&ProxyError::ContentTooLong("CONTENT_LENGTH_EXCEEDS_THRESHOLD".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            http_status(&ProxyError::Network("reset".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            http_status(&ProxyError::ProtocolTranslation("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_content_too_long_body_repeats_marker() {
        let resp = error_response(
            Protocol::Anthropic,
            &ProxyError::ContentTooLong("CONTENT_LENGTH_EXCEEDS_THRESHOLD".into()),
        );
        let (parts, body) = resp.into_parts();
        assert_eq!(parts.status, StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(body, 1_000_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["type"], "error");
        assert!(parsed["error"]["message"]
            .as_str()
            .unwrap()
            .contains("CONTENT_LENGTH_EXCEEDS_THRESHOLD"));
    }

    #[tokio::test]
    async fn test_gemini_error_shape() {
        let resp = error_response(Protocol::Gemini, &ProxyError::NoAccountAvailable);
        let (parts, body) = resp.into_parts();
        assert_eq!(parts.status, StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(body, 1_000_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["error"]["status"], "UNAVAILABLE");
        assert_eq!(parsed["error"]["code"], 503);
    }
}
