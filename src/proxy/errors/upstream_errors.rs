use crate::error::ProxyError;

/// Upstream reason markers that appear in error bodies.
pub const MARKER_MONTHLY_REQUEST_COUNT: &str = "MONTHLY_REQUEST_COUNT";
pub const MARKER_CONTENT_LENGTH: &str = "CONTENT_LENGTH_EXCEEDS_THRESHOLD";

/// 上游错误响应分类
///
/// Quota events (429 or the monthly-count marker) cool the account down;
/// content-length events are permanent for the request and must not trigger
/// failover — retrying the same oversized conversation cannot succeed.
pub fn classify_upstream_error(status: u16, body: &str) -> ProxyError {
    if body.contains(MARKER_CONTENT_LENGTH) {
        return ProxyError::ContentTooLong(MARKER_CONTENT_LENGTH.to_string());
    }

    if status == 429 || body.contains(MARKER_MONTHLY_REQUEST_COUNT) {
        let marker = if body.contains(MARKER_MONTHLY_REQUEST_COUNT) {
            MARKER_MONTHLY_REQUEST_COUNT
        } else {
            "RATE_LIMITED"
        };
        return ProxyError::QuotaExceeded(marker.to_string());
    }

    match status {
        401 | 403 => ProxyError::AuthExpired,
        500..=599 => ProxyError::UpstreamServerError {
            status,
            message: truncate(body, 200),
        },
        _ => ProxyError::UpstreamServerError {
            status,
            message: truncate(body, 200),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
