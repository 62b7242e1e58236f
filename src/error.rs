use thiserror::Error;

/// 请求处理过程中的统一错误类型
///
/// Retryable kinds (`QuotaExceeded`, `AuthExpired`, `UpstreamServerError`,
/// `Network`) are recovered by the orchestrator's failover loop and only
/// surface once the attempt budget is exhausted. The rest surface immediately.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no account available")]
    NoAccountAvailable,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("content too long: {0}")]
    ContentTooLong(String),

    #[error("access token expired or rejected")]
    AuthExpired,

    #[error("refresh token is no longer valid")]
    InvalidRefreshToken,

    #[error("upstream server error (status {status}): {message}")]
    UpstreamServerError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol translation failed: {0}")]
    ProtocolTranslation(String),

    #[error("client cancelled the request")]
    ClientCancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// 该错误是否允许在同一请求内换号/重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::QuotaExceeded(_)
                | ProxyError::AuthExpired
                | ProxyError::UpstreamServerError { .. }
                | ProxyError::Network(_)
        )
    }

    /// Short stable label used in flow records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NoAccountAvailable => "no_account_available",
            ProxyError::QuotaExceeded(_) => "quota_exceeded",
            ProxyError::ContentTooLong(_) => "content_too_long",
            ProxyError::AuthExpired => "auth_expired",
            ProxyError::InvalidRefreshToken => "invalid_refresh_token",
            ProxyError::UpstreamServerError { .. } => "upstream_server_error",
            ProxyError::Network(_) => "network",
            ProxyError::ProtocolTranslation(_) => "protocol_translation",
            ProxyError::ClientCancelled => "client_cancelled",
            ProxyError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ProxyError::QuotaExceeded("q".into()).is_retryable());
        assert!(ProxyError::AuthExpired.is_retryable());
        assert!(ProxyError::Network("reset".into()).is_retryable());
        assert!(ProxyError::UpstreamServerError {
            status: 502,
            message: "bad gateway".into()
        }
        .is_retryable());

        assert!(!ProxyError::ContentTooLong("big".into()).is_retryable());
        assert!(!ProxyError::NoAccountAvailable.is_retryable());
        assert!(!ProxyError::ClientCancelled.is_retryable());
        assert!(!ProxyError::ProtocolTranslation("bad".into()).is_retryable());
    }

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(ProxyError::NoAccountAvailable.kind(), "no_account_available");
        assert_eq!(ProxyError::AuthExpired.kind(), "auth_expired");
        assert_eq!(ProxyError::ClientCancelled.kind(), "client_cancelled");
    }
}
