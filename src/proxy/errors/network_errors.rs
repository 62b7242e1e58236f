use crate::error::ProxyError;

/// Classify a [`reqwest::Error`] into the proxy error model.
///
/// Everything here is a Network error by policy, timeouts included;
/// the message keeps enough detail for the logs to tell DNS from TLS from
/// plain connection resets.
pub fn classify_network_error(error: &reqwest::Error) -> ProxyError {
    let error_str = error.to_string().to_lowercase();

    if error.is_timeout() {
        return ProxyError::Network(format!("timeout: {error}"));
    }

    if error.is_connect() {
        if error_str.contains("dns") || error_str.contains("resolve") {
            return ProxyError::Network(format!("dns: {error}"));
        }
        if error_str.contains("ssl") || error_str.contains("tls") || error_str.contains("certificate") {
            return ProxyError::Network(format!("tls: {error}"));
        }
        return ProxyError::Network(format!("connect: {error}"));
    }

    if error.is_body() || error.is_decode() {
        return ProxyError::Network(format!("body: {error}"));
    }

    ProxyError::Network(error.to_string())
}
