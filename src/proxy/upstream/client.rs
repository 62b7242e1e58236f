// Kiro upstream HTTP client.
// Request shaping mimics the native IDE: bearer token, per-day machine
// fingerprint in the UA pair, agent version header, one invocation id per call.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::fingerprint::machine_fingerprint;
use crate::error::ProxyError;
use crate::proxy::config::ProxyConfig;
use crate::proxy::errors::classify_network_error;
use crate::proxy::http_client::build_http_client;

/// 重试退避基线（±25% 抖动）
const BACKOFF_SCHEDULE_MS: [u64; 3] = [500, 1000, 2000];

pub struct UpstreamClient {
    http: reqwest::Client,
    config: Arc<ProxyConfig>,
}

impl UpstreamClient {
    pub fn new(config: Arc<ProxyConfig>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: build_http_client(&config)?,
            config,
        })
    }

    /// 构建一次上游调用的完整请求头
    fn headers(&self, access_token: &str, credential_id: &str) -> HeaderMap {
        let now = chrono::Utc::now().timestamp();
        let fingerprint = machine_fingerprint(credential_id, now);
        let agent_version = &self.config.agent_version;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {access_token}")) {
            headers.insert(AUTHORIZATION, value);
        }
        let ua = format!(
            "aws-sdk-js/1.0.27 ua/2.1 os/win32#10.0.19044 lang/js md/nodejs#22.21.1 \
             api/codewhispererstreaming#1.0.27 m/E {agent_version}-{fingerprint}"
        );
        if let Ok(value) = HeaderValue::from_str(&ua) {
            headers.insert(USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("aws-sdk-js/1.0.27 {agent_version}-{fingerprint}")) {
            headers.insert("x-amz-user-agent", value);
        }
        if let Ok(value) = HeaderValue::from_str(agent_version) {
            headers.insert("x-amzn-kiro-agent-version", value);
        }
        headers.insert("x-amzn-codewhisperer-optout", HeaderValue::from_static("true"));
        headers.insert("x-amzn-kiro-agent-mode", HeaderValue::from_static("vibe"));
        if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert("amz-sdk-invocation-id", value);
        }
        headers.insert("amz-sdk-request", HeaderValue::from_static("attempt=1; max=3"));
        headers
    }

    /// 发送会话请求。返回任意状态码的响应；网络层错误已分类。
    /// 响应头等待窗口受 header_timeout 约束。
    pub async fn send_conversation(
        &self,
        access_token: &str,
        credential_id: &str,
        payload: &Value,
    ) -> Result<reqwest::Response, ProxyError> {
        let request = self
            .http
            .post(self.config.conversation_url())
            .headers(self.headers(access_token, credential_id))
            .json(payload);

        let response = tokio::time::timeout(self.config.header_timeout, request.send())
            .await
            .map_err(|_| ProxyError::Network("timed out waiting for response headers".into()))?
            .map_err(|e| classify_network_error(&e))?;

        debug!("[Upstream] conversation → {}", response.status());
        Ok(response)
    }

    /// 健康探针：最小 count-tokens 请求
    pub async fn probe_count_tokens(
        &self,
        access_token: &str,
        credential_id: &str,
    ) -> Result<(), ProxyError> {
        let payload = json!({"content": "ping"});
        let request = self
            .http
            .post(self.config.count_tokens_url())
            .headers(self.headers(access_token, credential_id))
            .json(&payload);

        let response = tokio::time::timeout(self.config.header_timeout, request.send())
            .await
            .map_err(|_| ProxyError::Network("probe timed out".into()))?
            .map_err(|e| classify_network_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            401 | 403 => Err(ProxyError::AuthExpired),
            429 => Err(ProxyError::QuotaExceeded("RATE_LIMITED".into())),
            code => Err(ProxyError::UpstreamServerError {
                status: code,
                message: format!("probe failed with status {code}"),
            }),
        }
    }

    /// 上游模型列表，(id, display name)
    pub async fn list_models(
        &self,
        access_token: &str,
        credential_id: &str,
    ) -> Result<Vec<(String, String)>, ProxyError> {
        let response = self
            .http
            .get(self.config.models_url())
            .headers(self.headers(access_token, credential_id))
            .query(&[("origin", "AI_EDITOR")])
            .send()
            .await
            .map_err(|e| classify_network_error(&e))?;

        if !response.status().is_success() {
            return Err(ProxyError::UpstreamServerError {
                status: response.status().as_u16(),
                message: "model listing failed".into(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| classify_network_error(&e))?;
        let models = body
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| {
                        let id = m.get("modelId")?.as_str()?.to_string();
                        let name = m
                            .get("modelName")
                            .and_then(|n| n.as_str())
                            .unwrap_or(&id)
                            .to_string();
                        Some((id, name))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

/// 第 attempt 次重试前的退避时长（0 起），0.5/1/2s ±25%
pub fn backoff_delay(attempt: usize) -> Duration {
    let base = BACKOFF_SCHEDULE_MS[attempt.min(BACKOFF_SCHEDULE_MS.len() - 1)];
    let jitter = (base / 4) as i64;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_millis((base as i64 + offset).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_with_jitter_bounds() {
        for _ in 0..50 {
            let d0 = backoff_delay(0).as_millis() as i64;
            assert!((375..=625).contains(&d0), "d0 = {d0}");
            let d1 = backoff_delay(1).as_millis() as i64;
            assert!((750..=1250).contains(&d1), "d1 = {d1}");
            let d2 = backoff_delay(2).as_millis() as i64;
            assert!((1500..=2500).contains(&d2), "d2 = {d2}");
            // 超出调度表按最后一档处理
            let d9 = backoff_delay(9).as_millis() as i64;
            assert!((1500..=2500).contains(&d9), "d9 = {d9}");
        }
    }

    #[test]
    fn test_headers_carry_fingerprint_and_agent_version() {
        let config = Arc::new(ProxyConfig::default());
        let client = UpstreamClient::new(config.clone()).unwrap();
        let headers = client.headers("tok-123", "cred-abc");

        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-123");
        assert_eq!(
            headers.get("x-amzn-kiro-agent-version").unwrap(),
            config.agent_version.as_str()
        );

        let now = chrono::Utc::now().timestamp();
        let fp = machine_fingerprint("cred-abc", now);
        let xua = headers.get("x-amz-user-agent").unwrap().to_str().unwrap();
        assert!(xua.contains(&fp), "x-amz-user-agent should embed the fingerprint");
        let ua = headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(ua.contains(&fp));
        assert!(headers.get("amz-sdk-invocation-id").is_some());
    }

    #[test]
    fn test_invocation_id_fresh_per_call() {
        let config = Arc::new(ProxyConfig::default());
        let client = UpstreamClient::new(config).unwrap();
        let a = client.headers("t", "c");
        let b = client.headers("t", "c");
        assert_ne!(
            a.get("amz-sdk-invocation-id").unwrap(),
            b.get("amz-sdk-invocation-id").unwrap()
        );
    }
}
