// Token 刷新：按 auth_kind 分发到三个刷新端点
//
// Per-account single-flight: concurrent refresh requests for one account
// queue on its mutex and adopt the winner's result instead of issuing a
// second upstream call.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::AuthKind;
use crate::proxy::config::ProxyConfig;
use crate::proxy::http_client::build_refresh_client;
use crate::proxy::pool::AccountPool;

/// 刷新失败分类
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("refresh token rejected by upstream")]
    InvalidRefreshToken,
    #[error("refresh endpoint rate limited")]
    RateLimited,
    #[error("refresh endpoint server error (status {0})")]
    ServerError(u16),
}

/// 刷新成功后的新 token 对
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<i64>,
    #[serde(default, alias = "expiresAt")]
    expires_at: Option<i64>,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
}

const DEFAULT_EXPIRES_IN: i64 = 3600;

pub struct TokenRefresher {
    http: reqwest::Client,
    config: Arc<ProxyConfig>,
    /// account_id → 单飞锁
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenRefresher {
    pub fn new(config: Arc<ProxyConfig>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: build_refresh_client(&config)?,
            config,
            locks: DashMap::new(),
        })
    }

    /// 刷新指定账号的 access token。
    ///
    /// 成功时新 token 对已原子写回池内并持久化。InvalidRefreshToken 会把
    /// 账号转为 Unhealthy；其余失败不改状态。
    pub async fn refresh(
        &self,
        pool: &AccountPool,
        account_id: &str,
    ) -> Result<RefreshedToken, RefreshError> {
        let before = pool
            .credential_snapshot(account_id)
            .await
            .ok_or_else(|| RefreshError::TransientNetwork("account no longer in pool".into()))?;

        let lock = self
            .locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // 等锁期间别人可能已刷新：token 变了就直接共享结果
        let current = pool
            .credential_snapshot(account_id)
            .await
            .ok_or_else(|| RefreshError::TransientNetwork("account no longer in pool".into()))?;
        if current.access_token != before.access_token {
            return Ok(RefreshedToken {
                access_token: current.access_token,
                expires_at: current.expires_at,
            });
        }

        let (url, body) = self.refresh_request(current.auth_kind, &current);
        info!("[Refresh] account {} via {:?}", account_id, current.auth_kind);

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RefreshError::TransientNetwork(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| RefreshError::TransientNetwork(e.to_string()))?;

        if status == 429 {
            return Err(RefreshError::RateLimited);
        }
        if (500..600).contains(&status) {
            return Err(RefreshError::ServerError(status));
        }
        if status >= 400 {
            // invalid_grant 与其余 4xx 一律视为刷新令牌失效
            warn!(
                "[Refresh] account {} rejected (status {}): {}",
                account_id,
                status,
                text.chars().take(120).collect::<String>()
            );
            pool.mark_unhealthy(account_id, "refresh token rejected").await;
            return Err(RefreshError::InvalidRefreshToken);
        }

        let token: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| RefreshError::TransientNetwork(format!("bad token response: {e}")))?;

        let now = chrono::Utc::now().timestamp();
        let expires_at = token
            .expires_at
            .unwrap_or_else(|| now + token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN));

        pool.apply_refresh(
            account_id,
            token.access_token.clone(),
            expires_at,
            token.refresh_token,
        )
        .await;

        info!(
            "[Refresh] account {} ok, expires in {}s",
            account_id,
            expires_at - now
        );
        Ok(RefreshedToken {
            access_token: token.access_token,
            expires_at,
        })
    }

    fn refresh_request(
        &self,
        kind: AuthKind,
        credential: &crate::models::Credential,
    ) -> (String, serde_json::Value) {
        match kind {
            AuthKind::Google | AuthKind::GitHub => (
                self.config.social_token_url.clone(),
                serde_json::json!({
                    "refreshToken": credential.refresh_token,
                }),
            ),
            AuthKind::AwsBuilderId => (
                self.config.builder_id_token_url.clone(),
                serde_json::json!({
                    "refreshToken": credential.refresh_token,
                    "clientId": credential.client_id_hash,
                    "grantType": "refresh_token",
                }),
            ),
            AuthKind::IdentityCenter => (
                self.config.identity_center_refresh_url(),
                serde_json::json!({
                    "refreshToken": credential.refresh_token,
                    "clientIdHash": credential.client_id_hash,
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credential;
    use crate::modules::persistence::AccountStore;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn spawn_stub(
        response: serde_json::Value,
        status: u16,
        delay_ms: u64,
    ) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/refreshToken",
            post(move || {
                let response = response.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        Json(response),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}/refreshToken"), hits)
    }

    async fn pool_with_account(dir: &tempfile::TempDir, kind: AuthKind) -> (AccountPool, String) {
        let store = AccountStore::new(dir.path().join("config.json"));
        let pool = AccountPool::load(store, &ProxyConfig::default()).unwrap();
        let cred = Credential::new(
            "kiro",
            "refresh-me",
            "at-old".into(),
            "rt-1".into(),
            chrono::Utc::now().timestamp() + 600,
            kind,
            "cid".into(),
        );
        let id = pool.add_account(cred).await.unwrap();
        (pool, id)
    }

    #[tokio::test]
    async fn test_refresh_success_updates_pool() {
        let (url, _hits) = spawn_stub(
            serde_json::json!({"accessToken": "at-new", "expiresIn": 3600, "refreshToken": "rt-2"}),
            200,
            0,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let (pool, id) = pool_with_account(&dir, AuthKind::Google).await;

        let mut config = ProxyConfig::default();
        config.social_token_url = url;
        let refresher = TokenRefresher::new(Arc::new(config)).unwrap();

        let refreshed = refresher.refresh(&pool, &id).await.unwrap();
        assert_eq!(refreshed.access_token, "at-new");

        let cred = pool.credential_snapshot(&id).await.unwrap();
        assert_eq!(cred.access_token, "at-new");
        assert_eq!(cred.refresh_token, "rt-2");
        assert!(cred.expires_at > chrono::Utc::now().timestamp() + 3000);
        // id 在刷新后保持稳定
        assert_eq!(cred.id, id);
    }

    #[tokio::test]
    async fn test_invalid_grant_marks_unhealthy() {
        let (url, _hits) = spawn_stub(serde_json::json!({"error": "invalid_grant"}), 400, 0).await;
        let dir = tempfile::tempdir().unwrap();
        let (pool, id) = pool_with_account(&dir, AuthKind::Google).await;

        let mut config = ProxyConfig::default();
        config.social_token_url = url;
        let refresher = TokenRefresher::new(Arc::new(config)).unwrap();

        let err = refresher.refresh(&pool, &id).await.unwrap_err();
        assert!(matches!(err, RefreshError::InvalidRefreshToken));
        assert_eq!(
            pool.status_of(&id).await,
            Some(crate::models::AccountStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn test_server_error_leaves_status() {
        let (url, _hits) = spawn_stub(serde_json::json!({"error": "oops"}), 503, 0).await;
        let dir = tempfile::tempdir().unwrap();
        let (pool, id) = pool_with_account(&dir, AuthKind::GitHub).await;

        let mut config = ProxyConfig::default();
        config.social_token_url = url;
        let refresher = TokenRefresher::new(Arc::new(config)).unwrap();

        let err = refresher.refresh(&pool, &id).await.unwrap_err();
        assert!(matches!(err, RefreshError::ServerError(503)));
        assert_eq!(
            pool.status_of(&id).await,
            Some(crate::models::AccountStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_flight() {
        let (url, hits) = spawn_stub(
            serde_json::json!({"accessToken": "at-shared", "expiresIn": 3600}),
            200,
            150,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let (pool, id) = pool_with_account(&dir, AuthKind::Google).await;

        let mut config = ProxyConfig::default();
        config.social_token_url = url;
        let refresher = Arc::new(TokenRefresher::new(Arc::new(config)).unwrap());
        let pool = Arc::new(pool);

        let r1 = {
            let (refresher, pool, id) = (refresher.clone(), pool.clone(), id.clone());
            tokio::spawn(async move { refresher.refresh(&pool, &id).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let r2 = {
            let (refresher, pool, id) = (refresher.clone(), pool.clone(), id.clone());
            tokio::spawn(async move { refresher.refresh(&pool, &id).await })
        };

        let t1 = r1.await.unwrap().unwrap();
        let t2 = r2.await.unwrap().unwrap();
        assert_eq!(t1.access_token, "at-shared");
        assert_eq!(t2.access_token, "at-shared");
        // 第二个调用共享第一个的结果，上游只被打了一次
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
