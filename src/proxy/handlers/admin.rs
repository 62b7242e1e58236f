// 管理 JSON API（Web UI 的后端接口；UI 本体不在本仓库）

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::models::{AuthKind, Credential};
use crate::proxy::server::AppState;

pub async fn status(State(state): State<AppState>) -> Response {
    let (total, active, cooldown, unhealthy, disabled) = state.pool.counts().await;
    Json(json!({
        "accounts_total": total,
        "accounts_active": active,
        "accounts_cooldown": cooldown,
        "accounts_unhealthy": unhealthy,
        "accounts_disabled": disabled,
    }))
    .into_response()
}

pub async fn list_accounts(State(state): State<AppState>) -> Response {
    Json(state.pool.summaries().await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddAccountRequest {
    pub refresh_token: String,
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub client_id_hash: Option<String>,
    /// 上游身份标识（issuer/subject），缺省用 refresh token 哈希占位
    #[serde(default)]
    pub subject: Option<String>,
}

/// 导入账号。初始即尝试一次刷新：失败则账号以 Unhealthy 起步。
pub async fn add_account(
    State(state): State<AppState>,
    Json(request): Json<AddAccountRequest>,
) -> Response {
    if request.refresh_token.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "refresh_token required"})),
        )
            .into_response();
    }

    let subject = request.subject.unwrap_or_else(|| {
        crate::models::derive_credential_id("import", &request.refresh_token)
    });
    let credential = Credential::new(
        request.auth_kind.as_str(),
        &subject,
        request.access_token.unwrap_or_default(),
        request.refresh_token,
        0, // 立即视为过期，逼出首次刷新
        request.auth_kind,
        request.client_id_hash.unwrap_or_default(),
    );

    let id = match state.pool.add_account(credential).await {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    };

    // 首次刷新验证凭证；失败时刷新器已将账号置为 Unhealthy
    let refresh_ok = state.refresher.refresh(&state.pool, &id).await.is_ok();
    let status = state
        .pool
        .status_of(&id)
        .await
        .map(|s| s.as_str())
        .unwrap_or("unknown");

    Json(json!({"id": id, "status": status, "initial_refresh_ok": refresh_ok})).into_response()
}

pub async fn delete_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.pool.remove_account(&id).await {
        Json(json!({"ok": true})).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"error": "no such account"}))).into_response()
    }
}

pub async fn toggle_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(status) = state.pool.status_of(&id).await else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no such account"}))).into_response();
    };
    let enable = status == crate::models::AccountStatus::Disabled;
    state.pool.set_enabled(&id, enable).await;
    let status = state
        .pool
        .status_of(&id)
        .await
        .map(|s| s.as_str())
        .unwrap_or("unknown");
    Json(json!({"id": id, "enabled": enable, "status": status})).into_response()
}

pub async fn refresh_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.refresher.refresh(&state.pool, &id).await {
        Ok(token) => Json(json!({"ok": true, "expires_at": token.expires_at})).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"ok": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

/// 手动恢复：必须先刷新成功才放回 Active
pub async fn restore_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.refresher.refresh(&state.pool, &id).await {
        Ok(_) => {
            if state.pool.restore(&id).await {
                let status = state
                    .pool
                    .status_of(&id)
                    .await
                    .map(|s| s.as_str())
                    .unwrap_or("unknown");
                Json(json!({"ok": true, "status": status})).into_response()
            } else {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"ok": false, "error": "no such account or disabled"})),
                )
                    .into_response()
            }
        }
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "error": format!("refresh must succeed before restore: {e}")})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct FlowsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn flows(State(state): State<AppState>, Query(query): Query<FlowsQuery>) -> Response {
    Json(state.flow_sink.recent(query.limit).await).into_response()
}
