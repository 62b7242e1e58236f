// HTTP 服务装配与生命周期
//
// 单例组件（账号池、调度器）在这里显式构造并通过 AppState 传递，
// 不依赖任何模块级全局状态。关闭顺序：停调度器 → 落盘。

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use tracing::info;

use crate::auth::TokenRefresher;
use crate::models::MemoryFlowSink;
use crate::modules::persistence::AccountStore;
use crate::modules::scheduler::BackgroundScheduler;
use crate::proxy::config::ProxyConfig;
use crate::proxy::handlers::{admin, anthropic, gemini, openai};
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::UpstreamClient;

/// Flow 环形缓冲大小
const MAX_FLOWS: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub pool: Arc<AccountPool>,
    pub refresher: Arc<TokenRefresher>,
    pub upstream: Arc<UpstreamClient>,
    pub flow_sink: Arc<MemoryFlowSink>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // OpenAI
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/models", get(openai::models))
        // Anthropic
        .route("/v1/messages", post(anthropic::messages))
        .route("/v1/messages/count_tokens", post(anthropic::count_tokens))
        // Gemini — 单段同时携带模型与动作（model:generateContent）
        .route("/v1/models/:model_action", post(gemini::generate))
        .route("/v1beta/models/:model_action", post(gemini::generate))
        // 管理接口
        .route("/api/status", get(admin::status))
        .route("/api/accounts", get(admin::list_accounts))
        .route("/api/accounts", post(admin::add_account))
        .route("/api/accounts/:id", delete(admin::delete_account))
        .route("/api/accounts/:id/toggle", post(admin::toggle_account))
        .route("/api/accounts/:id/refresh", post(admin::refresh_account))
        .route("/api/accounts/:id/restore", post(admin::restore_account))
        .route("/api/flows", get(admin::flows))
        .route("/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
        .with_state(state)
}

/// 启动服务并阻塞到 Ctrl-C
pub async fn run(config: ProxyConfig) -> Result<(), String> {
    let config = Arc::new(config);

    let store = AccountStore::new(AccountStore::default_path()?);
    let pool = Arc::new(AccountPool::load(store, &config)?);
    let refresher = Arc::new(
        TokenRefresher::new(config.clone()).map_err(|e| format!("refresh client: {e}"))?,
    );
    let upstream = Arc::new(
        UpstreamClient::new(config.clone()).map_err(|e| format!("upstream client: {e}"))?,
    );
    let flow_sink = Arc::new(MemoryFlowSink::new(MAX_FLOWS));

    let scheduler = BackgroundScheduler::start(pool.clone(), refresher.clone(), upstream.clone());

    let state = AppState {
        config: config.clone(),
        pool,
        refresher,
        upstream,
        flow_sink,
    };
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!("kiro-proxy listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| format!("server error: {e}"))?;

    // 调度器先停，再让池内状态随最后一次变更落盘
    scheduler.shutdown().await;
    info!("kiro-proxy stopped");
    Ok(())
}
