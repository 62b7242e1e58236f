// 后台调度：token 预刷新 + 账号健康检查
//
// Two independent timer loops. Each loop runs its tick inline, so a tick can
// never overlap itself; MissedTickBehavior::Skip drops boundaries that pass
// while a tick runs long. Shutdown cancels both loops and awaits the
// iteration in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::TokenRefresher;
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::UpstreamClient;

/// 预刷新周期
const PRE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// 预刷新窗口：过期前 15 分钟内触发
const PRE_REFRESH_WINDOW_SECS: i64 = 15 * 60;
/// 健康检查周期
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct BackgroundScheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundScheduler {
    /// 启动两个后台循环
    pub fn start(
        pool: Arc<AccountPool>,
        refresher: Arc<TokenRefresher>,
        upstream: Arc<UpstreamClient>,
    ) -> Self {
        Self::start_with_intervals(
            pool,
            refresher,
            upstream,
            PRE_REFRESH_INTERVAL,
            HEALTH_CHECK_INTERVAL,
        )
    }

    pub fn start_with_intervals(
        pool: Arc<AccountPool>,
        refresher: Arc<TokenRefresher>,
        upstream: Arc<UpstreamClient>,
        refresh_interval: Duration,
        health_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();

        let refresh_handle = {
            let pool = pool.clone();
            let refresher = refresher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(refresh_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // interval 的首个 tick 立即到期，跳过它
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            pre_refresh_tick(&pool, &refresher).await;
                        }
                    }
                }
                info!("[Scheduler] pre-refresh loop stopped");
            })
        };

        let health_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(health_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            health_check_tick(&pool, &upstream).await;
                        }
                    }
                }
                info!("[Scheduler] health-check loop stopped");
            })
        };

        info!("[Scheduler] started");
        Self {
            cancel,
            handles: vec![refresh_handle, health_handle],
        }
    }

    /// 取消两个循环并等待当前迭代结束
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            handle.await.ok();
        }
        info!("[Scheduler] shut down");
    }
}

/// 预刷新：对剩余有效期不足 15 分钟的账号触发刷新。失败只记日志。
pub async fn pre_refresh_tick(pool: &AccountPool, refresher: &TokenRefresher) {
    let due = pool.accounts_needing_refresh(PRE_REFRESH_WINDOW_SECS).await;
    if due.is_empty() {
        return;
    }
    info!("[Scheduler] {} account(s) due for pre-refresh", due.len());
    for account_id in due {
        if let Err(e) = refresher.refresh(pool, &account_id).await {
            warn!("[Scheduler] pre-refresh failed for {}: {}", account_id, e);
        }
    }
}

/// 健康检查：对所有非 Disabled 账号发最小探针，结果进两振计数
pub async fn health_check_tick(pool: &AccountPool, upstream: &UpstreamClient) {
    pool.sweep_cooldowns().await;
    let targets = pool.probe_targets().await;
    for (account_id, access_token) in targets {
        let ok = upstream
            .probe_count_tokens(&access_token, &account_id)
            .await
            .is_ok();
        pool.record_probe_result(&account_id, ok).await;
    }
}
