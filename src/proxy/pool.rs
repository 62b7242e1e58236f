// 账号池：选号、会话粘滞、冷却与故障转移
//
// All status mutations, cooldown timers, affinity entries and the round-robin
// cursor live behind one mutex, so externally the pool behaves as if
// serialised. Every mutation snapshots the account list to disk.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::models::{Account, AccountStatus, AuthKind, Credential};
use crate::modules::persistence::AccountStore;
use crate::proxy::config::ProxyConfig;

/// 选中账号的快照，供上游调用使用
#[derive(Debug, Clone)]
pub struct SelectedAccount {
    pub id: String,
    pub access_token: String,
    pub expires_at: i64,
    pub auth_kind: AuthKind,
}

struct AffinityEntry {
    account_id: String,
    expires_at: Instant,
}

struct PoolInner {
    /// 插入顺序即 round-robin 顺序
    accounts: Vec<Account>,
    cursor: usize,
    affinity: HashMap<String, AffinityEntry>,
    /// 连续落盘失败次数，仅用于日志降噪
    persist_failures: u32,
}

pub struct AccountPool {
    inner: Mutex<PoolInner>,
    store: AccountStore,
    cooldown_secs: i64,
    affinity_ttl: std::time::Duration,
}

/// 管理接口用的账号摘要
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub auth_kind: &'static str,
    pub status: &'static str,
    pub enabled: bool,
    pub expires_at: i64,
    pub cooldown_until: Option<i64>,
    pub last_error: Option<crate::models::LastError>,
    pub last_used_at: Option<i64>,
}

const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const PROBE_STRIKES: u32 = 2;

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl AccountPool {
    /// 从磁盘加载账号启动
    pub fn load(store: AccountStore, config: &ProxyConfig) -> Result<Self, String> {
        let mut accounts = store.load()?;
        let now = now_ts();
        // 进程重启后清掉已过期的冷却
        for account in &mut accounts {
            if account.status == AccountStatus::Cooldown && account.cooldown_expired(now) {
                account.leave_cooldown();
            }
        }
        info!("[Pool] loaded {} account(s)", accounts.len());
        Ok(Self {
            inner: Mutex::new(PoolInner {
                accounts,
                cursor: 0,
                affinity: HashMap::new(),
                persist_failures: 0,
            }),
            store,
            cooldown_secs: config.cooldown.as_secs() as i64,
            affinity_ttl: config.affinity_ttl,
        })
    }

    fn persist(&self, inner: &mut PoolInner) {
        match self.store.save(&inner.accounts) {
            Ok(()) => inner.persist_failures = 0,
            Err(e) => {
                inner.persist_failures += 1;
                warn!("[Pool] failed to persist accounts ({}): {}", inner.persist_failures, e);
            }
        }
    }

    /// 选号：粘滞优先，其次 round-robin；无可用账号时报 NoAccountAvailable
    pub async fn select(&self, session_key: Option<&str>) -> Result<SelectedAccount, ProxyError> {
        self.select_excluding(session_key, None).await
    }

    /// 同 select，但跳过指定账号（故障转移时避免粘滞命中失败账号）
    pub async fn select_excluding(
        &self,
        session_key: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<SelectedAccount, ProxyError> {
        let mut inner = self.inner.lock().await;
        let now = now_ts();
        let mono_now = Instant::now();

        // 冷却到期即恢复（边界时刻视为到期）
        let mut promoted = false;
        for account in &mut inner.accounts {
            if account.status == AccountStatus::Cooldown && account.cooldown_expired(now) {
                account.leave_cooldown();
                promoted = true;
            }
        }
        if promoted {
            self.persist(&mut inner);
        }

        // 1. 粘滞会话
        if let Some(key) = session_key {
            let bound = inner
                .affinity
                .get(key)
                .map(|e| (e.account_id.clone(), e.expires_at > mono_now));
            match bound {
                Some((account_id, true)) => {
                    if Some(account_id.as_str()) != exclude {
                        let selected = inner
                            .accounts
                            .iter()
                            .find(|a| a.id() == account_id && a.status == AccountStatus::Active)
                            .map(snapshot);
                        if let Some(selected) = selected {
                            let ttl = self.affinity_ttl;
                            if let Some(entry) = inner.affinity.get_mut(key) {
                                entry.expires_at = mono_now + ttl;
                            }
                            self.touch(&mut inner, &selected.id, now);
                            return Ok(selected);
                        }
                    }
                }
                Some((_, false)) => {
                    // 过期表项读时回收
                    inner.affinity.remove(key);
                }
                None => {}
            }
        }

        // 2. round-robin，从上次选中的下一个开始
        let n = inner.accounts.len();
        if n == 0 {
            return Err(ProxyError::NoAccountAvailable);
        }
        let cursor = inner.cursor;
        let mut chosen: Option<usize> = None;
        for offset in 1..=n {
            let idx = (cursor + offset) % n;
            let account = &inner.accounts[idx];
            if account.status == AccountStatus::Active && Some(account.id()) != exclude {
                chosen = Some(idx);
                break;
            }
        }
        // 全部被排除时放宽排除约束（仅剩失败账号也比直接拒绝好）
        if chosen.is_none() && exclude.is_some() {
            for offset in 1..=n {
                let idx = (cursor + offset) % n;
                if inner.accounts[idx].status == AccountStatus::Active {
                    chosen = Some(idx);
                    break;
                }
            }
        }

        let Some(idx) = chosen else {
            return Err(ProxyError::NoAccountAvailable);
        };

        inner.cursor = idx;
        let selected = snapshot(&inner.accounts[idx]);
        if let Some(key) = session_key {
            let ttl = self.affinity_ttl;
            inner.affinity.insert(
                key.to_string(),
                AffinityEntry {
                    account_id: selected.id.clone(),
                    expires_at: mono_now + ttl,
                },
            );
        }
        self.touch(&mut inner, &selected.id, now);
        Ok(selected)
    }

    fn touch(&self, inner: &mut PoolInner, id: &str, now: i64) {
        if let Some(account) = inner.accounts.iter_mut().find(|a| a.id() == id) {
            account.last_used_at = Some(now);
        }
    }

    /// 请求成功：清零失败计数
    pub async fn report_success(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(account) = inner.accounts.iter_mut().find(|a| a.id() == id) {
            account.consecutive_failures = 0;
            account.probe_failures = 0;
        }
    }

    /// 请求失败上报，按错误类型驱动状态机
    pub async fn report_failure(&self, id: &str, err: &ProxyError) {
        let mut inner = self.inner.lock().await;
        let now = now_ts();
        let cooldown_secs = self.cooldown_secs;
        let Some(account) = inner.accounts.iter_mut().find(|a| a.id() == id) else {
            return;
        };
        account.record_error(err.kind(), &err.to_string(), now);

        match err {
            ProxyError::QuotaExceeded(marker) => {
                info!("[Pool] account {} cooling down ({})", id, marker);
                account.enter_cooldown(cooldown_secs, now);
            }
            ProxyError::InvalidRefreshToken => {
                warn!("[Pool] account {} unhealthy (invalid refresh token)", id);
                account.mark_unhealthy();
            }
            ProxyError::UpstreamServerError { .. } | ProxyError::Network(_) => {
                account.consecutive_failures += 1;
                if account.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!(
                        "[Pool] account {} unhealthy ({} consecutive failures)",
                        id, account.consecutive_failures
                    );
                    account.mark_unhealthy();
                    account.consecutive_failures = 0;
                }
            }
            // ContentTooLong 等不影响账号状态
            _ => {}
        }
        self.persist(&mut inner);
    }

    /// 冷却到期的账号批量转回 Active（调度器周期调用；选号路径也会做）
    pub async fn sweep_cooldowns(&self) {
        let mut inner = self.inner.lock().await;
        let now = now_ts();
        let mut promoted = false;
        for account in &mut inner.accounts {
            if account.status == AccountStatus::Cooldown && account.cooldown_expired(now) {
                info!("[Pool] account {} cooldown expired", account.id());
                account.leave_cooldown();
                promoted = true;
            }
        }
        if promoted {
            self.persist(&mut inner);
        }
    }

    /// 健康探针结果，两振出局，一次成功即恢复
    pub async fn record_probe_result(&self, id: &str, ok: bool) {
        let mut inner = self.inner.lock().await;
        let now = now_ts();
        let Some(account) = inner.accounts.iter_mut().find(|a| a.id() == id) else {
            return;
        };
        if ok {
            account.probe_failures = 0;
            if account.status == AccountStatus::Unhealthy {
                info!("[Pool] account {} recovered by health check", id);
                account.status = AccountStatus::Active;
                self.persist(&mut inner);
            }
        } else {
            account.probe_failures += 1;
            if account.probe_failures >= PROBE_STRIKES
                && account.status == AccountStatus::Active
            {
                warn!("[Pool] account {} unhealthy (probe strikes)", id);
                account.mark_unhealthy();
                account.record_error("health_check", "consecutive probe failures", now);
                self.persist(&mut inner);
            }
        }
    }

    /// 刷新成功后原子替换 token 对；Unhealthy 账号借此回到 Active
    pub async fn apply_refresh(
        &self,
        id: &str,
        access_token: String,
        expires_at: i64,
        refresh_token: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        let Some(account) = inner.accounts.iter_mut().find(|a| a.id() == id) else {
            return;
        };
        account.credential.apply_refresh(access_token, expires_at);
        if let Some(rt) = refresh_token.filter(|rt| !rt.is_empty()) {
            account.credential.refresh_token = rt;
        }
        if account.status == AccountStatus::Unhealthy {
            account.status = AccountStatus::Active;
        }
        self.persist(&mut inner);
    }

    pub async fn mark_unhealthy(&self, id: &str, reason: &str) {
        let mut inner = self.inner.lock().await;
        let now = now_ts();
        if let Some(account) = inner.accounts.iter_mut().find(|a| a.id() == id) {
            account.record_error("invalid_refresh_token", reason, now);
            account.mark_unhealthy();
            self.persist(&mut inner);
        }
    }

    pub async fn credential_snapshot(&self, id: &str) -> Option<Credential> {
        let inner = self.inner.lock().await;
        inner
            .accounts
            .iter()
            .find(|a| a.id() == id)
            .map(|a| a.credential.clone())
    }

    /// 距过期不足 window 秒、可刷新的账号
    pub async fn accounts_needing_refresh(&self, window_secs: i64) -> Vec<String> {
        let inner = self.inner.lock().await;
        let now = now_ts();
        inner
            .accounts
            .iter()
            .filter(|a| a.enabled && a.status != AccountStatus::Disabled)
            .filter(|a| a.credential.expires_in(now) < window_secs)
            .map(|a| a.id().to_string())
            .collect()
    }

    /// 健康检查目标（非 Disabled）
    pub async fn probe_targets(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().await;
        inner
            .accounts
            .iter()
            .filter(|a| a.status != AccountStatus::Disabled)
            .map(|a| (a.id().to_string(), a.credential.access_token.clone()))
            .collect()
    }

    // ---- 管理操作 ----

    pub async fn add_account(&self, credential: Credential) -> Result<String, ProxyError> {
        let mut inner = self.inner.lock().await;
        let id = credential.id.clone();
        if inner.accounts.iter().any(|a| a.id() == id) {
            return Err(ProxyError::Internal(format!("account {id} already exists")));
        }
        inner.accounts.push(Account::new(credential));
        self.persist(&mut inner);
        info!("[Pool] account {} added", id);
        Ok(id)
    }

    pub async fn remove_account(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.accounts.len();
        inner.accounts.retain(|a| a.id() != id);
        inner.affinity.retain(|_, entry| entry.account_id != id);
        let removed = inner.accounts.len() != before;
        if removed {
            self.persist(&mut inner);
            info!("[Pool] account {} removed", id);
        }
        removed
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(account) = inner.accounts.iter_mut().find(|a| a.id() == id) else {
            return false;
        };
        account.set_enabled(enabled);
        self.persist(&mut inner);
        true
    }

    /// 手动恢复。调用方需先完成一次成功刷新（见 admin restore 流程）。
    pub async fn restore(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(account) = inner.accounts.iter_mut().find(|a| a.id() == id) else {
            return false;
        };
        if !account.enabled {
            return false;
        }
        account.leave_cooldown();
        account.consecutive_failures = 0;
        account.probe_failures = 0;
        self.persist(&mut inner);
        true
    }

    pub async fn summaries(&self) -> Vec<AccountSummary> {
        let inner = self.inner.lock().await;
        inner
            .accounts
            .iter()
            .map(|a| AccountSummary {
                id: a.id().to_string(),
                auth_kind: a.credential.auth_kind.as_str(),
                status: a.status.as_str(),
                enabled: a.enabled,
                expires_at: a.credential.expires_at,
                cooldown_until: a.cooldown_until,
                last_error: a.last_error.clone(),
                last_used_at: a.last_used_at,
            })
            .collect()
    }

    pub async fn counts(&self) -> (usize, usize, usize, usize, usize) {
        let inner = self.inner.lock().await;
        let total = inner.accounts.len();
        let mut active = 0;
        let mut cooldown = 0;
        let mut unhealthy = 0;
        let mut disabled = 0;
        for account in &inner.accounts {
            match account.status {
                AccountStatus::Active => active += 1,
                AccountStatus::Cooldown => cooldown += 1,
                AccountStatus::Unhealthy => unhealthy += 1,
                AccountStatus::Disabled => disabled += 1,
            }
        }
        (total, active, cooldown, unhealthy, disabled)
    }

    pub async fn status_of(&self, id: &str) -> Option<AccountStatus> {
        let inner = self.inner.lock().await;
        inner.accounts.iter().find(|a| a.id() == id).map(|a| a.status)
    }
}

fn snapshot(account: &Account) -> SelectedAccount {
    SelectedAccount {
        id: account.id().to_string(),
        access_token: account.credential.access_token.clone(),
        expires_at: account.credential.expires_at,
        auth_kind: account.credential.auth_kind,
    }
}
