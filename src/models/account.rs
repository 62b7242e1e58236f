use serde::{Deserialize, Serialize};

use super::credential::Credential;

/// 账号运行状态机
///
/// Transitions:
/// - Active → Cooldown: quota event (reversed automatically after the timer)
/// - Active → Unhealthy: invalid refresh token, or consecutive failures
/// - Cooldown → Active: timer expiry
/// - Unhealthy → Active: manual restore or a successful refresh
/// - Any → Disabled: user toggles `enabled = false`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Cooldown,
    Unhealthy,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Cooldown => "cooldown",
            AccountStatus::Unhealthy => "unhealthy",
            AccountStatus::Disabled => "disabled",
        }
    }
}

/// 最近一次错误（用于管理接口展示）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub kind: String,
    pub message: String,
    /// Unix seconds.
    pub at: i64,
}

/// 配额快照缓存（非持久化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub used: u64,
    pub limit: u64,
    pub refreshed_at: i64,
}

/// 凭证 + 运行时状态。所有权归 AccountPool，其他组件只按 id 查询。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub credential: Credential,
    pub enabled: bool,
    pub status: AccountStatus,
    /// Unix seconds; present only while status == Cooldown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Not persisted — rebuilt from live traffic.
    #[serde(skip)]
    pub last_used_at: Option<i64>,
    #[serde(skip)]
    pub usage: Option<UsageSnapshot>,
    /// Consecutive request-path failures; resets on any success.
    #[serde(skip)]
    pub consecutive_failures: u32,
    /// Consecutive health-probe failures; two strikes marks Unhealthy.
    #[serde(skip)]
    pub probe_failures: u32,
}

impl Account {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            enabled: true,
            status: AccountStatus::Active,
            cooldown_until: None,
            last_error: None,
            last_used_at: None,
            usage: None,
            consecutive_failures: 0,
            probe_failures: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.credential.id
    }

    /// 冷却是否已到期（边界时刻视为到期，立即可选）
    pub fn cooldown_expired(&self, now: i64) -> bool {
        match self.cooldown_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    pub fn record_error(&mut self, kind: &str, message: &str, now: i64) {
        self.last_error = Some(LastError {
            kind: kind.to_string(),
            message: message.to_string(),
            at: now,
        });
    }

    /// 冷却指定秒数
    pub fn enter_cooldown(&mut self, seconds: i64, now: i64) {
        self.status = AccountStatus::Cooldown;
        self.cooldown_until = Some(now + seconds);
    }

    /// Clear cooldown bookkeeping and return to Active. Caller checks expiry.
    pub fn leave_cooldown(&mut self) {
        self.status = AccountStatus::Active;
        self.cooldown_until = None;
    }

    pub fn mark_unhealthy(&mut self) {
        self.status = AccountStatus::Unhealthy;
        self.cooldown_until = None;
    }

    /// enabled 位驱动 Disabled 状态；重新启用仅在凭证仍有效时回到 Active
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.status = AccountStatus::Disabled;
            self.cooldown_until = None;
        } else if self.status == AccountStatus::Disabled {
            self.status = if self.credential.refresh_token.is_empty() {
                AccountStatus::Unhealthy
            } else {
                AccountStatus::Active
            };
        }
    }
}
