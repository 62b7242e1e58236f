use std::time::Duration;

/// 默认上游（与 IDE 生产端点一致）
const DEFAULT_BASE_URL: &str = "https://q.us-east-1.amazonaws.com";
/// Social (Google/GitHub) OAuth refresh endpoint used by the desktop IDE.
const DEFAULT_SOCIAL_TOKEN_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";
/// AWS Builder ID OIDC token endpoint.
const DEFAULT_BUILDER_ID_TOKEN_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";
/// Fallback agent version when detection finds nothing.
const DEFAULT_AGENT_VERSION: &str = "KiroIDE-0.8.0";

pub const DEFAULT_PORT: u16 = 8080;

/// 运行配置。CLI 端口参数优先于环境变量。
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub base_url: String,
    pub social_token_url: String,
    pub builder_id_token_url: String,
    /// `x-amzn-kiro-agent-version` value, best-effort detected.
    pub agent_version: String,

    pub connect_timeout: Duration,
    /// Time allowed for upstream response headers.
    pub header_timeout: Duration,
    /// Max silence between streamed chunks.
    pub idle_timeout: Duration,
    /// Hard ceiling for a whole request.
    pub request_deadline: Duration,

    pub cooldown: Duration,
    pub affinity_ttl: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            base_url: DEFAULT_BASE_URL.to_string(),
            social_token_url: DEFAULT_SOCIAL_TOKEN_URL.to_string(),
            builder_id_token_url: DEFAULT_BUILDER_ID_TOKEN_URL.to_string(),
            agent_version: DEFAULT_AGENT_VERSION.to_string(),
            connect_timeout: Duration::from_secs(10),
            header_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            request_deadline: Duration::from_secs(600),
            cooldown: Duration::from_secs(300),
            affinity_ttl: Duration::from_secs(60),
        }
    }
}

impl ProxyConfig {
    /// 读取环境变量覆盖，再用 CLI 端口参数覆盖
    pub fn from_env(cli_port: Option<u16>) -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("KIRO_BASE_URL") {
            if !url.trim().is_empty() {
                config.base_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Some(port) = std::env::var("KIRO_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            config.port = port;
        }
        config.agent_version = detect_agent_version();

        if let Some(port) = cli_port {
            config.port = port;
        }
        config
    }

    pub fn conversation_url(&self) -> String {
        format!("{}/conversation", self.base_url)
    }

    pub fn count_tokens_url(&self) -> String {
        format!("{}/countTokens", self.base_url)
    }

    pub fn models_url(&self) -> String {
        format!("{}/ListAvailableModels", self.base_url)
    }

    pub fn identity_center_refresh_url(&self) -> String {
        format!("{}/refresh-token", self.base_url)
    }
}

/// Agent 版本探测：环境变量优先，失败则退回内置默认值
fn detect_agent_version() -> String {
    if let Ok(v) = std::env::var("KIRO_AGENT_VERSION") {
        let v = v.trim();
        if !v.is_empty() {
            return v.to_string();
        }
    }
    DEFAULT_AGENT_VERSION.to_string()
}
