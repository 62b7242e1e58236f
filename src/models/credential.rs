use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 上游认证方式
///
/// The set is closed: the refresher dispatches on this tag to pick one of
/// three refresh endpoints (social OAuth, Builder ID, IdentityCenter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthKind {
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "aws_builder_id")]
    AwsBuilderId,
    #[serde(rename = "identity_center")]
    IdentityCenter,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Google => "google",
            AuthKind::GitHub => "github",
            AuthKind::AwsBuilderId => "aws_builder_id",
            AuthKind::IdentityCenter => "identity_center",
        }
    }
}

/// 一条上游身份凭证
///
/// `id` is derived once from issuer+subject and stays stable across refresh;
/// `refresh_token` is never empty for a live credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry, unix seconds.
    pub expires_at: i64,
    pub auth_kind: AuthKind,
    /// Opaque hash handed back by upstream at login time.
    #[serde(default)]
    pub client_id_hash: String,
    /// Unix seconds.
    pub issued_at: i64,
}

impl Credential {
    pub fn new(
        issuer: &str,
        subject: &str,
        access_token: String,
        refresh_token: String,
        expires_at: i64,
        auth_kind: AuthKind,
        client_id_hash: String,
    ) -> Self {
        Self {
            id: derive_credential_id(issuer, subject),
            access_token,
            refresh_token,
            expires_at,
            auth_kind,
            client_id_hash,
            issued_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Seconds until expiry (negative when already expired).
    pub fn expires_in(&self, now: i64) -> i64 {
        self.expires_at - now
    }

    /// Replace the access token pair. Readers holding the pool lock see
    /// either the old pair or the new one, never a mix.
    pub fn apply_refresh(&mut self, access_token: String, expires_at: i64) {
        self.access_token = access_token;
        self.expires_at = expires_at;
    }
}

/// 凭证 ID：issuer + subject 的稳定哈希，刷新后不变
pub fn derive_credential_id(issuer: &str, subject: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(issuer.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(subject.as_bytes());
    let digest = hasher.finalize();
    // 16 bytes of the digest are plenty for a local identifier
    hex_lower(&digest[..16])
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
