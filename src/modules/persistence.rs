use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::Account;

const FILE_VERSION: u32 = 1;

/// 账号文件磁盘格式：~/.kiro-proxy/config.json
#[derive(Debug, Serialize, Deserialize)]
struct AccountsFile {
    version: u32,
    accounts: Vec<Account>,
}

/// Snapshot store for the account list. Every pool mutation calls `save`;
/// writes go through a temp file + rename so readers never observe a torn file.
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// 默认路径 ~/.kiro-proxy/config.json
    pub fn default_path() -> Result<PathBuf, String> {
        let home = dirs::home_dir().ok_or_else(|| "cannot determine home directory".to_string())?;
        Ok(home.join(".kiro-proxy").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted account list. A missing file is an empty pool,
    /// not an error (first launch).
    pub fn load(&self) -> Result<Vec<Account>, String> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(format!("failed to read {}: {}", self.path.display(), e)),
        };

        let file: AccountsFile = serde_json::from_slice(&data)
            .map_err(|e| format!("failed to parse {}: {}", self.path.display(), e))?;

        if file.version != FILE_VERSION {
            tracing::warn!(
                "[Persist] account file version {} (expected {}), loading anyway",
                file.version,
                FILE_VERSION
            );
        }

        Ok(file.accounts)
    }

    /// 原子写入：先写临时文件再 rename
    pub fn save(&self, accounts: &[Account]) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }

        let file = AccountsFile {
            version: FILE_VERSION,
            accounts: accounts.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| format!("failed to serialize accounts: {}", e))?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)
                .map_err(|e| format!("failed to create {}: {}", tmp_path.display(), e))?;
            tmp.write_all(&json)
                .map_err(|e| format!("failed to write {}: {}", tmp_path.display(), e))?;
            tmp.sync_all()
                .map_err(|e| format!("failed to sync {}: {}", tmp_path.display(), e))?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| format!("failed to replace {}: {}", self.path.display(), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, AccountStatus, AuthKind, Credential, UsageSnapshot};

    fn account(subject: &str) -> Account {
        Account::new(Credential::new(
            "kiro",
            subject,
            format!("at-{subject}"),
            format!("rt-{subject}"),
            2_000_000_000,
            AuthKind::AwsBuilderId,
            "cid".into(),
        ))
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("config.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("config.json"));

        let mut a = account("alice");
        a.enter_cooldown(300, 1_000);
        a.record_error("quota_exceeded", "MONTHLY_REQUEST_COUNT", 1_000);
        let b = account("bob");

        store.save(&[a.clone(), b.clone()]).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id(), a.id());
        assert_eq!(loaded[0].status, AccountStatus::Cooldown);
        assert_eq!(loaded[0].cooldown_until, Some(1_300));
        assert_eq!(loaded[0].last_error.as_ref().unwrap().kind, "quota_exceeded");
        assert_eq!(loaded[1].credential.refresh_token, "rt-bob");
    }

    #[test]
    fn test_runtime_fields_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("config.json"));

        let mut a = account("carol");
        a.last_used_at = Some(123);
        a.usage = Some(UsageSnapshot {
            used: 10,
            limit: 100,
            refreshed_at: 123,
        });
        a.consecutive_failures = 4;

        store.save(&[a]).unwrap();
        let loaded = store.load().unwrap();
        assert!(loaded[0].last_used_at.is_none());
        assert!(loaded[0].usage.is_none());
        assert_eq!(loaded[0].consecutive_failures, 0);
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("config.json"));

        store.save(&[account("a1")]).unwrap();
        store.save(&[account("a2"), account("a3")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        // 临时文件不应残留
        assert!(!dir.path().join("config.json.tmp").exists());
    }
}
