use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::warn;

use crate::models::{Account, SoraAccountExtension};

// File-backed account repository: one JSON document per account under
// `<data_dir>/accounts/{id}.json`. Credential recovery must round-trip
// through `update`, so the in-memory view and the files never diverge
// for longer than a single write.
pub struct AccountStore {
    accounts_dir: PathBuf,
    cache: DashMap<i64, Account>,
}

impl AccountStore {
    pub fn new(data_dir: &Path) -> Result<Self, String> {
        let accounts_dir = data_dir.join("accounts");
        if !accounts_dir.exists() {
            fs::create_dir_all(&accounts_dir)
                .map_err(|e| format!("failed_to_create_accounts_dir: {}", e))?;
        }
        let store = Self {
            accounts_dir,
            cache: DashMap::new(),
        };
        store.load_all()?;
        Ok(store)
    }

    fn account_path(&self, account_id: i64) -> PathBuf {
        self.accounts_dir.join(format!("{}.json", account_id))
    }

    pub fn load_all(&self) -> Result<usize, String> {
        self.cache.clear();
        let entries = fs::read_dir(&self.accounts_dir)
            .map_err(|e| format!("failed_to_read_accounts_dir: {}", e))?;
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("[W-ACCOUNT-READ] skipping_unreadable_account_file {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_str::<Account>(&content) {
                Ok(account) => {
                    self.cache.insert(account.id, account);
                    loaded += 1;
                }
                Err(e) => {
                    warn!("[W-ACCOUNT-PARSE] skipping_invalid_account_file {:?}: {}", path, e);
                }
            }
        }
        Ok(loaded)
    }

    pub fn get(&self, account_id: i64) -> Option<Account> {
        self.cache.get(&account_id).map(|a| a.clone())
    }

    // Enabled accounts visible to the given group. `None` group sees the
    // ungrouped pool only.
    pub fn accounts_for_group(&self, group_id: Option<i64>) -> Vec<Account> {
        let mut out: Vec<Account> = self
            .cache
            .iter()
            .filter(|a| a.enabled && a.group_id == group_id)
            .map(|a| a.clone())
            .collect();
        out.sort_by_key(|a| a.id);
        out
    }

    pub fn insert(&self, account: Account) -> Result<(), String> {
        self.write_account(&account)?;
        self.cache.insert(account.id, account);
        Ok(())
    }

    // Persist a mutated account (credential recovery path).
    pub fn update(&self, account: &Account) -> Result<(), String> {
        let mut updated = account.clone();
        updated.updated_at = chrono::Utc::now().timestamp();
        self.write_account(&updated)?;
        self.cache.insert(updated.id, updated);
        Ok(())
    }

    // Merge recovered tokens into the Sora platform extension.
    pub fn upsert_sora_extension(
        &self,
        account_id: i64,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        session_token: Option<&str>,
    ) -> Result<(), String> {
        let mut account = self
            .get(account_id)
            .ok_or_else(|| format!("account {} not found", account_id))?;
        let ext = account.sora.get_or_insert_with(SoraAccountExtension::default);
        if let Some(t) = access_token.filter(|t| !t.trim().is_empty()) {
            ext.access_token = Some(t.to_string());
        }
        if let Some(t) = refresh_token.filter(|t| !t.trim().is_empty()) {
            ext.refresh_token = Some(t.to_string());
        }
        if let Some(t) = session_token.filter(|t| !t.trim().is_empty()) {
            ext.session_token = Some(t.to_string());
        }
        self.update(&account)
    }

    fn write_account(&self, account: &Account) -> Result<(), String> {
        let json_str = serde_json::to_string_pretty(account)
            .map_err(|e| format!("failed_to_serialize_account: {}", e))?;
        fs::write(self.account_path(account.id), json_str)
            .map_err(|e| format!("failed_to_write_account_file: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use serde_json::Map;

    fn account(id: i64, group_id: Option<i64>) -> Account {
        Account {
            id,
            uuid: format!("acct-{}", id),
            name: format!("acc{}", id),
            platform: Platform::Openai,
            group_id,
            proxy: None,
            credentials: Map::new(),
            models: Vec::new(),
            rate_multiplier: 1.0,
            concurrency: 2,
            enabled: true,
            sora: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn accounts_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::new(dir.path()).expect("store");
        store.insert(account(1, None)).expect("insert");
        store.insert(account(2, Some(5))).expect("insert");

        let reloaded = AccountStore::new(dir.path()).expect("reload");
        assert_eq!(reloaded.accounts_for_group(None).len(), 1);
        assert_eq!(reloaded.accounts_for_group(Some(5)).len(), 1);
        assert!(reloaded.get(2).is_some());
    }

    #[test]
    fn update_persists_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::new(dir.path()).expect("store");
        let mut acc = account(1, None);
        store.insert(acc.clone()).expect("insert");

        acc.set_credential("access_token", "tok-new");
        store.update(&acc).expect("update");

        let reloaded = AccountStore::new(dir.path()).expect("reload");
        let got = reloaded.get(1).expect("account");
        assert_eq!(got.credential("access_token").as_deref(), Some("tok-new"));
        assert!(got.updated_at > 0);
    }

    #[test]
    fn sora_extension_upsert_merges_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::new(dir.path()).expect("store");
        store.insert(account(1, None)).expect("insert");

        store
            .upsert_sora_extension(1, Some("at"), Some("rt"), None)
            .expect("upsert");
        store
            .upsert_sora_extension(1, None, None, Some("st"))
            .expect("upsert");

        let got = store.get(1).expect("account");
        let ext = got.sora.expect("extension");
        assert_eq!(ext.access_token.as_deref(), Some("at"));
        assert_eq!(ext.refresh_token.as_deref(), Some("rt"));
        assert_eq!(ext.session_token.as_deref(), Some("st"));
    }

    #[test]
    fn disabled_accounts_are_excluded_from_group_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AccountStore::new(dir.path()).expect("store");
        let mut acc = account(1, None);
        acc.enabled = false;
        store.insert(acc).expect("insert");
        assert!(store.accounts_for_group(None).is_empty());
    }
}
