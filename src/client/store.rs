//! Per-account records kept on this device.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::protocol::worker::EncryptedKeyData;

/// Everything the wallet remembers about one registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub account_id: String,
    pub credential_id: String,
    pub public_key: String,
    pub encrypted: EncryptedKeyData,
    pub rp_id: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoginState {
    pub is_logged_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, account_id: &str) -> Option<AccountRecord>;

    async fn put(&self, record: AccountRecord);

    async fn remove(&self, account_id: &str) -> bool;

    async fn find_by_credential(&self, credential_id: &str) -> Option<AccountRecord>;

    async fn list(&self) -> Vec<AccountRecord>;

    async fn current_user(&self) -> Option<String>;

    async fn set_current_user(&self, account_id: Option<String>);
}

#[derive(Default)]
struct StoreState {
    accounts: HashMap<String, AccountRecord>,
    current_user: Option<String>,
}

/// Volatile store; records are lost with the process.
#[derive(Default)]
pub struct InMemoryAccountStore {
    state: RwLock<StoreState>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, account_id: &str) -> Option<AccountRecord> {
        self.state.read().accounts.get(account_id).cloned()
    }

    async fn put(&self, record: AccountRecord) {
        self.state
            .write()
            .accounts
            .insert(record.account_id.clone(), record);
    }

    async fn remove(&self, account_id: &str) -> bool {
        let mut state = self.state.write();
        if state.current_user.as_deref() == Some(account_id) {
            state.current_user = None;
        }
        state.accounts.remove(account_id).is_some()
    }

    async fn find_by_credential(&self, credential_id: &str) -> Option<AccountRecord> {
        self.state
            .read()
            .accounts
            .values()
            .find(|r| r.credential_id == credential_id)
            .cloned()
    }

    async fn list(&self) -> Vec<AccountRecord> {
        let mut records: Vec<_> = self.state.read().accounts.values().cloned().collect();
        records.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        records
    }

    async fn current_user(&self) -> Option<String> {
        self.state.read().current_user.clone()
    }

    async fn set_current_user(&self, account_id: Option<String>) {
        self.state.write().current_user = account_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(account_id: &str, credential_id: &str) -> AccountRecord {
        AccountRecord {
            account_id: account_id.to_string(),
            credential_id: credential_id.to_string(),
            public_key: "ed25519:pk".to_string(),
            encrypted: EncryptedKeyData {
                encrypted_key: "ct".to_string(),
                iv: "iv".to_string(),
                wrap_key_salt: "salt".to_string(),
            },
            rp_id: "example.com".to_string(),
            registered_at: Utc::now(),
            last_login_at: None,
        }
    }

    #[tokio::test]
    async fn removing_current_user_logs_out() {
        let store = InMemoryAccountStore::new();
        store.put(record("alice.testnet", "c1")).await;
        store.set_current_user(Some("alice.testnet".to_string())).await;

        assert!(store.remove("alice.testnet").await);
        assert_eq!(store.current_user().await, None);
    }

    #[tokio::test]
    async fn finds_by_credential() {
        let store = InMemoryAccountStore::new();
        store.put(record("alice.testnet", "c1")).await;
        store.put(record("bob.testnet", "c2")).await;

        let found = store.find_by_credential("c2").await.unwrap();
        assert_eq!(found.account_id, "bob.testnet");
        assert_eq!(store.list().await.len(), 2);
    }
}
