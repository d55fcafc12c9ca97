use super::{AuthorizationCapability, QueryError, TxResult};
use crate::config::ViewingKeysFile;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

/// Wallet stand-in holding viewing keys loaded from disk.
///
/// Without a browser wallet bridge it cannot create or register keys: grant requests
/// are reported as declined and copies fail, which leaves those entities in the
/// "manual intervention" state.
pub struct StaticKeyring {
    account: Option<String>,
    keys: RwLock<HashMap<String, String>>,
}

impl StaticKeyring {
    pub fn new(account: Option<String>, keys: HashMap<String, String>) -> Self {
        Self {
            account,
            keys: RwLock::new(keys),
        }
    }

    pub fn from_file(file: ViewingKeysFile) -> Self {
        Self::new(file.account, file.keys)
    }

    pub async fn insert(&self, contract: &str, key: &str) {
        self.keys.write().await.insert(contract.to_string(), key.to_string());
    }
}

#[async_trait]
impl AuthorizationCapability for StaticKeyring {
    async fn current_account(&self) -> Option<String> {
        self.account.clone()
    }

    async fn grant(&self, contract: &str) -> Result<Option<String>, QueryError> {
        Ok(self.keys.read().await.get(contract).cloned())
    }

    async fn request_grant(&self, contract: &str) -> Result<(), QueryError> {
        warn!(contract, "No wallet bridge attached; add a viewing key to viewing_keys.json");
        Err(QueryError::AuthorizationRejected(format!(
            "no wallet bridge available to create a viewing key for {}",
            contract
        )))
    }

    async fn copy_grant(&self, from_contract: &str, to_contract: &str, _key: &str) -> Result<TxResult, QueryError> {
        Err(QueryError::Other(format!(
            "cannot register the {} viewing key on {} without a wallet bridge",
            from_contract, to_contract
        )))
    }
}
