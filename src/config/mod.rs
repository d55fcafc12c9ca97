use crate::types::{EntityInfo, EntityKey};
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Tuning of the fetch queue and recovery policy. Every field has a default so a
/// partial `fetcher.json` is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetcherConfig {
    pub concurrency: usize,
    pub inter_batch_delay_ms: u64,
    pub staleness_secs: u64,
    pub task_timeout_secs: u64,
    pub retry_delay_ms: u64,
    pub recovery_delay_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_attempts: u32,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            inter_batch_delay_ms: 300,
            staleness_secs: 30,
            task_timeout_secs: 30,
            retry_delay_ms: 2000,
            recovery_delay_ms: 500,
            backoff_base_ms: 1000,
            backoff_max_attempts: 4,
        }
    }
}

impl FetcherConfig {
    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    /// Delays between post-recovery attempts: base, 2*base, 4*base, ...
    /// The first attempt is immediate, so this yields `backoff_max_attempts - 1` delays.
    pub fn backoff_delays(&self) -> Vec<Duration> {
        (0..self.backoff_max_attempts.saturating_sub(1))
            .map(|i| Duration::from_millis(self.backoff_base_ms.saturating_mul(1 << i.min(16))))
            .collect()
    }
}

/// Resolve a config file path from `env_key`, falling back to `default` in the working directory.
pub fn config_path(env_key: &str, default: &str) -> PathBuf {
    std::env::var(env_key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

/// Load `fetcher.json`. A missing file yields the defaults; a malformed one is an error.
pub fn load_fetcher_config(path: &str) -> Result<FetcherConfig> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => {
            tracing::info!(path, "No fetcher config found, using defaults");
            return Ok(FetcherConfig::default());
        }
    };
    let config: FetcherConfig = serde_json::from_str(&content)?;
    Ok(config)
}

/// Format of each token entry in registry.json (camelCase).
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenEntry {
    address: String,
    decimals: u8,
    #[serde(default)]
    staking_contract: Option<String>,
}

/// Format of each pool entry in registry.json (camelCase).
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolEntry {
    address: String,
    lp_token: String,
    lp_decimals: u8,
    #[serde(default)]
    staking_contract: Option<String>,
}

/// Root format of registry.json: { "tokens": { "SYMBOL": {...} }, "pools": { "ID": {...} } }
#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default)]
    tokens: HashMap<String, TokenEntry>,
    #[serde(default)]
    pools: HashMap<String, PoolEntry>,
}

/// Parse registry.json into entity metadata keyed by contract address.
pub fn parse_registry(content: &str) -> Result<HashMap<EntityKey, EntityInfo>> {
    let file: RegistryFile = serde_json::from_str(content)?;

    let mut entities = HashMap::new();
    for (symbol, entry) in file.tokens {
        entities.insert(
            EntityKey::new(entry.address),
            EntityInfo {
                symbol,
                decimals: entry.decimals,
                staking_contract: entry.staking_contract,
                lp_token: None,
            },
        );
    }
    for (id, entry) in file.pools {
        entities.insert(
            EntityKey::new(entry.address),
            EntityInfo {
                symbol: id,
                decimals: entry.lp_decimals,
                staking_contract: entry.staking_contract,
                lp_token: Some(entry.lp_token),
            },
        );
    }
    Ok(entities)
}

pub fn load_registry_file(path: &str) -> Result<HashMap<EntityKey, EntityInfo>> {
    let content = fs::read_to_string(path)?;
    parse_registry(&content)
}

/// Root format of viewing_keys.json: { "account": "secret1...", "keys": { "contract": "key" } }
#[derive(Debug, Default, Deserialize)]
pub struct ViewingKeysFile {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

/// Load viewing keys. Optional: if the file is missing, returns an empty keyring.
pub fn load_viewing_keys_file(path: &str) -> Result<ViewingKeysFile> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Ok(ViewingKeysFile::default()),
    };
    let file: ViewingKeysFile = serde_json::from_str(&content)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: FetcherConfig =
            serde_json::from_str(r#"{ "concurrency": 2, "interBatchDelayMs": 100 }"#).unwrap();
        assert_eq!(config.concurrency(), 2);
        assert_eq!(config.inter_batch_delay(), Duration::from_millis(100));
        assert_eq!(config.staleness_window(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let config = FetcherConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert_eq!(config.concurrency(), 1);
    }

    #[test]
    fn test_backoff_delays_double() {
        let delays = FetcherConfig::default().backoff_delays();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_parse_registry() {
        let registry = parse_registry(
            r#"{
                "tokens": {
                    "sSCRT": { "address": "secret1sscrt", "decimals": 6 }
                },
                "pools": {
                    "sSCRT-SHD": {
                        "address": "secret1pool",
                        "lpToken": "secret1lp",
                        "lpDecimals": 6,
                        "stakingContract": "secret1staking"
                    }
                }
            }"#,
        )
        .unwrap();

        let token = &registry[&EntityKey::from("secret1sscrt")];
        assert_eq!(token.symbol, "sSCRT");
        assert_eq!(token.lp_token, None);

        let pool = &registry[&EntityKey::from("secret1pool")];
        assert_eq!(pool.lp_token.as_deref(), Some("secret1lp"));
        assert_eq!(pool.staking_contract.as_deref(), Some("secret1staking"));
    }

    #[test]
    fn test_missing_viewing_keys_file_is_empty() {
        let keys = load_viewing_keys_file("/nonexistent/viewing_keys.json").unwrap();
        assert!(keys.account.is_none());
        assert!(keys.keys.is_empty());
    }
}
