mod http;
mod keyring;

pub use http::HttpQueryClient;
pub use keyring::StaticKeyring;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure of a remote query or wallet call, classified once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// No viewing key exists yet for this contract/account pair.
    #[error("no viewing key for {contract}")]
    AuthorizationRequired { contract: String },

    /// A viewing key exists but the contract refuses it.
    #[error("viewing key rejected by {contract}: {message}")]
    AuthorizationInvalid { contract: String, message: String },

    /// The user declined the wallet prompt.
    #[error("viewing key request declined: {0}")]
    AuthorizationRejected(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// Well-formed application-level error returned by the contract.
    #[error("contract error: {0}")]
    Contract(String),

    #[error("{0}")]
    Other(String),
}

const REQUIRED_PATTERNS: &[&str] = &[
    "there is no matched secret20",
    "no viewing key",
    "viewing key not found",
];
const INVALID_PATTERNS: &[&str] = &[
    "wrong viewing key",
    "invalid viewing key",
    "unauthorized",
];
const REJECTED_PATTERNS: &[&str] = &["request rejected", "user rejected", "user denied"];
const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "failed to fetch",
    "timed out",
    "timeout",
    "connection",
    "econnrefused",
    "econnreset",
    "429",
    "502",
    "503",
    "504",
];
const CONTRACT_PATTERNS: &[&str] = &[
    "generic_err",
    "parse_err",
    "query failed",
    "contract",
    "not_found",
];

impl QueryError {
    /// Classify a raw error message from the query gateway or wallet. Checked in
    /// priority order: required, invalid, rejected, network, contract.
    pub fn from_remote_message(contract: &str, message: &str) -> Self {
        let lower = message.to_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

        if matches(REQUIRED_PATTERNS) {
            QueryError::AuthorizationRequired {
                contract: contract.to_string(),
            }
        } else if matches(INVALID_PATTERNS) {
            QueryError::AuthorizationInvalid {
                contract: contract.to_string(),
                message: message.to_string(),
            }
        } else if matches(REJECTED_PATTERNS) {
            QueryError::AuthorizationRejected(message.to_string())
        } else if matches(NETWORK_PATTERNS) {
            QueryError::Network(message.to_string())
        } else if matches(CONTRACT_PATTERNS) {
            QueryError::Contract(message.to_string())
        } else {
            QueryError::Other(message.to_string())
        }
    }
}

/// Result of a wallet transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub tx_hash: String,
}

/// Executes authenticated read queries against the chain.
#[async_trait]
pub trait RemoteQueryClient: Send + Sync {
    /// Raw base-unit token balance of `account` on `contract`.
    async fn query_balance(&self, contract: &str, account: &str, key: &str) -> Result<String, QueryError>;

    /// Raw base-unit amount `account` has staked in `staking_contract`.
    async fn query_staked(&self, staking_contract: &str, account: &str, key: &str) -> Result<String, QueryError>;

    /// Total value locked of a pool, already formatted for display.
    async fn query_pool_tvl(&self, pool: &str) -> Result<String, QueryError>;
}

/// Wallet capability: account listing and viewing key management.
#[async_trait]
pub trait AuthorizationCapability: Send + Sync {
    async fn current_account(&self) -> Option<String>;

    /// Viewing key the wallet holds for `contract`, if any.
    async fn grant(&self, contract: &str) -> Result<Option<String>, QueryError>;

    /// Ask the user to create a viewing key for `contract`. May never resolve.
    async fn request_grant(&self, contract: &str) -> Result<(), QueryError>;

    /// Register `key` on `to_contract` so it matches the key of `from_contract`.
    async fn copy_grant(&self, from_contract: &str, to_contract: &str, key: &str) -> Result<TxResult, QueryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_priority() {
        assert!(matches!(
            QueryError::from_remote_message("c", "There is no matched secret20 for c"),
            QueryError::AuthorizationRequired { .. }
        ));
        assert!(matches!(
            QueryError::from_remote_message("c", "Wrong viewing key for this address or viewing key not set"),
            QueryError::AuthorizationInvalid { .. }
        ));
        assert!(matches!(
            QueryError::from_remote_message("c", "Request rejected"),
            QueryError::AuthorizationRejected(_)
        ));
        assert!(matches!(
            QueryError::from_remote_message("c", "Failed to fetch"),
            QueryError::Network(_)
        ));
        assert!(matches!(
            QueryError::from_remote_message("c", "Generic error: querier contract error"),
            QueryError::Contract(_)
        ));
        assert!(matches!(
            QueryError::from_remote_message("c", "something odd"),
            QueryError::Other(_)
        ));
    }
}
