//! Scripted wallet and query client for fetcher tests.

use crate::config::FetcherConfig;
use crate::fetcher::BalanceFetcher;
use crate::queue::TaskQueue;
use crate::registry::StaticRegistry;
use crate::rpc::{AuthorizationCapability, QueryError, RemoteQueryClient, TxResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const TOKEN_A: &str = "secret1a";
pub const TOKENS: [&str; 5] = ["secret1a", "secret1b", "secret1c", "secret1d", "secret1e"];
pub const POOL: &str = "secret1pool";
pub const POOL_UNSTAKED: &str = "secret1pool2";
pub const LP_TOKEN: &str = "secret1lp";
pub const STAKING: &str = "secret1staking";
pub const ACCOUNT: &str = "secret1me";

type Script = VecDeque<Result<String, QueryError>>;

/// Replays scripted responses per contract. The last response repeats once the
/// script is exhausted. TVL queries are scripted under `tvl:<pool>`.
#[derive(Default)]
pub struct MockClient {
    latency: Duration,
    delays: Mutex<HashMap<String, Duration>>,
    scripts: Mutex<HashMap<String, Script>>,
    log: Mutex<Vec<(String, Instant)>>,
}

impl MockClient {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    pub fn respond(&self, contract: &str, responses: Vec<Result<String, QueryError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(contract.to_string(), responses.into());
    }

    /// Latency for one contract, overriding the client-wide latency.
    pub fn delay(&self, contract: &str, latency: Duration) {
        self.delays.lock().unwrap().insert(contract.to_string(), latency);
    }

    pub fn calls(&self, contract: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|(c, _)| c == contract).count()
    }

    pub fn call_log(&self) -> Vec<(String, Instant)> {
        self.log.lock().unwrap().clone()
    }

    async fn next(&self, contract: &str) -> Result<String, QueryError> {
        self.log.lock().unwrap().push((contract.to_string(), Instant::now()));
        let response = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(contract) {
                Some(script) if script.len() > 1 => script.pop_front().unwrap(),
                Some(script) => script.front().cloned().unwrap(),
                None => Err(QueryError::Contract(format!("no script for {}", contract))),
            }
        };
        let latency = self.delays.lock().unwrap().get(contract).copied().unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        response
    }
}

#[async_trait]
impl RemoteQueryClient for MockClient {
    async fn query_balance(&self, contract: &str, _account: &str, _key: &str) -> Result<String, QueryError> {
        self.next(contract).await
    }

    async fn query_staked(&self, staking_contract: &str, _account: &str, _key: &str) -> Result<String, QueryError> {
        self.next(staking_contract).await
    }

    async fn query_pool_tvl(&self, pool: &str) -> Result<String, QueryError> {
        self.next(&format!("tvl:{}", pool)).await
    }
}

/// Wallet that creates a key on request unless told to reject.
#[derive(Default)]
pub struct MockWallet {
    account: Option<String>,
    prompt_latency: Duration,
    grants: Mutex<HashMap<String, String>>,
    reject: AtomicBool,
    fail_copy: AtomicBool,
    requests: Mutex<Vec<String>>,
    copies: Mutex<Vec<(String, String, String)>>,
}

impl MockWallet {
    pub fn connected() -> Self {
        Self {
            account: Some(ACCOUNT.to_string()),
            ..Default::default()
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Time the user takes to answer a viewing key prompt.
    pub fn with_prompt_latency(mut self, latency: Duration) -> Self {
        self.prompt_latency = latency;
        self
    }

    pub fn insert_grant(&self, contract: &str, key: &str) {
        self.grants.lock().unwrap().insert(contract.to_string(), key.to_string());
    }

    pub fn reject_requests(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn fail_copies(&self) {
        self.fail_copy.store(true, Ordering::SeqCst);
    }

    pub fn grant_requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn copies(&self) -> Vec<(String, String, String)> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthorizationCapability for MockWallet {
    async fn current_account(&self) -> Option<String> {
        self.account.clone()
    }

    async fn grant(&self, contract: &str) -> Result<Option<String>, QueryError> {
        Ok(self.grants.lock().unwrap().get(contract).cloned())
    }

    async fn request_grant(&self, contract: &str) -> Result<(), QueryError> {
        self.requests.lock().unwrap().push(contract.to_string());
        if !self.prompt_latency.is_zero() {
            tokio::time::sleep(self.prompt_latency).await;
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(QueryError::AuthorizationRejected("Request rejected".into()));
        }
        self.insert_grant(contract, &format!("vk-{}", contract));
        Ok(())
    }

    async fn copy_grant(&self, from_contract: &str, to_contract: &str, key: &str) -> Result<TxResult, QueryError> {
        self.copies
            .lock()
            .unwrap()
            .push((from_contract.to_string(), to_contract.to_string(), key.to_string()));
        if self.fail_copy.load(Ordering::SeqCst) {
            return Err(QueryError::Network("broadcast failed".into()));
        }
        self.insert_grant(to_contract, key);
        Ok(TxResult {
            tx_hash: "ABCDEF".to_string(),
        })
    }
}

pub fn registry() -> StaticRegistry {
    let registry = TOKENS
        .iter()
        .fold(StaticRegistry::default(), |registry, token| registry.with_token(token, token, 6));
    registry
        .with_pool(POOL, LP_TOKEN, 6, Some(STAKING))
        .with_pool(POOL_UNSTAKED, LP_TOKEN, 6, None)
}

pub fn harness(config: FetcherConfig) -> (BalanceFetcher, Arc<MockClient>, Arc<MockWallet>) {
    harness_with(config, Arc::new(MockClient::default()), Arc::new(MockWallet::connected()))
}

pub fn harness_with(
    config: FetcherConfig,
    client: Arc<MockClient>,
    wallet: Arc<MockWallet>,
) -> (BalanceFetcher, Arc<MockClient>, Arc<MockWallet>) {
    let fetcher = BalanceFetcher::new(
        &config,
        Arc::new(registry()),
        Arc::clone(&client) as Arc<dyn RemoteQueryClient>,
        Arc::clone(&wallet) as Arc<dyn AuthorizationCapability>,
    );
    (fetcher, client, wallet)
}

/// Poll until nothing is queued, running or scheduled.
pub async fn wait_idle(queue: &TaskQueue) {
    for _ in 0..100_000 {
        if queue.is_idle().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue never became idle");
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}
