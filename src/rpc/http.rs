use super::{QueryError, RemoteQueryClient};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Query client talking to a gateway that performs the encrypted contract queries.
///
/// Every query is a `POST {base_url}/query` with `{ "contract_address", "query" }`; the
/// gateway answers with the contract's JSON response or `{ "error": "..." }`.
pub struct HttpQueryClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct AmountBody {
    amount: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    msg: String,
}

#[derive(Deserialize)]
struct PoolInfoBody {
    tvl: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryResponse {
    Balance { balance: AmountBody },
    PoolInfo { pool_info: PoolInfoBody },
    ViewingKeyError { viewing_key_error: ErrorBody },
    Error { error: String },
}

impl HttpQueryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QueryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueryError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn query(&self, contract: &str, query: serde_json::Value) -> Result<QueryResponse, QueryError> {
        debug!(contract, "Querying contract");

        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&json!({
                "contract_address": contract,
                "query": query,
            }))
            .send()
            .await
            .map_err(|e| transport_error(contract, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(QueryError::Network(format!("HTTP {} from query gateway", status)));
        }

        let body = response.text().await.map_err(|e| transport_error(contract, e))?;
        let parsed: QueryResponse = serde_json::from_str(&body).map_err(|_| {
            QueryError::from_remote_message(contract, &format!("HTTP {}: {}", status, body))
        })?;

        match parsed {
            QueryResponse::ViewingKeyError { viewing_key_error } => Err(QueryError::AuthorizationInvalid {
                contract: contract.to_string(),
                message: viewing_key_error.msg,
            }),
            QueryResponse::Error { error } => Err(QueryError::from_remote_message(contract, &error)),
            other => Ok(other),
        }
    }

    async fn query_amount(&self, contract: &str, account: &str, key: &str) -> Result<String, QueryError> {
        let response = self
            .query(contract, json!({ "balance": { "address": account, "key": key } }))
            .await?;
        match response {
            QueryResponse::Balance { balance } => Ok(balance.amount),
            _ => Err(QueryError::Contract(format!("unexpected balance response from {}", contract))),
        }
    }
}

fn transport_error(contract: &str, err: reqwest::Error) -> QueryError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        QueryError::Network(err.to_string())
    } else {
        QueryError::from_remote_message(contract, &err.to_string())
    }
}

#[async_trait]
impl RemoteQueryClient for HttpQueryClient {
    async fn query_balance(&self, contract: &str, account: &str, key: &str) -> Result<String, QueryError> {
        self.query_amount(contract, account, key).await
    }

    async fn query_staked(&self, staking_contract: &str, account: &str, key: &str) -> Result<String, QueryError> {
        self.query_amount(staking_contract, account, key).await
    }

    async fn query_pool_tvl(&self, pool: &str) -> Result<String, QueryError> {
        match self.query(pool, json!({ "pool_info": {} })).await? {
            QueryResponse::PoolInfo { pool_info } => Ok(pool_info.tvl),
            _ => Err(QueryError::Contract(format!("unexpected pool response from {}", pool))),
        }
    }
}
