use dotenvy::dotenv;
use secret_balance_fetcher::config::{self, config_path};
use secret_balance_fetcher::registry::StaticRegistry;
use secret_balance_fetcher::rpc::{HttpQueryClient, StaticKeyring};
use secret_balance_fetcher::BalanceFetcher;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let query_url = std::env::var("QUERY_URL").map_err(|_| eyre::eyre!("QUERY_URL must be set"))?;
    let fetcher_config = config::load_fetcher_config(&path_string("FETCHER_CONFIG", "fetcher.json"))?;
    let registry = StaticRegistry::from_file(&path_string("REGISTRY_JSON", "registry.json"))?;
    let keys = config::load_viewing_keys_file(&path_string("VIEWING_KEYS_JSON", "viewing_keys.json"))?;
    if keys.account.is_none() {
        warn!("No account in viewing_keys.json; every balance will report a disconnected wallet");
    }

    info!(
        entities = registry.len(),
        concurrency = fetcher_config.concurrency(),
        "Starting balance fetcher"
    );

    let client = HttpQueryClient::new(&query_url, fetcher_config.task_timeout())?;
    let tokens: Vec<_> = registry.tokens().cloned().collect();
    let pools: Vec<_> = registry.pools().cloned().collect();
    let fetcher = BalanceFetcher::new(
        &fetcher_config,
        Arc::new(registry),
        Arc::new(client),
        Arc::new(StaticKeyring::from_file(keys)),
    );

    let mut updates = fetcher.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) if !update.record.loading => match &update.record.error {
                    Some(error) => warn!(entity = %update.entity, %error, "Balance unavailable"),
                    None => info!(entity = %update.entity, value = update.record.display_value(), "Balance"),
                },
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Observer lagged behind updates"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for token in &tokens {
        fetcher.request_fetch(token, "startup").await;
    }
    for pool in &pools {
        fetcher.request_pool_fetch(pool, "startup").await;
    }

    info!("Fetching balances. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    for pool in &pools {
        let bundle = fetcher.pool_bundle(pool);
        info!(
            pool = %pool,
            tvl = bundle.tvl.display_value(),
            lp = bundle.lp_balance.display_value(),
            staked = bundle.staked_balance.display_value(),
            "Pool summary"
        );
    }
    fetcher.shutdown().await;
    info!("Shutting down...");

    Ok(())
}

fn path_string(env_key: &str, default: &str) -> String {
    config_path(env_key, default).to_string_lossy().into_owned()
}
