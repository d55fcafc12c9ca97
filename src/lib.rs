pub mod config;
pub mod fetcher;
pub mod pool_bundle;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod rpc;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use fetcher::BalanceFetcher;
pub use queue::{Admission, TaskQueue};
pub use types::{BalanceRecord, EntityKey, Priority};
